//! Server-side core of Statsig: feature gate, dynamic config, experiment and layer evaluation
//! against locally cached specifications.
//!
//! # Overview
//!
//! The SDK revolves around a [`Statsig`] instance. [`Statsig::initialize`] loads specifications
//! from bootstrap values, a [`DataStore`] or the network, then keeps them fresh in the background.
//! Evaluations such as [`Statsig::check_gate`] and [`Statsig::get_experiment`] run locally against
//! the current [`SpecSnapshot`] and never block on the network. Each evaluation queues an
//! exposure event that is delivered in batches to the log event endpoint.
//!
//! Local overrides set with [`Statsig::override_gate`] and friends take precedence over the
//! downloaded definitions. They are useful in tests.
//!
//! Servers that bootstrap client SDKs call [`Statsig::get_client_initialize_response`] to
//! evaluate every definition for a user in one go.
//!
//! Hosts plug in their own I/O through [`NetworkAdapter`], [`DataStore`], [`PersistentStorage`],
//! [`ObservabilityClient`] and [`OutputLoggerProvider`]. Evaluation itself can be replaced with a
//! custom [`RuleEvaluator`].
//!
//! # Error Handling
//!
//! Errors are represented by the [`StatsigError`] enum.
//!
//! Evaluation methods never fail: when anything goes wrong they return the default value and
//! explain why in [`EvaluationDetails::reason`]. Lifecycle methods (`flush`, `shutdown`) return a
//! [`Result`] that is safe to ignore in production but useful when debugging.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages. Messages meant for the host application go through [`OutputLoggerProvider`], which
//! defaults to forwarding to `log` as well.

#![warn(rustdoc::missing_crate_level_docs)]

mod background;
mod client;
mod data_store;
mod error;
mod eval;
mod events;
mod id_lists;
mod metadata;
mod network;
mod observability;
mod options;
mod output_logger;
mod overrides;
mod persistent_storage;
mod registry;
mod spec_store;
mod specs;
mod sync;
mod user;

pub use client::{FailureDetails, InitializeDetails, Statsig, DEFAULT_SHUTDOWN_TIMEOUT};
pub use data_store::{specs_data_store_key, DataStore, DataStoreResponse, NoopDataStore};
pub use error::{Result, StatsigError};
pub use eval::{
    hashing, ClientInitResponseOptions, ClientInitializeResponse, ConfigInitEvaluation,
    DefaultRuleEvaluator, DynamicConfig, EvaluationContext, EvaluationDetails, EvaluationOptions,
    EvaluationReason, Experiment, FeatureGate, GateInitEvaluation, Layer, LayerInitEvaluation,
    LayerParameterOwner, RuleEvaluator, SecondaryExposure, SpecEvaluation,
};
pub use events::{
    EventLogger, EventLoggerConfig, StatsigEvent, CONFIG_EXPOSURE_EVENT, DIAGNOSTICS_EVENT,
    GATE_EXPOSURE_EVENT, LAYER_EXPOSURE_EVENT,
};
pub use id_lists::{IdListMetadata, IdListStore};
pub use metadata::{StatsigMetadata, SDK_TYPE, SDK_VERSION};
pub use network::{
    HttpMethod, NetworkAdapter, NetworkRequest, NetworkResponse, ReqwestNetworkAdapter,
};
pub use observability::{NoopObservabilityClient, ObservabilityClient};
pub use options::StatsigOptions;
pub use output_logger::{LogCrateOutputLogger, OutputLogLevel, OutputLogger, OutputLoggerProvider};
pub use overrides::{ExperimentOverride, OverrideRegistry};
pub use persistent_storage::{
    storage_key, NoopPersistentStorage, PersistentStorage, StickyValues, UserPersistedValues,
};
pub use registry::InstanceRegistry;
pub use spec_store::{ApplyOutcome, SpecSnapshot, SpecStore, SpecsSource};
pub use specs::{Condition, ConditionRef, Rule, Spec, SpecKind, SpecsResponse, TryParse};
pub use sync::{SyncOutcome, MIN_SYNC_INTERVAL};
pub use user::{LoggableUser, NestedAttributePolicy, User};
