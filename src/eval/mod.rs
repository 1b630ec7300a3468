//! Flag evaluation.
//!
//! A [`RuleEvaluator`] turns a definition into a value. Local overrides and sticky values are
//! applied on top of it before results are shaped into [`FeatureGate`], [`DynamicConfig`],
//! [`Experiment`] and [`Layer`]. [`ClientInitializeResponse`] bundles every evaluation for one
//! user.
mod client_init;
mod evaluator;
pub mod hashing;
mod rules;
mod types;

pub(crate) use client_init::ClientInitResponseBuilder;
pub use client_init::{
    ClientInitResponseOptions, ClientInitializeResponse, ConfigInitEvaluation, GateInitEvaluation,
    LayerInitEvaluation,
};
pub(crate) use evaluator::{Evaluated, Evaluator};
pub use rules::{DefaultRuleEvaluator, EvaluationContext, RuleEvaluator, SpecEvaluation};
pub(crate) use types::exposure_metadata;
pub use types::{
    DynamicConfig, EvaluationDetails, EvaluationOptions, EvaluationReason, Experiment,
    FeatureGate, Layer, LayerParameterOwner, SecondaryExposure,
};
