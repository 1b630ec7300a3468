use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use serde_json::Value;
use tokio::runtime::Handle;

use crate::{
    background::{jitter, BackgroundTask, TaskSlot},
    eval::{
        exposure_metadata, ClientInitResponseBuilder, ClientInitResponseOptions,
        ClientInitializeResponse, DefaultRuleEvaluator, DynamicConfig, Evaluated,
        EvaluationOptions, Evaluator, Experiment, FeatureGate, Layer,
    },
    events::{
        EventLogger, StatsigEvent, CONFIG_EXPOSURE_EVENT, GATE_EXPOSURE_EVENT,
    },
    id_lists::{IdListStore, IdListSyncer},
    metadata::StatsigMetadata,
    network::{NetworkClient, ReqwestNetworkAdapter},
    observability::{metrics, OpsStats},
    output_logger::{LogCrateOutputLogger, OutputLogger},
    overrides::{ExperimentOverride, OverrideRegistry},
    persistent_storage::{storage_key, UserPersistedValues},
    spec_store::{SpecStore, SpecsSource},
    specs::SpecKind,
    sync::{SpecsSyncer, SyncOutcome},
    user::User,
    Result, StatsigError, StatsigOptions,
};

const TAG: &str = "Statsig";
const ID_LIST_SYNC_JITTER: Duration = Duration::from_secs(1);

/// Default time [`Statsig::shutdown_with_timeout`] callers are expected to use.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Outcome of [`Statsig::initialize`].
///
/// Initialization never fails outright: without values every evaluation returns its default.
#[derive(Debug, Clone)]
pub struct InitializeDetails {
    pub duration: Duration,
    /// Initialization completed without errors.
    pub init_success: bool,
    /// Some specs are available, from any source.
    pub is_config_spec_ready: bool,
    pub source: SpecsSource,
    pub failure_details: Option<FailureDetails>,
}

#[derive(Debug, Clone)]
pub struct FailureDetails {
    pub reason: String,
    pub error: Option<StatsigError>,
}

/// Feature gate, dynamic config, experiment and layer evaluation, plus event logging.
///
/// # Examples
/// ```no_run
/// # use statsig_core::{Statsig, StatsigOptions, User};
/// # async fn run() {
/// let statsig = Statsig::new("secret-key", StatsigOptions::new());
/// statsig.initialize().await;
///
/// let user = User::with_user_id("a-user");
/// if statsig.check_gate(&user, "new_checkout") {
///     // ...
/// }
///
/// statsig.shutdown().await.ok();
/// # }
/// ```
pub struct Statsig {
    options: StatsigOptions,
    store: Arc<SpecStore>,
    overrides: Arc<OverrideRegistry>,
    evaluator: Evaluator,
    syncer: SpecsSyncer,
    id_list_syncer: Option<Arc<IdListSyncer>>,
    id_list_task: TaskSlot,
    event_logger: Arc<EventLogger>,
    ops: OpsStats,
    logger: OutputLogger,
    runtime: Mutex<Option<Handle>>,
    shutdown_started: AtomicBool,
}

impl Statsig {
    /// Create an instance. Nothing happens on the network until [`Statsig::initialize`].
    pub fn new(sdk_key: &str, options: StatsigOptions) -> Statsig {
        let logger = OutputLogger::new(
            options.output_log_level,
            options
                .output_logger_provider
                .clone()
                .unwrap_or_else(|| Arc::new(LogCrateOutputLogger)),
        );
        let ops = OpsStats::new(options.observability_client.clone());
        let adapter = options
            .network_adapter
            .clone()
            .unwrap_or_else(|| Arc::new(ReqwestNetworkAdapter::new()));
        let network = NetworkClient::new(sdk_key, adapter, options.disable_network, ops.clone());

        let store = Arc::new(SpecStore::with_components(
            sdk_key,
            options.data_store.clone(),
            ops.clone(),
            logger.clone(),
        ));
        let overrides = Arc::new(OverrideRegistry::default());
        let id_lists = Arc::new(IdListStore::default());
        let evaluator = Evaluator::new(
            store.clone(),
            overrides.clone(),
            options
                .rule_evaluator
                .clone()
                .unwrap_or_else(|| Arc::new(DefaultRuleEvaluator)),
            id_lists.clone(),
            options.persistent_storage.clone(),
            options.environment.clone(),
            options.global_custom_fields.clone(),
        );
        let syncer = SpecsSyncer::new(
            store.clone(),
            network.clone(),
            options.specs_url.clone(),
            sdk_key.to_owned(),
            ops.clone(),
            logger.clone(),
        );
        let id_list_syncer = options.enable_id_lists.then(|| {
            Arc::new(IdListSyncer::new(
                id_lists,
                network.clone(),
                options.id_lists_url.clone(),
                ops.clone(),
                logger.clone(),
            ))
        });
        let event_logger = Arc::new(EventLogger::new(
            options.event_logger_config(),
            network,
            StatsigMetadata::new(),
            ops.clone(),
            logger.clone(),
        ));

        Statsig {
            options,
            store,
            overrides,
            evaluator,
            syncer,
            id_list_syncer,
            id_list_task: TaskSlot::default(),
            event_logger,
            ops,
            logger,
            runtime: Mutex::new(None),
            shutdown_started: AtomicBool::new(false),
        }
    }

    /// Load specs and start background work.
    ///
    /// Sources are tried in order: bootstrap values, the data store, then the network (bounded by
    /// `init_timeout_ms`). The network is only awaited when neither of the first two produced
    /// values; otherwise the background syncer fetches from it right away. Whatever the outcome,
    /// the instance is usable afterwards.
    pub async fn initialize(&self) -> InitializeDetails {
        let started = Instant::now();
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                return self.initialize_details(
                    started,
                    Some(FailureDetails {
                        reason: "no tokio runtime".to_owned(),
                        error: Some(StatsigError::RuntimeUnavailable),
                    }),
                );
            }
        };
        *self.lock_runtime() = Some(runtime.clone());

        self.logger.init();
        self.ops.init();

        if let Some(bootstrap) = &self.options.bootstrap_values {
            if let Err(err) = self.store.bootstrap(bootstrap) {
                self.logger
                    .warn(TAG, format_args!("ignoring bootstrap values: {err}"));
            }
        }

        if let Some(data_store) = self.store.data_store() {
            if let Err(err) = data_store.initialize().await {
                self.logger
                    .warn(TAG, format_args!("failed to initialize data store: {err}"));
                self.ops.error(TAG, &err);
            }
            if let Err(err) = self.store.load_from_data_store().await {
                self.logger
                    .warn(TAG, format_args!("failed to read data store: {err}"));
            }
        }

        // Once local values are in place the network catches up in the background.
        let has_local_values = self.store.has_values();
        let failure = if has_local_values {
            log::debug!(target: "statsig", "serving {} values", self.store.source());
            None
        } else if self.options.disable_network {
            Some(FailureDetails {
                reason: "network is disabled and no local values are available".to_owned(),
                error: Some(StatsigError::NetworkDisabled),
            })
        } else {
            self.initialize_from_network(started).await
        };

        if let Some(failure) = &failure {
            let error = failure
                .error
                .as_ref()
                .map(|err| format!(": {err}"))
                .unwrap_or_default();
            self.logger.error(
                TAG,
                format_args!("initialization incomplete: {}{error}", failure.reason),
            );
        }

        let refresh_now = has_local_values && !self.options.disable_network;
        self.start_background_tasks(&runtime, refresh_now);

        let details = self.initialize_details(started, failure);
        self.ops.dist(
            metrics::INITIALIZATION,
            details.duration.as_millis() as f64,
            &[
                ("success", details.init_success.to_string()),
                ("source", details.source.to_string()),
            ],
        );
        self.log(StatsigEvent::diagnostics(
            Default::default(),
            HashMap::from([
                ("context".to_owned(), "initialize".to_owned()),
                ("success".to_owned(), details.init_success.to_string()),
                ("source".to_owned(), details.source.to_string()),
                ("durationMs".to_owned(), details.duration.as_millis().to_string()),
            ]),
        ));
        log::debug!(
            target: "statsig",
            success = details.init_success;
            "initialized from {}", details.source
        );
        details
    }

    /// Fetch specs, then id lists, within `init_timeout` of `started`.
    async fn initialize_from_network(&self, started: Instant) -> Option<FailureDetails> {
        let timeout = self.options.init_timeout;
        let failure = match tokio::time::timeout(timeout, self.syncer.refresh_once()).await {
            Ok(Ok(_)) => None,
            Ok(Err(err)) => Some(FailureDetails {
                reason: "failed to fetch specs from network".to_owned(),
                error: Some(err),
            }),
            Err(_elapsed) => Some(FailureDetails {
                reason: "timed out waiting for specs".to_owned(),
                error: Some(StatsigError::InitTimeout(timeout)),
            }),
        };

        if let Some(id_list_syncer) = &self.id_list_syncer {
            let remaining = timeout.saturating_sub(started.elapsed());
            match tokio::time::timeout(remaining, id_list_syncer.sync()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => self
                    .logger
                    .warn(TAG, format_args!("failed to sync id lists: {err}")),
                Err(_elapsed) => self.logger.warn(TAG, "timed out waiting for id lists"),
            }
        }
        failure
    }

    fn initialize_details(
        &self,
        started: Instant,
        failure_details: Option<FailureDetails>,
    ) -> InitializeDetails {
        InitializeDetails {
            duration: started.elapsed(),
            init_success: failure_details.is_none(),
            is_config_spec_ready: self.store.has_values(),
            source: self.store.source(),
            failure_details,
        }
    }

    /// Start the sync and flush tasks. With `refresh_now` specs and id lists are fetched right
    /// away instead of after the first interval.
    fn start_background_tasks(&self, runtime: &Handle, refresh_now: bool) {
        if self.shutdown_started.load(Ordering::Acquire) {
            return;
        }
        if !self.options.disable_network || self.store.data_store().is_some() {
            self.syncer
                .start(runtime, self.options.specs_sync_interval, refresh_now);
        }
        if !self.options.disable_all_logging {
            self.event_logger.start_background_flush(runtime);
        }
        if let (Some(id_list_syncer), false) =
            (&self.id_list_syncer, self.options.disable_network)
        {
            let id_list_syncer = Arc::clone(id_list_syncer);
            let logger = self.logger.clone();
            let interval = self.options.id_lists_sync_interval;
            self.id_list_task.set(BackgroundTask::spawn(
                runtime,
                "statsig-id-lists-sync",
                move |mut stop| async move {
                    let mut sync_now = refresh_now;
                    loop {
                        if !std::mem::take(&mut sync_now)
                            && stop.sleep(jitter(interval, ID_LIST_SYNC_JITTER)).await
                        {
                            return;
                        }
                        match stop.run(id_list_syncer.sync()).await {
                            Some(Ok(())) => {}
                            Some(Err(err)) => logger.warn(
                                "IdListSyncer",
                                format_args!("failed to sync id lists: {err}"),
                            ),
                            None => return,
                        }
                    }
                },
            ));
        }
    }

    /// Fetch specs now, joining a fetch already in flight.
    pub async fn refresh_specs(&self) -> Result<SyncOutcome> {
        self.syncer.refresh_once().await
    }

    /// The active specs.
    pub fn spec_store(&self) -> &SpecStore {
        &self.store
    }

    // --- Feature gates ---

    pub fn check_gate(&self, user: &User, gate_name: &str) -> bool {
        self.get_feature_gate(user, gate_name).value
    }

    pub fn check_gate_with_options(
        &self,
        user: &User,
        gate_name: &str,
        options: &EvaluationOptions,
    ) -> bool {
        self.get_feature_gate_with_options(user, gate_name, options)
            .value
    }

    pub fn get_feature_gate(&self, user: &User, gate_name: &str) -> FeatureGate {
        self.get_feature_gate_with_options(user, gate_name, &EvaluationOptions::default())
    }

    pub fn get_feature_gate_with_options(
        &self,
        user: &User,
        gate_name: &str,
        options: &EvaluationOptions,
    ) -> FeatureGate {
        let user = self.prepare_user(user, gate_name);
        let evaluated = self.evaluator.evaluate(&user, SpecKind::Gate, gate_name);
        if !options.disable_exposure_logging {
            self.log(self.gate_exposure(&user, gate_name, &evaluated, false));
        }
        log::trace!(
            target: "statsig",
            gate_name,
            value = evaluated.evaluation.value;
            "evaluated gate"
        );

        FeatureGate {
            name: gate_name.to_owned(),
            value: evaluated.evaluation.value,
            rule_id: evaluated.evaluation.rule_id,
            id_type: evaluated.id_type,
            details: evaluated.details,
        }
    }

    pub fn manually_log_gate_exposure(&self, user: &User, gate_name: &str) {
        let user = self.prepare_user(user, gate_name);
        let evaluated = self.evaluator.evaluate(&user, SpecKind::Gate, gate_name);
        self.log(self.gate_exposure(&user, gate_name, &evaluated, true));
    }

    // --- Dynamic configs ---

    pub fn get_dynamic_config(&self, user: &User, config_name: &str) -> DynamicConfig {
        self.get_dynamic_config_with_options(user, config_name, &EvaluationOptions::default())
    }

    pub fn get_dynamic_config_with_options(
        &self,
        user: &User,
        config_name: &str,
        options: &EvaluationOptions,
    ) -> DynamicConfig {
        let user = self.prepare_user(user, config_name);
        let evaluated = self
            .evaluator
            .evaluate(&user, SpecKind::DynamicConfig, config_name);
        if !options.disable_exposure_logging {
            self.log(self.config_exposure(&user, config_name, &evaluated, false));
        }

        DynamicConfig {
            name: config_name.to_owned(),
            value: evaluated.json_object(),
            rule_id: evaluated.evaluation.rule_id,
            id_type: evaluated.id_type,
            details: evaluated.details,
        }
    }

    pub fn manually_log_dynamic_config_exposure(&self, user: &User, config_name: &str) {
        let user = self.prepare_user(user, config_name);
        let evaluated = self
            .evaluator
            .evaluate(&user, SpecKind::DynamicConfig, config_name);
        self.log(self.config_exposure(&user, config_name, &evaluated, true));
    }

    // --- Experiments ---

    pub fn get_experiment(&self, user: &User, experiment_name: &str) -> Experiment {
        self.get_experiment_with_options(user, experiment_name, &EvaluationOptions::default())
    }

    /// Evaluate an experiment. With `options.user_persisted_values` set (see
    /// [`Statsig::load_user_persisted_values`]), a user keeps their stored group while the
    /// experiment is active.
    pub fn get_experiment_with_options(
        &self,
        user: &User,
        experiment_name: &str,
        options: &EvaluationOptions,
    ) -> Experiment {
        let user = self.prepare_user(user, experiment_name);
        let evaluated = self.evaluator.evaluate_experiment(
            &user,
            experiment_name,
            options.user_persisted_values.as_ref(),
        );
        if !options.disable_exposure_logging {
            self.log(self.config_exposure(&user, experiment_name, &evaluated, false));
        }

        Experiment {
            name: experiment_name.to_owned(),
            value: evaluated.json_object(),
            rule_id: evaluated.evaluation.rule_id.clone(),
            id_type: evaluated.id_type,
            group_name: evaluated.evaluation.group_name,
            details: evaluated.details,
        }
    }

    pub fn manually_log_experiment_exposure(&self, user: &User, experiment_name: &str) {
        let user = self.prepare_user(user, experiment_name);
        let evaluated = self
            .evaluator
            .evaluate(&user, SpecKind::Experiment, experiment_name);
        self.log(self.config_exposure(&user, experiment_name, &evaluated, true));
    }

    /// Sticky values stored for `user` under `id_type`, for use in [`EvaluationOptions`].
    pub fn load_user_persisted_values(
        &self,
        user: &User,
        id_type: &str,
    ) -> Option<UserPersistedValues> {
        let storage = self.options.persistent_storage.as_ref()?;
        storage.load(&storage_key(user, id_type)?)
    }

    // --- Layers ---

    pub fn get_layer(&self, user: &User, layer_name: &str) -> Layer {
        self.get_layer_with_options(user, layer_name, &EvaluationOptions::default())
    }

    /// Evaluate a layer. Exposures are logged lazily, when parameters are read from the result.
    pub fn get_layer_with_options(
        &self,
        user: &User,
        layer_name: &str,
        options: &EvaluationOptions,
    ) -> Layer {
        let user = self.prepare_user(user, layer_name);
        let evaluated = self.evaluator.evaluate(&user, SpecKind::Layer, layer_name);
        let exposure_logging_disabled =
            options.disable_exposure_logging || self.options.disable_all_logging;
        self.build_layer(&user, layer_name, evaluated, exposure_logging_disabled)
    }

    pub fn manually_log_layer_parameter_exposure(
        &self,
        user: &User,
        layer_name: &str,
        parameter_name: &str,
    ) {
        let user = self.prepare_user(user, layer_name);
        let evaluated = self.evaluator.evaluate(&user, SpecKind::Layer, layer_name);
        let layer = self.build_layer(&user, layer_name, evaluated, true);
        self.log(layer.parameter_exposure(parameter_name, true));
    }

    fn build_layer(
        &self,
        user: &User,
        layer_name: &str,
        evaluated: Evaluated,
        exposure_logging_disabled: bool,
    ) -> Layer {
        let value = evaluated.json_object();
        let evaluation = evaluated.evaluation;
        let undelegated_secondary_exposures = evaluation
            .undelegated_secondary_exposures
            .unwrap_or_else(|| evaluation.secondary_exposures.clone());

        Layer {
            name: layer_name.to_owned(),
            rule_id: evaluation.rule_id,
            id_type: evaluated.id_type,
            group_name: evaluation.group_name,
            allocated_experiment_name: evaluation.config_delegate,
            details: evaluated.details,
            value,
            explicit_parameters: evaluation.explicit_parameters.unwrap_or_default(),
            secondary_exposures: evaluation.secondary_exposures,
            undelegated_secondary_exposures,
            user: self.loggable_user(user),
            exposure_logging_disabled,
            logged_parameters: Mutex::new(HashSet::new()),
            event_logger: Some(Arc::downgrade(&self.event_logger)),
        }
    }

    // --- Client initialize response ---

    /// Evaluate every gate, dynamic config, experiment and layer for `user`, shaped as the
    /// initialize payload of client SDKs. Names are hashed with djb2 and no exposures are logged.
    pub fn get_client_initialize_response(&self, user: &User) -> ClientInitializeResponse {
        self.get_client_initialize_response_with_options(
            user,
            &ClientInitResponseOptions::default(),
        )
    }

    pub fn get_client_initialize_response_with_options(
        &self,
        user: &User,
        options: &ClientInitResponseOptions,
    ) -> ClientInitializeResponse {
        let user = user.normalized(self.options.nested_attribute_policy);
        let snapshot = self.store.get_snapshot();
        let response = ClientInitResponseBuilder {
            evaluator: &self.evaluator,
            snapshot: &snapshot,
            user: &user,
            options,
        }
        .build(self.loggable_user(&user), self.event_logger.metadata());
        log::debug!(
            target: "statsig",
            gates = response.feature_gates.len(),
            configs = response.dynamic_configs.len(),
            layers = response.layer_configs.len();
            "built client initialize response"
        );
        response
    }

    // --- Overrides ---

    /// Force gate `gate_name` to `value`, for everyone or only for the unit with ID `id` (a user ID
    /// or a custom ID).
    pub fn override_gate(&self, gate_name: &str, value: bool, id: Option<&str>) {
        self.overrides.override_gate(gate_name, value, id);
    }

    pub fn override_dynamic_config(
        &self,
        config_name: &str,
        value: HashMap<String, Value>,
        id: Option<&str>,
    ) {
        self.overrides.override_dynamic_config(config_name, value, id);
    }

    pub fn override_experiment(
        &self,
        experiment_name: &str,
        value: HashMap<String, Value>,
        id: Option<&str>,
    ) {
        self.overrides
            .override_experiment(experiment_name, ExperimentOverride::Value(value), id);
    }

    /// Put matching users into `group_name`, taking the values of that group from the experiment
    /// definition.
    pub fn override_experiment_by_group_name(
        &self,
        experiment_name: &str,
        group_name: &str,
        id: Option<&str>,
    ) {
        self.overrides.override_experiment(
            experiment_name,
            ExperimentOverride::GroupName(group_name.to_owned()),
            id,
        );
    }

    pub fn override_layer(
        &self,
        layer_name: &str,
        value: HashMap<String, Value>,
        id: Option<&str>,
    ) {
        self.overrides.override_layer(layer_name, value, id);
    }

    pub fn remove_gate_override(&self, gate_name: &str, id: Option<&str>) {
        self.overrides.remove_gate_override(gate_name, id);
    }

    pub fn remove_dynamic_config_override(&self, config_name: &str, id: Option<&str>) {
        self.overrides.remove_dynamic_config_override(config_name, id);
    }

    pub fn remove_experiment_override(&self, experiment_name: &str, id: Option<&str>) {
        self.overrides.remove_experiment_override(experiment_name, id);
    }

    pub fn remove_layer_override(&self, layer_name: &str, id: Option<&str>) {
        self.overrides.remove_layer_override(layer_name, id);
    }

    pub fn remove_all_overrides(&self) {
        self.overrides.remove_all_overrides();
    }

    // --- Events ---

    /// Log a custom event. `null` metadata values are dropped and other non-string values are
    /// sent as their JSON text.
    pub fn log_event(
        &self,
        user: &User,
        event_name: &str,
        value: Option<Value>,
        metadata: Option<HashMap<String, Value>>,
    ) {
        if event_name.is_empty() {
            self.logger.warn(TAG, "log_event called with an empty event name");
            return;
        }
        self.log(StatsigEvent::custom(
            self.loggable_user(user),
            event_name,
            value,
            metadata,
        ));
    }

    pub fn log_event_with_number(
        &self,
        user: &User,
        event_name: &str,
        value: f64,
        metadata: Option<HashMap<String, Value>>,
    ) {
        self.log_event(user, event_name, Some(Value::from(value)), metadata);
    }

    pub fn log_event_with_string(
        &self,
        user: &User,
        event_name: &str,
        value: &str,
        metadata: Option<HashMap<String, Value>>,
    ) {
        self.log_event(user, event_name, Some(Value::from(value)), metadata);
    }

    /// Send every queued event now.
    pub async fn flush(&self) -> Result<()> {
        self.event_logger.flush().await
    }

    // --- Lifecycle ---

    /// Stop background tasks and deliver queued events.
    ///
    /// Only the first call does anything. Once it resolves the sync and flush tasks have exited.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::debug!(target: "statsig", "shutting down");

        let synced = self.syncer.stop().await;
        let id_lists = self.id_list_task.stop().await;
        let flushed = self.event_logger.shutdown().await;
        let data_store = match self.store.data_store() {
            Some(data_store) => data_store.shutdown().await,
            None => Ok(()),
        };
        self.logger.shutdown();

        let result = synced.and(id_lists).and(flushed).and(data_store);
        if let Err(err) = &result {
            self.logger
                .warn(TAG, format_args!("shutdown completed with errors: {err}"));
        }
        result
    }

    /// [`Statsig::shutdown`], giving up after `timeout`.
    ///
    /// Events that were not delivered in time stay queued, and a later call to
    /// [`Statsig::shutdown`] picks up where this one stopped.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.shutdown()).await {
            Ok(result) => result,
            Err(_elapsed) => {
                self.shutdown_started.store(false, Ordering::Release);
                let pending = self.event_logger.pending_events();
                self.logger.warn(
                    TAG,
                    format_args!(
                        "shutdown did not finish within {timeout:?}, {pending} event(s) undelivered"
                    ),
                );
                self.ops.increment(
                    metrics::SHUTDOWN_TIMEOUTS,
                    1.0,
                    &[("pending_events", pending.to_string())],
                );
                Err(StatsigError::ShutdownTimeout(timeout))
            }
        }
    }

    /// Cancel background tasks before the process forks. Pair with
    /// [`Statsig::resume_after_fork`].
    pub fn prepare_for_fork(&self) {
        self.syncer.abort();
        self.id_list_task.abort();
        self.event_logger.abort_background_flush();
    }

    /// Restart background tasks stopped by [`Statsig::prepare_for_fork`].
    pub fn resume_after_fork(&self) {
        let runtime = self.lock_runtime().clone();
        match runtime {
            Some(runtime) => self.start_background_tasks(&runtime, false),
            None => self
                .logger
                .debug(TAG, "resume_after_fork called before initialize"),
        }
    }

    // --- Internals ---

    fn prepare_user<'a>(&self, user: &'a User, name: &str) -> std::borrow::Cow<'a, User> {
        if name.is_empty() {
            self.logger.warn(TAG, "evaluating an empty name, returning default value");
        }
        if !user.has_any_id() {
            self.logger.warn(
                TAG,
                "user has neither a userID nor customIDs, evaluations bucket on an empty ID",
            );
        }
        user.normalized(self.options.nested_attribute_policy)
    }

    fn loggable_user(&self, user: &User) -> crate::user::LoggableUser {
        user.to_loggable(self.evaluator.environment(), self.evaluator.global_custom())
    }

    fn gate_exposure(
        &self,
        user: &User,
        gate_name: &str,
        evaluated: &Evaluated,
        is_manual: bool,
    ) -> StatsigEvent {
        let mut metadata = exposure_metadata(&evaluated.details, is_manual);
        metadata.extend([
            ("gate".to_owned(), gate_name.to_owned()),
            ("gateValue".to_owned(), evaluated.evaluation.value.to_string()),
            ("ruleID".to_owned(), evaluated.evaluation.rule_id.clone()),
        ]);
        StatsigEvent::exposure(
            GATE_EXPOSURE_EVENT,
            self.loggable_user(user),
            metadata,
            evaluated.evaluation.secondary_exposures.clone(),
        )
    }

    fn config_exposure(
        &self,
        user: &User,
        config_name: &str,
        evaluated: &Evaluated,
        is_manual: bool,
    ) -> StatsigEvent {
        let mut metadata = exposure_metadata(&evaluated.details, is_manual);
        metadata.extend([
            ("config".to_owned(), config_name.to_owned()),
            ("ruleID".to_owned(), evaluated.evaluation.rule_id.clone()),
            ("rulePassed".to_owned(), evaluated.evaluation.value.to_string()),
        ]);
        StatsigEvent::exposure(
            CONFIG_EXPOSURE_EVENT,
            self.loggable_user(user),
            metadata,
            evaluated.evaluation.secondary_exposures.clone(),
        )
    }

    fn log(&self, event: StatsigEvent) {
        if !self.options.disable_all_logging {
            self.event_logger.enqueue(event);
        }
    }

    fn lock_runtime(&self) -> std::sync::MutexGuard<'_, Option<Handle>> {
        self.runtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
