use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use serde_json::Value;

use crate::{
    data_store::DataStore,
    eval::RuleEvaluator,
    events::EventLoggerConfig,
    id_lists::DEFAULT_ID_LISTS_URL,
    network::NetworkAdapter,
    observability::ObservabilityClient,
    output_logger::{OutputLogLevel, OutputLoggerProvider},
    persistent_storage::PersistentStorage,
    user::NestedAttributePolicy,
};

/// Configuration for [`Statsig`](crate::Statsig).
///
/// Every option has a default; hosts only set what they need.
///
/// ```
/// # use statsig_core::StatsigOptions;
/// let mut options = StatsigOptions::new();
/// options
///     .environment("staging")
///     .specs_sync_interval_ms(30_000)
///     .disable_network(true);
/// ```
#[derive(Clone)]
pub struct StatsigOptions {
    pub(crate) specs_url: String,
    pub(crate) specs_sync_interval: Duration,
    pub(crate) log_event_url: String,
    pub(crate) event_logging_flush_interval: Duration,
    pub(crate) event_logging_max_queue_size: usize,
    pub(crate) enable_id_lists: bool,
    pub(crate) id_lists_url: String,
    pub(crate) id_lists_sync_interval: Duration,
    pub(crate) init_timeout: Duration,
    pub(crate) environment: Option<String>,
    pub(crate) output_log_level: OutputLogLevel,
    pub(crate) disable_all_logging: bool,
    pub(crate) disable_network: bool,
    pub(crate) global_custom_fields: HashMap<String, Value>,
    pub(crate) nested_attribute_policy: NestedAttributePolicy,
    pub(crate) bootstrap_values: Option<String>,
    pub(crate) network_adapter: Option<Arc<dyn NetworkAdapter>>,
    pub(crate) rule_evaluator: Option<Arc<dyn RuleEvaluator>>,
    pub(crate) data_store: Option<Arc<dyn DataStore>>,
    pub(crate) persistent_storage: Option<Arc<dyn PersistentStorage>>,
    pub(crate) observability_client: Option<Arc<dyn ObservabilityClient>>,
    pub(crate) output_logger_provider: Option<Arc<dyn OutputLoggerProvider>>,
}

impl StatsigOptions {
    /// Default base URL of the specs endpoint. The SDK key and `.json` are appended.
    pub const DEFAULT_SPECS_URL: &'static str = "https://api.statsigcdn.com/v2/download_config_specs";
    pub const DEFAULT_SPECS_SYNC_INTERVAL: Duration = Duration::from_millis(10_000);
    pub const DEFAULT_LOG_EVENT_URL: &'static str = EventLoggerConfig::DEFAULT_LOG_EVENT_URL;
    pub const DEFAULT_FLUSH_INTERVAL: Duration = EventLoggerConfig::DEFAULT_FLUSH_INTERVAL;
    pub const DEFAULT_MAX_QUEUE_SIZE: usize = EventLoggerConfig::DEFAULT_MAX_QUEUE_SIZE;
    pub const DEFAULT_ID_LISTS_URL: &'static str = DEFAULT_ID_LISTS_URL;
    pub const DEFAULT_ID_LISTS_SYNC_INTERVAL: Duration = Duration::from_millis(60_000);
    pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_millis(3_000);

    pub fn new() -> StatsigOptions {
        StatsigOptions {
            specs_url: StatsigOptions::DEFAULT_SPECS_URL.to_owned(),
            specs_sync_interval: StatsigOptions::DEFAULT_SPECS_SYNC_INTERVAL,
            log_event_url: StatsigOptions::DEFAULT_LOG_EVENT_URL.to_owned(),
            event_logging_flush_interval: StatsigOptions::DEFAULT_FLUSH_INTERVAL,
            event_logging_max_queue_size: StatsigOptions::DEFAULT_MAX_QUEUE_SIZE,
            enable_id_lists: false,
            id_lists_url: StatsigOptions::DEFAULT_ID_LISTS_URL.to_owned(),
            id_lists_sync_interval: StatsigOptions::DEFAULT_ID_LISTS_SYNC_INTERVAL,
            init_timeout: StatsigOptions::DEFAULT_INIT_TIMEOUT,
            environment: None,
            output_log_level: OutputLogLevel::default(),
            disable_all_logging: false,
            disable_network: false,
            global_custom_fields: HashMap::new(),
            nested_attribute_policy: NestedAttributePolicy::default(),
            bootstrap_values: None,
            network_adapter: None,
            rule_evaluator: None,
            data_store: None,
            persistent_storage: None,
            observability_client: None,
            output_logger_provider: None,
        }
    }

    /// Override the specs endpoint. Clients should use the default setting in most cases.
    pub fn specs_url(&mut self, specs_url: impl Into<String>) -> &mut Self {
        self.specs_url = specs_url.into();
        self
    }

    /// How often to check for new specs. Values below one second are raised to one second.
    pub fn specs_sync_interval_ms(&mut self, interval_ms: u64) -> &mut Self {
        self.specs_sync_interval = Duration::from_millis(interval_ms);
        self
    }

    pub fn log_event_url(&mut self, log_event_url: impl Into<String>) -> &mut Self {
        self.log_event_url = log_event_url.into();
        self
    }

    pub fn event_logging_flush_interval_ms(&mut self, interval_ms: u64) -> &mut Self {
        self.event_logging_flush_interval = Duration::from_millis(interval_ms);
        self
    }

    /// Maximum number of queued events. When full, the oldest event is dropped.
    pub fn event_logging_max_queue_size(&mut self, size: usize) -> &mut Self {
        self.event_logging_max_queue_size = size;
        self
    }

    /// Download ID lists for `in_segment_list` conditions.
    pub fn enable_id_lists(&mut self, enable: bool) -> &mut Self {
        self.enable_id_lists = enable;
        self
    }

    pub fn id_lists_url(&mut self, id_lists_url: impl Into<String>) -> &mut Self {
        self.id_lists_url = id_lists_url.into();
        self
    }

    pub fn id_lists_sync_interval_ms(&mut self, interval_ms: u64) -> &mut Self {
        self.id_lists_sync_interval = Duration::from_millis(interval_ms);
        self
    }

    /// Upper bound on how long `initialize()` waits for the first network fetch.
    pub fn init_timeout_ms(&mut self, timeout_ms: u64) -> &mut Self {
        self.init_timeout = Duration::from_millis(timeout_ms);
        self
    }

    /// Environment tier, e.g. `"production"` or `"staging"`.
    pub fn environment(&mut self, environment: impl Into<String>) -> &mut Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn output_log_level(&mut self, level: OutputLogLevel) -> &mut Self {
        self.output_log_level = level;
        self
    }

    /// Don't send any events. Evaluations still work.
    pub fn disable_all_logging(&mut self, disable: bool) -> &mut Self {
        self.disable_all_logging = disable;
        self
    }

    /// Never touch the network. Values come from bootstrap or the data store only.
    pub fn disable_network(&mut self, disable: bool) -> &mut Self {
        self.disable_network = disable;
        self
    }

    /// Custom fields applied to every user, both for targeting and in events.
    pub fn global_custom_fields(&mut self, fields: HashMap<String, Value>) -> &mut Self {
        self.global_custom_fields = fields;
        self
    }

    pub fn nested_attribute_policy(&mut self, policy: NestedAttributePolicy) -> &mut Self {
        self.nested_attribute_policy = policy;
        self
    }

    /// Specs payload to serve until the first sync completes.
    pub fn bootstrap_values(&mut self, payload: impl Into<String>) -> &mut Self {
        self.bootstrap_values = Some(payload.into());
        self
    }

    pub fn network_adapter(&mut self, adapter: Arc<dyn NetworkAdapter>) -> &mut Self {
        self.network_adapter = Some(adapter);
        self
    }

    pub fn rule_evaluator(&mut self, evaluator: Arc<dyn RuleEvaluator>) -> &mut Self {
        self.rule_evaluator = Some(evaluator);
        self
    }

    pub fn data_store(&mut self, data_store: Arc<dyn DataStore>) -> &mut Self {
        self.data_store = Some(data_store);
        self
    }

    pub fn persistent_storage(&mut self, storage: Arc<dyn PersistentStorage>) -> &mut Self {
        self.persistent_storage = Some(storage);
        self
    }

    pub fn observability_client(&mut self, client: Arc<dyn ObservabilityClient>) -> &mut Self {
        self.observability_client = Some(client);
        self
    }

    pub fn output_logger_provider(&mut self, provider: Arc<dyn OutputLoggerProvider>) -> &mut Self {
        self.output_logger_provider = Some(provider);
        self
    }

    pub(crate) fn event_logger_config(&self) -> EventLoggerConfig {
        EventLoggerConfig {
            log_event_url: self.log_event_url.clone(),
            flush_interval: self.event_logging_flush_interval,
            max_queue_size: self.event_logging_max_queue_size,
        }
    }
}

impl Default for StatsigOptions {
    fn default() -> StatsigOptions {
        StatsigOptions::new()
    }
}

impl fmt::Debug for StatsigOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsigOptions")
            .field("specs_url", &self.specs_url)
            .field("specs_sync_interval", &self.specs_sync_interval)
            .field("log_event_url", &self.log_event_url)
            .field("event_logging_flush_interval", &self.event_logging_flush_interval)
            .field("event_logging_max_queue_size", &self.event_logging_max_queue_size)
            .field("enable_id_lists", &self.enable_id_lists)
            .field("id_lists_url", &self.id_lists_url)
            .field("init_timeout", &self.init_timeout)
            .field("environment", &self.environment)
            .field("output_log_level", &self.output_log_level)
            .field("disable_all_logging", &self.disable_all_logging)
            .field("disable_network", &self.disable_network)
            .finish_non_exhaustive()
    }
}
