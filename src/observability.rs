//! Metrics hook. The SDK reports its own health (initialization latency, config propagation, event
//! delivery) to an optional [`ObservabilityClient`] supplied by the host.
use std::{collections::HashMap, fmt::Display, sync::Arc};

const METRIC_PREFIX: &str = "statsig.sdk";
const HIGH_CARDINALITY_TAGS: &[&str] = &["lcut", "prev_lcut"];

/// Metric tags.
pub type Tags = HashMap<String, String>;

/// Host-provided metrics sink.
pub trait ObservabilityClient: Send + Sync {
    fn init(&self) {}
    fn increment(&self, metric_name: String, value: f64, tags: Option<Tags>);
    fn gauge(&self, metric_name: String, value: f64, tags: Option<Tags>);
    fn dist(&self, metric_name: String, value: f64, tags: Option<Tags>);
    fn error(&self, tag: String, error: String) {
        let _ = (tag, error);
    }
    /// High-cardinality tags (config timestamps) are dropped unless this returns `true`.
    fn should_enable_high_cardinality_for_this_tag(&self, tag: &str) -> bool {
        let _ = tag;
        false
    }
}

/// Client that ignores every metric.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObservabilityClient;

impl ObservabilityClient for NoopObservabilityClient {
    fn increment(&self, _metric_name: String, _value: f64, _tags: Option<Tags>) {}
    fn gauge(&self, _metric_name: String, _value: f64, _tags: Option<Tags>) {}
    fn dist(&self, _metric_name: String, _value: f64, _tags: Option<Tags>) {}
}

/// Names of metrics emitted by the SDK, without the common prefix.
pub(crate) mod metrics {
    pub const INITIALIZATION: &str = "initialization";
    pub const CONFIG_PROPAGATION_DIFF: &str = "config_propagation_diff";
    pub const CONFIG_NO_UPDATE: &str = "config_no_update";
    pub const NETWORK_REQUEST_LATENCY: &str = "network_request.latency";
    pub const EVENTS_SENT: &str = "events_successfully_sent_count";
    pub const EVENTS_DROPPED: &str = "events_dropped";
    pub const PENDING_FAILED_BATCHES: &str = "pending_failed_batches";
    pub const SHUTDOWN_TIMEOUTS: &str = "shutdown_timeouts";
}

/// SDK-side wrapper that prefixes metric names and filters tags before calling the client.
#[derive(Clone, Default)]
pub(crate) struct OpsStats {
    client: Option<Arc<dyn ObservabilityClient>>,
}

impl OpsStats {
    pub(crate) fn new(client: Option<Arc<dyn ObservabilityClient>>) -> OpsStats {
        OpsStats { client }
    }

    pub(crate) fn init(&self) {
        if let Some(client) = &self.client {
            client.init();
        }
    }

    pub(crate) fn increment(&self, name: &str, value: f64, tags: &[(&str, String)]) {
        if let Some(client) = &self.client {
            client.increment(metric_name(name), value, self.tags(client, tags));
        }
    }

    pub(crate) fn gauge(&self, name: &str, value: f64, tags: &[(&str, String)]) {
        if let Some(client) = &self.client {
            client.gauge(metric_name(name), value, self.tags(client, tags));
        }
    }

    pub(crate) fn dist(&self, name: &str, value: f64, tags: &[(&str, String)]) {
        if let Some(client) = &self.client {
            client.dist(metric_name(name), value, self.tags(client, tags));
        }
    }

    pub(crate) fn error(&self, tag: &str, error: impl Display) {
        if let Some(client) = &self.client {
            client.error(tag.to_owned(), error.to_string());
        }
    }

    fn tags(&self, client: &Arc<dyn ObservabilityClient>, tags: &[(&str, String)]) -> Option<Tags> {
        if tags.is_empty() {
            return None;
        }
        Some(
            tags.iter()
                .filter(|(key, _)| {
                    !HIGH_CARDINALITY_TAGS.contains(key)
                        || client.should_enable_high_cardinality_for_this_tag(key)
                })
                .map(|(key, value)| ((*key).to_owned(), value.clone()))
                .collect(),
        )
    }
}

fn metric_name(name: &str) -> String {
    format!("{METRIC_PREFIX}.{name}")
}
