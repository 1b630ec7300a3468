use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::{eval::SecondaryExposure, spec_store::now_ms, user::LoggableUser};

pub const GATE_EXPOSURE_EVENT: &str = "statsig::gate_exposure";
pub const CONFIG_EXPOSURE_EVENT: &str = "statsig::config_exposure";
pub const LAYER_EXPOSURE_EVENT: &str = "statsig::layer_exposure";
pub const DIAGNOSTICS_EVENT: &str = "statsig::diagnostics";

/// A single telemetry record, either an exposure or a custom event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsigEvent {
    pub event_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub metadata: HashMap<String, String>,
    pub user: LoggableUser,
    pub time: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub secondary_exposures: Vec<SecondaryExposure>,
}

impl StatsigEvent {
    /// A custom event. `null` metadata values are dropped; other non-string values are stored as
    /// their JSON text.
    pub fn custom(
        user: LoggableUser,
        event_name: impl Into<String>,
        value: Option<Value>,
        metadata: Option<HashMap<String, Value>>,
    ) -> StatsigEvent {
        StatsigEvent {
            event_name: event_name.into(),
            value,
            metadata: metadata.map(coerce_metadata).unwrap_or_default(),
            user,
            time: now_ms(),
            secondary_exposures: Vec::new(),
        }
    }

    pub(crate) fn exposure(
        event_name: &str,
        user: LoggableUser,
        metadata: HashMap<String, String>,
        secondary_exposures: Vec<SecondaryExposure>,
    ) -> StatsigEvent {
        StatsigEvent {
            event_name: event_name.to_owned(),
            value: None,
            metadata,
            user,
            time: now_ms(),
            secondary_exposures,
        }
    }

    pub(crate) fn diagnostics(
        user: LoggableUser,
        metadata: HashMap<String, String>,
    ) -> StatsigEvent {
        StatsigEvent::exposure(DIAGNOSTICS_EVENT, user, metadata, Vec::new())
    }

    /// SDK-internal events that are not business exposures.
    pub fn is_diagnostic(&self) -> bool {
        self.event_name == DIAGNOSTICS_EVENT
    }

    pub fn is_exposure(&self) -> bool {
        matches!(
            self.event_name.as_str(),
            GATE_EXPOSURE_EVENT | CONFIG_EXPOSURE_EVENT | LAYER_EXPOSURE_EVENT
        )
    }
}

/// Turn arbitrary JSON metadata into string metadata.
pub(crate) fn coerce_metadata(metadata: HashMap<String, Value>) -> HashMap<String, String> {
    metadata
        .into_iter()
        .filter_map(|(key, value)| match value {
            Value::Null => None,
            Value::String(s) => Some((key, s)),
            other => Some((key, other.to_string())),
        })
        .collect()
}
