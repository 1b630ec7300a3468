use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Mutex, Weak},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    events::{EventLogger, StatsigEvent, LAYER_EXPOSURE_EVENT},
    persistent_storage::UserPersistedValues,
    spec_store::{SpecSnapshot, SpecsSource},
    user::LoggableUser,
};

/// A gate evaluated on the way to a result, reported alongside the exposure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecondaryExposure {
    pub gate: String,
    #[serde(rename = "gateValue")]
    pub gate_value: String,
    #[serde(rename = "ruleID")]
    pub rule_id: String,
}

/// Why an evaluation produced its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EvaluationReason {
    /// Definition found and evaluated.
    Recognized,
    /// Definition not present in the active snapshot.
    Unrecognized,
    /// Definition uses a condition or operator this SDK doesn't know.
    Unsupported,
    /// A local override supplied the value.
    LocalOverride,
    /// Value restored from persistent storage.
    Persisted,
}

/// Evaluation metadata attached to every result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDetails {
    /// `"{source}:{outcome}"`, e.g. `"Network:Recognized"` or `"LocalOverride:Recognized"`.
    pub reason: String,
    pub lcut: Option<u64>,
    pub received_at: Option<u64>,
    pub version: Option<u32>,
}

impl EvaluationDetails {
    pub(crate) fn new(
        snapshot: &SpecSnapshot,
        reason: EvaluationReason,
        version: Option<u32>,
    ) -> EvaluationDetails {
        let has_values = snapshot.source != SpecsSource::NoValues;
        EvaluationDetails {
            reason: format_reason(snapshot.source, reason),
            lcut: has_values.then_some(snapshot.lcut),
            received_at: snapshot.received_at,
            version,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !self.reason.ends_with("Unrecognized")
    }
}

fn format_reason(source: SpecsSource, reason: EvaluationReason) -> String {
    match reason {
        EvaluationReason::LocalOverride => "LocalOverride:Recognized".to_owned(),
        EvaluationReason::Persisted => "Persisted".to_owned(),
        EvaluationReason::Recognized => format!("{source}:Recognized"),
        EvaluationReason::Unrecognized => format!("{source}:Unrecognized"),
        EvaluationReason::Unsupported => format!("{source}:Unsupported"),
    }
}

/// Per-call evaluation options.
#[derive(Debug, Clone, Default)]
pub struct EvaluationOptions {
    /// Don't log an exposure for this evaluation.
    pub disable_exposure_logging: bool,
    /// Sticky values previously loaded from persistent storage. When set, experiments keep
    /// returning the stored group while they are active.
    pub user_persisted_values: Option<UserPersistedValues>,
}

impl EvaluationOptions {
    pub fn without_exposure_logging() -> EvaluationOptions {
        EvaluationOptions {
            disable_exposure_logging: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureGate {
    pub name: String,
    pub value: bool,
    #[serde(rename = "ruleID")]
    pub rule_id: String,
    pub id_type: String,
    pub details: EvaluationDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicConfig {
    pub name: String,
    pub value: HashMap<String, Value>,
    #[serde(rename = "ruleID")]
    pub rule_id: String,
    pub id_type: String,
    pub details: EvaluationDetails,
}

impl DynamicConfig {
    /// Typed parameter lookup; `fallback` when missing or of a different type.
    pub fn get<T: DeserializeOwned>(&self, key: &str, fallback: T) -> T {
        typed(self.value.get(key)).unwrap_or(fallback)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub name: String,
    pub value: HashMap<String, Value>,
    #[serde(rename = "ruleID")]
    pub rule_id: String,
    pub id_type: String,
    pub group_name: Option<String>,
    pub details: EvaluationDetails,
}

impl Experiment {
    /// Typed parameter lookup; `fallback` when missing or of a different type.
    pub fn get<T: DeserializeOwned>(&self, key: &str, fallback: T) -> T {
        typed(self.value.get(key)).unwrap_or(fallback)
    }
}

fn typed<T: DeserializeOwned>(value: Option<&Value>) -> Option<T> {
    serde_json::from_value(value?.clone()).ok()
}

/// Which config a layer parameter is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerParameterOwner {
    /// The parameter is explicitly delegated to the allocated experiment.
    Experiment(String),
    /// The parameter comes from the layer defaults.
    Layer,
}

/// Result of evaluating a layer.
///
/// Reading a parameter with [`Layer::get`] or [`Layer::get_value`] logs a layer exposure the
/// first time that parameter is read on this instance.
pub struct Layer {
    pub name: String,
    pub rule_id: String,
    pub id_type: String,
    pub group_name: Option<String>,
    pub allocated_experiment_name: Option<String>,
    pub details: EvaluationDetails,
    pub(crate) value: HashMap<String, Value>,
    pub(crate) explicit_parameters: Vec<String>,
    pub(crate) secondary_exposures: Vec<SecondaryExposure>,
    pub(crate) undelegated_secondary_exposures: Vec<SecondaryExposure>,
    pub(crate) user: LoggableUser,
    pub(crate) exposure_logging_disabled: bool,
    pub(crate) logged_parameters: Mutex<HashSet<String>>,
    pub(crate) event_logger: Option<Weak<EventLogger>>,
}

impl Layer {
    /// Typed parameter lookup; `fallback` when missing or of a different type.
    pub fn get<T: DeserializeOwned>(&self, param: &str, fallback: T) -> T {
        match self.get_value(param) {
            Some(value) => serde_json::from_value(value).unwrap_or(fallback),
            None => fallback,
        }
    }

    /// Raw parameter lookup.
    pub fn get_value(&self, param: &str) -> Option<Value> {
        let value = self.value.get(param)?.clone();
        self.log_parameter_exposure(param);
        Some(value)
    }

    /// Parameter names available in this layer.
    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.value.keys().map(String::as_str)
    }

    pub fn parameter_owner(&self, param: &str) -> LayerParameterOwner {
        match &self.allocated_experiment_name {
            Some(experiment) if self.explicit_parameters.iter().any(|p| p == param) => {
                LayerParameterOwner::Experiment(experiment.clone())
            }
            _ => LayerParameterOwner::Layer,
        }
    }

    fn log_parameter_exposure(&self, param: &str) {
        if self.exposure_logging_disabled {
            return;
        }
        let Some(logger) = self.event_logger.as_ref().and_then(Weak::upgrade) else {
            return;
        };

        let first_read = self
            .logged_parameters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(param.to_owned());
        if first_read {
            logger.enqueue(self.parameter_exposure(param, false));
        }
    }

    pub(crate) fn parameter_exposure(&self, param: &str, is_manual: bool) -> StatsigEvent {
        let (allocated_experiment, is_explicit, secondary_exposures) =
            match self.parameter_owner(param) {
                LayerParameterOwner::Experiment(experiment) => {
                    (experiment, true, self.secondary_exposures.clone())
                }
                LayerParameterOwner::Layer => (
                    String::new(),
                    false,
                    self.undelegated_secondary_exposures.clone(),
                ),
            };

        let mut metadata = exposure_metadata(&self.details, is_manual);
        metadata.extend([
            ("config".to_owned(), self.name.clone()),
            ("ruleID".to_owned(), self.rule_id.clone()),
            ("allocatedExperiment".to_owned(), allocated_experiment),
            ("parameterName".to_owned(), param.to_owned()),
            ("isExplicitParameter".to_owned(), is_explicit.to_string()),
        ]);

        StatsigEvent::exposure(
            LAYER_EXPOSURE_EVENT,
            self.user.clone(),
            metadata,
            secondary_exposures,
        )
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("name", &self.name)
            .field("rule_id", &self.rule_id)
            .field("group_name", &self.group_name)
            .field("allocated_experiment_name", &self.allocated_experiment_name)
            .field("details", &self.details)
            .finish_non_exhaustive()
    }
}

/// Metadata shared by every exposure kind.
pub(crate) fn exposure_metadata(
    details: &EvaluationDetails,
    is_manual: bool,
) -> HashMap<String, String> {
    let mut metadata = HashMap::from([("reason".to_owned(), details.reason.clone())]);
    if let Some(lcut) = details.lcut {
        metadata.insert("lcut".to_owned(), lcut.to_string());
    }
    if let Some(received_at) = details.received_at {
        metadata.insert("receivedAt".to_owned(), received_at.to_string());
    }
    if let Some(version) = details.version {
        metadata.insert("configVersion".to_owned(), version.to_string());
    }
    if is_manual {
        metadata.insert("isManualExposure".to_owned(), "true".to_owned());
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specs::SpecsResponse;

    fn snapshot(source: SpecsSource) -> SpecSnapshot {
        let mut values = SpecsResponse::empty();
        values.time = 1000;
        SpecSnapshot::new(values, source)
    }

    #[test]
    fn reason_format() {
        let network = snapshot(SpecsSource::Network);
        let empty = SpecSnapshot::empty();

        assert_eq!(
            EvaluationDetails::new(&network, EvaluationReason::Recognized, None).reason,
            "Network:Recognized"
        );
        assert_eq!(
            EvaluationDetails::new(&network, EvaluationReason::LocalOverride, None).reason,
            "LocalOverride:Recognized"
        );
        assert_eq!(
            EvaluationDetails::new(&empty, EvaluationReason::Unrecognized, None).reason,
            "NoValues:Unrecognized"
        );
        assert_eq!(
            EvaluationDetails::new(
                &snapshot(SpecsSource::Bootstrap),
                EvaluationReason::Unrecognized,
                None
            )
            .reason,
            "Bootstrap:Unrecognized"
        );
    }

    #[test]
    fn details_carry_freshness() {
        let details = EvaluationDetails::new(
            &snapshot(SpecsSource::Network),
            EvaluationReason::Recognized,
            Some(3),
        );

        assert_eq!(details.lcut, Some(1000));
        assert!(details.received_at.is_some());
        assert_eq!(details.version, Some(3));
        assert!(details.is_recognized());

        let empty = EvaluationDetails::new(
            &SpecSnapshot::empty(),
            EvaluationReason::Unrecognized,
            None,
        );
        assert_eq!(empty.lcut, None);
        assert!(!empty.is_recognized());
    }

    #[test]
    fn typed_getters_fall_back_on_type_mismatch() {
        let config = DynamicConfig {
            name: "c".to_owned(),
            value: HashMap::from([
                ("n".to_owned(), Value::from(3)),
                ("s".to_owned(), Value::from("x")),
            ]),
            rule_id: "default".to_owned(),
            id_type: "userID".to_owned(),
            details: EvaluationDetails::new(
                &SpecSnapshot::empty(),
                EvaluationReason::Unrecognized,
                None,
            ),
        };

        assert_eq!(config.get("n", 0i64), 3);
        assert_eq!(config.get("s", 0i64), 0);
        assert_eq!(config.get("missing", "d".to_owned()), "d");
    }
}
