//! Wire models of the specification payload served by the specs endpoint.
use std::{collections::HashMap, sync::Arc};

use derive_more::From;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DefaultOnNull};

use crate::{Result, StatsigError};

/// Kind of the definition being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecKind {
    Gate,
    DynamicConfig,
    Experiment,
    Layer,
}

/// Full specification payload.
///
/// Definitions are wrapped in [`TryParse`] so that one malformed definition doesn't make the
/// whole payload unusable.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecsResponse {
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub feature_gates: HashMap<String, TryParse<Spec>>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub dynamic_configs: HashMap<String, TryParse<Spec>>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub layer_configs: HashMap<String, TryParse<Spec>>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub condition_map: HashMap<String, Condition>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub experiment_to_layer: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub has_updates: bool,
    /// Last config update time (lcut), milliseconds since epoch.
    #[serde(default)]
    pub time: u64,
}

impl SpecsResponse {
    /// Empty payload used before any values are available.
    pub fn empty() -> SpecsResponse {
        SpecsResponse {
            feature_gates: HashMap::new(),
            dynamic_configs: HashMap::new(),
            layer_configs: HashMap::new(),
            condition_map: HashMap::new(),
            experiment_to_layer: HashMap::new(),
            has_updates: true,
            time: 0,
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<SpecsResponse> {
        serde_json::from_slice(data)
            .map_err(|err| StatsigError::JsonParse("specs response", Arc::new(err)))
    }

    /// Find a definition by name. Experiments share the dynamic config namespace.
    pub fn get(&self, kind: SpecKind, name: &str) -> Option<&Spec> {
        let specs = match kind {
            SpecKind::Gate => &self.feature_gates,
            SpecKind::DynamicConfig | SpecKind::Experiment => &self.dynamic_configs,
            SpecKind::Layer => &self.layer_configs,
        };
        specs.get(name).and_then(Option::from)
    }

    /// Number of definitions that failed to parse.
    pub fn unparsed_count(&self) -> usize {
        self.feature_gates
            .values()
            .chain(self.dynamic_configs.values())
            .chain(self.layer_configs.values())
            .filter(|spec| matches!(spec, TryParse::ParseFailed(_)))
            .count()
    }
}

fn default_true() -> bool {
    true
}

fn default_id_type() -> String {
    "userID".to_owned()
}

/// `TryParse` allows a subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(Value),
}

impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &TryParse<T>) -> Option<&T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// A gate, dynamic config, experiment or layer definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    #[serde(rename = "type", default)]
    pub spec_type: String,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub default_value: Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default = "default_id_type")]
    pub id_type: String,
    #[serde(default)]
    pub explicit_parameters: Option<Vec<String>>,
    #[serde(default)]
    pub entity: String,
    #[serde(default)]
    pub has_shared_params: Option<bool>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub version: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default)]
    pub name: String,
    pub pass_percentage: f64,
    #[serde(default)]
    pub return_value: Value,
    pub id: String,
    #[serde(default)]
    pub salt: Option<String>,
    #[serde(default)]
    pub conditions: Vec<ConditionRef>,
    #[serde(default = "default_id_type")]
    pub id_type: String,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub config_delegate: Option<String>,
    #[serde(default)]
    pub is_experiment_group: Option<bool>,
}

/// Conditions are either inlined into the rule or referenced by hash into `condition_map`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum ConditionRef {
    Inline(Condition),
    Hash(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    #[serde(default)]
    pub target_value: Option<Value>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub additional_values: Option<HashMap<String, Value>>,
    #[serde(default = "default_id_type")]
    pub id_type: String,
}
