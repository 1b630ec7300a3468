//! Sticky bucketing storage. Lets a user stay in the same experiment group across spec changes.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{eval::SecondaryExposure, User};

/// Stored evaluation of one experiment for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickyValues {
    pub value: bool,
    pub json_value: Option<HashMap<String, Value>>,
    #[serde(rename = "ruleID")]
    pub rule_id: Option<String>,
    pub group_name: Option<String>,
    #[serde(default)]
    pub secondary_exposures: Vec<SecondaryExposure>,
    #[serde(default)]
    pub undelegated_secondary_exposures: Option<Vec<SecondaryExposure>>,
    #[serde(default)]
    pub config_delegate: Option<String>,
    #[serde(default)]
    pub explicit_parameters: Option<Vec<String>>,
    pub time: u64,
    #[serde(default)]
    pub config_version: Option<u32>,
}

/// Sticky values for one unit, keyed by experiment name.
pub type UserPersistedValues = HashMap<String, StickyValues>;

/// Host-implemented storage for sticky values.
pub trait PersistentStorage: Send + Sync {
    fn load(&self, key: &str) -> Option<UserPersistedValues>;
    fn save(&self, key: &str, config_name: &str, values: StickyValues);
    fn delete(&self, key: &str, config_name: &str);
}

/// Storage that never remembers anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersistentStorage;

impl PersistentStorage for NoopPersistentStorage {
    fn load(&self, _key: &str) -> Option<UserPersistedValues> {
        None
    }

    fn save(&self, _key: &str, _config_name: &str, _values: StickyValues) {}

    fn delete(&self, _key: &str, _config_name: &str) {}
}

/// Storage key for `user` under `id_type`: `"{id}:{idType}"`.
pub fn storage_key(user: &User, id_type: &str) -> Option<String> {
    user.unit_id(id_type).map(|id| format!("{id}:{id_type}"))
}
