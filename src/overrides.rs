//! Local overrides that bypass rule evaluation.
//!
//! An override is keyed by definition name and optionally scoped to an ID. When a user matches
//! several overrides for the same definition, the one scoped to their user ID wins, then one
//! scoped to any of their custom IDs, then the unscoped one.
use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use derive_more::From;
use serde_json::Value;

use crate::User;

/// Scope key used for overrides that apply to every user.
const GLOBAL_SCOPE: &str = "";

/// Experiment override: either explicit values or a group whose values are taken from the
/// experiment definition.
#[derive(Debug, Clone, PartialEq, From)]
pub enum ExperimentOverride {
    Value(HashMap<String, Value>),
    GroupName(String),
}

type Scoped<T> = HashMap<String, HashMap<String, T>>;

/// Thread-safe registry of overrides for every definition kind.
#[derive(Debug, Default)]
pub struct OverrideRegistry {
    gates: RwLock<Scoped<bool>>,
    configs: RwLock<Scoped<HashMap<String, Value>>>,
    experiments: RwLock<Scoped<ExperimentOverride>>,
    layers: RwLock<Scoped<HashMap<String, Value>>>,
}

impl OverrideRegistry {
    pub fn override_gate(&self, name: &str, value: bool, id: Option<&str>) {
        insert(&self.gates, name, id, value);
    }

    pub fn override_dynamic_config(
        &self,
        name: &str,
        value: HashMap<String, Value>,
        id: Option<&str>,
    ) {
        insert(&self.configs, name, id, value);
    }

    pub fn override_experiment(&self, name: &str, value: ExperimentOverride, id: Option<&str>) {
        insert(&self.experiments, name, id, value);
    }

    pub fn override_layer(&self, name: &str, value: HashMap<String, Value>, id: Option<&str>) {
        insert(&self.layers, name, id, value);
    }

    pub fn gate(&self, user: &User, name: &str) -> Option<bool> {
        lookup(&self.gates, user, name)
    }

    pub fn dynamic_config(&self, user: &User, name: &str) -> Option<HashMap<String, Value>> {
        lookup(&self.configs, user, name)
    }

    pub fn experiment(&self, user: &User, name: &str) -> Option<ExperimentOverride> {
        lookup(&self.experiments, user, name)
    }

    pub fn layer(&self, user: &User, name: &str) -> Option<HashMap<String, Value>> {
        lookup(&self.layers, user, name)
    }

    /// Remove overrides for gate `name`: only the one scoped to `id` when given, otherwise all
    /// of them.
    pub fn remove_gate_override(&self, name: &str, id: Option<&str>) {
        remove(&self.gates, name, id);
    }

    pub fn remove_dynamic_config_override(&self, name: &str, id: Option<&str>) {
        remove(&self.configs, name, id);
    }

    pub fn remove_experiment_override(&self, name: &str, id: Option<&str>) {
        remove(&self.experiments, name, id);
    }

    pub fn remove_layer_override(&self, name: &str, id: Option<&str>) {
        remove(&self.layers, name, id);
    }

    pub fn remove_all_overrides(&self) {
        write(&self.gates).clear();
        write(&self.configs).clear();
        write(&self.experiments).clear();
        write(&self.layers).clear();
    }
}

fn insert<T>(map: &RwLock<Scoped<T>>, name: &str, id: Option<&str>, value: T) {
    write(map)
        .entry(name.to_owned())
        .or_default()
        .insert(id.unwrap_or(GLOBAL_SCOPE).to_owned(), value);
}

fn remove<T>(map: &RwLock<Scoped<T>>, name: &str, id: Option<&str>) {
    let mut map = write(map);
    match id {
        None => {
            map.remove(name);
        }
        Some(id) => {
            if let Some(scoped) = map.get_mut(name) {
                scoped.remove(id);
                if scoped.is_empty() {
                    map.remove(name);
                }
            }
        }
    }
}

fn lookup<T: Clone>(map: &RwLock<Scoped<T>>, user: &User, name: &str) -> Option<T> {
    let map = read(map);
    let scoped = map.get(name)?;

    if let Some(value) = user.user_id.as_deref().and_then(|id| scoped.get(id)) {
        return Some(value.clone());
    }

    // Sorted by ID type so that the result doesn't depend on hash map iteration order.
    let mut custom_ids: Vec<_> = user.custom_ids.iter().collect();
    custom_ids.sort();
    if let Some(value) = custom_ids.into_iter().find_map(|(_, id)| scoped.get(id)) {
        return Some(value.clone());
    }

    scoped.get(GLOBAL_SCOPE).cloned()
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
