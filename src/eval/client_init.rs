//! Every definition evaluated for one user, in the shape client SDKs take as their initialize
//! payload. A server hands this payload to a client so the client never downloads definitions.
use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::Value;
use serde_with::skip_serializing_none;

use crate::{
    eval::{hashing::HashAlgorithm, Evaluated, Evaluator, SecondaryExposure},
    metadata::StatsigMetadata,
    spec_store::{SpecSnapshot, SpecsSource},
    specs::{Spec, SpecKind, TryParse},
    user::LoggableUser,
    User,
};

const EXPERIMENT_ENTITY: &str = "experiment";
// Only referenced from other definitions, never evaluated on their own by clients.
const INTERNAL_ENTITIES: [&str; 2] = ["segment", "holdout"];

/// Options for [`get_client_initialize_response_with_options`].
///
/// [`get_client_initialize_response_with_options`]:
///     crate::Statsig::get_client_initialize_response_with_options
#[derive(Debug, Clone, Default)]
pub struct ClientInitResponseOptions {
    /// Applied to definition names, allocated experiment names and secondary exposure gates.
    pub hash_algorithm: HashAlgorithm,
    /// Let local overrides replace evaluated values. Off by default.
    pub include_local_overrides: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateInitEvaluation {
    pub name: String,
    pub value: bool,
    pub rule_id: String,
    pub id_type: String,
    pub secondary_exposures: Vec<SecondaryExposure>,
}

/// A dynamic config or an experiment. Experiment-only fields are left out for dynamic configs.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigInitEvaluation {
    pub name: String,
    pub value: HashMap<String, Value>,
    pub rule_id: String,
    /// Same as `rule_id`.
    pub group: String,
    pub id_type: String,
    pub is_device_based: bool,
    pub secondary_exposures: Vec<SecondaryExposure>,
    pub passed: Option<bool>,
    #[serde(skip_serializing_if = "is_false")]
    pub is_in_layer: bool,
    pub explicit_parameters: Option<Vec<String>>,
    pub group_name: Option<String>,
    pub is_experiment_active: Option<bool>,
    pub is_user_in_experiment: Option<bool>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerInitEvaluation {
    pub name: String,
    pub value: HashMap<String, Value>,
    pub rule_id: String,
    /// Same as `rule_id`.
    pub group: String,
    pub id_type: String,
    pub is_device_based: bool,
    pub secondary_exposures: Vec<SecondaryExposure>,
    pub group_name: Option<String>,
    pub is_experiment_active: Option<bool>,
    pub is_user_in_experiment: Option<bool>,
    pub allocated_experiment_name: Option<String>,
    pub explicit_parameters: Vec<String>,
    pub undelegated_secondary_exposures: Vec<SecondaryExposure>,
}

/// Client initialize payload. Map keys are the hashed definition names.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInitializeResponse {
    pub feature_gates: HashMap<String, GateInitEvaluation>,
    pub dynamic_configs: HashMap<String, ConfigInitEvaluation>,
    pub layer_configs: HashMap<String, LayerInitEvaluation>,
    /// Last config update time of the values evaluated.
    pub time: u64,
    pub has_updates: bool,
    pub hash_used: HashAlgorithm,
    pub user: LoggableUser,
    #[serde(rename = "sdkInfo")]
    pub sdk_info: HashMap<String, String>,
    /// The unit IDs the evaluations were bucketed on.
    pub evaluated_keys: HashMap<String, String>,
}

/// Evaluates every definition of one snapshot for one user, logging nothing.
pub(crate) struct ClientInitResponseBuilder<'a> {
    pub(crate) evaluator: &'a Evaluator,
    pub(crate) snapshot: &'a SpecSnapshot,
    pub(crate) user: &'a User,
    pub(crate) options: &'a ClientInitResponseOptions,
}

impl ClientInitResponseBuilder<'_> {
    pub(crate) fn build(
        &self,
        loggable_user: LoggableUser,
        metadata: &StatsigMetadata,
    ) -> ClientInitializeResponse {
        let values = &self.snapshot.values;

        let feature_gates = client_specs(&values.feature_gates)
            .map(|(name, _)| {
                let evaluated = self.evaluate(SpecKind::Gate, name);
                let hashed = self.hash(name);
                let evaluation = GateInitEvaluation {
                    name: hashed.clone(),
                    value: evaluated.evaluation.value,
                    rule_id: evaluated.evaluation.rule_id,
                    id_type: evaluated.id_type,
                    secondary_exposures: self.exposures(&evaluated.evaluation.secondary_exposures),
                };
                (hashed, evaluation)
            })
            .collect();

        let dynamic_configs = client_specs(&values.dynamic_configs)
            .map(|(name, spec)| {
                let hashed = self.hash(name);
                (hashed.clone(), self.config(name, hashed, spec))
            })
            .collect();

        let layer_configs = client_specs(&values.layer_configs)
            .map(|(name, _)| {
                let hashed = self.hash(name);
                (hashed.clone(), self.layer(name, hashed))
            })
            .collect();

        ClientInitializeResponse {
            feature_gates,
            dynamic_configs,
            layer_configs,
            time: self.snapshot.lcut,
            has_updates: self.snapshot.source != SpecsSource::NoValues,
            hash_used: self.options.hash_algorithm,
            user: loggable_user,
            sdk_info: HashMap::from([
                ("sdkType".to_owned(), metadata.sdk_type.clone()),
                ("sdkVersion".to_owned(), metadata.sdk_version.clone()),
                ("sessionId".to_owned(), metadata.session_id.clone()),
            ]),
            evaluated_keys: evaluated_keys(self.user),
        }
    }

    fn config(&self, name: &str, hashed: String, spec: &Spec) -> ConfigInitEvaluation {
        let is_experiment = spec.entity == EXPERIMENT_ENTITY;
        let kind = if is_experiment {
            SpecKind::Experiment
        } else {
            SpecKind::DynamicConfig
        };
        let evaluated = self.evaluate(kind, name);
        let value = evaluated.json_object();
        let evaluation = evaluated.evaluation;

        ConfigInitEvaluation {
            name: hashed,
            value,
            group: evaluation.rule_id.clone(),
            rule_id: evaluation.rule_id,
            is_device_based: is_device_based(&evaluated.id_type),
            id_type: evaluated.id_type,
            secondary_exposures: self.exposures(&evaluation.secondary_exposures),
            passed: (!is_experiment).then_some(evaluation.value),
            is_in_layer: is_experiment
                && self.snapshot.values.experiment_to_layer.contains_key(name),
            explicit_parameters: evaluation.explicit_parameters.filter(|_| is_experiment),
            group_name: evaluation.group_name,
            is_experiment_active: is_experiment.then_some(spec.is_active == Some(true)),
            is_user_in_experiment: is_experiment.then_some(evaluation.is_experiment_group),
        }
    }

    fn layer(&self, name: &str, hashed: String) -> LayerInitEvaluation {
        let evaluated = self.evaluate(SpecKind::Layer, name);
        let value = evaluated.json_object();
        let evaluation = evaluated.evaluation;

        let allocated = evaluation
            .config_delegate
            .filter(|experiment| !experiment.is_empty());
        let is_experiment_active = allocated.as_deref().map(|experiment| {
            self.snapshot
                .values
                .get(SpecKind::Experiment, experiment)
                .is_some_and(|spec| spec.is_active == Some(true))
        });

        LayerInitEvaluation {
            name: hashed,
            value,
            group: evaluation.rule_id.clone(),
            rule_id: evaluation.rule_id,
            is_device_based: is_device_based(&evaluated.id_type),
            id_type: evaluated.id_type,
            secondary_exposures: self.exposures(&evaluation.secondary_exposures),
            group_name: evaluation.group_name,
            is_experiment_active,
            is_user_in_experiment: allocated
                .as_ref()
                .map(|_| evaluation.is_experiment_group),
            allocated_experiment_name: allocated.map(|experiment| self.hash(&experiment)),
            explicit_parameters: evaluation.explicit_parameters.unwrap_or_default(),
            undelegated_secondary_exposures: self.exposures(
                evaluation
                    .undelegated_secondary_exposures
                    .as_deref()
                    .unwrap_or_default(),
            ),
        }
    }

    fn evaluate(&self, kind: SpecKind, name: &str) -> Evaluated {
        self.evaluator.evaluate_in(
            self.snapshot,
            self.user,
            kind,
            name,
            self.options.include_local_overrides,
        )
    }

    fn hash(&self, name: &str) -> String {
        self.options.hash_algorithm.hash(name)
    }

    /// Deduplicated exposures with hashed gate names.
    fn exposures(&self, exposures: &[SecondaryExposure]) -> Vec<SecondaryExposure> {
        let mut seen = HashSet::new();
        exposures
            .iter()
            .filter(|exposure| seen.insert(*exposure))
            .map(|exposure| SecondaryExposure {
                gate: self.hash(&exposure.gate),
                ..exposure.clone()
            })
            .collect()
    }
}

fn client_specs<'a>(
    specs: &'a HashMap<String, TryParse<Spec>>,
) -> impl Iterator<Item = (&'a str, &'a Spec)> + 'a {
    specs.iter().filter_map(|(name, spec)| {
        let spec = Option::<&Spec>::from(spec)?;
        (!INTERNAL_ENTITIES.contains(&spec.entity.as_str())).then_some((name.as_str(), spec))
    })
}

fn evaluated_keys(user: &User) -> HashMap<String, String> {
    let mut keys = user.custom_ids.clone();
    if let Some(user_id) = &user.user_id {
        keys.insert("userID".to_owned(), user_id.clone());
    }
    keys
}

fn is_device_based(id_type: &str) -> bool {
    id_type.eq_ignore_ascii_case("stableID")
}

fn is_false(value: &bool) -> bool {
    !value
}
