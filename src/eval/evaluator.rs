use std::{collections::HashMap, sync::Arc};

use serde_json::Value;

use crate::{
    eval::{
        EvaluationContext, EvaluationDetails, EvaluationReason, RuleEvaluator, SpecEvaluation,
    },
    id_lists::IdListStore,
    overrides::{ExperimentOverride, OverrideRegistry},
    persistent_storage::{storage_key, PersistentStorage, StickyValues, UserPersistedValues},
    spec_store::{now_ms, SpecSnapshot, SpecStore},
    specs::{Spec, SpecKind},
    User,
};

const OVERRIDE_RULE_ID: &str = "override";

/// Outcome of evaluating a definition, before it is shaped into a public result type.
#[derive(Debug, Clone)]
pub(crate) struct Evaluated {
    pub(crate) evaluation: SpecEvaluation,
    pub(crate) details: EvaluationDetails,
    pub(crate) id_type: String,
}

impl Evaluated {
    pub(crate) fn json_object(&self) -> HashMap<String, Value> {
        match &self.evaluation.json_value {
            Some(Value::Object(map)) => map.clone().into_iter().collect(),
            _ => HashMap::new(),
        }
    }
}

/// Resolves a definition name to a value for a user.
///
/// Lookup order: local override, then the definition in the current snapshot passed through the
/// [`RuleEvaluator`]. A missing definition yields the kind's default with an `Unrecognized`
/// reason.
pub(crate) struct Evaluator {
    store: Arc<SpecStore>,
    overrides: Arc<OverrideRegistry>,
    rule_evaluator: Arc<dyn RuleEvaluator>,
    id_lists: Arc<IdListStore>,
    persistent_storage: Option<Arc<dyn PersistentStorage>>,
    environment: Option<String>,
    global_custom: HashMap<String, Value>,
}

impl Evaluator {
    pub(crate) fn new(
        store: Arc<SpecStore>,
        overrides: Arc<OverrideRegistry>,
        rule_evaluator: Arc<dyn RuleEvaluator>,
        id_lists: Arc<IdListStore>,
        persistent_storage: Option<Arc<dyn PersistentStorage>>,
        environment: Option<String>,
        global_custom: HashMap<String, Value>,
    ) -> Evaluator {
        Evaluator {
            store,
            overrides,
            rule_evaluator,
            id_lists,
            persistent_storage,
            environment,
            global_custom,
        }
    }

    pub(crate) fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    pub(crate) fn global_custom(&self) -> &HashMap<String, Value> {
        &self.global_custom
    }

    pub(crate) fn evaluate(&self, user: &User, kind: SpecKind, name: &str) -> Evaluated {
        self.evaluate_in(&self.store.get_snapshot(), user, kind, name, true)
    }

    /// Evaluate against a given `snapshot`. Local overrides apply only with `with_overrides`.
    pub(crate) fn evaluate_in(
        &self,
        snapshot: &SpecSnapshot,
        user: &User,
        kind: SpecKind,
        name: &str,
        with_overrides: bool,
    ) -> Evaluated {
        let spec = snapshot.values.get(kind, name);

        if with_overrides {
            if let Some(evaluated) = self.evaluate_override(user, kind, name, spec, snapshot) {
                return evaluated;
            }
        }

        match spec {
            Some(spec) => self.evaluate_spec(user, spec, snapshot),
            None => unrecognized(snapshot),
        }
    }

    /// Evaluate an experiment, honoring sticky values when `persisted` is given.
    pub(crate) fn evaluate_experiment(
        &self,
        user: &User,
        name: &str,
        persisted: Option<&UserPersistedValues>,
    ) -> Evaluated {
        let (Some(persisted), Some(storage)) = (persisted, self.persistent_storage.as_ref()) else {
            return self.evaluate(user, SpecKind::Experiment, name);
        };

        let snapshot = self.store.get_snapshot();
        let spec = snapshot.values.get(SpecKind::Experiment, name);
        if let Some(evaluated) =
            self.evaluate_override(user, SpecKind::Experiment, name, spec, &snapshot)
        {
            return evaluated;
        }
        let Some(spec) = spec else {
            return unrecognized(&snapshot);
        };
        let Some(key) = storage_key(user, &spec.id_type) else {
            return self.evaluate_spec(user, spec, &snapshot);
        };

        if spec.is_active != Some(true) {
            storage.delete(&key, name);
            return self.evaluate_spec(user, spec, &snapshot);
        }

        if let Some(sticky) = persisted.get(name) {
            return from_sticky(sticky, spec, &snapshot);
        }

        let evaluated = self.evaluate_spec(user, spec, &snapshot);
        if evaluated.evaluation.is_experiment_group {
            storage.save(&key, name, to_sticky(&evaluated, spec));
        }
        evaluated
    }

    fn evaluate_spec(&self, user: &User, spec: &Spec, snapshot: &SpecSnapshot) -> Evaluated {
        let ctx = EvaluationContext {
            user,
            snapshot,
            id_lists: &self.id_lists,
            environment: self.environment.as_deref(),
            global_custom: &self.global_custom,
        };
        let evaluation = self.rule_evaluator.evaluate(&ctx, spec);
        let reason = if evaluation.unsupported {
            EvaluationReason::Unsupported
        } else {
            EvaluationReason::Recognized
        };

        Evaluated {
            evaluation,
            details: EvaluationDetails::new(snapshot, reason, spec.version),
            id_type: spec.id_type.clone(),
        }
    }

    fn evaluate_override(
        &self,
        user: &User,
        kind: SpecKind,
        name: &str,
        spec: Option<&Spec>,
        snapshot: &SpecSnapshot,
    ) -> Option<Evaluated> {
        let json_value = match kind {
            SpecKind::Gate => Value::Bool(self.overrides.gate(user, name)?),
            SpecKind::DynamicConfig => object(self.overrides.dynamic_config(user, name)?),
            SpecKind::Layer => object(self.overrides.layer(user, name)?),
            SpecKind::Experiment => match self.overrides.experiment(user, name)? {
                ExperimentOverride::Value(value) => object(value),
                ExperimentOverride::GroupName(group) => {
                    return group_override(spec?, &group, snapshot);
                }
            },
        };

        Some(Evaluated {
            evaluation: SpecEvaluation {
                value: json_value == Value::Bool(true),
                json_value: Some(json_value),
                rule_id: OVERRIDE_RULE_ID.to_owned(),
                ..Default::default()
            },
            details: EvaluationDetails::new(snapshot, EvaluationReason::LocalOverride, None),
            id_type: spec.map_or_else(|| "userID".to_owned(), |spec| spec.id_type.clone()),
        })
    }
}

/// Values of the first rule that assigns `group`.
fn group_override(spec: &Spec, group: &str, snapshot: &SpecSnapshot) -> Option<Evaluated> {
    let rule = spec
        .rules
        .iter()
        .find(|rule| rule.group_name.as_deref() == Some(group))?;

    Some(Evaluated {
        evaluation: SpecEvaluation {
            value: true,
            json_value: Some(rule.return_value.clone()),
            rule_id: rule.id.clone(),
            group_name: Some(group.to_owned()),
            is_experiment_group: rule.is_experiment_group.unwrap_or(false),
            ..Default::default()
        },
        details: EvaluationDetails::new(snapshot, EvaluationReason::LocalOverride, spec.version),
        id_type: spec.id_type.clone(),
    })
}

fn unrecognized(snapshot: &SpecSnapshot) -> Evaluated {
    Evaluated {
        evaluation: SpecEvaluation::default(),
        details: EvaluationDetails::new(snapshot, EvaluationReason::Unrecognized, None),
        id_type: "userID".to_owned(),
    }
}

fn object(map: HashMap<String, Value>) -> Value {
    Value::Object(map.into_iter().collect())
}

fn from_sticky(sticky: &StickyValues, spec: &Spec, snapshot: &SpecSnapshot) -> Evaluated {
    let details =
        EvaluationDetails::new(snapshot, EvaluationReason::Persisted, sticky.config_version);

    Evaluated {
        evaluation: SpecEvaluation {
            value: sticky.value,
            json_value: sticky.json_value.clone().map(object),
            rule_id: sticky.rule_id.clone().unwrap_or_default(),
            group_name: sticky.group_name.clone(),
            is_experiment_group: true,
            secondary_exposures: sticky.secondary_exposures.clone(),
            undelegated_secondary_exposures: sticky.undelegated_secondary_exposures.clone(),
            config_delegate: sticky.config_delegate.clone(),
            explicit_parameters: sticky.explicit_parameters.clone(),
            unsupported: false,
        },
        details,
        id_type: spec.id_type.clone(),
    }
}

fn to_sticky(evaluated: &Evaluated, spec: &Spec) -> StickyValues {
    let evaluation = &evaluated.evaluation;
    StickyValues {
        value: evaluation.value,
        json_value: Some(evaluated.json_object()),
        rule_id: Some(evaluation.rule_id.clone()),
        group_name: evaluation.group_name.clone(),
        secondary_exposures: evaluation.secondary_exposures.clone(),
        undelegated_secondary_exposures: evaluation.undelegated_secondary_exposures.clone(),
        config_delegate: evaluation.config_delegate.clone(),
        explicit_parameters: evaluation.explicit_parameters.clone(),
        time: now_ms(),
        config_version: spec.version,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        eval::DefaultRuleEvaluator, persistent_storage::tests::MemoryStorage,
        spec_store::SpecsSource,
    };

    fn payload() -> String {
        json!({
            "feature_gates": {
                "on_for_all": {"salt": "s", "defaultValue": false, "rules": [
                    {"id": "all", "passPercentage": 100.0, "returnValue": true,
                     "conditions": [{"type": "public"}]}
                ]},
            },
            "dynamic_configs": {
                "exp": {"salt": "e", "defaultValue": {"color": "grey"}, "entity": "experiment",
                        "isActive": true,
                        "rules": [
                            {"id": "control", "groupName": "Control", "passPercentage": 100.0,
                             "isExperimentGroup": true, "returnValue": {"color": "blue"},
                             "conditions": [{"type": "user_field", "field": "country",
                                             "operator": "any", "targetValue": ["NZ"]}]},
                            {"id": "test", "groupName": "Test", "passPercentage": 100.0,
                             "isExperimentGroup": true, "returnValue": {"color": "green"},
                             "conditions": [{"type": "public"}]},
                        ]},
            },
            "time": 1000,
        })
        .to_string()
    }

    fn evaluator(
        storage: Option<Arc<dyn PersistentStorage>>,
    ) -> (Evaluator, Arc<OverrideRegistry>) {
        let store = Arc::new(SpecStore::new("secret-key"));
        store.apply_raw(payload().as_bytes(), SpecsSource::Network).unwrap();
        let overrides = Arc::new(OverrideRegistry::default());
        let evaluator = Evaluator::new(
            store,
            overrides.clone(),
            Arc::new(DefaultRuleEvaluator),
            Arc::new(IdListStore::default()),
            storage,
            None,
            HashMap::new(),
        );
        (evaluator, overrides)
    }

    #[test]
    fn unknown_name_is_unrecognized() {
        let (evaluator, _) = evaluator(None);

        let result = evaluator.evaluate(&User::with_user_id("u1"), SpecKind::Gate, "nope");

        assert!(!result.evaluation.value);
        assert_eq!(result.details.reason, "Network:Unrecognized");
    }

    #[test]
    fn recognized_evaluation() {
        let (evaluator, _) = evaluator(None);

        let result = evaluator.evaluate(&User::with_user_id("u1"), SpecKind::Gate, "on_for_all");

        assert!(result.evaluation.value);
        assert_eq!(result.evaluation.rule_id, "all");
        assert_eq!(result.details.reason, "Network:Recognized");
        assert_eq!(result.details.lcut, Some(1000));
    }

    #[test]
    fn override_wins_over_definition() {
        let (evaluator, overrides) = evaluator(None);
        overrides.override_gate("on_for_all", false, None);

        let result = evaluator.evaluate(&User::with_user_id("u1"), SpecKind::Gate, "on_for_all");

        assert!(!result.evaluation.value);
        assert_eq!(result.evaluation.rule_id, "override");
        assert_eq!(result.details.reason, "LocalOverride:Recognized");
    }

    #[test]
    fn override_for_unknown_definition() {
        let (evaluator, overrides) = evaluator(None);
        overrides.override_dynamic_config("new", HashMap::from([("k".to_owned(), json!(1))]), None);

        let result = evaluator.evaluate(&User::with_user_id("u1"), SpecKind::DynamicConfig, "new");

        assert_eq!(result.json_object()["k"], json!(1));
        assert_eq!(result.details.reason, "LocalOverride:Recognized");
    }

    #[test]
    fn group_name_override_uses_group_values() {
        let (evaluator, overrides) = evaluator(None);
        overrides.override_experiment(
            "exp",
            ExperimentOverride::GroupName("Control".to_owned()),
            None,
        );

        let result = evaluator.evaluate(&User::with_user_id("u1"), SpecKind::Experiment, "exp");

        assert_eq!(result.json_object()["color"], json!("blue"));
        assert_eq!(result.evaluation.group_name.as_deref(), Some("Control"));
        assert_eq!(result.details.reason, "LocalOverride:Recognized");
    }

    #[test]
    fn sticky_values_are_saved_then_reused() {
        let storage = Arc::new(MemoryStorage::default());
        let (evaluator, _) = evaluator(Some(storage.clone()));
        let user = User::with_user_id("u1");

        let first = evaluator.evaluate_experiment(&user, "exp", Some(&HashMap::new()));
        assert_eq!(first.evaluation.group_name.as_deref(), Some("Test"));

        let persisted = storage.load("u1:userID").unwrap();
        assert_eq!(persisted["exp"].group_name.as_deref(), Some("Test"));

        // The user now qualifies for Control but stays in their stored group.
        let moved = user.clone().country("NZ");
        let sticky = evaluator.evaluate_experiment(&moved, "exp", Some(&persisted));
        assert_eq!(sticky.evaluation.group_name.as_deref(), Some("Test"));
        assert_eq!(sticky.details.reason, "Persisted");

        let fresh = evaluator.evaluate_experiment(&moved, "exp", None);
        assert_eq!(fresh.evaluation.group_name.as_deref(), Some("Control"));
    }
}
