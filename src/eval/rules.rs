//! Rule evaluation: walks a definition's rules, checks conditions and buckets units.
use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use semver::Version;
use serde_json::Value;

use crate::{
    eval::{
        hashing::{id_list_hash, Sha256Sharder, Sharder},
        SecondaryExposure,
    },
    id_lists::IdListStore,
    spec_store::{now_ms, SpecSnapshot},
    specs::{Condition, ConditionRef, Rule, Spec, SpecKind},
    User,
};

const DEFAULT_RULE_ID: &str = "default";
const DISABLED_RULE_ID: &str = "disabled";
const SEGMENT_PREFIX: &str = "segment:";
const MAX_NESTING_DEPTH: usize = 64;

/// Everything a rule evaluator may consult besides the definition itself.
#[derive(Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub user: &'a User,
    pub snapshot: &'a SpecSnapshot,
    pub id_lists: &'a IdListStore,
    /// Environment tier used by `environment_field` conditions.
    pub environment: Option<&'a str>,
    /// Custom fields applied to every user.
    pub global_custom: &'a HashMap<String, Value>,
}

/// Outcome of evaluating one definition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecEvaluation {
    pub value: bool,
    pub json_value: Option<Value>,
    pub rule_id: String,
    pub group_name: Option<String>,
    pub is_experiment_group: bool,
    pub secondary_exposures: Vec<SecondaryExposure>,
    /// Exposures gathered before delegating to an experiment. Only set for layers.
    pub undelegated_secondary_exposures: Option<Vec<SecondaryExposure>>,
    pub config_delegate: Option<String>,
    pub explicit_parameters: Option<Vec<String>>,
    /// The definition uses a condition type or operator that isn't understood.
    pub unsupported: bool,
}

/// Pluggable rule evaluation.
///
/// The engine resolves overrides and definitions; the evaluator only turns a definition and a
/// user into a value.
pub trait RuleEvaluator: Send + Sync {
    fn evaluate(&self, ctx: &EvaluationContext<'_>, spec: &Spec) -> SpecEvaluation;
}

/// Built-in evaluator for the rule language served by the specs endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRuleEvaluator;

impl RuleEvaluator for DefaultRuleEvaluator {
    fn evaluate(&self, ctx: &EvaluationContext<'_>, spec: &Spec) -> SpecEvaluation {
        evaluate_spec(ctx, spec, 0)
    }
}

/// Marker for definitions this evaluator doesn't understand.
#[derive(Debug)]
struct Unsupported;

type Check = std::result::Result<bool, Unsupported>;

fn evaluate_spec(ctx: &EvaluationContext<'_>, spec: &Spec, depth: usize) -> SpecEvaluation {
    if !spec.enabled {
        return default_evaluation(spec, DISABLED_RULE_ID, Vec::new());
    }

    let mut exposures = Vec::new();
    for rule in &spec.rules {
        let passed = match evaluate_rule(ctx, rule, &mut exposures, depth) {
            Ok(passed) => passed,
            Err(Unsupported) => {
                let mut result = default_evaluation(spec, DEFAULT_RULE_ID, exposures);
                result.unsupported = true;
                return result;
            }
        };
        if !passed {
            continue;
        }

        if let Some(delegated) = delegate(ctx, rule, &exposures, depth) {
            return delegated;
        }

        let pass = passes_percentage(ctx.user, spec, rule);
        let (value, json_value) = if pass {
            (
                rule.return_value != Value::Bool(false),
                rule.return_value.clone(),
            )
        } else {
            (
                spec.default_value == Value::Bool(true),
                spec.default_value.clone(),
            )
        };

        return SpecEvaluation {
            value,
            json_value: Some(json_value),
            rule_id: rule.id.clone(),
            group_name: rule.group_name.clone(),
            is_experiment_group: rule.is_experiment_group.unwrap_or(false),
            secondary_exposures: exposures,
            explicit_parameters: spec.explicit_parameters.clone(),
            ..Default::default()
        };
    }

    default_evaluation(spec, DEFAULT_RULE_ID, exposures)
}

fn default_evaluation(
    spec: &Spec,
    rule_id: &str,
    secondary_exposures: Vec<SecondaryExposure>,
) -> SpecEvaluation {
    SpecEvaluation {
        value: spec.default_value == Value::Bool(true),
        json_value: Some(spec.default_value.clone()),
        rule_id: rule_id.to_owned(),
        secondary_exposures,
        explicit_parameters: spec.explicit_parameters.clone(),
        ..Default::default()
    }
}

/// Conditions of a rule are all evaluated so that every nested gate is reported.
fn evaluate_rule(
    ctx: &EvaluationContext<'_>,
    rule: &Rule,
    exposures: &mut Vec<SecondaryExposure>,
    depth: usize,
) -> Check {
    let mut all_pass = true;
    for condition in &rule.conditions {
        let condition = match condition {
            ConditionRef::Inline(condition) => condition,
            ConditionRef::Hash(hash) => ctx
                .snapshot
                .values
                .condition_map
                .get(hash)
                .ok_or(Unsupported)?,
        };
        if !evaluate_condition(ctx, condition, exposures, depth)? {
            all_pass = false;
        }
    }
    Ok(all_pass)
}

fn delegate(
    ctx: &EvaluationContext<'_>,
    rule: &Rule,
    exposures: &[SecondaryExposure],
    depth: usize,
) -> Option<SpecEvaluation> {
    let name = rule.config_delegate.as_deref().filter(|name| !name.is_empty())?;
    let spec = ctx.snapshot.values.get(SpecKind::Experiment, name)?;
    if depth >= MAX_NESTING_DEPTH {
        return None;
    }

    let mut result = evaluate_spec(ctx, spec, depth + 1);
    let mut secondary = exposures.to_vec();
    secondary.append(&mut result.secondary_exposures);

    result.secondary_exposures = secondary;
    result.undelegated_secondary_exposures = Some(exposures.to_vec());
    result.config_delegate = Some(name.to_owned());
    result.explicit_parameters = spec.explicit_parameters.clone();
    Some(result)
}

fn passes_percentage(user: &User, spec: &Spec, rule: &Rule) -> bool {
    if rule.pass_percentage >= 100.0 {
        return true;
    }
    if rule.pass_percentage <= 0.0 {
        return false;
    }

    let rule_salt = rule.salt.as_deref().unwrap_or(&rule.id);
    let unit_id = user.unit_id(&rule.id_type).unwrap_or_default();
    let shard = Sha256Sharder.get_shard(format!("{}.{rule_salt}.{unit_id}", spec.salt), 10_000);
    (shard as f64) < rule.pass_percentage * 100.0
}

fn evaluate_condition(
    ctx: &EvaluationContext<'_>,
    condition: &Condition,
    exposures: &mut Vec<SecondaryExposure>,
    depth: usize,
) -> Check {
    let target = condition.target_value.as_ref();
    let field = condition.field.as_deref().unwrap_or_default();

    let value = match condition.condition_type.as_str() {
        "public" => return Ok(true),
        "pass_gate" | "fail_gate" => {
            let name = target.and_then(Value::as_str).unwrap_or_default();
            let passed = evaluate_nested_gate(ctx, name, exposures, depth)?;
            return Ok(if condition.condition_type == "pass_gate" {
                passed
            } else {
                !passed
            });
        }
        "multi_pass_gate" | "multi_fail_gate" => {
            let mut any_passed = false;
            for name in target.and_then(Value::as_array).into_iter().flatten() {
                let name = name.as_str().unwrap_or_default();
                if evaluate_nested_gate(ctx, name, exposures, depth)? {
                    any_passed = true;
                    break;
                }
            }
            return Ok(if condition.condition_type == "multi_pass_gate" {
                any_passed
            } else {
                !any_passed
            });
        }
        "user_field" | "ip_based" | "ua_based" => ctx.user.field(field, ctx.global_custom),
        "environment_field" => environment_value(ctx.environment, field),
        "current_time" => Some(Value::from(now_ms())),
        "user_bucket" => Some(Value::from(user_bucket(ctx.user, condition))),
        "unit_id" => ctx
            .user
            .unit_id(&condition.id_type)
            .map(|id| Value::String(id.to_owned())),
        _ => return Err(Unsupported),
    };

    let operator = condition
        .operator
        .as_deref()
        .and_then(Operator::parse)
        .ok_or(Unsupported)?;

    Ok(operator.eval(value.as_ref(), target, ctx.id_lists))
}

fn evaluate_nested_gate(
    ctx: &EvaluationContext<'_>,
    name: &str,
    exposures: &mut Vec<SecondaryExposure>,
    depth: usize,
) -> Check {
    if depth >= MAX_NESTING_DEPTH {
        return Err(Unsupported);
    }

    let result = match ctx.snapshot.values.get(SpecKind::Gate, name) {
        Some(spec) => evaluate_spec(ctx, spec, depth + 1),
        None => SpecEvaluation::default(),
    };
    if result.unsupported {
        return Err(Unsupported);
    }

    exposures.extend(result.secondary_exposures);
    if !name.starts_with(SEGMENT_PREFIX) {
        exposures.push(SecondaryExposure {
            gate: name.to_owned(),
            gate_value: result.value.to_string(),
            rule_id: result.rule_id,
        });
    }
    Ok(result.value)
}

fn environment_value(environment: Option<&str>, field: &str) -> Option<Value> {
    if field.eq_ignore_ascii_case("tier") {
        environment.map(|tier| Value::String(tier.to_owned()))
    } else {
        None
    }
}

fn user_bucket(user: &User, condition: &Condition) -> u64 {
    let salt = condition
        .additional_values
        .as_ref()
        .and_then(|values| values.get("salt"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let unit_id = user.unit_id(&condition.id_type).unwrap_or_default();
    Sha256Sharder.get_shard(format!("{salt}.{unit_id}"), 1000)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Gt,
    Gte,
    Lt,
    Lte,
    VersionGt,
    VersionGte,
    VersionLt,
    VersionLte,
    VersionEq,
    VersionNeq,
    Any,
    None,
    AnyCaseSensitive,
    NoneCaseSensitive,
    StrStartsWithAny,
    StrEndsWithAny,
    StrContainsAny,
    StrContainsNone,
    StrMatches,
    Before,
    After,
    On,
    Eq,
    Neq,
    InSegmentList,
    NotInSegmentList,
    ArrayContainsAny,
    ArrayContainsNone,
    ArrayContainsAll,
    NotArrayContainsAll,
}

impl Operator {
    fn parse(operator: &str) -> Option<Operator> {
        Some(match operator {
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "version_gt" => Self::VersionGt,
            "version_gte" => Self::VersionGte,
            "version_lt" => Self::VersionLt,
            "version_lte" => Self::VersionLte,
            "version_eq" => Self::VersionEq,
            "version_neq" => Self::VersionNeq,
            "any" => Self::Any,
            "none" => Self::None,
            "any_case_sensitive" => Self::AnyCaseSensitive,
            "none_case_sensitive" => Self::NoneCaseSensitive,
            "str_starts_with_any" => Self::StrStartsWithAny,
            "str_ends_with_any" => Self::StrEndsWithAny,
            "str_contains_any" => Self::StrContainsAny,
            "str_contains_none" => Self::StrContainsNone,
            "str_matches" => Self::StrMatches,
            "before" => Self::Before,
            "after" => Self::After,
            "on" => Self::On,
            "eq" => Self::Eq,
            "neq" => Self::Neq,
            "in_segment_list" => Self::InSegmentList,
            "not_in_segment_list" => Self::NotInSegmentList,
            "array_contains_any" => Self::ArrayContainsAny,
            "array_contains_none" => Self::ArrayContainsNone,
            "array_contains_all" => Self::ArrayContainsAll,
            "not_array_contains_all" => Self::NotArrayContainsAll,
            _ => return None,
        })
    }

    /// Applying `Operator` to the values. Returns `false` if the operator cannot be applied or
    /// there's a misconfiguration.
    fn eval(self, value: Option<&Value>, target: Option<&Value>, id_lists: &IdListStore) -> bool {
        self.try_eval(value, target, id_lists).unwrap_or(false)
    }

    /// Try applying `Operator` to the values, returning `None` if the operator cannot be applied.
    fn try_eval(
        self,
        value: Option<&Value>,
        target: Option<&Value>,
        id_lists: &IdListStore,
    ) -> Option<bool> {
        match self {
            Self::Gt | Self::Gte | Self::Lt | Self::Lte => {
                let value = as_number(value?)?;
                let target = as_number(target?)?;
                Some(match self {
                    Self::Gt => value > target,
                    Self::Gte => value >= target,
                    Self::Lt => value < target,
                    _ => value <= target,
                })
            }

            Self::VersionGt
            | Self::VersionGte
            | Self::VersionLt
            | Self::VersionLte
            | Self::VersionEq
            | Self::VersionNeq => {
                let value = as_version(value?)?;
                let target = as_version(target?)?;
                Some(match self {
                    Self::VersionGt => value > target,
                    Self::VersionGte => value >= target,
                    Self::VersionLt => value < target,
                    Self::VersionLte => value <= target,
                    Self::VersionEq => value == target,
                    _ => value != target,
                })
            }

            Self::Any | Self::None => {
                let any = any_string(value, target?, false, |v, t| v == t);
                Some(if self == Self::Any { any } else { !any })
            }
            Self::AnyCaseSensitive | Self::NoneCaseSensitive => {
                let any = any_string(value, target?, true, |v, t| v == t);
                Some(if self == Self::AnyCaseSensitive {
                    any
                } else {
                    !any
                })
            }
            Self::StrStartsWithAny => {
                Some(any_string(value, target?, false, |v, t| v.starts_with(t)))
            }
            Self::StrEndsWithAny => Some(any_string(value, target?, false, |v, t| v.ends_with(t))),
            Self::StrContainsAny => Some(any_string(value, target?, false, |v, t| v.contains(t))),
            Self::StrContainsNone => Some(!any_string(value, target?, false, |v, t| v.contains(t))),

            Self::StrMatches => {
                let value = as_string(value?)?;
                let regex = Regex::new(target?.as_str()?).ok()?;
                Some(regex.is_match(&value))
            }

            Self::Before | Self::After | Self::On => {
                let value = as_timestamp(value?)?;
                let target = as_timestamp(target?)?;
                Some(match self {
                    Self::Before => value < target,
                    Self::After => value > target,
                    _ => {
                        let day = |ms: i64| {
                            Utc.timestamp_millis_opt(ms)
                                .single()
                                .map(|t| t.date_naive())
                        };
                        day(value)? == day(target)?
                    }
                })
            }

            Self::Eq => Some(value.unwrap_or(&Value::Null) == target.unwrap_or(&Value::Null)),
            Self::Neq => Some(value.unwrap_or(&Value::Null) != target.unwrap_or(&Value::Null)),

            Self::InSegmentList | Self::NotInSegmentList => {
                let list_name = target?.as_str()?;
                let id = as_string(value?)?;
                let in_list = id_lists.contains(list_name, &id_list_hash(&id));
                Some(if self == Self::InSegmentList {
                    in_list
                } else {
                    !in_list
                })
            }

            Self::ArrayContainsAny
            | Self::ArrayContainsNone
            | Self::ArrayContainsAll
            | Self::NotArrayContainsAll => {
                let values = value?.as_array()?;
                let targets = target?.as_array()?;
                let contains = |t: &Value| values.iter().any(|v| loosely_equal(v, t));
                Some(match self {
                    Self::ArrayContainsAny => targets.iter().any(contains),
                    Self::ArrayContainsNone => !targets.iter().any(contains),
                    Self::ArrayContainsAll => targets.iter().all(contains),
                    _ => !targets.iter().all(contains),
                })
            }
        }
    }
}

/// String form used for comparisons. Arrays and objects have none.
fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Versions are compared on up to three numeric parts. Pre-release suffixes are ignored and
/// missing parts count as zero: `"1.2-beta"` is `1.2.0`.
fn as_version(value: &Value) -> Option<Version> {
    let raw = as_string(value)?;
    let core = raw.split('-').next().unwrap_or_default();
    let mut parts = core.split('.').map(|part| part.trim().parse::<u64>().ok());
    let major = parts.next().flatten()?;
    let minor = parts.next().unwrap_or(Some(0))?;
    let patch = parts.next().unwrap_or(Some(0))?;
    if parts.next().is_some() {
        return None;
    }
    Some(Version::new(major, minor, patch))
}

/// Milliseconds since epoch from an integer or a date string.
fn as_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            if let Ok(ms) = s.parse::<i64>() {
                return Some(ms);
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp_millis());
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.and_utc().timestamp_millis())
        }
        _ => None,
    }
}

/// Whether `check(value, element)` holds for any element of the `target` array. A missing value
/// compares as the empty string.
fn any_string(
    value: Option<&Value>,
    target: &Value,
    case_sensitive: bool,
    check: impl Fn(&str, &str) -> bool,
) -> bool {
    let Some(targets) = target.as_array() else {
        return false;
    };
    let Some(value) = value.map_or(Some(String::new()), as_string) else {
        return false;
    };
    let fold = |s: String| if case_sensitive { s } else { s.to_lowercase() };
    let value = fold(value);

    targets
        .iter()
        .filter_map(as_string)
        .any(|t| check(&value, &fold(t)))
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    a == b || matches!((as_string(a), as_string(b)), (Some(a), Some(b)) if a == b)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{spec_store::SpecsSource, specs::SpecsResponse};

    fn snapshot(payload: Value) -> SpecSnapshot {
        let values = SpecsResponse::from_slice(payload.to_string().as_bytes()).unwrap();
        SpecSnapshot::new(values, SpecsSource::Network)
    }

    fn gate(rules: Value) -> Value {
        json!({"salt": "gate_salt", "defaultValue": false, "enabled": true, "rules": rules})
    }

    fn rule(id: &str, conditions: Value) -> Value {
        json!({"id": id, "passPercentage": 100.0, "returnValue": true, "conditions": conditions})
    }

    fn run(snapshot: &SpecSnapshot, user: &User, kind: SpecKind, name: &str) -> SpecEvaluation {
        let id_lists = IdListStore::default();
        run_with(snapshot, user, kind, name, &id_lists, None)
    }

    fn run_with(
        snapshot: &SpecSnapshot,
        user: &User,
        kind: SpecKind,
        name: &str,
        id_lists: &IdListStore,
        environment: Option<&str>,
    ) -> SpecEvaluation {
        let global_custom = HashMap::new();
        let ctx = EvaluationContext {
            user,
            snapshot,
            id_lists,
            environment,
            global_custom: &global_custom,
        };
        let spec = snapshot.values.get(kind, name).unwrap();
        DefaultRuleEvaluator.evaluate(&ctx, spec)
    }

    fn condition_gate(condition: Value) -> SpecSnapshot {
        snapshot(json!({
            "feature_gates": {"g": gate(json!([rule("r1", json!([condition]))]))},
            "time": 1,
        }))
    }

    fn passes(condition: Value, user: &User) -> bool {
        run(&condition_gate(condition), user, SpecKind::Gate, "g").value
    }

    #[test]
    fn public_rule_passes() {
        let snapshot = condition_gate(json!({"type": "public"}));

        let result = run(&snapshot, &User::with_user_id("u1"), SpecKind::Gate, "g");

        assert!(result.value);
        assert_eq!(result.rule_id, "r1");
        assert!(!result.unsupported);
    }

    #[test]
    fn no_matching_rule_returns_default() {
        let user = User::with_user_id("u1").email("a@other.com");
        let snapshot = condition_gate(json!({
            "type": "user_field", "field": "email", "operator": "str_ends_with_any",
            "targetValue": ["@statsig.com"],
        }));

        let result = run(&snapshot, &user, SpecKind::Gate, "g");

        assert!(!result.value);
        assert_eq!(result.rule_id, "default");
    }

    #[test]
    fn disabled_spec_uses_disabled_rule() {
        let snapshot = snapshot(json!({
            "feature_gates": {"g": {
                "salt": "s", "defaultValue": false, "enabled": false,
                "rules": [rule("r1", json!([{"type": "public"}]))],
            }},
        }));

        let result = run(&snapshot, &User::with_user_id("u1"), SpecKind::Gate, "g");

        assert!(!result.value);
        assert_eq!(result.rule_id, "disabled");
    }

    #[test]
    fn unknown_condition_is_unsupported() {
        let snapshot = condition_gate(json!({"type": "quantum_field"}));

        let result = run(&snapshot, &User::with_user_id("u1"), SpecKind::Gate, "g");

        assert!(result.unsupported);
        assert!(!result.value);
    }

    #[test]
    fn unknown_operator_is_unsupported() {
        let snapshot = condition_gate(json!({
            "type": "user_field", "field": "email", "operator": "sounds_like",
            "targetValue": ["x"],
        }));

        assert!(run(&snapshot, &User::with_user_id("u1"), SpecKind::Gate, "g").unsupported);
    }

    #[test]
    fn condition_map_lookup() {
        let snapshot = snapshot(json!({
            "feature_gates": {"g": gate(json!([rule("r1", json!(["c1"]))]))},
            "condition_map": {"c1": {"type": "public"}},
        }));

        assert!(run(&snapshot, &User::with_user_id("u1"), SpecKind::Gate, "g").value);
    }

    #[test]
    fn string_operators_are_case_insensitive() {
        let user = User::with_user_id("u1").email("Someone@Statsig.com");
        let cond = |operator: &str, target: Value| {
            json!({"type": "user_field", "field": "email", "operator": operator, "targetValue": target})
        };

        assert!(passes(cond("any", json!(["someone@statsig.com"])), &user));
        assert!(!passes(cond("none", json!(["someone@statsig.com"])), &user));
        assert!(!passes(cond("any_case_sensitive", json!(["someone@statsig.com"])), &user));
        assert!(passes(cond("none_case_sensitive", json!(["someone@statsig.com"])), &user));
        assert!(passes(cond("str_starts_with_any", json!(["SOME"])), &user));
        assert!(passes(cond("str_ends_with_any", json!(["@statsig.com"])), &user));
        assert!(passes(cond("str_contains_any", json!(["@stat"])), &user));
        assert!(!passes(cond("str_contains_none", json!(["@stat"])), &user));
        assert!(passes(cond("str_matches", json!("^Some.*\\.com$")), &user));
    }

    #[test]
    fn missing_field_compares_as_empty_string() {
        let user = User::with_user_id("u1");
        let cond = |operator: &str| {
            json!({"type": "user_field", "field": "email", "operator": operator, "targetValue": ["a"]})
        };

        assert!(!passes(cond("any"), &user));
        assert!(passes(cond("none"), &user));
        assert!(passes(cond("str_contains_none"), &user));
    }

    #[test]
    fn numeric_operators() {
        let user = User::with_user_id("u1").custom_field("age", 30).custom_field("score", "7.5");
        let cond = |field: &str, operator: &str, target: Value| {
            json!({"type": "user_field", "field": field, "operator": operator, "targetValue": target})
        };

        assert!(passes(cond("age", "gt", json!(18)), &user));
        assert!(passes(cond("age", "gte", json!(30)), &user));
        assert!(!passes(cond("age", "lt", json!(30)), &user));
        assert!(passes(cond("score", "lte", json!("7.5")), &user));
        assert!(!passes(cond("missing", "gt", json!(0)), &user));
    }

    #[test]
    fn version_operators() {
        let user = User::with_user_id("u1").app_version("1.10-beta");
        let cond = |operator: &str, target: &str| {
            json!({"type": "user_field", "field": "appVersion", "operator": operator, "targetValue": target})
        };

        assert!(passes(cond("version_gt", "1.9.9"), &user));
        assert!(passes(cond("version_eq", "1.10.0"), &user));
        assert!(passes(cond("version_neq", "1.10.1"), &user));
        assert!(passes(cond("version_lt", "2"), &user));
        assert!(!passes(cond("version_lte", "1.2"), &user));
    }

    #[test]
    fn time_operators() {
        let user = User::with_user_id("u1").custom_field("joined", "2024-03-01T10:00:00Z");
        let cond = |operator: &str, target: Value| {
            json!({"type": "user_field", "field": "joined", "operator": operator, "targetValue": target})
        };

        assert!(passes(cond("before", json!("2024-03-02 00:00:00")), &user));
        assert!(passes(cond("after", json!(1_700_000_000_000i64)), &user));
        assert!(passes(cond("on", json!("2024-03-01T23:59:00Z")), &user));
        assert!(!passes(cond("on", json!("2024-03-02T00:00:00Z")), &user));
    }

    #[test]
    fn current_time_condition() {
        let after = json!({"type": "current_time", "operator": "after", "targetValue": 1_000});
        let before = json!({"type": "current_time", "operator": "before", "targetValue": 1_000});

        assert!(passes(after, &User::with_user_id("u1")));
        assert!(!passes(before, &User::with_user_id("u1")));
    }

    #[test]
    fn array_operators() {
        let user = User::with_user_id("u1").custom_field("tags", json!(["a", "b", 3]));
        let cond = |operator: &str, target: Value| {
            json!({"type": "user_field", "field": "tags", "operator": operator, "targetValue": target})
        };

        assert!(passes(cond("array_contains_any", json!(["z", "b"])), &user));
        assert!(passes(cond("array_contains_none", json!(["z"])), &user));
        assert!(passes(cond("array_contains_all", json!(["a", "3"])), &user));
        assert!(passes(cond("not_array_contains_all", json!(["a", "z"])), &user));
    }

    #[test]
    fn eq_and_neq() {
        let user = User::with_user_id("u1").custom_field("plan", "pro");
        let cond = |operator: &str, target: Value| {
            json!({"type": "user_field", "field": "plan", "operator": operator, "targetValue": target})
        };

        assert!(passes(cond("eq", json!("pro")), &user));
        assert!(passes(cond("neq", json!("free")), &user));
        assert!(passes(
            json!({"type": "user_field", "field": "nothing", "operator": "eq", "targetValue": null}),
            &user
        ));
    }

    #[test]
    fn unit_id_and_environment_conditions() {
        let user = User::with_user_id("u1").custom_id("companyID", "acme");
        let unit = json!({
            "type": "unit_id", "idType": "companyID", "operator": "any", "targetValue": ["acme"],
        });
        assert!(passes(unit, &user));

        let env = condition_gate(json!({
            "type": "environment_field", "field": "tier", "operator": "any",
            "targetValue": ["staging"],
        }));
        let id_lists = IdListStore::default();
        assert!(run_with(&env, &user, SpecKind::Gate, "g", &id_lists, Some("staging")).value);
        assert!(!run_with(&env, &user, SpecKind::Gate, "g", &id_lists, Some("production")).value);
    }

    #[test]
    fn segment_list_membership() {
        let id_lists = IdListStore::default();
        id_lists.insert_ids("beta_users", [id_list_hash("u1")]);
        let snapshot = condition_gate(json!({
            "type": "unit_id", "idType": "userID", "operator": "in_segment_list",
            "targetValue": "beta_users",
        }));

        let check = |id: &str| {
            run_with(
                &snapshot,
                &User::with_user_id(id),
                SpecKind::Gate,
                "g",
                &id_lists,
                None,
            )
        };
        let listed = check("u1");
        let unlisted = check("u2");

        assert!(listed.value);
        assert!(!unlisted.value);
    }

    #[test]
    fn nested_gates_record_secondary_exposures() {
        let snapshot = snapshot(json!({
            "feature_gates": {
                "outer": gate(json!([rule("outer_rule", json!([
                    {"type": "pass_gate", "targetValue": "inner"},
                    {"type": "fail_gate", "targetValue": "segment:internal"},
                ]))])),
                "inner": gate(json!([rule("inner_rule", json!([{"type": "public"}]))])),
                "segment:internal": gate(json!([])),
            },
        }));

        let result = run(&snapshot, &User::with_user_id("u1"), SpecKind::Gate, "outer");

        assert!(result.value);
        assert_eq!(
            result.secondary_exposures,
            vec![SecondaryExposure {
                gate: "inner".to_owned(),
                gate_value: "true".to_owned(),
                rule_id: "inner_rule".to_owned(),
            }]
        );
    }

    #[test]
    fn self_referencing_gate_is_unsupported() {
        let snapshot = snapshot(json!({
            "feature_gates": {
                "loop": gate(json!([rule("r", json!([{"type": "pass_gate", "targetValue": "loop"}]))])),
            },
        }));

        assert!(run(&snapshot, &User::with_user_id("u1"), SpecKind::Gate, "loop").unsupported);
    }

    #[test]
    fn partial_rollout_is_deterministic_and_proportional() {
        let snapshot = snapshot(json!({
            "feature_gates": {"g": {
                "salt": "s", "defaultValue": false,
                "rules": [{"id": "half", "passPercentage": 50.0, "returnValue": true,
                           "conditions": [{"type": "public"}]}],
            }},
        }));

        let passing = (0..1000)
            .filter(|i| {
                let user = User::with_user_id(format!("user-{i}"));
                run(&snapshot, &user, SpecKind::Gate, "g").value
            })
            .count();
        let first = run(&snapshot, &User::with_user_id("user-1"), SpecKind::Gate, "g");
        let again = run(&snapshot, &User::with_user_id("user-1"), SpecKind::Gate, "g");

        assert!((400..=600).contains(&passing), "{passing}");
        assert_eq!(first, again);
        // Failing the rollout still matches the rule.
        assert_eq!(first.rule_id, "half");
    }

    #[test]
    fn user_bucket_condition() {
        let cond = json!({
            "type": "user_bucket", "operator": "lt", "targetValue": 1000,
            "additionalValues": {"salt": "bucket_salt"},
        });

        assert!(passes(cond, &User::with_user_id("u1")));
    }

    #[test]
    fn dynamic_config_returns_rule_value() {
        let snapshot = snapshot(json!({
            "dynamic_configs": {"c": {
                "salt": "s", "defaultValue": {"color": "red"}, "entity": "dynamic_config",
                "rules": [{"id": "r", "passPercentage": 100.0, "returnValue": {"color": "blue"},
                           "conditions": [{"type": "user_field", "field": "country",
                                           "operator": "any", "targetValue": ["NZ"]}]}],
            }},
        }));

        let in_country = |country: &str| {
            let user = User::with_user_id("u1").country(country);
            run(&snapshot, &user, SpecKind::DynamicConfig, "c")
        };
        let matched = in_country("NZ");
        let other = in_country("US");

        assert_eq!(matched.json_value, Some(json!({"color": "blue"})));
        assert_eq!(other.json_value, Some(json!({"color": "red"})));
        assert_eq!(other.rule_id, "default");
    }

    #[test]
    fn layer_delegates_to_experiment() {
        let snapshot = snapshot(json!({
            "feature_gates": {
                "holdout": gate(json!([rule("h", json!([{"type": "public"}]))])),
            },
            "dynamic_configs": {"exp": {
                "salt": "e", "defaultValue": {}, "entity": "experiment",
                "explicitParameters": ["button"],
                "rules": [{"id": "exp_rule", "passPercentage": 100.0, "groupName": "Test",
                           "isExperimentGroup": true, "returnValue": {"button": "green"},
                           "conditions": [{"type": "pass_gate", "targetValue": "holdout"}]}],
            }},
            "layer_configs": {"layer": {
                "salt": "l", "defaultValue": {"button": "grey", "title": "hi"}, "entity": "layer",
                "rules": [{"id": "alloc", "passPercentage": 100.0, "returnValue": {},
                           "configDelegate": "exp",
                           "conditions": [{"type": "fail_gate", "targetValue": "holdout2"}]}],
            }},
        }));

        let result = run(&snapshot, &User::with_user_id("u1"), SpecKind::Layer, "layer");

        assert_eq!(result.config_delegate.as_deref(), Some("exp"));
        assert_eq!(result.rule_id, "exp_rule");
        assert_eq!(result.group_name.as_deref(), Some("Test"));
        assert!(result.is_experiment_group);
        assert_eq!(result.explicit_parameters, Some(vec!["button".to_owned()]));
        assert_eq!(result.json_value, Some(json!({"button": "green"})));
        let gates: Vec<_> = result.secondary_exposures.iter().map(|e| e.gate.as_str()).collect();
        assert_eq!(gates, ["holdout2", "holdout"]);
        let undelegated: Vec<_> = result
            .undelegated_secondary_exposures
            .unwrap()
            .into_iter()
            .map(|e| e.gate)
            .collect();
        assert_eq!(undelegated, ["holdout2"]);
    }
}
