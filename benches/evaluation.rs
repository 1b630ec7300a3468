use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;

use statsig_core::{
    DefaultRuleEvaluator, EvaluationContext, IdListStore, RuleEvaluator, SpecKind, SpecSnapshot,
    SpecsResponse, SpecsSource, Statsig, StatsigOptions, User,
};

fn specs() -> String {
    json!({
        "feature_gates": {
            "public": {"salt": "p", "defaultValue": false, "rules": [
                {"id": "all", "passPercentage": 100.0, "returnValue": true,
                 "conditions": [{"type": "public"}]}
            ]},
            "rollout": {"salt": "r", "defaultValue": false, "rules": [
                {"id": "us_half", "passPercentage": 50.0, "returnValue": true,
                 "conditions": [
                     {"type": "user_field", "field": "country", "operator": "any",
                      "targetValue": ["US", "CA"]},
                     {"type": "user_field", "field": "appVersion", "operator": "version_gte",
                      "targetValue": "1.2.0"},
                 ]}
            ]},
        },
        "dynamic_configs": {
            "exp": {"salt": "e", "defaultValue": {}, "entity": "experiment", "rules": [
                {"id": "holdout", "passPercentage": 100.0, "returnValue": {},
                 "conditions": [{"type": "fail_gate", "targetValue": "rollout"}]},
                {"id": "test", "groupName": "Test", "passPercentage": 50.0,
                 "isExperimentGroup": true, "returnValue": {"color": "green"},
                 "conditions": [{"type": "user_bucket", "operator": "lt", "targetValue": 500,
                                 "additionalValues": {"salt": "b"}}]},
            ]},
        },
        "layer_configs": {},
        "time": 1000,
    })
    .to_string()
}

fn criterion_benchmark(c: &mut Criterion) {
    let values = SpecsResponse::from_slice(specs().as_bytes()).unwrap();
    let snapshot = SpecSnapshot::new(values, SpecsSource::Bootstrap);
    let id_lists = IdListStore::default();
    let global_custom = HashMap::new();
    let user = User::with_user_id("user-1").country("US").app_version("1.4.2");

    {
        let mut group = c.benchmark_group("rule-evaluator");
        group.throughput(Throughput::Elements(1));
        let ctx = EvaluationContext {
            user: &user,
            snapshot: &snapshot,
            id_lists: &id_lists,
            environment: None,
            global_custom: &global_custom,
        };
        for (kind, name) in [
            (SpecKind::Gate, "public"),
            (SpecKind::Gate, "rollout"),
            (SpecKind::Experiment, "exp"),
        ] {
            let spec = snapshot.values.get(kind, name).unwrap();
            group.bench_function(name, |b| {
                b.iter(|| DefaultRuleEvaluator.evaluate(black_box(&ctx), black_box(spec)))
            });
        }
        group.finish();
    }

    {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mut options = StatsigOptions::new();
        options
            .disable_network(true)
            .disable_all_logging(true)
            .bootstrap_values(specs());
        let statsig = Statsig::new("secret-key", options);
        runtime.block_on(statsig.initialize());

        let mut group = c.benchmark_group("statsig");
        group.throughput(Throughput::Elements(1));
        group.bench_function("check_gate", |b| {
            b.iter(|| statsig.check_gate(black_box(&user), black_box("rollout")))
        });
        group.bench_function("get_experiment", |b| {
            b.iter(|| statsig.get_experiment(black_box(&user), black_box("exp")))
        });
        group.finish();

        runtime.block_on(statsig.shutdown()).ok();
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
