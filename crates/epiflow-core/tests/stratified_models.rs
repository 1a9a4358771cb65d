use epiflow_core::{
    Condition, EvaluationError, FlowKind, FlowRef, LookupFn, ModelBuilder, ModelError, NewFlow, Parameters, RateSpec,
    Stratification,
};
use std::collections::HashMap;

fn sir(beta_rate: &str) -> ModelBuilder {
    let mut builder = ModelBuilder::new("sir");
    builder
        .add_compartments([("S", 990.0), ("I", 10.0), ("R", 0.0)])
        .unwrap();
    let s = builder.compartment("S").unwrap();
    let i = builder.compartment("I").unwrap();
    builder
        .add_flow(NewFlow::transfer(s, i, RateSpec::parse(beta_rate).unwrap()).named("infection"))
        .unwrap();
    builder.add_standard_flow("gamma", "I", "R").unwrap();
    builder
}

#[test]
fn test_two_compartment_derivative() {
    let mut builder = ModelBuilder::new("si");
    builder.add_compartments([("S", 990.0), ("I", 10.0)]).unwrap();
    builder.add_transfer("S", "I", "beta * I").unwrap();
    let model = builder.compile().unwrap();

    let beta = 0.0002;
    let params = Parameters::new().with("beta", beta);
    let derivative = model.evaluate(0.0, model.initial_state(), &params).unwrap();
    assert!((derivative[0] + beta * 10.0 * 990.0).abs() < 1e-12);
    assert!((derivative[1] - beta * 10.0 * 990.0).abs() < 1e-12);
}

#[test]
fn test_stratified_index_and_populations() {
    let mut builder = sir("beta * I");
    builder
        .stratify(Stratification::with_strata("severity", [("mild", 0.8), ("severe", 0.2)]).only(["I"]))
        .unwrap();
    let model = builder.compile().unwrap();

    let names: Vec<&str> = model.index().names().iter().map(String::as_str).collect();
    assert_eq!(names, vec!["S", "R", "I_mild", "I_severe"]);
    assert_eq!(model.initial_state(), &[990.0, 0.0, 8.0, 2.0]);
}

#[test]
fn test_stratification_preserves_aggregate_dynamics() {
    let params = Parameters::new().with("beta", 0.0003).with("gamma", 0.1);
    let plain = sir("beta * I").compile().unwrap();
    let plain_derivative = plain.evaluate(0.0, plain.initial_state(), &params).unwrap();

    let mut builder = sir("beta * I");
    builder
        .stratify(Stratification::with_strata("age", [("young", 0.3), ("old", 0.7)]))
        .unwrap();
    let stratified = builder.compile().unwrap();
    let derivative = stratified
        .evaluate(0.0, stratified.initial_state(), &params)
        .unwrap();

    let by_base = stratified.index().aggregate_by_base(&derivative);
    let expected = [("S", plain_derivative[0]), ("I", plain_derivative[1]), ("R", plain_derivative[2])];
    for ((base, value), (expected_base, expected_value)) in by_base.iter().zip(expected) {
        assert_eq!(base, expected_base);
        assert!((value - expected_value).abs() < 1e-9, "{}: {} vs {}", base, value, expected_value);
    }
}

#[test]
fn test_transfer_only_models_conserve_mass() {
    let mut builder = sir("beta * I / N");
    builder
        .stratify(Stratification::with_strata("age", [("young", 0.5), ("old", 0.5)]).transition(
            "young",
            "old",
            RateSpec::parameter("ageing"),
        ))
        .unwrap();
    builder
        .stratify(
            Stratification::with_strata("strain", [("a", 0.9), ("b", 0.1)])
                .only(["I"])
                .multiply(FlowRef::Name("I_to_R".to_string()), "b", 2.0),
        )
        .unwrap();
    let model = builder.compile().unwrap();

    let params = Parameters::new()
        .with("beta", 0.4)
        .with("gamma", 0.1)
        .with("ageing", 0.01);
    for t in [0.0, 3.5, 10.0] {
        let derivative = model.evaluate(t, model.initial_state(), &params).unwrap();
        assert!(derivative.iter().sum::<f64>().abs() < 1e-9);
    }
}

#[test]
fn test_compiles_are_deterministic() {
    let build = || {
        let mut builder = sir("beta * I");
        builder
            .stratify(Stratification::with_strata("age", [("young", 0.5), ("old", 0.5)]))
            .unwrap();
        builder
            .stratify(Stratification::with_strata("vaccine", [("no", 0.6), ("yes", 0.4)]).only(["S"]))
            .unwrap();
        builder.compile().unwrap()
    };
    let first = build();
    let second = build();
    assert_eq!(first.index(), second.index());

    let params = Parameters::new().with("beta", 0.001).with("gamma", 0.2);
    let a = first.evaluate(2.0, first.initial_state(), &params).unwrap();
    let b = second.evaluate(2.0, second.initial_state(), &params).unwrap();
    assert_eq!(a, b);
    // Evaluation is pure: calling again gives the same answer.
    assert_eq!(a, first.evaluate(2.0, first.initial_state(), &params).unwrap());
}

#[test]
fn test_cross_product_only_on_reachable_compartments() {
    let mut builder = sir("beta * I");
    builder
        .stratify(Stratification::with_strata("age", [("young", 0.5), ("old", 0.5)]).only(["S", "I"]))
        .unwrap();
    builder
        .stratify(Stratification::with_strata("severity", [("mild", 0.5), ("severe", 0.5)]).only(["I"]))
        .unwrap();

    let index = builder.index();
    assert_eq!(index.len(), 2 + 4 + 1);
    assert_eq!(index.by_base("R").len(), 1);
    assert_eq!(index.select(&[("age", "old"), ("severity", "mild")]).len(), 1);
    assert!(index.select(&[("severity", "mild")]).iter().all(|p| index.get(*p).unwrap().base == "I"));
}

#[test]
fn test_unknown_parameter_surfaces_at_evaluation() {
    let mut builder = sir("beta * I");
    builder.add_death_flow("undeclared_rate", "R").unwrap();
    let model = builder.compile().unwrap();

    let params = Parameters::new().with("beta", 0.1).with("gamma", 0.1);
    match model.evaluate(0.0, model.initial_state(), &params) {
        Err(EvaluationError::UnknownParameter { parameter, flow_name, .. }) => {
            assert_eq!(parameter, "undeclared_rate");
            assert_eq!(flow_name, "exit_from_R");
        }
        other => panic!("expected unknown parameter, got {:?}", other),
    }
}

#[test]
fn test_parameter_sources() {
    let model = sir("beta * I").compile().unwrap();
    let map: HashMap<String, f64> = [("beta".to_string(), 0.001), ("gamma".to_string(), 0.1)]
        .into_iter()
        .collect();
    let closure = LookupFn(|name: &str, t: f64| match name {
        "beta" => Some(0.001 * (1.0 + t)),
        "gamma" => Some(0.1),
        _ => None,
    });

    let from_map = model.evaluate(0.0, model.initial_state(), &map).unwrap();
    let from_closure = model.evaluate(0.0, model.initial_state(), &closure).unwrap();
    assert_eq!(from_map, from_closure);
    let later = model.evaluate(1.0, model.initial_state(), &closure).unwrap();
    assert!((later[0] - 2.0 * from_map[0]).abs() < 1e-12);
}

#[test]
fn test_restricted_flow_only_in_matching_stratum() {
    let mut builder = sir("beta * I");
    let r = builder.compartment("R").unwrap();
    let s = builder.compartment("S").unwrap();
    builder
        .add_flow(
            NewFlow::transfer(r, s, RateSpec::parameter("waning"))
                .named("waning")
                .restricted(Condition::only("age", "old")),
        )
        .unwrap();
    builder
        .stratify(Stratification::with_strata("age", [("young", 0.4), ("old", 0.6)]))
        .unwrap();

    let graph = builder.graph();
    let waning: Vec<_> = graph.edges.iter().filter(|e| e.name == "waning").collect();
    assert_eq!(waning.len(), 1);
    assert_eq!(waning[0].from, vec!["R_old"]);
    assert_eq!(waning[0].to, vec!["S_old"]);
    assert_eq!(waning[0].kind, FlowKind::Transfer);
}

#[test]
fn test_failed_stratification_is_transactional() {
    let mut builder = sir("beta * I");
    let before = builder.graph();

    let result = builder.stratify(
        Stratification::with_strata("age", [("young", 0.5), ("old", 0.5)])
            .multiply(FlowRef::Name("infection".to_string()), "old", 2.0)
            .override_rate(FlowRef::Name("infection".to_string()), "old", 0.1),
    );
    assert!(matches!(result, Err(ModelError::AmbiguousAdjustment { .. })));
    assert_eq!(builder.graph(), before);
    assert!(builder.compartment("S").is_ok());
}
