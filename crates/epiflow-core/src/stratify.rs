//! The stratification engine.
//!
//! A pass splits eligible compartments into one child per stratum and
//! replicates every flow that touches them. The pass works on copies of the
//! registry and catalog, so a failing pass leaves the model untouched.

use std::collections::{BTreeMap, HashSet};

use log::{debug, warn};

use crate::balance::BalanceLedger;
use crate::catalog::FlowCatalog;
use crate::error::{ModelError, ModelResult};
use crate::rate::{Rate, RateSpec};
use crate::registry::CompartmentRegistry;
use crate::types::{
    Adjustment, AdjustmentKind, AppliedAdjustment, Compartment, CompartmentId, Endpoint, Flow, FlowKind, FlowRef,
    NewFlow, Stratification, PROPORTION_TOLERANCE,
};

/// Summary of a successful stratification pass.
#[derive(Clone, Debug, PartialEq)]
pub struct StratificationReport {
    pub stratification: String,
    /// Compartments split by the pass.
    pub compartments_split: usize,
    /// Flows retired and replicated.
    pub flows_replicated: usize,
    /// Replicates materialised in the catalog.
    pub replicates_added: usize,
    /// Replicates dropped because their restriction excluded them.
    pub replicates_restricted: usize,
    pub transitions_added: usize,
}

/// Apply `descriptor` to copies of `registry` and `catalog`.
pub(crate) fn stratify(
    registry: &CompartmentRegistry,
    catalog: &FlowCatalog,
    descriptor: &Stratification,
) -> ModelResult<(CompartmentRegistry, FlowCatalog, StratificationReport)> {
    validate(registry, catalog, descriptor)?;
    let normalised = normalise(descriptor);
    let descriptor = &normalised;
    let axis = descriptor.name.as_str();

    let eligible: Vec<CompartmentId> = registry
        .active()
        .filter(|(_, c)| descriptor.applies_to(&c.base))
        .map(|(id, _)| id)
        .collect();
    if eligible.is_empty() {
        warn!("stratification '{}' selects no compartments", axis);
    }
    for id in &eligible {
        let compartment = registry.get(*id)?;
        if compartment.is_stratified_by(axis) {
            return Err(ModelError::AlreadyStratified {
                compartment: compartment.name(),
                stratification: axis.to_string(),
            });
        }
    }

    let mut next_registry = registry.clone();
    let mut splits: BTreeMap<CompartmentId, Vec<(CompartmentId, f64)>> = BTreeMap::new();
    for parent in &eligible {
        let children = next_registry.expand(*parent, axis, &descriptor.strata)?;
        let shares = children
            .into_iter()
            .zip(descriptor.strata.iter().map(|s| s.proportion))
            .collect();
        splits.insert(*parent, shares);
    }

    let mut next_catalog = catalog.clone();
    let mut ledger = BalanceLedger::new(&splits);
    let mut used_rules = vec![false; descriptor.adjustments.len()];
    let mut report = StratificationReport {
        stratification: axis.to_string(),
        compartments_split: eligible.len(),
        flows_replicated: 0,
        replicates_added: 0,
        replicates_restricted: 0,
        transitions_added: 0,
    };

    let touched: Vec<Flow> = catalog
        .active()
        .filter(|f| f.endpoints().any(|e| splits.contains_key(&e.compartment)))
        .cloned()
        .collect();

    for flow in &touched {
        ledger.record_parent(flow);
        next_catalog.retire(flow.id);
        report.flows_replicated += 1;

        for (k, stratum) in descriptor.strata.iter().enumerate() {
            let sources: Vec<Endpoint> = flow
                .sources
                .iter()
                .map(|e| match splits.get(&e.compartment) {
                    Some(children) => Endpoint::weighted(children[k].0, e.weight),
                    None => Endpoint::weighted(e.compartment, e.weight * stratum.proportion),
                })
                .collect();
            let destinations: Vec<Endpoint> = flow
                .destinations
                .iter()
                .map(|e| match splits.get(&e.compartment) {
                    Some(children) => Endpoint::weighted(children[k].0, e.weight),
                    None => *e,
                })
                .collect();

            ledger.record_replicate(flow.kind, &sources, &destinations, stratum.proportion);

            if let Some(restriction) = &flow.restriction {
                let source_ids = identities(&sources, &next_registry)?;
                let destination_ids = identities(&destinations, &next_registry)?;
                if restriction.evaluate(&source_ids, &destination_ids) == Some(false) {
                    report.replicates_restricted += 1;
                    continue;
                }
            }

            let mut rate = flow.rate.clone();
            if flow.kind == FlowKind::Entry {
                rate = rate.scaled_by(RateSpec::Constant(stratum.proportion));
            }
            let mut adjustments = flow.adjustments.clone();
            if let Some((index, rule)) = matching_rule(&descriptor.adjustments, flow, &stratum.label, axis)? {
                used_rules[index] = true;
                let overridden = match &rule.kind {
                    AdjustmentKind::Multiply(factor) => {
                        rate = rate.scaled_by(factor.clone());
                        false
                    }
                    AdjustmentKind::Override(replacement) => {
                        if let Some(earlier) = flow.adjustments.first() {
                            return Err(ModelError::AmbiguousAdjustment {
                                stratification: axis.to_string(),
                                flow: flow.id,
                                flow_name: flow.name.clone(),
                                stratum: stratum.label.clone(),
                                reason: format!(
                                    "override would discard the adjustment already applied by stratification '{}'",
                                    earlier.stratification
                                ),
                            });
                        }
                        rate = Rate::new(replacement.clone());
                        true
                    }
                };
                adjustments.push(AppliedAdjustment {
                    stratification: axis.to_string(),
                    stratum: stratum.label.clone(),
                    overridden,
                });
            }

            next_catalog.add_replicate(flow, sources, destinations, rate, adjustments);
            report.replicates_added += 1;
        }
    }

    if let Some(index) = used_rules.iter().position(|used| !used) {
        let rule = &descriptor.adjustments[index];
        return Err(ModelError::UnmatchedAdjustment {
            stratification: axis.to_string(),
            flow: rule.flow.to_string(),
            stratum: rule.stratum.clone(),
        });
    }

    ledger.verify(axis, registry, &next_registry)?;

    for parent in &eligible {
        let parent_name = registry.get(*parent)?.name();
        let children = &splits[parent];
        for transition in &descriptor.transitions {
            let child_of = |label: &str| {
                descriptor
                    .strata
                    .iter()
                    .position(|s| s.label == label)
                    .map(|k| children[k].0)
                    .ok_or_else(|| ModelError::UnknownStratum {
                        stratification: axis.to_string(),
                        stratum: label.to_string(),
                        context: "a stratum transition".to_string(),
                    })
            };
            let name = transition
                .name
                .clone()
                .unwrap_or_else(|| format!("{}_{}_to_{}", axis, transition.from, transition.to));
            let new_flow = NewFlow::transfer(
                child_of(&transition.from)?,
                child_of(&transition.to)?,
                transition.rate.clone(),
            )
            .named(format!("{}_{}", name, parent_name));
            next_catalog.add_flow(new_flow, &next_registry)?;
            report.transitions_added += 1;
        }
    }

    debug!(
        "stratification '{}': split {} compartments, replicated {} flows into {} replicates ({} restricted), added {} transitions",
        axis,
        report.compartments_split,
        report.flows_replicated,
        report.replicates_added,
        report.replicates_restricted,
        report.transitions_added
    );

    Ok((next_registry, next_catalog, report))
}

fn validate(registry: &CompartmentRegistry, catalog: &FlowCatalog, descriptor: &Stratification) -> ModelResult<()> {
    let axis = descriptor.name.as_str();
    let invalid = |reason: String| ModelError::InvalidStratification {
        stratification: axis.to_string(),
        reason,
    };

    if axis.is_empty() {
        return Err(invalid("stratification name is empty".to_string()));
    }
    if descriptor.strata.is_empty() {
        return Err(invalid("no strata declared".to_string()));
    }
    let mut seen = HashSet::new();
    for stratum in &descriptor.strata {
        if stratum.label.is_empty() {
            return Err(invalid("empty stratum label".to_string()));
        }
        if !seen.insert(stratum.label.as_str()) {
            return Err(invalid(format!("duplicate stratum '{}'", stratum.label)));
        }
        if !stratum.proportion.is_finite() || stratum.proportion < 0.0 {
            return Err(invalid(format!(
                "stratum '{}' has invalid proportion {}",
                stratum.label, stratum.proportion
            )));
        }
    }
    let sum: f64 = descriptor.strata.iter().map(|s| s.proportion).sum();
    if (sum - 1.0).abs() > PROPORTION_TOLERANCE {
        return Err(ModelError::InvalidProportions {
            stratification: axis.to_string(),
            sum,
        });
    }

    if let Some(bases) = &descriptor.compartments {
        for base in bases {
            if registry.find_by_base(base).is_empty() {
                return Err(ModelError::UnknownCompartment(base.clone()));
            }
        }
    }

    let unknown = |stratum: &str, context: String| ModelError::UnknownStratum {
        stratification: axis.to_string(),
        stratum: stratum.to_string(),
        context,
    };
    for adjustment in &descriptor.adjustments {
        if !descriptor.has_stratum(&adjustment.stratum) {
            return Err(unknown(
                &adjustment.stratum,
                format!("the adjustment of flow {}", adjustment.flow),
            ));
        }
        if let FlowRef::Id(id) = &adjustment.flow {
            if catalog.get_any(*id).is_none() {
                return Err(ModelError::UnknownFlow(*id));
            }
        }
    }
    for transition in &descriptor.transitions {
        for label in [&transition.from, &transition.to] {
            if !descriptor.has_stratum(label) {
                return Err(unknown(label, "a stratum transition".to_string()));
            }
        }
        if transition.from == transition.to {
            return Err(invalid(format!("transition from '{}' to itself", transition.from)));
        }
    }
    for flow in catalog.active() {
        if let Some(restriction) = &flow.restriction {
            if let Some(rule) = restriction
                .references(axis)
                .find(|r| !descriptor.has_stratum(&r.stratum))
            {
                return Err(unknown(
                    &rule.stratum,
                    format!("the restriction of flow '{}'", flow.name),
                ));
            }
        }
    }
    Ok(())
}

/// The single adjustment rule addressing (`flow`, `stratum`), if any.
fn matching_rule<'a>(
    rules: &'a [Adjustment],
    flow: &Flow,
    stratum: &str,
    axis: &str,
) -> ModelResult<Option<(usize, &'a Adjustment)>> {
    let mut matches = rules.iter().enumerate().filter(|(_, rule)| {
        rule.stratum == stratum
            && match &rule.flow {
                FlowRef::Id(id) => flow.descends_from(*id),
                FlowRef::Name(name) => &flow.name == name,
            }
    });
    let Some((index, first)) = matches.next() else {
        return Ok(None);
    };
    if let Some((_, second)) = matches.next() {
        return Err(ModelError::AmbiguousAdjustment {
            stratification: axis.to_string(),
            flow: flow.id,
            flow_name: flow.name.clone(),
            stratum: stratum.to_string(),
            reason: format!("adjustments for {} and {} both apply", first.flow, second.flow),
        });
    }
    Ok(Some((index, first)))
}

fn identities<'a>(endpoints: &[Endpoint], registry: &'a CompartmentRegistry) -> ModelResult<Vec<&'a Compartment>> {
    endpoints.iter().map(|e| registry.get(e.compartment)).collect()
}

/// Rescale the proportions to sum to one. Validation accepts sums within
/// `PROPORTION_TOLERANCE`, the ledger is much stricter.
fn normalise(descriptor: &Stratification) -> Stratification {
    let sum: f64 = descriptor.strata.iter().map(|s| s.proportion).sum();
    let mut normalised = descriptor.clone();
    for stratum in &mut normalised.strata {
        stratum.proportion /= sum;
    }
    normalised
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Condition, FlowId};

    struct Fixture {
        registry: CompartmentRegistry,
        catalog: FlowCatalog,
        infection: FlowId,
        recovery: FlowId,
    }

    fn sir() -> Fixture {
        let mut registry = CompartmentRegistry::new();
        let s = registry.add_compartment("S", 990.0).unwrap();
        let i = registry.add_compartment("I", 10.0).unwrap();
        let r = registry.add_compartment("R", 0.0).unwrap();
        let mut catalog = FlowCatalog::new();
        let infection = catalog
            .add_flow(
                NewFlow::transfer(s, i, RateSpec::parse("beta * I").unwrap()).named("infection"),
                &registry,
            )
            .unwrap();
        let recovery = catalog
            .add_flow(NewFlow::transfer(i, r, RateSpec::parameter("gamma")).named("recovery"), &registry)
            .unwrap();
        Fixture {
            registry,
            catalog,
            infection,
            recovery,
        }
    }

    fn severity() -> Stratification {
        Stratification::with_strata("severity", [("mild", 0.8), ("severe", 0.2)]).only(["I"])
    }

    #[test]
    fn test_subset_stratification_replicates_touching_flows() {
        let fx = sir();
        let (registry, catalog, report) = stratify(&fx.registry, &fx.catalog, &severity()).unwrap();

        let names: Vec<String> = registry.active().map(|(_, c)| c.name()).collect();
        assert_eq!(names, vec!["S", "R", "I_mild", "I_severe"]);
        assert_eq!(report.compartments_split, 1);
        assert_eq!(report.flows_replicated, 2);
        assert_eq!(report.replicates_added, 4);
        assert_eq!(catalog.len(), 4);

        let s = registry.find("S").unwrap();
        let infections: Vec<&Flow> = catalog.active().filter(|f| f.name == "infection").collect();
        assert_eq!(infections.len(), 2);
        assert_eq!(infections[0].sources, vec![Endpoint::weighted(s, 0.8)]);
        assert_eq!(infections[1].sources, vec![Endpoint::weighted(s, 0.2)]);
        assert!(infections.iter().all(|f| f.descends_from(fx.infection)));

        // The original is untouched.
        assert_eq!(fx.catalog.len(), 2);
        assert!(fx.registry.find("I").is_ok());
    }

    #[test]
    fn test_adjustments_multiply_and_override() {
        let fx = sir();
        let descriptor = severity()
            .multiply(FlowRef::Name("recovery".to_string()), "severe", 0.5)
            .override_rate(FlowRef::Id(fx.recovery), "mild", RateSpec::parameter("gamma_mild"));
        let (_, catalog, _) = stratify(&fx.registry, &fx.catalog, &descriptor).unwrap();

        let recoveries: Vec<&Flow> = catalog.active().filter(|f| f.name == "recovery").collect();
        assert_eq!(recoveries[0].rate, Rate::new(RateSpec::parameter("gamma_mild")));
        assert!(recoveries[0].adjustments[0].overridden);
        assert_eq!(
            recoveries[1].rate,
            Rate::new(RateSpec::parameter("gamma")).scaled_by(RateSpec::Constant(0.5))
        );
    }

    #[test]
    fn test_overlapping_rules_are_ambiguous() {
        let fx = sir();
        let descriptor = severity()
            .multiply(FlowRef::Name("recovery".to_string()), "severe", 0.5)
            .multiply(FlowRef::Id(fx.recovery), "severe", 2.0);
        assert!(matches!(
            stratify(&fx.registry, &fx.catalog, &descriptor),
            Err(ModelError::AmbiguousAdjustment { .. })
        ));
    }

    #[test]
    fn test_override_after_earlier_adjustment_is_ambiguous() {
        let fx = sir();
        let first = severity().multiply(FlowRef::Name("recovery".to_string()), "severe", 0.5);
        let (registry, catalog, _) = stratify(&fx.registry, &fx.catalog, &first).unwrap();

        let age = Stratification::with_strata("age", [("young", 0.5), ("old", 0.5)])
            .override_rate(FlowRef::Id(fx.recovery), "old", 0.1);
        assert!(matches!(
            stratify(&registry, &catalog, &age),
            Err(ModelError::AmbiguousAdjustment { .. })
        ));

        // Multiplying on top of an earlier layer composes.
        let age = Stratification::with_strata("age", [("young", 0.5), ("old", 0.5)])
            .multiply(FlowRef::Id(fx.recovery), "old", 3.0);
        assert!(stratify(&registry, &catalog, &age).is_ok());
    }

    #[test]
    fn test_unmatched_adjustment() {
        let fx = sir();
        let descriptor = severity().multiply(FlowRef::Name("vaccination".to_string()), "mild", 0.5);
        assert!(matches!(
            stratify(&fx.registry, &fx.catalog, &descriptor),
            Err(ModelError::UnmatchedAdjustment { .. })
        ));
    }

    #[test]
    fn test_descriptor_validation() {
        let fx = sir();
        let bad_sum = Stratification::with_strata("age", [("young", 0.5), ("old", 0.4)]);
        assert!(matches!(
            stratify(&fx.registry, &fx.catalog, &bad_sum),
            Err(ModelError::InvalidProportions { .. })
        ));

        let negative = Stratification::with_strata("age", [("young", 1.5), ("old", -0.5)]);
        assert!(matches!(
            stratify(&fx.registry, &fx.catalog, &negative),
            Err(ModelError::InvalidStratification { .. })
        ));

        let duplicate = Stratification::with_strata("age", [("young", 0.5), ("young", 0.5)]);
        assert!(stratify(&fx.registry, &fx.catalog, &duplicate).is_err());

        let empty = Stratification::new("age");
        assert!(stratify(&fx.registry, &fx.catalog, &empty).is_err());

        let unknown_stratum = severity().multiply(FlowRef::Name("recovery".to_string()), "critical", 2.0);
        assert!(matches!(
            stratify(&fx.registry, &fx.catalog, &unknown_stratum),
            Err(ModelError::UnknownStratum { .. })
        ));
    }

    #[test]
    fn test_same_axis_twice_is_rejected() {
        let fx = sir();
        let (registry, catalog, _) = stratify(&fx.registry, &fx.catalog, &severity()).unwrap();
        assert!(matches!(
            stratify(&registry, &catalog, &severity()),
            Err(ModelError::AlreadyStratified { .. })
        ));
    }

    #[test]
    fn test_restricted_replicates_are_not_materialised() {
        let mut registry = CompartmentRegistry::new();
        let s = registry.add_compartment("S", 100.0).unwrap();
        let mut catalog = FlowCatalog::new();
        catalog
            .add_flow(
                NewFlow::exit(s, RateSpec::parameter("mu")).restricted(Condition::only("age", "old")),
                &registry,
            )
            .unwrap();

        let age = Stratification::with_strata("age", [("young", 0.6), ("old", 0.4)]);
        let (registry, catalog, report) = stratify(&registry, &catalog, &age).unwrap();
        assert_eq!(report.replicates_restricted, 1);
        let flows: Vec<&Flow> = catalog.active().collect();
        assert_eq!(flows.len(), 1);
        assert_eq!(registry.get(flows[0].sources[0].compartment).unwrap().name(), "S_old");
    }

    #[test]
    fn test_transitions_and_entry_shares() {
        let mut registry = CompartmentRegistry::new();
        let s = registry.add_compartment("S", 100.0).unwrap();
        let mut catalog = FlowCatalog::new();
        catalog
            .add_flow(NewFlow::entry(s, RateSpec::parameter("births")), &registry)
            .unwrap();

        let age = Stratification::with_strata("age", [("young", 0.25), ("old", 0.75)]).transition(
            "young",
            "old",
            RateSpec::parameter("ageing"),
        );
        let (registry, catalog, report) = stratify(&registry, &catalog, &age).unwrap();
        assert_eq!(report.transitions_added, 1);

        let births: Vec<&Flow> = catalog.active().filter(|f| f.kind == FlowKind::Entry).collect();
        assert_eq!(births[0].rate.factors, vec![RateSpec::Constant(0.25)]);
        assert_eq!(births[1].rate.factors, vec![RateSpec::Constant(0.75)]);

        let ageing = catalog.active().find(|f| f.kind == FlowKind::Transfer).unwrap();
        assert_eq!(ageing.name, "age_young_to_old_S");
        assert_eq!(registry.get(ageing.sources[0].compartment).unwrap().name(), "S_young");
        assert_eq!(registry.get(ageing.destinations[0].compartment).unwrap().name(), "S_old");
    }

    #[test]
    fn test_two_axes_cross_product_is_minimal() {
        let fx = sir();
        let (registry, catalog, _) = stratify(&fx.registry, &fx.catalog, &severity()).unwrap();
        let age = Stratification::with_strata("age", [("young", 0.5), ("old", 0.5)]).only(["I"]);
        let (registry, catalog, _) = stratify(&registry, &catalog, &age).unwrap();

        let names: Vec<String> = registry.active().map(|(_, c)| c.name()).collect();
        assert_eq!(
            names,
            vec!["S", "R", "I_mild_young", "I_mild_old", "I_severe_young", "I_severe_old"]
        );
        // infection and recovery, each replicated into four cells
        assert_eq!(catalog.len(), 8);
    }

    #[test]
    fn test_proportions_within_tolerance_are_normalised() {
        let fx = sir();
        let thirds = Stratification::with_strata("age", [("a", 0.3333333), ("b", 0.3333333), ("c", 0.3333333)]);
        let (registry, catalog, report) = stratify(&fx.registry, &fx.catalog, &thirds).unwrap();
        assert_eq!(report.replicates_added, 6);

        let susceptible: f64 = registry
            .find_by_base("S")
            .into_iter()
            .map(|id| registry.population(id).unwrap())
            .sum();
        assert!((susceptible - 990.0).abs() < 1e-9);
        assert!((registry.population(registry.find("S_a").unwrap()).unwrap() - 330.0).abs() < 1e-9);

        let shares: f64 = catalog
            .active()
            .filter(|f| f.name == "infection")
            .flat_map(|f| f.sources.iter().map(|e| e.weight))
            .sum();
        assert_eq!(catalog.active().filter(|f| f.name == "infection").count(), 3);
        assert!((shares - 3.0).abs() < 1e-12);
    }
}
