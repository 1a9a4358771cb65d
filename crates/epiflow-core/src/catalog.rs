//! Flow catalog: typed flow declarations with add-time shape validation.

use crate::error::{ModelError, ModelResult};
use crate::rate::{Rate, RateSpec};
use crate::registry::CompartmentRegistry;
use crate::types::{AppliedAdjustment, Compartment, Endpoint, Flow, FlowId, FlowKind, NewFlow};

/// Relative tolerance used when comparing aggregate source and destination weights.
const WEIGHT_TOLERANCE: f64 = 1e-9;

#[derive(Clone, Debug)]
struct FlowRecord {
    flow: Flow,
    retired: bool,
}

/// Arena of flows. Stratification retires a flow and appends its replicates.
#[derive(Clone, Debug, Default)]
pub struct FlowCatalog {
    records: Vec<FlowRecord>,
}

impl FlowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a flow.
    pub fn add_flow(&mut self, new: NewFlow, registry: &CompartmentRegistry) -> ModelResult<FlowId> {
        let name = match &new.name {
            Some(name) => name.clone(),
            None => default_name(&new, registry)?,
        };
        let malformed = |reason: String| ModelError::MalformedFlow {
            flow: name.clone(),
            reason,
        };

        for endpoint in new.sources.iter().chain(&new.destinations) {
            registry.get(endpoint.compartment)?;
            if !endpoint.weight.is_finite() || endpoint.weight <= 0.0 {
                return Err(malformed(format!(
                    "weight {} on compartment {} must be positive",
                    endpoint.weight, endpoint.compartment
                )));
            }
        }
        if has_duplicates(&new.sources) || has_duplicates(&new.destinations) {
            return Err(malformed("a compartment appears twice on the same side".to_string()));
        }
        if new
            .sources
            .iter()
            .any(|s| new.destinations.iter().any(|d| d.compartment == s.compartment))
        {
            return Err(malformed("a compartment is both a source and a destination".to_string()));
        }

        let source_weight: f64 = new.sources.iter().map(|e| e.weight).sum();
        let destination_weight: f64 = new.destinations.iter().map(|e| e.weight).sum();
        let yield_ratio = match new.kind {
            FlowKind::Transfer => {
                if new.sources.is_empty() || new.destinations.is_empty() {
                    return Err(malformed(
                        "transfer flows need at least one source and one destination".to_string(),
                    ));
                }
                let balanced = (source_weight - destination_weight).abs()
                    <= WEIGHT_TOLERANCE * source_weight.max(1.0);
                if balanced {
                    1.0
                } else if new.conserving {
                    return Err(malformed(format!(
                        "source weight {} differs from destination weight {}; mark the flow non-conserving to allow this",
                        source_weight, destination_weight
                    )));
                } else {
                    destination_weight / source_weight
                }
            }
            FlowKind::Entry => {
                if !new.sources.is_empty() || new.destinations.is_empty() {
                    return Err(malformed(
                        "entry flows need no sources and at least one destination".to_string(),
                    ));
                }
                1.0
            }
            FlowKind::Exit => {
                if new.sources.is_empty() || !new.destinations.is_empty() {
                    return Err(malformed(
                        "exit flows need at least one source and no destinations".to_string(),
                    ));
                }
                1.0
            }
        };

        let replaced_deaths = new.rate.base.is_replaced_deaths()
            || new.rate.factors.iter().any(RateSpec::is_replaced_deaths);
        if replaced_deaths && (new.kind != FlowKind::Entry || !new.rate.base.is_replaced_deaths()) {
            return Err(malformed(
                "replaced deaths can only be the base rate of an entry flow".to_string(),
            ));
        }

        if let Some(restriction) = &new.restriction {
            let sources = identities(&new.sources, registry)?;
            let destinations = identities(&new.destinations, registry)?;
            if restriction.evaluate(&sources, &destinations) == Some(false) {
                return Err(malformed(
                    "stratum restriction excludes the flow's own compartments".to_string(),
                ));
            }
        }

        let id = FlowId(self.records.len());
        self.records.push(FlowRecord {
            flow: Flow {
                id,
                name,
                kind: new.kind,
                sources: new.sources,
                destinations: new.destinations,
                rate: new.rate,
                restriction: new.restriction,
                yield_ratio,
                lineage: Vec::new(),
                adjustments: Vec::new(),
            },
            retired: false,
        });
        Ok(id)
    }

    /// Append a stratified replicate of `parent`.
    pub(crate) fn add_replicate(
        &mut self,
        parent: &Flow,
        sources: Vec<Endpoint>,
        destinations: Vec<Endpoint>,
        rate: Rate,
        adjustments: Vec<AppliedAdjustment>,
    ) -> FlowId {
        let id = FlowId(self.records.len());
        let mut lineage = parent.lineage.clone();
        lineage.push(parent.id);
        self.records.push(FlowRecord {
            flow: Flow {
                id,
                name: parent.name.clone(),
                kind: parent.kind,
                sources,
                destinations,
                rate,
                restriction: parent.restriction.clone(),
                yield_ratio: parent.yield_ratio,
                lineage,
                adjustments,
            },
            retired: false,
        });
        id
    }

    pub(crate) fn retire(&mut self, id: FlowId) {
        if let Some(record) = self.records.get_mut(id.0) {
            record.retired = true;
        }
    }

    /// An active flow.
    pub fn get(&self, id: FlowId) -> ModelResult<&Flow> {
        match self.records.get(id.0) {
            Some(record) if !record.retired => Ok(&record.flow),
            _ => Err(ModelError::UnknownFlow(id)),
        }
    }

    /// Any flow, including ones replaced by stratification.
    pub fn get_any(&self, id: FlowId) -> Option<&Flow> {
        self.records.get(id.0).map(|r| &r.flow)
    }

    pub fn is_active(&self, id: FlowId) -> bool {
        self.records.get(id.0).is_some_and(|r| !r.retired)
    }

    /// Active flows in declaration/replication order.
    pub fn active(&self) -> impl Iterator<Item = &Flow> {
        self.records.iter().filter(|r| !r.retired).map(|r| &r.flow)
    }

    pub fn len(&self) -> usize {
        self.records.iter().filter(|r| !r.retired).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn has_duplicates(endpoints: &[Endpoint]) -> bool {
    endpoints
        .iter()
        .enumerate()
        .any(|(i, a)| endpoints[i + 1..].iter().any(|b| b.compartment == a.compartment))
}

fn identities<'a>(endpoints: &[Endpoint], registry: &'a CompartmentRegistry) -> ModelResult<Vec<&'a Compartment>> {
    endpoints.iter().map(|e| registry.get(e.compartment)).collect()
}

fn default_name(new: &NewFlow, registry: &CompartmentRegistry) -> ModelResult<String> {
    let join = |endpoints: &[Endpoint]| -> ModelResult<String> {
        Ok(identities(endpoints, registry)?
            .iter()
            .map(|c| c.name())
            .collect::<Vec<_>>()
            .join("+"))
    };
    Ok(match new.kind {
        FlowKind::Transfer => format!("{}_to_{}", join(&new.sources)?, join(&new.destinations)?),
        FlowKind::Entry => format!("entry_to_{}", join(&new.destinations)?),
        FlowKind::Exit => format!("exit_from_{}", join(&new.sources)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Condition;

    fn registry() -> (CompartmentRegistry, crate::types::CompartmentId, crate::types::CompartmentId) {
        let mut registry = CompartmentRegistry::new();
        let s = registry.add_compartment("S", 990.0).unwrap();
        let i = registry.add_compartment("I", 10.0).unwrap();
        (registry, s, i)
    }

    #[test]
    fn test_default_names_and_shapes() {
        let (registry, s, i) = registry();
        let mut catalog = FlowCatalog::new();
        let infection = catalog
            .add_flow(NewFlow::transfer(s, i, RateSpec::parameter("beta")), &registry)
            .unwrap();
        let births = catalog
            .add_flow(NewFlow::entry(s, RateSpec::Constant(1.0)), &registry)
            .unwrap();
        let deaths = catalog
            .add_flow(NewFlow::exit(i, RateSpec::parameter("mu")), &registry)
            .unwrap();

        assert_eq!(catalog.get(infection).unwrap().name, "S_to_I");
        assert_eq!(catalog.get(births).unwrap().name, "entry_to_S");
        assert_eq!(catalog.get(deaths).unwrap().name, "exit_from_I");
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn test_rejects_malformed_shapes() {
        let (registry, s, i) = registry();
        let mut catalog = FlowCatalog::new();

        let no_destination = NewFlow::new(FlowKind::Transfer, vec![Endpoint::new(s)], vec![], 1.0);
        assert!(matches!(
            catalog.add_flow(no_destination, &registry),
            Err(ModelError::MalformedFlow { .. })
        ));

        let entry_with_source = NewFlow::new(FlowKind::Entry, vec![Endpoint::new(s)], vec![Endpoint::new(i)], 1.0);
        assert!(catalog.add_flow(entry_with_source, &registry).is_err());

        let self_loop = NewFlow::transfer(s, s, 1.0);
        assert!(catalog.add_flow(self_loop, &registry).is_err());

        let deaths_on_transfer = NewFlow::transfer(s, i, RateSpec::ReplacedDeaths);
        assert!(catalog.add_flow(deaths_on_transfer, &registry).is_err());

        assert!(catalog.is_empty());
    }

    #[test]
    fn test_weight_balance() {
        let mut registry = CompartmentRegistry::new();
        let a = registry.add_compartment("A", 1.0).unwrap();
        let b = registry.add_compartment("B", 1.0).unwrap();
        let c = registry.add_compartment("C", 1.0).unwrap();
        let mut catalog = FlowCatalog::new();

        let split = NewFlow::new(
            FlowKind::Transfer,
            vec![Endpoint::new(a)],
            vec![Endpoint::weighted(b, 0.25), Endpoint::weighted(c, 0.75)],
            1.0,
        );
        let id = catalog.add_flow(split, &registry).unwrap();
        assert!(catalog.get(id).unwrap().is_conserving());

        let doubling = NewFlow::new(
            FlowKind::Transfer,
            vec![Endpoint::new(a)],
            vec![Endpoint::weighted(b, 2.0)],
            1.0,
        );
        assert!(catalog.add_flow(doubling.clone(), &registry).is_err());
        let id = catalog.add_flow(doubling.non_conserving(), &registry).unwrap();
        assert_eq!(catalog.get(id).unwrap().yield_ratio, 2.0);
    }

    #[test]
    fn test_retired_compartment_is_rejected() {
        let (mut registry, s, i) = registry();
        registry
            .expand(
                i,
                "severity",
                &[crate::types::Stratum {
                    label: "mild".to_string(),
                    proportion: 1.0,
                }],
            )
            .unwrap();
        let mut catalog = FlowCatalog::new();
        assert!(matches!(
            catalog.add_flow(NewFlow::transfer(s, i, 1.0), &registry),
            Err(ModelError::RetiredCompartment { .. })
        ));
    }

    #[test]
    fn test_self_excluding_restriction() {
        let (mut registry, s, _) = registry();
        let children = registry
            .expand(
                s,
                "age",
                &[crate::types::Stratum {
                    label: "young".to_string(),
                    proportion: 1.0,
                }],
            )
            .unwrap();
        let mut catalog = FlowCatalog::new();
        let flow = NewFlow::exit(children[0], 1.0).restricted(Condition::only("age", "old"));
        assert!(catalog.add_flow(flow, &registry).is_err());
    }
}
