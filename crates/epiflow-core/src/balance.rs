//! Post-stratification balance bookkeeping.
//!
//! Capacities are tracked in parent-equivalent units: a child carrying
//! share `p` of its parent contributes `weight * p`, so the replicates of a
//! flow must add back up to exactly what the parent flow carried.

use std::collections::{BTreeMap, HashMap};

use crate::error::{ModelError, ModelResult};
use crate::registry::CompartmentRegistry;
use crate::types::{CompartmentId, Endpoint, Flow, FlowKind};

const BALANCE_TOLERANCE: f64 = 1e-9;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Capacity {
    outflow: f64,
    inflow: f64,
}

#[derive(Debug)]
pub(crate) struct BalanceLedger {
    /// child -> (retired parent, share of the parent)
    children: HashMap<CompartmentId, (CompartmentId, f64)>,
    expected: BTreeMap<CompartmentId, Capacity>,
    actual: BTreeMap<CompartmentId, Capacity>,
}

impl BalanceLedger {
    pub(crate) fn new(splits: &BTreeMap<CompartmentId, Vec<(CompartmentId, f64)>>) -> Self {
        let mut children = HashMap::new();
        let mut expected = BTreeMap::new();
        let mut actual = BTreeMap::new();
        for (parent, split) in splits {
            for (child, share) in split {
                children.insert(*child, (*parent, *share));
            }
            expected.insert(*parent, Capacity::default());
            actual.insert(*parent, Capacity::default());
        }
        Self {
            children,
            expected,
            actual,
        }
    }

    /// Record what a flow touching a retired compartment carried before the pass.
    pub(crate) fn record_parent(&mut self, flow: &Flow) {
        let source_capacity = match flow.kind {
            FlowKind::Entry => 1.0,
            _ => flow.source_weight(),
        };
        let destination_weight = flow.destination_weight();
        for source in &flow.sources {
            if let Some(capacity) = self.expected.get_mut(&source.compartment) {
                capacity.outflow += source.weight;
            }
        }
        for destination in &flow.destinations {
            if let Some(capacity) = self.expected.get_mut(&destination.compartment) {
                capacity.inflow += destination.weight / destination_weight * source_capacity;
            }
        }
    }

    /// Record one replicate, materialised or dropped by its restriction.
    ///
    /// `share` is the proportion of the replicate's stratum.
    pub(crate) fn record_replicate(
        &mut self,
        kind: FlowKind,
        sources: &[Endpoint],
        destinations: &[Endpoint],
        share: f64,
    ) {
        let source_capacity: f64 = match kind {
            FlowKind::Entry => share,
            _ => sources.iter().map(|e| self.parent_equivalent(e)).sum(),
        };
        let destination_weight: f64 = destinations.iter().map(|e| e.weight).sum();

        for source in sources {
            if let Some(&(parent, _)) = self.children.get(&source.compartment) {
                let outflow = self.parent_equivalent(source);
                if let Some(capacity) = self.actual.get_mut(&parent) {
                    capacity.outflow += outflow;
                }
            }
        }
        for destination in destinations {
            if let Some(&(parent, _)) = self.children.get(&destination.compartment) {
                if let Some(capacity) = self.actual.get_mut(&parent) {
                    capacity.inflow += destination.weight / destination_weight * source_capacity;
                }
            }
        }
    }

    fn parent_equivalent(&self, endpoint: &Endpoint) -> f64 {
        match self.children.get(&endpoint.compartment) {
            Some((_, share)) => endpoint.weight * share,
            // Sources outside the stratified set already carry the scaled weight.
            None => endpoint.weight,
        }
    }

    /// Compare the ledger and the population split of every retired compartment.
    pub(crate) fn verify(
        &self,
        stratification: &str,
        before: &CompartmentRegistry,
        after: &CompartmentRegistry,
    ) -> ModelResult<()> {
        for (parent, expected) in &self.expected {
            let actual = self.actual.get(parent).copied().unwrap_or_default();
            let name = || {
                before
                    .get_any(*parent)
                    .map(|c| c.name())
                    .unwrap_or_else(|| parent.to_string())
            };
            let leak = |direction: &'static str, expected: f64, actual: f64| ModelError::MassLeak {
                stratification: stratification.to_string(),
                compartment: name(),
                direction,
                expected,
                actual,
            };

            if !close(expected.outflow, actual.outflow) {
                return Err(leak("outflow", expected.outflow, actual.outflow));
            }
            if !close(expected.inflow, actual.inflow) {
                return Err(leak("inflow", expected.inflow, actual.inflow));
            }

            let parent_population = before.population(*parent)?;
            let children_population: f64 = self
                .children
                .iter()
                .filter(|(_, (p, _))| p == parent)
                .map(|(child, _)| after.population(*child))
                .sum::<ModelResult<f64>>()?;
            if !close(parent_population, children_population) {
                return Err(leak("population", parent_population, children_population));
            }
        }
        Ok(())
    }
}

fn close(expected: f64, actual: f64) -> bool {
    (expected - actual).abs() <= BALANCE_TOLERANCE * expected.abs().max(1.0)
}
