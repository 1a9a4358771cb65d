//! Ordered compartment index: the mapping between state-vector positions
//! and compartment identities.

use std::collections::HashMap;

use serde::Serialize;

use crate::registry::CompartmentRegistry;
use crate::types::{Compartment, CompartmentId};

/// Prefix of population-total identifiers such as `N_young`.
const STRATUM_TOTAL_PREFIX: &str = "N_";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompartmentIndex {
    ids: Vec<CompartmentId>,
    compartments: Vec<Compartment>,
    names: Vec<String>,
    #[serde(skip)]
    positions: HashMap<String, usize>,
}

impl CompartmentIndex {
    pub fn from_registry(registry: &CompartmentRegistry) -> Self {
        let mut ids = Vec::new();
        let mut compartments = Vec::new();
        for (id, compartment) in registry.active() {
            ids.push(id);
            compartments.push(compartment.clone());
        }
        let names: Vec<String> = compartments.iter().map(Compartment::name).collect();
        let positions = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            ids,
            compartments,
            names,
            positions,
        }
    }

    pub fn len(&self) -> usize {
        self.compartments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compartments.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn compartments(&self) -> &[Compartment] {
        &self.compartments
    }

    pub fn get(&self, position: usize) -> Option<&Compartment> {
        self.compartments.get(position)
    }

    /// State-vector position of a compartment by display name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn position_of(&self, id: CompartmentId) -> Option<usize> {
        self.ids.iter().position(|i| *i == id)
    }

    pub fn id(&self, position: usize) -> Option<CompartmentId> {
        self.ids.get(position).copied()
    }

    /// Positions of every compartment carrying all the given `(stratification, stratum)` pairs.
    pub fn select(&self, filter: &[(&str, &str)]) -> Vec<usize> {
        self.positions_where(|c| c.matches_strata(filter))
    }

    pub fn by_base(&self, base: &str) -> Vec<usize> {
        self.positions_where(|c| c.base == base)
    }

    fn positions_where(&self, predicate: impl Fn(&Compartment) -> bool) -> Vec<usize> {
        self.compartments
            .iter()
            .enumerate()
            .filter(|(_, c)| predicate(c))
            .map(|(i, _)| i)
            .collect()
    }

    /// Resolve an identifier used in a rate to the positions it sums over.
    ///
    /// An exact compartment name wins, then a base name, then `N_<stratum>`.
    pub fn resolve(&self, identifier: &str) -> Option<Vec<usize>> {
        if let Some(position) = self.position(identifier) {
            return Some(vec![position]);
        }
        let by_base = self.by_base(identifier);
        if !by_base.is_empty() {
            return Some(by_base);
        }
        let label = identifier.strip_prefix(STRATUM_TOTAL_PREFIX)?;
        let carrying = self.positions_where(|c| c.strata.iter().any(|s| s.stratum == label));
        (!carrying.is_empty()).then_some(carrying)
    }

    /// Group positions by their stratum on `stratification`, in order of first appearance.
    ///
    /// Compartments not stratified on that axis are left out.
    pub fn groups(&self, stratification: &str) -> Vec<(String, Vec<usize>)> {
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (i, compartment) in self.compartments.iter().enumerate() {
            let Some(stratum) = compartment.stratum(stratification) else {
                continue;
            };
            match groups.iter_mut().find(|(label, _)| label == stratum) {
                Some((_, positions)) => positions.push(i),
                None => groups.push((stratum.to_string(), vec![i])),
            }
        }
        groups
    }

    /// Group positions by base compartment name, in order of first appearance.
    pub fn base_groups(&self) -> Vec<(String, Vec<usize>)> {
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (i, compartment) in self.compartments.iter().enumerate() {
            match groups.iter_mut().find(|(base, _)| *base == compartment.base) {
                Some((_, positions)) => positions.push(i),
                None => groups.push((compartment.base.clone(), vec![i])),
            }
        }
        groups
    }

    /// Sum `values` (one per compartment) within each stratum of `stratification`.
    pub fn aggregate(&self, values: &[f64], stratification: &str) -> Vec<(String, f64)> {
        sum_groups(self.groups(stratification), values)
    }

    /// Sum `values` within each base compartment.
    pub fn aggregate_by_base(&self, values: &[f64]) -> Vec<(String, f64)> {
        sum_groups(self.base_groups(), values)
    }
}

fn sum_groups(groups: Vec<(String, Vec<usize>)>, values: &[f64]) -> Vec<(String, f64)> {
    groups
        .into_iter()
        .map(|(label, positions)| {
            let total = positions.iter().filter_map(|i| values.get(*i)).sum();
            (label, total)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Stratum;

    fn index() -> CompartmentIndex {
        let mut registry = CompartmentRegistry::new();
        registry.add_compartment("S", 90.0).unwrap();
        let i = registry.add_compartment("I", 10.0).unwrap();
        let strata = [
            Stratum {
                label: "young".to_string(),
                proportion: 0.5,
            },
            Stratum {
                label: "old".to_string(),
                proportion: 0.5,
            },
        ];
        registry.expand(i, "age", &strata).unwrap();
        CompartmentIndex::from_registry(&registry)
    }

    #[test]
    fn test_resolution_order() {
        let index = index();
        assert_eq!(index.resolve("S"), Some(vec![0]));
        assert_eq!(index.resolve("I_old"), Some(vec![2]));
        assert_eq!(index.resolve("I"), Some(vec![1, 2]));
        assert_eq!(index.resolve("N_young"), Some(vec![1]));
        assert_eq!(index.resolve("N_adult"), None);
        assert_eq!(index.resolve("beta"), None);
    }

    #[test]
    fn test_aggregation() {
        let index = index();
        let values = [90.0, 4.0, 6.0];
        assert_eq!(
            index.aggregate(&values, "age"),
            vec![("young".to_string(), 4.0), ("old".to_string(), 6.0)]
        );
        assert_eq!(
            index.aggregate_by_base(&values),
            vec![("S".to_string(), 90.0), ("I".to_string(), 10.0)]
        );
        assert_eq!(index.select(&[("age", "old")]), vec![2]);
    }
}
