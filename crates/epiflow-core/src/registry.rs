//! Compartment registry: the arena of compartment identities and their populations.

use std::collections::HashMap;

use crate::error::{ModelError, ModelResult};
use crate::types::{Compartment, CompartmentId, Stratum};

#[derive(Clone, Debug)]
struct CompartmentRecord {
    compartment: Compartment,
    population: f64,
    retired: bool,
}

/// Canonical set of compartments.
///
/// Compartments live in a flat arena indexed by [`CompartmentId`]. Ids are
/// never reused; stratification retires a parent and appends its children,
/// so the active compartments in arena order form the canonical ordering.
#[derive(Clone, Debug, Default)]
pub struct CompartmentRegistry {
    records: Vec<CompartmentRecord>,
    by_name: HashMap<String, CompartmentId>,
}

impl CompartmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an unstratified compartment.
    pub fn add_compartment(&mut self, name: &str, initial_population: f64) -> ModelResult<CompartmentId> {
        if name.trim().is_empty() {
            return Err(ModelError::InvalidName(name.to_string()));
        }
        validate_population(name, initial_population)?;
        self.insert(Compartment::new(name), initial_population)
    }

    fn insert(&mut self, compartment: Compartment, population: f64) -> ModelResult<CompartmentId> {
        let name = compartment.name();
        if self.by_name.contains_key(&name) {
            return Err(ModelError::DuplicateCompartment(name));
        }
        let id = CompartmentId(self.records.len());
        self.records.push(CompartmentRecord {
            compartment,
            population,
            retired: false,
        });
        self.by_name.insert(name, id);
        Ok(id)
    }

    fn record(&self, id: CompartmentId) -> ModelResult<&CompartmentRecord> {
        let record = self
            .records
            .get(id.0)
            .ok_or_else(|| ModelError::UnknownCompartment(id.to_string()))?;
        if record.retired {
            return Err(ModelError::RetiredCompartment {
                id,
                name: record.compartment.name(),
            });
        }
        Ok(record)
    }

    /// Identity of an active compartment.
    pub fn get(&self, id: CompartmentId) -> ModelResult<&Compartment> {
        self.record(id).map(|r| &r.compartment)
    }

    /// Identity of any compartment, including retired ones.
    pub fn get_any(&self, id: CompartmentId) -> Option<&Compartment> {
        self.records.get(id.0).map(|r| &r.compartment)
    }

    pub fn population(&self, id: CompartmentId) -> ModelResult<f64> {
        self.record(id).map(|r| r.population)
    }

    pub fn set_population(&mut self, id: CompartmentId, population: f64) -> ModelResult<()> {
        let name = self.get(id)?.name();
        validate_population(&name, population)?;
        self.records[id.0].population = population;
        Ok(())
    }

    pub fn is_active(&self, id: CompartmentId) -> bool {
        self.records.get(id.0).is_some_and(|r| !r.retired)
    }

    /// Look up an active compartment by display name (`S`, `I_mild`).
    pub fn find(&self, name: &str) -> ModelResult<CompartmentId> {
        let id = *self
            .by_name
            .get(name)
            .ok_or_else(|| ModelError::UnknownCompartment(name.to_string()))?;
        self.record(id)?;
        Ok(id)
    }

    /// Active compartments derived from a base name, in canonical order.
    pub fn find_by_base(&self, base: &str) -> Vec<CompartmentId> {
        self.active()
            .filter(|(_, c)| c.base == base)
            .map(|(id, _)| id)
            .collect()
    }

    /// Active compartments in canonical order.
    pub fn active(&self) -> impl Iterator<Item = (CompartmentId, &Compartment)> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.retired)
            .map(|(i, r)| (CompartmentId(i), &r.compartment))
    }

    pub fn active_ids(&self) -> Vec<CompartmentId> {
        self.active().map(|(id, _)| id).collect()
    }

    /// Number of active compartments.
    pub fn len(&self) -> usize {
        self.records.iter().filter(|r| !r.retired).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Initial populations in canonical order.
    pub fn population_vector(&self) -> Vec<f64> {
        self.records
            .iter()
            .filter(|r| !r.retired)
            .map(|r| r.population)
            .collect()
    }

    pub fn total_population(&self) -> f64 {
        self.population_vector().iter().sum()
    }

    /// Split `parent` into one child per stratum and retire it.
    ///
    /// Children are appended in stratum order. Each child receives
    /// `proportion * population`, except the last which receives the
    /// remainder so the children sum to the parent exactly.
    pub(crate) fn expand(
        &mut self,
        parent: CompartmentId,
        stratification: &str,
        strata: &[Stratum],
    ) -> ModelResult<Vec<CompartmentId>> {
        let record = self.record(parent)?;
        let identity = record.compartment.clone();
        let population = record.population;

        if identity.is_stratified_by(stratification) {
            return Err(ModelError::AlreadyStratified {
                compartment: identity.name(),
                stratification: stratification.to_string(),
            });
        }
        if strata.is_empty() {
            return Err(ModelError::InvalidStratification {
                stratification: stratification.to_string(),
                reason: "no strata".to_string(),
            });
        }

        // Check every child name before touching the arena.
        let children: Vec<Compartment> = strata
            .iter()
            .map(|s| identity.with_stratum(stratification, &s.label))
            .collect();
        if let Some(existing) = children.iter().find(|c| self.by_name.contains_key(&c.name())) {
            return Err(ModelError::DuplicateCompartment(existing.name()));
        }

        let mut ids = Vec::with_capacity(children.len());
        let mut allocated = 0.0;
        let last = children.len() - 1;
        for (i, (child, stratum)) in children.into_iter().zip(strata).enumerate() {
            let share = if i == last {
                (population - allocated).max(0.0)
            } else {
                population * stratum.proportion
            };
            allocated += share;
            ids.push(self.insert(child, share)?);
        }

        self.records[parent.0].retired = true;
        Ok(ids)
    }
}

fn validate_population(name: &str, value: f64) -> ModelResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(ModelError::InvalidPopulation {
            compartment: name.to_string(),
            value,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strata(pairs: &[(&str, f64)]) -> Vec<Stratum> {
        pairs
            .iter()
            .map(|(label, proportion)| Stratum {
                label: label.to_string(),
                proportion: *proportion,
            })
            .collect()
    }

    #[test]
    fn test_add_and_lookup() {
        let mut registry = CompartmentRegistry::new();
        let s = registry.add_compartment("S", 990.0).unwrap();
        let i = registry.add_compartment("I", 10.0).unwrap();
        assert_eq!(registry.find("I").unwrap(), i);
        assert_eq!(registry.population_vector(), vec![990.0, 10.0]);
        assert_eq!(registry.get(s).unwrap().name(), "S");

        assert!(matches!(
            registry.add_compartment("S", 1.0),
            Err(ModelError::DuplicateCompartment(_))
        ));
        assert!(matches!(
            registry.add_compartment("R", -1.0),
            Err(ModelError::InvalidPopulation { .. })
        ));
        assert_eq!(registry.add_compartment("", 1.0), Err(ModelError::InvalidName(String::new())));
        assert!(matches!(registry.add_compartment("  ", 1.0), Err(ModelError::InvalidName(_))));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_expand_splits_and_retires() {
        let mut registry = CompartmentRegistry::new();
        registry.add_compartment("S", 990.0).unwrap();
        let i = registry.add_compartment("I", 10.0).unwrap();

        let children = registry
            .expand(i, "severity", &strata(&[("mild", 0.8), ("severe", 0.2)]))
            .unwrap();

        let names: Vec<String> = registry.active().map(|(_, c)| c.name()).collect();
        assert_eq!(names, vec!["S", "I_mild", "I_severe"]);
        assert_eq!(registry.population(children[0]).unwrap(), 8.0);
        assert_eq!(registry.population(children[1]).unwrap(), 2.0);
        assert_eq!(registry.population_vector().iter().sum::<f64>(), 1000.0);

        assert!(matches!(
            registry.get(i),
            Err(ModelError::RetiredCompartment { .. })
        ));
        assert!(matches!(
            registry.find("I"),
            Err(ModelError::RetiredCompartment { .. })
        ));
        assert_eq!(registry.find_by_base("I"), children);
    }

    #[test]
    fn test_children_sum_to_parent() {
        let mut registry = CompartmentRegistry::new();
        let c = registry.add_compartment("C", 1.0 / 3.0).unwrap();
        let children = registry
            .expand(c, "x", &strata(&[("a", 0.1), ("b", 0.7), ("c", 0.2)]))
            .unwrap();
        let total: f64 = children.iter().map(|id| registry.population(*id).unwrap()).sum();
        assert!((total - 1.0 / 3.0).abs() < 1e-15);
    }
}
