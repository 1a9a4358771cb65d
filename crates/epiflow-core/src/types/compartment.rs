use std::fmt;

use serde::{Deserialize, Serialize};

/// Arena index of a compartment inside a [`CompartmentRegistry`](crate::CompartmentRegistry).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CompartmentId(pub usize);

impl fmt::Display for CompartmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A (stratification, stratum) pair attached to a compartment.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StratumLabel {
    pub stratification: String,
    pub stratum: String,
}

/// Identity of a compartment: a base name plus the strata it has been split into.
///
/// The strata list is append-only and ordered by the stratification passes
/// that produced it, so `I` stratified by severity then by age is
/// `I [severity=mild, age=young]` and displays as `I_mild_young`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Compartment {
    pub base: String,
    #[serde(default)]
    pub strata: Vec<StratumLabel>,
}

impl Compartment {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            strata: Vec::new(),
        }
    }

    /// Return a child identity with one more stratum appended.
    pub fn with_stratum(&self, stratification: &str, stratum: &str) -> Self {
        let mut strata = self.strata.clone();
        strata.push(StratumLabel {
            stratification: stratification.to_string(),
            stratum: stratum.to_string(),
        });
        Self {
            base: self.base.clone(),
            strata,
        }
    }

    /// Stratum label for the given stratification, if this compartment carries it.
    pub fn stratum(&self, stratification: &str) -> Option<&str> {
        self.strata
            .iter()
            .find(|s| s.stratification == stratification)
            .map(|s| s.stratum.as_str())
    }

    pub fn is_stratified_by(&self, stratification: &str) -> bool {
        self.stratum(stratification).is_some()
    }

    /// Human-readable name, e.g. `I_mild_young`.
    pub fn name(&self) -> String {
        let mut name = self.base.clone();
        for s in &self.strata {
            name.push('_');
            name.push_str(&s.stratum);
        }
        name
    }

    /// True if every `(stratification, stratum)` pair in `filter` is carried by this compartment.
    pub fn matches_strata(&self, filter: &[(&str, &str)]) -> bool {
        filter
            .iter()
            .all(|(strat, stratum)| self.stratum(strat) == Some(*stratum))
    }
}

impl fmt::Display for Compartment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}
