use serde::{Deserialize, Serialize};

use super::flow::FlowId;
use crate::rate::RateSpec;

/// Tolerance on the sum of stratum proportions.
pub const PROPORTION_TOLERANCE: f64 = 1e-6;

/// One stratum of a stratification with its share of the parent population
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stratum {
    pub label: String,
    pub proportion: f64,
}

/// Which flows an adjustment applies to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowRef {
    /// A flow id and every flow replicated from it.
    Id(FlowId),
    /// Every flow with this name.
    Name(String),
}

impl std::fmt::Display for FlowRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowRef::Id(id) => write!(f, "{}", id),
            FlowRef::Name(name) => write!(f, "'{}'", name),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    /// Multiply the replicated flow's rate.
    Multiply(RateSpec),
    /// Replace the replicated flow's rate entirely.
    Override(RateSpec),
}

/// Per-stratum rate adjustment keyed by (flow, stratum).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub flow: FlowRef,
    pub stratum: String,
    pub kind: AdjustmentKind,
}

/// A flow between two strata of the same stratification, added for every
/// stratified compartment (e.g. ageing from `young` to `old`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StratumTransition {
    pub name: Option<String>,
    pub from: String,
    pub to: String,
    pub rate: RateSpec,
}

/// Stratification descriptor: splits compartments into mutually exclusive strata
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stratification {
    pub name: String,
    pub strata: Vec<Stratum>,
    /// Base compartment names to stratify; `None` stratifies every compartment.
    #[serde(default)]
    pub compartments: Option<Vec<String>>,
    #[serde(default)]
    pub adjustments: Vec<Adjustment>,
    #[serde(default)]
    pub transitions: Vec<StratumTransition>,
}

impl Stratification {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            strata: Vec::new(),
            compartments: None,
            adjustments: Vec::new(),
            transitions: Vec::new(),
        }
    }

    /// Stratification with the given `(label, proportion)` pairs.
    pub fn with_strata<S: Into<String>>(name: impl Into<String>, strata: impl IntoIterator<Item = (S, f64)>) -> Self {
        let mut stratification = Self::new(name);
        for (label, proportion) in strata {
            stratification = stratification.stratum(label, proportion);
        }
        stratification
    }

    pub fn stratum(mut self, label: impl Into<String>, proportion: f64) -> Self {
        self.strata.push(Stratum {
            label: label.into(),
            proportion,
        });
        self
    }

    /// Restrict the stratification to these base compartments.
    pub fn only<S: Into<String>>(mut self, compartments: impl IntoIterator<Item = S>) -> Self {
        self.compartments = Some(compartments.into_iter().map(Into::into).collect());
        self
    }

    pub fn multiply(mut self, flow: FlowRef, stratum: impl Into<String>, factor: impl Into<RateSpec>) -> Self {
        self.adjustments.push(Adjustment {
            flow,
            stratum: stratum.into(),
            kind: AdjustmentKind::Multiply(factor.into()),
        });
        self
    }

    pub fn override_rate(mut self, flow: FlowRef, stratum: impl Into<String>, rate: impl Into<RateSpec>) -> Self {
        self.adjustments.push(Adjustment {
            flow,
            stratum: stratum.into(),
            kind: AdjustmentKind::Override(rate.into()),
        });
        self
    }

    pub fn transition(mut self, from: impl Into<String>, to: impl Into<String>, rate: impl Into<RateSpec>) -> Self {
        self.transitions.push(StratumTransition {
            name: None,
            from: from.into(),
            to: to.into(),
            rate: rate.into(),
        });
        self
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.strata.iter().map(|s| s.label.as_str())
    }

    pub fn proportion(&self, label: &str) -> Option<f64> {
        self.strata
            .iter()
            .find(|s| s.label == label)
            .map(|s| s.proportion)
    }

    pub fn has_stratum(&self, label: &str) -> bool {
        self.strata.iter().any(|s| s.label == label)
    }

    pub fn applies_to(&self, base: &str) -> bool {
        match &self.compartments {
            None => true,
            Some(names) => names.iter().any(|n| n == base),
        }
    }
}
