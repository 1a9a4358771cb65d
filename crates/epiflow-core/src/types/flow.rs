use std::fmt;

use serde::{Deserialize, Serialize};

use super::compartment::CompartmentId;
use super::condition::Condition;
use crate::rate::Rate;

/// Arena index of a flow inside a [`FlowCatalog`](crate::FlowCatalog).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlowId(pub usize);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    /// Moves population from sources to destinations.
    Transfer,
    /// Creates population in destinations (births, importation).
    Entry,
    /// Removes population from sources (deaths, emigration).
    Exit,
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowKind::Transfer => write!(f, "transfer"),
            FlowKind::Entry => write!(f, "entry"),
            FlowKind::Exit => write!(f, "exit"),
        }
    }
}

/// A weighted reference to a compartment at one end of a flow.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub compartment: CompartmentId,
    pub weight: f64,
}

impl Endpoint {
    pub fn new(compartment: CompartmentId) -> Self {
        Self {
            compartment,
            weight: 1.0,
        }
    }

    pub fn weighted(compartment: CompartmentId, weight: f64) -> Self {
        Self {
            compartment,
            weight,
        }
    }
}

/// Adjustment recorded on a flow by a stratification pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppliedAdjustment {
    pub stratification: String,
    pub stratum: String,
    pub overridden: bool,
}

/// A flow as stored in the catalog.
///
/// Each source `s` loses `rate * weight(s) * population(s)`; the summed
/// outflow (or the absolute rate, for entry flows) is distributed over the
/// destinations in proportion to their weights and multiplied by
/// `yield_ratio`, which is 1 for every mass-conserving flow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub name: String,
    pub kind: FlowKind,
    pub sources: Vec<Endpoint>,
    pub destinations: Vec<Endpoint>,
    pub rate: Rate,
    pub restriction: Option<Condition>,
    pub yield_ratio: f64,
    /// Flows this one was replicated from, oldest first.
    pub lineage: Vec<FlowId>,
    pub adjustments: Vec<AppliedAdjustment>,
}

impl Flow {
    pub fn is_conserving(&self) -> bool {
        self.kind == FlowKind::Transfer && self.yield_ratio == 1.0
    }

    /// True if this flow is `id` or was replicated from it.
    pub fn descends_from(&self, id: FlowId) -> bool {
        self.id == id || self.lineage.contains(&id)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.sources.iter().chain(self.destinations.iter())
    }

    pub fn touches(&self, compartment: CompartmentId) -> bool {
        self.endpoints().any(|e| e.compartment == compartment)
    }

    pub fn source_weight(&self) -> f64 {
        self.sources.iter().map(|e| e.weight).sum()
    }

    pub fn destination_weight(&self) -> f64 {
        self.destinations.iter().map(|e| e.weight).sum()
    }
}

/// Request to add a flow to the catalog.
#[derive(Clone, Debug, PartialEq)]
pub struct NewFlow {
    pub name: Option<String>,
    pub kind: FlowKind,
    pub sources: Vec<Endpoint>,
    pub destinations: Vec<Endpoint>,
    pub rate: Rate,
    pub restriction: Option<Condition>,
    pub conserving: bool,
}

impl NewFlow {
    pub fn new(kind: FlowKind, sources: Vec<Endpoint>, destinations: Vec<Endpoint>, rate: impl Into<Rate>) -> Self {
        Self {
            name: None,
            kind,
            sources,
            destinations,
            rate: rate.into(),
            restriction: None,
            conserving: true,
        }
    }

    pub fn transfer(from: CompartmentId, to: CompartmentId, rate: impl Into<Rate>) -> Self {
        Self::new(
            FlowKind::Transfer,
            vec![Endpoint::new(from)],
            vec![Endpoint::new(to)],
            rate,
        )
    }

    pub fn entry(to: CompartmentId, rate: impl Into<Rate>) -> Self {
        Self::new(FlowKind::Entry, Vec::new(), vec![Endpoint::new(to)], rate)
    }

    pub fn exit(from: CompartmentId, rate: impl Into<Rate>) -> Self {
        Self::new(FlowKind::Exit, vec![Endpoint::new(from)], Vec::new(), rate)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn restricted(mut self, restriction: Condition) -> Self {
        self.restriction = Some(restriction);
        self
    }

    /// Allow destination weights to differ from source weights.
    pub fn non_conserving(mut self) -> Self {
        self.conserving = false;
        self
    }
}
