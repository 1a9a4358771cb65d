//! Read-only view of the flow graph for visualisation.

use serde::Serialize;

use crate::catalog::FlowCatalog;
use crate::registry::CompartmentRegistry;
use crate::types::{CompartmentId, FlowId, FlowKind, StratumLabel};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GraphNode {
    pub name: String,
    pub base: String,
    pub strata: Vec<StratumLabel>,
    pub population: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GraphEdge {
    pub id: FlowId,
    pub name: String,
    pub kind: FlowKind,
    /// Source compartment names; empty for entry flows.
    pub from: Vec<String>,
    /// Destination compartment names; empty for exit flows.
    pub to: Vec<String>,
    pub rate: String,
}

/// Nodes are the active compartments, edges the active flows.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GraphView {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl GraphView {
    pub fn new(registry: &CompartmentRegistry, catalog: &FlowCatalog) -> Self {
        let nodes = registry
            .active()
            .map(|(id, compartment)| GraphNode {
                name: compartment.name(),
                base: compartment.base.clone(),
                strata: compartment.strata.clone(),
                population: registry.population(id).unwrap_or_default(),
            })
            .collect();

        let name_of = |id: CompartmentId| {
            registry
                .get_any(id)
                .map(|c| c.name())
                .unwrap_or_else(|| id.to_string())
        };
        let edges = catalog
            .active()
            .map(|flow| GraphEdge {
                id: flow.id,
                name: flow.name.clone(),
                kind: flow.kind,
                from: flow.sources.iter().map(|e| name_of(e.compartment)).collect(),
                to: flow.destinations.iter().map(|e| name_of(e.compartment)).collect(),
                rate: flow.rate.to_string(),
            })
            .collect();

        Self { nodes, edges }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Edges leaving or entering the named compartment.
    pub fn edges_of<'a>(&'a self, compartment: &'a str) -> impl Iterator<Item = &'a GraphEdge> {
        self.edges
            .iter()
            .filter(move |e| e.from.iter().chain(&e.to).any(|n| n == compartment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::RateSpec;
    use crate::types::NewFlow;

    #[test]
    fn test_graph_serialises() {
        let mut registry = CompartmentRegistry::new();
        let s = registry.add_compartment("S", 99.0).unwrap();
        let i = registry.add_compartment("I", 1.0).unwrap();
        let mut catalog = FlowCatalog::new();
        catalog
            .add_flow(NewFlow::transfer(s, i, RateSpec::parameter("beta")).named("infection"), &registry)
            .unwrap();
        catalog.add_flow(NewFlow::exit(i, 0.1), &registry).unwrap();

        let graph = GraphView::new(&registry, &catalog);
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges[0].from, vec!["S"]);
        assert_eq!(graph.edges[1].to, Vec::<String>::new());
        assert_eq!(graph.edges_of("I").count(), 2);

        let json: serde_json::Value = serde_json::from_str(&graph.to_json().unwrap()).unwrap();
        assert_eq!(json["edges"][0]["kind"], "transfer");
        assert_eq!(json["edges"][0]["rate"], "beta");
        assert_eq!(json["nodes"][1]["population"], 1.0);
    }
}
