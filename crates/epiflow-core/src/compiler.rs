//! Equation compiler: turns the frozen registry and catalog into a pure
//! derivative function over the state vector.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::catalog::FlowCatalog;
use crate::error::{EvaluationError, ModelError, ModelResult};
use crate::index::CompartmentIndex;
use crate::math_expression::EvaluationContext;
use crate::rate::CompiledRate;
use crate::registry::CompartmentRegistry;
use crate::types::{CompartmentId, Flow, FlowId, FlowKind, ParameterLookup};

const FRACTION_TOLERANCE: f64 = 1e-9;

/// A derived output summing the flow from compartments with base `from`
/// into compartments with base `to`, e.g. incidence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputConnection {
    pub name: String,
    pub from: String,
    pub to: String,
}

impl OutputConnection {
    pub fn new(name: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            from: from.into(),
            to: to.into(),
        }
    }
}

#[derive(Debug)]
struct CompiledFlow {
    id: FlowId,
    name: String,
    kind: FlowKind,
    /// (position, weight)
    sources: Vec<(usize, f64)>,
    /// (position, share of the total including the yield ratio)
    destinations: Vec<(usize, f64)>,
    rate: CompiledRate,
}

#[derive(Debug)]
struct CompiledOutput {
    name: String,
    /// (flow position, share of the flow's magnitude)
    terms: Vec<(usize, f64)>,
}

#[derive(Debug)]
struct Program {
    dimension: usize,
    flows: Vec<CompiledFlow>,
    outputs: Vec<CompiledOutput>,
}

/// The compiled vector field.
///
/// Immutable and cheap to clone; every call supplies its own state and
/// parameters, so one instance can be shared across threads.
#[derive(Clone, Debug)]
pub struct DerivativeFn {
    program: Arc<Program>,
}

impl DerivativeFn {
    /// Length of the state vector.
    pub fn dimension(&self) -> usize {
        self.program.dimension
    }

    /// Evaluate `d state / dt` at `time`.
    pub fn evaluate(&self, time: f64, state: &[f64], parameters: &dyn ParameterLookup) -> Result<Vec<f64>, EvaluationError> {
        let mut derivative = vec![0.0; self.program.dimension];
        self.evaluate_into(time, state, parameters, &mut derivative)?;
        Ok(derivative)
    }

    /// Evaluate into a caller-owned buffer, overwriting it.
    pub fn evaluate_into(
        &self,
        time: f64,
        state: &[f64],
        parameters: &dyn ParameterLookup,
        derivative: &mut [f64],
    ) -> Result<(), EvaluationError> {
        if derivative.len() != self.program.dimension {
            return Err(EvaluationError::StateLength {
                expected: self.program.dimension,
                actual: derivative.len(),
            });
        }
        derivative.fill(0.0);
        self.visit(time, state, parameters, |_, flow, rate, total| {
            for (position, weight) in &flow.sources {
                derivative[*position] -= rate * weight * state[*position];
            }
            for (position, share) in &flow.destinations {
                derivative[*position] += total * share;
            }
        })
    }

    /// Magnitude of every flow at `time`, in [`flow_ids`](Self::flow_ids) order.
    pub fn flow_rates(&self, time: f64, state: &[f64], parameters: &dyn ParameterLookup) -> Result<Vec<f64>, EvaluationError> {
        let mut rates = vec![0.0; self.program.flows.len()];
        self.visit(time, state, parameters, |i, _, _, total| rates[i] = total)?;
        Ok(rates)
    }

    /// Values of the tracked outputs at `time`, in [`output_names`](Self::output_names) order.
    pub fn outputs(&self, time: f64, state: &[f64], parameters: &dyn ParameterLookup) -> Result<Vec<f64>, EvaluationError> {
        let rates = self.flow_rates(time, state, parameters)?;
        Ok(self
            .program
            .outputs
            .iter()
            .map(|output| output.terms.iter().map(|(i, share)| rates[*i] * share).sum())
            .collect())
    }

    pub fn flow_ids(&self) -> Vec<FlowId> {
        self.program.flows.iter().map(|f| f.id).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.program.outputs.iter().map(|o| o.name.as_str()).collect()
    }

    /// Sorted, deduplicated names of every parameter the rates look up.
    pub fn parameter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .program
            .flows
            .iter()
            .flat_map(|f| f.rate.parameter_names())
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Compute every flow's rate and total magnitude and hand them to `apply`.
    ///
    /// Entry flows that replace deaths run last, once the total of all exit
    /// flows at this evaluation is known.
    fn visit(
        &self,
        time: f64,
        state: &[f64],
        parameters: &dyn ParameterLookup,
        mut apply: impl FnMut(usize, &CompiledFlow, f64, f64),
    ) -> Result<(), EvaluationError> {
        if state.len() != self.program.dimension {
            return Err(EvaluationError::StateLength {
                expected: self.program.dimension,
                actual: state.len(),
            });
        }
        let context = EvaluationContext::new(time, state, parameters);

        let mut deaths = 0.0;
        let flows = self.program.flows.iter().enumerate();
        for (i, flow) in flows.clone().filter(|(_, f)| !f.rate.replaces_deaths()) {
            let rate = evaluate_rate(flow, &context, 0.0)?;
            let total = magnitude(flow, rate, state);
            if flow.kind == FlowKind::Exit {
                deaths += total;
            }
            apply(i, flow, rate, total);
        }
        for (i, flow) in flows.filter(|(_, f)| f.rate.replaces_deaths()) {
            let rate = evaluate_rate(flow, &context, deaths)?;
            apply(i, flow, rate, rate);
        }
        Ok(())
    }
}

fn evaluate_rate(flow: &CompiledFlow, context: &EvaluationContext<'_>, deaths: f64) -> Result<f64, EvaluationError> {
    let rate = flow
        .rate
        .evaluate(context, deaths)
        .map_err(|e| e.into_evaluation_error(flow.id, &flow.name))?;
    if !rate.is_finite() {
        return Err(EvaluationError::NonFiniteRate {
            flow: flow.id,
            flow_name: flow.name.clone(),
            rate,
            time: context.time,
        });
    }
    if rate < 0.0 {
        return Err(EvaluationError::NegativeRate {
            flow: flow.id,
            flow_name: flow.name.clone(),
            rate,
            time: context.time,
        });
    }
    Ok(rate)
}

#[inline]
fn magnitude(flow: &CompiledFlow, rate: f64, state: &[f64]) -> f64 {
    match flow.kind {
        FlowKind::Entry => rate,
        FlowKind::Transfer | FlowKind::Exit => flow
            .sources
            .iter()
            .map(|(position, weight)| rate * weight * state[*position])
            .sum(),
    }
}

/// A compiled model: index, derivative function and initial state.
#[derive(Clone, Debug)]
pub struct CompiledModel {
    index: CompartmentIndex,
    derivative: DerivativeFn,
    initial_state: Vec<f64>,
}

impl CompiledModel {
    pub fn index(&self) -> &CompartmentIndex {
        &self.index
    }

    pub fn derivative(&self) -> &DerivativeFn {
        &self.derivative
    }

    pub fn initial_state(&self) -> &[f64] {
        &self.initial_state
    }

    /// Shorthand for [`DerivativeFn::evaluate`].
    pub fn evaluate(&self, time: f64, state: &[f64], parameters: &dyn ParameterLookup) -> Result<Vec<f64>, EvaluationError> {
        self.derivative.evaluate(time, state, parameters)
    }

    pub fn flow_rates(&self, time: f64, state: &[f64], parameters: &dyn ParameterLookup) -> Result<Vec<f64>, EvaluationError> {
        self.derivative.flow_rates(time, state, parameters)
    }

    pub fn into_parts(self) -> (CompartmentIndex, DerivativeFn, Vec<f64>) {
        (self.index, self.derivative, self.initial_state)
    }
}

/// Freeze `registry` and `catalog` into a [`CompiledModel`].
pub fn compile(
    registry: &CompartmentRegistry,
    catalog: &FlowCatalog,
    outputs: &[OutputConnection],
) -> ModelResult<CompiledModel> {
    let index = CompartmentIndex::from_registry(registry);
    let positions: HashMap<CompartmentId, usize> = (0..index.len())
        .filter_map(|i| index.id(i).map(|id| (id, i)))
        .collect();
    let resolve = |name: &str| index.resolve(name);

    let mut flows = Vec::with_capacity(catalog.len());
    for flow in catalog.active() {
        flows.push(compile_flow(flow, &positions, &resolve)?);
    }

    let has_exits = flows.iter().any(|f| f.kind == FlowKind::Exit);
    if flows.iter().any(|f| f.rate.replaces_deaths()) && !has_exits {
        warn!("births replace deaths but the model has no exit flows");
    }

    let active: Vec<&Flow> = catalog.active().collect();
    let compiled_outputs = outputs
        .iter()
        .map(|output| compile_output(output, &active, &index))
        .collect();

    debug!(
        "compiled {} compartments and {} flows ({} tracked outputs)",
        index.len(),
        flows.len(),
        outputs.len()
    );

    Ok(CompiledModel {
        initial_state: registry.population_vector(),
        derivative: DerivativeFn {
            program: Arc::new(Program {
                dimension: index.len(),
                flows,
                outputs: compiled_outputs,
            }),
        },
        index,
    })
}

fn compile_flow(
    flow: &Flow,
    positions: &HashMap<CompartmentId, usize>,
    resolve: &dyn Fn(&str) -> Option<Vec<usize>>,
) -> ModelResult<CompiledFlow> {
    let position = |id: CompartmentId| {
        positions
            .get(&id)
            .copied()
            .ok_or_else(|| ModelError::DanglingReference {
                flow: flow.id,
                flow_name: flow.name.clone(),
                compartment: id,
            })
    };
    let unbalanced = |reason: String| ModelError::UnbalancedFlow {
        flow: flow.id,
        flow_name: flow.name.clone(),
        reason,
    };

    let sources = flow
        .sources
        .iter()
        .map(|e| Ok((position(e.compartment)?, e.weight)))
        .collect::<ModelResult<Vec<_>>>()?;

    let destination_weight = flow.destination_weight();
    if !flow.yield_ratio.is_finite() || flow.yield_ratio <= 0.0 {
        return Err(unbalanced(format!("invalid yield ratio {}", flow.yield_ratio)));
    }
    let destinations = flow
        .destinations
        .iter()
        .map(|e| Ok((position(e.compartment)?, e.weight / destination_weight * flow.yield_ratio)))
        .collect::<ModelResult<Vec<_>>>()?;

    if flow.is_conserving() {
        let delivered: f64 = destinations.iter().map(|(_, share)| share).sum();
        if (delivered - 1.0).abs() > FRACTION_TOLERANCE {
            return Err(unbalanced(format!(
                "destinations receive {} of the outflow",
                delivered
            )));
        }
    }

    Ok(CompiledFlow {
        id: flow.id,
        name: flow.name.clone(),
        kind: flow.kind,
        sources,
        destinations,
        rate: flow.rate.compile(resolve),
    })
}

fn compile_output(output: &OutputConnection, flows: &[&Flow], index: &CompartmentIndex) -> CompiledOutput {
    let base_at = |id: CompartmentId| {
        index
            .position_of(id)
            .and_then(|p| index.get(p))
            .map(|c| c.base.as_str())
    };

    let mut terms = Vec::new();
    for (i, flow) in flows.iter().enumerate() {
        if flow.kind != FlowKind::Transfer {
            continue;
        }
        if !flow.sources.iter().any(|e| base_at(e.compartment) == Some(output.from.as_str())) {
            continue;
        }
        let weight = flow.destination_weight();
        let share: f64 = flow
            .destinations
            .iter()
            .filter(|e| base_at(e.compartment) == Some(output.to.as_str()))
            .map(|e| e.weight / weight * flow.yield_ratio)
            .sum();
        if share > 0.0 {
            terms.push((i, share));
        }
    }
    if terms.is_empty() {
        warn!(
            "tracked output '{}' matches no flow from '{}' to '{}'",
            output.name, output.from, output.to
        );
    }
    CompiledOutput {
        name: output.name.clone(),
        terms,
    }
}
