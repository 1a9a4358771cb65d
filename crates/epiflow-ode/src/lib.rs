//! Reference runner: integrates a compiled model over a time grid with a
//! fixed-step solver.

pub mod solvers;

use epiflow_core::{
    CompartmentIndex, CompiledModel, DerivativeFn, EvaluationError, ModelError, Parameters, SimulationEngine,
};
use log::{debug, warn};
use serde::Serialize;

pub use solvers::{Euler, Integrator, Method, RungeKutta4};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("invalid output times: {0}")]
    InvalidTimes(String),

    #[error("invalid step size {0}")]
    InvalidStep(f64),

    #[error("state became non-finite at t = {0}")]
    NonFiniteState(f64),
}

/// Compartment values and tracked outputs at every requested time.
#[derive(Clone, Debug, Serialize)]
pub struct Outputs {
    pub times: Vec<f64>,
    pub compartments: Vec<String>,
    /// One row per time, one column per compartment.
    pub values: Vec<Vec<f64>>,
    pub derived_names: Vec<String>,
    /// One row per time, one column per tracked output.
    pub derived: Vec<Vec<f64>>,
    #[serde(skip)]
    index: CompartmentIndex,
}

impl Outputs {
    /// Time series of one compartment.
    pub fn compartment(&self, name: &str) -> Option<Vec<f64>> {
        let position = self.index.position(name)?;
        Some(self.values.iter().map(|row| row[position]).collect())
    }

    /// Time series of one tracked output.
    pub fn derived(&self, name: &str) -> Option<Vec<f64>> {
        let position = self.derived_names.iter().position(|n| n == name)?;
        Some(self.derived.iter().map(|row| row[position]).collect())
    }

    /// Sum compartments by their stratum on `stratification`.
    pub fn aggregate(&self, stratification: &str) -> Vec<(String, Vec<f64>)> {
        self.index
            .groups(stratification)
            .into_iter()
            .map(|(label, positions)| (label, self.sum_columns(&positions)))
            .collect()
    }

    /// Sum compartments by base name, undoing every stratification.
    pub fn aggregate_by_base(&self) -> Vec<(String, Vec<f64>)> {
        self.index
            .base_groups()
            .into_iter()
            .map(|(base, positions)| (base, self.sum_columns(&positions)))
            .collect()
    }

    fn sum_columns(&self, positions: &[usize]) -> Vec<f64> {
        self.values
            .iter()
            .map(|row| positions.iter().map(|p| row[*p]).sum())
            .collect()
    }
}

/// Fixed-step ODE engine over a compiled model.
pub struct OdeEngine {
    derivative: DerivativeFn,
    index: CompartmentIndex,
    initial_state: Vec<f64>,
    initial_time: f64,
    state: Vec<f64>,
    time: f64,
    parameters: Parameters,
    method: Method,
    max_step: f64,
    integrator: Box<dyn Integrator>,
}

impl Clone for OdeEngine {
    fn clone(&self) -> Self {
        Self {
            derivative: self.derivative.clone(),
            index: self.index.clone(),
            initial_state: self.initial_state.clone(),
            initial_time: self.initial_time,
            state: self.state.clone(),
            time: self.time,
            parameters: self.parameters.clone(),
            method: self.method,
            max_step: self.max_step,
            integrator: solvers::integrator(self.method, self.state.len()),
        }
    }
}

impl OdeEngine {
    pub fn new(model: CompiledModel, parameters: Parameters) -> Self {
        let (index, derivative, initial_state) = model.into_parts();
        let method = Method::default();
        Self {
            integrator: solvers::integrator(method, initial_state.len()),
            derivative,
            index,
            state: initial_state.clone(),
            initial_state,
            initial_time: 0.0,
            time: 0.0,
            parameters,
            method,
            max_step: 0.1,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self.integrator = solvers::integrator(method, self.initial_state.len());
        self
    }

    /// Largest step taken between two output times.
    pub fn with_max_step(mut self, max_step: f64) -> Result<Self, RunError> {
        if !max_step.is_finite() || max_step <= 0.0 {
            return Err(RunError::InvalidStep(max_step));
        }
        self.max_step = max_step;
        Ok(self)
    }

    pub fn with_start_time(mut self, time: f64) -> Self {
        self.initial_time = time;
        self.time = time;
        self
    }

    pub fn index(&self) -> &CompartmentIndex {
        &self.index
    }

    /// Integrate over `times` and record compartments and tracked outputs.
    ///
    /// Unsorted times are sorted first. The first time may not precede the
    /// engine's current time.
    pub fn solve(&mut self, times: &[f64]) -> Result<Outputs, RunError> {
        let times = self.prepare_times(times)?;
        let mut values = Vec::with_capacity(times.len());
        let mut derived = Vec::with_capacity(times.len());

        for &target in &times {
            self.advance_to(target)?;
            values.push(self.state.clone());
            derived.push(self.derivative.outputs(self.time, &self.state, &self.parameters)?);
        }

        debug!(
            "solved {} compartments over {} output times with {:?}",
            self.state.len(),
            times.len(),
            self.method
        );

        Ok(Outputs {
            times,
            compartments: self.index.names().to_vec(),
            values,
            derived_names: self
                .derivative
                .output_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            derived,
            index: self.index.clone(),
        })
    }

    fn prepare_times(&self, times: &[f64]) -> Result<Vec<f64>, RunError> {
        if times.iter().any(|t| !t.is_finite()) {
            return Err(RunError::InvalidTimes("times must be finite".to_string()));
        }
        let mut sorted = times.to_vec();
        if sorted.windows(2).any(|w| w[0] > w[1]) {
            warn!("output times are not sorted; sorting them");
            sorted.sort_by(f64::total_cmp);
        }
        if let Some(first) = sorted.first() {
            if *first < self.time {
                return Err(RunError::InvalidTimes(format!(
                    "first time {} precedes the current time {}",
                    first, self.time
                )));
            }
        }
        Ok(sorted)
    }

    fn advance_to(&mut self, target: f64) -> Result<(), RunError> {
        let span = target - self.time;
        if span <= 0.0 {
            return Ok(());
        }
        let steps = (span / self.max_step).ceil().max(1.0) as usize;
        let dt = span / steps as f64;
        for _ in 0..steps {
            self.integrate(dt)?;
        }
        // Land exactly on the output time.
        self.time = target;
        Ok(())
    }

    fn integrate(&mut self, dt: f64) -> Result<(), RunError> {
        self.integrator
            .step(&self.derivative, &self.parameters, &mut self.time, &mut self.state, dt)?;
        if self.state.iter().any(|x| !x.is_finite()) {
            return Err(RunError::NonFiniteState(self.time));
        }
        Ok(())
    }
}

impl SimulationEngine for OdeEngine {
    type Error = RunError;

    fn run(&mut self, times: &[f64]) -> Result<Vec<Vec<f64>>, RunError> {
        self.solve(times).map(|outputs| outputs.values)
    }

    fn step(&mut self, dt: f64) -> Result<(), RunError> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(RunError::InvalidStep(dt));
        }
        self.integrate(dt)
    }

    fn compartments(&self) -> Vec<String> {
        self.index.names().to_vec()
    }

    fn population(&self) -> Vec<f64> {
        self.state.clone()
    }

    fn reset(&mut self) {
        self.state = self.initial_state.clone();
        self.time = self.initial_time;
    }

    fn set_parameter(&mut self, name: &str, value: f64) -> Result<(), RunError> {
        if !value.is_finite() {
            return Err(RunError::Model(ModelError::Config(format!(
                "parameter '{}' must be finite, got {}",
                name, value
            ))));
        }
        self.parameters.set(name, value);
        Ok(())
    }

    fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    fn current_time(&self) -> f64 {
        self.time
    }
}
