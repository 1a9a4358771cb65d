use epiflow_core::{DerivativeFn, EvaluationError, ParameterLookup};
use serde::{Deserialize, Serialize};

/// Fixed-step integration scheme.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Euler,
    #[default]
    RungeKutta4,
}

/// A solver that steps a compiled model forward.
pub trait Integrator: Send {
    /// Advance `state` from `t` to `t + dt`, updating both.
    fn step(
        &mut self,
        system: &DerivativeFn,
        parameters: &dyn ParameterLookup,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) -> Result<(), EvaluationError>;
}

pub fn integrator(method: Method, dimension: usize) -> Box<dyn Integrator> {
    match method {
        Method::Euler => Box::new(Euler::new(dimension)),
        Method::RungeKutta4 => Box::new(RungeKutta4::new(dimension)),
    }
}

/// Explicit Euler
pub struct Euler {
    rate: Vec<f64>,
}

impl Euler {
    pub fn new(dimension: usize) -> Self {
        Self {
            rate: vec![0.0; dimension],
        }
    }
}

impl Integrator for Euler {
    fn step(
        &mut self,
        system: &DerivativeFn,
        parameters: &dyn ParameterLookup,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) -> Result<(), EvaluationError> {
        system.evaluate_into(*t, state, parameters, &mut self.rate)?;
        for (x, dx) in state.iter_mut().zip(&self.rate) {
            *x += dt * dx;
        }
        *t += dt;
        Ok(())
    }
}

/// Classic Runge-Kutta 4th order
pub struct RungeKutta4 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    tmp: Vec<f64>,
}

impl RungeKutta4 {
    pub fn new(dimension: usize) -> Self {
        Self {
            k1: vec![0.0; dimension],
            k2: vec![0.0; dimension],
            k3: vec![0.0; dimension],
            k4: vec![0.0; dimension],
            tmp: vec![0.0; dimension],
        }
    }
}

impl Integrator for RungeKutta4 {
    fn step(
        &mut self,
        system: &DerivativeFn,
        parameters: &dyn ParameterLookup,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) -> Result<(), EvaluationError> {
        let t0 = *t;
        let half = 0.5 * dt;

        system.evaluate_into(t0, state, parameters, &mut self.k1)?;

        for i in 0..state.len() {
            self.tmp[i] = state[i] + half * self.k1[i];
        }
        system.evaluate_into(t0 + half, &self.tmp, parameters, &mut self.k2)?;

        for i in 0..state.len() {
            self.tmp[i] = state[i] + half * self.k2[i];
        }
        system.evaluate_into(t0 + half, &self.tmp, parameters, &mut self.k3)?;

        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        system.evaluate_into(t0 + dt, &self.tmp, parameters, &mut self.k4)?;

        for i in 0..state.len() {
            state[i] += dt / 6.0 * (self.k1[i] + 2.0 * self.k2[i] + 2.0 * self.k3[i] + self.k4[i]);
        }
        *t = t0 + dt;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epiflow_core::{ModelBuilder, Parameters};

    fn decay() -> DerivativeFn {
        let mut builder = ModelBuilder::new("decay");
        builder.add_compartment("X", 1.0).unwrap();
        builder.add_death_flow("k", "X").unwrap();
        builder.compile().unwrap().derivative().clone()
    }

    #[test]
    fn test_rk4_matches_exponential_decay() {
        let system = decay();
        let params = Parameters::new().with("k", 1.0);
        let mut solver = RungeKutta4::new(1);
        let mut t = 0.0;
        let mut state = [1.0];
        for _ in 0..100 {
            solver.step(&system, &params, &mut t, &mut state, 0.01).unwrap();
        }
        assert!((t - 1.0).abs() < 1e-12);
        assert!((state[0] - (-1.0f64).exp()).abs() < 1e-9);
    }

    #[test]
    fn test_euler_first_order() {
        let system = decay();
        let params = Parameters::new().with("k", 0.5);
        let mut solver = Euler::new(1);
        let mut t = 0.0;
        let mut state = [2.0];
        solver.step(&system, &params, &mut t, &mut state, 0.1).unwrap();
        assert!((state[0] - 1.9).abs() < 1e-12);
    }
}
