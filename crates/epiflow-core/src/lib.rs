//! Compartmental model construction: declare compartments and flows,
//! stratify them, and compile the result into a derivative function for
//! any ODE solver.

mod balance;
mod catalog;
mod compiler;
mod config;
pub mod error;
mod graph;
mod index;
pub mod math_expression;
mod model;
mod rate;
mod registry;
mod stratify;
pub mod time_function;
pub mod types;

pub use catalog::FlowCatalog;
pub use compiler::{compile, CompiledModel, DerivativeFn, OutputConnection};
pub use config::{CompartmentConfig, EndpointConfig, FlowConfig, ModelDeclaration};
pub use error::{EvaluationError, ModelError, ModelResult};
pub use graph::{GraphEdge, GraphNode, GraphView};
pub use index::CompartmentIndex;
pub use math_expression::{MathExpression, MathExpressionError};
pub use model::{BirthApproach, ModelBuilder, ModelOptions};
pub use rate::{Rate, RateSpec};
pub use registry::CompartmentRegistry;
pub use stratify::StratificationReport;
pub use time_function::TimeFunction;
pub use types::*;

/// A simulation engine that advances a compiled model through time.
///
/// Implemented by the reference runner; calibration or other drivers only
/// depend on this contract.
pub trait SimulationEngine {
    type Error: std::error::Error;

    /// Run from the current state over `times` and return one state per time.
    fn run(&mut self, times: &[f64]) -> Result<Vec<Vec<f64>>, Self::Error>;

    /// Advance by one step of `dt`.
    fn step(&mut self, dt: f64) -> Result<(), Self::Error>;

    /// Compartment names in state-vector order.
    fn compartments(&self) -> Vec<String>;

    fn population(&self) -> Vec<f64>;

    /// Restore the initial state and time.
    fn reset(&mut self);

    fn set_parameter(&mut self, name: &str, value: f64) -> Result<(), Self::Error>;

    fn parameters(&self) -> &Parameters;

    fn current_time(&self) -> f64;
}
