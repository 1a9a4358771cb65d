//! Error types for model construction, stratification, compilation and evaluation.

use crate::types::{CompartmentId, FlowId};

/// Errors raised while declaring, stratifying or compiling a model.
///
/// Every failing call leaves the builder in its last valid state.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    // ===== Declaration errors =====
    #[error("compartment '{0}' already exists")]
    DuplicateCompartment(String),

    #[error("unknown compartment '{0}'")]
    UnknownCompartment(String),

    #[error("invalid compartment name '{0}'")]
    InvalidName(String),

    #[error("compartment {id} ('{name}') has been retired by stratification")]
    RetiredCompartment { id: CompartmentId, name: String },

    #[error("invalid population {value} for compartment '{compartment}'")]
    InvalidPopulation { compartment: String, value: f64 },

    #[error("malformed flow '{flow}': {reason}")]
    MalformedFlow { flow: String, reason: String },

    #[error("unknown flow {0}")]
    UnknownFlow(FlowId),

    #[error("invalid rate expression '{formula}': {reason}")]
    InvalidExpression { formula: String, reason: String },

    #[error("starting population {total} is smaller than the declared total {declared}")]
    PopulationOverflow { total: f64, declared: f64 },

    #[error("birth approach already configured")]
    BirthApproachAlreadySet,

    // ===== Stratification consistency errors =====
    #[error("stratification '{stratification}': proportions sum to {sum}, expected 1")]
    InvalidProportions { stratification: String, sum: f64 },

    #[error("stratification '{stratification}': {reason}")]
    InvalidStratification {
        stratification: String,
        reason: String,
    },

    #[error("compartment '{compartment}' is already stratified by '{stratification}'")]
    AlreadyStratified {
        compartment: String,
        stratification: String,
    },

    #[error("stratification '{stratification}': unknown stratum '{stratum}' referenced by {context}")]
    UnknownStratum {
        stratification: String,
        stratum: String,
        context: String,
    },

    #[error(
        "stratification '{stratification}': adjustment for flow {flow} in stratum '{stratum}' matches no replicated flow"
    )]
    UnmatchedAdjustment {
        stratification: String,
        flow: String,
        stratum: String,
    },

    #[error(
        "stratification '{stratification}': ambiguous adjustment of flow {flow} ('{flow_name}') in stratum '{stratum}': {reason}"
    )]
    AmbiguousAdjustment {
        stratification: String,
        flow: FlowId,
        flow_name: String,
        stratum: String,
        reason: String,
    },

    // ===== Balance errors =====
    #[error(
        "mass leak at compartment '{compartment}' ({direction}) after stratification '{stratification}': expected {expected}, found {actual}"
    )]
    MassLeak {
        stratification: String,
        compartment: String,
        direction: &'static str,
        expected: f64,
        actual: f64,
    },

    #[error("flow {flow} ('{flow_name}') is unbalanced: {reason}")]
    UnbalancedFlow {
        flow: FlowId,
        flow_name: String,
        reason: String,
    },

    #[error("flow {flow} ('{flow_name}') references inactive compartment {compartment}")]
    DanglingReference {
        flow: FlowId,
        flow_name: String,
        compartment: CompartmentId,
    },

    // ===== Configuration =====
    #[error("configuration error: {0}")]
    Config(String),
}

/// Errors raised by a compiled derivative function.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    #[error("unknown parameter '{parameter}' referenced by flow {flow} ('{flow_name}')")]
    UnknownParameter {
        parameter: String,
        flow: FlowId,
        flow_name: String,
    },

    #[error("negative rate {rate} for flow {flow} ('{flow_name}') at t = {time}")]
    NegativeRate {
        flow: FlowId,
        flow_name: String,
        rate: f64,
        time: f64,
    },

    #[error("non-finite rate {rate} for flow {flow} ('{flow_name}') at t = {time}")]
    NonFiniteRate {
        flow: FlowId,
        flow_name: String,
        rate: f64,
        time: f64,
    },

    #[error("state vector has length {actual}, expected {expected}")]
    StateLength { expected: usize, actual: usize },
}

/// A parameter name that could not be resolved during rate evaluation.
///
/// Carries no flow context; the compiler attaches it when converting into
/// [`EvaluationError::UnknownParameter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedParameter(pub String);

impl UnresolvedParameter {
    pub(crate) fn into_evaluation_error(self, flow: FlowId, flow_name: &str) -> EvaluationError {
        EvaluationError::UnknownParameter {
            parameter: self.0,
            flow,
            flow_name: flow_name.to_string(),
        }
    }
}

pub type ModelResult<T> = Result<T, ModelError>;
