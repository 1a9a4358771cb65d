mod compartment;
mod condition;
mod flow;
mod parameters;
mod stratification;

pub use compartment::{Compartment, CompartmentId, StratumLabel};
pub use condition::{Condition, LogicOperator, Rule, StratumOperator};
pub use flow::{AppliedAdjustment, Endpoint, Flow, FlowId, FlowKind, NewFlow};
pub use parameters::{LookupFn, Parameter, ParameterLookup, ParameterValue, Parameters};
pub use stratification::{
    Adjustment, AdjustmentKind, FlowRef, Stratification, Stratum, StratumTransition, PROPORTION_TOLERANCE,
};
