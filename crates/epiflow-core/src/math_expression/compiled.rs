//! Compiled expressions for fast evaluation
//!
//! Identifiers are resolved once, when the model is compiled, into state
//! indices, special slots or parameter names. Constant subtrees are folded.
//! Evaluation walks the resolved tree without allocating a context.

use super::ast::{BinaryOperator, Expr, Function, UnaryOperator};
use super::{SPECIAL_VAR_E, SPECIAL_VAR_N, SPECIAL_VAR_PI, SPECIAL_VAR_T, SPECIAL_VAR_TIME};
use crate::error::UnresolvedParameter;
use crate::types::ParameterLookup;

/// Everything a rate needs at one evaluation.
pub struct EvaluationContext<'a> {
    pub time: f64,
    pub state: &'a [f64],
    /// Sum of `state`, computed once per evaluation.
    pub total: f64,
    pub parameters: &'a dyn ParameterLookup,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(time: f64, state: &'a [f64], parameters: &'a dyn ParameterLookup) -> Self {
        Self {
            time,
            state,
            total: state.iter().sum(),
            parameters,
        }
    }

    pub fn parameter(&self, name: &str) -> Result<f64, UnresolvedParameter> {
        self.parameters
            .lookup(name, self.time)
            .ok_or_else(|| UnresolvedParameter(name.to_string()))
    }
}

/// Expression with every identifier resolved to a slot.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledExpression {
    Constant(f64),
    Time,
    TotalPopulation,
    /// A single compartment: `I_mild`
    Compartment(usize),
    /// Sum over several compartments: `I`, `N_young`
    Compartments(Vec<usize>),
    Parameter(String),
    Unary(UnaryOperator, Box<CompiledExpression>),
    Binary(BinaryOperator, Box<CompiledExpression>, Box<CompiledExpression>),
    Call(Function, Vec<CompiledExpression>),
}

impl CompiledExpression {
    /// Resolve an expression tree.
    ///
    /// `resolve_population` maps an identifier to the state indices it sums
    /// over, or `None` when it is not a population name and must be a
    /// parameter.
    pub fn compile(expr: &Expr, resolve_population: &dyn Fn(&str) -> Option<Vec<usize>>) -> Self {
        match expr {
            Expr::Constant(value) => Self::Constant(*value),
            Expr::Variable(name) => match name.as_str() {
                SPECIAL_VAR_T | SPECIAL_VAR_TIME => Self::Time,
                SPECIAL_VAR_N => Self::TotalPopulation,
                SPECIAL_VAR_PI => Self::Constant(std::f64::consts::PI),
                SPECIAL_VAR_E => Self::Constant(std::f64::consts::E),
                _ => match resolve_population(name) {
                    Some(indices) if indices.len() == 1 => Self::Compartment(indices[0]),
                    Some(indices) => Self::Compartments(indices),
                    None => Self::Parameter(name.clone()),
                },
            },
            Expr::Unary(op, operand) => {
                let operand = Self::compile(operand, resolve_population);
                match operand {
                    Self::Constant(value) => Self::Constant(apply_unary(*op, value)),
                    operand => Self::Unary(*op, Box::new(operand)),
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = Self::compile(lhs, resolve_population);
                let rhs = Self::compile(rhs, resolve_population);
                match (lhs, rhs) {
                    (Self::Constant(a), Self::Constant(b)) => Self::Constant(op.apply(a, b)),
                    (lhs, rhs) => Self::Binary(*op, Box::new(lhs), Box::new(rhs)),
                }
            }
            Expr::Call(function, args) => {
                let args: Vec<Self> = args
                    .iter()
                    .map(|arg| Self::compile(arg, resolve_population))
                    .collect();
                match args.iter().map(Self::as_constant).collect::<Option<Vec<f64>>>() {
                    Some(values) => Self::Constant(function.apply(&values)),
                    None => Self::Call(*function, args),
                }
            }
        }
    }

    pub fn as_constant(&self) -> Option<f64> {
        match self {
            Self::Constant(value) => Some(*value),
            _ => None,
        }
    }

    /// Parameter names this expression will look up, in tree order.
    pub fn parameters(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_parameters(&mut names);
        names
    }

    fn collect_parameters<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Self::Parameter(name) => {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
            Self::Unary(_, operand) => operand.collect_parameters(names),
            Self::Binary(_, lhs, rhs) => {
                lhs.collect_parameters(names);
                rhs.collect_parameters(names);
            }
            Self::Call(_, args) => args.iter().for_each(|a| a.collect_parameters(names)),
            _ => {}
        }
    }

    /// Evaluate the compiled expression with the given context
    #[inline]
    pub fn evaluate(&self, context: &EvaluationContext<'_>) -> Result<f64, UnresolvedParameter> {
        match self {
            Self::Constant(value) => Ok(*value),
            Self::Time => Ok(context.time),
            Self::TotalPopulation => Ok(context.total),
            Self::Compartment(index) => Ok(context.state[*index]),
            Self::Compartments(indices) => Ok(indices.iter().map(|&i| context.state[i]).sum()),
            Self::Parameter(name) => context.parameter(name),
            Self::Unary(op, operand) => Ok(apply_unary(*op, operand.evaluate(context)?)),
            Self::Binary(op, lhs, rhs) => Ok(op.apply(lhs.evaluate(context)?, rhs.evaluate(context)?)),
            Self::Call(function, args) => {
                if args.len() <= 4 {
                    let mut values = [0.0; 4];
                    for (slot, arg) in values.iter_mut().zip(args) {
                        *slot = arg.evaluate(context)?;
                    }
                    Ok(function.apply(&values[..args.len()]))
                } else {
                    let values = args
                        .iter()
                        .map(|arg| arg.evaluate(context))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(function.apply(&values))
                }
            }
        }
    }
}

fn apply_unary(op: UnaryOperator, value: f64) -> f64 {
    match op {
        UnaryOperator::Neg => -value,
        UnaryOperator::Not => {
            if value == 0.0 {
                1.0
            } else {
                0.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math_expression::MathExpression;
    use crate::types::Parameters;

    fn compile(formula: &str) -> CompiledExpression {
        let expr = MathExpression::parse(formula).unwrap();
        // state layout: [S, I_mild, I_severe]
        CompiledExpression::compile(expr.ast(), &|name| match name {
            "S" => Some(vec![0]),
            "I" => Some(vec![1, 2]),
            "I_mild" => Some(vec![1]),
            _ => None,
        })
    }

    #[test]
    fn test_resolves_population_slots() {
        assert_eq!(compile("I"), CompiledExpression::Compartments(vec![1, 2]));
        assert_eq!(compile("I_mild"), CompiledExpression::Compartment(1));
        assert_eq!(compile("beta"), CompiledExpression::Parameter("beta".to_string()));
        assert_eq!(compile("t"), CompiledExpression::Time);
    }

    #[test]
    fn test_folds_constants() {
        assert_eq!(compile("2 * 3 + 1"), CompiledExpression::Constant(7.0));
        assert_eq!(compile("1 / 2"), CompiledExpression::Constant(0.5));
        assert_eq!(compile("max(1, 4, 2)"), CompiledExpression::Constant(4.0));
    }

    #[test]
    fn test_evaluates_against_state() {
        let params = Parameters::new().with("beta", 0.5);
        let state = [90.0, 8.0, 2.0];
        let context = EvaluationContext::new(3.0, &state, &params);

        let value = compile("beta * I / N").evaluate(&context).unwrap();
        assert!((value - 0.05).abs() < 1e-12);

        let value = compile("if(t > 2, I_mild, S)").evaluate(&context).unwrap();
        assert_eq!(value, 8.0);
    }

    #[test]
    fn test_missing_parameter_reports_name() {
        let params = Parameters::new();
        let state = [1.0, 1.0, 1.0];
        let context = EvaluationContext::new(0.0, &state, &params);
        let err = compile("gamma * S").evaluate(&context).unwrap_err();
        assert_eq!(err, UnresolvedParameter("gamma".to_string()));
    }
}
