//! Rate specifications attached to flows.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, UnresolvedParameter};
use crate::math_expression::{is_special_variable, CompiledExpression, EvaluationContext, MathExpression};
use crate::time_function::TimeFunction;

/// A single rate term.
///
/// Strings deserialize the way modellers write them: `"0.1"` is a
/// constant, `"beta"` a parameter and `"beta * I / N"` an expression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RateSpecRepr", into = "RateSpecRepr")]
pub enum RateSpec {
    Constant(f64),
    Parameter(String),
    TimeVarying(TimeFunction),
    Expression(MathExpression),
    /// Total of all exit flows at the same evaluation; only valid for entry flows.
    ReplacedDeaths,
}

impl RateSpec {
    pub fn constant(value: f64) -> Self {
        Self::Constant(value)
    }

    pub fn parameter(name: impl Into<String>) -> Self {
        Self::Parameter(name.into())
    }

    /// Parse a rate written as text.
    pub fn parse(text: &str) -> Result<Self, ModelError> {
        let text = text.trim();
        // `inf` and `nan` are parameter names, not numbers.
        let numeric = text
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit() || matches!(c, '.' | '+' | '-'));
        if numeric {
            if let Ok(value) = text.parse::<f64>() {
                if !value.is_finite() {
                    return Err(ModelError::InvalidExpression {
                        formula: text.to_string(),
                        reason: "constant rate must be finite".to_string(),
                    });
                }
                return Ok(Self::Constant(value));
            }
        }
        if is_identifier(text) && !is_special_variable(text) {
            return Ok(Self::Parameter(text.to_string()));
        }
        MathExpression::parse(text)
            .map(Self::Expression)
            .map_err(|e| ModelError::InvalidExpression {
                formula: text.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn is_replaced_deaths(&self) -> bool {
        matches!(self, Self::ReplacedDeaths)
    }

    pub(crate) fn compile(&self, resolve_population: &dyn Fn(&str) -> Option<Vec<usize>>) -> CompiledTerm {
        match self {
            Self::Constant(value) => CompiledTerm::Constant(*value),
            Self::Parameter(name) => match resolve_population(name) {
                // A bare compartment name used as a rate reads its population.
                Some(indices) => {
                    CompiledTerm::Expression(CompiledExpression::Compartments(indices))
                }
                None => CompiledTerm::Parameter(name.clone()),
            },
            Self::TimeVarying(function) => CompiledTerm::TimeVarying(function.clone()),
            Self::Expression(expr) => {
                let compiled = CompiledExpression::compile(expr.ast(), resolve_population);
                match compiled.as_constant() {
                    Some(value) => CompiledTerm::Constant(value),
                    None => CompiledTerm::Expression(compiled),
                }
            }
            Self::ReplacedDeaths => CompiledTerm::ReplacedDeaths,
        }
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(value) => write!(f, "{}", value),
            Self::Parameter(name) => f.write_str(name),
            Self::TimeVarying(function) => match function {
                TimeFunction::Linear { .. } => f.write_str("linear(t)"),
                TimeFunction::Step { .. } => f.write_str("step(t)"),
                TimeFunction::Sigmoid { .. } => f.write_str("sigmoid(t)"),
            },
            Self::Expression(expr) => write!(f, "({})", expr),
            Self::ReplacedDeaths => f.write_str("total_deaths"),
        }
    }
}

impl From<f64> for RateSpec {
    fn from(value: f64) -> Self {
        Self::Constant(value)
    }
}

impl From<TimeFunction> for RateSpec {
    fn from(function: TimeFunction) -> Self {
        Self::TimeVarying(function)
    }
}

impl From<MathExpression> for RateSpec {
    fn from(expr: MathExpression) -> Self {
        Self::Expression(expr)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RateSpecRepr {
    Number(f64),
    Text(String),
    Tagged(TaggedRate),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TaggedRate {
    TimeVarying { function: TimeFunction },
    ReplacedDeaths,
}

impl TryFrom<RateSpecRepr> for RateSpec {
    type Error = String;

    fn try_from(repr: RateSpecRepr) -> Result<Self, Self::Error> {
        match repr {
            RateSpecRepr::Number(value) => Ok(Self::Constant(value)),
            RateSpecRepr::Text(text) => Self::parse(&text).map_err(|e| e.to_string()),
            RateSpecRepr::Tagged(TaggedRate::TimeVarying { function }) => {
                function.validate()?;
                Ok(Self::TimeVarying(function))
            }
            RateSpecRepr::Tagged(TaggedRate::ReplacedDeaths) => Ok(Self::ReplacedDeaths),
        }
    }
}

impl From<RateSpec> for RateSpecRepr {
    fn from(spec: RateSpec) -> Self {
        match spec {
            RateSpec::Constant(value) => Self::Number(value),
            RateSpec::Parameter(name) => Self::Text(name),
            RateSpec::Expression(expr) => Self::Text(expr.formula),
            RateSpec::TimeVarying(function) => Self::Tagged(TaggedRate::TimeVarying { function }),
            RateSpec::ReplacedDeaths => Self::Tagged(TaggedRate::ReplacedDeaths),
        }
    }
}

/// A flow's rate: a base term multiplied by the factors accumulated
/// through stratification (stratum shares and adjustments).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    pub base: RateSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub factors: Vec<RateSpec>,
}

impl Rate {
    pub fn new(base: impl Into<RateSpec>) -> Self {
        Self {
            base: base.into(),
            factors: Vec::new(),
        }
    }

    pub fn scaled_by(mut self, factor: RateSpec) -> Self {
        self.factors.push(factor);
        self
    }

    pub(crate) fn compile(&self, resolve_population: &dyn Fn(&str) -> Option<Vec<usize>>) -> CompiledRate {
        let mut multiplier = 1.0;
        let mut factors = Vec::new();
        for factor in &self.factors {
            match factor.compile(resolve_population) {
                CompiledTerm::Constant(value) => multiplier *= value,
                term => factors.push(term),
            }
        }
        CompiledRate {
            base: self.base.compile(resolve_population),
            factors,
            multiplier,
        }
    }
}

impl From<f64> for Rate {
    fn from(value: f64) -> Self {
        Self::new(RateSpec::Constant(value))
    }
}

impl From<RateSpec> for Rate {
    fn from(base: RateSpec) -> Self {
        Self::new(base)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base)?;
        for factor in &self.factors {
            write!(f, " * {}", factor)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CompiledTerm {
    Constant(f64),
    Parameter(String),
    TimeVarying(TimeFunction),
    Expression(CompiledExpression),
    ReplacedDeaths,
}

impl CompiledTerm {
    #[inline]
    fn evaluate(&self, context: &EvaluationContext<'_>, deaths: f64) -> Result<f64, UnresolvedParameter> {
        match self {
            Self::Constant(value) => Ok(*value),
            Self::Parameter(name) => context.parameter(name),
            Self::TimeVarying(function) => Ok(function.evaluate(context.time)),
            Self::Expression(expr) => expr.evaluate(context),
            Self::ReplacedDeaths => Ok(deaths),
        }
    }
}

/// Rate with identifiers resolved and constant factors folded into `multiplier`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CompiledRate {
    base: CompiledTerm,
    factors: Vec<CompiledTerm>,
    multiplier: f64,
}

impl CompiledRate {
    pub(crate) fn replaces_deaths(&self) -> bool {
        matches!(self.base, CompiledTerm::ReplacedDeaths)
    }

    /// Parameter names this rate looks up.
    pub(crate) fn parameter_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for term in std::iter::once(&self.base).chain(&self.factors) {
            match term {
                CompiledTerm::Parameter(name) => names.push(name.as_str()),
                CompiledTerm::Expression(expr) => names.extend(expr.parameters()),
                _ => {}
            }
        }
        names
    }

    /// `deaths` is the total exit magnitude of the current evaluation and is
    /// only read by [`RateSpec::ReplacedDeaths`] terms.
    #[inline]
    pub(crate) fn evaluate(&self, context: &EvaluationContext<'_>, deaths: f64) -> Result<f64, UnresolvedParameter> {
        let mut value = self.base.evaluate(context, deaths)? * self.multiplier;
        for factor in &self.factors {
            value *= factor.evaluate(context, deaths)?;
        }
        Ok(value)
    }
}
