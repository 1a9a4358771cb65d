//! # Rate Expressions
//!
//! Mathematical formulas used as flow rates, e.g. `beta * I / N`.
//!
//! ## Special Variables
//!
//! - `t` / `time` - Current simulation time
//! - `N` - Total population (sum of all compartments)
//! - `N_<stratum>` - Population of every compartment carrying that stratum label
//! - `pi`, `e` - Mathematical constants
//!
//! Any other identifier is resolved when the model is compiled: a
//! compartment base name (`I`) sums every compartment derived from it, an
//! exact stratified name (`I_mild`) reads that compartment, and anything
//! else is looked up as a parameter at evaluation time.
//!
//! ## Supported Operators
//!
//! - Arithmetic: `+`, `-`, `*`, `/`, `%` (modulo), `^` or `**` (power)
//! - Comparison: `<`, `>`, `<=`, `>=`, `==`, `!=` (yield 1.0 or 0.0)
//! - Logical: `&&`, `||`, `!`
//!
//! ## Supported Functions
//!
//! `sin cos tan asin acos atan atan2 sinh cosh tanh exp ln log log2 log10
//! sqrt cbrt abs pow hypot min max floor ceil round if`, with or without a
//! `math::` prefix. `log(x)` is the natural logarithm.
//!
//! ## Example
//! ```rust
//! use epiflow_core::MathExpression;
//!
//! let expr = MathExpression::parse("beta * (1 + 0.2 * sin(2 * pi * t / 365))").unwrap();
//! assert_eq!(expr.variables(), vec!["beta".to_string()]);
//! ```

pub mod ast;
pub mod compiled;
pub mod parser;

use serde::{Deserialize, Serialize};

pub use ast::Expr;
pub use compiled::{CompiledExpression, EvaluationContext};

pub(crate) const SPECIAL_VAR_N: &str = "N";
pub(crate) const SPECIAL_VAR_T: &str = "t";
pub(crate) const SPECIAL_VAR_TIME: &str = "time";
pub(crate) const SPECIAL_VAR_PI: &str = "pi";
pub(crate) const SPECIAL_VAR_E: &str = "e";

/// Errors that can occur while parsing an expression
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MathExpressionError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("invalid expression: {0}")]
    InvalidExpression(String),
}

/// Converts Python-style operators to evalexpr syntax (`**` → `^`).
fn preprocess_formula(formula: &str) -> String {
    formula.replace("**", "^")
}

pub(crate) fn is_special_variable(name: &str) -> bool {
    matches!(
        name,
        SPECIAL_VAR_N | SPECIAL_VAR_T | SPECIAL_VAR_TIME | SPECIAL_VAR_PI | SPECIAL_VAR_E
    )
}

/// A parsed mathematical expression.
///
/// Parsing happens once at declaration; unknown identifiers are not an
/// error until the compiled model is evaluated without them.
#[derive(Debug, Clone, Serialize)]
pub struct MathExpression {
    /// The original mathematical formula as a string
    pub formula: String,
    #[serde(skip)]
    ast: Expr,
}

impl PartialEq for MathExpression {
    fn eq(&self, other: &Self) -> bool {
        self.formula == other.formula
    }
}

// Custom deserialize to ensure the AST is populated
impl<'de> Deserialize<'de> for MathExpression {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct MathExpressionData {
            formula: String,
        }

        let data = MathExpressionData::deserialize(deserializer)?;
        MathExpression::parse(&data.formula).map_err(serde::de::Error::custom)
    }
}

impl MathExpression {
    pub fn parse(formula: &str) -> Result<Self, MathExpressionError> {
        let ast = parser::parse_expression(&preprocess_formula(formula))?;
        Ok(Self {
            formula: formula.to_string(),
            ast,
        })
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Identifiers referenced by the formula, excluding special variables,
    /// deduplicated in first-occurrence order.
    pub fn variables(&self) -> Vec<String> {
        let mut variables: Vec<String> = Vec::new();
        self.ast.for_each_variable(&mut |name| {
            if !is_special_variable(name) && !variables.iter().any(|v| v == name) {
                variables.push(name.to_string());
            }
        });
        variables
    }
}

impl std::fmt::Display for MathExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.formula)
    }
}
