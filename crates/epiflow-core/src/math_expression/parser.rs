//! Parser for converting evalexpr AST to our expression AST
//!
//! evalexpr is only used to tokenize and build the operator tree; the
//! resulting tree is converted into [`Expr`] so evaluation never needs an
//! evalexpr context.

use evalexpr::{Node, Operator};

use super::ast::{BinaryOperator, Expr, Function, UnaryOperator};
use super::MathExpressionError;

/// Parse a preprocessed formula string into our AST
pub fn parse_expression(preprocessed: &str) -> Result<Expr, MathExpressionError> {
    let tree = evalexpr::build_operator_tree(preprocessed)
        .map_err(|e| MathExpressionError::Syntax(e.to_string()))?;
    convert_node(&tree)
}

fn binary(node: &Node, op: BinaryOperator, name: &str) -> Result<Expr, MathExpressionError> {
    match node.children() {
        [lhs, rhs] => Ok(Expr::binary(op, convert_node(lhs)?, convert_node(rhs)?)),
        _ => Err(MathExpressionError::InvalidExpression(format!(
            "{} requires exactly 2 operands",
            name
        ))),
    }
}

fn unary(node: &Node, op: UnaryOperator, name: &str) -> Result<Expr, MathExpressionError> {
    match node.children() {
        [operand] => Ok(Expr::unary(op, convert_node(operand)?)),
        _ => Err(MathExpressionError::InvalidExpression(format!(
            "{} requires exactly 1 operand",
            name
        ))),
    }
}

/// Unwrap a function's argument node into a flat argument list.
fn call_arguments(node: &Node) -> Result<Vec<Expr>, MathExpressionError> {
    match node.operator() {
        Operator::RootNode if node.children().len() == 1 => call_arguments(&node.children()[0]),
        Operator::Tuple => node.children().iter().map(convert_node).collect(),
        _ => Ok(vec![convert_node(node)?]),
    }
}

/// Convert an evalexpr Node to our Expr
fn convert_node(node: &Node) -> Result<Expr, MathExpressionError> {
    match node.operator() {
        Operator::RootNode => match node.children() {
            [child] => convert_node(child),
            [] => Err(MathExpressionError::InvalidExpression(
                "empty expression".to_string(),
            )),
            _ => Err(MathExpressionError::InvalidExpression(
                "RootNode should have exactly 1 child".to_string(),
            )),
        },

        Operator::Const { value } => match value {
            evalexpr::Value::Float(f) => Ok(Expr::Constant(*f)),
            evalexpr::Value::Int(i) => Ok(Expr::Constant(*i as f64)),
            evalexpr::Value::Boolean(b) => Ok(Expr::Constant(if *b { 1.0 } else { 0.0 })),
            _ => Err(MathExpressionError::InvalidExpression(
                "Unsupported constant type".to_string(),
            )),
        },

        Operator::VariableIdentifierRead { identifier } => Ok(Expr::Variable(identifier.clone())),

        Operator::Add => binary(node, BinaryOperator::Add, "Add"),
        Operator::Sub => binary(node, BinaryOperator::Sub, "Sub"),
        Operator::Mul => binary(node, BinaryOperator::Mul, "Mul"),
        Operator::Div => binary(node, BinaryOperator::Div, "Div"),
        Operator::Mod => binary(node, BinaryOperator::Mod, "Mod"),
        Operator::Exp => binary(node, BinaryOperator::Pow, "Exp"),
        Operator::Lt => binary(node, BinaryOperator::Lt, "Lt"),
        Operator::Gt => binary(node, BinaryOperator::Gt, "Gt"),
        Operator::Leq => binary(node, BinaryOperator::Le, "Leq"),
        Operator::Geq => binary(node, BinaryOperator::Ge, "Geq"),
        Operator::Eq => binary(node, BinaryOperator::Eq, "Eq"),
        Operator::Neq => binary(node, BinaryOperator::Ne, "Neq"),
        Operator::And => binary(node, BinaryOperator::And, "And"),
        Operator::Or => binary(node, BinaryOperator::Or, "Or"),

        Operator::Neg => unary(node, UnaryOperator::Neg, "Neg"),
        Operator::Not => unary(node, UnaryOperator::Not, "Not"),

        Operator::FunctionIdentifier { identifier } => {
            let function = Function::from_name(identifier)
                .ok_or_else(|| MathExpressionError::UnknownFunction(identifier.clone()))?;
            let args = match node.children() {
                [argument] => call_arguments(argument)?,
                [] => Vec::new(),
                _ => {
                    return Err(MathExpressionError::InvalidExpression(format!(
                        "malformed call to '{}'",
                        identifier
                    )))
                }
            };
            let (min, max) = function.arity();
            if args.len() < min || max.is_some_and(|max| args.len() > max) {
                return Err(MathExpressionError::InvalidExpression(format!(
                    "'{}' called with {} argument(s)",
                    identifier,
                    args.len()
                )));
            }
            Ok(Expr::Call(function, args))
        }

        other => Err(MathExpressionError::InvalidExpression(format!(
            "unsupported operator {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_precedence() {
        let expr = parse_expression("beta * S + 2").unwrap();
        assert_eq!(
            expr,
            Expr::binary(
                BinaryOperator::Add,
                Expr::binary(
                    BinaryOperator::Mul,
                    Expr::Variable("beta".to_string()),
                    Expr::Variable("S".to_string())
                ),
                Expr::Constant(2.0)
            )
        );
    }

    #[test]
    fn test_parses_function_calls() {
        let expr = parse_expression("max(a, b, 1)").unwrap();
        match expr {
            Expr::Call(Function::Max, args) => assert_eq!(args.len(), 3),
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            parse_expression("math::sin(t)").unwrap(),
            Expr::Call(Function::Sin, _)
        ));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            parse_expression("foo(1)"),
            Err(MathExpressionError::UnknownFunction(_))
        ));
        assert!(parse_expression("pow(1)").is_err());
        assert!(parse_expression("beta *").is_err());
    }
}
