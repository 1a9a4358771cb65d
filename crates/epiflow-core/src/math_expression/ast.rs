//! Internal expression tree for rate formulas.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOperator {
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        let truth = |b: bool| if b { 1.0 } else { 0.0 };
        match self {
            Self::Add => lhs + rhs,
            Self::Sub => lhs - rhs,
            Self::Mul => lhs * rhs,
            Self::Div => lhs / rhs,
            Self::Mod => lhs % rhs,
            Self::Pow => lhs.powf(rhs),
            Self::Lt => truth(lhs < rhs),
            Self::Gt => truth(lhs > rhs),
            Self::Le => truth(lhs <= rhs),
            Self::Ge => truth(lhs >= rhs),
            Self::Eq => truth(lhs == rhs),
            Self::Ne => truth(lhs != rhs),
            Self::And => truth(lhs != 0.0 && rhs != 0.0),
            Self::Or => truth(lhs != 0.0 || rhs != 0.0),
        }
    }
}

/// Built-in functions. `math::` prefixes are accepted and stripped by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Ln,
    Log2,
    Log10,
    Sqrt,
    Cbrt,
    Abs,
    Pow,
    Hypot,
    Min,
    Max,
    Floor,
    Ceil,
    Round,
    If,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.strip_prefix("math::").unwrap_or(name);
        Some(match name {
            "sin" => Self::Sin,
            "cos" => Self::Cos,
            "tan" => Self::Tan,
            "asin" => Self::Asin,
            "acos" => Self::Acos,
            "atan" => Self::Atan,
            "atan2" => Self::Atan2,
            "sinh" => Self::Sinh,
            "cosh" => Self::Cosh,
            "tanh" => Self::Tanh,
            "exp" => Self::Exp,
            "ln" | "log" => Self::Ln,
            "log2" => Self::Log2,
            "log10" => Self::Log10,
            "sqrt" => Self::Sqrt,
            "cbrt" => Self::Cbrt,
            "abs" => Self::Abs,
            "pow" => Self::Pow,
            "hypot" => Self::Hypot,
            "min" => Self::Min,
            "max" => Self::Max,
            "floor" => Self::Floor,
            "ceil" => Self::Ceil,
            "round" => Self::Round,
            "if" => Self::If,
            _ => return None,
        })
    }

    /// Accepted argument counts as `(min, max)`; `None` means unbounded.
    pub fn arity(self) -> (usize, Option<usize>) {
        match self {
            Self::Atan2 | Self::Pow | Self::Hypot => (2, Some(2)),
            Self::If => (3, Some(3)),
            Self::Min | Self::Max => (1, None),
            _ => (1, Some(1)),
        }
    }

    /// Apply to already-evaluated arguments. Arity is checked at parse time.
    pub fn apply(self, args: &[f64]) -> f64 {
        match self {
            Self::Sin => args[0].sin(),
            Self::Cos => args[0].cos(),
            Self::Tan => args[0].tan(),
            Self::Asin => args[0].asin(),
            Self::Acos => args[0].acos(),
            Self::Atan => args[0].atan(),
            Self::Atan2 => args[0].atan2(args[1]),
            Self::Sinh => args[0].sinh(),
            Self::Cosh => args[0].cosh(),
            Self::Tanh => args[0].tanh(),
            Self::Exp => args[0].exp(),
            Self::Ln => args[0].ln(),
            Self::Log2 => args[0].log2(),
            Self::Log10 => args[0].log10(),
            Self::Sqrt => args[0].sqrt(),
            Self::Cbrt => args[0].cbrt(),
            Self::Abs => args[0].abs(),
            Self::Pow => args[0].powf(args[1]),
            Self::Hypot => args[0].hypot(args[1]),
            Self::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Self::Floor => args[0].floor(),
            Self::Ceil => args[0].ceil(),
            Self::Round => args[0].round(),
            Self::If => {
                if args[0] != 0.0 {
                    args[1]
                } else {
                    args[2]
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant(f64),
    Variable(String),
    Unary(UnaryOperator, Box<Expr>),
    Binary(BinaryOperator, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

impl Expr {
    pub fn binary(op: BinaryOperator, lhs: Expr, rhs: Expr) -> Self {
        Self::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn unary(op: UnaryOperator, operand: Expr) -> Self {
        Self::Unary(op, Box::new(operand))
    }

    /// Visit every variable identifier in left-to-right order.
    pub fn for_each_variable<'a>(&'a self, visit: &mut impl FnMut(&'a str)) {
        match self {
            Self::Constant(_) => {}
            Self::Variable(name) => visit(name),
            Self::Unary(_, operand) => operand.for_each_variable(visit),
            Self::Binary(_, lhs, rhs) => {
                lhs.for_each_variable(visit);
                rhs.for_each_variable(visit);
            }
            Self::Call(_, args) => {
                for arg in args {
                    arg.for_each_variable(visit);
                }
            }
        }
    }
}
