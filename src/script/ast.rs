//! Syntax tree for sandboxed snippets

/// A top-level statement
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `const name = init` (also `let`/`var`)
    Declare {
        name: String,
        init: Expr,
        /// Length of the source remaining at the declaration keyword,
        /// used to locate semantic errors after parsing
        rest_len: usize,
    },
    /// Expression evaluated for its side effects
    Expr(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Undefined,
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Ident(String),
    Member {
        object: Box<Expr>,
        property: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    New {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn member(object: Expr, property: impl Into<String>) -> Self {
        Expr::Member {
            object: Box::new(object),
            property: property.into(),
        }
    }

    /// Source-like rendering of callee paths for error messages
    /// (`synth.triggerAttackRelease`, `Tone.Transport.start`)
    pub fn describe(&self) -> String {
        match self {
            Expr::Ident(name) => name.clone(),
            Expr::Member { object, property } => format!("{}.{}", object.describe(), property),
            Expr::Index { object, .. } => format!("{}[...]", object.describe()),
            Expr::Call { callee, .. } => format!("{}(...)", callee.describe()),
            Expr::New { callee, .. } => format!("(new {}(...))", callee.describe()),
            Expr::Str(s) => format!("\"{}\"", s),
            Expr::Number(n) => n.to_string(),
            Expr::Bool(b) => b.to_string(),
            Expr::Null => "null".to_string(),
            Expr::Undefined => "undefined".to_string(),
            _ => "(intermediate value)".to_string(),
        }
    }
}
