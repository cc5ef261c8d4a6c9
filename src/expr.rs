use std::fmt::{self, Display, Formatter};
use std::ops::{Add, Mul};

/// A closed index-arithmetic expression over the dimensions of an iteration
/// space (or, for slice offsets, over a node's index operands).
///
/// Built once and immutable afterward; [`IndexExpr::eval`] is deterministic.
/// Floor division and modulo are included because the window-to-pixel mapping
/// of a lowered convolution is not purely affine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexExpr {
    Dim(usize),
    Const(i64),
    Add(Box<IndexExpr>, Box<IndexExpr>),
    Mul(Box<IndexExpr>, i64),
    FloorDiv(Box<IndexExpr>, i64),
    Mod(Box<IndexExpr>, i64),
}

/// A multi-dimensional access map: one result expression per operand
/// dimension.
pub type IndexMap = Vec<IndexExpr>;

impl IndexExpr {
    pub fn dim(d: usize) -> IndexExpr {
        IndexExpr::Dim(d)
    }

    pub fn floor_div(self, divisor: i64) -> IndexExpr {
        debug_assert!(divisor > 0);
        match self {
            IndexExpr::Const(c) => IndexExpr::Const(c.div_euclid(divisor)),
            e => IndexExpr::FloorDiv(Box::new(e), divisor),
        }
    }

    pub fn modulo(self, divisor: i64) -> IndexExpr {
        debug_assert!(divisor > 0);
        match self {
            IndexExpr::Const(c) => IndexExpr::Const(c.rem_euclid(divisor)),
            e => IndexExpr::Mod(Box::new(e), divisor),
        }
    }

    /// Evaluates the expression at `point`, one value per `Dim` index.
    pub fn eval(&self, point: &[i64]) -> i64 {
        match self {
            IndexExpr::Dim(d) => point[*d],
            IndexExpr::Const(c) => *c,
            IndexExpr::Add(a, b) => a.eval(point) + b.eval(point),
            IndexExpr::Mul(a, c) => a.eval(point) * c,
            IndexExpr::FloorDiv(a, c) => a.eval(point).div_euclid(*c),
            IndexExpr::Mod(a, c) => a.eval(point).rem_euclid(*c),
        }
    }
}

impl Add for IndexExpr {
    type Output = Self;

    fn add(self, rhs: IndexExpr) -> Self::Output {
        match (self, rhs) {
            (IndexExpr::Const(a), IndexExpr::Const(b)) => IndexExpr::Const(a + b),
            (IndexExpr::Const(0), e) | (e, IndexExpr::Const(0)) => e,
            (a, b) => IndexExpr::Add(Box::new(a), Box::new(b)),
        }
    }
}

impl Add<i64> for IndexExpr {
    type Output = Self;

    fn add(self, rhs: i64) -> Self::Output {
        self + IndexExpr::Const(rhs)
    }
}

impl Mul<i64> for IndexExpr {
    type Output = Self;

    fn mul(self, rhs: i64) -> Self::Output {
        match (self, rhs) {
            (_, 0) => IndexExpr::Const(0),
            (e, 1) => e,
            (IndexExpr::Const(c), f) => IndexExpr::Const(c * f),
            (e, f) => IndexExpr::Mul(Box::new(e), f),
        }
    }
}

impl Display for IndexExpr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            IndexExpr::Dim(d) => write!(f, "d{}", d),
            IndexExpr::Const(c) => write!(f, "{}", c),
            IndexExpr::Add(a, b) => write!(f, "({} + {})", a, b),
            IndexExpr::Mul(a, c) => write!(f, "({} * {})", a, c),
            IndexExpr::FloorDiv(a, c) => write!(f, "({} floordiv {})", a, c),
            IndexExpr::Mod(a, c) => write!(f, "({} mod {})", a, c),
        }
    }
}
