//! The expression vocabulary shared by grammars and residuals.

use crate::datatype::{DatatypeRef, Value};
use crate::name_class::NameClass;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Handle to a canonical expression node. Two handles into the same pool are
/// equal iff the nodes are structurally identical.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub struct ExprId(pub(crate) u32);

impl ExprId {
    pub const NULL_SET: ExprId = ExprId(0);
    pub const EPSILON: ExprId = ExprId(1);
    pub const ANY_STRING: ExprId = ExprId(2);

    /// Handles below this index are seeded identically in every pool.
    pub(crate) const SEEDED: usize = 3;

    pub fn from_index(index: usize) -> ExprId {
        ExprId(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifies a named reference within one grammar.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub struct RefId(pub(crate) u32);

impl RefId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The literal of a `Value` expression together with its converted value.
/// Identity for canonicalization is the datatype handle plus lexical form.
#[derive(Debug)]
pub struct ValueLiteral {
    pub datatype: DatatypeRef,
    pub lexical: String,
    pub value: Value,
}

impl PartialEq for ValueLiteral {
    fn eq(&self, other: &Self) -> bool {
        self.datatype == other.datatype && self.lexical == other.lexical
    }
}
impl Eq for ValueLiteral {}
impl Hash for ValueLiteral {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.datatype.hash(state);
        self.lexical.hash(state);
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum Expr {
    Epsilon,
    NullSet,
    AnyString,
    Sequence(ExprId, ExprId),
    Interleave(ExprId, ExprId),
    Choice(ExprId, ExprId),
    OneOrMore(ExprId),
    Element(Arc<NameClass>, ExprId),
    Attribute(Arc<NameClass>, ExprId),
    /// The second operand is the except expression, `NULL_SET` when absent.
    Data(DatatypeRef, ExprId),
    Value(Arc<ValueLiteral>),
    List(ExprId),
    Ref(RefId),
    /// Residual only: the remaining content of an open element, then what
    /// follows its end tag.
    After(ExprId, ExprId),
}

impl Expr {
    /// Operand handles in declaration order.
    pub fn children(&self) -> impl Iterator<Item = ExprId> {
        let (a, b) = match *self {
            Expr::Sequence(a, b)
            | Expr::Interleave(a, b)
            | Expr::Choice(a, b)
            | Expr::After(a, b) => (Some(a), Some(b)),
            Expr::OneOrMore(a) | Expr::List(a) | Expr::Element(_, a) | Expr::Attribute(_, a) => {
                (Some(a), None)
            }
            Expr::Data(_, except) => (Some(except), None),
            Expr::Epsilon
            | Expr::NullSet
            | Expr::AnyString
            | Expr::Value(_)
            | Expr::Ref(_) => (None, None),
        };
        a.into_iter().chain(b)
    }

    /// Short kind name used in diagnostics and dumps.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Expr::Epsilon => "empty",
            Expr::NullSet => "notAllowed",
            Expr::AnyString => "text",
            Expr::Sequence(..) => "group",
            Expr::Interleave(..) => "interleave",
            Expr::Choice(..) => "choice",
            Expr::OneOrMore(_) => "oneOrMore",
            Expr::Element(..) => "element",
            Expr::Attribute(..) => "attribute",
            Expr::Data(..) => "data",
            Expr::Value(_) => "value",
            Expr::List(_) => "list",
            Expr::Ref(_) => "ref",
            Expr::After(..) => "after",
        }
    }
}
