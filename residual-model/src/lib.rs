//! Grammar expression model: name classes, canonical expression pools, frozen
//! grammars, datatypes and the static restriction checker.
//!
//! Grammars are built through an [`ExpressionPool`], then frozen into a
//! [`Grammar`] which may be shared between any number of validation sessions.

pub mod datatype;
pub mod diagnostic;
pub mod error;
pub mod expr;
pub mod grammar;
pub mod name_class;
pub mod pool;
mod restrictions;

/// Source location of a grammar node, as recorded by the grammar reader.
pub type Location = codemap::Span;

pub use crate::datatype::{Datatype, DatatypeLibrary, DatatypeRef, Namespaces};
pub use crate::diagnostic::{Diagnostic, DiagnosticKind};
pub use crate::error::{DatatypeError, GrammarError};
pub use crate::expr::{Expr, ExprId, RefId, ValueLiteral};
pub use crate::grammar::Grammar;
pub use crate::name_class::NameClass;
pub use crate::pool::{ExprStore, ExpressionPool, Pool, compute_nullable};
