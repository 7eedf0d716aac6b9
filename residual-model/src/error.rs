use thiserror::Error;

/// Failures that make a grammar unusable.
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum GrammarError {
    #[error("reference {name:?} resolved more than once")]
    Redefinition { name: String },
    #[error("unresolved references: {}", names.join(", "))]
    UnresolvedReferences { names: Vec<String> },
    #[error("reference {name:?} refers to itself without consuming any content")]
    UnguardedRecursion { name: String },
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum DatatypeError {
    #[error("unknown datatype {{{namespace_uri}}}{local_name}")]
    UnknownDatatype {
        namespace_uri: String,
        local_name: String,
    },
    #[error("{literal:?} is not a valid {datatype} literal")]
    InvalidLiteral { datatype: String, literal: String },
}
