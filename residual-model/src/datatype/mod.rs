//! The datatype capability interface consumed by `Data` and `Value` expressions,
//! plus a per-grammar registry of named datatypes.

use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::error::DatatypeError;
use fnv::FnvHashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

pub mod relax;
pub mod xsd;

/// Resolves namespace prefixes in scope where a lexical value was found.
pub trait Namespaces {
    fn resolve(&self, prefix: &str) -> Option<&str>;
}

/// A context with no prefixes bound.
pub struct NoNamespaces;

impl Namespaces for NoNamespaces {
    fn resolve(&self, _prefix: &str) -> Option<&str> {
        None
    }
}

/// Result of comparing two values of an ordered type. `Undecidable` is a
/// distinct outcome (partial orders such as durations), never a kind of `Equal`.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Comparison {
    Less,
    Equal,
    Greater,
    Undecidable,
}

#[derive(PartialEq, Eq, Hash, Clone, Debug, PartialOrd, Ord)]
pub struct DatatypeName {
    pub namespace_uri: String,
    pub local_name: String,
}

impl DatatypeName {
    pub fn new(namespace_uri: impl Into<String>, local_name: impl Into<String>) -> DatatypeName {
        DatatypeName {
            namespace_uri: namespace_uri.into(),
            local_name: local_name.into(),
        }
    }
}

impl fmt::Display for DatatypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace_uri.is_empty() {
            f.write_str(&self.local_name)
        } else {
            write!(f, "{{{}}}{}", self.namespace_uri, self.local_name)
        }
    }
}

/// A value in some datatype's value space.
#[derive(PartialEq, Clone, Debug)]
pub enum Value {
    String(String),
    Boolean(bool),
    Integer(num_bigint::BigInt),
    Decimal(bigdecimal::BigDecimal),
    Double(f64),
    Date(xsd::DateValue),
    Duration(xsd::DurationValue),
    QName {
        namespace_uri: String,
        local_name: String,
    },
    /// Equal to another list iff both have the same length and are pairwise equal.
    List(Vec<Value>),
}

pub trait Datatype: fmt::Debug + Send + Sync {
    fn name(&self) -> &DatatypeName;

    /// Converts a lexical form to a value, or `None` if it is not in the lexical
    /// space.
    fn convert(&self, lexical: &str, ns: &dyn Namespaces) -> Option<Value>;

    fn accepts(&self, lexical: &str, ns: &dyn Namespaces) -> bool {
        self.convert(lexical, ns).is_some()
    }

    fn value_equals(&self, a: &Value, b: &Value) -> bool {
        a == b
    }

    /// `None` for types without an order relation.
    fn compare(&self, _a: &Value, _b: &Value) -> Option<Comparison> {
        None
    }
}

/// Shared handle to a datatype. Two handles are equal iff they point at the
/// same datatype instance, which is what expression canonicalization needs.
#[derive(Clone, Debug)]
pub struct DatatypeRef(Arc<dyn Datatype>);

impl DatatypeRef {
    pub fn new<D: Datatype + 'static>(datatype: D) -> DatatypeRef {
        DatatypeRef(Arc::new(datatype))
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl Deref for DatatypeRef {
    type Target = dyn Datatype;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PartialEq for DatatypeRef {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}
impl Eq for DatatypeRef {}
impl Hash for DatatypeRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state)
    }
}

/// Named datatypes available to one grammar.
#[derive(Default, Clone, Debug)]
pub struct DatatypeLibrary {
    types: FnvHashMap<DatatypeName, DatatypeRef>,
}

impl DatatypeLibrary {
    pub fn new() -> DatatypeLibrary {
        DatatypeLibrary::default()
    }

    /// The RELAX NG built-in library and the XML Schema primitive/derived types
    /// this crate implements.
    pub fn with_builtins() -> DatatypeLibrary {
        let mut lib = DatatypeLibrary::new();
        for dt in relax::builtins() {
            lib.register(dt);
        }
        for dt in xsd::builtins() {
            lib.register(dt);
        }
        lib
    }

    pub fn register(&mut self, datatype: DatatypeRef) {
        self.types.insert(datatype.name().clone(), datatype);
    }

    pub fn lookup(&self, namespace_uri: &str, local_name: &str) -> Result<DatatypeRef, DatatypeError> {
        self.types
            .get(&DatatypeName::new(namespace_uri, local_name))
            .cloned()
            .ok_or_else(|| DatatypeError::UnknownDatatype {
                namespace_uri: namespace_uri.to_string(),
                local_name: local_name.to_string(),
            })
    }

    /// Like [`DatatypeLibrary::lookup`], but substitutes the permissive string
    /// type for unknown names so that one bad reference does not cascade.
    pub fn lookup_or_string(
        &self,
        namespace_uri: &str,
        local_name: &str,
    ) -> (DatatypeRef, Option<Diagnostic>) {
        match self.lookup(namespace_uri, local_name) {
            Ok(dt) => (dt, None),
            Err(_) => {
                log::debug!("unknown datatype {{{namespace_uri}}}{local_name}, using string");
                let substitute = self
                    .lookup(relax::NAMESPACE_URI, "string")
                    .unwrap_or_else(|_| DatatypeRef::new(relax::RelaxDatatype::string()));
                let diagnostic = Diagnostic::new(DiagnosticKind::UnknownDatatype)
                    .with_arg(DatatypeName::new(namespace_uri, local_name).to_string());
                (substitute, Some(diagnostic))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Collapses runs of XML whitespace to a single space and trims both ends.
pub fn collapse_whitespace(value: &str) -> String {
    value.split_ascii_whitespace().collect::<Vec<_>>().join(" ")
}

/// Replaces each tab, newline and carriage return with a space.
pub fn replace_whitespace(value: &str) -> String {
    value
        .chars()
        .map(|c| if matches!(c, '\t' | '\n' | '\r') { ' ' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn handles_compare_by_identity() {
        let lib = DatatypeLibrary::with_builtins();
        let a = lib.lookup(xsd::NAMESPACE_URI, "integer").unwrap();
        let b = lib.lookup(xsd::NAMESPACE_URI, "integer").unwrap();
        assert_eq!(a, b);
        let other = DatatypeRef::new(xsd::XsdType::new(xsd::XsdKind::Integer));
        assert_ne!(a, other);
    }

    #[test]
    fn unknown_datatype() {
        let lib = DatatypeLibrary::with_builtins();
        assert_matches!(
            lib.lookup(xsd::NAMESPACE_URI, "gibberish"),
            Err(DatatypeError::UnknownDatatype { .. })
        );
        let (dt, diagnostic) = lib.lookup_or_string(xsd::NAMESPACE_URI, "gibberish");
        assert!(dt.accepts("anything at all", &NoNamespaces));
        assert_matches!(
            diagnostic,
            Some(Diagnostic {
                kind: DiagnosticKind::UnknownDatatype,
                ..
            })
        );
    }

    #[test]
    fn whitespace() {
        assert_eq!(collapse_whitespace("  a \t b\n"), "a b");
        assert_eq!(replace_whitespace("a\tb\n"), "a b ");
    }
}
