use super::{Datatype, DatatypeName, DatatypeRef, Namespaces, Value, collapse_whitespace};

/// The RELAX NG built-in datatype library lives in the empty namespace.
pub const NAMESPACE_URI: &str = "";

#[derive(Debug)]
pub struct RelaxDatatype {
    name: DatatypeName,
    collapse: bool,
}

impl RelaxDatatype {
    /// `string`: the lexical form is the value.
    pub fn string() -> RelaxDatatype {
        RelaxDatatype {
            name: DatatypeName::new(NAMESPACE_URI, "string"),
            collapse: false,
        }
    }

    /// `token`: values compare after whitespace collapsing.
    pub fn token() -> RelaxDatatype {
        RelaxDatatype {
            name: DatatypeName::new(NAMESPACE_URI, "token"),
            collapse: true,
        }
    }
}

impl Datatype for RelaxDatatype {
    fn name(&self) -> &DatatypeName {
        &self.name
    }

    fn convert(&self, lexical: &str, _ns: &dyn Namespaces) -> Option<Value> {
        Some(Value::String(if self.collapse {
            collapse_whitespace(lexical)
        } else {
            lexical.to_string()
        }))
    }

    fn accepts(&self, _lexical: &str, _ns: &dyn Namespaces) -> bool {
        true
    }
}

pub(crate) fn builtins() -> Vec<DatatypeRef> {
    vec![
        DatatypeRef::new(RelaxDatatype::string()),
        DatatypeRef::new(RelaxDatatype::token()),
    ]
}
