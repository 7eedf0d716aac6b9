use fnv::FnvHashMap;
use residual_model::ExprId;
use residual_model::datatype::{DatatypeName, Namespaces};
use std::fmt;

const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// A namespace-resolved element or attribute name.
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct QName {
    pub namespace_uri: String,
    pub local_name: String,
}

impl QName {
    pub fn new(namespace_uri: impl Into<String>, local_name: impl Into<String>) -> QName {
        QName {
            namespace_uri: namespace_uri.into(),
            local_name: local_name.into(),
        }
    }

    /// A name in no namespace.
    pub fn local(local_name: impl Into<String>) -> QName {
        QName::new("", local_name)
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace_uri.is_empty() {
            f.write_str(&self.local_name)
        } else {
            write!(f, "{{{}}}{}", self.namespace_uri, self.local_name)
        }
    }
}

/// A start tag as delivered by the document layer: the resolved element name,
/// its attributes in document order, and the namespace bindings the tag
/// declares (which are in scope for its attributes and content).
#[derive(Clone, Debug)]
pub struct StartTag {
    pub name: QName,
    pub attributes: Vec<(QName, String)>,
    pub namespaces: Vec<(String, String)>,
}

impl StartTag {
    pub fn new(name: QName) -> StartTag {
        StartTag {
            name,
            attributes: vec![],
            namespaces: vec![],
        }
    }

    pub fn with_attribute(mut self, name: QName, value: impl Into<String>) -> StartTag {
        self.attributes.push((name, value.into()));
        self
    }

    /// Binds `prefix` (empty for the default namespace) for this element.
    pub fn with_namespace(mut self, prefix: impl Into<String>, uri: impl Into<String>) -> StartTag {
        self.namespaces.push((prefix.into(), uri.into()));
        self
    }
}

/// One attribute of the start tag being matched. Value-model results are
/// memoized, since the same value model is often reachable from several
/// branches of the residual.
#[derive(Debug)]
pub struct AttributeToken<'t> {
    name: &'t QName,
    value: &'t str,
    values: FnvHashMap<ExprId, bool>,
    accepted: Vec<DatatypeName>,
}

impl<'t> AttributeToken<'t> {
    pub fn new(name: &'t QName, value: &'t str) -> AttributeToken<'t> {
        AttributeToken {
            name,
            value,
            values: FnvHashMap::default(),
            accepted: vec![],
        }
    }

    pub fn name(&self) -> &'t QName {
        self.name
    }

    pub fn value(&self) -> &'t str {
        self.value
    }

    /// Datatypes whose `data` or `value` leaves accepted this token's value.
    pub fn accepted_datatypes(&self) -> &[DatatypeName] {
        &self.accepted
    }

    pub(crate) fn cached(&self, model: ExprId) -> Option<bool> {
        self.values.get(&model).copied()
    }

    pub(crate) fn remember(&mut self, model: ExprId, matched: bool, accepted: Vec<DatatypeName>) {
        self.values.insert(model, matched);
        for name in accepted {
            if !self.accepted.contains(&name) {
                self.accepted.push(name);
            }
        }
    }
}

/// The namespace bindings of every open element, innermost last.
#[derive(Default, Debug)]
pub struct NamespaceStack {
    scopes: Vec<Vec<(String, String)>>,
}

impl NamespaceStack {
    pub fn push(&mut self, bindings: Vec<(String, String)>) {
        self.scopes.push(bindings);
    }

    pub fn pop(&mut self) {
        self.scopes.pop();
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }
}

impl Namespaces for NamespaceStack {
    fn resolve(&self, prefix: &str) -> Option<&str> {
        if prefix == "xml" {
            return Some(XML_NAMESPACE);
        }
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter())
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.as_str())
    }
}
