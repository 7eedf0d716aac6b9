//! Name classes: patterns over `(namespace URI, local name)` pairs.
//!
//! Acceptance is plain structural recursion. Collision (whether two name classes
//! accept at least one common name) is decided by case analysis over the pair of
//! variants; only when a `Difference` or `Not` is involved does it fall back to
//! testing a finite set of representative names.

use std::collections::BTreeSet;
use std::fmt;

/// Stands for "any namespace URI or local name not mentioned by the name classes
/// being compared". It can never occur in a well-formed XML name.
const UNMENTIONED: &str = "\u{0}";

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum NameClass {
    AnyName,
    NamespaceName {
        namespace_uri: String,
    },
    SimpleName {
        namespace_uri: String,
        local_name: String,
    },
    Choice(Box<NameClass>, Box<NameClass>),
    Difference(Box<NameClass>, Box<NameClass>),
    /// Only valid as an intermediate form; grammars in the RELAX NG dialect never
    /// expose it to matching.
    Not(Box<NameClass>),
}

impl NameClass {
    pub fn simple(namespace_uri: impl Into<String>, local_name: impl Into<String>) -> NameClass {
        NameClass::SimpleName {
            namespace_uri: namespace_uri.into(),
            local_name: local_name.into(),
        }
    }

    /// A name in no namespace.
    pub fn local(local_name: impl Into<String>) -> NameClass {
        NameClass::simple("", local_name)
    }

    pub fn ns_name(namespace_uri: impl Into<String>) -> NameClass {
        NameClass::NamespaceName {
            namespace_uri: namespace_uri.into(),
        }
    }

    pub fn choice(a: NameClass, b: NameClass) -> NameClass {
        NameClass::Choice(Box::new(a), Box::new(b))
    }

    pub fn difference(a: NameClass, b: NameClass) -> NameClass {
        NameClass::Difference(Box::new(a), Box::new(b))
    }

    pub fn not(a: NameClass) -> NameClass {
        NameClass::Not(Box::new(a))
    }

    pub fn accepts(&self, namespace_uri: &str, local_name: &str) -> bool {
        match self {
            NameClass::AnyName => true,
            NameClass::NamespaceName { namespace_uri: ns } => ns == namespace_uri,
            NameClass::SimpleName {
                namespace_uri: ns,
                local_name: name,
            } => ns == namespace_uri && name == local_name,
            NameClass::Choice(a, b) => {
                a.accepts(namespace_uri, local_name) || b.accepts(namespace_uri, local_name)
            }
            NameClass::Difference(a, b) => {
                a.accepts(namespace_uri, local_name) && !b.accepts(namespace_uri, local_name)
            }
            NameClass::Not(a) => !a.accepts(namespace_uri, local_name),
        }
    }

    /// True iff some name is accepted by both `self` and `other`.
    pub fn collides(&self, other: &NameClass) -> bool {
        use NameClass::*;
        match (self, other) {
            (Choice(a, b), _) => a.collides(other) || b.collides(other),
            (_, Choice(a, b)) => self.collides(a) || self.collides(b),
            (
                SimpleName {
                    namespace_uri,
                    local_name,
                },
                _,
            ) => other.accepts(namespace_uri, local_name),
            (
                _,
                SimpleName {
                    namespace_uri,
                    local_name,
                },
            ) => self.accepts(namespace_uri, local_name),
            (AnyName, _) => !other.is_empty(),
            (_, AnyName) => !self.is_empty(),
            (NamespaceName { namespace_uri: a }, NamespaceName { namespace_uri: b }) => a == b,
            _ => self.common_name(other).is_some(),
        }
    }

    /// True iff no name at all is accepted.
    pub fn is_empty(&self) -> bool {
        match self {
            NameClass::AnyName | NameClass::NamespaceName { .. } | NameClass::SimpleName { .. } => {
                false
            }
            NameClass::Choice(a, b) => a.is_empty() && b.is_empty(),
            NameClass::Difference(_, _) | NameClass::Not(_) => {
                self.common_name(&NameClass::AnyName).is_none()
            }
        }
    }

    /// Whether this name class can accept infinitely many names.
    pub fn is_infinite(&self) -> bool {
        match self {
            NameClass::AnyName | NameClass::NamespaceName { .. } | NameClass::Not(_) => true,
            NameClass::SimpleName { .. } => false,
            NameClass::Choice(a, b) => a.is_infinite() || b.is_infinite(),
            NameClass::Difference(a, _) => a.is_infinite(),
        }
    }

    /// Searches for a name accepted by both name classes.
    ///
    /// Acceptance only ever compares against the URIs and local names a name
    /// class mentions, so every unmentioned value behaves like [`UNMENTIONED`]
    /// and the cross product below is exhaustive.
    fn common_name<'a>(&'a self, other: &'a NameClass) -> Option<(&'a str, &'a str)> {
        let mut namespaces = BTreeSet::new();
        let mut locals = BTreeSet::new();
        self.mentioned(&mut namespaces, &mut locals);
        other.mentioned(&mut namespaces, &mut locals);
        namespaces.insert(UNMENTIONED);
        locals.insert(UNMENTIONED);
        for ns in &namespaces {
            for local in &locals {
                if self.accepts(ns, local) && other.accepts(ns, local) {
                    return Some((*ns, *local));
                }
            }
        }
        None
    }

    fn mentioned<'a>(&'a self, namespaces: &mut BTreeSet<&'a str>, locals: &mut BTreeSet<&'a str>) {
        match self {
            NameClass::AnyName => {}
            NameClass::NamespaceName { namespace_uri } => {
                namespaces.insert(namespace_uri.as_str());
            }
            NameClass::SimpleName {
                namespace_uri,
                local_name,
            } => {
                namespaces.insert(namespace_uri.as_str());
                locals.insert(local_name.as_str());
            }
            NameClass::Choice(a, b) | NameClass::Difference(a, b) => {
                a.mentioned(namespaces, locals);
                b.mentioned(namespaces, locals);
            }
            NameClass::Not(a) => a.mentioned(namespaces, locals),
        }
    }
}

impl fmt::Display for NameClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameClass::AnyName => f.write_str("*"),
            NameClass::NamespaceName { namespace_uri } => write!(f, "{{{namespace_uri}}}*"),
            NameClass::SimpleName {
                namespace_uri,
                local_name,
            } => {
                if namespace_uri.is_empty() {
                    f.write_str(local_name)
                } else {
                    write!(f, "{{{namespace_uri}}}{local_name}")
                }
            }
            NameClass::Choice(a, b) => write!(f, "{a}|{b}"),
            NameClass::Difference(a, b) => write!(f, "{a}-({b})"),
            NameClass::Not(a) => write!(f, "!({a})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::NameClass;

    const NS: &str = "urn:a";

    #[test]
    fn accepts_by_variant() {
        assert!(NameClass::AnyName.accepts("urn:x", "y"));
        assert!(NameClass::simple(NS, "e").accepts(NS, "e"));
        assert!(!NameClass::simple(NS, "e").accepts("", "e"));
        assert!(NameClass::ns_name(NS).accepts(NS, "anything"));
        assert!(!NameClass::ns_name(NS).accepts("urn:b", "anything"));
        let either = NameClass::choice(NameClass::local("a"), NameClass::local("b"));
        assert!(either.accepts("", "b"));
        assert!(!either.accepts("", "c"));
        let but_not = NameClass::difference(NameClass::ns_name(NS), NameClass::simple(NS, "x"));
        assert!(but_not.accepts(NS, "y"));
        assert!(!but_not.accepts(NS, "x"));
        assert!(NameClass::not(NameClass::local("a")).accepts("", "b"));
    }

    #[test]
    fn simple_names_collide_only_when_equal() {
        assert!(NameClass::local("x").collides(&NameClass::local("x")));
        assert!(!NameClass::local("x").collides(&NameClass::local("y")));
        assert!(!NameClass::simple(NS, "x").collides(&NameClass::local("x")));
    }

    #[test]
    fn namespace_and_simple_name() {
        assert!(NameClass::ns_name(NS).collides(&NameClass::simple(NS, "x")));
        assert!(NameClass::simple(NS, "x").collides(&NameClass::ns_name(NS)));
        assert!(!NameClass::ns_name("urn:b").collides(&NameClass::simple(NS, "x")));
        assert!(NameClass::ns_name(NS).collides(&NameClass::ns_name(NS)));
        assert!(!NameClass::ns_name(NS).collides(&NameClass::ns_name("urn:b")));
    }

    #[test]
    fn any_name_collides_unless_excluded() {
        assert!(NameClass::AnyName.collides(&NameClass::local("x")));
        assert!(NameClass::AnyName.collides(&NameClass::ns_name(NS)));
        let others = NameClass::difference(NameClass::AnyName, NameClass::ns_name(NS));
        assert!(!others.collides(&NameClass::simple(NS, "x")));
        assert!(!others.collides(&NameClass::ns_name(NS)));
        assert!(others.collides(&NameClass::local("x")));
        assert!(others.collides(&NameClass::AnyName));
    }

    #[test]
    fn choices_collide_pairwise() {
        let left = NameClass::choice(NameClass::local("a"), NameClass::local("b"));
        let right = NameClass::choice(NameClass::local("c"), NameClass::local("b"));
        let disjoint = NameClass::choice(NameClass::local("c"), NameClass::local("d"));
        assert!(left.collides(&right));
        assert!(!left.collides(&disjoint));
    }

    #[test]
    fn differences_collide_through_representatives() {
        let a = NameClass::difference(NameClass::ns_name(NS), NameClass::simple(NS, "x"));
        let b = NameClass::difference(NameClass::ns_name(NS), NameClass::simple(NS, "y"));
        assert!(a.collides(&b));
        let only_x = NameClass::difference(
            NameClass::ns_name(NS),
            NameClass::difference(NameClass::ns_name(NS), NameClass::simple(NS, "x")),
        );
        assert!(!only_x.collides(&a));
        assert!(only_x.collides(&b));
    }

    #[test]
    fn emptiness() {
        assert!(!NameClass::AnyName.is_empty());
        assert!(NameClass::difference(NameClass::ns_name(NS), NameClass::ns_name(NS)).is_empty());
        assert!(NameClass::not(NameClass::AnyName).is_empty());
    }

    #[test]
    fn display() {
        let nc = NameClass::choice(
            NameClass::local("a"),
            NameClass::difference(NameClass::ns_name(NS), NameClass::simple(NS, "b")),
        );
        assert_eq!(nc.to_string(), "a|{urn:a}*-({urn:a}b)");
    }
}
