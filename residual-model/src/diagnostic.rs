//! Structured reports for restriction violations and instance validation
//! failures. A diagnostic is a kind, the grammar nodes involved, their source
//! locations and the arguments for a message template; callers that want text
//! can use the English templates here or supply their own.

use crate::Location;
use crate::expr::ExprId;
use std::fmt;

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum DiagnosticKind {
    // grammar restrictions
    /// `{0}` is not allowed inside `{1}`.
    RestrictedPattern,
    AnyNameInExcept,
    AnyNameInNsNameExcept,
    NsNameInNsNameExcept,
    UnsupportedNameClass,
    XmlnsAttribute,
    XmlnsNamespace,
    DuplicateAttributes,
    DuplicateElements,
    DuplicateRootElements,
    DuplicateValues,
    InconsistentValueTypes,
    UnknownDatatype,

    // instance validation
    UnexpectedElement,
    UnexpectedAttribute,
    MissingAttribute,
    IncompleteContent,
    UnexpectedText,
    UnexpectedEndOfDocument,
    UnmatchedEndTag,
    ComplexityLimit,
}

impl DiagnosticKind {
    /// English message template; `{n}` is replaced by the n-th argument.
    pub fn template(self) -> &'static str {
        match self {
            DiagnosticKind::RestrictedPattern => "{0} is not allowed inside {1}",
            DiagnosticKind::AnyNameInExcept => "anyName is not allowed in the except of anyName",
            DiagnosticKind::AnyNameInNsNameExcept => {
                "anyName is not allowed in the except of nsName"
            }
            DiagnosticKind::NsNameInNsNameExcept => "nsName is not allowed in the except of nsName",
            DiagnosticKind::UnsupportedNameClass => "name class {0} cannot be used here",
            DiagnosticKind::XmlnsAttribute => "an attribute must not be named xmlns",
            DiagnosticKind::XmlnsNamespace => {
                "an attribute must not be in the http://www.w3.org/2000/xmlns namespace"
            }
            DiagnosticKind::DuplicateAttributes => "attribute {0} may occur more than once",
            DiagnosticKind::DuplicateElements => {
                "element {0} appears in more than one branch of an interleave"
            }
            DiagnosticKind::DuplicateRootElements => {
                "element {0} is declared more than once as a document element"
            }
            DiagnosticKind::DuplicateValues => "value {0} occurs more than once in an interleave",
            DiagnosticKind::InconsistentValueTypes => {
                "values of type {0} and {1} are mixed in one interleave"
            }
            DiagnosticKind::UnknownDatatype => "datatype {0} is not known, using string",
            DiagnosticKind::UnexpectedElement => "element {0} not allowed here; expected {1}",
            DiagnosticKind::UnexpectedAttribute => "attribute {0} not allowed here",
            DiagnosticKind::MissingAttribute => "element {0} is missing required attributes",
            DiagnosticKind::IncompleteContent => "content of {0} is incomplete; expected {1}",
            DiagnosticKind::UnexpectedText => "text {0} not allowed here",
            DiagnosticKind::UnexpectedEndOfDocument => "document ended early; expected {0}",
            DiagnosticKind::UnmatchedEndTag => "end tag with no open element",
            DiagnosticKind::ComplexityLimit => "document is too complex to validate",
        }
    }

    pub fn is_restriction(self) -> bool {
        (self as u8) <= (DiagnosticKind::UnknownDatatype as u8)
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub nodes: Vec<ExprId>,
    /// Parallel to `nodes`: `None` where the node has no recorded location.
    pub locations: Vec<Option<Location>>,
    pub args: Vec<String>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind) -> Diagnostic {
        Diagnostic {
            kind,
            nodes: vec![],
            locations: vec![],
            args: vec![],
        }
    }

    pub fn with_node(mut self, node: ExprId) -> Diagnostic {
        self.nodes.push(node);
        self
    }

    pub fn with_location(mut self, location: Option<Location>) -> Diagnostic {
        self.locations.push(location);
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Diagnostic {
        self.args.push(arg.into());
        self
    }

    /// The English rendering of this diagnostic.
    pub fn message(&self) -> String {
        let template = self.kind.template();
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}').and_then(|close| Some((close, after[..close].parse::<usize>().ok()?))) {
                Some((close, index)) => {
                    out.push_str(self.args.get(index).map(String::as_str).unwrap_or("?"));
                    rest = &after[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Renders this diagnostic for `codemap_diagnostic::Emitter`. The first
    /// known location is the primary label.
    pub fn to_codemap(&self) -> codemap_diagnostic::Diagnostic {
        let spans = self
            .locations
            .iter()
            .flatten()
            .enumerate()
            .map(|(i, span)| codemap_diagnostic::SpanLabel {
                span: *span,
                label: if i == 0 {
                    None
                } else {
                    Some("related".to_string())
                },
                style: if i == 0 {
                    codemap_diagnostic::SpanStyle::Primary
                } else {
                    codemap_diagnostic::SpanStyle::Secondary
                },
            })
            .collect();
        codemap_diagnostic::Diagnostic {
            level: codemap_diagnostic::Level::Error,
            message: self.message(),
            code: None,
            spans,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

impl std::error::Error for Diagnostic {}
