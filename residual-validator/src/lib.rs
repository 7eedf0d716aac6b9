//! Incremental validation of markup against a frozen grammar.
//!
//! A [`Session`] holds the residual expression (what may still follow the
//! tokens seen so far) and advances it one start tag, text run or end tag at a
//! time. Any number of sessions may share one [`Grammar`].

mod deriv;
mod document;
mod expected;
mod island;
mod token;

pub use crate::deriv::SessionPool;
pub use crate::document::{DocumentError, DocumentValidator};
pub use crate::expected::{describe_expected, heads};
pub use crate::island::IslandCandidates;
pub use crate::token::{AttributeToken, NamespaceStack, QName, StartTag};

use residual_model::{Diagnostic, DiagnosticKind, ExprId, ExprStore, Grammar};
use std::sync::Arc;

/// Longest excerpt of rejected text quoted in a diagnostic.
const TEXT_EXCERPT: usize = 32;

#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Residual nodes a session may create before it gives up with
    /// [`DiagnosticKind::ComplexityLimit`].
    pub node_limit: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            node_limit: 0x0fff_ffff,
        }
    }
}

/// Validation state of one document.
///
/// The `on_*` methods drive the session with a well-nested token stream.
/// Failures are reported and validation carries on: a rejected element is
/// skipped with its whole subtree, rejected text is ignored and an incomplete
/// element is closed anyway.
pub struct Session {
    pool: SessionPool,
    residual: ExprId,
    text: String,
    namespaces: NamespaceStack,
    open: Vec<QName>,
    /// Depth inside a rejected element.
    skipping: usize,
    halted: bool,
    diagnostics: Vec<Diagnostic>,
}

impl Session {
    pub fn new(grammar: Arc<Grammar>) -> Session {
        Session::with_options(grammar, SessionOptions::default())
    }

    pub fn with_options(grammar: Arc<Grammar>, options: SessionOptions) -> Session {
        let residual = grammar.start();
        Session {
            pool: SessionPool::new(grammar, options.node_limit),
            residual,
            text: String::new(),
            namespaces: NamespaceStack::default(),
            open: vec![],
            skipping: 0,
            halted: false,
            diagnostics: vec![],
        }
    }

    pub fn residual(&self) -> ExprId {
        self.residual
    }

    /// The store residual handles refer to.
    pub fn store(&self) -> &SessionPool {
        &self.pool
    }

    /// Every diagnostic reported so far.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Whether the document may end here without error.
    pub fn is_accepting(&self) -> bool {
        !self.halted
            && self.diagnostics.is_empty()
            && self.open.is_empty()
            && self.skipping == 0
            && deriv::is_xml_whitespace(&self.text)
            && self.pool.nullable(self.residual)
    }

    /// Head element nodes of the current residual: the elements that could
    /// start next.
    pub fn expected_elements(&self) -> Vec<ExprId> {
        expected::head_elements(&self.pool, self.residual)
    }

    pub fn on_start_tag(&mut self, tag: &StartTag) -> Result<(), Vec<Diagnostic>> {
        if self.halted {
            return Ok(());
        }
        if self.skipping > 0 {
            self.skipping += 1;
            self.text.clear();
            return Ok(());
        }
        let mut errors = vec![];
        self.flush_text(&mut errors);
        let before = self.residual;
        self.namespaces.push(tag.namespaces.clone());
        match self.derive_start_tag(tag, &mut errors) {
            Some(next) => {
                self.residual = next;
                self.open.push(tag.name.clone());
            }
            None => {
                self.namespaces.pop();
                self.skipping = 1;
            }
        }
        log::trace!(
            "start tag {}: {:?} -> {:?}",
            tag.name,
            before,
            self.residual
        );
        self.check_limit(&mut errors);
        self.report(errors)
    }

    /// Buffers character data; consecutive runs are validated as one string
    /// at the next tag.
    pub fn on_text(&mut self, text: &str) {
        if !self.halted && self.skipping == 0 {
            self.text.push_str(text);
        }
    }

    /// An end tag with no open element is reported as
    /// [`DiagnosticKind::UnmatchedEndTag`] and otherwise ignored.
    pub fn on_end_tag(&mut self) -> Result<(), Vec<Diagnostic>> {
        if self.halted {
            return Ok(());
        }
        if self.skipping > 0 {
            self.skipping -= 1;
            self.text.clear();
            return Ok(());
        }
        let Some(name) = self.open.pop() else {
            return self.report(vec![Diagnostic::new(DiagnosticKind::UnmatchedEndTag)]);
        };
        let mut errors = vec![];
        self.flush_text(&mut errors);
        let before = self.residual;
        let mut next = self.pool.end_tag(before, false);
        if next == ExprId::NULL_SET && !self.pool.is_exhausted() {
            errors.push(self.expected_diagnostic(
                DiagnosticKind::IncompleteContent,
                name.to_string(),
                before,
            ));
            next = self.pool.end_tag(before, true);
        }
        self.namespaces.pop();
        self.residual = next;
        log::trace!("end tag {}: {:?} -> {:?}", name, before, next);
        self.check_limit(&mut errors);
        self.report(errors)
    }

    /// Ends the document.
    pub fn finish(&mut self) -> Result<(), Vec<Diagnostic>> {
        if self.halted {
            return Ok(());
        }
        let mut errors = vec![];
        self.flush_text(&mut errors);
        if !self.open.is_empty() || self.skipping > 0 {
            let heads = expected::heads(&self.pool, self.residual);
            errors.push(self.with_heads(
                Diagnostic::new(DiagnosticKind::UnexpectedEndOfDocument)
                    .with_arg(describe_expected(&self.pool, &heads)),
                heads,
            ));
        } else if !self.pool.nullable(self.residual) {
            errors.push(self.expected_diagnostic(
                DiagnosticKind::IncompleteContent,
                "document".to_string(),
                self.residual,
            ));
        }
        self.check_limit(&mut errors);
        let result = self.report(errors);
        log::debug!(
            "session finished with {} diagnostic(s), {} residual node(s) created",
            self.diagnostics.len(),
            self.pool.local_len()
        );
        result
    }

    /// The residual after `tag`, or `NULL_SET` if it is rejected. Attribute
    /// values are resolved against the open elements' bindings plus the tag's
    /// own.
    pub fn start_tag(&mut self, residual: ExprId, tag: &StartTag) -> ExprId {
        self.namespaces.push(tag.namespaces.clone());
        let mut next = self.pool.start_tag_open(residual, &tag.name);
        for (name, value) in &tag.attributes {
            let mut token = AttributeToken::new(name, value);
            next = self.pool.attribute(next, &mut token, &self.namespaces);
        }
        let next = self.pool.start_tag_close(next);
        self.namespaces.pop();
        next
    }

    pub fn text(&mut self, residual: ExprId, text: &str) -> ExprId {
        self.pool.text(residual, text, &self.namespaces)
    }

    /// An element that received no text is taken to contain the empty string.
    pub fn end_tag(&mut self, residual: ExprId) -> ExprId {
        let content = self.pool.text(residual, "", &self.namespaces);
        self.pool.end_tag(content, false)
    }

    fn derive_start_tag(&mut self, tag: &StartTag, errors: &mut Vec<Diagnostic>) -> Option<ExprId> {
        let open = self.pool.start_tag_open(self.residual, &tag.name);
        if open == ExprId::NULL_SET {
            errors.push(self.expected_diagnostic(
                DiagnosticKind::UnexpectedElement,
                tag.name.to_string(),
                self.residual,
            ));
            return None;
        }
        let mut current = open;
        for (name, value) in &tag.attributes {
            let mut token = AttributeToken::new(name, value);
            let next = self.pool.attribute(current, &mut token, &self.namespaces);
            if next == ExprId::NULL_SET {
                // the attribute is dropped and matching goes on without it
                errors.push(self.expected_diagnostic(
                    DiagnosticKind::UnexpectedAttribute,
                    name.to_string(),
                    current,
                ));
            } else {
                current = next;
            }
        }
        let closed = self.pool.start_tag_close(current);
        if closed == ExprId::NULL_SET {
            errors.push(self.expected_diagnostic(
                DiagnosticKind::MissingAttribute,
                tag.name.to_string(),
                current,
            ));
            return None;
        }
        Some(closed)
    }

    /// Derives the buffered text, or the empty string when nothing was
    /// buffered, so that text leaves may be skipped.
    fn flush_text(&mut self, errors: &mut Vec<Diagnostic>) {
        let text = std::mem::take(&mut self.text);
        let next = self.pool.text(self.residual, &text, &self.namespaces);
        if next != ExprId::NULL_SET {
            self.residual = next;
        } else if !text.is_empty() {
            errors.push(self.expected_diagnostic(
                DiagnosticKind::UnexpectedText,
                excerpt(&text),
                self.residual,
            ));
            // carry on as if the text were absent
            self.residual = self.pool.text(self.residual, "", &self.namespaces);
        }
    }

    fn expected_diagnostic(&self, kind: DiagnosticKind, subject: String, residual: ExprId) -> Diagnostic {
        let heads = expected::heads(&self.pool, residual);
        let diagnostic = Diagnostic::new(kind)
            .with_arg(subject)
            .with_arg(describe_expected(&self.pool, &heads));
        self.with_heads(diagnostic, heads)
    }

    fn with_heads(&self, mut diagnostic: Diagnostic, heads: Vec<ExprId>) -> Diagnostic {
        let grammar = self.pool.grammar();
        for head in heads {
            diagnostic = diagnostic
                .with_node(head)
                .with_location(grammar.location(head));
        }
        diagnostic
    }

    fn check_limit(&mut self, errors: &mut Vec<Diagnostic>) {
        if self.pool.is_exhausted() && !self.halted {
            self.halted = true;
            // anything else reported by this step is an artifact of the limit
            errors.clear();
            errors.push(Diagnostic::new(DiagnosticKind::ComplexityLimit));
        }
    }

    fn report(&mut self, errors: Vec<Diagnostic>) -> Result<(), Vec<Diagnostic>> {
        if errors.is_empty() {
            return Ok(());
        }
        for error in &errors {
            log::debug!("{error}");
        }
        self.diagnostics.extend(errors.iter().cloned());
        Err(errors)
    }
}

fn excerpt(text: &str) -> String {
    match text.char_indices().nth(TEXT_EXCERPT) {
        Some((end, _)) => format!("{:?}...", &text[..end]),
        None => format!("{text:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use residual_model::datatype::{DatatypeLibrary, xsd};
    use residual_model::{ExpressionPool, NameClass, Pool};

    fn tag(name: &str) -> StartTag {
        StartTag::new(QName::local(name))
    }

    fn kinds(errors: Result<(), Vec<Diagnostic>>) -> Vec<DiagnosticKind> {
        errors.err().unwrap_or_default().iter().map(|d| d.kind).collect()
    }

    #[test]
    fn element_with_token_content_may_be_empty() {
        let lib = DatatypeLibrary::with_builtins();
        let token = lib.lookup(xsd::NAMESPACE_URI, "token").unwrap();
        let mut pool = ExpressionPool::new();
        let data = pool.data(token, ExprId::NULL_SET);
        let e = pool.element(NameClass::local("e"), data);
        let mut session = Session::new(Arc::new(pool.freeze(e).unwrap()));
        session.on_start_tag(&tag("e")).unwrap();
        session.on_end_tag().unwrap();
        session.finish().unwrap();
        assert!(session.is_accepting());
    }

    #[test]
    fn end_tag_with_nothing_open() {
        let mut pool = ExpressionPool::new();
        let e = pool.element(NameClass::local("e"), ExprId::EPSILON);
        let mut session = Session::new(Arc::new(pool.freeze(e).unwrap()));
        assert_eq!(
            kinds(session.on_end_tag()),
            vec![DiagnosticKind::UnmatchedEndTag]
        );
        assert_eq!(session.residual(), e);
        session.on_start_tag(&tag("e")).unwrap();
        session.on_end_tag().unwrap();
        assert_eq!(
            kinds(session.on_end_tag()),
            vec![DiagnosticKind::UnmatchedEndTag]
        );
        session.finish().unwrap();
        assert_eq!(session.diagnostics().len(), 2);
        assert!(!session.is_accepting());
    }

    #[test]
    fn text_runs_are_coalesced() {
        let lib = DatatypeLibrary::with_builtins();
        let string = lib.lookup(xsd::NAMESPACE_URI, "string").unwrap();
        let mut pool = ExpressionPool::new();
        let value = pool
            .value(string, "foo & bar", &residual_model::datatype::NoNamespaces)
            .unwrap();
        let e = pool.element(NameClass::local("a"), value);
        let mut session = Session::new(Arc::new(pool.freeze(e).unwrap()));
        session.on_start_tag(&tag("a")).unwrap();
        session.on_text("foo ");
        session.on_text("&");
        session.on_text(" bar");
        session.on_end_tag().unwrap();
        assert!(session.is_accepting());
    }

    #[test]
    fn text_between_elements() {
        let mut pool = ExpressionPool::new();
        let b = pool.element(NameClass::local("b"), ExprId::EPSILON);
        let content = pool.sequence(ExprId::ANY_STRING, b);
        let a = pool.element(NameClass::local("a"), content);
        let grammar = Arc::new(pool.freeze(a).unwrap());

        // text may be given or left out before b
        for text in ["foo ", ""] {
            let mut session = Session::new(grammar.clone());
            session.on_start_tag(&tag("a")).unwrap();
            session.on_text(text);
            session.on_start_tag(&tag("b")).unwrap();
            session.on_end_tag().unwrap();
            session.on_end_tag().unwrap();
            session.finish().unwrap();
        }
    }

    #[test]
    fn rejected_elements_are_skipped() {
        let mut pool = ExpressionPool::new();
        let b = pool.element(NameClass::local("b"), ExprId::EPSILON);
        let a = pool.element(NameClass::local("a"), b);
        let mut session = Session::new(Arc::new(pool.freeze(a).unwrap()));
        session.on_start_tag(&tag("a")).unwrap();
        assert_eq!(
            kinds(session.on_start_tag(&tag("x"))),
            vec![DiagnosticKind::UnexpectedElement]
        );
        // nothing inside x is looked at
        session.on_start_tag(&tag("y")).unwrap();
        session.on_text("whatever");
        session.on_end_tag().unwrap();
        session.on_end_tag().unwrap();
        assert_eq!(session.expected_elements(), vec![b]);
        session.on_start_tag(&tag("b")).unwrap();
        session.on_end_tag().unwrap();
        session.on_end_tag().unwrap();
        session.finish().unwrap();
        assert_eq!(session.diagnostics().len(), 1);
        assert!(!session.is_accepting());
    }

    #[test]
    fn unexpected_element_lists_the_alternatives() {
        let mut pool = ExpressionPool::new();
        let b = pool.element(NameClass::local("b"), ExprId::EPSILON);
        let c = pool.element(NameClass::local("c"), ExprId::EPSILON);
        let start = pool.choice(b, c);
        let mut session = Session::new(Arc::new(pool.freeze(start).unwrap()));
        let errors = session.on_start_tag(&tag("a")).unwrap_err();
        assert_eq!(errors[0].args, vec!["a", "element b or element c"]);
        assert_eq!(errors[0].nodes, vec![b, c]);
        assert_eq!(
            errors[0].message(),
            "element a not allowed here; expected element b or element c"
        );
    }

    #[test]
    fn rejected_text_leaves_the_residual_alone() {
        let mut pool = ExpressionPool::new();
        let b = pool.element(NameClass::local("b"), ExprId::EPSILON);
        let a = pool.element(NameClass::local("a"), b);
        let mut session = Session::new(Arc::new(pool.freeze(a).unwrap()));
        session.on_start_tag(&tag("a")).unwrap();
        session.on_text("stray");
        assert_eq!(
            kinds(session.on_start_tag(&tag("b"))),
            vec![DiagnosticKind::UnexpectedText]
        );
        session.on_end_tag().unwrap();
        session.on_end_tag().unwrap();
        session.finish().unwrap();
    }

    #[test]
    fn unexpected_attributes_are_dropped() {
        let mut pool = ExpressionPool::new();
        let x = pool.attribute(NameClass::local("x"), ExprId::ANY_STRING);
        let e = pool.element(NameClass::local("e"), x);
        let mut session = Session::new(Arc::new(pool.freeze(e).unwrap()));
        let t = tag("e")
            .with_attribute(QName::local("y"), "1")
            .with_attribute(QName::local("x"), "2");
        assert_eq!(
            kinds(session.on_start_tag(&t)),
            vec![DiagnosticKind::UnexpectedAttribute]
        );
        session.on_end_tag().unwrap();
        session.finish().unwrap();
    }

    #[test]
    fn incomplete_elements_are_closed_anyway() {
        let mut pool = ExpressionPool::new();
        let b = pool.element(NameClass::local("b"), ExprId::EPSILON);
        let a = pool.element(NameClass::local("a"), b);
        let c = pool.element(NameClass::local("c"), ExprId::EPSILON);
        let start = pool.sequence(a, c);
        let mut session = Session::new(Arc::new(pool.freeze(start).unwrap()));
        session.on_start_tag(&tag("a")).unwrap();
        let errors = session.on_end_tag().unwrap_err();
        assert_eq!(errors[0].kind, DiagnosticKind::IncompleteContent);
        assert_eq!(errors[0].args, vec!["a", "element b"]);
        session.on_start_tag(&tag("c")).unwrap();
        session.on_end_tag().unwrap();
        session.finish().unwrap();
    }

    #[test]
    fn explicit_residuals() {
        let mut pool = ExpressionPool::new();
        let a = pool.element(NameClass::local("a"), ExprId::ANY_STRING);
        let start = pool.one_or_more(a);
        let mut session = Session::new(Arc::new(pool.freeze(start).unwrap()));
        let r = session.start_tag(start, &tag("a"));
        let r = session.text(r, "hello");
        let r = session.end_tag(r);
        assert!(session.store().nullable(r));
        // the session's own residual is untouched
        assert_eq!(session.residual(), start);
        assert_eq!(session.start_tag(start, &tag("b")), ExprId::NULL_SET);
    }

    #[test]
    fn complexity_limit() {
        let mut pool = ExpressionPool::new();
        let a = pool.element(NameClass::local("a"), ExprId::EPSILON);
        let b = pool.element(NameClass::local("b"), ExprId::EPSILON);
        let start = pool.interleave(a, b);
        let grammar = Arc::new(pool.freeze(start).unwrap());
        let mut session = Session::with_options(grammar, SessionOptions { node_limit: 1 });
        assert_matches!(
            session.on_start_tag(&tag("a")),
            Err(errors) if errors.len() == 1 && errors[0].kind == DiagnosticKind::ComplexityLimit
        );
        // nothing further is reported
        session.on_end_tag().unwrap();
        session.finish().unwrap();
        assert!(!session.is_accepting());
    }

    #[test]
    fn excerpts_are_short() {
        assert_eq!(excerpt("abc"), "\"abc\"");
        let long = "x".repeat(100);
        assert_eq!(excerpt(&long), format!("{:?}...", "x".repeat(TEXT_EXCERPT)));
    }
}
