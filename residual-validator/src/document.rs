//! Drives a [`Session`] from the tokens of an XML text.

use crate::token::{QName, StartTag};
use crate::Session;
use fnv::FnvHashMap;
use residual_model::Diagnostic;
use std::borrow::Cow;
use std::ops::Range;
use thiserror::Error;
use xmlparser::{ElementEnd, EntityDefinition, StrSpan, Token, Tokenizer};

const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

#[derive(Error, Debug)]
pub enum DocumentError<'a> {
    #[error("{0}")]
    Xml(#[from] xmlparser::Error),
    #[error("the prefix {:?} is not defined", .prefix.as_str())]
    UndefinedNamespacePrefix { prefix: StrSpan<'a> },
    #[error("the entity &{name}; is not defined")]
    UndefinedEntity { name: &'a str, span: Range<usize> },
    #[error("invalid or unclosed entity reference")]
    InvalidOrUnclosedEntity { span: Range<usize> },
    #[error("external entities are not supported")]
    ExternalEntity { span: StrSpan<'a> },
    #[error("end tag does not match the open element")]
    MismatchedEndTag { span: StrSpan<'a> },
    /// The document is well formed but does not match the grammar here.
    #[error("{}", messages(.diagnostics))]
    Invalid {
        span: Range<usize>,
        diagnostics: Vec<Diagnostic>,
    },
}

fn messages(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(Diagnostic::message)
        .collect::<Vec<_>>()
        .join("; ")
}

impl DocumentError<'_> {
    /// Everything but [`DocumentError::Invalid`] ends validation.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DocumentError::Invalid { .. })
    }

    fn span(&self) -> Option<Range<usize>> {
        match self {
            DocumentError::Xml(_) => None,
            DocumentError::UndefinedNamespacePrefix { prefix: span }
            | DocumentError::ExternalEntity { span }
            | DocumentError::MismatchedEndTag { span } => Some(span.range()),
            DocumentError::UndefinedEntity { span, .. }
            | DocumentError::InvalidOrUnclosedEntity { span }
            | DocumentError::Invalid { span, .. } => Some(span.clone()),
        }
    }

    /// Renders this error against the document text it was found in.
    pub fn to_codemap(
        &self,
        name: String,
        source: String,
    ) -> (codemap::CodeMap, Vec<codemap_diagnostic::Diagnostic>) {
        let mut map = codemap::CodeMap::new();
        let file = map.add_file(name, source);
        let primary = |span: codemap::Span, label: Option<String>| codemap_diagnostic::SpanLabel {
            span,
            label,
            style: codemap_diagnostic::SpanStyle::Primary,
        };
        let error = |message: String, spans: Vec<codemap_diagnostic::SpanLabel>| {
            codemap_diagnostic::Diagnostic {
                level: codemap_diagnostic::Level::Error,
                message,
                code: None,
                spans,
            }
        };
        let mut diagnostics = vec![];
        match (self, self.span()) {
            (DocumentError::Xml(err), _) => {
                let pos = err.pos();
                let line = file.line_span((pos.row as usize).saturating_sub(1));
                let col = u64::from(pos.col.saturating_sub(1)).min(line.len());
                diagnostics.push(error(
                    self.to_string(),
                    vec![primary(line.subspan(col, col), None)],
                ));
            }
            (DocumentError::Invalid { diagnostics: found, .. }, Some(span)) => {
                let span = file.span.subspan(span.start as u64, span.end as u64);
                for d in found {
                    diagnostics.push(error(d.message(), vec![primary(span, None)]));
                }
            }
            (DocumentError::UndefinedNamespacePrefix { prefix }, Some(span)) => {
                let label = format!(
                    "add an xmlns:{}=\"..\" attribute to define this prefix",
                    prefix.as_str()
                );
                let span = file.span.subspan(span.start as u64, span.end as u64);
                diagnostics.push(error(self.to_string(), vec![primary(span, Some(label))]));
            }
            (_, Some(span)) => {
                let span = file.span.subspan(span.start as u64, span.end as u64);
                diagnostics.push(error(self.to_string(), vec![primary(span, None)]));
            }
            (_, None) => diagnostics.push(error(self.to_string(), vec![])),
        }
        (map, diagnostics)
    }
}

/// Validates an XML text token by token.
///
/// Grammar mismatches come back as [`DocumentError::Invalid`] and validation
/// continues past them; any other error is the last item returned.
pub struct DocumentValidator<'a> {
    session: Session,
    tokenizer: Tokenizer<'a>,
    stack: ElementStack<'a>,
    entities: FnvHashMap<&'a str, &'a str>,
    len: usize,
    stopped: bool,
}

impl<'a> DocumentValidator<'a> {
    pub fn new(session: Session, text: &'a str) -> DocumentValidator<'a> {
        let entities = [
            ("lt", "<"),
            ("gt", ">"),
            ("amp", "&"),
            ("apos", "'"),
            ("quot", "\""),
        ]
        .into_iter()
        .collect();
        DocumentValidator {
            session,
            tokenizer: Tokenizer::from(text),
            stack: ElementStack::default(),
            entities,
            len: text.len(),
            stopped: false,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    /// The outcome of the next token, or of the end of the document once all
    /// tokens are consumed.
    pub fn validate_next(&mut self) -> Option<Result<(), DocumentError<'a>>> {
        if self.stopped {
            return None;
        }
        let result = match self.tokenizer.next() {
            Some(Ok(token)) => self.validate(token),
            Some(Err(err)) => Err(DocumentError::Xml(err)),
            None => {
                self.stopped = true;
                let end = self.len..self.len;
                return Some(
                    self.session
                        .finish()
                        .map_err(|diagnostics| DocumentError::Invalid { span: end, diagnostics }),
                );
            }
        };
        if matches!(&result, Err(err) if err.is_fatal()) {
            log::debug!("document validation stopped");
            self.stopped = true;
        }
        Some(result)
    }

    /// `err` rendered over the instance document `source`.
    pub fn diagnostic(
        &self,
        name: String,
        source: String,
        err: &DocumentError<'_>,
    ) -> (codemap::CodeMap, Vec<codemap_diagnostic::Diagnostic>) {
        err.to_codemap(name, source)
    }

    /// Every error up to the end of the document.
    pub fn validate_all(&mut self) -> Vec<DocumentError<'a>> {
        let mut errors = vec![];
        while let Some(result) = self.validate_next() {
            if let Err(err) = result {
                errors.push(err);
            }
        }
        errors
    }

    fn validate(&mut self, token: Token<'a>) -> Result<(), DocumentError<'a>> {
        match token {
            Token::ElementStart { prefix, local, span } => {
                self.stack.push(prefix, local, span);
                Ok(())
            }
            Token::Attribute {
                prefix,
                local,
                value,
                span,
            } => {
                let value = self.decode(value)?;
                self.stack.add_attr(prefix, local, value.into_owned(), span);
                Ok(())
            }
            Token::ElementEnd { end, span } => match end {
                ElementEnd::Open => {
                    let start = self.stack.start();
                    let found = self.open_element()?;
                    invalid(start..span.end(), found)
                }
                ElementEnd::Empty => {
                    let start = self.stack.start();
                    let mut found = self.open_element()?;
                    found.extend(self.close_element());
                    invalid(start..span.end(), found)
                }
                ElementEnd::Close(prefix, local) => {
                    if !self.stack.is_open(prefix.as_str(), local.as_str()) {
                        return Err(DocumentError::MismatchedEndTag { span });
                    }
                    let found = self.close_element();
                    invalid(span.range(), found)
                }
            },
            Token::Text { text } => {
                let text = self.decode(text)?;
                self.session.on_text(&text);
                Ok(())
            }
            Token::Cdata { text, .. } => {
                self.session.on_text(text.as_str());
                Ok(())
            }
            Token::EntityDeclaration {
                name, definition, ..
            } => match definition {
                EntityDefinition::EntityValue(value) => {
                    self.entities.insert(name.as_str(), value.as_str());
                    Ok(())
                }
                EntityDefinition::ExternalId(_) => Err(DocumentError::ExternalEntity { span: name }),
            },
            // comments and processing instructions do not split text
            Token::Declaration { .. }
            | Token::ProcessingInstruction { .. }
            | Token::Comment { .. }
            | Token::DtdStart { .. }
            | Token::EmptyDtd { .. }
            | Token::DtdEnd { .. } => Ok(()),
        }
    }

    fn open_element(&mut self) -> Result<Vec<Diagnostic>, DocumentError<'a>> {
        let tag = self.stack.start_tag()?;
        Ok(self.session.on_start_tag(&tag).err().unwrap_or_default())
    }

    fn close_element(&mut self) -> Vec<Diagnostic> {
        self.stack.pop();
        self.session.on_end_tag().err().unwrap_or_default()
    }

    /// Replaces entity and character references in `span`.
    fn decode(&self, span: StrSpan<'a>) -> Result<Cow<'a, str>, DocumentError<'a>> {
        let text = span.as_str();
        if !text.contains('&') {
            return Ok(Cow::Borrowed(text));
        }
        let mut out = String::with_capacity(text.len());
        for piece in parse_entities(span.start(), text) {
            match piece? {
                Txt::Text(_, text) => out.push_str(text),
                Txt::Char(_, c) => out.push(c),
                Txt::Entity(pos, name) => match self.entities.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        return Err(DocumentError::UndefinedEntity {
                            name,
                            span: pos..pos + name.len(),
                        });
                    }
                },
            }
        }
        Ok(Cow::Owned(out))
    }
}

fn invalid<'a>(span: Range<usize>, diagnostics: Vec<Diagnostic>) -> Result<(), DocumentError<'a>> {
    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(DocumentError::Invalid { span, diagnostics })
    }
}

#[derive(Debug)]
enum Txt<'a> {
    Text(usize, &'a str),
    Entity(usize, &'a str),
    Char(usize, char),
}

/// Splits `text`, found at offset `pos` of the document, into plain runs and
/// references.
fn parse_entities<'a>(
    pos: usize,
    text: &'a str,
) -> impl Iterator<Item = Result<Txt<'a>, DocumentError<'a>>> {
    struct Entities<'a> {
        text: &'a str,
        pos: usize,
        offset: usize,
        in_entity: bool,
    }
    impl<'a> Iterator for Entities<'a> {
        type Item = Result<Txt<'a>, DocumentError<'a>>;

        fn next(&mut self) -> Option<Self::Item> {
            if self.offset == self.text.len() {
                return None;
            }
            for (i, c) in self.text[self.offset..].char_indices() {
                if self.in_entity {
                    if c == ';' {
                        self.in_entity = false;
                        let name = &self.text[self.offset..self.offset + i];
                        let at = self.pos + self.offset;
                        let result = match name.strip_prefix('#') {
                            Some(number) => numeric_entity(at, number),
                            None => Ok(Txt::Entity(at, name)),
                        };
                        self.offset += i + 1;
                        return Some(result);
                    }
                } else if c == '&' {
                    self.in_entity = true;
                    let result = Txt::Text(
                        self.pos + self.offset,
                        &self.text[self.offset..self.offset + i],
                    );
                    self.offset += i + 1;
                    return Some(Ok(result));
                }
            }
            let at = self.pos + self.offset;
            self.offset = self.text.len();
            if self.in_entity {
                Some(Err(DocumentError::InvalidOrUnclosedEntity { span: at - 1..at }))
            } else {
                Some(Ok(Txt::Text(at, &self.text[at - self.pos..])))
            }
        }
    }
    Entities {
        text,
        pos,
        offset: 0,
        in_entity: false,
    }
}

fn numeric_entity<'a>(pos: usize, text: &str) -> Result<Txt<'a>, DocumentError<'a>> {
    let bad = || DocumentError::InvalidOrUnclosedEntity {
        span: pos..pos + text.len() + 1,
    };
    let code = match text.strip_prefix('x') {
        Some(hex) => u32::from_str_radix(hex, 16).map_err(|_| bad())?,
        None => text.parse().map_err(|_| bad())?,
    };
    Ok(Txt::Char(pos, char::from_u32(code).ok_or_else(bad)?))
}

#[derive(Default)]
struct ElementStack<'a> {
    elements: Vec<ElementState<'a>>,
}

struct ElementState<'a> {
    prefix: StrSpan<'a>,
    local: StrSpan<'a>,
    span: StrSpan<'a>,
    namespaces: Vec<(&'a str, String)>,
    attributes: Vec<UnresolvedAttr<'a>>,
}

struct UnresolvedAttr<'a> {
    prefix: StrSpan<'a>,
    local: StrSpan<'a>,
    value: String,
}

impl<'a> ElementStack<'a> {
    fn push(&mut self, prefix: StrSpan<'a>, local: StrSpan<'a>, span: StrSpan<'a>) {
        self.elements.push(ElementState {
            prefix,
            local,
            span,
            namespaces: vec![],
            attributes: vec![],
        })
    }

    fn pop(&mut self) {
        self.elements.pop();
    }

    fn start(&self) -> usize {
        self.elements.last().map_or(0, |e| e.span.start())
    }

    fn is_open(&self, prefix: &str, local: &str) -> bool {
        self.elements
            .last()
            .is_some_and(|e| e.prefix.as_str() == prefix && e.local.as_str() == local)
    }

    fn add_attr(&mut self, prefix: StrSpan<'a>, local: StrSpan<'a>, value: String, _span: StrSpan<'a>) {
        // the tokenizer only yields attributes inside a start tag
        let Some(current) = self.elements.last_mut() else {
            return;
        };
        if prefix.as_str() == "xmlns" {
            current.namespaces.push((local.as_str(), value));
        } else if prefix.as_str().is_empty() && local.as_str() == "xmlns" {
            current.namespaces.push(("", value));
        } else {
            current.attributes.push(UnresolvedAttr {
                prefix,
                local,
                value,
            });
        }
    }

    fn lookup_namespace_uri(&self, prefix: &str) -> Option<&str> {
        self.elements.iter().rev().find_map(|e| {
            e.namespaces
                .iter()
                .find(|(p, _)| *p == prefix)
                .map(|(_, uri)| uri.as_str())
        })
    }

    /// An empty default namespace means no namespace, as does an
    /// unprefixed attribute.
    fn namespace_uri(&self, prefix: StrSpan<'a>) -> Result<String, DocumentError<'a>> {
        match prefix.as_str() {
            "" => Ok(self.lookup_namespace_uri("").unwrap_or("").to_string()),
            "xml" => Ok(XML_NAMESPACE.to_string()),
            p => self
                .lookup_namespace_uri(p)
                .map(str::to_string)
                .ok_or(DocumentError::UndefinedNamespacePrefix { prefix }),
        }
    }

    /// The innermost element as a resolved start tag.
    fn start_tag(&self) -> Result<StartTag, DocumentError<'a>> {
        let Some(current) = self.elements.last() else {
            unreachable!("start tag closed without an open element")
        };
        let mut tag = StartTag::new(QName::new(
            self.namespace_uri(current.prefix)?,
            current.local.as_str(),
        ));
        for (prefix, uri) in &current.namespaces {
            tag = tag.with_namespace(*prefix, uri.as_str());
        }
        for attr in &current.attributes {
            let namespace_uri = if attr.prefix.as_str().is_empty() {
                String::new()
            } else {
                self.namespace_uri(attr.prefix)?
            };
            tag = tag.with_attribute(
                QName::new(namespace_uri, attr.local.as_str()),
                attr.value.as_str(),
            );
        }
        Ok(tag)
    }
}
