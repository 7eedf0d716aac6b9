//! Derivatives of residual expressions with respect to document tokens.
//!
//! Residuals live in a [`SessionPool`], an overlay over the frozen grammar:
//! grammar nodes keep their handles and only nodes created while validating
//! are stored locally, so the grammar itself is never touched.

use crate::token::{AttributeToken, QName};
use fnv::FnvHashMap;
use residual_model::datatype::{DatatypeName, Namespaces};
use residual_model::{Expr, ExprId, ExprStore, Grammar, Pool, RefId, compute_nullable};
use std::sync::Arc;

pub(crate) fn is_xml_whitespace(text: &str) -> bool {
    text.chars()
        .all(|c| matches!(c, '\x20' | '\x09' | '\x0d' | '\x0a'))
}

pub struct SessionPool {
    grammar: Arc<Grammar>,
    base: usize,
    nodes: Vec<Expr>,
    nullable: Vec<bool>,
    memo: FnvHashMap<Expr, ExprId>,
    limit: usize,
    exhausted: bool,
}

impl SessionPool {
    pub fn new(grammar: Arc<Grammar>, limit: usize) -> SessionPool {
        let base = grammar.len();
        SessionPool {
            grammar,
            base,
            nodes: vec![],
            nullable: vec![],
            memo: FnvHashMap::default(),
            limit,
            exhausted: false,
        }
    }

    pub fn grammar(&self) -> &Arc<Grammar> {
        &self.grammar
    }

    /// Set once more than the configured number of residual nodes was
    /// requested; every later request yields `NULL_SET`.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Number of nodes created by this session.
    pub fn local_len(&self) -> usize {
        self.nodes.len()
    }

    fn local(&self, id: ExprId) -> Option<usize> {
        id.index().checked_sub(self.base)
    }
}

impl ExprStore for SessionPool {
    fn expr(&self, id: ExprId) -> &Expr {
        match self.local(id) {
            Some(i) => &self.nodes[i],
            None => self.grammar.expr(id),
        }
    }

    fn nullable(&self, id: ExprId) -> bool {
        match self.local(id) {
            Some(i) => self.nullable[i],
            None => self.grammar.nullable(id),
        }
    }

    fn ref_target(&self, id: RefId) -> ExprId {
        self.grammar.ref_target(id)
    }

    fn lookup(&self, expr: &Expr) -> Option<ExprId> {
        self.grammar
            .lookup(expr)
            .or_else(|| self.memo.get(expr).copied())
    }

    fn len(&self) -> usize {
        self.base + self.nodes.len()
    }
}

impl Pool for SessionPool {
    fn intern(&mut self, expr: Expr) -> ExprId {
        if let Some(id) = self.lookup(&expr) {
            return id;
        }
        if self.exhausted {
            return ExprId::NULL_SET;
        }
        if self.nodes.len() >= self.limit {
            log::trace!(
                "session pool reached its limit of {} residual nodes",
                self.limit
            );
            self.exhausted = true;
            return ExprId::NULL_SET;
        }
        for child in expr.children() {
            assert!(self.contains(child), "operand {child:?} is not a pool member");
        }
        let id = ExprId::from_index(self.len());
        let nullable = compute_nullable(&*self, &expr);
        self.nullable.push(nullable);
        self.memo.insert(expr.clone(), id);
        self.nodes.push(expr);
        id
    }
}

/// Scratch state for one text derivative.
struct TextStep<'a> {
    text: &'a str,
    ns: &'a dyn Namespaces,
    memo: FnvHashMap<ExprId, ExprId>,
    accepted: Vec<DatatypeName>,
}

impl<'a> TextStep<'a> {
    fn new(text: &'a str, ns: &'a dyn Namespaces) -> TextStep<'a> {
        TextStep {
            text,
            ns,
            memo: FnvHashMap::default(),
            accepted: vec![],
        }
    }
}

impl SessionPool {
    fn node(&self, id: ExprId) -> Expr {
        self.expr(id).clone()
    }

    /// Maps `f` over the continuation of every `After` in a derivative result.
    fn apply_after(&mut self, id: ExprId, f: &dyn Fn(&mut Self, ExprId) -> ExprId) -> ExprId {
        match self.node(id) {
            Expr::After(content, next) => {
                let next = f(self, next);
                self.after(content, next)
            }
            Expr::Choice(a, b) => {
                let a = self.apply_after(a, f);
                let b = self.apply_after(b, f);
                self.choice(a, b)
            }
            Expr::NullSet => ExprId::NULL_SET,
            other => unreachable!("{} in a start tag derivative", other.kind_name()),
        }
    }

    /// The residual after the name of a start tag: `After` nodes pairing the
    /// content of each matching element with what follows its end tag.
    pub fn start_tag_open(&mut self, id: ExprId, name: &QName) -> ExprId {
        let mut memo = FnvHashMap::default();
        self.start_tag_open_memo(&mut memo, id, name)
    }

    fn start_tag_open_memo(
        &mut self,
        memo: &mut FnvHashMap<ExprId, ExprId>,
        id: ExprId,
        name: &QName,
    ) -> ExprId {
        if let Some(result) = memo.get(&id) {
            return *result;
        }
        memo.insert(id, ExprId::NULL_SET);
        let result = match self.node(id) {
            Expr::Choice(a, b) => {
                let a = self.start_tag_open_memo(memo, a, name);
                let b = self.start_tag_open_memo(memo, b, name);
                self.choice(a, b)
            }
            Expr::Element(nc, content) => {
                if nc.accepts(&name.namespace_uri, &name.local_name) {
                    self.after(content, ExprId::EPSILON)
                } else {
                    ExprId::NULL_SET
                }
            }
            Expr::Interleave(a, b) => {
                let da = self.start_tag_open_memo(memo, a, name);
                let left = self.apply_after(da, &|pool, x| pool.interleave(x, b));
                let db = self.start_tag_open_memo(memo, b, name);
                let right = self.apply_after(db, &|pool, x| pool.interleave(a, x));
                self.choice(left, right)
            }
            Expr::OneOrMore(a) => {
                let da = self.start_tag_open_memo(memo, a, name);
                self.apply_after(da, &|pool, x| {
                    let more = pool.zero_or_more(a);
                    pool.sequence(x, more)
                })
            }
            Expr::Sequence(a, b) => {
                let da = self.start_tag_open_memo(memo, a, name);
                let head = self.apply_after(da, &|pool, x| pool.sequence(x, b));
                if self.nullable(a) {
                    let db = self.start_tag_open_memo(memo, b, name);
                    self.choice(head, db)
                } else {
                    head
                }
            }
            Expr::After(a, b) => {
                let da = self.start_tag_open_memo(memo, a, name);
                self.apply_after(da, &|pool, x| pool.after(x, b))
            }
            Expr::Ref(_) => {
                let target = self.deref(id);
                self.start_tag_open_memo(memo, target, name)
            }
            Expr::Epsilon
            | Expr::NullSet
            | Expr::AnyString
            | Expr::Attribute(..)
            | Expr::Data(..)
            | Expr::Value(_)
            | Expr::List(_) => ExprId::NULL_SET,
        };
        memo.insert(id, result);
        result
    }

    /// Consumes one attribute. Attributes may match in any order, so both
    /// operands of a sequence are tried.
    pub fn attribute(
        &mut self,
        id: ExprId,
        token: &mut AttributeToken<'_>,
        ns: &dyn Namespaces,
    ) -> ExprId {
        let mut memo = FnvHashMap::default();
        self.attribute_memo(&mut memo, id, token, ns)
    }

    fn attribute_memo(
        &mut self,
        memo: &mut FnvHashMap<ExprId, ExprId>,
        id: ExprId,
        token: &mut AttributeToken<'_>,
        ns: &dyn Namespaces,
    ) -> ExprId {
        if let Some(result) = memo.get(&id) {
            return *result;
        }
        // a node reached again while its own derivative is being taken
        // contributes nothing
        memo.insert(id, ExprId::NULL_SET);
        let result = match self.node(id) {
            Expr::After(a, b) => {
                let da = self.attribute_memo(memo, a, token, ns);
                self.after(da, b)
            }
            Expr::Choice(a, b) => {
                let a = self.attribute_memo(memo, a, token, ns);
                let b = self.attribute_memo(memo, b, token, ns);
                self.choice(a, b)
            }
            Expr::Sequence(a, b) => {
                let da = self.attribute_memo(memo, a, token, ns);
                let left = self.sequence(da, b);
                let db = self.attribute_memo(memo, b, token, ns);
                let right = self.sequence(a, db);
                self.choice(left, right)
            }
            Expr::Interleave(a, b) => {
                let da = self.attribute_memo(memo, a, token, ns);
                let left = self.interleave(da, b);
                let db = self.attribute_memo(memo, b, token, ns);
                let right = self.interleave(a, db);
                self.choice(left, right)
            }
            Expr::OneOrMore(a) => {
                let da = self.attribute_memo(memo, a, token, ns);
                let more = self.optional(id);
                self.sequence(da, more)
            }
            Expr::Attribute(nc, model) => {
                let name = token.name();
                if nc.accepts(&name.namespace_uri, &name.local_name)
                    && self.value_matches(model, token, ns)
                {
                    ExprId::EPSILON
                } else {
                    ExprId::NULL_SET
                }
            }
            Expr::Ref(_) => {
                let target = self.deref(id);
                self.attribute_memo(memo, target, token, ns)
            }
            _ => ExprId::NULL_SET,
        };
        memo.insert(id, result);
        result
    }

    fn value_matches(
        &mut self,
        model: ExprId,
        token: &mut AttributeToken<'_>,
        ns: &dyn Namespaces,
    ) -> bool {
        if let Some(matched) = token.cached(model) {
            return matched;
        }
        let mut step = TextStep::new(token.value(), ns);
        let matched = (self.nullable(model) && is_xml_whitespace(token.value())) || {
            let d = self.text_memo(&mut step, model);
            self.nullable(d)
        };
        token.remember(model, matched, step.accepted);
        matched
    }

    /// Removes attribute leaves once all attributes of a start tag were seen;
    /// a required attribute still pending makes its branch die.
    pub fn start_tag_close(&mut self, id: ExprId) -> ExprId {
        let mut memo = FnvHashMap::default();
        self.start_tag_close_memo(&mut memo, id)
    }

    fn start_tag_close_memo(&mut self, memo: &mut FnvHashMap<ExprId, ExprId>, id: ExprId) -> ExprId {
        if let Some(result) = memo.get(&id) {
            return *result;
        }
        memo.insert(id, id);
        let result = match self.node(id) {
            Expr::After(a, b) => {
                let a = self.start_tag_close_memo(memo, a);
                self.after(a, b)
            }
            Expr::Choice(a, b) => {
                let a = self.start_tag_close_memo(memo, a);
                let b = self.start_tag_close_memo(memo, b);
                self.choice(a, b)
            }
            Expr::Sequence(a, b) => {
                let a = self.start_tag_close_memo(memo, a);
                let b = self.start_tag_close_memo(memo, b);
                self.sequence(a, b)
            }
            Expr::Interleave(a, b) => {
                let a = self.start_tag_close_memo(memo, a);
                let b = self.start_tag_close_memo(memo, b);
                self.interleave(a, b)
            }
            Expr::OneOrMore(a) => {
                let a = self.start_tag_close_memo(memo, a);
                self.one_or_more(a)
            }
            Expr::Attribute(..) => ExprId::NULL_SET,
            Expr::Ref(_) => {
                let target = self.deref(id);
                let closed = self.start_tag_close_memo(memo, target);
                if closed == target { id } else { closed }
            }
            _ => id,
        };
        memo.insert(id, result);
        result
    }

    /// Consumes a run of character data. Text that is only whitespace may
    /// also be ignored, as between elements.
    pub fn text(&mut self, id: ExprId, text: &str, ns: &dyn Namespaces) -> ExprId {
        let mut step = TextStep::new(text, ns);
        let d = self.text_memo(&mut step, id);
        if is_xml_whitespace(text) {
            self.choice(id, d)
        } else {
            d
        }
    }

    fn text_memo(&mut self, step: &mut TextStep<'_>, id: ExprId) -> ExprId {
        if let Some(result) = step.memo.get(&id) {
            return *result;
        }
        step.memo.insert(id, ExprId::NULL_SET);
        let result = match self.node(id) {
            Expr::Choice(a, b) => {
                let a = self.text_memo(step, a);
                let b = self.text_memo(step, b);
                self.choice(a, b)
            }
            Expr::Interleave(a, b) => {
                let da = self.text_memo(step, a);
                let left = self.interleave(da, b);
                let db = self.text_memo(step, b);
                let right = self.interleave(a, db);
                self.choice(left, right)
            }
            Expr::Sequence(a, b) => {
                let da = self.text_memo(step, a);
                let head = self.sequence(da, b);
                if self.nullable(a) {
                    let db = self.text_memo(step, b);
                    self.choice(head, db)
                } else {
                    head
                }
            }
            Expr::After(a, b) => {
                let da = self.text_memo(step, a);
                self.after(da, b)
            }
            Expr::OneOrMore(a) => {
                let da = self.text_memo(step, a);
                let more = self.optional(id);
                self.sequence(da, more)
            }
            // text may continue or stop here
            Expr::AnyString => self.optional(ExprId::ANY_STRING),
            Expr::Data(datatype, except) => {
                let accepted = datatype.accepts(step.text, step.ns)
                    && (except == ExprId::NULL_SET || {
                        let d = self.text_memo(step, except);
                        !self.nullable(d)
                    });
                if accepted {
                    step.accepted.push(datatype.name().clone());
                    ExprId::EPSILON
                } else {
                    ExprId::NULL_SET
                }
            }
            Expr::Value(literal) => {
                let equal = literal
                    .datatype
                    .convert(step.text, step.ns)
                    .is_some_and(|v| literal.datatype.value_equals(&v, &literal.value));
                if equal {
                    step.accepted.push(literal.datatype.name().clone());
                    ExprId::EPSILON
                } else {
                    ExprId::NULL_SET
                }
            }
            Expr::List(item) => {
                let mut rest = item;
                for token in step.text.split(|c| matches!(c, '\x20' | '\x09' | '\x0d' | '\x0a')) {
                    if token.is_empty() {
                        continue;
                    }
                    let mut item_step = TextStep::new(token, step.ns);
                    rest = self.text_memo(&mut item_step, rest);
                    step.accepted.append(&mut item_step.accepted);
                    if rest == ExprId::NULL_SET {
                        break;
                    }
                }
                if self.nullable(rest) {
                    ExprId::EPSILON
                } else {
                    ExprId::NULL_SET
                }
            }
            Expr::Ref(_) => {
                let target = self.deref(id);
                self.text_memo(step, target)
            }
            Expr::Epsilon | Expr::NullSet | Expr::Element(..) | Expr::Attribute(..) => {
                ExprId::NULL_SET
            }
        };
        step.memo.insert(id, result);
        result
    }

    /// Leaves the innermost open element. With `force`, elements whose content
    /// is incomplete are left anyway, so validation can resume after them.
    pub fn end_tag(&mut self, id: ExprId, force: bool) -> ExprId {
        match self.node(id) {
            Expr::Choice(a, b) => {
                let a = self.end_tag(a, force);
                let b = self.end_tag(b, force);
                self.choice(a, b)
            }
            Expr::After(content, next) if force || self.nullable(content) => next,
            _ => ExprId::NULL_SET,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use residual_model::datatype::{DatatypeLibrary, NoNamespaces, xsd};
    use residual_model::{ExpressionPool, NameClass};

    fn element(pool: &mut ExpressionPool, name: &str, content: ExprId) -> ExprId {
        pool.element(NameClass::local(name), content)
    }

    fn session(pool: ExpressionPool, start: ExprId) -> SessionPool {
        SessionPool::new(Arc::new(pool.freeze(start).unwrap()), 0x0fff_ffff)
    }

    #[test]
    fn grammar_nodes_keep_their_handles() {
        let mut pool = ExpressionPool::new();
        let a = element(&mut pool, "a", ExprId::EPSILON);
        let b = element(&mut pool, "b", ExprId::EPSILON);
        let ab = pool.choice(a, b);
        let start = pool.sequence(ab, a);
        let mut s = session(pool, start);
        assert_eq!(s.choice(b, a), ab);
        assert_eq!(s.sequence(ab, a), start);
        assert_eq!(s.local_len(), 0);
        let fresh = s.sequence(a, b);
        assert!(fresh.index() >= s.grammar().len());
        assert_eq!(s.sequence(a, b), fresh);
    }

    #[test]
    fn element_then_end() {
        let mut pool = ExpressionPool::new();
        let a = element(&mut pool, "a", ExprId::EPSILON);
        let mut s = session(pool, a);
        let open = s.start_tag_open(a, &QName::local("a"));
        assert_eq!(*s.expr(open), Expr::After(ExprId::EPSILON, ExprId::EPSILON));
        let closed = s.start_tag_close(open);
        assert_eq!(s.end_tag(closed, false), ExprId::EPSILON);
        assert_eq!(s.start_tag_open(a, &QName::local("b")), ExprId::NULL_SET);
    }

    #[test]
    fn dead_branches_stay_dead() {
        let mut pool = ExpressionPool::new();
        let a = element(&mut pool, "a", ExprId::EPSILON);
        let mut s = session(pool, a);
        let name = QName::local("a");
        assert_eq!(s.start_tag_open(ExprId::NULL_SET, &name), ExprId::NULL_SET);
        assert_eq!(s.text(ExprId::NULL_SET, "x", &NoNamespaces), ExprId::NULL_SET);
        assert_eq!(s.start_tag_close(ExprId::NULL_SET), ExprId::NULL_SET);
        assert_eq!(s.end_tag(ExprId::NULL_SET, true), ExprId::NULL_SET);
    }

    #[test]
    fn attributes_in_either_order() {
        let mut pool = ExpressionPool::new();
        let x = pool.attribute(NameClass::local("x"), ExprId::ANY_STRING);
        let y = pool.attribute(NameClass::local("y"), ExprId::ANY_STRING);
        let attrs = pool.sequence(x, y);
        let e = element(&mut pool, "e", attrs);
        let mut s = session(pool, e);
        let (xn, yn) = (QName::local("x"), QName::local("y"));
        for order in [[&xn, &yn], [&yn, &xn]] {
            let mut r = s.start_tag_open(e, &QName::local("e"));
            for name in order {
                let mut token = AttributeToken::new(name, "v");
                r = s.attribute(r, &mut token, &NoNamespaces);
                assert_ne!(r, ExprId::NULL_SET);
            }
            let r = s.start_tag_close(r);
            assert_eq!(s.end_tag(r, false), ExprId::EPSILON);
        }
    }

    #[test]
    fn missing_attribute_kills_the_branch() {
        let mut pool = ExpressionPool::new();
        let x = pool.attribute(NameClass::local("x"), ExprId::ANY_STRING);
        let e = element(&mut pool, "e", x);
        let mut s = session(pool, e);
        let r = s.start_tag_open(e, &QName::local("e"));
        assert_eq!(s.start_tag_close(r), ExprId::NULL_SET);
    }

    #[test]
    fn attribute_tokens_record_accepting_datatypes() {
        let lib = DatatypeLibrary::with_builtins();
        let int = lib.lookup(xsd::NAMESPACE_URI, "integer").unwrap();
        let mut pool = ExpressionPool::new();
        let data = pool.data(int.clone(), ExprId::NULL_SET);
        let x = pool.attribute(NameClass::local("x"), data);
        let e = element(&mut pool, "e", x);
        let mut s = session(pool, e);
        let name = QName::local("x");
        let mut token = AttributeToken::new(&name, " 42 ");
        let r = s.start_tag_open(e, &QName::local("e"));
        let r = s.attribute(r, &mut token, &NoNamespaces);
        assert_ne!(r, ExprId::NULL_SET);
        assert_eq!(token.accepted_datatypes(), &[int.name().clone()]);
        assert_eq!(token.cached(data), Some(true));
    }

    #[test]
    fn text_is_optional_in_mixed_content() {
        let mut pool = ExpressionPool::new();
        let mixed = pool.mixed(ExprId::EPSILON);
        let mut s = session(pool, mixed);
        assert_eq!(mixed, ExprId::ANY_STRING);
        let r = s.text(ExprId::ANY_STRING, "hello", &NoNamespaces);
        assert!(s.nullable(r));
        let r = s.text(r, "again", &NoNamespaces);
        assert!(s.nullable(r));
    }

    #[test]
    fn whitespace_may_be_ignored() {
        let mut pool = ExpressionPool::new();
        let a = element(&mut pool, "a", ExprId::EPSILON);
        let mut s = session(pool, a);
        assert_eq!(s.text(a, " \n\t", &NoNamespaces), a);
        assert_eq!(s.text(a, "x", &NoNamespaces), ExprId::NULL_SET);
    }

    #[test]
    fn list_items_are_derived_one_by_one() {
        let lib = DatatypeLibrary::with_builtins();
        let int = lib.lookup(xsd::NAMESPACE_URI, "integer").unwrap();
        let mut pool = ExpressionPool::new();
        let data = pool.data(int, ExprId::NULL_SET);
        let items = pool.one_or_more(data);
        let list = pool.list(items);
        let mut s = session(pool, list);
        assert_eq!(s.text(list, " 1 2\t3 ", &NoNamespaces), ExprId::EPSILON);
        assert_eq!(s.text(list, "1 two", &NoNamespaces), ExprId::NULL_SET);
        assert_eq!(s.text(list, "", &NoNamespaces), list);
    }

    #[test]
    fn exhaustion_yields_null_set() {
        let mut pool = ExpressionPool::new();
        let a = element(&mut pool, "a", ExprId::EPSILON);
        let b = element(&mut pool, "b", ExprId::EPSILON);
        let start = pool.interleave(a, b);
        let grammar = Arc::new(pool.freeze(start).unwrap());
        let mut s = SessionPool::new(grammar, 0);
        assert_eq!(s.start_tag_open(start, &QName::local("a")), ExprId::NULL_SET);
        assert!(s.is_exhausted());
    }
}
