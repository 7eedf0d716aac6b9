//! Static restriction checking over a frozen grammar.
//!
//! One walk over the grammar tracks which context each node is reached in
//! (the top-level start pattern, attribute content, list items, data excepts,
//! repeated groups) and reports node kinds that are illegal there. The same
//! walk detects names that may occur twice: attributes of one element, and
//! elements in different branches of one interleave. Every violation is
//! collected; checking never stops at the first one.
//!
//! A reference is walked once per element content and context. What it added
//! to the duplicate checkers is kept and replayed when the reference is
//! reached again, so shared definitions cost a single walk.

use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::expr::{Expr, ExprId, ValueLiteral};
use crate::grammar::Grammar;
use crate::name_class::NameClass;
use crate::pool::ExprStore;
use fnv::{FnvHashMap, FnvHashSet};
use std::collections::HashSet;
use std::sync::Arc;

const XMLNS_NAMESPACE: &str = "http://www.w3.org/2000/xmlns";

/// Which restriction-relevant constructs enclose the node being checked.
/// Entering an element resets all of them.
#[derive(Default, PartialEq, Eq, Hash, Clone, Copy, Debug)]
struct WalkContext {
    in_attribute: bool,
    in_list: bool,
    in_interleave_in_list: bool,
    in_except: bool,
    in_one_or_more: bool,
    /// A group or interleave inside a oneOrMore.
    in_one_or_more_group: bool,
}

/// How open areas restrict which earlier entries a new entry is compared with.
#[derive(Clone, Copy, Debug)]
enum AreaMode {
    /// Entries inside an open area belong to a sibling choice branch and are
    /// skipped.
    Exclusive,
    /// Only entries inside an open area, from a sibling interleave branch,
    /// are compared.
    Inclusive,
}

/// Append-only list of entries seen at one nesting level plus a stack of
/// `[start, end)` areas, one per open branching construct.
#[derive(Debug)]
struct AreaChecker<T> {
    mode: AreaMode,
    entries: Vec<(T, ExprId)>,
    areas: Vec<(usize, usize)>,
}

impl<T> AreaChecker<T> {
    fn new(mode: AreaMode) -> AreaChecker<T> {
        AreaChecker {
            mode,
            entries: vec![],
            areas: vec![],
        }
    }

    fn start_area(&mut self) {
        let n = self.entries.len();
        self.areas.push((n, n));
    }

    /// Extends the innermost area over the branch that just ended.
    fn end_branch(&mut self) {
        let n = self.entries.len();
        match self.areas.last_mut() {
            Some(area) => area.1 = n,
            None => panic!("area stack underflow"),
        }
    }

    fn end_area(&mut self) {
        if self.areas.pop().is_none() {
            panic!("area stack underflow");
        }
    }

    fn in_open_area(&self, index: usize) -> bool {
        self.areas.iter().any(|(s, e)| *s <= index && index < *e)
    }

    /// Start of the branch being walked. Entries from here on share their area
    /// membership with any entry pushed now, and keep sharing it.
    fn branch_start(&self) -> usize {
        self.areas.last().map_or(0, |area| area.1)
    }

    /// Earlier entries the next entry must be compared with.
    fn comparable(&self) -> impl Iterator<Item = &(T, ExprId)> {
        self.entries.iter().enumerate().filter_map(move |(i, entry)| {
            let open = self.in_open_area(i);
            let compare = match self.mode {
                AreaMode::Exclusive => !open,
                AreaMode::Inclusive => open,
            };
            compare.then_some(entry)
        })
    }

    /// Appends an entry unless the current branch already holds `id`; a
    /// second copy would be compared exactly like the first.
    fn push(&mut self, item: T, id: ExprId) {
        let start = self.branch_start();
        if !self.entries[start..].iter().any(|(_, other)| *other == id) {
            self.entries.push((item, id));
        }
    }

    fn apply(&mut self, op: AreaOp) {
        match op {
            AreaOp::Start => self.start_area(),
            AreaOp::EndBranch => self.end_branch(),
            AreaOp::End => self.end_area(),
        }
    }
}

/// Choice branches are exclusive for attributes; interleave branches are
/// concurrent for elements and list values.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum Branching {
    Choice,
    Interleave,
}

#[derive(Clone, Copy, Debug)]
enum AreaOp {
    Start,
    EndBranch,
    End,
}

/// Names and values one walk of a reference added to the duplicate checkers,
/// each node once.
#[derive(Debug)]
struct Contribution {
    reference: ExprId,
    list_depth: usize,
    /// False when a cycle back to an enclosing reference was cut inside the
    /// walk; such a contribution depends on where it was walked from.
    complete: bool,
    seen: FnvHashSet<ExprId>,
    attributes: Vec<(Arc<NameClass>, ExprId)>,
    elements: Vec<(Arc<NameClass>, ExprId)>,
    values: Vec<(Arc<ValueLiteral>, ExprId)>,
}

impl Contribution {
    fn new(reference: ExprId, list_depth: usize) -> Contribution {
        Contribution {
            reference,
            list_depth,
            complete: true,
            seen: FnvHashSet::default(),
            attributes: vec![],
            elements: vec![],
            values: vec![],
        }
    }

    fn merge(&mut self, child: &Contribution) {
        for (nc, id) in &child.attributes {
            if self.seen.insert(*id) {
                self.attributes.push((nc.clone(), *id));
            }
        }
        for (nc, id) in &child.elements {
            if self.seen.insert(*id) {
                self.elements.push((nc.clone(), *id));
            }
        }
        if child.list_depth == self.list_depth {
            for (literal, id) in &child.values {
                if self.seen.insert(*id) {
                    self.values.push((literal.clone(), *id));
                }
            }
        }
    }
}

type Memo = FnvHashMap<(ExprId, WalkContext), Arc<Contribution>>;

pub struct RestrictionChecker<'g> {
    grammar: &'g Grammar,
    diagnostics: Vec<Diagnostic>,
    reported: HashSet<Diagnostic>,
    /// Elements whose content has been walked; an element is a context
    /// boundary, so its content only needs checking once.
    visited_elements: HashSet<ExprId>,
    name_checked: HashSet<ExprId>,
    start_refs: HashSet<ExprId>,
    /// One recording per reference being followed in the current element
    /// content, innermost last.
    recording: Vec<Contribution>,
    /// Finished reference walks of the current element content.
    memo: Vec<Memo>,
    list_depth: usize,
    enclosing: Vec<ExprId>,
    roots: Vec<(Arc<NameClass>, ExprId)>,
    attributes: Option<AreaChecker<Arc<NameClass>>>,
    elements: Option<AreaChecker<Arc<NameClass>>>,
    values: Option<AreaChecker<Arc<ValueLiteral>>>,
}

impl<'g> RestrictionChecker<'g> {
    pub fn new(grammar: &'g Grammar) -> RestrictionChecker<'g> {
        RestrictionChecker {
            grammar,
            diagnostics: vec![],
            reported: HashSet::new(),
            visited_elements: HashSet::new(),
            name_checked: HashSet::new(),
            start_refs: HashSet::new(),
            recording: vec![],
            memo: vec![Memo::default()],
            list_depth: 0,
            enclosing: vec![],
            roots: vec![],
            attributes: None,
            elements: None,
            values: None,
        }
    }

    pub fn check(mut self) -> Vec<Diagnostic> {
        let start = self.grammar.start();
        self.check_start(start);
        log::debug!(
            "restriction check found {} violation(s)",
            self.diagnostics.len()
        );
        self.diagnostics
    }

    fn enclosing(&self) -> ExprId {
        self.enclosing
            .last()
            .copied()
            .unwrap_or_else(|| self.grammar.start())
    }

    fn report(&mut self, kind: DiagnosticKind, nodes: &[ExprId], args: Vec<String>) {
        let mut diagnostic = Diagnostic::new(kind);
        for node in nodes {
            diagnostic = diagnostic
                .with_node(*node)
                .with_location(self.grammar.location(*node));
        }
        diagnostic.args = args;
        if self.reported.insert(diagnostic.clone()) {
            self.diagnostics.push(diagnostic);
        }
    }

    fn restricted(&mut self, id: ExprId, context: &str) {
        let kind = self.grammar.expr(id).kind_name();
        let enclosing = self.enclosing();
        self.report(
            DiagnosticKind::RestrictedPattern,
            &[id, enclosing],
            vec![kind.to_string(), context.to_string()],
        );
    }

    /// The start pattern may only be a choice of elements, references to them
    /// and `notAllowed`.
    fn check_start(&mut self, id: ExprId) {
        match *self.grammar.expr(id) {
            Expr::NullSet => {}
            Expr::Choice(a, b) => {
                self.check_start(a);
                self.check_start(b);
            }
            Expr::Ref(r) => {
                if self.start_refs.insert(id) {
                    self.check_start(self.grammar.ref_target(r));
                }
            }
            Expr::Element(ref nc, _) => {
                let nc = nc.clone();
                self.check_root(id, nc);
                self.walk(id, WalkContext::default());
            }
            _ => {
                self.restricted(id, "start");
                self.walk(id, WalkContext::default());
            }
        }
    }

    /// Document elements are compared pairwise: any two alternatives of the
    /// start pattern whose names collide are reported.
    fn check_root(&mut self, id: ExprId, nc: Arc<NameClass>) {
        let conflicts: Vec<ExprId> = self
            .roots
            .iter()
            .filter(|(other, other_id)| *other_id != id && nc.collides(other))
            .map(|(_, other_id)| *other_id)
            .collect();
        for conflict in conflicts {
            let start = self.grammar.start();
            self.report(
                DiagnosticKind::DuplicateRootElements,
                &[id, conflict, start],
                vec![nc.to_string()],
            );
        }
        if !self.roots.iter().any(|(_, other_id)| *other_id == id) {
            self.roots.push((nc, id));
        }
    }

    fn walk(&mut self, id: ExprId, ctx: WalkContext) {
        let grammar = self.grammar;
        match grammar.expr(id) {
            Expr::NullSet => {}
            Expr::Epsilon => {
                if ctx.in_except {
                    self.restricted(id, "data/except");
                }
            }
            Expr::AnyString => {
                if ctx.in_list {
                    self.restricted(id, "list");
                }
                if ctx.in_except {
                    self.restricted(id, "data/except");
                }
            }
            Expr::Sequence(a, b) => {
                if ctx.in_except {
                    self.restricted(id, "data/except");
                }
                let mut child = ctx;
                child.in_one_or_more_group |= ctx.in_one_or_more;
                self.walk(*a, child);
                self.walk(*b, child);
            }
            Expr::Interleave(a, b) => {
                if ctx.in_except {
                    self.restricted(id, "data/except");
                }
                let mut child = ctx;
                child.in_one_or_more_group |= ctx.in_one_or_more;
                child.in_interleave_in_list |= ctx.in_list;
                self.branch(Branching::Interleave, *a, *b, child);
            }
            Expr::Choice(a, b) => self.branch(Branching::Choice, *a, *b, ctx),
            Expr::OneOrMore(a) => {
                if ctx.in_except {
                    self.restricted(id, "data/except");
                }
                let mut child = ctx;
                child.in_one_or_more = true;
                self.walk(*a, child);
            }
            Expr::Element(nc, content) => {
                if ctx.in_attribute {
                    self.restricted(id, "attribute");
                }
                if ctx.in_list {
                    self.restricted(id, "list");
                }
                if ctx.in_except {
                    self.restricted(id, "data/except");
                }
                self.add_element(id, nc.clone());
                if self.visited_elements.insert(id) {
                    self.check_name_class(id, nc, false);
                    self.walk_element_content(id, *content);
                }
            }
            Expr::Attribute(nc, content) => {
                if ctx.in_attribute {
                    self.restricted(id, "attribute");
                }
                if ctx.in_list {
                    self.restricted(id, "list");
                }
                if ctx.in_except {
                    self.restricted(id, "data/except");
                }
                if ctx.in_one_or_more_group {
                    self.restricted(id, "oneOrMore//group");
                }
                self.add_attribute(id, nc.clone());
                self.check_name_class(id, nc, true);
                let mut child = ctx;
                child.in_attribute = true;
                self.walk(*content, child);
            }
            Expr::Data(_, except) => {
                if ctx.in_interleave_in_list {
                    self.restricted(id, "list//interleave");
                }
                if *except != ExprId::NULL_SET {
                    let mut child = ctx;
                    child.in_except = true;
                    self.walk(*except, child);
                }
            }
            Expr::Value(literal) => {
                if ctx.in_interleave_in_list {
                    self.add_value(id, literal.clone());
                }
            }
            Expr::List(item) => {
                if ctx.in_list {
                    self.restricted(id, "list");
                }
                if ctx.in_except {
                    self.restricted(id, "data/except");
                }
                let mut child = ctx;
                child.in_list = true;
                child.in_interleave_in_list = false;
                let saved = self.values.replace(AreaChecker::new(AreaMode::Inclusive));
                self.list_depth += 1;
                self.walk(*item, child);
                self.list_depth -= 1;
                let values = std::mem::replace(&mut self.values, saved);
                if values.is_some_and(|v| !v.areas.is_empty()) {
                    panic!("value checker finished with open areas");
                }
            }
            Expr::Ref(r) => self.walk_ref(id, grammar.ref_target(*r), ctx),
            Expr::After(..) => unreachable!("after nodes never belong to a grammar"),
        }
    }

    fn walk_ref(&mut self, id: ExprId, target: ExprId, ctx: WalkContext) {
        let key = (id, ctx);
        let memoized = self.memo.last().and_then(|memo| memo.get(&key)).cloned();
        if let Some(contribution) = memoized {
            self.replay(&contribution);
            return;
        }
        if let Some(at) = self.recording.iter().rposition(|c| c.reference == id) {
            // recursion without an element in between
            for recording in &mut self.recording[at + 1..] {
                recording.complete = false;
            }
            return;
        }
        self.recording.push(Contribution::new(id, self.list_depth));
        self.walk(target, ctx);
        let Some(done) = self.recording.pop() else {
            return;
        };
        if let Some(parent) = self.recording.last_mut() {
            parent.merge(&done);
        }
        if done.complete {
            if let Some(memo) = self.memo.last_mut() {
                memo.insert(key, Arc::new(done));
            }
        }
    }

    /// Adds what an earlier walk of a reference contributed, comparing each
    /// entry with the checkers' existing entries only: conflicts among the
    /// entries themselves were reported by that walk.
    fn replay(&mut self, contribution: &Contribution) {
        let enclosing = self.enclosing();
        let mut reports = vec![];
        if let Some(checker) = self.attributes.as_ref() {
            let earlier: Vec<_> = checker.comparable().collect();
            for (nc, id) in &contribution.attributes {
                for (other, other_id) in &earlier {
                    if nc.collides(other) {
                        reports.push((
                            DiagnosticKind::DuplicateAttributes,
                            *id,
                            *other_id,
                            vec![nc.to_string()],
                        ));
                    }
                }
            }
        }
        if let Some(checker) = self.elements.as_ref() {
            let earlier: Vec<_> = checker.comparable().collect();
            for (nc, id) in &contribution.elements {
                for (other, other_id) in &earlier {
                    if nc.collides(other) {
                        reports.push((
                            DiagnosticKind::DuplicateElements,
                            *id,
                            *other_id,
                            vec![nc.to_string()],
                        ));
                    }
                }
            }
        }
        if contribution.list_depth == self.list_depth {
            if let Some(checker) = self.values.as_ref() {
                let earlier: Vec<_> = checker.comparable().collect();
                for (literal, id) in &contribution.values {
                    for (kind, other_id, args) in value_findings(literal, &earlier) {
                        reports.push((kind, *id, other_id, args));
                    }
                }
            }
        }
        for (kind, id, other_id, args) in reports {
            self.report(kind, &[id, other_id, enclosing], args);
        }
        for (nc, id) in &contribution.attributes {
            self.push_attribute(nc.clone(), *id);
        }
        for (nc, id) in &contribution.elements {
            self.push_element(nc.clone(), *id);
        }
        if contribution.list_depth == self.list_depth {
            for (literal, id) in &contribution.values {
                self.push_value(literal.clone(), *id);
            }
        }
    }

    /// Walks both operands of a binary branching construct, bracketing each
    /// with an area in the checkers the construct affects.
    fn branch(&mut self, which: Branching, a: ExprId, b: ExprId, ctx: WalkContext) {
        let values = which == Branching::Interleave && ctx.in_interleave_in_list;
        self.areas(which, values, AreaOp::Start);
        self.walk(a, ctx);
        self.areas(which, values, AreaOp::EndBranch);
        self.walk(b, ctx);
        self.areas(which, values, AreaOp::EndBranch);
        self.areas(which, values, AreaOp::End);
    }

    fn areas(&mut self, which: Branching, values: bool, op: AreaOp) {
        let names = match which {
            Branching::Choice => self.attributes.as_mut(),
            Branching::Interleave => self.elements.as_mut(),
        };
        if let Some(checker) = names {
            checker.apply(op);
        }
        if values {
            if let Some(checker) = self.values.as_mut() {
                checker.apply(op);
            }
        }
    }

    fn walk_element_content(&mut self, id: ExprId, content: ExprId) {
        let attributes = self.attributes.replace(AreaChecker::new(AreaMode::Exclusive));
        let elements = self.elements.replace(AreaChecker::new(AreaMode::Inclusive));
        let values = self.values.take();
        let recording = std::mem::take(&mut self.recording);
        let list_depth = std::mem::take(&mut self.list_depth);
        self.memo.push(Memo::default());
        self.enclosing.push(id);
        self.walk(content, WalkContext::default());
        self.enclosing.pop();
        self.memo.pop();
        self.attributes = attributes;
        self.elements = elements;
        self.values = values;
        self.recording = recording;
        self.list_depth = list_depth;
    }

    fn add_attribute(&mut self, id: ExprId, nc: Arc<NameClass>) {
        let Some(checker) = self.attributes.as_ref() else {
            return;
        };
        let conflicts: Vec<ExprId> = checker
            .comparable()
            .filter(|(other, _)| nc.collides(other))
            .map(|(_, other_id)| *other_id)
            .collect();
        self.report_conflicts(DiagnosticKind::DuplicateAttributes, id, &nc, conflicts);
        self.push_attribute(nc, id);
    }

    fn push_attribute(&mut self, nc: Arc<NameClass>, id: ExprId) {
        if let Some(checker) = self.attributes.as_mut() {
            checker.push(nc.clone(), id);
            if let Some(recording) = self.recording.last_mut() {
                if recording.seen.insert(id) {
                    recording.attributes.push((nc, id));
                }
            }
        }
    }

    fn add_element(&mut self, id: ExprId, nc: Arc<NameClass>) {
        let Some(checker) = self.elements.as_ref() else {
            return;
        };
        let conflicts: Vec<ExprId> = checker
            .comparable()
            .filter(|(other, _)| nc.collides(other))
            .map(|(_, other_id)| *other_id)
            .collect();
        self.report_conflicts(DiagnosticKind::DuplicateElements, id, &nc, conflicts);
        self.push_element(nc, id);
    }

    fn push_element(&mut self, nc: Arc<NameClass>, id: ExprId) {
        if let Some(checker) = self.elements.as_mut() {
            checker.push(nc.clone(), id);
            if let Some(recording) = self.recording.last_mut() {
                if recording.seen.insert(id) {
                    recording.elements.push((nc, id));
                }
            }
        }
    }

    fn report_conflicts(
        &mut self,
        kind: DiagnosticKind,
        id: ExprId,
        nc: &NameClass,
        conflicts: Vec<ExprId>,
    ) {
        let enclosing = self.enclosing();
        for conflict in conflicts {
            self.report(kind, &[id, conflict, enclosing], vec![nc.to_string()]);
        }
    }

    /// Values in different branches of an interleave inside a list must be
    /// distinct and of one datatype.
    fn add_value(&mut self, id: ExprId, literal: Arc<ValueLiteral>) {
        let Some(checker) = self.values.as_ref() else {
            return;
        };
        let earlier: Vec<_> = checker.comparable().collect();
        let findings = value_findings(&literal, &earlier);
        let enclosing = self.enclosing();
        for (kind, other_id, args) in findings {
            self.report(kind, &[id, other_id, enclosing], args);
        }
        self.push_value(literal, id);
    }

    fn push_value(&mut self, literal: Arc<ValueLiteral>, id: ExprId) {
        let list_depth = self.list_depth;
        if let Some(checker) = self.values.as_mut() {
            checker.push(literal.clone(), id);
            if let Some(recording) = self.recording.last_mut() {
                if recording.list_depth == list_depth && recording.seen.insert(id) {
                    recording.values.push((literal, id));
                }
            }
        }
    }

    fn check_name_class(&mut self, id: ExprId, nc: &NameClass, attribute: bool) {
        if !self.name_checked.insert(id) {
            return;
        }
        let mut kinds = vec![];
        name_class_violations(nc, &mut kinds);
        if attribute {
            xmlns_violations(nc, &mut kinds);
        }
        let enclosing = self.enclosing();
        for kind in kinds {
            self.report(kind, &[id, enclosing], vec![nc.to_string()]);
        }
    }
}

/// Kind, conflicting node and message arguments for each earlier value that
/// `literal` duplicates or mixes types with.
fn value_findings(
    literal: &ValueLiteral,
    earlier: &[&(Arc<ValueLiteral>, ExprId)],
) -> Vec<(DiagnosticKind, ExprId, Vec<String>)> {
    let mut findings = vec![];
    for (other, other_id) in earlier {
        if other.datatype.name() != literal.datatype.name() {
            findings.push((
                DiagnosticKind::InconsistentValueTypes,
                *other_id,
                vec![
                    literal.datatype.name().to_string(),
                    other.datatype.name().to_string(),
                ],
            ));
        } else if literal.datatype.value_equals(&literal.value, &other.value) {
            findings.push((
                DiagnosticKind::DuplicateValues,
                *other_id,
                vec![literal.lexical.clone()],
            ));
        }
    }
    findings
}

fn name_class_violations(nc: &NameClass, out: &mut Vec<DiagnosticKind>) {
    match nc {
        NameClass::AnyName | NameClass::NamespaceName { .. } | NameClass::SimpleName { .. } => {}
        NameClass::Choice(a, b) => {
            name_class_violations(a, out);
            name_class_violations(b, out);
        }
        NameClass::Difference(base, except) => match **base {
            NameClass::AnyName => {
                if contains(except, &|n| matches!(n, NameClass::AnyName)) {
                    out.push(DiagnosticKind::AnyNameInExcept);
                }
                name_class_violations(except, out);
            }
            NameClass::NamespaceName { .. } => {
                if contains(except, &|n| matches!(n, NameClass::AnyName)) {
                    out.push(DiagnosticKind::AnyNameInNsNameExcept);
                }
                if contains(except, &|n| matches!(n, NameClass::NamespaceName { .. })) {
                    out.push(DiagnosticKind::NsNameInNsNameExcept);
                }
                name_class_violations(except, out);
            }
            _ => out.push(DiagnosticKind::UnsupportedNameClass),
        },
        NameClass::Not(_) => out.push(DiagnosticKind::UnsupportedNameClass),
    }
}

fn contains(nc: &NameClass, pred: &dyn Fn(&NameClass) -> bool) -> bool {
    pred(nc)
        || match nc {
            NameClass::Choice(a, b) | NameClass::Difference(a, b) => {
                contains(a, pred) || contains(b, pred)
            }
            NameClass::Not(a) => contains(a, pred),
            _ => false,
        }
}

/// An attribute may not be named `xmlns` nor live in the xmlns namespace.
/// Only names the class can accept matter, so excepts are not inspected.
fn xmlns_violations(nc: &NameClass, out: &mut Vec<DiagnosticKind>) {
    match nc {
        NameClass::SimpleName {
            namespace_uri,
            local_name,
        } => {
            if namespace_uri.is_empty() && local_name == "xmlns" {
                out.push(DiagnosticKind::XmlnsAttribute);
            }
            if namespace_uri == XMLNS_NAMESPACE {
                out.push(DiagnosticKind::XmlnsNamespace);
            }
        }
        NameClass::NamespaceName { namespace_uri } => {
            if namespace_uri == XMLNS_NAMESPACE {
                out.push(DiagnosticKind::XmlnsNamespace);
            }
        }
        NameClass::Choice(a, b) => {
            xmlns_violations(a, out);
            xmlns_violations(b, out);
        }
        NameClass::Difference(a, _) => xmlns_violations(a, out),
        NameClass::AnyName | NameClass::Not(_) => {}
    }
}
