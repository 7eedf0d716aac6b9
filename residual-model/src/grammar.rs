use crate::Location;
use crate::diagnostic::Diagnostic;
use crate::error::GrammarError;
use crate::expr::{Expr, ExprId, RefId};
use crate::pool::{ExprStore, ExpressionPool, compute_nullable};
use crate::restrictions::RestrictionChecker;
use fnv::FnvHashMap;

/// An immutable, fully resolved grammar. Shared between validation sessions
/// behind an `Arc`; nothing in it changes after [`ExpressionPool::freeze`].
#[derive(Debug)]
pub struct Grammar {
    start: ExprId,
    nodes: Vec<Expr>,
    nullable: Vec<bool>,
    memo: FnvHashMap<Expr, ExprId>,
    refs: Vec<(String, ExprId)>,
    locations: FnvHashMap<ExprId, Location>,
}

impl Grammar {
    pub(crate) fn freeze(pool: ExpressionPool, start: ExprId) -> Result<Grammar, GrammarError> {
        assert!(pool.contains(start), "start is not a pool member");
        check_references(&pool, start)?;

        let ExpressionPool {
            nodes,
            memo,
            refs,
            locations,
            ..
        } = pool;
        let mut grammar = Grammar {
            start,
            nullable: vec![false; nodes.len()],
            nodes,
            memo,
            refs: refs
                .into_iter()
                .map(|decl| (decl.name, decl.target.unwrap_or(ExprId::NULL_SET)))
                .collect(),
            locations,
        };
        grammar.compute_nullable_fixpoint();
        check_recursion(&grammar)?;
        log::debug!(
            "froze grammar with {} expressions and {} references",
            grammar.nodes.len(),
            grammar.refs.len()
        );
        Ok(grammar)
    }

    /// Least fixpoint: every node starts out not nullable and the table is
    /// swept until nothing changes, which is what makes recursive references
    /// come out right.
    fn compute_nullable_fixpoint(&mut self) {
        let mut changed = true;
        while changed {
            changed = false;
            for i in 0..self.nodes.len() {
                if !self.nullable[i] && compute_nullable(&*self, &self.nodes[i]) {
                    self.nullable[i] = true;
                    changed = true;
                }
            }
        }
    }

    pub fn start(&self) -> ExprId {
        self.start
    }

    pub fn ref_name(&self, id: RefId) -> &str {
        &self.refs[id.index()].0
    }

    pub fn location(&self, id: ExprId) -> Option<Location> {
        self.locations.get(&id).copied()
    }

    /// Runs the static restriction checks over the whole grammar, reporting
    /// every violation found.
    pub fn check_restrictions(&self) -> Vec<Diagnostic> {
        RestrictionChecker::new(self).check()
    }
}

impl ExprStore for Grammar {
    fn expr(&self, id: ExprId) -> &Expr {
        &self.nodes[id.index()]
    }

    fn nullable(&self, id: ExprId) -> bool {
        self.nullable[id.index()]
    }

    fn ref_target(&self, id: RefId) -> ExprId {
        self.refs[id.index()].1
    }

    fn lookup(&self, expr: &Expr) -> Option<ExprId> {
        self.memo.get(expr).copied()
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }
}

fn check_references(pool: &ExpressionPool, start: ExprId) -> Result<(), GrammarError> {
    let mut seen = vec![false; pool.len()];
    let mut stack = vec![start];
    let mut unresolved = vec![];
    while let Some(id) = stack.pop() {
        if std::mem::replace(&mut seen[id.index()], true) {
            continue;
        }
        let expr = pool.expr(id);
        if let Expr::Ref(r) = expr {
            match pool.refs[r.index()].target {
                Some(target) => stack.push(target),
                None => unresolved.push(pool.refs[r.index()].name.clone()),
            }
        }
        stack.extend(expr.children());
    }
    if unresolved.is_empty() {
        Ok(())
    } else {
        unresolved.sort();
        Err(GrammarError::UnresolvedReferences { names: unresolved })
    }
}

/// A reference that reaches itself through head positions only (places a
/// derivative descends into without consuming a token) would make derivatives
/// expand forever.
///
/// Operands behind a consuming step (element and attribute content, list
/// items, data excepts, and the tail of a sequence whose head is not
/// nullable) start a fresh path and are queued as roots of their own.
fn check_recursion(grammar: &Grammar) -> Result<(), GrammarError> {
    let mut on_path = vec![false; grammar.len()];
    let mut done = vec![false; grammar.len()];
    let mut roots = vec![grammar.start];
    while let Some(root) = roots.pop() {
        visit_heads(grammar, root, &mut on_path, &mut done, &mut roots)?;
    }
    Ok(())
}

fn visit_heads(
    grammar: &Grammar,
    id: ExprId,
    on_path: &mut [bool],
    done: &mut [bool],
    roots: &mut Vec<ExprId>,
) -> Result<(), GrammarError> {
    if done[id.index()] {
        return Ok(());
    }
    let expr = grammar.expr(id);
    match *expr {
        Expr::Element(_, inner)
        | Expr::Attribute(_, inner)
        | Expr::List(inner)
        | Expr::Data(_, inner) => roots.push(inner),
        Expr::Sequence(a, b) if !grammar.nullable(a) => {
            roots.push(b);
            visit_heads(grammar, a, on_path, done, roots)?;
        }
        Expr::Ref(r) => {
            if on_path[id.index()] {
                return Err(GrammarError::UnguardedRecursion {
                    name: grammar.ref_name(r).to_string(),
                });
            }
            on_path[id.index()] = true;
            visit_heads(grammar, grammar.ref_target(r), on_path, done, roots)?;
            on_path[id.index()] = false;
        }
        _ => {
            for child in expr.children() {
                visit_heads(grammar, child, on_path, done, roots)?;
            }
        }
    }
    done[id.index()] = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name_class::NameClass;
    use crate::pool::Pool;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    #[test]
    fn unresolved_references_are_reported() {
        let mut pool = ExpressionPool::new();
        let b = pool.reference("b");
        let a = pool.reference("a");
        let start = pool.sequence(a, b);
        assert_matches!(
            pool.freeze(start),
            Err(GrammarError::UnresolvedReferences { names }) if names == vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn unreachable_references_may_stay_unresolved() {
        let mut pool = ExpressionPool::new();
        pool.reference("unused");
        let start = pool.element(NameClass::local("a"), ExprId::EPSILON);
        assert!(pool.freeze(start).is_ok());
    }

    #[test]
    fn recursion_through_an_element_is_allowed() {
        let mut pool = ExpressionPool::new();
        let r = pool.reference("r");
        let e = pool.element(NameClass::local("a"), r);
        let body = pool.optional(e);
        pool.resolve("r", body).unwrap();
        let g = pool.freeze(r).unwrap();
        assert!(g.nullable(r));
    }

    #[test]
    fn recursion_after_a_consuming_head_is_allowed() {
        let mut pool = ExpressionPool::new();
        let r = pool.reference("r");
        let a = pool.element(NameClass::local("a"), ExprId::EPSILON);
        let body = pool.sequence(a, r);
        let body = pool.optional(body);
        pool.resolve("r", body).unwrap();
        let g = pool.freeze(r).unwrap();
        assert!(g.nullable(r));
    }

    #[test]
    fn unguarded_recursion_is_rejected() {
        let mut pool = ExpressionPool::new();
        let r = pool.reference("r");
        let a = pool.element(NameClass::local("a"), ExprId::EPSILON);
        // left recursion: r = (r, a)?
        let body = pool.sequence(r, a);
        let body = pool.optional(body);
        pool.resolve("r", body).unwrap();
        assert_matches!(
            pool.freeze(r),
            Err(GrammarError::UnguardedRecursion { name }) if name == "r"
        );
    }

    #[test]
    fn unguarded_recursion_inside_an_element() {
        let mut pool = ExpressionPool::new();
        let r = pool.reference("r");
        let body = pool.optional(r);
        pool.resolve("r", body).unwrap();
        let start = pool.element(NameClass::local("a"), r);
        assert_matches!(
            pool.freeze(start),
            Err(GrammarError::UnguardedRecursion { .. })
        );
    }

    #[test]
    fn nullable_fixpoint_through_references() {
        let mut pool = ExpressionPool::new();
        let x = pool.reference("x");
        let y = pool.reference("y");
        let a = pool.element(NameClass::local("a"), ExprId::EPSILON);
        let seq = pool.sequence(y, y);
        pool.resolve("x", seq).unwrap();
        let y_body = pool.optional(a);
        pool.resolve("y", y_body).unwrap();
        let g = pool.freeze(x).unwrap();
        assert!(g.nullable(x));
        assert!(g.nullable(seq));
        assert!(!g.nullable(a));
    }

    #[test]
    fn grammars_are_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Grammar>();
        assert_send_sync::<Arc<Grammar>>();
    }
}
