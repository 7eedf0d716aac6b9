use crate::token::QName;
use residual_model::{Diagnostic, DiagnosticKind, Expr, ExprId, ExprStore, Grammar};
use std::sync::Arc;

/// Candidate element rules for a fragment ("island") of a document validated
/// apart from its surroundings. Each start tag at the top of the island drops
/// the candidates whose name class rejects it; the survivors are handed back
/// when the island ends.
#[derive(Debug)]
pub struct IslandCandidates {
    grammar: Arc<Grammar>,
    candidates: Vec<ExprId>,
}

impl IslandCandidates {
    /// `rules` that are not (references to) element nodes are ignored.
    pub fn new(grammar: Arc<Grammar>, rules: impl IntoIterator<Item = ExprId>) -> IslandCandidates {
        let candidates = rules
            .into_iter()
            .map(|id| grammar.deref(id))
            .filter(|id| matches!(grammar.expr(*id), Expr::Element(..)))
            .collect();
        IslandCandidates {
            grammar,
            candidates,
        }
    }

    pub fn candidates(&self) -> &[ExprId] {
        &self.candidates
    }

    /// Keeps the candidates accepting `name`. When none would remain, the
    /// candidates are left as they were and an error is returned.
    pub fn on_start_tag(&mut self, name: &QName) -> Result<(), Diagnostic> {
        let grammar = &self.grammar;
        let remaining: Vec<ExprId> = self
            .candidates
            .iter()
            .copied()
            .filter(|id| match grammar.expr(*id) {
                Expr::Element(nc, _) => nc.accepts(&name.namespace_uri, &name.local_name),
                _ => false,
            })
            .collect();
        if remaining.is_empty() {
            let mut diagnostic = Diagnostic::new(DiagnosticKind::UnexpectedElement)
                .with_arg(name.to_string())
                .with_arg(crate::expected::describe_expected(
                    grammar.as_ref(),
                    &self.candidates,
                ));
            for id in &self.candidates {
                diagnostic = diagnostic
                    .with_node(*id)
                    .with_location(grammar.location(*id));
            }
            return Err(diagnostic);
        }
        self.candidates = remaining;
        Ok(())
    }

    pub fn finish(self) -> Vec<ExprId> {
        self.candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use residual_model::{ExpressionPool, NameClass, Pool};

    #[test]
    fn candidates_narrow_down() {
        let mut pool = ExpressionPool::new();
        let a = pool.element(NameClass::local("a"), ExprId::EPSILON);
        let any = pool.element(NameClass::AnyName, ExprId::ANY_STRING);
        let r = pool.reference("r");
        pool.resolve("r", any).unwrap();
        let start = pool.choice(a, r);
        let grammar = Arc::new(pool.freeze(start).unwrap());

        let mut island = IslandCandidates::new(grammar.clone(), [a, r, ExprId::EPSILON]);
        assert_eq!(island.candidates(), &[a, any]);
        island.on_start_tag(&QName::local("b")).unwrap();
        assert_eq!(island.candidates(), &[any]);

        let mut island = IslandCandidates::new(grammar, [a]);
        assert_matches!(
            island.on_start_tag(&QName::local("b")),
            Err(Diagnostic { kind: DiagnosticKind::UnexpectedElement, .. })
        );
        assert_eq!(island.finish(), vec![a]);
    }
}
