//! What a residual would accept next, for error messages.

use residual_model::{Expr, ExprId, ExprStore};
use std::collections::HashSet;

/// At most this many alternatives are spelled out in a description.
const MAX_ALTERNATIVES: usize = 4;

/// Leaves that may consume the next token: elements, attributes and text
/// leaves reachable without consuming anything first. Each node is listed once,
/// in the order first reached.
pub fn heads<S: ExprStore>(store: &S, id: ExprId) -> Vec<ExprId> {
    let mut result = vec![];
    let mut seen = HashSet::new();
    head(store, id, &mut seen, &mut result);
    result
}

fn head<S: ExprStore>(store: &S, id: ExprId, seen: &mut HashSet<ExprId>, result: &mut Vec<ExprId>) {
    if !seen.insert(id) {
        return;
    }
    match *store.expr(id) {
        Expr::Choice(a, b) | Expr::Interleave(a, b) => {
            head(store, a, seen, result);
            head(store, b, seen, result);
        }
        Expr::Sequence(a, b) => {
            head(store, a, seen, result);
            if store.nullable(a) {
                head(store, b, seen, result);
            }
        }
        Expr::OneOrMore(a) | Expr::After(a, _) => head(store, a, seen, result),
        Expr::Ref(r) => head(store, store.ref_target(r), seen, result),
        Expr::Element(..)
        | Expr::Attribute(..)
        | Expr::AnyString
        | Expr::Data(..)
        | Expr::Value(_)
        | Expr::List(_) => result.push(id),
        Expr::Epsilon | Expr::NullSet => {}
    }
}

/// Head element nodes only.
pub fn head_elements<S: ExprStore>(store: &S, id: ExprId) -> Vec<ExprId> {
    heads(store, id)
        .into_iter()
        .filter(|h| matches!(store.expr(*h), Expr::Element(..)))
        .collect()
}

fn describe_head<S: ExprStore>(store: &S, id: ExprId) -> String {
    match store.expr(id) {
        Expr::Element(nc, _) => format!("element {nc}"),
        Expr::Attribute(nc, _) => format!("attribute {nc}"),
        Expr::Data(dt, _) => format!("data {}", dt.name()),
        Expr::Value(v) => format!("{:?}", v.lexical),
        Expr::List(_) => "list".to_string(),
        _ => "text".to_string(),
    }
}

/// One-line summary of `heads`, such as `element a, element b or text`.
pub fn describe_expected<S: ExprStore>(store: &S, heads: &[ExprId]) -> String {
    let mut names: Vec<String> = vec![];
    for h in heads {
        let name = describe_head(store, *h);
        if !names.contains(&name) {
            names.push(name);
        }
    }
    match names.len() {
        0 => "nothing".to_string(),
        1 => names.remove(0),
        n if n <= MAX_ALTERNATIVES => {
            let last = names.pop().unwrap_or_default();
            format!("{} or {}", names.join(", "), last)
        }
        n => format!(
            "{} or one of {} more",
            names[..MAX_ALTERNATIVES].join(", "),
            n - MAX_ALTERNATIVES
        ),
    }
}
