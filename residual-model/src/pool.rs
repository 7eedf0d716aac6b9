//! Canonicalizing construction of expression nodes.
//!
//! Every node is interned: a request for a node whose variant and operand
//! handles match an existing node yields that node's handle, so handle equality
//! is structural equality. Operands must already be members of the same pool.

use crate::Location;
use crate::datatype::{DatatypeRef, Namespaces};
use crate::error::{DatatypeError, GrammarError};
use crate::expr::{Expr, ExprId, RefId, ValueLiteral};
use crate::grammar::Grammar;
use crate::name_class::NameClass;
use fnv::FnvHashMap;
use std::collections::{BTreeSet, HashSet};
use std::io;
use std::sync::Arc;

/// Read access to a set of canonical nodes.
pub trait ExprStore {
    fn expr(&self, id: ExprId) -> &Expr;

    /// Epsilon-reducibility of a member node.
    fn nullable(&self, id: ExprId) -> bool;

    /// `NULL_SET` while the reference is unresolved.
    fn ref_target(&self, id: RefId) -> ExprId;

    /// The canonical handle for `expr`, if it has been interned.
    fn lookup(&self, expr: &Expr) -> Option<ExprId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, id: ExprId) -> bool {
        id.index() < self.len()
    }

    /// Follows reference nodes to the first non-reference node.
    fn deref(&self, mut id: ExprId) -> ExprId {
        let mut hops = 0;
        while let Expr::Ref(r) = self.expr(id) {
            id = self.ref_target(*r);
            hops += 1;
            if hops > self.len() {
                // only possible in a grammar that was never frozen
                return ExprId::NULL_SET;
            }
        }
        id
    }

    /// Writes an indented tree of the node, printing each shared node once.
    fn dump<W: io::Write>(&self, id: ExprId, w: &mut W) -> Result<(), io::Error>
    where
        Self: Sized,
    {
        let mut seen = HashSet::new();
        dump_node(self, 0, id, w, &mut seen)
    }
}

fn dump_node<S: ExprStore, W: io::Write>(
    store: &S,
    depth: usize,
    id: ExprId,
    w: &mut W,
    seen: &mut HashSet<ExprId>,
) -> Result<(), io::Error> {
    for _ in 0..depth {
        w.write_all(b"  ")?;
    }
    let expr = store.expr(id);
    if !seen.insert(id) {
        return writeln!(w, "^{}{}", expr.kind_name(), id.0);
    }
    match expr {
        Expr::Element(nc, _) | Expr::Attribute(nc, _) => {
            write!(w, "{}{} {}", expr.kind_name(), id.0, nc)?
        }
        Expr::Data(dt, _) => write!(w, "data{} {}", id.0, dt.name())?,
        Expr::Value(v) => write!(w, "value{} {} {:?}", id.0, v.datatype.name(), v.lexical)?,
        Expr::Ref(r) => write!(w, "ref{} -> {}", id.0, store.ref_target(*r).0)?,
        _ => write!(w, "{}{}", expr.kind_name(), id.0)?,
    }
    let children: Vec<_> = match expr {
        Expr::Data(_, except) if *except == ExprId::NULL_SET => vec![],
        _ => expr.children().collect(),
    };
    if children.is_empty() {
        return writeln!(w);
    }
    writeln!(w, "(")?;
    for child in children {
        dump_node(store, depth + 1, child, w, seen)?;
    }
    for _ in 0..depth {
        w.write_all(b"  ")?;
    }
    writeln!(w, ")")
}

/// Epsilon-reducibility of `expr` from that of its operands. References use
/// whatever the store currently knows about their target. Stores layered over
/// a frozen grammar use this to fill their own table.
pub fn compute_nullable<S: ExprStore + ?Sized>(store: &S, expr: &Expr) -> bool {
    match *expr {
        Expr::Epsilon => true,
        Expr::NullSet
        | Expr::AnyString
        | Expr::Element(..)
        | Expr::Attribute(..)
        | Expr::Data(..)
        | Expr::Value(_)
        | Expr::List(_)
        | Expr::After(..) => false,
        Expr::Sequence(a, b) | Expr::Interleave(a, b) => store.nullable(a) && store.nullable(b),
        Expr::Choice(a, b) => store.nullable(a) || store.nullable(b),
        Expr::OneOrMore(a) => store.nullable(a),
        Expr::Ref(r) => {
            let target = store.ref_target(r);
            target != ExprId::NULL_SET && store.nullable(target)
        }
    }
}

/// A store that can intern new nodes. The factories apply the simplification
/// rules before interning, so any two pools agree on the canonical shape.
pub trait Pool: ExprStore {
    /// Registers `expr`, whose operands must already be members, returning
    /// the canonical handle.
    fn intern(&mut self, expr: Expr) -> ExprId;

    fn sequence(&mut self, a: ExprId, b: ExprId) -> ExprId {
        if a == ExprId::NULL_SET || b == ExprId::NULL_SET {
            ExprId::NULL_SET
        } else if a == ExprId::EPSILON {
            b
        } else if b == ExprId::EPSILON {
            a
        } else {
            self.intern(Expr::Sequence(a, b))
        }
    }

    /// Flattens both operands into their choice leaves, drops duplicates and
    /// `NULL_SET`, and rebuilds a right-leaning chain in handle order.
    fn choice(&mut self, a: ExprId, b: ExprId) -> ExprId {
        if a == ExprId::NULL_SET || a == b {
            return b;
        }
        if b == ExprId::NULL_SET {
            return a;
        }
        let mut leaves = BTreeSet::new();
        choice_leaves(&*self, a, &mut leaves);
        choice_leaves(&*self, b, &mut leaves);
        leaves.remove(&ExprId::NULL_SET);
        let mut rev = leaves.into_iter().rev();
        let Some(mut acc) = rev.next() else {
            return ExprId::NULL_SET;
        };
        for leaf in rev {
            acc = self.intern(Expr::Choice(leaf, acc));
        }
        acc
    }

    fn interleave(&mut self, a: ExprId, b: ExprId) -> ExprId {
        if a == ExprId::NULL_SET || b == ExprId::NULL_SET {
            ExprId::NULL_SET
        } else if a == ExprId::EPSILON {
            b
        } else if b == ExprId::EPSILON {
            a
        } else if a <= b {
            self.intern(Expr::Interleave(a, b))
        } else {
            self.intern(Expr::Interleave(b, a))
        }
    }

    fn one_or_more(&mut self, a: ExprId) -> ExprId {
        if a == ExprId::NULL_SET || a == ExprId::EPSILON || a == ExprId::ANY_STRING {
            return a;
        }
        if let Expr::OneOrMore(_) = self.expr(a) {
            return a;
        }
        self.intern(Expr::OneOrMore(a))
    }

    fn element(&mut self, name_class: impl Into<Arc<NameClass>>, content: ExprId) -> ExprId
    where
        Self: Sized,
    {
        self.intern(Expr::Element(name_class.into(), content))
    }

    fn attribute(&mut self, name_class: impl Into<Arc<NameClass>>, value: ExprId) -> ExprId
    where
        Self: Sized,
    {
        self.intern(Expr::Attribute(name_class.into(), value))
    }

    /// `except` is `NULL_SET` for a plain data leaf.
    fn data(&mut self, datatype: DatatypeRef, except: ExprId) -> ExprId {
        self.intern(Expr::Data(datatype, except))
    }

    /// A value leaf; the literal is converted through `datatype` in the
    /// namespace context `ns`.
    fn value(
        &mut self,
        datatype: DatatypeRef,
        lexical: &str,
        ns: &dyn Namespaces,
    ) -> Result<ExprId, DatatypeError> {
        let value = datatype
            .convert(lexical, ns)
            .ok_or_else(|| DatatypeError::InvalidLiteral {
                datatype: datatype.name().to_string(),
                literal: lexical.to_string(),
            })?;
        Ok(self.intern(Expr::Value(Arc::new(ValueLiteral {
            datatype,
            lexical: lexical.to_string(),
            value,
        }))))
    }

    fn list(&mut self, item: ExprId) -> ExprId {
        if item == ExprId::NULL_SET {
            return item;
        }
        self.intern(Expr::List(item))
    }

    /// Residual only: `content` of an open element, then `continuation`.
    fn after(&mut self, content: ExprId, continuation: ExprId) -> ExprId {
        if content == ExprId::NULL_SET || continuation == ExprId::NULL_SET {
            ExprId::NULL_SET
        } else {
            self.intern(Expr::After(content, continuation))
        }
    }

    fn optional(&mut self, a: ExprId) -> ExprId {
        self.choice(ExprId::EPSILON, a)
    }

    fn zero_or_more(&mut self, a: ExprId) -> ExprId {
        let more = self.one_or_more(a);
        self.optional(more)
    }

    fn mixed(&mut self, a: ExprId) -> ExprId {
        self.interleave(ExprId::ANY_STRING, a)
    }
}

fn choice_leaves<S: ExprStore + ?Sized>(store: &S, id: ExprId, out: &mut BTreeSet<ExprId>) {
    match store.expr(id) {
        Expr::Choice(a, b) => {
            let (a, b) = (*a, *b);
            choice_leaves(store, a, out);
            choice_leaves(store, b, out);
        }
        _ => {
            out.insert(id);
        }
    }
}

#[derive(Debug)]
pub(crate) struct RefDecl {
    pub(crate) name: String,
    pub(crate) target: Option<ExprId>,
    pub(crate) node: ExprId,
}

/// The pool a grammar reader builds a grammar in. Consumed by
/// [`ExpressionPool::freeze`].
#[derive(Debug)]
pub struct ExpressionPool {
    pub(crate) nodes: Vec<Expr>,
    pub(crate) nullable: Vec<bool>,
    pub(crate) memo: FnvHashMap<Expr, ExprId>,
    pub(crate) refs: Vec<RefDecl>,
    ref_names: FnvHashMap<String, RefId>,
    pub(crate) locations: FnvHashMap<ExprId, Location>,
}

impl Default for ExpressionPool {
    fn default() -> Self {
        ExpressionPool::new()
    }
}

impl ExpressionPool {
    pub fn new() -> ExpressionPool {
        let mut pool = ExpressionPool {
            nodes: vec![],
            nullable: vec![],
            memo: FnvHashMap::default(),
            refs: vec![],
            ref_names: FnvHashMap::default(),
            locations: FnvHashMap::default(),
        };
        for seed in [Expr::NullSet, Expr::Epsilon, Expr::AnyString] {
            pool.push(seed);
        }
        pool
    }

    fn push(&mut self, expr: Expr) -> ExprId {
        let idx = self.nodes.len();
        if idx > 0x0fff_ffff {
            panic!("too many expressions");
        }
        let id = ExprId(idx as u32);
        let nullable = compute_nullable(&*self, &expr);
        self.nullable.push(nullable);
        self.memo.insert(expr.clone(), id);
        self.nodes.push(expr);
        id
    }

    fn ref_id(&mut self, name: &str) -> RefId {
        if let Some(r) = self.ref_names.get(name) {
            return *r;
        }
        let r = RefId(self.refs.len() as u32);
        self.refs.push(RefDecl {
            name: name.to_string(),
            target: None,
            node: ExprId::NULL_SET,
        });
        self.refs[r.index()].node = self.push(Expr::Ref(r));
        self.ref_names.insert(name.to_string(), r);
        r
    }

    /// The reference node for `name`, declared on first use. The same name
    /// always yields the same node.
    pub fn reference(&mut self, name: &str) -> ExprId {
        let r = self.ref_id(name);
        self.refs[r.index()].node
    }

    /// Back-patches the target of `name`. May precede the first
    /// [`ExpressionPool::reference`] to it; resolving again with a different
    /// target is an error.
    pub fn resolve(&mut self, name: &str, target: ExprId) -> Result<(), GrammarError> {
        assert!(self.contains(target), "resolve target is not a member of this pool");
        let r = self.ref_id(name);
        let decl = &mut self.refs[r.index()];
        match decl.target {
            Some(existing) if existing != target => Err(GrammarError::Redefinition {
                name: name.to_string(),
            }),
            _ => {
                decl.target = Some(target);
                Ok(())
            }
        }
    }

    /// Records where `expr` was declared. The first recorded location wins,
    /// since shared nodes may be requested from many places.
    pub fn locate(&mut self, expr: ExprId, location: Location) {
        self.locations.entry(expr).or_insert(location);
    }

    /// Checks reference resolution and recursion, then yields the immutable
    /// grammar rooted at `start`.
    pub fn freeze(self, start: ExprId) -> Result<Grammar, GrammarError> {
        Grammar::freeze(self, start)
    }
}

impl ExprStore for ExpressionPool {
    fn expr(&self, id: ExprId) -> &Expr {
        &self.nodes[id.index()]
    }

    fn nullable(&self, id: ExprId) -> bool {
        self.nullable[id.index()]
    }

    fn ref_target(&self, id: RefId) -> ExprId {
        self.refs[id.index()].target.unwrap_or(ExprId::NULL_SET)
    }

    fn lookup(&self, expr: &Expr) -> Option<ExprId> {
        self.memo.get(expr).copied()
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }
}

impl Pool for ExpressionPool {
    fn intern(&mut self, expr: Expr) -> ExprId {
        assert!(
            !matches!(expr, Expr::After(..)),
            "after nodes never belong to a grammar"
        );
        assert!(
            !matches!(expr, Expr::Ref(_)),
            "references are declared with ExpressionPool::reference"
        );
        for child in expr.children() {
            assert!(self.contains(child), "operand {child:?} is not a pool member");
        }
        if let Some(id) = self.memo.get(&expr) {
            return *id;
        }
        self.push(expr)
    }
}
