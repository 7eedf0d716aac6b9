// End-to-end validation through the session driver, with grammars built
// directly through the pool.

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use residual_model::datatype::{DatatypeLibrary, NoNamespaces, xsd};
use residual_model::{
    DiagnosticKind, Expr, ExprId, ExprStore, ExpressionPool, Grammar, NameClass, Pool,
};
use residual_validator::{QName, Session, StartTag};
use std::sync::Arc;

fn tag(name: &str) -> StartTag {
    StartTag::new(QName::local(name))
}

fn element(pool: &mut ExpressionPool, name: &str, content: ExprId) -> ExprId {
    pool.element(NameClass::local(name), content)
}

fn integer_pool() -> (ExpressionPool, residual_model::DatatypeRef) {
    let lib = DatatypeLibrary::with_builtins();
    let integer = lib.lookup(xsd::NAMESPACE_URI, "integer").unwrap();
    (ExpressionPool::new(), integer)
}

fn kinds(result: Result<(), Vec<residual_model::Diagnostic>>) -> Vec<DiagnosticKind> {
    result.err().unwrap_or_default().into_iter().map(|d| d.kind).collect()
}

#[test]
fn sequence_of_two_elements() {
    let mut pool = ExpressionPool::new();
    let a = element(&mut pool, "a", ExprId::EPSILON);
    let b = element(&mut pool, "b", ExprId::EPSILON);
    let start = pool.sequence(a, b);
    let grammar = Arc::new(pool.freeze(start).unwrap());

    let mut session = Session::new(grammar.clone());
    session.on_start_tag(&tag("a")).unwrap();
    session.on_end_tag().unwrap();
    session.on_start_tag(&tag("b")).unwrap();
    session.on_end_tag().unwrap();
    session.finish().unwrap();
    assert!(session.is_accepting());

    let mut session = Session::new(grammar);
    let errors = session.on_start_tag(&tag("b")).unwrap_err();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, DiagnosticKind::UnexpectedElement);
    assert_eq!(errors[0].nodes, vec![a]);
}

#[test]
fn one_or_more_items() {
    let mut pool = ExpressionPool::new();
    let item = element(&mut pool, "item", ExprId::EPSILON);
    let items = pool.one_or_more(item);
    let list = element(&mut pool, "list", items);
    let grammar = Arc::new(pool.freeze(list).unwrap());

    let mut session = Session::new(grammar.clone());
    session.on_start_tag(&tag("list")).unwrap();
    assert_eq!(
        kinds(session.on_end_tag()),
        vec![DiagnosticKind::IncompleteContent]
    );

    for n in 1..4 {
        let mut session = Session::new(grammar.clone());
        session.on_start_tag(&tag("list")).unwrap();
        for _ in 0..n {
            session.on_start_tag(&tag("item")).unwrap();
            session.on_end_tag().unwrap();
        }
        session.on_end_tag().unwrap();
        session.finish().unwrap();
        assert!(session.is_accepting());
    }
}

#[test]
fn data_with_an_exception() {
    let (mut pool, integer) = integer_pool();
    let zero = pool.value(integer.clone(), "0", &NoNamespaces).unwrap();
    let data = pool.data(integer, zero);
    let grammar = Arc::new(pool.freeze(data).unwrap());
    let mut session = Session::new(grammar.clone());

    assert_eq!(session.text(grammar.start(), "0"), ExprId::NULL_SET);
    // equal by value to the exception
    assert_eq!(session.text(grammar.start(), "00"), ExprId::NULL_SET);
    let five = session.text(grammar.start(), "5");
    assert!(session.store().nullable(five));
    assert_eq!(session.text(grammar.start(), "five"), ExprId::NULL_SET);
}

#[test]
fn values_match_by_value_equality() {
    let (mut pool, integer) = integer_pool();
    let one = pool.value(integer, "1", &NoNamespaces).unwrap();
    let e = element(&mut pool, "e", one);
    let grammar = Arc::new(pool.freeze(e).unwrap());
    for text in ["1", "01", " +1 "] {
        let mut session = Session::new(grammar.clone());
        session.on_start_tag(&tag("e")).unwrap();
        session.on_text(text);
        session.on_end_tag().unwrap();
        session.finish().unwrap();
    }
    let mut session = Session::new(grammar);
    session.on_start_tag(&tag("e")).unwrap();
    session.on_text("2");
    assert_eq!(
        kinds(session.on_end_tag()),
        vec![
            DiagnosticKind::UnexpectedText,
            DiagnosticKind::IncompleteContent
        ]
    );
}

#[test]
fn recursive_reference() {
    let mut pool = ExpressionPool::new();
    let r = pool.reference("r");
    let a = element(&mut pool, "a", ExprId::EPSILON);
    let more = pool.sequence(a, r);
    let body = pool.choice(ExprId::EPSILON, more);
    pool.resolve("r", body).unwrap();
    let doc = element(&mut pool, "doc", r);
    let grammar = Arc::new(pool.freeze(doc).unwrap());

    let mut session = Session::new(grammar);
    session.on_start_tag(&tag("doc")).unwrap();
    for _ in 0..3 {
        assert_eq!(session.expected_elements(), vec![a]);
        session.on_start_tag(&tag("a")).unwrap();
        session.on_end_tag().unwrap();
    }
    session.on_end_tag().unwrap();
    session.finish().unwrap();
    assert!(session.is_accepting());
}

#[test]
fn attribute_order_independence() {
    for interleaved in [true, false] {
        let mut pool = ExpressionPool::new();
        let x = pool.attribute(NameClass::local("x"), ExprId::ANY_STRING);
        let y = pool.attribute(NameClass::local("y"), ExprId::ANY_STRING);
        let attributes = if interleaved {
            pool.interleave(x, y)
        } else {
            pool.sequence(x, y)
        };
        let e = element(&mut pool, "e", attributes);
        let grammar = Arc::new(pool.freeze(e).unwrap());
        for order in [["x", "y"], ["y", "x"]] {
            let mut t = tag("e");
            for name in order {
                t = t.with_attribute(QName::local(name), "v");
            }
            let mut session = Session::new(grammar.clone());
            session.on_start_tag(&t).unwrap();
            session.on_end_tag().unwrap();
            session.finish().unwrap();
        }
    }
}

#[test]
fn missing_attribute() {
    let mut pool = ExpressionPool::new();
    let x = pool.attribute(NameClass::local("x"), ExprId::ANY_STRING);
    let y = pool.attribute(NameClass::local("y"), ExprId::ANY_STRING);
    let both = pool.sequence(x, y);
    let e = element(&mut pool, "e", both);
    let grammar = Arc::new(pool.freeze(e).unwrap());
    let mut session = Session::new(grammar);
    let errors = session
        .on_start_tag(&tag("e").with_attribute(QName::local("x"), ""))
        .unwrap_err();
    assert_eq!(errors[0].kind, DiagnosticKind::MissingAttribute);
    assert_eq!(errors[0].args, vec!["e", "attribute y"]);
}

#[test]
fn dead_branches_stay_dead() {
    let mut pool = ExpressionPool::new();
    let a = element(&mut pool, "a", ExprId::EPSILON);
    let b = element(&mut pool, "b", ExprId::EPSILON);
    let ab = pool.sequence(a, b);
    let grammar = Arc::new(pool.freeze(ab).unwrap());
    let mut session = Session::new(grammar);
    let dead = session.start_tag(ab, &tag("b"));
    assert_eq!(dead, ExprId::NULL_SET);
    assert_eq!(session.start_tag(dead, &tag("a")), ExprId::NULL_SET);
    assert_eq!(session.text(dead, ""), ExprId::NULL_SET);
    assert_eq!(session.end_tag(dead), ExprId::NULL_SET);
}

#[test]
fn ambiguity_is_resolved_lazily() {
    // a then b, or a then c: nothing is decided at a
    let mut pool = ExpressionPool::new();
    let a1 = element(&mut pool, "a", ExprId::EPSILON);
    let b = element(&mut pool, "b", ExprId::EPSILON);
    let a2 = element(&mut pool, "a", ExprId::ANY_STRING);
    let c = element(&mut pool, "c", ExprId::EPSILON);
    let ab = pool.sequence(a1, b);
    let ac = pool.sequence(a2, c);
    let start = pool.choice(ab, ac);
    let grammar = Arc::new(pool.freeze(start).unwrap());
    for second in ["b", "c"] {
        let mut session = Session::new(grammar.clone());
        session.on_start_tag(&tag("a")).unwrap();
        session.on_end_tag().unwrap();
        session.on_start_tag(&tag(second)).unwrap();
        session.on_end_tag().unwrap();
        session.finish().unwrap();
    }
    // text inside a kills the first alternative only
    let mut session = Session::new(grammar);
    session.on_start_tag(&tag("a")).unwrap();
    session.on_text("x");
    session.on_end_tag().unwrap();
    assert_matches!(
        session.on_start_tag(&tag("b")),
        Err(errors) if errors[0].kind == DiagnosticKind::UnexpectedElement
    );
}

#[derive(Debug)]
enum Event {
    Start(StartTag),
    End,
}

/// Events of the smallest instance of `id`: choices take a nullable side when
/// there is one and repetitions occur once.
fn minimal(grammar: &Grammar, id: ExprId, tag: &mut StartTag, events: &mut Vec<Event>) {
    match grammar.expr(id) {
        Expr::Sequence(a, b) | Expr::Interleave(a, b) => {
            minimal(grammar, *a, tag, events);
            minimal(grammar, *b, tag, events);
        }
        Expr::Choice(a, b) => {
            let pick = if grammar.nullable(*b) && !grammar.nullable(*a) { *b } else { *a };
            minimal(grammar, pick, tag, events);
        }
        Expr::OneOrMore(a) => minimal(grammar, *a, tag, events),
        Expr::Ref(r) => minimal(grammar, grammar.ref_target(*r), tag, events),
        Expr::Element(nc, content) => {
            let NameClass::SimpleName { namespace_uri, local_name } = nc.as_ref() else {
                panic!("only simple names are generated");
            };
            let mut inner = StartTag::new(QName::new(namespace_uri.as_str(), local_name.as_str()));
            let mut children = vec![];
            minimal(grammar, *content, &mut inner, &mut children);
            events.push(Event::Start(inner));
            events.extend(children);
            events.push(Event::End);
        }
        Expr::Attribute(nc, _) => {
            let NameClass::SimpleName { namespace_uri, local_name } = nc.as_ref() else {
                panic!("only simple names are generated");
            };
            tag.attributes
                .push((QName::new(namespace_uri.as_str(), local_name.as_str()), String::new()));
        }
        Expr::Epsilon | Expr::AnyString => {}
        other => panic!("cannot generate {other:?}"),
    }
}

#[test]
fn minimal_instances_are_accepted() {
    let mut pool = ExpressionPool::new();
    let title = element(&mut pool, "title", ExprId::ANY_STRING);
    let id = pool.attribute(NameClass::local("id"), ExprId::ANY_STRING);
    let lang = pool.attribute(NameClass::local("lang"), ExprId::ANY_STRING);
    let lang = pool.optional(lang);
    let attributes = pool.interleave(id, lang);
    let para = element(&mut pool, "para", ExprId::ANY_STRING);
    let section = pool.reference("section");
    let nested = pool.zero_or_more(section);
    let paras = pool.one_or_more(para);
    let body = pool.sequence(paras, nested);
    let content = pool.sequence(title, body);
    let content = pool.sequence(attributes, content);
    let section_element = element(&mut pool, "section", content);
    pool.resolve("section", section_element).unwrap();
    let front = element(&mut pool, "front", ExprId::EPSILON);
    let front = pool.optional(front);
    let sections = pool.one_or_more(section);
    let book_content = pool.interleave(front, sections);
    let book = element(&mut pool, "book", book_content);
    let grammar = Arc::new(pool.freeze(book).unwrap());
    assert_eq!(grammar.check_restrictions(), vec![]);

    let mut events = vec![];
    minimal(&grammar, grammar.start(), &mut StartTag::new(QName::local("")), &mut events);
    assert_matches!(events.first(), Some(Event::Start(t)) if t.name.local_name == "book");

    let mut session = Session::new(grammar);
    for event in &events {
        match event {
            Event::Start(t) => session.on_start_tag(t).unwrap(),
            Event::End => session.on_end_tag().unwrap(),
        }
    }
    session.finish().unwrap();
    assert!(session.is_accepting());
}

#[test]
fn sessions_share_a_grammar() {
    let mut pool = ExpressionPool::new();
    let a = element(&mut pool, "a", ExprId::ANY_STRING);
    let b = element(&mut pool, "b", ExprId::ANY_STRING);
    let ab = pool.interleave(a, b);
    let many = pool.one_or_more(ab);
    let root = element(&mut pool, "root", many);
    let grammar = Arc::new(pool.freeze(root).unwrap());

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let grammar = grammar.clone();
                scope.spawn(move || {
                    let mut session = Session::new(grammar);
                    session.on_start_tag(&tag("root")).unwrap();
                    for n in 0..=i {
                        let (first, second) = if n % 2 == 0 { ("a", "b") } else { ("b", "a") };
                        session.on_start_tag(&tag(first)).unwrap();
                        session.on_text("x");
                        session.on_end_tag().unwrap();
                        session.on_start_tag(&tag(second)).unwrap();
                        session.on_end_tag().unwrap();
                    }
                    // odd sessions leave an interleave half done
                    if i % 2 == 1 {
                        session.on_start_tag(&tag("a")).unwrap();
                        session.on_end_tag().unwrap();
                    }
                    let _ = session.on_end_tag();
                    session.finish().unwrap();
                    session.is_accepting()
                })
            })
            .collect();
        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(
            results,
            vec![true, false, true, false, true, false, true, false]
        );
    });
}
