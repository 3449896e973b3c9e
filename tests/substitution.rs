use atombase::atom::{
    Atom, AtomRef, TypeRegistry, AND_LINK, CONCEPT_NODE, EVALUATION_LINK, GLOB_NODE,
    INHERITANCE_LINK, LIST_LINK, NUMBER_NODE, PREDICATE_NODE, QUOTE_LINK, SCOPE_LINK, TYPE_NODE,
    TYPED_VARIABLE_LINK, UNQUOTE_LINK, VARIABLE_LIST, VARIABLE_NODE,
};
use atombase::error::AtomError;
use atombase::variables::{find_variables, Variables};

fn var(name: &str) -> AtomRef {
    Atom::node(VARIABLE_NODE, name)
}

fn concept(name: &str) -> AtomRef {
    Atom::node(CONCEPT_NODE, name)
}

fn number(name: &str) -> AtomRef {
    Atom::node(NUMBER_NODE, name)
}

#[test]
fn substitution_is_positional_and_type_checked() {
    let registry = TypeRegistry::new();
    let x = var("$x");
    let y = var("$y");
    let decl = Atom::link(
        VARIABLE_LIST,
        vec![
            Atom::link(
                TYPED_VARIABLE_LINK,
                vec![x.clone(), Atom::node(TYPE_NODE, "ConceptNode")],
            ),
            y.clone(),
        ],
    );
    let vars = Variables::from_vardecl(&registry, &decl).expect("declaration parses");

    // The list mentions the variables in reverse declaration order.
    let term = Atom::link(
        EVALUATION_LINK,
        vec![
            Atom::node(PREDICATE_NODE, "something"),
            Atom::link(LIST_LINK, vec![y.clone(), x.clone()]),
        ],
    );

    let result = vars
        .substitute(&registry, &term, &[concept("one"), number("2")])
        .expect("arguments satisfy the declaration");
    let expected = Atom::link(
        EVALUATION_LINK,
        vec![
            Atom::node(PREDICATE_NODE, "something"),
            Atom::link(LIST_LINK, vec![number("2"), concept("one")]),
        ],
    );
    assert_eq!(result, expected);

    // $x only admits concepts.
    let err = vars
        .substitute(&registry, &term, &[number("3"), number("2")])
        .unwrap_err();
    assert!(matches!(err, AtomError::TypeCheck));
}

#[test]
fn constants_pass_through_unchanged() {
    let registry = TypeRegistry::new();
    let x = var("$x");
    let vars = find_variables(&registry, &[x]);

    let term = Atom::link(
        INHERITANCE_LINK,
        vec![concept("cat"), concept("animal")],
    );
    let result = vars
        .substitute(&registry, &term, &[concept("a")])
        .unwrap();
    assert_eq!(result, term);
}

#[test]
fn bare_variable_reduces_to_its_argument() {
    let registry = TypeRegistry::new();
    let x = var("$x");
    let vars = find_variables(&registry, &[x.clone()]);
    let result = vars.substitute(&registry, &x, &[concept("a")]).unwrap();
    assert_eq!(result, concept("a"));
}

#[test]
fn argument_count_must_match_arity() {
    let registry = TypeRegistry::new();
    let x = var("$x");
    let vars = find_variables(&registry, &[x.clone()]);

    let err = vars.substitute(&registry, &x, &[]).unwrap_err();
    assert!(matches!(
        err,
        AtomError::ArityMismatch {
            expected: 1,
            actual: 0
        }
    ));
    let err = vars
        .substitute(&registry, &x, &[concept("a"), concept("b")])
        .unwrap_err();
    assert!(matches!(err, AtomError::ArityMismatch { .. }));
}

#[test]
fn binder_alpha_hides_its_own_variable() {
    let registry = TypeRegistry::new();
    let x = var("$x");
    let vars = find_variables(&registry, &[x.clone()]);

    let scope = Atom::link(
        SCOPE_LINK,
        vec![x.clone(), Atom::link(AND_LINK, vec![x.clone(), x.clone()])],
    );
    let result = vars
        .substitute(&registry, &scope, &[concept("a")])
        .unwrap();
    // The bound $x shadows the free one completely; nothing changes.
    assert_eq!(result, scope);
}

#[test]
fn binder_leaves_other_free_variables_alone() {
    let registry = TypeRegistry::new();
    let x = var("$x");
    let y = var("$y");
    let vars = find_variables(&registry, &[x.clone()]);

    let inner = Atom::link(
        SCOPE_LINK,
        vec![
            y.clone(),
            Atom::link(LIST_LINK, vec![x.clone(), y.clone()]),
        ],
    );
    let term = Atom::link(LIST_LINK, vec![x.clone(), inner]);

    let result = vars.substitute(&registry, &term, &[concept("a")]).unwrap();
    let expected = Atom::link(
        LIST_LINK,
        vec![
            concept("a"),
            Atom::link(
                SCOPE_LINK,
                vec![
                    y.clone(),
                    Atom::link(LIST_LINK, vec![concept("a"), y.clone()]),
                ],
            ),
        ],
    );
    assert_eq!(result, expected);
}

#[test]
fn binder_with_declaration_list_hides_too() {
    let registry = TypeRegistry::new();
    let x = var("$x");
    let vars = find_variables(&registry, &[x.clone()]);

    let scope = Atom::link(
        SCOPE_LINK,
        vec![
            Atom::link(VARIABLE_LIST, vec![x.clone()]),
            Atom::link(AND_LINK, vec![x.clone()]),
        ],
    );
    let result = vars.substitute(&registry, &scope, &[concept("a")]).unwrap();
    assert_eq!(result, scope);
}

#[test]
fn quotation_suspends_and_unquotation_resumes() {
    let registry = TypeRegistry::new();
    let x = var("$x");
    let vars = find_variables(&registry, &[x.clone()]);

    // A quoted variable stays literal.
    let quoted = Atom::link(QUOTE_LINK, vec![x.clone()]);
    let result = vars
        .substitute(&registry, &quoted, &[concept("a")])
        .unwrap();
    assert_eq!(result, quoted);

    // Each unquote re-enables substitution by one level.
    let requoted = Atom::link(
        QUOTE_LINK,
        vec![Atom::link(UNQUOTE_LINK, vec![x.clone()])],
    );
    let result = vars
        .substitute(&registry, &requoted, &[concept("a")])
        .unwrap();
    let expected = Atom::link(
        QUOTE_LINK,
        vec![Atom::link(UNQUOTE_LINK, vec![concept("a")])],
    );
    assert_eq!(result, expected);
}

#[test]
fn glob_splices_a_sequence_into_the_outgoing_set() {
    let registry = TypeRegistry::new();
    let g = Atom::node(GLOB_NODE, "$g");
    let vars = find_variables(&registry, &[g.clone()]);

    let term = Atom::link(LIST_LINK, vec![concept("a"), g.clone(), concept("b")]);
    let result = vars
        .substitute(
            &registry,
            &term,
            &[Atom::link(LIST_LINK, vec![concept("x"), concept("y")])],
        )
        .unwrap();
    let expected = Atom::link(
        LIST_LINK,
        vec![concept("a"), concept("x"), concept("y"), concept("b")],
    );
    assert_eq!(result, expected);
}

#[test]
fn glob_bound_to_a_node_replaces_the_term() {
    let registry = TypeRegistry::new();
    let g = Atom::node(GLOB_NODE, "$g");
    let vars = find_variables(&registry, &[g.clone()]);

    let result = vars.substitute(&registry, &g, &[concept("n")]).unwrap();
    assert_eq!(result, concept("n"));
}
