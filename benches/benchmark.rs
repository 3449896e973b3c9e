use criterion::{black_box, criterion_group, criterion_main, Criterion};

use atombase::atom::{
    Atom, AtomRef, TypeRegistry, CONCEPT_NODE, LIST_LINK, SCOPE_LINK, VARIABLE_NODE,
};
use atombase::variables::find_variables;

fn concept(name: &str) -> AtomRef {
    Atom::node(CONCEPT_NODE, name)
}

fn var(name: &str) -> AtomRef {
    Atom::node(VARIABLE_NODE, name)
}

/// A term wide and deep enough that the scraper and the substitution
/// engine do real work: alternating lists and shadowing binders.
fn build_term(depth: usize, x: &AtomRef, y: &AtomRef) -> AtomRef {
    let mut term = Atom::link(LIST_LINK, vec![x.clone(), y.clone(), concept("leaf")]);
    for level in 0..depth {
        let shadow = Atom::link(
            SCOPE_LINK,
            vec![
                y.clone(),
                Atom::link(LIST_LINK, vec![x.clone(), y.clone(), term.clone()]),
            ],
        );
        term = Atom::link(
            LIST_LINK,
            vec![
                x.clone(),
                shadow,
                term,
                concept(&format!("filler{level}")),
            ],
        );
    }
    term
}

fn criterion_benchmark(c: &mut Criterion) {
    let registry = TypeRegistry::new();
    let x = var("$x");
    let y = var("$y");
    let term = build_term(12, &x, &y);

    c.bench_function("find_variables deep term", |b| {
        b.iter(|| {
            let vars = find_variables(&registry, std::slice::from_ref(black_box(&term)));
            black_box(vars.len())
        })
    });

    let vars = find_variables(&registry, &[x.clone(), y.clone()]);
    let args = [concept("a"), concept("b")];
    c.bench_function("substitute deep term", |b| {
        b.iter(|| {
            let result = vars
                .substitute(&registry, black_box(&term), black_box(&args))
                .unwrap();
            black_box(result)
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
