use std::sync::Arc;

use atombase::atom::{Atom, AtomTable, TypeId, TypeRegistry, AtomRef, NODE};
use atombase::error::AtomError;
use atombase::persist::{AtomStorage, StorageConfig};

fn cleanup(path: &str) {
    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(format!("{path}-wal"));
    let _ = std::fs::remove_file(format!("{path}-shm"));
}

#[test]
fn typemap_round_trips_every_local_type() {
    let path = "test_atombase_typemap_roundtrip.db";
    cleanup(path);

    let registry = TypeRegistry::new();
    registry.register("CustomNode", NODE);
    let storage =
        AtomStorage::open(StorageConfig::file(path), Arc::clone(&registry)).expect("open");

    for t in 0..registry.type_count() as TypeId {
        let db = storage
            .db_type_for(t)
            .expect("reconciled")
            .expect("every local type gets a code");
        assert_eq!(storage.local_type_for(db).expect("reconciled"), Some(t));
    }

    cleanup(path);
}

#[test]
fn differing_local_numbering_survives_reconciliation() {
    let path = "test_atombase_typemap_renumber.db";
    cleanup(path);

    // First process: FooNode gets the lower number.
    let registry = TypeRegistry::new();
    let foo = registry.register("FooNode", NODE);
    let bar = registry.register("BarNode", NODE);
    let stored: AtomRef = Atom::node(foo, "f1");
    {
        let storage =
            AtomStorage::open(StorageConfig::file(path), Arc::clone(&registry)).expect("open");
        storage.store_atom(&stored, true).expect("store foo");
        storage
            .store_atom(&Atom::node(bar, "b1"), true)
            .expect("store bar");
    }

    // Second process registers the same types in the opposite order, so
    // its numbers disagree with the rows in TypeCodes.
    let registry = TypeRegistry::new();
    let bar2 = registry.register("BarNode", NODE);
    let foo2 = registry.register("FooNode", NODE);
    assert_eq!(foo, bar2);
    assert_ne!(foo, foo2);

    let storage =
        AtomStorage::open(StorageConfig::file(path), Arc::clone(&registry)).expect("reopen");
    let table = AtomTable::new();
    assert_eq!(storage.load(&table).expect("load"), 2);
    assert!(table.get(&Atom::node(foo2, "f1")).is_some());
    assert!(table.get(&Atom::node(bar2, "b1")).is_some());

    // The database numbering is authoritative for old names; the maps
    // stay mutually inverse.
    let db_foo = storage
        .db_type_for(foo2)
        .expect("reconciled")
        .expect("mapped");
    assert_eq!(db_foo, foo as i32);
    assert_eq!(
        storage.local_type_for(db_foo).expect("reconciled"),
        Some(foo2)
    );

    cleanup(path);
}

#[test]
fn loading_an_unknown_type_fails_for_that_row() {
    let path = "test_atombase_typemap_unknown.db";
    cleanup(path);

    let registry = TypeRegistry::new();
    let alien = registry.register("AlienNode", NODE);
    {
        let storage =
            AtomStorage::open(StorageConfig::file(path), Arc::clone(&registry)).expect("open");
        storage
            .store_atom(&Atom::node(alien, "visitor"), true)
            .expect("store");
    }

    // A process without AlienNode cannot reconstruct the row.
    let registry = TypeRegistry::new();
    let storage =
        AtomStorage::open(StorageConfig::file(path), Arc::clone(&registry)).expect("reopen");
    let table = AtomTable::new();
    let err = storage.load(&table).expect_err("unknown type is fatal");
    assert!(matches!(err, AtomError::UnknownType(name) if name == "AlienNode"));

    cleanup(path);
}
