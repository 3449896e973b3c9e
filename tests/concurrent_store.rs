use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use atombase::atom::{Atom, AtomRef, TypeRegistry, CONCEPT_NODE, LIST_LINK};
use atombase::persist::{AtomStorage, StorageConfig};

fn concept(name: &str) -> AtomRef {
    Atom::node(CONCEPT_NODE, name)
}

fn cleanup(path: &str) {
    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(format!("{path}-wal"));
    let _ = std::fs::remove_file(format!("{path}-shm"));
}

#[test]
fn concurrent_stores_of_one_new_atom_insert_once() {
    let path = "test_atombase_concurrent_one.db";
    cleanup(path);

    let registry = TypeRegistry::new();
    let storage = Arc::new(
        AtomStorage::open(StorageConfig::file(path), Arc::clone(&registry)).expect("open"),
    );
    let atom = Atom::link(LIST_LINK, vec![concept("x"), concept("y")]);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let storage = Arc::clone(&storage);
        let atom = Arc::clone(&atom);
        handles.push(thread::spawn(move || storage.store_atom(&atom, true)));
    }
    for handle in handles {
        handle.join().expect("no panic").expect("no store error");
    }
    assert!(storage.atom_exists(&atom).expect("cache probe"));
    drop(storage);

    // One row per distinct atom; had two INSERTs raced, the second would
    // have tripped the primary key and surfaced above.
    let conn = rusqlite::Connection::open(path).expect("open raw");
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM Atoms", [], |row| row.get(0))
        .expect("count");
    assert_eq!(rows, 3);
    let links: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM Atoms WHERE outgoing IS NOT NULL",
            [],
            |row| row.get(0),
        )
        .expect("count");
    assert_eq!(links, 1);

    cleanup(path);
}

#[test]
fn concurrent_stores_of_distinct_atoms_all_land() {
    let path = "test_atombase_concurrent_many.db";
    cleanup(path);

    let registry = TypeRegistry::new();
    let storage = Arc::new(
        AtomStorage::open(StorageConfig::file(path), Arc::clone(&registry)).expect("open"),
    );

    let mut handles = Vec::new();
    for worker in 0..4 {
        let storage = Arc::clone(&storage);
        handles.push(thread::spawn(move || {
            for i in 0..20 {
                let atom = concept(&format!("w{worker}-c{i}"));
                storage.store_atom(&atom, true).expect("store");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("no panic");
    }
    drop(storage);

    let conn = rusqlite::Connection::open(path).expect("open raw");
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM Atoms", [], |row| row.get(0))
        .expect("count");
    assert_eq!(rows, 80);

    cleanup(path);
}

#[test]
fn queued_stores_drain_on_flush() {
    let path = "test_atombase_queue.db";
    cleanup(path);

    let registry = TypeRegistry::new();
    let storage = Arc::new(
        AtomStorage::open(StorageConfig::file(path), Arc::clone(&registry)).expect("open"),
    );

    let atoms: Vec<AtomRef> = (0..50).map(|i| concept(&format!("q{i}"))).collect();
    for atom in &atoms {
        storage.store_atom(atom, false).expect("enqueue");
    }
    storage.flush_store_queue();

    // Flush drains the queue but a writer may still be finishing its last
    // atom; poll the stored-id cache briefly rather than assuming strict
    // quiescence.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let all_in = atoms
            .iter()
            .all(|atom| storage.atom_exists(atom).expect("cache probe"));
        if all_in {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "queued atoms never became visible"
        );
        thread::sleep(Duration::from_millis(10));
    }

    cleanup(path);
}
