//! Atombase – a hypergraph knowledge base in two tightly coupled cores.
//!
//! The *term core* is a variable-capturing substitution engine over a
//! symbolic term algebra:
//! * An [`atom::Atom`] is an immutable term, either a named node or a link
//!   over other atoms, shared through `Arc` and deduplicated by keeper
//!   structures.
//! * [`variables::find_variables`] walks a term forest and collects its
//!   free, unquoted variables in first-appearance pre-order, honoring
//!   scoped binders.
//! * [`variables::Variables`] holds an ordered variable declaration with
//!   per-variable type restrictions and performs capture-avoiding
//!   beta-reduction ([`variables::Variables::substitute`]) with
//!   alpha-hiding, quotation and glob-splicing semantics.
//!
//! The *persistence core* is a durable, concurrent atom store backed by
//! SQLite:
//! * The [`tlb::Tlb`] maps atoms to stable 64-bit identifiers that survive
//!   across runs.
//! * [`persist::AtomStorage`] persists atoms with their truth values over
//!   a pooled set of connections, reconciles process-local type numbering
//!   with the numbering stored in the database, arbitrates concurrent
//!   first-INSERTs per identifier, and reconstructs link outgoing sets
//!   recursively on load.
//! * [`queue::WriteQueue`] drains asynchronous stores on a small pool of
//!   writer threads.
//!
//! ## Modules
//! * [`atom`] – the term algebra, truth values, type taxonomy and the
//!   in-memory atom table.
//! * [`variables`] – quotation, free-variable discovery and substitution.
//! * [`tlb`] – the atom/identifier bijection.
//! * [`persist`] – the SQLite store and load engines.
//! * [`queue`] – the background write queue.
//! * [`error`] – the crate error type.
//!
//! ## Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use atombase::atom::{Atom, AtomTable, TruthValue, TypeRegistry,
//!                      CONCEPT_NODE, INHERITANCE_LINK};
//! use atombase::persist::{AtomStorage, StorageConfig};
//!
//! let registry = TypeRegistry::new();
//! let storage = AtomStorage::open(StorageConfig::file("kb.db"),
//!                                 Arc::clone(&registry)).unwrap();
//! let cat = Atom::node(CONCEPT_NODE, "cat");
//! let animal = Atom::node(CONCEPT_NODE, "animal");
//! let inh = Atom::link_tv(INHERITANCE_LINK, vec![cat, animal],
//!                         TruthValue::Simple { mean: 0.9, confidence: 0.8 });
//! storage.store_atom(&inh, true).unwrap();
//!
//! let table = AtomTable::new();
//! storage.load(&table).unwrap();
//! assert_eq!(table.len(), 3);
//! ```

pub mod atom;
pub mod error;
pub mod persist;
pub mod queue;
pub mod tlb;
pub mod variables;
