//! The identifier buffer: a process-wide bijection between atoms and their
//! stable 64-bit identifiers, with an optional resolver that redirects
//! lookups to the published atoms of a registered table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bimap::BiMap;

use crate::atom::{AtomRef, AtomTable};

pub type Uuid = u64;

/// The sentinel passed to [`Tlb::add_atom`] to request allocation.
pub const INVALID_UUID: Uuid = 0;

/// Internally synchronized; safe to share across store and load threads.
pub struct Tlb {
    map: Mutex<BiMap<AtomRef, Uuid>>,
    // Highest identifier ever issued or reserved. Allocation hands out the
    // next integer above it.
    brk: AtomicU64,
    resolver: RwLock<Option<Arc<AtomTable>>>,
}

impl Tlb {
    pub fn new() -> Tlb {
        Tlb {
            map: Mutex::new(BiMap::new()),
            brk: AtomicU64::new(INVALID_UUID),
            resolver: RwLock::new(None),
        }
    }

    /// Returns the identifier already bound to the atom, or binds one: the
    /// candidate if given, else the next free identifier.
    pub fn add_atom(&self, atom: &AtomRef, candidate: Uuid) -> Uuid {
        let mut map = self.map.lock().unwrap();
        if let Some(&uuid) = map.get_by_left(atom) {
            return uuid;
        }
        let uuid = if candidate == INVALID_UUID {
            self.brk.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.brk.fetch_max(candidate, Ordering::SeqCst);
            candidate
        };
        map.insert(Arc::clone(atom), uuid);
        uuid
    }

    /// Looks up an atom by identifier, preferring the published instance if
    /// a resolver is installed.
    pub fn get_atom(&self, uuid: Uuid) -> Option<AtomRef> {
        let atom = self.map.lock().unwrap().get_by_right(&uuid).map(Arc::clone)?;
        if let Some(table) = self.resolver.read().unwrap().as_ref() {
            if let Some(published) = table.get(&atom) {
                return Some(published);
            }
        }
        Some(atom)
    }

    pub fn get_uuid(&self, atom: &AtomRef) -> Option<Uuid> {
        self.map.lock().unwrap().get_by_left(atom).copied()
    }

    /// Ensures the allocator never issues an identifier at or below `n`.
    pub fn reserve_upto(&self, n: Uuid) {
        self.brk.fetch_max(n, Ordering::SeqCst);
    }

    pub fn max_uuid(&self) -> Uuid {
        self.brk.load(Ordering::SeqCst)
    }

    pub fn set_resolver(&self, table: &Arc<AtomTable>) {
        *self.resolver.write().unwrap() = Some(Arc::clone(table));
    }

    pub fn clear_resolver(&self) {
        *self.resolver.write().unwrap() = None;
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Tlb::new()
    }
}
