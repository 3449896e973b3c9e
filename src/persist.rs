//! Persistence layer: SQLite schema management, the durable atom store and
//! its load/restore logic.
//!
//! Atoms are saved to, and restored from, an SQL database. Each atom is
//! identified by a stable 64-bit identifier handed out by the
//! [`crate::tlb::Tlb`]; the rows in the database and the entries in the
//! buffer are kept in sync.
//!
//! # Schema Overview
//! * `Spaces(space, parent)` – atom table identities.
//! * `Atoms(uuid, space, type, tv_type, stv_mean, stv_confidence,
//!   stv_count, height, name, outgoing)` – one row per atom. Nodes carry a
//!   name, links carry their outgoing set as a JSON array of identifiers so
//!   that containment scans can use `json_each`.
//! * `TypeCodes(type, typename)` – the concordance between database type
//!   numbers and type names.
//! * `Global(max_height)` – the tallest link ever stored.
//!
//! # Type reconciliation
//! Type numbers are process-local; different processes may number the same
//! taxonomy differently. The database stores its own numbering, keyed by
//! type name, and `ensure_typemap` reconciles the two at startup: names
//! already in `TypeCodes` keep their database number, unseen local types
//! get the local number when that slot is free, else the lowest unused one.
//!
//! # Concurrency
//! All SQL goes through a bounded connection pool. The first INSERT for a
//! given identifier is arbitrated by a creation lock so that concurrent
//! stores of a brand-new atom produce exactly one INSERT; everything else
//! is an idempotent UPDATE of the truth-value columns.

use std::collections::HashSet;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use rusqlite::{params, Connection};
use tracing::{debug, error, info};

use crate::atom::{
    Atom, AtomRef, AtomTable, TruthValue, TypeId, TypeRegistry, UuidHasher, NOTYPE,
};
use crate::error::{AtomError, Result};
use crate::queue::WriteQueue;
use crate::tlb::{Tlb, Uuid, INVALID_UUID};

// ------------- Limits and defaults -------------
pub const DEFAULT_POOL_SIZE: usize = 6;
// Fewer writers than pooled connections, so a synchronous caller can always
// make progress alongside the queue.
pub const DEFAULT_WRITER_THREADS: usize = 4;
const WRITE_QUEUE_DEPTH: usize = 1000;
// Scan step for bulk reads. Chunked queries bound peak memory and allow
// progress reporting even on drivers that could return everything at once.
const LOAD_CHUNK: u64 = 12003;
const MAX_NAME_BYTES: usize = 2700;
const MAX_ARITY: usize = 330;
const TYPEMAP_SZ: usize = 256;

// ------------- Configuration -------------
/// Where the database lives and how many connections and writer threads
/// serve it. SQLite carries no credentials, so the location is the whole
/// connection string: a file path or a shared in-memory URI.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database: String,
    pub pool_size: usize,
    pub writer_threads: usize,
}

impl StorageConfig {
    pub fn file(path: impl Into<String>) -> StorageConfig {
        StorageConfig {
            database: path.into(),
            pool_size: DEFAULT_POOL_SIZE,
            writer_threads: DEFAULT_WRITER_THREADS,
        }
    }

    /// A named in-memory database shared by every connection in the pool.
    pub fn memory(tag: &str) -> StorageConfig {
        StorageConfig {
            database: format!("file:{tag}?mode=memory&cache=shared"),
            pool_size: DEFAULT_POOL_SIZE,
            writer_threads: DEFAULT_WRITER_THREADS,
        }
    }
}

// ------------- Connection pool -------------
/// A bounded bag of connections. `pop` blocks until one is available and
/// returns a guard that puts the connection back when dropped, so a failure
/// anywhere between acquisition and release cannot leak a connection.
pub struct ConnectionPool {
    slots: Mutex<Vec<Connection>>,
    available: Condvar,
}

impl ConnectionPool {
    fn new(config: &StorageConfig) -> Result<ConnectionPool> {
        let mut slots = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size.max(1) {
            slots.push(open_connection(&config.database)?);
        }
        Ok(ConnectionPool {
            slots: Mutex::new(slots),
            available: Condvar::new(),
        })
    }

    fn pop(&self) -> PooledConnection<'_> {
        let mut slots = self.slots.lock().unwrap();
        loop {
            if let Some(conn) = slots.pop() {
                return PooledConnection {
                    pool: self,
                    conn: Some(conn),
                };
            }
            slots = self.available.wait(slots).unwrap();
        }
    }

    fn give_back(&self, conn: Connection) {
        self.slots.lock().unwrap().push(conn);
        self.available.notify_one();
    }
}

pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().unwrap()
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn);
        }
    }
}

fn open_connection(database: &str) -> Result<Connection> {
    let conn = Connection::open(database)?;
    // WAL for better concurrency on file-backed databases (a no-op for
    // in-memory ones).
    let _ = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;");
    conn.busy_timeout(Duration::from_millis(5000))?;
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(conn)
}

// ------------- Type-code maps -------------
/// Fixed-capacity concordance between local type numbers and the numbers
/// stored in `TypeCodes`.
struct TypeMaps {
    loading: [TypeId; TYPEMAP_SZ],
    storing: [i32; TYPEMAP_SZ],
    db_typename: [Option<String>; TYPEMAP_SZ],
}

impl TypeMaps {
    fn new() -> TypeMaps {
        TypeMaps {
            loading: [NOTYPE; TYPEMAP_SZ],
            storing: [-1; TYPEMAP_SZ],
            db_typename: std::array::from_fn(|_| None),
        }
    }

    fn set(&mut self, dbval: usize, local: Option<TypeId>, tname: &str) {
        if let Some(t) = local {
            self.loading[dbval] = t;
            self.storing[t as usize] = dbval as i32;
        }
        self.db_typename[dbval] = Some(tname.to_owned());
    }
}

// ------------- Identifier caches -------------
struct IdCaches {
    // Identifiers the database already contains.
    known: HashSet<Uuid, UuidHasher>,
    // Identifiers this process is currently inserting for the first time.
    creating: HashSet<Uuid, UuidHasher>,
}

// ------------- Staging record -------------
/// A row read back from `Atoms` before its children are resolved: the
/// outgoing set still holds identifiers rather than atoms.
struct PseudoAtom {
    uuid: Uuid,
    ty: TypeId,
    name: String,
    out: Vec<Uuid>,
    tv: TruthValue,
}

/// Raw column values of one `Atoms` row, extracted inside the driver
/// callback and converted afterwards.
struct RawRow {
    uuid: i64,
    itype: i64,
    height: i64,
    name: Option<String>,
    outgoing: Option<String>,
    tv_type: i64,
    mean: Option<f64>,
    confidence: Option<f64>,
    count: Option<f64>,
}

const ATOM_COLUMNS: &str =
    "uuid, type, height, name, outgoing, tv_type, stv_mean, stv_confidence, stv_count";

fn raw_from_row(row: &rusqlite::Row) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        uuid: row.get(0)?,
        itype: row.get(1)?,
        height: row.get(2)?,
        name: row.get(3)?,
        outgoing: row.get(4)?,
        tv_type: row.get(5)?,
        mean: row.get(6)?,
        confidence: row.get(7)?,
        count: row.get(8)?,
    })
}

// ------------- Storage -------------
struct StorageInner {
    registry: Arc<TypeRegistry>,
    pool: ConnectionPool,
    tlb: Tlb,

    typemaps: RwLock<TypeMaps>,
    type_map_loaded: AtomicBool,
    type_setup_mutex: Mutex<()>,

    // Lock order: id_create_mutex before id_cache. No SQL under either.
    id_create_mutex: Mutex<()>,
    id_cache: Mutex<IdCaches>,
    ids_inited: AtomicBool,
    ids_setup_mutex: Mutex<()>,

    table_id_cache: Mutex<HashSet<u64, UuidHasher>>,
    registered: RwLock<Option<Arc<AtomTable>>>,

    max_height: AtomicI64,
    load_count: AtomicU64,
    store_count: AtomicU64,
}

/// The durable, concurrent atom store.
pub struct AtomStorage {
    inner: Arc<StorageInner>,
    queue: WriteQueue,
}

impl AtomStorage {
    /// Opens (and if needed creates) the database, primes the identifier
    /// allocator from the highest stored identifier, and starts the
    /// asynchronous writer threads.
    pub fn open(config: StorageConfig, registry: Arc<TypeRegistry>) -> Result<AtomStorage> {
        let pool = ConnectionPool::new(&config)?;
        create_schema(&pool.pop())?;

        let inner = Arc::new(StorageInner {
            registry,
            pool,
            tlb: Tlb::new(),
            typemaps: RwLock::new(TypeMaps::new()),
            type_map_loaded: AtomicBool::new(false),
            type_setup_mutex: Mutex::new(()),
            id_create_mutex: Mutex::new(()),
            id_cache: Mutex::new(IdCaches {
                known: HashSet::default(),
                creating: HashSet::default(),
            }),
            ids_inited: AtomicBool::new(false),
            ids_setup_mutex: Mutex::new(()),
            table_id_cache: Mutex::new(HashSet::default()),
            registered: RwLock::new(None),
            max_height: AtomicI64::new(0),
            load_count: AtomicU64::new(0),
            store_count: AtomicU64::new(0),
        });

        inner.reserve()?;

        let store = {
            let inner = Arc::clone(&inner);
            Arc::new(move |atom: AtomRef| inner.do_store_atom(&atom).map(|_| ()))
        };
        let queue = WriteQueue::new(config.writer_threads.max(1), WRITE_QUEUE_DEPTH, store);

        Ok(AtomStorage { inner, queue })
    }

    pub fn registry(&self) -> Arc<TypeRegistry> {
        Arc::clone(&self.inner.registry)
    }

    /// True if a connection can reach the database. May block while all
    /// pooled connections are in use.
    pub fn connected(&self) -> bool {
        let conn = self.inner.pool.pop();
        conn.query_row("SELECT 1", [], |_| Ok(())).is_ok()
    }

    /// Recursively store the atom and everything it points to, truth
    /// values included. Children are fully persisted before their parents.
    /// Asynchronous stores are queued for the writer threads.
    pub fn store_atom(&self, atom: &AtomRef, synchronous: bool) -> Result<()> {
        self.inner.ensure_ids()?;
        if synchronous {
            self.inner.do_store_atom(atom)?;
            return Ok(());
        }
        self.queue.enqueue(Arc::clone(atom));
        Ok(())
    }

    /// Store every atom of the table. Returns the number of atoms written.
    pub fn store(&self, table: &AtomTable) -> Result<u64> {
        self.inner.ensure_ids()?;
        self.inner.ensure_typemap()?;
        self.inner.store_count.store(0, Ordering::SeqCst);

        let snapshot = table.snapshot();
        info!(atoms = snapshot.len(), "storing atom table");
        for atom in &snapshot {
            let height = get_height(atom);
            self.inner.do_store_single_atom(atom, height)?;
            let n = self.inner.store_count.fetch_add(1, Ordering::SeqCst) + 1;
            if n % 1000 == 0 {
                debug!(stored = n, "store progress");
            }
        }
        self.inner.persist_max_height()?;
        Ok(snapshot.len() as u64)
    }

    /// Load every stored atom into the table, children before parents.
    /// Returns the number of rows loaded.
    pub fn load(&self, table: &AtomTable) -> Result<u64> {
        let inner = &self.inner;
        let max_nrec = inner.get_max_observed_uuid()?;
        inner.tlb.reserve_upto(max_nrec);
        let max_height = inner.get_max_observed_height()?;
        inner.ensure_typemap()?;
        inner.load_count.store(0, Ordering::SeqCst);
        info!(max_uuid = max_nrec, max_height, "loading all atoms");

        for hei in 0..=max_height {
            let before = inner.load_count.load(Ordering::SeqCst);
            let mut rec = 0u64;
            while rec <= max_nrec {
                let raws = inner.fetch_chunk(
                    &format!(
                        "SELECT {ATOM_COLUMNS} FROM Atoms \
                         WHERE height = ?1 AND uuid > ?2 AND uuid <= ?3"
                    ),
                    params![hei, rec as i64, (rec + LOAD_CHUNK) as i64],
                )?;
                for raw in raws {
                    let pseudo = inner.make_pseudo(raw)?;
                    let atom = inner.get_recursive_if_not_exists(&pseudo)?;
                    table.keep(atom);
                    inner.bump_load_count();
                }
                rec += LOAD_CHUNK;
            }
            debug!(
                height = hei,
                loaded = inner.load_count.load(Ordering::SeqCst) - before,
                "loaded atoms at height"
            );
        }
        let total = inner.load_count.load(Ordering::SeqCst);
        info!(total, "finished loading atoms");
        Ok(total)
    }

    /// Load every stored atom of one type, skipping atoms already known to
    /// the identifier buffer so an existing truth value is not clobbered.
    pub fn load_type(&self, table: &AtomTable, ty: TypeId) -> Result<u64> {
        let inner = &self.inner;
        inner.ensure_typemap()?;
        let db_atom_type = inner.db_type(ty)?;

        let max_nrec = inner.get_max_observed_uuid()?;
        inner.tlb.reserve_upto(max_nrec);
        // Nodes all live at height zero.
        let max_height = if inner.registry.is_node(ty) {
            0
        } else {
            inner.get_max_observed_height()?
        };
        inner.load_count.store(0, Ordering::SeqCst);
        debug!(max_uuid = max_nrec, max_height, ty, "loading atoms by type");

        for hei in 0..=max_height {
            let mut rec = 0u64;
            while rec <= max_nrec {
                let raws = inner.fetch_chunk(
                    &format!(
                        "SELECT {ATOM_COLUMNS} FROM Atoms \
                         WHERE type = ?1 AND height = ?2 AND uuid > ?3 AND uuid <= ?4"
                    ),
                    params![db_atom_type, hei, rec as i64, (rec + LOAD_CHUNK) as i64],
                )?;
                for raw in raws {
                    if inner.tlb.get_atom(raw.uuid as Uuid).is_some() {
                        continue;
                    }
                    let pseudo = inner.make_pseudo(raw)?;
                    let atom = inner.get_recursive_if_not_exists(&pseudo)?;
                    if table.get(&atom).is_none() {
                        table.keep(atom);
                        inner.bump_load_count();
                    }
                }
                rec += LOAD_CHUNK;
            }
        }
        let total = inner.load_count.load(Ordering::SeqCst);
        debug!(total, ty, "finished loading atoms by type");
        Ok(total)
    }

    /// Fetch the node with the given type and name, mainly for the sake of
    /// its stored truth value. The atom is not registered with any table.
    pub fn get_node(&self, ty: TypeId, name: &str) -> Result<Option<AtomRef>> {
        let inner = &self.inner;
        inner.ensure_typemap()?;
        let db_type = inner.db_type(ty)?;
        let pseudo = inner.fetch_one(
            &format!("SELECT {ATOM_COLUMNS} FROM Atoms WHERE type = ?1 AND name = ?2"),
            params![db_type, name],
        )?;
        match pseudo {
            None => Ok(None),
            Some(p) => {
                let node = Atom::node_tv(ty, name, p.tv);
                inner.tlb.add_atom(&node, p.uuid);
                Ok(Some(node))
            }
        }
    }

    /// Fetch the stored row matching the given link and attach its truth
    /// value. The atom is not registered with any table.
    pub fn get_link(&self, link: &AtomRef) -> Result<Option<AtomRef>> {
        let inner = &self.inner;
        inner.ensure_typemap()?;
        let db_type = inner.db_type(link.atom_type())?;
        let outgoing = inner.oset_to_json(link.outgoing());
        let pseudo = inner.fetch_one(
            &format!("SELECT {ATOM_COLUMNS} FROM Atoms WHERE type = ?1 AND outgoing = ?2"),
            params![db_type, outgoing],
        )?;
        match pseudo {
            None => Ok(None),
            Some(p) => {
                link.set_truth_value(p.tv);
                inner.tlb.add_atom(link, p.uuid);
                Ok(Some(Arc::clone(link)))
            }
        }
    }

    /// Every stored link whose outgoing set mentions the atom.
    pub fn get_incoming_set(&self, atom: &AtomRef) -> Result<Vec<AtomRef>> {
        let inner = &self.inner;
        inner.ensure_typemap()?;
        let uuid = inner.tlb.add_atom(atom, INVALID_UUID);

        let raws = inner.fetch_chunk(
            &format!(
                "SELECT {ATOM_COLUMNS} FROM Atoms WHERE outgoing IS NOT NULL \
                 AND EXISTS (SELECT 1 FROM json_each(Atoms.outgoing) \
                             WHERE json_each.value = ?1)"
            ),
            params![uuid as i64],
        )?;
        let mut incoming = Vec::with_capacity(raws.len());
        for raw in raws {
            let pseudo = inner.make_pseudo(raw)?;
            incoming.push(inner.get_recursive_if_not_exists(&pseudo)?);
        }
        Ok(incoming)
    }

    /// True if the atom is already persisted, judged by the local cache of
    /// stored identifiers.
    pub fn atom_exists(&self, atom: &AtomRef) -> Result<bool> {
        self.inner.ensure_ids()?;
        let uuid = self.inner.tlb.add_atom(atom, INVALID_UUID);
        Ok(self.inner.id_cache.lock().unwrap().known.contains(&uuid))
    }

    /// Waits until the write queue has drained. A writer may still be
    /// finishing its current atom when this returns.
    pub fn flush_store_queue(&self) {
        self.queue.flush_queue();
    }

    /// Destroys all stored data and reseeds the initial rows. Meant for
    /// test rigs; this is total data loss.
    pub fn kill_data(&self) -> Result<()> {
        let conn = self.inner.pool.pop();
        conn.execute_batch(
            "DELETE FROM Atoms; \
             DELETE FROM Spaces; \
             INSERT INTO Spaces (space, parent) VALUES (0, 0); \
             INSERT INTO Spaces (space, parent) VALUES (1, 1); \
             UPDATE Global SET max_height = 0;",
        )?;
        Ok(())
    }

    /// Installs the table as the resolver for identifier lookups and the
    /// source of the space column for newly inserted atoms.
    pub fn register_with(&self, table: &Arc<AtomTable>) {
        self.inner.tlb.set_resolver(table);
        *self.inner.registered.write().unwrap() = Some(Arc::clone(table));
    }

    pub fn unregister_with(&self, table: &Arc<AtomTable>) {
        let mut registered = self.inner.registered.write().unwrap();
        if registered
            .as_ref()
            .map_or(false, |t| Arc::ptr_eq(t, table))
        {
            *registered = None;
            self.inner.tlb.clear_resolver();
        }
    }

    /// The database type number for a local type, if reconciled.
    pub fn db_type_for(&self, ty: TypeId) -> Result<Option<i32>> {
        self.inner.ensure_typemap()?;
        let maps = self.inner.typemaps.read().unwrap();
        match maps.storing.get(ty as usize) {
            Some(&db) if db >= 0 => Ok(Some(db)),
            _ => Ok(None),
        }
    }

    /// The local type for a database type number, if this process has it.
    pub fn local_type_for(&self, db: i32) -> Result<Option<TypeId>> {
        self.inner.ensure_typemap()?;
        if !(0..TYPEMAP_SZ as i32).contains(&db) {
            return Ok(None);
        }
        let maps = self.inner.typemaps.read().unwrap();
        match maps.loading[db as usize] {
            NOTYPE => Ok(None),
            t => Ok(Some(t)),
        }
    }

    pub fn max_uuid(&self) -> Uuid {
        self.inner.tlb.max_uuid()
    }

    /// The `Global.max_height` bookkeeping row.
    pub fn global_max_height(&self) -> Result<i64> {
        let conn = self.inner.pool.pop();
        Ok(conn.query_row("SELECT max_height FROM Global", [], |row| row.get(0))?)
    }
}

impl Drop for AtomStorage {
    fn drop(&mut self) {
        self.queue.shutdown();
        let _ = self.inner.persist_max_height();
    }
}

impl StorageInner {
    // ---------- identifier caches ----------

    /// Build the client-side cache of stored identifiers, once, with
    /// chunked scans. The scan runs outside the cache mutex and merges at
    /// the end.
    fn ensure_ids(&self) -> Result<()> {
        if self.ids_inited.load(Ordering::Acquire) {
            return Ok(());
        }
        let _setup = self.ids_setup_mutex.lock().unwrap();
        if self.ids_inited.load(Ordering::Acquire) {
            return Ok(());
        }

        let max_nrec = self.get_max_observed_uuid()?;
        let mut known: HashSet<Uuid, UuidHasher> = HashSet::default();
        {
            let conn = self.pool.pop();
            let mut rec = 0u64;
            while rec <= max_nrec {
                let mut stmt =
                    conn.prepare("SELECT uuid FROM Atoms WHERE uuid > ?1 AND uuid <= ?2")?;
                let rows = stmt.query_map(
                    params![rec as i64, (rec + LOAD_CHUNK) as i64],
                    |row| row.get::<_, i64>(0),
                )?;
                for uuid in rows {
                    known.insert(uuid? as Uuid);
                }
                rec += LOAD_CHUNK;
            }
        }

        self.id_cache.lock().unwrap().known.extend(known);
        self.ids_inited.store(true, Ordering::Release);
        Ok(())
    }

    /// Decide whether this thread performs the first INSERT for the
    /// identifier. `Some(guard)` makes the caller the creator: it must
    /// INSERT and then call `add_id_to_cache` before the guard drops.
    /// `None` means the row exists (or is being created elsewhere) and an
    /// UPDATE suffices. Waiters stall on the creation lock until the
    /// creator finishes.
    fn maybe_create_id(&self, uuid: Uuid) -> Option<MutexGuard<'_, ()>> {
        loop {
            let create_guard = self.id_create_mutex.lock().unwrap();
            {
                let mut cache = self.id_cache.lock().unwrap();
                if cache.known.contains(&uuid) {
                    return None;
                }
                if !cache.creating.contains(&uuid) {
                    cache.creating.insert(uuid);
                    return Some(create_guard);
                }
            }
            // Some other thread owns the first INSERT for this id. Dropping
            // the guard and re-locking blocks until a creator finishes,
            // then the cache is examined again.
            drop(create_guard);
        }
    }

    /// Mark the identifier as stored. Also releases any waiter stalled in
    /// `maybe_create_id` once the caller drops its creation guard.
    fn add_id_to_cache(&self, uuid: Uuid) {
        let mut cache = self.id_cache.lock().unwrap();
        cache.known.insert(uuid);
        cache.creating.remove(&uuid);
    }

    /// A creator whose INSERT failed steps down so a waiter can retry.
    fn cancel_create(&self, uuid: Uuid) {
        self.id_cache.lock().unwrap().creating.remove(&uuid);
    }

    // ---------- type-code reconciliation ----------

    fn ensure_typemap(&self) -> Result<()> {
        if self.type_map_loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let _setup = self.type_setup_mutex.lock().unwrap();
        if self.type_map_loaded.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut maps = TypeMaps::new();
        {
            let conn = self.pool.pop();
            let mut stmt = conn.prepare("SELECT type, typename FROM TypeCodes")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (dbval, tname) = row?;
                if !(0..TYPEMAP_SZ as i64).contains(&dbval) {
                    return Err(AtomError::Persistence(format!(
                        "type code {dbval} outside the representable range"
                    )));
                }
                maps.set(dbval as usize, self.registry.type_by_name(&tname), &tname);
            }

            for t in 0..self.registry.type_count() {
                if t >= TYPEMAP_SZ {
                    error!("type code table overflow");
                    std::process::abort();
                }
                if maps.storing[t] != -1 {
                    continue;
                }
                let Some(tname) = self.registry.type_name(t as TypeId) else {
                    continue;
                };

                // Prefer the local number; if the database already gave it
                // to some other name, take the lowest unused slot.
                let mut sqid = t;
                if maps.db_typename[sqid].is_some() {
                    match (0..TYPEMAP_SZ).find(|i| maps.db_typename[*i].is_none()) {
                        Some(free) => sqid = free,
                        None => {
                            error!("type code table overflow");
                            std::process::abort();
                        }
                    }
                }
                conn.execute(
                    "INSERT INTO TypeCodes (type, typename) VALUES (?1, ?2)",
                    params![sqid as i64, &tname],
                )?;
                maps.set(sqid, Some(t as TypeId), &tname);
            }
        }

        *self.typemaps.write().unwrap() = maps;
        self.type_map_loaded.store(true, Ordering::Release);
        Ok(())
    }

    fn db_type(&self, ty: TypeId) -> Result<i32> {
        let maps = self.typemaps.read().unwrap();
        match maps.storing.get(ty as usize) {
            Some(&db) if db >= 0 => Ok(db),
            _ => Err(AtomError::UnknownType(format!("local type {ty}"))),
        }
    }

    // ---------- store engine ----------

    /// Recursively store the atom, children first, and return its height.
    fn do_store_atom(&self, atom: &AtomRef) -> Result<i64> {
        if !atom.is_link() {
            self.do_store_single_atom(atom, 0)?;
            return Ok(0);
        }

        let mut lheight = 0;
        for child in atom.outgoing() {
            let height = self.do_store_atom(child)?;
            if height > lheight {
                lheight = height;
            }
        }

        // The height of a link is one more than its tallest child.
        lheight += 1;
        self.do_store_single_atom(atom, lheight)?;
        Ok(lheight)
    }

    fn do_store_single_atom(&self, atom: &AtomRef, height: i64) -> Result<()> {
        self.ensure_typemap()?;

        let uuid = self.tlb.add_atom(atom, INVALID_UUID);
        let create_guard = self.maybe_create_id(uuid);
        let update = create_guard.is_none();

        let (tv_type, mean, confidence, count) = atom.truth_value().to_columns();

        let result = if update {
            // Type, name and outgoing set are immutable once inserted; only
            // the truth value columns ever change.
            let conn = self.pool.pop();
            conn.execute(
                "UPDATE Atoms SET tv_type = ?1, stv_mean = ?2, \
                 stv_confidence = ?3, stv_count = ?4 WHERE uuid = ?5",
                params![tv_type, mean, confidence, count, uuid as i64],
            )
            .map(|_| ())
            .map_err(AtomError::from)
        } else {
            self.insert_new_atom(atom, uuid, height, tv_type, mean, confidence, count)
        };

        match result {
            Ok(()) => {
                self.add_id_to_cache(uuid);
                Ok(())
            }
            Err(e) => {
                if !update {
                    self.cancel_create(uuid);
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_new_atom(
        &self,
        atom: &AtomRef,
        uuid: Uuid,
        height: i64,
        tv_type: i64,
        mean: Option<f64>,
        confidence: Option<f64>,
        count: Option<f64>,
    ) -> Result<()> {
        let space = self.current_space();
        let db_type = self.db_type(atom.atom_type())?;

        let (name, outgoing, height) = if atom.is_node() {
            let name = atom.name().unwrap_or_default();
            // The UNIQUE(type, name) index cannot take arbitrarily long
            // entries.
            if name.len() > MAX_NAME_BYTES {
                return Err(AtomError::NameTooLong(name.len()));
            }
            (Some(name.to_owned()), None, 0i64)
        } else {
            if atom.arity() > MAX_ARITY {
                return Err(AtomError::LinkTooWide(atom.arity()));
            }
            self.max_height.fetch_max(height, Ordering::SeqCst);
            (None, Some(self.oset_to_json(atom.outgoing())), height)
        };

        let sql = "INSERT INTO Atoms (uuid, space, type, height, name, outgoing, \
                   tv_type, stv_mean, stv_confidence, stv_count) \
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)";
        let insert = |conn: &Connection| {
            conn.execute(
                sql,
                params![
                    uuid as i64,
                    space as i64,
                    db_type,
                    height,
                    name,
                    outgoing,
                    tv_type,
                    mean,
                    confidence,
                    count
                ],
            )
        };

        let first_try = {
            let conn = self.pool.pop();
            insert(&conn)
        };
        match first_try {
            Ok(_) => Ok(()),
            Err(e) if is_foreign_key_violation(&e) => {
                // The space row is registered lazily, only after an insert
                // actually trips over its absence. Retried once.
                self.store_space_id(space)?;
                let conn = self.pool.pop();
                insert(&conn)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn current_space(&self) -> u64 {
        self.registered
            .read()
            .unwrap()
            .as_ref()
            .map(|table| table.space())
            .unwrap_or(0)
    }

    /// Make sure the `Spaces` row for the table exists, parents first.
    fn store_space_id(&self, space: u64) -> Result<()> {
        if self.table_id_cache.lock().unwrap().contains(&space) {
            return Ok(());
        }

        let mut parent = 1u64;
        if let Some(table) = self.registered.read().unwrap().as_ref() {
            if table.space() == space {
                if let Some(env) = table.parent() {
                    parent = env.space();
                }
            }
        }
        if parent != space {
            self.store_space_id(parent)?;
        }

        let conn = self.pool.pop();
        conn.execute(
            "INSERT OR IGNORE INTO Spaces (space, parent) VALUES (?1, ?2)",
            params![space as i64, parent as i64],
        )?;
        drop(conn);

        self.table_id_cache.lock().unwrap().insert(space);
        Ok(())
    }

    fn oset_to_json(&self, out: &[AtomRef]) -> String {
        let mut text = String::from("[");
        for (i, child) in out.iter().enumerate() {
            if i != 0 {
                text.push(',');
            }
            let uuid = self.tlb.add_atom(child, INVALID_UUID);
            text.push_str(&uuid.to_string());
        }
        text.push(']');
        text
    }

    // ---------- load engine ----------

    fn fetch_chunk(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<RawRow>> {
        let conn = self.pool.pop();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, raw_from_row)?;
        let mut raws = Vec::new();
        for raw in rows {
            raws.push(raw?);
        }
        Ok(raws)
    }

    fn fetch_one(&self, sql: &str, args: impl rusqlite::Params) -> Result<Option<PseudoAtom>> {
        let mut raws = self.fetch_chunk(sql, args)?;
        match raws.pop() {
            None => Ok(None),
            Some(raw) => Ok(Some(self.make_pseudo(raw)?)),
        }
    }

    /// Convert a raw row into the staging record, reconciling the stored
    /// type number with the local taxonomy.
    fn make_pseudo(&self, raw: RawRow) -> Result<PseudoAtom> {
        let maps = self.typemaps.read().unwrap();
        let itype = raw.itype as usize;
        if itype >= TYPEMAP_SZ {
            return Err(AtomError::UnknownType(format!("db type {}", raw.itype)));
        }
        let ty = maps.loading[itype];
        if ty == NOTYPE {
            return Err(AtomError::UnknownType(
                maps.db_typename[itype]
                    .clone()
                    .unwrap_or_else(|| format!("db type {}", raw.itype)),
            ));
        }
        drop(maps);

        let tv = TruthValue::from_columns(raw.tv_type, raw.mean, raw.confidence, raw.count)?;

        // Height zero rows are nodes; every link stands at least one high.
        let (name, out) = if raw.height == 0 {
            (raw.name.unwrap_or_default(), Vec::new())
        } else {
            (String::new(), parse_outgoing(raw.outgoing.as_deref())?)
        };

        let uuid = raw.uuid as Uuid;
        self.add_id_to_cache(uuid);
        Ok(PseudoAtom {
            uuid,
            ty,
            name,
            out,
            tv,
        })
    }

    /// Resolve a staging record into a published atom, fetching and
    /// materializing any outgoing child the identifier buffer does not
    /// hold yet.
    fn get_recursive_if_not_exists(&self, pseudo: &PseudoAtom) -> Result<AtomRef> {
        if self.registry.is_node(pseudo.ty) {
            let node = Atom::node_tv(pseudo.ty, pseudo.name.clone(), pseudo.tv);
            self.tlb.add_atom(&node, pseudo.uuid);
            return Ok(node);
        }

        let mut resolved = Vec::with_capacity(pseudo.out.len());
        for idu in &pseudo.out {
            if let Some(child) = self.tlb.get_atom(*idu) {
                resolved.push(child);
                continue;
            }
            let po = self.pet_atom(*idu)?;
            resolved.push(self.get_recursive_if_not_exists(&po)?);
        }

        let link = Atom::link_tv(pseudo.ty, resolved, pseudo.tv);
        self.tlb.add_atom(&link, pseudo.uuid);
        Ok(link)
    }

    /// Fetch one atom's row by identifier.
    fn pet_atom(&self, uuid: Uuid) -> Result<PseudoAtom> {
        self.ensure_typemap()?;
        self.fetch_one(
            &format!("SELECT {ATOM_COLUMNS} FROM Atoms WHERE uuid = ?1"),
            params![uuid as i64],
        )?
        .ok_or_else(|| AtomError::Persistence(format!("no stored atom with uuid {uuid}")))
    }

    fn bump_load_count(&self) {
        let n = self.load_count.fetch_add(1, Ordering::SeqCst) + 1;
        if n % 10000 == 0 {
            debug!(loaded = n, "load progress");
        }
    }

    // ---------- bookkeeping ----------

    fn get_max_observed_uuid(&self) -> Result<Uuid> {
        let conn = self.pool.pop();
        let max: Option<i64> =
            conn.query_row("SELECT MAX(uuid) FROM Atoms", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0) as Uuid)
    }

    fn get_max_observed_height(&self) -> Result<i64> {
        let conn = self.pool.pop();
        let max: Option<i64> =
            conn.query_row("SELECT MAX(height) FROM Atoms", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0))
    }

    /// Prime the identifier allocator so freshly stored atoms never collide
    /// with identifiers already on disk.
    fn reserve(&self) -> Result<()> {
        let max_observed = self.get_max_observed_uuid()?;
        debug!(max_observed, "reserving identifiers");
        self.tlb.reserve_upto(max_observed);
        Ok(())
    }

    /// The height watermark can only grow.
    fn persist_max_height(&self) -> Result<()> {
        let observed = self.get_max_observed_height()?;
        let local = self.max_height.fetch_max(observed, Ordering::SeqCst).max(observed);
        let conn = self.pool.pop();
        conn.execute(
            "UPDATE Global SET max_height = ?1 WHERE max_height < ?1",
            params![local],
        )?;
        Ok(())
    }
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        create table if not exists Spaces (
            space integer not null,
            parent integer not null,
            constraint referenceable_space primary key (
                space
            )
        ) STRICT;
        create table if not exists Atoms (
            uuid integer not null,
            space integer not null,
            type integer not null,
            tv_type integer not null default 0,
            stv_mean real null,
            stv_confidence real null,
            stv_count real null,
            height integer not null,
            name text null,
            outgoing text null,
            constraint atom_in_space foreign key (
                space
            ) references Spaces(space),
            constraint referenceable_uuid primary key (
                uuid
            ),
            constraint unique_node unique (
                type, name
            ),
            constraint unique_link unique (
                type, outgoing
            )
        ) STRICT;
        create table if not exists TypeCodes (
            type integer not null unique,
            typename text not null unique
        ) STRICT;
        create table if not exists Global (
            max_height integer not null
        ) STRICT;
        insert or ignore into Spaces (space, parent) values (0, 0);
        insert or ignore into Spaces (space, parent) values (1, 1);
        insert into Global (max_height)
            select 0 where not exists (select 1 from Global);
        ",
    )?;
    Ok(())
}

/// Largest distance from the atom down to any node under it. Nodes stand at
/// zero by definition.
pub fn get_height(atom: &AtomRef) -> i64 {
    if !atom.is_link() {
        return 0;
    }
    let mut maxd = 0;
    for child in atom.outgoing() {
        let d = get_height(child);
        if d > maxd {
            maxd = d;
        }
    }
    maxd + 1
}

fn parse_outgoing(text: Option<&str>) -> Result<Vec<Uuid>> {
    let Some(text) = text else {
        return Ok(Vec::new());
    };
    let trimmed = text.trim().trim_start_matches('[').trim_end_matches(']');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for part in trimmed.split(',') {
        let uuid = part.trim().parse::<Uuid>().map_err(|_| {
            AtomError::Persistence(format!("malformed outgoing set: {text}"))
        })?;
        out.push(uuid);
    }
    Ok(out)
}

fn is_foreign_key_violation(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(err, message) => {
            err.code == rusqlite::ErrorCode::ConstraintViolation
                && (err.extended_code == 787
                    || message
                        .as_deref()
                        .map_or(false, |m| m.contains("FOREIGN KEY")))
        }
        _ => false,
    }
}
