use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{BuildHasherDefault, Hash, Hasher};
use std::sync::{Arc, Mutex, RwLock};

use seahash::SeaHasher;

// ------------- Hashers -------------
pub type UuidHasher = BuildHasherDefault<SeaHasher>;
pub type OtherHasher = BuildHasherDefault<SeaHasher>;

// ------------- Types -------------
pub type TypeId = u16;

pub const NOTYPE: TypeId = TypeId::MAX;

pub const ATOM: TypeId = 0;
pub const NODE: TypeId = 1;
pub const LINK: TypeId = 2;
pub const CONCEPT_NODE: TypeId = 3;
pub const PREDICATE_NODE: TypeId = 4;
pub const NUMBER_NODE: TypeId = 5;
pub const TYPE_NODE: TypeId = 6;
pub const VARIABLE_NODE: TypeId = 7;
pub const GLOB_NODE: TypeId = 8;
pub const LIST_LINK: TypeId = 9;
pub const EVALUATION_LINK: TypeId = 10;
pub const INHERITANCE_LINK: TypeId = 11;
pub const AND_LINK: TypeId = 12;
pub const VARIABLE_LIST: TypeId = 13;
pub const TYPED_VARIABLE_LINK: TypeId = 14;
pub const TYPE_CHOICE: TypeId = 15;
pub const SCOPE_LINK: TypeId = 16;
pub const LAMBDA_LINK: TypeId = 17;
pub const QUOTE_LINK: TypeId = 18;
pub const UNQUOTE_LINK: TypeId = 19;

const BUILTIN_TYPES: &[(&str, TypeId)] = &[
    ("Atom", ATOM),
    ("Node", ATOM),
    ("Link", ATOM),
    ("ConceptNode", NODE),
    ("PredicateNode", NODE),
    ("NumberNode", NODE),
    ("TypeNode", NODE),
    ("VariableNode", NODE),
    ("GlobNode", NODE),
    ("ListLink", LINK),
    ("EvaluationLink", LINK),
    ("InheritanceLink", LINK),
    ("AndLink", LINK),
    ("VariableList", LINK),
    ("TypedVariableLink", LINK),
    ("TypeChoice", LINK),
    ("ScopeLink", LINK),
    ("LambdaLink", SCOPE_LINK),
    ("QuoteLink", LINK),
    ("UnquoteLink", LINK),
];

#[derive(Debug)]
struct RegistryInner {
    names: Vec<String>,
    parents: Vec<TypeId>,
    by_name: HashMap<String, TypeId, OtherHasher>,
}

/// The type taxonomy: a runtime-extensible single-inheritance hierarchy
/// rooted at [`ATOM`]. Type numbers are assigned in registration order, so
/// two processes that register extra types in different orders will disagree
/// on the numbers; the persistence layer reconciles that against the
/// numbering stored in the database.
#[derive(Debug)]
pub struct TypeRegistry {
    inner: RwLock<RegistryInner>,
}

impl TypeRegistry {
    pub fn new() -> Arc<TypeRegistry> {
        let mut inner = RegistryInner {
            names: Vec::with_capacity(BUILTIN_TYPES.len()),
            parents: Vec::with_capacity(BUILTIN_TYPES.len()),
            by_name: HashMap::default(),
        };
        for (name, parent) in BUILTIN_TYPES {
            let t = inner.names.len() as TypeId;
            inner.names.push((*name).to_owned());
            inner.parents.push(*parent);
            inner.by_name.insert((*name).to_owned(), t);
        }
        Arc::new(TypeRegistry {
            inner: RwLock::new(inner),
        })
    }

    /// Registers a new type under the given parent, or returns the existing
    /// number if the name is already known.
    pub fn register(&self, name: &str, parent: TypeId) -> TypeId {
        let mut inner = self.inner.write().unwrap();
        if let Some(t) = inner.by_name.get(name) {
            return *t;
        }
        let t = inner.names.len() as TypeId;
        inner.names.push(name.to_owned());
        inner.parents.push(parent);
        inner.by_name.insert(name.to_owned(), t);
        t
    }

    pub fn is_a(&self, t: TypeId, ancestor: TypeId) -> bool {
        let inner = self.inner.read().unwrap();
        let mut cur = t;
        loop {
            if cur == ancestor {
                return true;
            }
            match inner.parents.get(cur as usize) {
                Some(&p) if p != cur => cur = p,
                _ => return false,
            }
        }
    }

    pub fn is_node(&self, t: TypeId) -> bool {
        self.is_a(t, NODE)
    }

    pub fn is_link(&self, t: TypeId) -> bool {
        self.is_a(t, LINK)
    }

    pub fn type_name(&self, t: TypeId) -> Option<String> {
        self.inner.read().unwrap().names.get(t as usize).cloned()
    }

    pub fn type_by_name(&self, name: &str) -> Option<TypeId> {
        self.inner.read().unwrap().by_name.get(name).copied()
    }

    pub fn type_count(&self) -> usize {
        self.inner.read().unwrap().names.len()
    }
}

// ------------- TruthValue -------------
/// Strength-of-belief annotation on an atom. The discriminator values are
/// the ones the store writes into the `tv_type` column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TruthValue {
    Null,
    Simple { mean: f64, confidence: f64 },
    Count { mean: f64, confidence: f64, count: f64 },
    Indefinite { lower: f64, upper: f64, confidence: f64 },
    Probabilistic { mean: f64, confidence: f64, count: f64 },
}

impl TruthValue {
    pub fn type_id(&self) -> i64 {
        match self {
            TruthValue::Null => 0,
            TruthValue::Simple { .. } => 1,
            TruthValue::Count { .. } => 2,
            TruthValue::Indefinite { .. } => 3,
            TruthValue::Probabilistic { .. } => 4,
        }
    }

    /// Column packing for the `Atoms` row: (tv_type, stv_mean,
    /// stv_confidence, stv_count). An indefinite value stores its lower
    /// bound in the mean column and its upper bound in the count column.
    pub fn to_columns(&self) -> (i64, Option<f64>, Option<f64>, Option<f64>) {
        match *self {
            TruthValue::Null => (0, None, None, None),
            TruthValue::Simple { mean, confidence } => (1, Some(mean), Some(confidence), None),
            TruthValue::Count {
                mean,
                confidence,
                count,
            } => (2, Some(mean), Some(confidence), Some(count)),
            TruthValue::Indefinite {
                lower,
                upper,
                confidence,
            } => (3, Some(lower), Some(confidence), Some(upper)),
            TruthValue::Probabilistic {
                mean,
                confidence,
                count,
            } => (4, Some(mean), Some(confidence), Some(count)),
        }
    }

    pub fn from_columns(
        tv_type: i64,
        mean: Option<f64>,
        confidence: Option<f64>,
        count: Option<f64>,
    ) -> crate::error::Result<TruthValue> {
        let mean = mean.unwrap_or(0.0);
        let confidence = confidence.unwrap_or(0.0);
        let count = count.unwrap_or(0.0);
        match tv_type {
            0 => Ok(TruthValue::Null),
            1 => Ok(TruthValue::Simple { mean, confidence }),
            2 => Ok(TruthValue::Count {
                mean,
                confidence,
                count,
            }),
            3 => Ok(TruthValue::Indefinite {
                lower: mean,
                upper: count,
                confidence,
            }),
            4 => Ok(TruthValue::Probabilistic {
                mean,
                confidence,
                count,
            }),
            other => Err(crate::error::AtomError::Persistence(format!(
                "unknown truth value type {other}"
            ))),
        }
    }
}

// ------------- Atom -------------
pub type AtomRef = Arc<Atom>;

#[derive(Debug)]
enum AtomBody {
    Node { name: String },
    Link { out: Vec<AtomRef> },
}

/// An immutable symbolic term: a named node or a link over other atoms.
/// Atoms are content-addressed; two structurally equal atoms are the same
/// atom, so equality and hashing ignore the truth value, which the load
/// path may swap in after construction.
#[derive(Debug)]
pub struct Atom {
    ty: TypeId,
    body: AtomBody,
    tv: RwLock<TruthValue>,
}

impl Atom {
    pub fn node(ty: TypeId, name: impl Into<String>) -> AtomRef {
        Arc::new(Atom {
            ty,
            body: AtomBody::Node { name: name.into() },
            tv: RwLock::new(TruthValue::Null),
        })
    }

    pub fn node_tv(ty: TypeId, name: impl Into<String>, tv: TruthValue) -> AtomRef {
        let atom = Atom::node(ty, name);
        atom.set_truth_value(tv);
        atom
    }

    pub fn link(ty: TypeId, out: Vec<AtomRef>) -> AtomRef {
        Arc::new(Atom {
            ty,
            body: AtomBody::Link { out },
            tv: RwLock::new(TruthValue::Null),
        })
    }

    pub fn link_tv(ty: TypeId, out: Vec<AtomRef>, tv: TruthValue) -> AtomRef {
        let atom = Atom::link(ty, out);
        atom.set_truth_value(tv);
        atom
    }

    pub fn atom_type(&self) -> TypeId {
        self.ty
    }

    pub fn is_node(&self) -> bool {
        matches!(self.body, AtomBody::Node { .. })
    }

    pub fn is_link(&self) -> bool {
        matches!(self.body, AtomBody::Link { .. })
    }

    pub fn name(&self) -> Option<&str> {
        match &self.body {
            AtomBody::Node { name } => Some(name),
            AtomBody::Link { .. } => None,
        }
    }

    /// The outgoing set; empty for nodes.
    pub fn outgoing(&self) -> &[AtomRef] {
        match &self.body {
            AtomBody::Node { .. } => &[],
            AtomBody::Link { out } => out,
        }
    }

    pub fn arity(&self) -> usize {
        self.outgoing().len()
    }

    pub fn truth_value(&self) -> TruthValue {
        *self.tv.read().unwrap()
    }

    pub fn set_truth_value(&self, tv: TruthValue) {
        *self.tv.write().unwrap() = tv;
    }
}

impl PartialEq for Atom {
    fn eq(&self, other: &Self) -> bool {
        if self.ty != other.ty {
            return false;
        }
        match (&self.body, &other.body) {
            (AtomBody::Node { name: a }, AtomBody::Node { name: b }) => a == b,
            (AtomBody::Link { out: a }, AtomBody::Link { out: b }) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| Arc::ptr_eq(x, y) || x == y)
            }
            _ => false,
        }
    }
}
impl Eq for Atom {}

impl Hash for Atom {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ty.hash(state);
        match &self.body {
            AtomBody::Node { name } => {
                state.write_u8(0);
                name.hash(state);
            }
            AtomBody::Link { out } => {
                state.write_u8(1);
                for child in out {
                    child.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.body {
            AtomBody::Node { name } => write!(f, "({} \"{}\")", self.ty, name),
            AtomBody::Link { out } => {
                write!(f, "({}", self.ty)?;
                for child in out {
                    write!(f, " {}", child)?;
                }
                write!(f, ")")
            }
        }
    }
}

// ------------- AtomTable -------------
/// In-memory registry of published atoms, keyed by atom identity. Keeping
/// an atom that is already present returns the previously kept instance and
/// leaves its truth value alone.
pub struct AtomTable {
    space: u64,
    parent: Option<Arc<AtomTable>>,
    kept: Mutex<HashSet<AtomRef, OtherHasher>>,
}

impl AtomTable {
    pub fn new() -> Arc<AtomTable> {
        AtomTable::with_space(1, None)
    }

    pub fn with_space(space: u64, parent: Option<Arc<AtomTable>>) -> Arc<AtomTable> {
        Arc::new(AtomTable {
            space,
            parent,
            kept: Mutex::new(HashSet::default()),
        })
    }

    pub fn keep(&self, atom: AtomRef) -> (AtomRef, bool) {
        let mut kept = self.kept.lock().unwrap();
        if let Some(existing) = kept.get(&atom) {
            return (Arc::clone(existing), true);
        }
        kept.insert(Arc::clone(&atom));
        (atom, false)
    }

    pub fn get(&self, atom: &AtomRef) -> Option<AtomRef> {
        self.kept.lock().unwrap().get(atom).map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.kept.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A point-in-time copy of the kept set, for bulk iteration.
    pub fn snapshot(&self) -> Vec<AtomRef> {
        self.kept.lock().unwrap().iter().map(Arc::clone).collect()
    }

    pub fn space(&self) -> u64 {
        self.space
    }

    pub fn parent(&self) -> Option<Arc<AtomTable>> {
        self.parent.as_ref().map(Arc::clone)
    }
}
