//! The term core: free-variable discovery and capture-avoiding
//! beta-reduction over the atom algebra.
//!
//! Substitution is almost purely syntactic, with two semantic exceptions:
//! the quotation links suspend and resume variable matching, and scoped
//! binders alpha-hide any outer free variable they rebind. No evaluation is
//! performed and no atom table is consulted; the engine builds fresh links
//! that structurally share unchanged subterms.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::atom::{
    Atom, AtomRef, OtherHasher, TypeId, TypeRegistry, GLOB_NODE, QUOTE_LINK, SCOPE_LINK,
    TYPED_VARIABLE_LINK, TYPE_CHOICE, TYPE_NODE, UNQUOTE_LINK, VARIABLE_LIST, VARIABLE_NODE,
};
use crate::error::{AtomError, Result};

pub type IndexMap = HashMap<AtomRef, usize, OtherHasher>;

// ------------- Quotation -------------
/// Quote/unquote nesting depth, threaded through the recursion by value and
/// never stored in atoms. Variable matching is gated on `is_unquoted`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quotation {
    level: i32,
}

impl Quotation {
    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn is_unquoted(&self) -> bool {
        self.level == 0
    }

    pub fn is_quoted(&self) -> bool {
        self.level != 0
    }

    /// The quotation state after descending into a link of the given type.
    pub fn update(self, t: TypeId) -> Quotation {
        let level = match t {
            QUOTE_LINK => self.level + 1,
            UNQUOTE_LINK => self.level - 1,
            _ => self.level,
        };
        Quotation { level }
    }
}

// ------------- Variables -------------
/// An ordered variable declaration with optional per-variable type
/// restrictions. Insertion order is semantic: it is the parameter order
/// that substitution arguments are matched against.
#[derive(Debug, Default, Clone)]
pub struct Variables {
    varseq: Vec<AtomRef>,
    varset: HashSet<AtomRef, OtherHasher>,
    index: IndexMap,
    simple_typemap: HashMap<AtomRef, HashSet<TypeId, OtherHasher>, OtherHasher>,
    deep_typemap: HashMap<AtomRef, HashSet<AtomRef, OtherHasher>, OtherHasher>,
    // Reserved. Any operation that touches an entry here fails.
    fuzzy_typemap: HashMap<AtomRef, HashSet<AtomRef, OtherHasher>, OtherHasher>,
}

impl Variables {
    pub fn varseq(&self) -> &[AtomRef] {
        &self.varseq
    }

    pub fn len(&self) -> usize {
        self.varseq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.varseq.is_empty()
    }

    pub fn contains(&self, var: &AtomRef) -> bool {
        self.varset.contains(var)
    }

    pub fn index_of(&self, var: &AtomRef) -> Option<usize> {
        self.index.get(var).copied()
    }

    fn push_var(&mut self, var: AtomRef) {
        if self.index.contains_key(&var) {
            return;
        }
        self.index.insert(Arc::clone(&var), self.varseq.len());
        self.varset.insert(Arc::clone(&var));
        self.varseq.push(var);
    }

    pub fn restrict_simple(&mut self, var: &AtomRef, types: impl IntoIterator<Item = TypeId>) {
        self.simple_typemap
            .insert(Arc::clone(var), types.into_iter().collect());
    }

    pub fn restrict_deep(&mut self, var: &AtomRef, sigs: impl IntoIterator<Item = AtomRef>) {
        self.deep_typemap
            .insert(Arc::clone(var), sigs.into_iter().collect());
    }

    /// Reserved restriction kind; installing one makes every type check on
    /// the variable fail with `FuzzyTypeUnimplemented`.
    pub fn restrict_fuzzy(&mut self, var: &AtomRef, sigs: impl IntoIterator<Item = AtomRef>) {
        self.fuzzy_typemap
            .insert(Arc::clone(var), sigs.into_iter().collect());
    }

    /// Parses a variable declaration atom: a bare variable or glob, a
    /// `TypedVariableLink`, or a `VariableList` of those.
    pub fn from_vardecl(registry: &TypeRegistry, decl: &AtomRef) -> Result<Variables> {
        let mut vars = Variables::default();
        vars.parse_decl(registry, decl)?;
        Ok(vars)
    }

    fn parse_decl(&mut self, registry: &TypeRegistry, decl: &AtomRef) -> Result<()> {
        match decl.atom_type() {
            VARIABLE_NODE | GLOB_NODE => {
                self.push_var(Arc::clone(decl));
                Ok(())
            }
            VARIABLE_LIST => {
                for child in decl.outgoing() {
                    self.parse_decl(registry, child)?;
                }
                Ok(())
            }
            TYPED_VARIABLE_LINK => self.parse_typed_decl(registry, decl),
            other => Err(AtomError::Invariant(format!(
                "atom of type {other} is not a variable declaration"
            ))),
        }
    }

    fn parse_typed_decl(&mut self, registry: &TypeRegistry, decl: &AtomRef) -> Result<()> {
        let out = decl.outgoing();
        if out.len() != 2 {
            return Err(AtomError::Invariant(
                "TypedVariableLink expects a variable and a type specification".into(),
            ));
        }
        let var = &out[0];
        match var.atom_type() {
            VARIABLE_NODE | GLOB_NODE => (),
            other => {
                return Err(AtomError::Invariant(format!(
                    "atom of type {other} cannot carry a type restriction"
                )))
            }
        }
        self.push_var(Arc::clone(var));
        let spec = &out[1];
        match spec.atom_type() {
            TYPE_NODE => {
                let t = named_type(registry, spec)?;
                self.restrict_simple(var, [t]);
            }
            TYPE_CHOICE => {
                let mut simple = Vec::new();
                let mut deep = Vec::new();
                for alt in spec.outgoing() {
                    if alt.atom_type() == TYPE_NODE {
                        simple.push(named_type(registry, alt)?);
                    } else {
                        deep.push(Arc::clone(alt));
                    }
                }
                if !simple.is_empty() {
                    self.restrict_simple(var, simple);
                }
                if !deep.is_empty() {
                    self.restrict_deep(var, deep);
                }
            }
            // Anything else is a structural signature.
            _ => self.restrict_deep(var, [Arc::clone(spec)]),
        }
        Ok(())
    }

    /// Equality up to alpha-conversion: same arity, positionwise the same
    /// variable kind (variable vs glob) and the same type restrictions,
    /// regardless of variable names.
    pub fn is_equal(&self, other: &Variables) -> bool {
        let sz = self.varseq.len();
        if other.varseq.len() != sz {
            return false;
        }
        for i in 0..sz {
            let vme = &self.varseq[i];
            let voth = &other.varseq[i];

            if vme.atom_type() != voth.atom_type() {
                return false;
            }

            let sime = self.simple_typemap.get(vme);
            let soth = other.simple_typemap.get(voth);
            match (sime, soth) {
                (None, None) => (),
                (Some(a), Some(b)) if a == b => (),
                _ => return false,
            }

            let dime = self.deep_typemap.get(vme);
            let doth = other.deep_typemap.get(voth);
            match (dime, doth) {
                (None, None) => (),
                (Some(a), Some(b)) if a == b => (),
                _ => return false,
            }
        }
        true
    }

    /// True if `othervar` is bound in `other` at some position `p` and this
    /// set binds `var` at the same position.
    pub fn is_alpha_convertible(
        &self,
        var: &AtomRef,
        othervar: &AtomRef,
        other: &Variables,
    ) -> bool {
        match other.index.get(othervar) {
            Some(&p) => self.varseq.get(p).map_or(false, |v| v == var),
            None => false,
        }
    }

    /// Positionwise pointer equality of the variable atoms themselves.
    pub fn is_identical(&self, other: &Variables) -> bool {
        if self.varseq.len() != other.varseq.len() {
            return false;
        }
        self.varseq
            .iter()
            .zip(other.varseq.iter())
            .all(|(a, b)| Arc::ptr_eq(a, b))
    }

    /// Does `val` satisfy the restrictions on `var`? A variable with no
    /// restrictions accepts anything; an unknown variable accepts nothing.
    pub fn is_type(&self, registry: &TypeRegistry, var: &AtomRef, val: &AtomRef) -> Result<bool> {
        let mut ret = true;

        if let Some(tchoice) = self.simple_typemap.get(var) {
            if tchoice.contains(&val.atom_type()) {
                return Ok(true);
            }
            ret = false;
        }

        if let Some(sigset) = self.deep_typemap.get(var) {
            if sigset.iter().any(|sig| value_is_type(registry, sig, val)) {
                return Ok(true);
            }
            ret = false;
        }

        if self.fuzzy_typemap.contains_key(var) {
            return Err(AtomError::FuzzyTypeUnimplemented);
        }

        if !self.varset.contains(var) {
            return Ok(false);
        }

        Ok(ret)
    }

    /// Positionwise type check of a full argument sequence.
    pub fn is_type_seq(&self, registry: &TypeRegistry, vals: &[AtomRef]) -> Result<bool> {
        if vals.len() != self.varseq.len() {
            return Ok(false);
        }
        for (var, val) in self.varseq.iter().zip(vals.iter()) {
            if !self.is_type(registry, var, val)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Merge another variable set into this one. A variable known on both
    /// sides keeps the intersection of the simple type restrictions; an
    /// unrestricted side is treated as allowing everything.
    pub fn extend(&mut self, other: &Variables) {
        for h in &other.varseq {
            if self.index.contains_key(h) {
                if let Some(tms) = other.simple_typemap.get(h) {
                    let merged = match self.simple_typemap.get(h) {
                        Some(mine) => mine.intersection(tms).copied().collect(),
                        None => tms.clone(),
                    };
                    self.simple_typemap.insert(Arc::clone(h), merged);
                }
            } else {
                self.push_var(Arc::clone(h));
                if let Some(tms) = other.simple_typemap.get(h) {
                    self.simple_typemap.insert(Arc::clone(h), tms.clone());
                }
            }
        }
    }

    /// Positional value list for the variables, taking the variable itself
    /// where the map has no entry.
    pub fn make_values(&self, varmap: &HashMap<AtomRef, AtomRef, OtherHasher>) -> Vec<AtomRef> {
        self.varseq
            .iter()
            .map(|var| varmap.get(var).unwrap_or(var))
            .map(Arc::clone)
            .collect()
    }

    /// Reconstruct a declaration atom: `None` for an empty set, a bare
    /// declaration for a single variable, a `VariableList` otherwise.
    /// Fuzzy restrictions cannot be declared.
    pub fn get_vardecl(&self, registry: &TypeRegistry) -> Result<Option<AtomRef>> {
        let mut vars: Vec<AtomRef> = Vec::with_capacity(self.varseq.len());
        for var in &self.varseq {
            if self.fuzzy_typemap.contains_key(var) {
                return Err(AtomError::FuzzyTypeUnimplemented);
            }

            if let Some(types) = self.simple_typemap.get(var) {
                let mut sorted: Vec<TypeId> = types.iter().copied().collect();
                sorted.sort_unstable();
                let mut type_nodes: Vec<AtomRef> = sorted
                    .into_iter()
                    .map(|t| {
                        registry
                            .type_name(t)
                            .map(|name| Atom::node(TYPE_NODE, name))
                            .ok_or_else(|| AtomError::UnknownType(format!("type {t}")))
                    })
                    .collect::<Result<_>>()?;
                let types_h = if type_nodes.len() == 1 {
                    type_nodes.pop().unwrap()
                } else {
                    Atom::link(TYPE_CHOICE, type_nodes)
                };
                vars.push(Atom::link(
                    TYPED_VARIABLE_LINK,
                    vec![Arc::clone(var), types_h],
                ));
                continue;
            }

            if let Some(sigs) = self.deep_typemap.get(var) {
                let mut sorted: Vec<AtomRef> = sigs.iter().map(Arc::clone).collect();
                sorted.sort_by_key(|s| s.to_string());
                let sig_h = if sorted.len() == 1 {
                    sorted.pop().unwrap()
                } else {
                    Atom::link(TYPE_CHOICE, sorted)
                };
                vars.push(Atom::link(
                    TYPED_VARIABLE_LINK,
                    vec![Arc::clone(var), sig_h],
                ));
                continue;
            }

            vars.push(Arc::clone(var));
        }

        if vars.is_empty() {
            return Ok(None);
        }
        if vars.len() == 1 {
            return Ok(Some(vars.pop().unwrap()));
        }
        Ok(Some(Atom::link(VARIABLE_LIST, vars)))
    }

    /// Beta-reduction with up-front arity and type checking. The result is
    /// a fresh term; nothing is registered with any atom table.
    pub fn substitute(
        &self,
        registry: &TypeRegistry,
        term: &AtomRef,
        args: &[AtomRef],
    ) -> Result<AtomRef> {
        if args.len() != self.varseq.len() {
            return Err(AtomError::ArityMismatch {
                expected: self.varseq.len(),
                actual: args.len(),
            });
        }
        if !self.is_type_seq(registry, args)? {
            return Err(AtomError::TypeCheck);
        }
        Ok(self.substitute_nocheck(registry, term, args))
    }

    pub fn substitute_nocheck(
        &self,
        registry: &TypeRegistry,
        term: &AtomRef,
        args: &[AtomRef],
    ) -> AtomRef {
        substitute_scoped(registry, term, args, &self.index, Quotation::default())
    }
}

fn named_type(registry: &TypeRegistry, type_node: &AtomRef) -> Result<TypeId> {
    let name = type_node.name().unwrap_or_default();
    registry
        .type_by_name(name)
        .ok_or_else(|| AtomError::UnknownType(name.to_owned()))
}

// ------------- Signature matching -------------
/// Does the value satisfy the signature atom? A `TypeNode` names a type the
/// value must inherit from, a `TypeChoice` is a disjunction, any other link
/// is matched structurally, and any other node must be the value itself.
pub fn value_is_type(registry: &TypeRegistry, sig: &AtomRef, val: &AtomRef) -> bool {
    match sig.atom_type() {
        TYPE_NODE => match registry.type_by_name(sig.name().unwrap_or_default()) {
            Some(t) => registry.is_a(val.atom_type(), t),
            None => false,
        },
        TYPE_CHOICE => sig
            .outgoing()
            .iter()
            .any(|alt| value_is_type(registry, alt, val)),
        _ if sig.is_link() => {
            sig.atom_type() == val.atom_type()
                && sig.arity() == val.arity()
                && sig
                    .outgoing()
                    .iter()
                    .zip(val.outgoing().iter())
                    .all(|(s, v)| value_is_type(registry, s, v))
        }
        _ => sig == val,
    }
}

// ------------- Scope extraction -------------
/// The variables a binder link declares, read from its outgoing set. This
/// is a dispatch on the first child's shape, not a method on a link class:
/// anything that does not look like a declaration binds nothing.
pub fn scope_variables(registry: &TypeRegistry, oset: &[AtomRef]) -> Variables {
    let Some(decl) = oset.first() else {
        return Variables::default();
    };
    match decl.atom_type() {
        VARIABLE_NODE | GLOB_NODE | TYPED_VARIABLE_LINK | VARIABLE_LIST => {
            Variables::from_vardecl(registry, decl).unwrap_or_default()
        }
        _ => Variables::default(),
    }
}

// ------------- Free-variable discovery -------------
struct VarScraper<'r> {
    registry: &'r TypeRegistry,
    quotation: Quotation,
    bound_vars: HashSet<AtomRef, OtherHasher>,
}

impl VarScraper<'_> {
    fn find_vars(
        &mut self,
        varseq: &mut Vec<AtomRef>,
        varset: &mut HashSet<AtomRef, OtherHasher>,
        oset: &[AtomRef],
    ) {
        for h in oset {
            let t = h.atom_type();

            if (VARIABLE_NODE == t || GLOB_NODE == t)
                && self.quotation.is_unquoted()
                && !varset.contains(h)
                && !self.bound_vars.contains(h)
            {
                varseq.push(Arc::clone(h));
                varset.insert(Arc::clone(h));
            }

            if !h.is_link() {
                continue;
            }

            let issco = self.quotation.is_unquoted() && self.registry.is_a(t, SCOPE_LINK);
            let bsave = if issco {
                // The binder's variables are invisible to the enclosing
                // collection for the duration of the descent.
                let save = self.bound_vars.clone();
                let vees = scope_variables(self.registry, h.outgoing());
                for v in vees.varseq {
                    self.bound_vars.insert(v);
                }
                Some(save)
            } else {
                None
            };

            let qsave = self.quotation;
            self.quotation = self.quotation.update(t);

            self.find_vars(varseq, varset, h.outgoing());

            if let Some(save) = bsave {
                self.bound_vars = save;
            }
            self.quotation = qsave;
        }
    }
}

/// Collect the free, unquoted variables of a term forest in
/// first-appearance pre-order, skipping variables bound by an enclosing
/// scoped binder.
pub fn find_variables(registry: &TypeRegistry, roots: &[AtomRef]) -> Variables {
    let mut vars = Variables::default();
    let mut scraper = VarScraper {
        registry,
        quotation: Quotation::default(),
        bound_vars: HashSet::default(),
    };
    scraper.find_vars(&mut vars.varseq, &mut vars.varset, roots);

    for (i, var) in vars.varseq.iter().enumerate() {
        vars.index.insert(Arc::clone(var), i);
    }
    vars
}

// ------------- Substitution -------------
fn substitute_scoped(
    registry: &TypeRegistry,
    term: &AtomRef,
    args: &[AtomRef],
    index_map: &IndexMap,
    quotation: Quotation,
) -> AtomRef {
    let unquoted = quotation.is_unquoted();

    // Outside any quote, a variable reduces to its value.
    if unquoted {
        if let Some(&idx) = index_map.get(term) {
            return Arc::clone(&args[idx]);
        }
    }

    // A node that is not one of our variables is a constant.
    if !term.is_link() {
        return Arc::clone(term);
    }

    let ty = term.atom_type();

    // Quotation state for the recursive calls below.
    let quotation = quotation.update(ty);

    if unquoted && registry.is_a(ty, SCOPE_LINK) {
        // A bound variable that happens to collide with a free variable
        // hides it for as long as the binder is in scope. No renaming is
        // needed; the variable is removed from a copy of the index map.
        let vees = scope_variables(registry, term.outgoing());
        let alpha_hide = vees.varseq.iter().any(|v| index_map.contains_key(v));
        if alpha_hide {
            let mut hidden_map = index_map.clone();
            for v in &vees.varseq {
                hidden_map.remove(v);
            }

            // Nothing left to substitute under this binder.
            if hidden_map.is_empty() {
                return Arc::clone(term);
            }

            let oset = term
                .outgoing()
                .iter()
                .map(|h| substitute_scoped(registry, h, args, &hidden_map, quotation))
                .collect();
            return Atom::link(ty, oset);
        }
    }

    let mut oset: Vec<AtomRef> = Vec::with_capacity(term.arity());
    for h in term.outgoing() {
        if GLOB_NODE == h.atom_type() {
            // A glob binds a sequence. A link result is spliced into the
            // enclosing outgoing set; a node result stood alone and
            // replaces the whole term.
            let glst = substitute_scoped(registry, h, args, index_map, quotation);
            if glst.is_node() {
                return glst;
            }
            oset.extend(glst.outgoing().iter().map(Arc::clone));
        } else {
            oset.push(substitute_scoped(registry, h, args, index_map, quotation));
        }
    }

    Atom::link(ty, oset)
}
