//! Control-flow automaton: locations, edges, and a programmatic builder.
//!
//! The operation language is deliberately small — assignments, assumptions,
//! call/return markers and skips. It is rich enough for an explicit-value
//! domain to produce interesting reachability problems, which is all the
//! engine needs from a frontend.

use smallvec::SmallVec;
use std::fmt;

/// A program location (CFA node). Dense u32 namespace per CFA.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location(u32);

impl Location {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn from_index(i: usize) -> Self {
        Location(i as u32)
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// A program variable, interned to a dense index by the builder.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(u32);

impl VarId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn from_index(i: usize) -> Self {
        VarId(i as u32)
    }
}

impl fmt::Debug for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Right-hand side of an assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Constant value.
    Const(i64),
    /// Copy of another variable.
    Var(VarId),
    /// Variable plus constant offset.
    Add(VarId, i64),
    /// Unknown input: the assigned variable becomes untracked.
    Havoc,
}

/// Branch condition for assume edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cond {
    Eq(VarId, i64),
    Ne(VarId, i64),
    Le(VarId, i64),
    Gt(VarId, i64),
}

impl Cond {
    /// The variable the condition reads.
    pub fn var(&self) -> VarId {
        match *self {
            Cond::Eq(v, _) | Cond::Ne(v, _) | Cond::Le(v, _) | Cond::Gt(v, _) => v,
        }
    }
}

/// Operation attached to a CFA edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeOp {
    /// No-op transition.
    Skip,
    /// `var := expr`.
    Assign(VarId, Expr),
    /// Transition only enabled when the condition holds.
    Assume(Cond),
    /// Enter a function body. The target location is the function entry,
    /// which the partition marks as a block call node.
    Call,
    /// Leave a function body back to the caller context.
    Return,
}

/// A directed CFA edge.
#[derive(Debug, Clone)]
pub struct CfaEdge {
    pub from: Location,
    pub to: Location,
    pub op: EdgeOp,
}

/// A whole control-flow automaton.
///
/// Edges are stored per source location so the transfer relation can look up
/// leaving edges in O(1).
#[derive(Debug, Clone)]
pub struct Cfa {
    entry: Location,
    num_locations: usize,
    leaving: Vec<SmallVec<[CfaEdge; 2]>>,
    var_names: Vec<String>,
}

impl Cfa {
    /// The program entry location.
    #[inline]
    pub fn entry(&self) -> Location {
        self.entry
    }

    /// Number of locations in the automaton.
    #[inline]
    pub fn num_locations(&self) -> usize {
        self.num_locations
    }

    /// Number of declared variables.
    #[inline]
    pub fn num_vars(&self) -> usize {
        self.var_names.len()
    }

    /// Edges leaving the given location.
    #[inline]
    pub fn leaving_edges(&self, loc: Location) -> &[CfaEdge] {
        &self.leaving[loc.index()]
    }

    /// Name of a variable, for diagnostics.
    pub fn var_name(&self, var: VarId) -> &str {
        &self.var_names[var.index()]
    }

    /// All declared variables.
    pub fn vars(&self) -> impl Iterator<Item = VarId> + '_ {
        (0..self.var_names.len()).map(VarId::from_index)
    }
}

/// Builder for programmatic CFA construction in tests and examples.
pub struct CfaBuilder {
    entry: Option<Location>,
    next_location: u32,
    edges: Vec<CfaEdge>,
    var_names: Vec<String>,
}

impl CfaBuilder {
    pub fn new() -> Self {
        Self {
            entry: None,
            next_location: 0,
            edges: Vec::new(),
            var_names: Vec::new(),
        }
    }

    /// Allocate a fresh location. The first location allocated becomes the
    /// entry unless `set_entry` overrides it.
    pub fn location(&mut self) -> Location {
        let loc = Location(self.next_location);
        self.next_location += 1;
        if self.entry.is_none() {
            self.entry = Some(loc);
        }
        loc
    }

    /// Allocate `n` fresh locations at once.
    pub fn locations<const N: usize>(&mut self) -> [Location; N] {
        std::array::from_fn(|_| self.location())
    }

    pub fn set_entry(&mut self, loc: Location) {
        self.entry = Some(loc);
    }

    /// Declare a named variable.
    pub fn var(&mut self, name: &str) -> VarId {
        let id = VarId(self.var_names.len() as u32);
        self.var_names.push(name.to_string());
        id
    }

    pub fn edge(&mut self, from: Location, to: Location, op: EdgeOp) -> &mut Self {
        self.edges.push(CfaEdge { from, to, op });
        self
    }

    pub fn assign(&mut self, from: Location, to: Location, var: VarId, expr: Expr) -> &mut Self {
        self.edge(from, to, EdgeOp::Assign(var, expr))
    }

    pub fn assume(&mut self, from: Location, to: Location, cond: Cond) -> &mut Self {
        self.edge(from, to, EdgeOp::Assume(cond))
    }

    pub fn skip(&mut self, from: Location, to: Location) -> &mut Self {
        self.edge(from, to, EdgeOp::Skip)
    }

    pub fn call(&mut self, from: Location, to: Location) -> &mut Self {
        self.edge(from, to, EdgeOp::Call)
    }

    pub fn ret(&mut self, from: Location, to: Location) -> &mut Self {
        self.edge(from, to, EdgeOp::Return)
    }

    pub fn build(self) -> Cfa {
        let num_locations = self.next_location as usize;
        let mut leaving: Vec<SmallVec<[CfaEdge; 2]>> = vec![SmallVec::new(); num_locations];
        for e in self.edges {
            leaving[e.from.index()].push(e);
        }
        Cfa {
            entry: self.entry.expect("CFA must have at least one location"),
            num_locations,
            leaving,
            var_names: self.var_names,
        }
    }
}

impl Default for CfaBuilder {
    fn default() -> Self {
        Self::new()
    }
}
