//! Explicit-value domain: partial maps from variables to concrete values.
//!
//! A state tracks exact values for a subset of the program variables; a
//! variable absent from the map is unknown. Precision is the set of
//! variables worth tracking — refinement grows it. Maps live behind `Arc`
//! so state clones are an atomic increment, not a deep copy.
//!
//! This is the reference domain for the engine's test suites: reduction is
//! projection onto the block's variables, expansion restores the caller's
//! bindings for everything out of scope, and precision distance is the size
//! of the symmetric difference of the tracked sets.

use crate::domain::{
    AbstractDomain, PrecisionAdjustment, PrecisionAdjustmentAction,
};
use crate::reducer::Reducer;
use bam_cfa::{Block, Cfa, Cond, EdgeOp, Expr, Location, VarId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A partial assignment of concrete values to variables.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ExplicitState {
    vars: Arc<BTreeMap<VarId, i64>>,
}

impl ExplicitState {
    pub fn empty() -> Self {
        Self {
            vars: Arc::new(BTreeMap::new()),
        }
    }

    pub fn from_bindings(bindings: impl IntoIterator<Item = (VarId, i64)>) -> Self {
        Self {
            vars: Arc::new(bindings.into_iter().collect()),
        }
    }

    #[inline]
    pub fn get(&self, var: VarId) -> Option<i64> {
        self.vars.get(&var).copied()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn bindings(&self) -> impl Iterator<Item = (VarId, i64)> + '_ {
        self.vars.iter().map(|(v, x)| (*v, *x))
    }

    /// New state with `var` bound to `value`.
    pub fn with(&self, var: VarId, value: i64) -> Self {
        let mut vars = (*self.vars).clone();
        vars.insert(var, value);
        Self {
            vars: Arc::new(vars),
        }
    }

    /// New state with `var` unknown.
    pub fn without(&self, var: VarId) -> Self {
        if !self.vars.contains_key(&var) {
            return self.clone();
        }
        let mut vars = (*self.vars).clone();
        vars.remove(&var);
        Self {
            vars: Arc::new(vars),
        }
    }

    /// New state keeping only the bindings for `keep`.
    pub fn project(&self, keep: &BTreeSet<VarId>) -> Self {
        let vars = self
            .vars
            .iter()
            .filter(|(v, _)| keep.contains(v))
            .map(|(v, x)| (*v, *x))
            .collect();
        Self {
            vars: Arc::new(vars),
        }
    }
}

impl fmt::Debug for ExplicitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (v, x)) in self.vars.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}={}", v, x)?;
        }
        write!(f, "}}")
    }
}

/// Precision: the set of variables tracked exactly.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ExplicitPrecision {
    tracked: Arc<BTreeSet<VarId>>,
}

impl ExplicitPrecision {
    /// Track nothing: every assignment degrades to unknown.
    pub fn coarse() -> Self {
        Self {
            tracked: Arc::new(BTreeSet::new()),
        }
    }

    pub fn tracking(vars: impl IntoIterator<Item = VarId>) -> Self {
        Self {
            tracked: Arc::new(vars.into_iter().collect()),
        }
    }

    #[inline]
    pub fn tracks(&self, var: VarId) -> bool {
        self.tracked.contains(&var)
    }

    pub fn tracked(&self) -> &BTreeSet<VarId> {
        &self.tracked
    }

    /// Precision additionally tracking `vars`.
    pub fn join(&self, vars: impl IntoIterator<Item = VarId>) -> Self {
        let mut tracked = (*self.tracked).clone();
        tracked.extend(vars);
        Self {
            tracked: Arc::new(tracked),
        }
    }

    /// Precision restricted to `keep`.
    pub fn project(&self, keep: &BTreeSet<VarId>) -> Self {
        Self {
            tracked: Arc::new(self.tracked.intersection(keep).copied().collect()),
        }
    }
}

impl fmt::Debug for ExplicitPrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track{:?}", self.tracked)
    }
}

/// Errors from the explicit transfer relation.
#[derive(Debug, Error)]
pub enum ExplicitError {
    #[error("location {0} is outside the program")]
    UnknownLocation(Location),
}

/// The explicit-value domain over a CFA, with a set of error locations as
/// verification targets.
pub struct ExplicitDomain {
    cfa: Arc<Cfa>,
    targets: BTreeSet<Location>,
}

impl ExplicitDomain {
    pub fn new(cfa: Arc<Cfa>, targets: impl IntoIterator<Item = Location>) -> Self {
        Self {
            cfa,
            targets: targets.into_iter().collect(),
        }
    }

    pub fn cfa(&self) -> &Arc<Cfa> {
        &self.cfa
    }

    fn eval(&self, state: &ExplicitState, expr: &Expr) -> Option<i64> {
        match expr {
            Expr::Const(c) => Some(*c),
            Expr::Var(u) => state.get(*u),
            // Overflow leaves the result unknown, like any other value the
            // domain cannot represent exactly.
            Expr::Add(u, c) => state.get(*u).and_then(|x| x.checked_add(*c)),
            Expr::Havoc => None,
        }
    }

    /// Three-valued condition check: `None` when the variable is unknown.
    fn check(&self, state: &ExplicitState, cond: &Cond) -> Option<bool> {
        let x = state.get(cond.var())?;
        Some(match *cond {
            Cond::Eq(_, c) => x == c,
            Cond::Ne(_, c) => x != c,
            Cond::Le(_, c) => x <= c,
            Cond::Gt(_, c) => x > c,
        })
    }
}

impl AbstractDomain for ExplicitDomain {
    type State = ExplicitState;
    type Precision = ExplicitPrecision;
    type Error = ExplicitError;

    fn successors(
        &self,
        loc: Location,
        state: &Self::State,
        precision: &Self::Precision,
    ) -> Result<Vec<(Location, Self::State)>, Self::Error> {
        if loc.index() >= self.cfa.num_locations() {
            return Err(ExplicitError::UnknownLocation(loc));
        }
        let mut result = Vec::new();
        for edge in self.cfa.leaving_edges(loc) {
            match &edge.op {
                EdgeOp::Skip | EdgeOp::Call | EdgeOp::Return => {
                    result.push((edge.to, state.clone()));
                }
                EdgeOp::Assign(var, expr) => {
                    let next = match self.eval(state, expr) {
                        Some(value) if precision.tracks(*var) => state.with(*var, value),
                        _ => state.without(*var),
                    };
                    result.push((edge.to, next));
                }
                EdgeOp::Assume(cond) => match self.check(state, cond) {
                    Some(true) => result.push((edge.to, state.clone())),
                    Some(false) => {}
                    // Unknown: both branches stay feasible.
                    None => result.push((edge.to, state.clone())),
                },
            }
        }
        Ok(result)
    }

    fn merge(
        &self,
        _new: &Self::State,
        _existing: &Self::State,
        _precision: &Self::Precision,
    ) -> Option<Self::State> {
        // merge-sep: explicit values are kept apart.
        None
    }

    fn stop<'a>(
        &self,
        state: &Self::State,
        mut reached: impl Iterator<Item = &'a Self::State>,
        _precision: &Self::Precision,
    ) -> bool {
        reached.any(|r| self.covers(r, state))
    }

    fn covers(&self, covering: &Self::State, covered: &Self::State) -> bool {
        // Fewer bindings = more abstract. `covering` subsumes `covered` iff
        // every binding it has is also present, with the same value.
        covering
            .bindings()
            .all(|(v, x)| covered.get(v) == Some(x))
    }

    fn is_target(&self, loc: Location, _state: &Self::State) -> bool {
        self.targets.contains(&loc)
    }

    fn adjust_precision(
        &self,
        loc: Location,
        state: &Self::State,
        precision: &Self::Precision,
    ) -> Result<PrecisionAdjustment<Self::State, Self::Precision>, Self::Error> {
        let action = if self.is_target(loc, state) {
            PrecisionAdjustmentAction::Break
        } else {
            PrecisionAdjustmentAction::Continue
        };
        Ok(PrecisionAdjustment {
            state: state.clone(),
            precision: precision.clone(),
            action,
        })
    }
}

/// Reducer for the explicit domain: projection onto the block's variables.
pub struct ExplicitReducer;

impl Reducer<ExplicitDomain> for ExplicitReducer {
    fn reduce_state(&self, state: &ExplicitState, block: &Block) -> ExplicitState {
        state.project(block.variables())
    }

    fn expand_state(
        &self,
        caller: &ExplicitState,
        reduced_exit: &ExplicitState,
        block: &Block,
    ) -> ExplicitState {
        // Block-visible bindings come from the exit state, everything else
        // is restored from the caller.
        let mut expanded = reduced_exit.clone();
        for (v, x) in caller.bindings() {
            if !block.contains_variable(v) {
                expanded = expanded.with(v, x);
            }
        }
        expanded
    }

    fn reduce_precision(&self, precision: &ExplicitPrecision, block: &Block) -> ExplicitPrecision {
        precision.project(block.variables())
    }

    fn expand_precision(
        &self,
        caller: &ExplicitPrecision,
        reduced: &ExplicitPrecision,
        block: &Block,
    ) -> ExplicitPrecision {
        let outer = caller
            .tracked()
            .iter()
            .copied()
            .filter(|v| !block.contains_variable(*v));
        reduced.join(outer)
    }

    fn precision_distance(&self, a: &ExplicitPrecision, b: &ExplicitPrecision) -> u64 {
        a.tracked().symmetric_difference(b.tracked()).count() as u64
    }

    fn rebuild_after_call(
        &self,
        _root: &ExplicitState,
        entry: &ExplicitState,
        expanded: &ExplicitState,
        _exit_loc: Location,
        block: &Block,
    ) -> ExplicitState {
        let mut rebuilt = expanded.project(block.variables());
        for (v, x) in entry.bindings() {
            if !block.contains_variable(v) {
                rebuilt = rebuilt.with(v, x);
            }
        }
        rebuilt
    }
}
