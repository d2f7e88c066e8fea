//! The wrapped-domain contract: transfer, merge, stop, precision adjustment.
//!
//! The engine moves states around, caches them and stitches them back
//! together; it never looks inside one. Everything domain-specific goes
//! through this trait.

use bam_cfa::Location;
use std::fmt::Debug;
use std::hash::Hash;

/// What the domain wants done after adjusting a node's precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecisionAdjustmentAction {
    /// Keep exploring from this node.
    Continue,
    /// Stop the whole exploration at this node (target found).
    Break,
}

/// Result of a precision adjustment: possibly replaced state and precision,
/// plus the continue/break signal.
#[derive(Debug, Clone)]
pub struct PrecisionAdjustment<S, P> {
    pub state: S,
    pub precision: P,
    pub action: PrecisionAdjustmentAction,
}

impl<S, P> PrecisionAdjustment<S, P> {
    pub fn keep(state: S, precision: P) -> Self {
        Self {
            state,
            precision,
            action: PrecisionAdjustmentAction::Continue,
        }
    }
}

/// An abstract-interpretation domain the engine can drive.
///
/// `State` and `Precision` are opaque to the engine except for the `Clone +
/// Eq + Hash` bounds the cache keys need.
pub trait AbstractDomain {
    type State: Clone + Eq + Hash + Debug;
    type Precision: Clone + Eq + Hash + Debug;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Abstract successors of `state` at `loc`, one per enabled leaving
    /// edge, paired with their target locations.
    fn successors(
        &self,
        loc: Location,
        state: &Self::State,
        precision: &Self::Precision,
    ) -> Result<Vec<(Location, Self::State)>, Self::Error>;

    /// Merge operator. `None` means merge-sep (keep both states).
    fn merge(
        &self,
        new: &Self::State,
        existing: &Self::State,
        precision: &Self::Precision,
    ) -> Option<Self::State>;

    /// Coverage check: is `state` subsumed by some state in `reached`?
    fn stop<'a>(
        &self,
        state: &Self::State,
        reached: impl Iterator<Item = &'a Self::State>,
        precision: &Self::Precision,
    ) -> bool
    where
        Self::State: 'a;

    /// Point-wise subsumption: does `covering` subsume `covered`?
    fn covers(&self, covering: &Self::State, covered: &Self::State) -> bool;

    /// Is this a violation of the property under check?
    fn is_target(&self, loc: Location, state: &Self::State) -> bool;

    /// Finalize a node's precision before it is added to the reached set.
    fn adjust_precision(
        &self,
        loc: Location,
        state: &Self::State,
        precision: &Self::Precision,
    ) -> Result<PrecisionAdjustment<Self::State, Self::Precision>, Self::Error>;
}
