//! The reducer capability: block-local state abstraction.
//!
//! At block entry the caller's state and precision are reduced to the
//! block's view; at block exit the block-local result is expanded back into
//! the caller's context. One implementation per domain; the engine is
//! generic over it.

use crate::domain::AbstractDomain;
use bam_cfa::{Block, Location};

/// Maps full states/precisions to block-local ones and back.
///
/// Contract: `expand_state(caller, reduce_state(caller, b), b)` must subsume
/// `caller` under the domain's ordering — reduction may lose information
/// only about what is invisible inside the block, and expansion must restore
/// it from the caller context.
pub trait Reducer<D: AbstractDomain> {
    /// Project a caller state onto the block's view.
    fn reduce_state(&self, state: &D::State, block: &Block) -> D::State;

    /// Re-embed a reduced exit state into the caller's context.
    fn expand_state(&self, caller: &D::State, reduced_exit: &D::State, block: &Block) -> D::State;

    /// Project a precision onto the block's view.
    fn reduce_precision(&self, precision: &D::Precision, block: &Block) -> D::Precision;

    /// Re-embed a reduced precision into the caller's context.
    fn expand_precision(
        &self,
        caller: &D::Precision,
        reduced: &D::Precision,
        block: &Block,
    ) -> D::Precision;

    /// Distance between two precisions, used by aggressive cache lookups to
    /// pick the closest precision-mismatched entry. Zero means equal.
    fn precision_distance(&self, a: &D::Precision, b: &D::Precision) -> u64;

    /// May this state be used as a cache key? States carrying caller-private
    /// information (e.g. unresolved callstack data) must answer `false`.
    fn cacheable(&self, state: &D::State) -> bool {
        let _ = state;
        true
    }

    /// Rebuild a caller-context state after returning from a recursive call:
    /// take the callee-visible part from `expanded` and the caller-private
    /// part from `entry`. Only consulted on the recursion path.
    fn rebuild_after_call(
        &self,
        root: &D::State,
        entry: &D::State,
        expanded: &D::State,
        exit_loc: Location,
        block: &Block,
    ) -> D::State {
        let _ = (root, exit_loc, block, entry);
        expanded.clone()
    }
}
