//! The recursion fixpoint.
//!
//! A block re-entered while already on the frame stack is not descended
//! into again; the call is answered with the cache entry's provisional
//! summary (its exits from the previous pass, empty on the first). Every
//! such consultation is recorded, and after a whole pass the driver checks
//! whether any consulted summary grew beyond what the dependent saw. If so,
//! the dependent's expanded exits are invalidated, the affected entries
//! reopened up the caller chain, and the pass re-run until the summaries
//! stabilize.

use crate::cache::CacheKey;
use crate::driver::BamEngine;
use crate::error::BamResult;
use crate::reached::{NodeId, NodeRef, ReachedSetId};
use bam_cfa::BlockId;
use bam_domain::{AbstractDomain, Reducer};
use tracing::debug;

/// A call node that consumed a provisional recursive summary, together with
/// the exit states it saw. Compared against the entry's exits after the
/// pass to decide whether another pass is needed.
pub(crate) struct RecursionDependent<D: AbstractDomain> {
    reached: ReachedSetId,
    node: NodeId,
    key: CacheKey<D>,
    used_exits: Vec<D::State>,
}

impl<D: AbstractDomain, R: Reducer<D>> BamEngine<D, R> {
    /// A block re-entered while already on the stack: apply the entry's
    /// provisional summary instead of descending, and record the
    /// consultation for the fixpoint check.
    pub(crate) fn recursive_summary(
        &mut self,
        caller: NodeRef,
        state: &D::State,
        precision: &D::Precision,
        entered_id: BlockId,
        key: &CacheKey<D>,
    ) -> BamResult<Option<NodeRef>, D::Error> {
        self.recursion_seen = true;
        let Some(entry) = self.cache.entry(key) else {
            // Every stacked key has an entry; an evicted one means the
            // summary is simply empty this pass.
            self.dependents.push(RecursionDependent {
                reached: caller.set,
                node: caller.node,
                key: key.clone(),
                used_exits: Vec::new(),
            });
            return Ok(None);
        };
        let inner = entry.reached();
        let mut exit_ids: Vec<NodeId> = entry.exits().map(<[_]>::to_vec).unwrap_or_default();
        let used_exits: Vec<D::State> = {
            let set = self.pool.expect(inner);
            exit_ids.retain(|id| set.contains(*id));
            exit_ids
                .iter()
                .map(|id| set.node(*id).state().clone())
                .collect()
        };
        debug!(
            block = %entered_id,
            exits = exit_ids.len(),
            "recursive re-entry, applying provisional summary"
        );
        let root_state = key.state.clone();
        self.attach_exits(
            caller,
            inner,
            &exit_ids,
            entered_id,
            state,
            precision,
            Some(&root_state),
        )?;
        self.dependents.push(RecursionDependent {
            reached: caller.set,
            node: caller.node,
            key: key.clone(),
            used_exits,
        });
        Ok(None)
    }

    /// Dependents whose provisional summary was outgrown by the pass.
    pub(crate) fn stale_dependents(&mut self) -> Vec<RecursionDependent<D>> {
        let dependents = std::mem::take(&mut self.dependents);
        dependents
            .into_iter()
            .filter(|dep| {
                let Some(entry) = self.cache.entry(&dep.key) else {
                    return true;
                };
                let Some(set) = self.pool.get(entry.reached()) else {
                    return true;
                };
                let Some(exits) = entry.exits() else {
                    return !dep.used_exits.is_empty();
                };
                exits.iter().filter_map(|id| set.get(*id)).any(|exit| {
                    !dep.used_exits
                        .iter()
                        .any(|used| self.domain.covers(used, exit.state()))
                })
            })
            .collect()
    }

    /// Invalidate the results built on a stale recursive summary: remove
    /// the expanded exits under the dependent call node, re-waitlist it,
    /// and reopen every cache entry from its set up to the outermost one.
    pub(crate) fn propagate_recursive_update(&mut self, dep: &RecursionDependent<D>) {
        let entry_ref = NodeRef::new(dep.reached, dep.node);
        debug!(node = %entry_ref, block = %dep.key.block, "recursive summary grew");
        self.remove_expanded_exits(entry_ref);
        if let Some(set) = self.pool.get_mut(dep.reached) {
            set.push_waitlist(dep.node);
            set.set_finished(false);
        }

        let mut rsid = dep.reached;
        loop {
            if let Some(key) = self.cache.key_for_reached(rsid).cloned() {
                self.cache.reopen(&key);
            }
            if Some(rsid) == self.main_reached() {
                break;
            }
            let Some(caller) = self.data.caller_of(rsid) else {
                break;
            };
            self.remove_expanded_exits(caller);
            if let Some(set) = self.pool.get_mut(caller.set) {
                set.push_waitlist(caller.node);
                set.set_finished(false);
            }
            rsid = caller.set;
        }
    }

    /// Remove every expanded exit registered under `entry` from its own
    /// set, dropping the bookkeeping of the removed nodes.
    fn remove_expanded_exits(&mut self, entry: NodeRef) {
        for (exit, _inner) in self.data.exits_of_entry(entry) {
            if exit.set != entry.set {
                continue;
            }
            let alive = self
                .pool
                .get(exit.set)
                .map(|s| s.contains(exit.node))
                .unwrap_or(false);
            if !alive {
                continue;
            }
            let removed = self.pool.expect_mut(exit.set).remove_subtree(exit.node);
            for id in &removed.removed {
                self.data.forget_node(NodeRef::new(exit.set, *id));
            }
        }
    }
}
