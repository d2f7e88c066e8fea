//! Bookkeeping that links block-local analyses into the global picture.
//!
//! Two tables: the entry/exit registration (which reached set was analyzed
//! between a non-reduced entry node and a non-reduced exit node) and the
//! expansion table (which reduced exit state and block an expanded node was
//! produced from). One entry node can have several exit nodes, each with
//! its own registration. Expansion chains across nested blocks must
//! terminate at a block-local node; a cycle is a bug.

use crate::reached::{NodeRef, ReachedSetId};
use ahash::{AHashMap, AHashSet};
use bam_cfa::BlockId;
use bam_domain::AbstractDomain;
use smallvec::SmallVec;

/// What an expanded (caller-context) node was produced from.
pub struct ExpansionInfo<D: AbstractDomain> {
    /// The block-local exit node this one expands.
    pub reduced: NodeRef,
    /// The block whose analysis produced it.
    pub block: BlockId,
    /// The precision it was expanded under. Consulted by precision
    /// adjustment, since the node's own precision may be stale after the
    /// inner block was refined.
    pub expanded_precision: D::Precision,
}

impl<D: AbstractDomain> Clone for ExpansionInfo<D> {
    fn clone(&self) -> Self {
        Self {
            reduced: self.reduced,
            block: self.block,
            expanded_precision: self.expanded_precision.clone(),
        }
    }
}

/// The data manager.
pub struct BamData<D: AbstractDomain> {
    /// (entry node, exit node) -> reached set analyzed between them.
    entry_exit: AHashMap<(NodeRef, NodeRef), ReachedSetId>,
    /// Exit nodes registered per entry node, for forward walks.
    exits_of_entry: AHashMap<NodeRef, SmallVec<[NodeRef; 2]>>,
    /// Expanded node -> expansion provenance.
    expansion: AHashMap<NodeRef, ExpansionInfo<D>>,
    /// Reached set -> the caller node whose block entry spawned it.
    caller_of: AHashMap<ReachedSetId, NodeRef>,
}

impl<D: AbstractDomain> BamData<D> {
    pub fn new() -> Self {
        Self {
            entry_exit: AHashMap::new(),
            exits_of_entry: AHashMap::new(),
            expansion: AHashMap::new(),
            caller_of: AHashMap::new(),
        }
    }

    /// Record which caller node spawned a reached set. Done at creation,
    /// before any exits exist.
    pub fn register_call(&mut self, reached: ReachedSetId, caller: NodeRef) {
        self.caller_of.insert(reached, caller);
    }

    /// Record one (entry, exit) pair and the reached set between them.
    pub fn register_block_analysis(
        &mut self,
        entry: NodeRef,
        exit: NodeRef,
        reached: ReachedSetId,
    ) {
        self.entry_exit.insert((entry, exit), reached);
        self.exits_of_entry.entry(entry).or_default().push(exit);
    }

    /// Record how an expanded node was produced.
    pub fn register_expansion(&mut self, expanded: NodeRef, info: ExpansionInfo<D>) {
        debug_assert_ne!(
            expanded, info.reduced,
            "a node cannot be its own expansion source"
        );
        self.expansion.insert(expanded, info);
    }

    pub fn expansion_of(&self, node: NodeRef) -> Option<&ExpansionInfo<D>> {
        self.expansion.get(&node)
    }

    pub fn is_expanded(&self, node: NodeRef) -> bool {
        self.expansion.contains_key(&node)
    }

    pub fn reached_between(&self, entry: NodeRef, exit: NodeRef) -> Option<ReachedSetId> {
        self.entry_exit.get(&(entry, exit)).copied()
    }

    /// All registered exits of an entry node, with their reached sets.
    pub fn exits_of_entry(&self, entry: NodeRef) -> Vec<(NodeRef, ReachedSetId)> {
        self.exits_of_entry
            .get(&entry)
            .into_iter()
            .flatten()
            .filter_map(|exit| self.reached_between(entry, *exit).map(|r| (*exit, r)))
            .collect()
    }

    /// The caller node that spawned a reached set; `None` for the outermost
    /// set and for sets materialized outside a call (e.g. imported
    /// summaries).
    pub fn caller_of(&self, reached: ReachedSetId) -> Option<NodeRef> {
        self.caller_of.get(&reached).copied()
    }

    /// Follow the expansion chain from a node down to the block-local node
    /// it ultimately expands. Returns the node itself when it is not
    /// expanded. Panics on a cycle: that is corrupted bookkeeping, not a
    /// recoverable condition.
    pub fn innermost_reduced(&self, node: NodeRef) -> NodeRef {
        let mut seen: AHashSet<NodeRef> = AHashSet::new();
        let mut current = node;
        while let Some(info) = self.expansion.get(&current) {
            assert!(
                seen.insert(current),
                "expansion chain cycle at {current}"
            );
            current = info.reduced;
        }
        current
    }

    /// Rewrite every reference to `old` after a node replacement, so later
    /// lookups still resolve.
    pub fn replace_node(&mut self, old: NodeRef, new: NodeRef) {
        if let Some(info) = self.expansion.remove(&old) {
            self.expansion.insert(new, info);
        }
        for info in self.expansion.values_mut() {
            if info.reduced == old {
                info.reduced = new;
            }
        }
        for caller in self.caller_of.values_mut() {
            if *caller == old {
                *caller = new;
            }
        }
        let rekeyed: Vec<((NodeRef, NodeRef), ReachedSetId)> = self
            .entry_exit
            .iter()
            .filter(|((e, x), _)| *e == old || *x == old)
            .map(|(k, v)| (*k, *v))
            .collect();
        for ((e, x), r) in rekeyed {
            self.entry_exit.remove(&(e, x));
            let e2 = if e == old { new } else { e };
            let x2 = if x == old { new } else { x };
            self.entry_exit.insert((e2, x2), r);
        }
        if let Some(exits) = self.exits_of_entry.remove(&old) {
            self.exits_of_entry.insert(new, exits);
        }
        for exits in self.exits_of_entry.values_mut() {
            for exit in exits.iter_mut() {
                if *exit == old {
                    *exit = new;
                }
            }
        }
    }

    /// Drop every row that references a single node. Used after the node
    /// was removed from its reached set.
    pub fn forget_node(&mut self, node: NodeRef) {
        self.entry_exit.retain(|(e, x), _| *e != node && *x != node);
        self.exits_of_entry.retain(|e, exits| {
            if *e == node {
                return false;
            }
            exits.retain(|x| *x != node);
            !exits.is_empty()
        });
        self.expansion.retain(|n, info| *n != node && info.reduced != node);
        self.caller_of.retain(|_, caller| *caller != node);
    }

    /// Drop every row that references nodes of `reached` or the set itself.
    /// Used when a reached set is destroyed.
    pub fn forget_reached(&mut self, reached: ReachedSetId) {
        self.entry_exit
            .retain(|(e, x), r| e.set != reached && x.set != reached && *r != reached);
        self.exits_of_entry.retain(|e, exits| {
            if e.set == reached {
                return false;
            }
            exits.retain(|x| x.set != reached);
            !exits.is_empty()
        });
        self.expansion
            .retain(|n, info| n.set != reached && info.reduced.set != reached);
        self.caller_of
            .retain(|r, caller| *r != reached && caller.set != reached);
    }

    /// Copy-on-write patch: every reference into `old` whose node survives
    /// in the copy is redirected to `new`; references to removed nodes are
    /// dropped. `survives` answers whether a node id survived.
    pub fn remap_reached(
        &mut self,
        old: ReachedSetId,
        new: ReachedSetId,
        survives: impl Fn(crate::reached::NodeId) -> bool,
    ) {
        let remap = |n: NodeRef| -> Option<NodeRef> {
            if n.set != old {
                Some(n)
            } else if survives(n.node) {
                Some(NodeRef::new(new, n.node))
            } else {
                None
            }
        };

        let entry_exit = std::mem::take(&mut self.entry_exit);
        for ((e, x), r) in entry_exit {
            let r2 = if r == old { new } else { r };
            match (remap(e), remap(x)) {
                (Some(e2), Some(x2)) => {
                    self.entry_exit.insert((e2, x2), r2);
                }
                _ => {}
            }
        }

        let exits_of_entry = std::mem::take(&mut self.exits_of_entry);
        for (e, exits) in exits_of_entry {
            let Some(e2) = remap(e) else { continue };
            let remapped: SmallVec<[NodeRef; 2]> =
                exits.into_iter().filter_map(remap).collect();
            if !remapped.is_empty() {
                self.exits_of_entry.insert(e2, remapped);
            }
        }

        let expansion = std::mem::take(&mut self.expansion);
        for (n, mut info) in expansion {
            let Some(n2) = remap(n) else { continue };
            let Some(reduced2) = remap(info.reduced) else {
                continue;
            };
            info.reduced = reduced2;
            self.expansion.insert(n2, info);
        }

        let caller_of = std::mem::take(&mut self.caller_of);
        for (r, caller) in caller_of {
            let r2 = if r == old { new } else { r };
            if let Some(c2) = remap(caller) {
                self.caller_of.insert(r2, c2);
            }
        }
    }

    pub fn expansion_count(&self) -> usize {
        self.expansion.len()
    }

    pub fn registration_count(&self) -> usize {
        self.entry_exit.len()
    }
}

impl<D: AbstractDomain> Default for BamData<D> {
    fn default() -> Self {
        Self::new()
    }
}
