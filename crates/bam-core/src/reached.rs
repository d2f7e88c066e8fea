//! Node arena and reached sets.
//!
//! The abstract-reachability graph is cyclic-ish (parents, children,
//! covering links) and shared across cached block instances, so nodes live
//! in arenas addressed by stable indices instead of owning pointers. A
//! "copy" is explicit sub-arena duplication, which is what makes
//! copy-on-write subtree removal a well-defined operation.
//!
//! A reached set owns the nodes of one block instance: the arena, a
//! waitlist of not-yet-processed nodes, and the root. Reached sets
//! themselves live in a [`ReachedSetPool`] so that bookkeeping tables can
//! address nodes across sets with plain [`NodeRef`] values.

use ahash::AHashSet;
use bam_cfa::{Block, BlockId, Location};
use bam_domain::AbstractDomain;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;

/// Index of a node within one reached set. Also the insertion index:
/// children always have larger ids than the parents they were created
/// under, which the subgraph computer relies on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn from_index(i: usize) -> Self {
        NodeId(i as u32)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Index of a reached set within the pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReachedSetId(u32);

impl ReachedSetId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn from_index(i: usize) -> Self {
        ReachedSetId(i as u32)
    }
}

impl fmt::Debug for ReachedSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A node addressed across reached sets.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub set: ReachedSetId,
    pub node: NodeId,
}

impl NodeRef {
    pub fn new(set: ReachedSetId, node: NodeId) -> Self {
        Self { set, node }
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{:?}", self.set, self.node)
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{:?}", self.set, self.node)
    }
}

/// One node of the explored abstract-reachability graph.
pub struct Node<D: AbstractDomain> {
    id: NodeId,
    location: Location,
    state: D::State,
    precision: D::Precision,
    parents: SmallVec<[NodeId; 2]>,
    children: SmallVec<[NodeId; 4]>,
    covered_by: Option<NodeId>,
    target: bool,
    /// Strict-mode placeholder: the block whose summary was missing.
    missing_summary: Option<BlockId>,
}

impl<D: AbstractDomain> Node<D> {
    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn location(&self) -> Location {
        self.location
    }

    #[inline]
    pub fn state(&self) -> &D::State {
        &self.state
    }

    #[inline]
    pub fn precision(&self) -> &D::Precision {
        &self.precision
    }

    pub fn parents(&self) -> &[NodeId] {
        &self.parents
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    #[inline]
    pub fn is_covered(&self) -> bool {
        self.covered_by.is_some()
    }

    pub fn covered_by(&self) -> Option<NodeId> {
        self.covered_by
    }

    #[inline]
    pub fn is_target(&self) -> bool {
        self.target
    }

    /// The block whose summary was missing, for strict-mode placeholders.
    pub fn missing_summary(&self) -> Option<BlockId> {
        self.missing_summary
    }

    pub(crate) fn set_state(&mut self, state: D::State) {
        self.state = state;
    }

    pub(crate) fn set_precision(&mut self, precision: D::Precision) {
        self.precision = precision;
    }

    pub(crate) fn mark_target(&mut self) {
        self.target = true;
    }
}

impl<D: AbstractDomain> Clone for Node<D> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            location: self.location,
            state: self.state.clone(),
            precision: self.precision.clone(),
            parents: self.parents.clone(),
            children: self.children.clone(),
            covered_by: self.covered_by,
            target: self.target,
            missing_summary: self.missing_summary,
        }
    }
}

impl<D: AbstractDomain> fmt::Debug for Node<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("state", &self.state)
            .field("covered_by", &self.covered_by)
            .field("target", &self.target)
            .finish()
    }
}

/// Nodes cut out of a reached set by `remove_subtree`.
#[derive(Debug)]
pub struct RemovedSubtree {
    /// All removed node ids (the cut node and its descendants).
    pub removed: Vec<NodeId>,
    /// Nodes re-added to the waitlist: the cut node's surviving parents and
    /// formerly covered nodes whose coverer was removed.
    pub readded: Vec<NodeId>,
}

/// An ordered collection of graph nodes plus a waitlist, the unit analyzed
/// for one block instance.
pub struct ReachedSet<D: AbstractDomain> {
    id: ReachedSetId,
    block: BlockId,
    root: NodeId,
    slots: Vec<Option<Node<D>>>,
    waitlist: VecDeque<NodeId>,
    waitlisted: AHashSet<NodeId>,
    finished: bool,
}

impl<D: AbstractDomain> ReachedSet<D> {
    fn new(
        id: ReachedSetId,
        block: BlockId,
        location: Location,
        state: D::State,
        precision: D::Precision,
    ) -> Self {
        let root = NodeId(0);
        let root_node = Node {
            id: root,
            location,
            state,
            precision,
            parents: SmallVec::new(),
            children: SmallVec::new(),
            covered_by: None,
            target: false,
            missing_summary: None,
        };
        let mut waitlisted = AHashSet::new();
        waitlisted.insert(root);
        Self {
            id,
            block,
            root,
            slots: vec![Some(root_node)],
            waitlist: VecDeque::from([root]),
            waitlisted,
            finished: false,
        }
    }

    #[inline]
    pub fn id(&self) -> ReachedSetId {
        self.id
    }

    #[inline]
    pub fn block(&self) -> BlockId {
        self.block
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn set_finished(&mut self, finished: bool) {
        self.finished = finished;
    }

    /// Live nodes in the set.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn contains(&self, id: NodeId) -> bool {
        self.slots
            .get(id.index())
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node<D>> {
        self.slots.get(id.index()).and_then(|s| s.as_ref())
    }

    /// Panics if the node was removed: callers hold a bookkeeping reference
    /// that must have been cleaned up, so a dangling id is a bug.
    pub fn node(&self, id: NodeId) -> &Node<D> {
        self.get(id)
            .unwrap_or_else(|| panic!("node {:?} was removed from {:?}", id, self.id))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node<D> {
        let set = self.id;
        self.slots
            .get_mut(id.index())
            .and_then(|s| s.as_mut())
            .unwrap_or_else(|| panic!("node {:?} was removed from {:?}", id, set))
    }

    /// Add a fresh node as a child of `parent` and put it on the waitlist.
    pub(crate) fn add(
        &mut self,
        location: Location,
        state: D::State,
        precision: D::Precision,
        parent: Option<NodeId>,
    ) -> NodeId {
        let id = self.push_node(location, state, precision, parent);
        self.push_waitlist(id);
        id
    }

    /// Add a fresh node covered by `coverer`: it is part of the graph but
    /// never explored.
    pub(crate) fn add_covered(
        &mut self,
        location: Location,
        state: D::State,
        precision: D::Precision,
        parent: Option<NodeId>,
        coverer: NodeId,
    ) -> NodeId {
        let id = self.push_node(location, state, precision, parent);
        self.node_mut(id).covered_by = Some(coverer);
        id
    }

    /// Add a strict-mode placeholder for a missing block summary.
    pub(crate) fn add_missing_summary(
        &mut self,
        location: Location,
        state: D::State,
        precision: D::Precision,
        parent: NodeId,
        block: BlockId,
    ) -> NodeId {
        let id = self.push_node(location, state, precision, Some(parent));
        self.node_mut(id).missing_summary = Some(block);
        id
    }

    fn push_node(
        &mut self,
        location: Location,
        state: D::State,
        precision: D::Precision,
        parent: Option<NodeId>,
    ) -> NodeId {
        let id = NodeId(self.slots.len() as u32);
        let mut parents = SmallVec::new();
        if let Some(p) = parent {
            parents.push(p);
        }
        self.slots.push(Some(Node {
            id,
            location,
            state,
            precision,
            parents,
            children: SmallVec::new(),
            covered_by: None,
            target: false,
            missing_summary: None,
        }));
        if let Some(p) = parent {
            self.node_mut(p).children.push(id);
        }
        id
    }

    /// Add an extra parent edge (used when an existing node gains another
    /// predecessor).
    pub(crate) fn link(&mut self, parent: NodeId, child: NodeId) {
        if !self.node(child).parents.contains(&parent) {
            self.node_mut(child).parents.push(parent);
            self.node_mut(parent).children.push(child);
        }
    }

    pub(crate) fn push_waitlist(&mut self, id: NodeId) {
        if self.contains(id) && self.waitlisted.insert(id) {
            self.waitlist.push_back(id);
        }
    }

    /// Pop the next node to process, skipping ids removed since enqueueing.
    pub(crate) fn pop_waitlist(&mut self) -> Option<NodeId> {
        while let Some(id) = self.waitlist.pop_front() {
            self.waitlisted.remove(&id);
            if self.contains(id) {
                return Some(id);
            }
        }
        None
    }

    pub fn waitlist_is_empty(&self) -> bool {
        self.waitlist.iter().all(|id| !self.contains(*id))
    }

    /// Re-seed the waitlist with uncovered leaves. Used when a reached set
    /// from an imprecise cache match is resumed under a new precision.
    pub(crate) fn reseed_frontier(&mut self) {
        if !self.waitlist_is_empty() {
            return;
        }
        let leaves: Vec<NodeId> = self
            .iter()
            .filter(|n| n.children.is_empty() && !n.is_covered() && n.missing_summary.is_none())
            .map(|n| n.id)
            .collect();
        for id in leaves {
            self.push_waitlist(id);
        }
    }

    /// Iterate live nodes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Node<D>> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.iter().map(|n| n.id)
    }

    /// Uncovered states at a location, for merge and coverage checks.
    pub(crate) fn frontier_at(&self, loc: Location) -> impl Iterator<Item = &Node<D>> {
        self.iter()
            .filter(move |n| n.location == loc && !n.is_covered() && n.missing_summary.is_none())
    }

    /// Uncovered nodes sitting at the block's return locations: the exit
    /// states contributed by this instance once it is finished.
    pub fn exit_nodes(&self, block: &Block) -> Vec<NodeId> {
        self.iter()
            .filter(|n| {
                block.is_return_node(n.location) && !n.is_covered() && n.missing_summary.is_none()
            })
            .map(|n| n.id)
            .collect()
    }

    pub fn target_nodes(&self) -> Vec<NodeId> {
        self.iter().filter(|n| n.target).map(|n| n.id).collect()
    }

    pub fn missing_summary_nodes(&self) -> Vec<NodeId> {
        self.iter()
            .filter(|n| n.missing_summary.is_some())
            .map(|n| n.id)
            .collect()
    }

    /// Remove `cut` and all its descendants. Surviving parents of the cut
    /// node and nodes uncovered by the removal go back on the waitlist.
    pub(crate) fn remove_subtree(&mut self, cut: NodeId) -> RemovedSubtree {
        assert!(
            self.contains(cut),
            "remove_subtree: {:?} not in {:?}",
            cut,
            self.id
        );
        // Descendants via child closure.
        let mut removed_set: AHashSet<NodeId> = AHashSet::new();
        let mut queue = VecDeque::from([cut]);
        while let Some(id) = queue.pop_front() {
            if !removed_set.insert(id) {
                continue;
            }
            if let Some(node) = self.get(id) {
                queue.extend(node.children.iter().copied());
            }
        }

        let cut_parents: Vec<NodeId> = self
            .node(cut)
            .parents
            .iter()
            .copied()
            .filter(|p| !removed_set.contains(p))
            .collect();

        // Unlink surviving parents from removed children.
        for slot in self.slots.iter_mut() {
            if let Some(node) = slot {
                if !removed_set.contains(&node.id) {
                    node.children.retain(|c| !removed_set.contains(c));
                    node.parents.retain(|p| !removed_set.contains(p));
                }
            }
        }

        // Drop the subtree.
        let mut removed: Vec<NodeId> = Vec::with_capacity(removed_set.len());
        for id in &removed_set {
            if self.contains(*id) {
                self.slots[id.index()] = None;
                removed.push(*id);
            }
        }
        removed.sort();

        // Nodes covered by a removed node become open leaves again.
        let mut readded = cut_parents.clone();
        let uncovered: Vec<NodeId> = self
            .iter()
            .filter(|n| matches!(n.covered_by, Some(c) if removed_set.contains(&c)))
            .map(|n| n.id)
            .collect();
        for id in &uncovered {
            self.node_mut(*id).covered_by = None;
        }
        readded.extend(uncovered);

        for id in &readded {
            self.push_waitlist(*id);
        }
        self.finished = false;

        RemovedSubtree { removed, readded }
    }

    /// Structural copy of this set without the subtree under `cut`. Node
    /// ids are preserved so bookkeeping can be remapped by set id alone.
    /// The pool assigns the copy's id on insertion.
    pub(crate) fn copy_without_subtree(&self, cut: NodeId) -> (ReachedSet<D>, RemovedSubtree) {
        let mut copy = ReachedSet {
            id: self.id,
            block: self.block,
            root: self.root,
            slots: self.slots.clone(),
            waitlist: self.waitlist.clone(),
            waitlisted: self.waitlisted.clone(),
            finished: self.finished,
        };
        let removed = copy.remove_subtree(cut);
        (copy, removed)
    }

    /// Replace a node with a fresh one carrying a new state/precision,
    /// preserving all edges. Returns the replacement id.
    pub(crate) fn replace_node(
        &mut self,
        old: NodeId,
        state: D::State,
        precision: D::Precision,
    ) -> NodeId {
        let old_node = self.node(old).clone();
        let new = NodeId(self.slots.len() as u32);
        self.slots.push(Some(Node {
            id: new,
            location: old_node.location,
            state,
            precision,
            parents: old_node.parents.clone(),
            children: old_node.children.clone(),
            covered_by: old_node.covered_by,
            target: old_node.target,
            missing_summary: old_node.missing_summary,
        }));
        for p in old_node.parents.iter() {
            let children = &mut self.node_mut(*p).children;
            for c in children.iter_mut() {
                if *c == old {
                    *c = new;
                }
            }
        }
        for c in old_node.children.iter() {
            let parents = &mut self.node_mut(*c).parents;
            for p in parents.iter_mut() {
                if *p == old {
                    *p = new;
                }
            }
        }
        for slot in self.slots.iter_mut() {
            if let Some(node) = slot {
                if node.covered_by == Some(old) {
                    node.covered_by = Some(new);
                }
            }
        }
        if self.root == old {
            self.root = new;
        }
        let was_waitlisted = self.waitlisted.contains(&old);
        self.slots[old.index()] = None;
        if was_waitlisted {
            self.push_waitlist(new);
        }
        new
    }
}

impl<D: AbstractDomain> fmt::Debug for ReachedSet<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReachedSet")
            .field("id", &self.id)
            .field("block", &self.block)
            .field("nodes", &self.len())
            .field("waitlist", &self.waitlist.len())
            .field("finished", &self.finished)
            .finish()
    }
}

/// Owner of all reached sets of one engine run.
pub struct ReachedSetPool<D: AbstractDomain> {
    sets: Vec<Option<ReachedSet<D>>>,
}

impl<D: AbstractDomain> ReachedSetPool<D> {
    pub fn new() -> Self {
        Self { sets: Vec::new() }
    }

    pub(crate) fn create(
        &mut self,
        block: BlockId,
        location: Location,
        state: D::State,
        precision: D::Precision,
    ) -> ReachedSetId {
        let id = ReachedSetId(self.sets.len() as u32);
        self.sets
            .push(Some(ReachedSet::new(id, block, location, state, precision)));
        id
    }

    /// Insert a structural copy, assigning it a fresh id.
    pub(crate) fn insert_copy(&mut self, mut set: ReachedSet<D>) -> ReachedSetId {
        let id = ReachedSetId(self.sets.len() as u32);
        set.id = id;
        self.sets.push(Some(set));
        id
    }

    #[inline]
    pub fn contains(&self, id: ReachedSetId) -> bool {
        self.sets
            .get(id.index())
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    pub fn get(&self, id: ReachedSetId) -> Option<&ReachedSet<D>> {
        self.sets.get(id.index()).and_then(|s| s.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: ReachedSetId) -> Option<&mut ReachedSet<D>> {
        self.sets.get_mut(id.index()).and_then(|s| s.as_mut())
    }

    /// Panics when the set was destroyed: used where a live reference is an
    /// invariant, not a recoverable condition.
    pub fn expect(&self, id: ReachedSetId) -> &ReachedSet<D> {
        self.get(id)
            .unwrap_or_else(|| panic!("reached set {:?} was destroyed", id))
    }

    pub(crate) fn expect_mut(&mut self, id: ReachedSetId) -> &mut ReachedSet<D> {
        self.get_mut(id)
            .unwrap_or_else(|| panic!("reached set {:?} was destroyed", id))
    }

    pub(crate) fn destroy(&mut self, id: ReachedSetId) -> Option<ReachedSet<D>> {
        self.sets.get_mut(id.index()).and_then(|s| s.take())
    }

    pub fn len(&self) -> usize {
        self.sets.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate live reached sets.
    pub fn iter(&self) -> impl Iterator<Item = &ReachedSet<D>> {
        self.sets.iter().filter_map(|s| s.as_ref())
    }
}

impl<D: AbstractDomain> Default for ReachedSetPool<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bam_cfa::Location;
    use bam_domain::{ExplicitDomain, ExplicitPrecision, ExplicitState};

    type D = ExplicitDomain;

    fn loc(i: usize) -> Location {
        Location::from_index(i)
    }

    fn fresh() -> ReachedSet<D> {
        ReachedSet::new(
            ReachedSetId(0),
            BlockId::from_index(0),
            loc(0),
            ExplicitState::empty(),
            ExplicitPrecision::coarse(),
        )
    }

    fn state(i: i64) -> ExplicitState {
        ExplicitState::from_bindings([(bam_cfa::VarId::from_index(0), i)])
    }

    #[test]
    fn test_add_and_waitlist_order() {
        let mut r = fresh();
        let root = r.root();
        let a = r.add(loc(1), state(1), ExplicitPrecision::coarse(), Some(root));
        let b = r.add(loc(2), state(2), ExplicitPrecision::coarse(), Some(root));
        assert_eq!(r.pop_waitlist(), Some(root));
        assert_eq!(r.pop_waitlist(), Some(a));
        assert_eq!(r.pop_waitlist(), Some(b));
        assert_eq!(r.pop_waitlist(), None);
        assert_eq!(r.node(a).parents(), &[root]);
        assert_eq!(r.node(root).children(), &[a, b]);
    }

    #[test]
    fn test_waitlist_dedupes() {
        let mut r = fresh();
        let root = r.root();
        r.push_waitlist(root);
        assert_eq!(r.pop_waitlist(), Some(root));
        assert_eq!(r.pop_waitlist(), None);
    }

    #[test]
    fn test_remove_subtree_cuts_descendants() {
        let mut r = fresh();
        let root = r.root();
        let a = r.add(loc(1), state(1), ExplicitPrecision::coarse(), Some(root));
        let b = r.add(loc(2), state(2), ExplicitPrecision::coarse(), Some(a));
        let c = r.add(loc(3), state(3), ExplicitPrecision::coarse(), Some(root));

        // Drain the waitlist so re-adds are observable.
        while r.pop_waitlist().is_some() {}

        let removed = r.remove_subtree(a);
        assert_eq!(removed.removed, vec![a, b]);
        assert!(removed.readded.contains(&root));
        assert!(r.contains(root));
        assert!(!r.contains(a));
        assert!(!r.contains(b));
        assert!(r.contains(c));
        assert_eq!(r.node(root).children(), &[c]);
        assert_eq!(r.pop_waitlist(), Some(root));
    }

    #[test]
    fn test_remove_subtree_uncovers() {
        let mut r = fresh();
        let root = r.root();
        let a = r.add(loc(1), state(1), ExplicitPrecision::coarse(), Some(root));
        let covered = r.add_covered(loc(1), state(2), ExplicitPrecision::coarse(), Some(root), a);
        while r.pop_waitlist().is_some() {}

        let removed = r.remove_subtree(a);
        assert!(removed.readded.contains(&covered));
        assert!(!r.node(covered).is_covered());
    }

    #[test]
    fn test_copy_without_subtree_leaves_original() {
        let mut r = fresh();
        let root = r.root();
        let a = r.add(loc(1), state(1), ExplicitPrecision::coarse(), Some(root));
        let _b = r.add(loc(2), state(2), ExplicitPrecision::coarse(), Some(a));

        let (copy, removed) = r.copy_without_subtree(a);
        assert_eq!(removed.removed.len(), 2);
        assert_eq!(r.len(), 3);
        assert_eq!(copy.len(), 1);
        assert!(r.contains(a));
        assert!(!copy.contains(a));
        // Ids are preserved in the copy.
        assert_eq!(copy.root(), root);
    }

    #[test]
    fn test_replace_node_rewires_edges() {
        let mut r = fresh();
        let root = r.root();
        let a = r.add(loc(1), state(1), ExplicitPrecision::coarse(), Some(root));
        let b = r.add(loc(2), state(2), ExplicitPrecision::coarse(), Some(a));

        let a2 = r.replace_node(a, state(9), ExplicitPrecision::coarse());
        assert!(!r.contains(a));
        assert_eq!(r.node(root).children(), &[a2]);
        assert_eq!(r.node(b).parents(), &[a2]);
        assert_eq!(r.node(a2).children(), &[b]);
        assert_eq!(r.node(a2).state(), &state(9));
    }

    #[test]
    fn test_exit_nodes_skips_covered() {
        let mut pb = bam_cfa::BlockPartitionBuilder::new();
        let id = pb.main_block("b", [loc(0)], [loc(5)], []);
        let partition = pb.build().unwrap();
        let block = partition.block(id);

        let mut r = fresh();
        let root = r.root();
        let e1 = r.add(loc(5), state(1), ExplicitPrecision::coarse(), Some(root));
        let _cov = r.add_covered(loc(5), state(2), ExplicitPrecision::coarse(), Some(root), e1);
        assert_eq!(r.exit_nodes(block), vec![e1]);
    }

    #[test]
    #[should_panic(expected = "was removed")]
    fn test_dangling_node_access_panics() {
        let mut r = fresh();
        let root = r.root();
        let a = r.add(loc(1), state(1), ExplicitPrecision::coarse(), Some(root));
        r.remove_subtree(a);
        let _ = r.node(a);
    }
}
