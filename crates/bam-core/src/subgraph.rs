//! Backward counterexample reconstruction.
//!
//! The driver stops at an expanded target node in the outermost set; the
//! path to it runs through cached block analyses that are not part of that
//! set. Reconstruction walks ancestors backwards in decreasing insertion
//! order (children always have higher ids than their parents, so a max-heap
//! visits every node after all of its relevant children) and, at each
//! expanded node, splices the registered inner analysis in between the call
//! node and the exit.

use crate::driver::BamEngine;
use crate::error::{BamError, BamResult};
use crate::reached::NodeRef;
use crate::view::{BamReachedSetView, ViewNode};
use ahash::{AHashMap, AHashSet};
use bam_domain::{AbstractDomain, Reducer};
use std::collections::BinaryHeap;
use tracing::trace;

impl<D: AbstractDomain, R: Reducer<D>> BamEngine<D, R> {
    /// Reconstruct the subgraph of everything reaching `target`, spliced
    /// across block boundaries. Fails with [`BamError::MissingBlock`] when
    /// a required inner analysis was evicted since the node was created.
    pub fn counterexample_subgraph(
        &self,
        target: NodeRef,
    ) -> BamResult<BamReachedSetView<D>, D::Error> {
        let mut builder = SubgraphBuilder {
            engine: self,
            nodes: Vec::new(),
            index: AHashMap::new(),
        };
        let root = builder.build(target)?;
        let target_index = builder.index[&target];
        trace!(
            nodes = builder.nodes.len(),
            "counterexample subgraph reconstructed"
        );
        Ok(BamReachedSetView::new(builder.nodes, root, target_index))
    }
}

struct SubgraphBuilder<'a, D: AbstractDomain, R: Reducer<D>> {
    engine: &'a BamEngine<D, R>,
    nodes: Vec<ViewNode<D>>,
    index: AHashMap<NodeRef, usize>,
}

impl<'a, D: AbstractDomain, R: Reducer<D>> SubgraphBuilder<'a, D, R> {
    /// Copy one live node into the view, deduplicated by its ref.
    fn intern(&mut self, r: NodeRef) -> BamResult<usize, D::Error> {
        if let Some(&i) = self.index.get(&r) {
            return Ok(i);
        }
        let engine = self.engine;
        let node = engine
            .pool()
            .get(r.set)
            .and_then(|set| set.get(r.node))
            .ok_or(BamError::MissingBlock { entry: r, exit: r })?;
        let i = self.nodes.len();
        self.nodes.push(ViewNode {
            source: r,
            location: node.location(),
            state: node.state().clone(),
            precision: node.precision().clone(),
            target: node.is_target(),
            parents: Vec::new(),
            children: Vec::new(),
        });
        self.index.insert(r, i);
        Ok(i)
    }

    fn link(&mut self, parent: usize, child: usize) {
        if !self.nodes[child].parents.contains(&parent) {
            self.nodes[child].parents.push(parent);
            self.nodes[parent].children.push(child);
        }
    }

    /// Reconstruct the ancestors of `last` within its own set, recursing
    /// into inner analyses at expanded nodes. Returns the view index of
    /// the set's root.
    fn build(&mut self, last: NodeRef) -> BamResult<usize, D::Error> {
        let engine = self.engine;
        let set = engine
            .pool()
            .get(last.set)
            .ok_or(BamError::MissingBlock {
                entry: last,
                exit: last,
            })?;

        let mut heap = BinaryHeap::new();
        let mut seen = AHashSet::new();
        heap.push(last.node);
        seen.insert(last.node);
        while let Some(id) = heap.pop() {
            let r = NodeRef::new(last.set, id);
            let vi = self.intern(r)?;
            let node = set.get(id).ok_or(BamError::MissingBlock {
                entry: last,
                exit: r,
            })?;

            let expansion = engine.data().expansion_of(r).cloned();
            match expansion {
                Some(info) if !node.parents().is_empty() && info.reduced.set != r.set => {
                    // The edge from the call node to this exit runs through
                    // the inner analysis: splice it in.
                    if engine.pool().get(info.reduced.set).is_none() {
                        return Err(BamError::MissingBlock {
                            entry: r,
                            exit: info.reduced,
                        });
                    }
                    let inner_root = self.build(info.reduced)?;
                    let exit_vi = self.intern(info.reduced)?;
                    self.link(exit_vi, vi);
                    for &p in node.parents() {
                        let entry_vi = self.intern(NodeRef::new(last.set, p))?;
                        self.link(entry_vi, inner_root);
                        if seen.insert(p) {
                            heap.push(p);
                        }
                    }
                }
                _ => {
                    for &p in node.parents() {
                        let pvi = self.intern(NodeRef::new(last.set, p))?;
                        self.link(pvi, vi);
                        if seen.insert(p) {
                            heap.push(p);
                        }
                    }
                }
            }
        }

        self.intern(NodeRef::new(last.set, set.root()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BamConfig;
    use crate::driver::AnalysisOutcome;
    use bam_cfa::{BlockPartitionBuilder, CfaBuilder, Expr, Location};
    use bam_domain::{ExplicitDomain, ExplicitPrecision, ExplicitReducer, ExplicitState};
    use std::sync::Arc;

    type Engine = BamEngine<ExplicitDomain, ExplicitReducer>;

    /// main: l0 -> l1 [call f] ... l2 -> l3 (error); f: l1 --y:=2--> l2.
    fn engine_with_target() -> (Engine, [Location; 4]) {
        let mut b = CfaBuilder::new();
        let locs = b.locations();
        let [l0, l1, l2, l3] = locs;
        let x = b.var("x");
        let y = b.var("y");
        b.assign(l0, l1, x, Expr::Const(1));
        b.assign(l1, l2, y, Expr::Const(2));
        b.skip(l2, l3);
        let cfa = Arc::new(b.build());

        let mut pb = BlockPartitionBuilder::new();
        pb.main_block("main", [l0], [l3], [x, y]);
        pb.block("f", [l1], [l2], [y]);
        let partition = Arc::new(pb.build().unwrap());

        let domain = ExplicitDomain::new(cfa, [l3]);
        let engine = BamEngine::new(domain, ExplicitReducer, partition, BamConfig::default());
        (engine, locs)
    }

    #[test]
    fn test_splices_inner_block_into_path() {
        let (mut engine, [l0, l1, l2, l3]) = engine_with_target();
        let outcome = engine
            .analyze(ExplicitState::empty(), ExplicitPrecision::coarse())
            .unwrap();
        let AnalysisOutcome::TargetReached { target } = outcome else {
            panic!("expected a target");
        };

        let view = engine.counterexample_subgraph(target).unwrap();
        let path: Vec<Location> = view.error_path().iter().map(|n| n.location).collect();
        // Root, call node, inner entry, inner exit, expanded exit, target.
        assert_eq!(path, vec![l0, l1, l1, l2, l2, l3]);
        assert!(view.target().target);
        assert_eq!(view.root().location, l0);
        // The spliced inner nodes come from a different reached set.
        let main = engine.main_reached().unwrap();
        assert!(view.error_path().iter().any(|n| n.source.set != main));
    }

    #[test]
    fn test_missing_inner_set_is_reported() {
        let (mut engine, [_, _, l2, _]) = engine_with_target();
        let AnalysisOutcome::TargetReached { target } = engine
            .analyze(ExplicitState::empty(), ExplicitPrecision::coarse())
            .unwrap()
        else {
            panic!("expected a target");
        };

        // Find the inner set through the expanded exit and destroy it.
        let main = engine.main_reached().unwrap();
        let exit = engine
            .pool()
            .expect(main)
            .iter()
            .map(|n| NodeRef::new(main, n.id()))
            .find(|r| {
                engine.data().is_expanded(*r)
                    && engine.pool().expect(main).node(r.node).location() == l2
            })
            .unwrap();
        let inner = engine.data().expansion_of(exit).unwrap().reduced.set;
        engine.pool.destroy(inner);

        match engine.counterexample_subgraph(target) {
            Err(BamError::MissingBlock { .. }) => {}
            other => panic!("expected MissingBlock, got {other:?}"),
        }
    }
}
