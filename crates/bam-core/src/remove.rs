//! Subtree removal for refinement.
//!
//! A refuted counterexample names a node in the outermost reached set.
//! Removal follows its expansion chain down through every nested block
//! instance, cuts the corresponding subtree at each level, installs the
//! refined precision according to the configured policy, and invalidates
//! the affected cache entries either in place or on a copy. Aggressive
//! refinement additionally walks the rest of the counterexample path first
//! and aliases every cached instance it crosses under the refined
//! precision, so the next pass gets exact hits along the whole path.

use crate::cache::CacheKey;
use crate::config::{RefinePolicy, RemovalStrategy};
use crate::driver::BamEngine;
use crate::reached::{NodeId, NodeRef, ReachedSetId};
use ahash::AHashSet;
use bam_domain::{AbstractDomain, Reducer};
use tracing::debug;

impl<D: AbstractDomain, R: Reducer<D>> BamEngine<D, R> {
    /// Remove the subtree rooted at `node` from its reached set and from
    /// every nested block instance it expands, re-waitlisting the cut
    /// points. `precision` is the refined precision for the outermost
    /// level; inner levels receive it reduced through their blocks.
    /// Exploration resumes with [`BamEngine::resume`].
    pub fn remove_subtree(&mut self, node: NodeRef, precision: D::Precision) {
        // Expansion chain, outermost first.
        let mut chain = vec![node];
        let mut current = node;
        while let Some(info) = self.data.expansion_of(current) {
            current = info.reduced;
            chain.push(current);
        }
        debug!(node = %node, levels = chain.len(), "removing counterexample subtree");

        // Refined precision at each level of the chain.
        let partition = self.partition.clone();
        let mut precisions = Vec::with_capacity(chain.len());
        precisions.push(precision);
        for inner in &chain[1..] {
            let block_id = self.pool.expect(inner.set).block();
            let block = partition.block(block_id);
            let above = precisions.last().unwrap();
            precisions.push(self.reducer.reduce_precision(above, block));
        }

        // Aggressive pre-pass over the rest of the counterexample path,
        // before the cut destroys it. Chain instances are handled after
        // their cut instead, so their refined keys share the cut set.
        if self.config.aggressive_refinement {
            let chain_sets: AHashSet<ReachedSetId> = chain.iter().map(|r| r.set).collect();
            self.alias_on_path(node, precisions[0].clone(), &chain_sets);
        }

        // Innermost first, so outer levels see patched bookkeeping.
        let innermost = chain.len() - 1;
        for level in (0..chain.len()).rev() {
            let install = match self.config.refine_policy {
                RefinePolicy::AllOnPath => Some(precisions[level].clone()),
                RefinePolicy::InnermostOnly if level == innermost => {
                    Some(precisions[level].clone())
                }
                RefinePolicy::InnermostOnly => None,
            };
            let alias = self
                .config
                .aggressive_refinement
                .then(|| precisions[level].clone());
            self.remove_at_level(chain[level], install, alias);
        }
        self.stats.subtrees_removed += 1;
    }

    /// Cut one level of the chain. Uncached sets (the outermost one,
    /// uncacheable entries) are always mutated in place; cached sets follow
    /// the configured strategy.
    fn remove_at_level(
        &mut self,
        target: NodeRef,
        install: Option<D::Precision>,
        alias: Option<D::Precision>,
    ) {
        if !self
            .pool
            .get(target.set)
            .map(|s| s.contains(target.node))
            .unwrap_or(false)
        {
            // Already cut by an overlapping removal at an inner level.
            return;
        }
        let key: Option<CacheKey<D>> = self.cache.key_for_reached(target.set).cloned();
        let strategy = match key {
            Some(_) => self.config.removal_strategy,
            None => RemovalStrategy::InPlace,
        };
        // Under AllOnPath the caller re-enters with the refined precision,
        // so the entry moves to the refined key and the re-entry resumes
        // the cut set. Under InnermostOnly the caller keeps its old
        // precision and the old key must survive for that partial hit.
        let rekey = match self.config.refine_policy {
            RefinePolicy::AllOnPath => install.clone(),
            RefinePolicy::InnermostOnly => None,
        };
        match strategy {
            RemovalStrategy::InPlace => {
                let removed = self.pool.expect_mut(target.set).remove_subtree(target.node);
                for id in &removed.removed {
                    self.data.forget_node(NodeRef::new(target.set, *id));
                }
                if let Some(precision) = install {
                    self.install_precision(target, &removed.readded, precision);
                }
                if let Some(key) = &key {
                    self.cache.reopen(key);
                    if let Some(precision) = rekey {
                        self.cache.update_precision(key, precision);
                    } else if let Some(precision) = alias {
                        self.cache.alias_with_precision(key, precision);
                    }
                }
            }
            RemovalStrategy::CopyOnWrite => {
                let key = key.expect("copy-on-write removal of an uncached set");
                let (copy, removed) = self
                    .pool
                    .expect(target.set)
                    .copy_without_subtree(target.node);
                let new_set = self.pool.insert_copy(copy);
                let dead: AHashSet<NodeId> = removed.removed.iter().copied().collect();
                self.data
                    .remap_reached(target.set, new_set, |n| !dead.contains(&n));
                if let Some(precision) = install {
                    self.install_precision(
                        NodeRef::new(new_set, target.node),
                        &removed.readded,
                        precision,
                    );
                }
                self.cache.swap_reached(&key, new_set);
                if let Some(precision) = rekey {
                    self.cache.update_precision(&key, precision);
                } else if let Some(precision) = alias {
                    self.cache.alias_with_precision(&key, precision);
                }
            }
        }
    }

    /// Aggressive pre-pass: walk the counterexample path backwards from the
    /// cut node, descending into every nested instance it crosses, and
    /// insert open refined-precision aliases for the cached ones so the next
    /// pass gets exact hits. Sets in `skip` are cut afterwards and alias
    /// through [`BamEngine::remove_at_level`] instead.
    fn alias_on_path(
        &mut self,
        from: NodeRef,
        precision: D::Precision,
        skip: &AHashSet<ReachedSetId>,
    ) {
        let partition = self.partition.clone();
        let mut work = vec![(from, precision)];
        while let Some((start, precision)) = work.pop() {
            let mut current = Some(start.node);
            while let Some(id) = current {
                let here = NodeRef::new(start.set, id);
                if let Some(info) = self.data.expansion_of(here) {
                    let inner = info.reduced;
                    let block_id = self.pool.expect(inner.set).block();
                    let reduced = self
                        .reducer
                        .reduce_precision(&precision, partition.block(block_id));
                    if !skip.contains(&inner.set) {
                        if let Some(key) = self.cache.key_for_reached(inner.set).cloned() {
                            self.cache.alias_with_precision(&key, reduced.clone());
                        }
                    }
                    work.push((inner, reduced));
                }
                current = self
                    .pool
                    .expect(start.set)
                    .node(id)
                    .parents()
                    .iter()
                    .copied()
                    .min();
            }
        }
    }

    /// Install a refined precision on the nodes re-waitlisted by a cut, so
    /// re-exploration runs under it.
    fn install_precision(&mut self, at: NodeRef, readded: &[NodeId], precision: D::Precision) {
        let set = self.pool.expect_mut(at.set);
        for id in readded {
            if set.contains(*id) {
                set.node_mut(*id).set_precision(precision.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BamConfig;
    use crate::driver::AnalysisOutcome;
    use bam_cfa::{BlockPartitionBuilder, CfaBuilder, Expr, Location, VarId};
    use bam_domain::{ExplicitDomain, ExplicitPrecision, ExplicitReducer, ExplicitState};
    use std::sync::Arc;

    type Engine = BamEngine<ExplicitDomain, ExplicitReducer>;

    /// main: l0 -> l1 [call f] ... l2 -> l3; f: l1 --y:=2--> l2.
    fn call_program(config: BamConfig) -> (Engine, VarId, [Location; 4]) {
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

        let domain = ExplicitDomain::new(cfa, []);
        let engine = BamEngine::new(domain, ExplicitReducer, partition, config);
        (engine, y, locs)
    }

    fn expanded_exit(engine: &Engine, loc: Location) -> NodeRef {
        let main = engine.main_reached().unwrap();
        let set = engine.pool().expect(main);
        set.iter()
            .map(|n| NodeRef::new(main, n.id()))
            .find(|r| {
                engine.data().is_expanded(*r)
                    && engine.pool().expect(main).node(r.node).location() == loc
            })
            .expect("no expanded node at location")
    }

    #[test]
    fn test_in_place_removal_rekeys_and_resumes_entry() {
        let config = BamConfig {
            refine_policy: RefinePolicy::AllOnPath,
            ..BamConfig::default()
        };
        let (mut engine, y, [_, _, l2, l3]) = call_program(config);
        let outcome = engine
            .analyze(ExplicitState::empty(), ExplicitPrecision::coarse())
            .unwrap();
        assert_eq!(outcome, AnalysisOutcome::Safe);

        let exit = expanded_exit(&engine, l2);
        let inner = engine.data().expansion_of(exit).unwrap().reduced;
        let inner_set = inner.set;
        let key = engine.cache().key_for_reached(inner_set).cloned().unwrap();

        engine.remove_subtree(exit, ExplicitPrecision::tracking([y]));

        // Outer cut: the expanded exit and everything after it is gone.
        let main = engine.main_reached().unwrap();
        assert!(!engine.pool().expect(main).contains(exit.node));
        assert!(engine
            .pool()
            .expect(main)
            .iter()
            .all(|n| n.location() != l3));
        // Inner cut: the cached set lost its exit, and the entry moved to
        // the refined key, reopened, so the refined re-entry resumes it.
        assert!(!engine.pool().expect(inner_set).contains(inner.node));
        assert!(engine.cache().entry(&key).is_none());
        let refined_key = key.with_precision(ExplicitPrecision::tracking([y]));
        assert!(!engine.cache().entry(&refined_key).unwrap().is_finished());
        assert_eq!(engine.stats().subtrees_removed, 1);

        // The refined precision is installed on the re-waitlisted cut
        // points, and re-exploration resumes the cut set instead of
        // analyzing from scratch.
        let outcome = engine.resume().unwrap();
        assert_eq!(outcome, AnalysisOutcome::Safe);
        assert_eq!(engine.stats().cache_partial_hits, 1);
        let refined = engine
            .pool()
            .expect(main)
            .iter()
            .find(|n| n.location() == l3)
            .unwrap();
        assert_eq!(refined.state().get(y), Some(2));
    }

    #[test]
    fn test_copy_on_write_leaves_original_untouched() {
        let config = BamConfig {
            refine_policy: RefinePolicy::AllOnPath,
            removal_strategy: RemovalStrategy::CopyOnWrite,
            ..BamConfig::default()
        };
        let (mut engine, y, [_, _, l2, _]) = call_program(config);
        engine
            .analyze(ExplicitState::empty(), ExplicitPrecision::coarse())
            .unwrap();

        let exit = expanded_exit(&engine, l2);
        let inner = engine.data().expansion_of(exit).unwrap().reduced;
        let old_set = inner.set;
        let key = engine.cache().key_for_reached(old_set).cloned().unwrap();

        engine.remove_subtree(exit, ExplicitPrecision::tracking([y]));

        // The refined key now points at a copy; the original set keeps its
        // nodes and the coarse key is retired.
        let refined_key = key.with_precision(ExplicitPrecision::tracking([y]));
        let new_set = engine.cache().entry(&refined_key).unwrap().reached();
        assert_ne!(new_set, old_set);
        assert!(engine.cache().entry(&key).is_none());
        assert!(engine.pool().expect(old_set).contains(inner.node));
        assert!(!engine.pool().expect(new_set).contains(inner.node));
        // Bookkeeping was remapped off the original set.
        assert!(engine.cache().key_for_reached(old_set).is_none());

        assert_eq!(engine.resume().unwrap(), AnalysisOutcome::Safe);
    }

    #[test]
    fn test_innermost_only_keeps_outer_precision() {
        let config = BamConfig {
            refine_policy: RefinePolicy::InnermostOnly,
            ..BamConfig::default()
        };
        let (mut engine, y, [_, l1, l2, _]) = call_program(config);
        engine
            .analyze(ExplicitState::empty(), ExplicitPrecision::coarse())
            .unwrap();

        let exit = expanded_exit(&engine, l2);
        let inner = engine.data().expansion_of(exit).unwrap().reduced;
        let inner_set = inner.set;
        engine.remove_subtree(exit, ExplicitPrecision::tracking([y]));

        // Outer cut point re-waitlisted with its old coarse precision.
        let main = engine.main_reached().unwrap();
        let call_node = engine
            .pool()
            .expect(main)
            .iter()
            .find(|n| n.location() == l1)
            .unwrap();
        assert_eq!(call_node.precision(), &ExplicitPrecision::coarse());
        // Inner cut point got the reduced refined precision.
        let root = engine.pool().expect(inner_set).root();
        assert_eq!(
            engine.pool().expect(inner_set).node(root).precision(),
            &ExplicitPrecision::tracking([y])
        );
    }

    #[test]
    fn test_aggressive_refinement_aliases_refined_keys() {
        let config = BamConfig {
            aggressive_caching: true,
            aggressive_refinement: true,
            refine_policy: RefinePolicy::InnermostOnly,
            ..BamConfig::default()
        };
        let (mut engine, y, [_, _, l2, _]) = call_program(config);
        engine
            .analyze(ExplicitState::empty(), ExplicitPrecision::coarse())
            .unwrap();

        let exit = expanded_exit(&engine, l2);
        let inner = engine.data().expansion_of(exit).unwrap().reduced;
        let key = engine.cache().key_for_reached(inner.set).cloned().unwrap();
        engine.remove_subtree(exit, ExplicitPrecision::tracking([y]));

        // The refined key exists as an open alias of the cut entry; the
        // coarse key survives for the caller's unchanged re-entry.
        let refined_key = key.with_precision(ExplicitPrecision::tracking([y]));
        let alias = engine.cache().entry(&refined_key).expect("alias missing");
        assert!(!alias.is_finished());
        assert_eq!(alias.reached(), engine.cache().entry(&key).unwrap().reached());

        assert_eq!(engine.resume().unwrap(), AnalysisOutcome::Safe);
        // The resumed pass hit the coarse key exactly, not approximately.
        assert_eq!(engine.stats().cache_aggressive_hits, 0);
    }

    /// main: l0 --x:=1--> [call f] l1..l2 --x:=2--> [call f] l3..l4 -->
    /// l5, with distinct entry states so each call site gets its own
    /// cache entry. Refining at the second call must also pre-install a
    /// refined alias for the first instance, which sits on the
    /// counterexample path but not on the removed expansion chain.
    #[test]
    fn test_aggressive_refinement_aliases_instances_along_path() {
        let mut b = CfaBuilder::new();
        let [l0, l1, l2, l3, l4, l5] = b.locations();
        let x = b.var("x");
        let y = b.var("y");
        b.assign(l0, l1, x, Expr::Const(1));
        b.assign(l1, l2, y, Expr::Const(2));
        b.assign(l2, l3, x, Expr::Const(2));
        b.assign(l3, l4, y, Expr::Const(3));
        b.skip(l4, l5);
        let cfa = Arc::new(b.build());

        let mut pb = BlockPartitionBuilder::new();
        pb.main_block("main", [l0], [l5], [x, y]);
        pb.block("f", [l1, l3], [l2, l4], [x, y]);
        let partition = Arc::new(pb.build().unwrap());

        let config = BamConfig {
            aggressive_refinement: true,
            ..BamConfig::default()
        };
        let domain = ExplicitDomain::new(cfa, []);
        let mut engine: Engine = BamEngine::new(domain, ExplicitReducer, partition, config);
        engine
            .analyze(ExplicitState::empty(), ExplicitPrecision::tracking([x]))
            .unwrap();

        let first = expanded_exit(&engine, l2);
        let first_inner = engine.data().expansion_of(first).unwrap().reduced;
        let first_key = engine
            .cache()
            .key_for_reached(first_inner.set)
            .cloned()
            .unwrap();
        let refined_key = first_key.with_precision(ExplicitPrecision::tracking([x, y]));
        assert!(engine.cache().entry(&refined_key).is_none());

        let second = expanded_exit(&engine, l4);
        engine.remove_subtree(second, ExplicitPrecision::tracking([x, y]));

        // The first instance was not cut, but the pre-pass gave it an
        // open refined alias sharing its reached set.
        let alias = engine.cache().entry(&refined_key).expect("path alias missing");
        assert!(!alias.is_finished());
        assert_eq!(alias.reached(), first_inner.set);
        assert!(engine.cache().entry(&first_key).unwrap().is_finished());
        assert!(engine.pool().expect(first_inner.set).contains(first_inner.node));

        assert_eq!(engine.resume().unwrap(), AnalysisOutcome::Safe);
    }
}
