//! The analysis driver.
//!
//! Exploration is a worklist loop over an explicit stack of block frames
//! instead of host recursion: entering a block pushes a frame, exhausting a
//! frame's waitlist pops it and expands its exit states into the caller.
//! Nesting depth is bounded by the block structure of the program, not by
//! the host stack.
//!
//! Recursion is resolved by a fixpoint: a re-entered cache key is answered
//! with the entry's provisional summary, the consultation is recorded, and
//! whole passes are re-run until no consulted summary grew.

use crate::cache::{BlockCache, CacheKey, CacheLookup};
use crate::config::{BamConfig, SummaryMode};
use crate::data::{BamData, ExpansionInfo};
use crate::error::{BamError, BamResult};
use crate::reached::{NodeId, NodeRef, ReachedSetId, ReachedSetPool};
use crate::recursion::RecursionDependent;
use crate::shutdown::ShutdownNotifier;
use crate::stats::BamStats;
use bam_cfa::{BlockId, BlockPartition, Location};
use bam_domain::{AbstractDomain, PrecisionAdjustmentAction, Reducer};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Result of one analysis run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisOutcome {
    /// Exploration exhausted without reaching a target state.
    Safe,
    /// A target state was reached. `target` is the expanded node in the
    /// outermost reached set; the exploration stopped there.
    TargetReached { target: NodeRef },
}

/// One in-flight block analysis on the explicit stack.
struct Frame<D: AbstractDomain> {
    reached: ReachedSetId,
    block: BlockId,
    /// Cache entry being filled; `None` for the outermost frame and for
    /// uncacheable entry states.
    key: Option<CacheKey<D>>,
    /// Call node in the enclosing reached set; `None` for the outermost
    /// frame.
    caller: Option<NodeRef>,
    started: Instant,
}

/// The block-memoizing analysis engine, generic over the wrapped domain and
/// its reducer. Owns all reached sets, the cache and the bookkeeping for
/// one analysis; refinement mutates the engine in place between runs.
pub struct BamEngine<D: AbstractDomain, R: Reducer<D>> {
    pub(crate) domain: D,
    pub(crate) reducer: R,
    pub(crate) partition: Arc<BlockPartition>,
    pub(crate) config: BamConfig,
    pub(crate) shutdown: ShutdownNotifier,
    pub(crate) pool: ReachedSetPool<D>,
    pub(crate) cache: BlockCache<D>,
    pub(crate) data: BamData<D>,
    pub(crate) stats: BamStats,
    /// Cache keys of the frames currently on the stack; membership detects
    /// recursive re-entry.
    pub(crate) recursion: Vec<CacheKey<D>>,
    pub(crate) recursion_seen: bool,
    pub(crate) dependents: Vec<RecursionDependent<D>>,
    main_reached: Option<ReachedSetId>,
}

impl<D: AbstractDomain, R: Reducer<D>> BamEngine<D, R> {
    pub fn new(domain: D, reducer: R, partition: Arc<BlockPartition>, config: BamConfig) -> Self {
        let cache = BlockCache::new(config.aggressive_caching, config.proof_export);
        Self {
            domain,
            reducer,
            partition,
            config,
            shutdown: ShutdownNotifier::new(),
            pool: ReachedSetPool::new(),
            cache,
            data: BamData::new(),
            stats: BamStats::default(),
            recursion: Vec::new(),
            recursion_seen: false,
            dependents: Vec::new(),
            main_reached: None,
        }
    }

    /// Install an externally shared shutdown handle.
    pub fn with_shutdown(mut self, shutdown: ShutdownNotifier) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn domain(&self) -> &D {
        &self.domain
    }

    pub fn reducer(&self) -> &R {
        &self.reducer
    }

    pub fn partition(&self) -> &BlockPartition {
        &self.partition
    }

    pub fn config(&self) -> &BamConfig {
        &self.config
    }

    pub fn shutdown_notifier(&self) -> ShutdownNotifier {
        self.shutdown.clone()
    }

    pub fn pool(&self) -> &ReachedSetPool<D> {
        &self.pool
    }

    pub fn cache(&self) -> &BlockCache<D> {
        &self.cache
    }

    pub fn data(&self) -> &BamData<D> {
        &self.data
    }

    /// The outermost reached set, once `analyze` ran.
    pub fn main_reached(&self) -> Option<ReachedSetId> {
        self.main_reached
    }

    /// Engine counters, with the cache's own counters folded in.
    pub fn stats(&self) -> BamStats {
        let mut stats = self.stats.clone();
        let cache = self.cache.stats();
        stats.cache_exact_hits = cache.exact_hits;
        stats.cache_aggressive_hits = cache.aggressive_hits;
        stats.cache_partial_hits = cache.partial_hits;
        stats.cache_misses = cache.misses;
        stats
    }

    /// Strict-mode placeholder nodes across all reached sets.
    pub fn missing_summaries(&self) -> Vec<NodeRef> {
        self.pool
            .iter()
            .flat_map(|set| {
                set.missing_summary_nodes()
                    .into_iter()
                    .map(move |n| NodeRef::new(set.id(), n))
            })
            .collect()
    }

    /// Run the analysis from an initial state and precision at the main
    /// block's entry.
    pub fn analyze(
        &mut self,
        state: D::State,
        precision: D::Precision,
    ) -> BamResult<AnalysisOutcome, D::Error> {
        let main = self.partition.main_block();
        let block = main.id();
        let entry = main
            .call_nodes()
            .next()
            .expect("main block has no entry location");
        let rsid = self.pool.create(block, entry, state, precision);
        self.stats.nodes_created += 1;
        self.main_reached = Some(rsid);
        info!(block = %block, "starting analysis");
        self.resume()
    }

    /// Continue an interrupted or refined analysis from the waitlists left
    /// in the reached sets. `analyze` must have run first.
    pub fn resume(&mut self) -> BamResult<AnalysisOutcome, D::Error> {
        let main_rsid = self
            .main_reached
            .expect("analyze must be called before resume");
        let main_block = self.partition.main_block().id();
        loop {
            self.stats.fixpoint_passes += 1;
            self.recursion_seen = false;
            let mut frames = vec![Frame {
                reached: main_rsid,
                block: main_block,
                key: None,
                caller: None,
                started: Instant::now(),
            }];
            self.stats.max_frame_depth = self.stats.max_frame_depth.max(1);
            let result = self.run(&mut frames);
            self.recursion.clear();
            match result {
                Err(err) => {
                    self.dependents.clear();
                    return Err(err);
                }
                Ok(Some(target)) => {
                    self.dependents.clear();
                    info!(%target, "target reached");
                    return Ok(AnalysisOutcome::TargetReached { target });
                }
                Ok(None) => {
                    if !self.recursion_seen {
                        return Ok(AnalysisOutcome::Safe);
                    }
                    let stale = self.stale_dependents();
                    if stale.is_empty() {
                        debug!(
                            passes = self.stats.fixpoint_passes,
                            "recursion fixpoint reached"
                        );
                        return Ok(AnalysisOutcome::Safe);
                    }
                    debug!(stale = stale.len(), "recursive summaries grew, re-running");
                    for dep in &stale {
                        self.propagate_recursive_update(dep);
                    }
                }
            }
        }
    }

    /// The trampoline: pop waitlist entries of the top frame until it is
    /// exhausted, then fold the frame back into its caller.
    fn run(&mut self, frames: &mut Vec<Frame<D>>) -> BamResult<Option<NodeRef>, D::Error> {
        loop {
            let Some(top) = frames.last() else {
                return Ok(None);
            };
            let (rsid, block_id) = (top.reached, top.block);
            let depth = frames.len() - 1;
            if self.shutdown.should_shutdown() {
                return Err(BamError::Interrupted {
                    reason: self.shutdown.reason(),
                });
            }
            let Some(node_id) = self.pool.expect_mut(rsid).pop_waitlist() else {
                self.finish_frame(frames)
                    .map_err(|e| if depth > 0 { e.at_depth(depth) } else { e })?;
                continue;
            };
            let stepped = self
                .step(frames, rsid, block_id, node_id)
                .map_err(|e| if depth > 0 { e.at_depth(depth) } else { e })?;
            if let Some(target) = stepped {
                return Ok(Some(target));
            }
        }
    }

    /// Process one waitlist node: adjust its precision, then either stop at
    /// a block exit, descend into an entered block, or take a plain
    /// transfer step.
    fn step(
        &mut self,
        frames: &mut Vec<Frame<D>>,
        rsid: ReachedSetId,
        block_id: BlockId,
        node_id: NodeId,
    ) -> BamResult<Option<NodeRef>, D::Error> {
        {
            let node = self.pool.expect(rsid).node(node_id);
            if node.is_covered() || node.missing_summary().is_some() {
                return Ok(None);
            }
        }

        let (node_id, state, precision, action) = self.adjust_node(rsid, node_id, block_id)?;
        if action == PrecisionAdjustmentAction::Break {
            self.pool.expect_mut(rsid).node_mut(node_id).mark_target();
            return Ok(Some(self.propagate_target(frames, rsid, node_id)));
        }

        let loc = self.pool.expect(rsid).node(node_id).location();
        let partition = self.partition.clone();
        let block = partition.block(block_id);

        // Block exit: the node stays as an exit state; nothing to explore.
        if block.is_return_node(loc) {
            return Ok(None);
        }

        // Block entry. The root of the current set sits at its own block's
        // call node and must not re-enter it; any other node at a call node
        // does, including recursive re-entry of the same block.
        if let Some(entered) = partition.block_for_call_node(loc) {
            let root = self.pool.expect(rsid).root();
            if entered.id() != block_id || node_id != root {
                let entered_id = entered.id();
                return self.enter_block(frames, rsid, node_id, loc, &state, &precision, entered_id);
            }
        }

        self.plain_step(rsid, node_id, loc, &state, &precision)?;
        Ok(None)
    }

    /// Descend into a block: reduce the entry state, consult the cache, and
    /// either splice in cached exits or push a frame for a nested analysis.
    #[allow(clippy::too_many_arguments)]
    fn enter_block(
        &mut self,
        frames: &mut Vec<Frame<D>>,
        rsid: ReachedSetId,
        node_id: NodeId,
        loc: Location,
        state: &D::State,
        precision: &D::Precision,
        entered_id: BlockId,
    ) -> BamResult<Option<NodeRef>, D::Error> {
        if self.shutdown.should_shutdown() {
            return Err(BamError::Interrupted {
                reason: self.shutdown.reason(),
            });
        }
        let partition = self.partition.clone();
        let entered = partition.block(entered_id);
        let caller = NodeRef::new(rsid, node_id);

        // Entry states carrying caller-private data are analyzed without a
        // cache entry.
        if !self.reducer.cacheable(state) {
            let inner = self.pool.create(
                entered_id,
                loc,
                self.reducer.reduce_state(state, entered),
                self.reducer.reduce_precision(precision, entered),
            );
            self.stats.nodes_created += 1;
            self.data.register_call(inner, caller);
            self.push_frame(frames, inner, entered_id, None, Some(caller));
            return Ok(None);
        }

        let key = CacheKey::new(
            self.reducer.reduce_state(state, entered),
            self.reducer.reduce_precision(precision, entered),
            entered_id,
        );

        if self.recursion.contains(&key) {
            return self.recursive_summary(caller, state, precision, entered_id, &key);
        }
        if let Some(bound) = self.config.max_recursion_depth {
            let same_block = self.recursion.iter().filter(|k| k.block == entered_id).count();
            if same_block >= bound {
                warn!(
                    block = %entered_id,
                    bound, "recursion depth bound hit, dropping call"
                );
                self.stats.recursion_cutoffs += 1;
                return Ok(None);
            }
        }

        let lookup = self
            .cache
            .get(&key, |a, b| self.reducer.precision_distance(a, b));
        match lookup {
            CacheLookup::Finished { reached, exits } => {
                self.attach_exits(caller, reached, &exits, entered_id, state, precision, None)?;
                Ok(None)
            }
            CacheLookup::Approximate {
                reached,
                exits: Some(exits),
                ..
            } => {
                self.attach_exits(caller, reached, &exits, entered_id, state, precision, None)?;
                Ok(None)
            }
            CacheLookup::Approximate {
                reached,
                exits: None,
                matched_precision,
            } => {
                if self.config.summary_mode == SummaryMode::Strict {
                    self.missing_summary(caller, loc, state, precision, entered_id);
                    return Ok(None);
                }
                // Resume the closest entry; its exits complete under the
                // matched key and serve this request through the memoized
                // association.
                let resume_key = key.with_precision(matched_precision);
                self.pool.expect_mut(reached).reseed_frontier();
                self.data.register_call(reached, caller);
                self.push_frame(frames, reached, entered_id, Some(resume_key), Some(caller));
                Ok(None)
            }
            CacheLookup::Partial { reached } => {
                if self.config.summary_mode == SummaryMode::Strict {
                    self.missing_summary(caller, loc, state, precision, entered_id);
                    return Ok(None);
                }
                self.pool.expect_mut(reached).reseed_frontier();
                self.data.register_call(reached, caller);
                self.push_frame(frames, reached, entered_id, Some(key), Some(caller));
                Ok(None)
            }
            CacheLookup::Miss => {
                if self.config.summary_mode == SummaryMode::Strict {
                    self.missing_summary(caller, loc, state, precision, entered_id);
                    return Ok(None);
                }
                let inner =
                    self.pool
                        .create(entered_id, loc, key.state.clone(), key.precision.clone());
                self.stats.nodes_created += 1;
                self.cache.put_reached(key.clone(), inner);
                self.data.register_call(inner, caller);
                self.push_frame(frames, inner, entered_id, Some(key), Some(caller));
                Ok(None)
            }
        }
    }

    fn push_frame(
        &mut self,
        frames: &mut Vec<Frame<D>>,
        reached: ReachedSetId,
        block: BlockId,
        key: Option<CacheKey<D>>,
        caller: Option<NodeRef>,
    ) {
        if let Some(key) = &key {
            self.recursion.push(key.clone());
        }
        trace!(block = %block, set = ?reached, depth = frames.len(), "entering block");
        frames.push(Frame {
            reached,
            block,
            key,
            caller,
            started: Instant::now(),
        });
        self.stats.max_frame_depth = self.stats.max_frame_depth.max(frames.len());
    }

    /// Strict mode: a cache miss may not trigger analysis. Emit a typed
    /// placeholder the caller detects via [`BamEngine::missing_summaries`].
    fn missing_summary(
        &mut self,
        caller: NodeRef,
        loc: Location,
        state: &D::State,
        precision: &D::Precision,
        block: BlockId,
    ) {
        debug!(block = %block, "no summary in strict mode, emitting placeholder");
        self.stats.missing_summaries += 1;
        self.stats.nodes_created += 1;
        self.pool.expect_mut(caller.set).add_missing_summary(
            loc,
            state.clone(),
            precision.clone(),
            caller.node,
            block,
        );
    }

    /// Expand a finished (or provisional) block result into the caller set:
    /// one expanded node per exit, with coverage checked against the
    /// caller's frontier and the expansion recorded for reconstruction.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn attach_exits(
        &mut self,
        caller: NodeRef,
        inner: ReachedSetId,
        exit_ids: &[NodeId],
        block_id: BlockId,
        caller_state: &D::State,
        caller_precision: &D::Precision,
        rebuild_root: Option<&D::State>,
    ) -> BamResult<(), D::Error> {
        let partition = self.partition.clone();
        let block = partition.block(block_id);

        let mut snapshots = Vec::with_capacity(exit_ids.len());
        {
            let set = self.pool.get(inner).ok_or(BamError::MissingBlock {
                entry: caller,
                exit: NodeRef::new(
                    inner,
                    exit_ids.first().copied().unwrap_or(NodeId::from_index(0)),
                ),
            })?;
            for &exit in exit_ids {
                let node = set.get(exit).ok_or(BamError::MissingBlock {
                    entry: caller,
                    exit: NodeRef::new(inner, exit),
                })?;
                snapshots.push((
                    exit,
                    node.location(),
                    node.state().clone(),
                    node.precision().clone(),
                    node.is_target(),
                ));
            }
        }

        for (exit, exit_loc, exit_state, exit_precision, is_target) in snapshots {
            let expanded = self.reducer.expand_state(caller_state, &exit_state, block);
            let expanded_state = match rebuild_root {
                Some(root) => self
                    .reducer
                    .rebuild_after_call(root, caller_state, &expanded, exit_loc, block),
                None => expanded,
            };
            let expanded_precision =
                self.reducer
                    .expand_precision(caller_precision, &exit_precision, block);

            let coverer = {
                let set = self.pool.expect(caller.set);
                set.frontier_at(exit_loc)
                    .find(|n| self.domain.covers(n.state(), &expanded_state))
                    .map(|n| n.id())
            };
            let set = self.pool.expect_mut(caller.set);
            let new_id = match coverer {
                Some(c) => set.add_covered(
                    exit_loc,
                    expanded_state,
                    expanded_precision.clone(),
                    Some(caller.node),
                    c,
                ),
                None => set.add(
                    exit_loc,
                    expanded_state,
                    expanded_precision.clone(),
                    Some(caller.node),
                ),
            };
            if is_target {
                set.node_mut(new_id).mark_target();
            }
            self.stats.nodes_created += 1;

            let expanded_ref = NodeRef::new(caller.set, new_id);
            self.data.register_expansion(
                expanded_ref,
                ExpansionInfo {
                    reduced: NodeRef::new(inner, exit),
                    block: block_id,
                    expanded_precision,
                },
            );
            self.data
                .register_block_analysis(caller, expanded_ref, inner);
        }
        Ok(())
    }

    /// Pop the top frame: cache its exits and expand them into the caller.
    fn finish_frame(&mut self, frames: &mut Vec<Frame<D>>) -> BamResult<(), D::Error> {
        let frame = frames.pop().expect("finish_frame on empty stack");
        self.stats
            .record_block_analysis(frame.block, frame.started.elapsed());
        if let Some(key) = &frame.key {
            let popped = self.recursion.pop();
            debug_assert!(
                popped.as_ref() == Some(key),
                "recursion stack out of sync with frame stack"
            );
        }
        let partition = self.partition.clone();
        let block = partition.block(frame.block);
        let exit_ids = self.pool.expect(frame.reached).exit_nodes(block);
        self.pool.expect_mut(frame.reached).set_finished(true);
        trace!(block = %frame.block, exits = exit_ids.len(), "block analysis finished");

        if let Some(key) = &frame.key {
            let proof_root = self
                .config
                .proof_export
                .then(|| self.pool.expect(frame.reached).root());
            self.cache.put_finished(key, exit_ids.clone(), proof_root);
        }
        if let Some(caller) = frame.caller {
            let (caller_state, caller_precision) = {
                let node = self.pool.expect(caller.set).node(caller.node);
                (node.state().clone(), node.precision().clone())
            };
            self.attach_exits(
                caller,
                frame.reached,
                &exit_ids,
                frame.block,
                &caller_state,
                &caller_precision,
                None,
            )?;
        }
        Ok(())
    }

    /// Plain transfer step inside the current block: compute successors,
    /// merge into the frontier, and add what is not stopped.
    fn plain_step(
        &mut self,
        rsid: ReachedSetId,
        node_id: NodeId,
        loc: Location,
        state: &D::State,
        precision: &D::Precision,
    ) -> BamResult<(), D::Error> {
        let successors = self.domain.successors(loc, state, precision)?;
        for (succ_loc, succ_state) in successors {
            let merged: Vec<(NodeId, D::State)> = {
                let set = self.pool.expect(rsid);
                set.frontier_at(succ_loc)
                    .filter_map(|n| {
                        self.domain
                            .merge(&succ_state, n.state(), precision)
                            .filter(|m| m != n.state())
                            .map(|m| (n.id(), m))
                    })
                    .collect()
            };
            for (id, merged_state) in merged {
                let set = self.pool.expect_mut(rsid);
                set.node_mut(id).set_state(merged_state);
                set.push_waitlist(id);
            }

            let stopped = {
                let set = self.pool.expect(rsid);
                self.domain.stop(
                    &succ_state,
                    set.frontier_at(succ_loc).map(|n| n.state()),
                    precision,
                )
            };
            if stopped {
                let coverer = {
                    let set = self.pool.expect(rsid);
                    set.frontier_at(succ_loc)
                        .find(|n| self.domain.covers(n.state(), &succ_state))
                        .map(|n| n.id())
                };
                // A join-based stop may have no single coverer; the
                // successor is subsumed either way.
                if let Some(c) = coverer {
                    self.pool.expect_mut(rsid).add_covered(
                        succ_loc,
                        succ_state,
                        precision.clone(),
                        Some(node_id),
                        c,
                    );
                    self.stats.nodes_created += 1;
                }
                continue;
            }
            self.pool
                .expect_mut(rsid)
                .add(succ_loc, succ_state, precision.clone(), Some(node_id));
            self.stats.nodes_created += 1;
        }
        Ok(())
    }

    /// A target surfaced inside a nested frame. Expand it through every
    /// enclosing frame so the caller sees it in the outermost set, and stop.
    /// Cache entries of the interrupted frames stay partial.
    fn propagate_target(
        &mut self,
        frames: &[Frame<D>],
        set: ReachedSetId,
        node: NodeId,
    ) -> NodeRef {
        let partition = self.partition.clone();
        let mut current = NodeRef::new(set, node);
        for frame in frames.iter().rev() {
            let Some(caller) = frame.caller else { break };
            let block = partition.block(frame.block);
            let (loc, state, precision) = {
                let n = self.pool.expect(current.set).node(current.node);
                (n.location(), n.state().clone(), n.precision().clone())
            };
            let (caller_state, caller_precision) = {
                let n = self.pool.expect(caller.set).node(caller.node);
                (n.state().clone(), n.precision().clone())
            };
            let expanded_state = self.reducer.expand_state(&caller_state, &state, block);
            let expanded_precision =
                self.reducer
                    .expand_precision(&caller_precision, &precision, block);
            let set = self.pool.expect_mut(caller.set);
            let new_id = set.add(
                loc,
                expanded_state,
                expanded_precision.clone(),
                Some(caller.node),
            );
            set.node_mut(new_id).mark_target();
            self.stats.nodes_created += 1;

            let expanded_ref = NodeRef::new(caller.set, new_id);
            self.data.register_expansion(
                expanded_ref,
                ExpansionInfo {
                    reduced: current,
                    block: frame.block,
                    expanded_precision,
                },
            );
            self.data
                .register_block_analysis(caller, expanded_ref, frame.reached);
            current = expanded_ref;
        }
        current
    }

}
