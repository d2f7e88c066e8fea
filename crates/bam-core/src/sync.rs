//! Thread-safe wrappers around the engine.
//!
//! The engine itself is single-threaded by design; concurrent use goes
//! through one coarse lock. The one operation that must work while another
//! thread holds that lock is shutdown, so the notifier handle lives outside
//! the mutex. Independent analyses (separate engines over the same or
//! different programs) run in parallel and share block summaries through a
//! concurrent store.

use crate::cache::CacheKey;
use crate::driver::{AnalysisOutcome, BamEngine};
use crate::error::BamResult;
use crate::reached::NodeRef;
use crate::shutdown::ShutdownNotifier;
use crate::view::BamReachedSetView;
use bam_domain::{AbstractDomain, Reducer};
use dashmap::DashMap;
use rayon::prelude::*;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// A finished block analysis in transferable form: the cache key plus the
/// exit states, detached from any reached-set arena.
pub struct BlockSummary<D: AbstractDomain> {
    pub key: CacheKey<D>,
    pub exits: Vec<(bam_cfa::Location, D::State, D::Precision)>,
}

impl<D: AbstractDomain> Clone for BlockSummary<D> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            exits: self.exits.clone(),
        }
    }
}

impl<D: AbstractDomain, R: Reducer<D>> BamEngine<D, R> {
    /// Snapshot every finished cache entry as a transferable summary.
    pub fn export_summaries(&self) -> Vec<BlockSummary<D>> {
        self.cache
            .iter_finished()
            .filter_map(|(key, entry)| {
                let set = self.pool.get(entry.reached())?;
                let exits = entry
                    .exits()?
                    .iter()
                    .filter_map(|id| set.get(*id))
                    .map(|n| (n.location(), n.state().clone(), n.precision().clone()))
                    .collect();
                Some(BlockSummary {
                    key: key.clone(),
                    exits,
                })
            })
            .collect()
    }

    /// Warm-start the cache with a summary computed elsewhere. The summary
    /// is materialized as a minimal finished reached set (root plus exit
    /// nodes); existing entries win.
    pub fn import_summary(&mut self, summary: BlockSummary<D>) {
        if self.cache.contains(&summary.key) {
            return;
        }
        let block_id = summary.key.block;
        let entry_loc = {
            let block = self.partition.block(block_id);
            match block.call_nodes().next() {
                Some(loc) => loc,
                None => return,
            }
        };
        let rsid = self.pool.create(
            block_id,
            entry_loc,
            summary.key.state.clone(),
            summary.key.precision.clone(),
        );
        let set = self.pool.expect_mut(rsid);
        let root = set.root();
        let mut exit_ids = Vec::with_capacity(summary.exits.len());
        for (loc, state, precision) in summary.exits {
            exit_ids.push(set.add(loc, state, precision, Some(root)));
        }
        while set.pop_waitlist().is_some() {}
        set.set_finished(true);
        self.cache.put_reached(summary.key.clone(), rsid);
        self.cache.put_finished(&summary.key, exit_ids, None);
    }
}

/// Concurrent store of block summaries shared between engines.
pub struct SummaryStore<D: AbstractDomain> {
    entries: DashMap<CacheKey<D>, BlockSummary<D>, ahash::RandomState>,
}

impl<D: AbstractDomain> SummaryStore<D> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pull every finished summary out of an engine. First writer wins;
    /// summaries for the same key are equivalent by construction.
    pub fn absorb<R: Reducer<D>>(&self, engine: &BamEngine<D, R>) {
        for summary in engine.export_summaries() {
            self.entries.entry(summary.key.clone()).or_insert(summary);
        }
    }

    /// Seed an engine's cache with everything in the store.
    pub fn seed<R: Reducer<D>>(&self, engine: &mut BamEngine<D, R>) {
        debug!(summaries = self.entries.len(), "seeding engine from store");
        for entry in self.entries.iter() {
            engine.import_summary(entry.value().clone());
        }
    }
}

impl<D: AbstractDomain> Default for SummaryStore<D> {
    fn default() -> Self {
        Self::new()
    }
}

/// Run independent analyses in parallel, one engine per job, sharing
/// summaries through `store`. Each engine is seeded before it runs and
/// absorbed after, so later-scheduled jobs reuse earlier block results.
pub fn analyze_all<D, R>(
    jobs: Vec<(BamEngine<D, R>, D::State, D::Precision)>,
    store: &SummaryStore<D>,
) -> Vec<(BamEngine<D, R>, BamResult<AnalysisOutcome, D::Error>)>
where
    D: AbstractDomain + Send,
    R: Reducer<D> + Send,
    D::State: Send + Sync,
    D::Precision: Send + Sync,
{
    jobs.into_par_iter()
        .map(|(mut engine, state, precision)| {
            store.seed(&mut engine);
            let outcome = engine.analyze(state, precision);
            if outcome.is_ok() {
                store.absorb(&engine);
            }
            (engine, outcome)
        })
        .collect()
}

/// The coarse-lock concurrent engine: every operation takes the one lock,
/// except shutdown, which must be deliverable while an analysis holds it.
pub struct SharedBamEngine<D: AbstractDomain, R: Reducer<D>> {
    inner: Arc<Mutex<BamEngine<D, R>>>,
    shutdown: ShutdownNotifier,
}

impl<D: AbstractDomain, R: Reducer<D>> Clone for SharedBamEngine<D, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<D: AbstractDomain, R: Reducer<D>> SharedBamEngine<D, R> {
    pub fn new(engine: BamEngine<D, R>) -> Self {
        let shutdown = engine.shutdown_notifier();
        Self {
            inner: Arc::new(Mutex::new(engine)),
            shutdown,
        }
    }

    /// Direct access for compound operations. A poisoned lock is taken
    /// over: the engine has no invalid intermediate states that outlive a
    /// panic's stack frames.
    pub fn lock(&self) -> MutexGuard<'_, BamEngine<D, R>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request shutdown without taking the lock.
    pub fn request_shutdown(&self, reason: &str) {
        self.shutdown.request(reason);
    }

    pub fn analyze(
        &self,
        state: D::State,
        precision: D::Precision,
    ) -> BamResult<AnalysisOutcome, D::Error> {
        self.lock().analyze(state, precision)
    }

    pub fn resume(&self) -> BamResult<AnalysisOutcome, D::Error> {
        self.lock().resume()
    }

    pub fn remove_subtree(&self, node: NodeRef, precision: D::Precision) {
        self.lock().remove_subtree(node, precision);
    }

    /// Reconstruct a counterexample under the lock; the returned view is
    /// detached, so the lock is released before the caller inspects it.
    pub fn counterexample_subgraph(
        &self,
        target: NodeRef,
    ) -> BamResult<BamReachedSetView<D>, D::Error> {
        self.lock().counterexample_subgraph(target)
    }
}
