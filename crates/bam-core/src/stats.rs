//! In-memory analysis statistics.
//!
//! Plain counters the caller may print; nothing here is persisted and
//! nothing blocks the driver.

use ahash::AHashMap;
use bam_cfa::BlockId;
use std::fmt;
use std::time::Duration;

/// Per-block analysis counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockStats {
    /// Nested analyses run for this block (cache misses + resumes).
    pub analyses: u64,
    /// Wall time spent inside nested analyses of this block.
    pub time: Duration,
}

/// Counters for one engine run.
#[derive(Debug, Clone, Default)]
pub struct BamStats {
    /// Exact-key cache hits.
    pub cache_exact_hits: u64,
    /// Aggressive (precision-mismatched) cache hits.
    pub cache_aggressive_hits: u64,
    /// Partial hits resumed from an unfinished reached set.
    pub cache_partial_hits: u64,
    /// Full misses that triggered block analysis from scratch.
    pub cache_misses: u64,
    /// Graph nodes created across all reached sets.
    pub nodes_created: u64,
    /// Deepest simultaneous nesting of block frames.
    pub max_frame_depth: usize,
    /// Passes the recursion fixpoint driver ran (1 when no recursion).
    pub fixpoint_passes: u64,
    /// Recursive calls cut off by the unsound depth bound.
    pub recursion_cutoffs: u64,
    /// Subtrees removed during refinement.
    pub subtrees_removed: u64,
    /// Strict-mode placeholder nodes emitted.
    pub missing_summaries: u64,
    /// Per-block analysis counters.
    pub per_block: AHashMap<BlockId, BlockStats>,
}

impl BamStats {
    pub(crate) fn record_block_analysis(&mut self, block: BlockId, elapsed: Duration) {
        let entry = self.per_block.entry(block).or_default();
        entry.analyses += 1;
        entry.time += elapsed;
    }

    pub fn cache_lookups(&self) -> u64 {
        self.cache_exact_hits + self.cache_aggressive_hits + self.cache_partial_hits + self.cache_misses
    }
}

impl fmt::Display for BamStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "cache: {} exact, {} aggressive, {} partial, {} misses",
            self.cache_exact_hits,
            self.cache_aggressive_hits,
            self.cache_partial_hits,
            self.cache_misses
        )?;
        writeln!(
            f,
            "nodes: {}, max depth: {}, fixpoint passes: {}",
            self.nodes_created, self.max_frame_depth, self.fixpoint_passes
        )?;
        let mut blocks: Vec<_> = self.per_block.iter().collect();
        blocks.sort_by_key(|(id, _)| **id);
        for (id, bs) in blocks {
            writeln!(f, "  {}: {} analyses, {:?}", id, bs.analyses, bs.time)?;
        }
        Ok(())
    }
}
