//! Block-memoizing analysis engine.
//!
//! Reachability analysis over a block-partitioned program: every block
//! entry reduces the caller's state to the block's view, analyzes the
//! block in its own reached set (memoized by reduced state, reduced
//! precision and block), and expands the exit states back into the caller.
//! Recursion is handled by a fixpoint over provisional summaries,
//! refinement by subtree removal along expansion chains, and
//! counterexamples by backward reconstruction across the cached pieces.
//!
//! The engine is generic over the wrapped abstract domain and its reducer;
//! see the `bam-domain` crate for the contracts and the explicit-value
//! reference domain.

pub mod cache;
pub mod config;
pub mod data;
pub mod driver;
pub mod error;
mod precision;
pub mod reached;
mod recursion;
mod remove;
pub mod shutdown;
pub mod stats;
mod subgraph;
pub mod sync;
pub mod view;

pub use cache::{BlockCache, CacheEntry, CacheKey, CacheLookup, CacheStats};
pub use config::{BamConfig, RefinePolicy, RemovalStrategy, SummaryMode};
pub use data::{BamData, ExpansionInfo};
pub use driver::{AnalysisOutcome, BamEngine};
pub use error::{BamError, BamResult};
pub use reached::{
    Node, NodeId, NodeRef, ReachedSet, ReachedSetId, ReachedSetPool, RemovedSubtree,
};
pub use shutdown::ShutdownNotifier;
pub use stats::{BamStats, BlockStats};
pub use sync::{analyze_all, BlockSummary, SharedBamEngine, SummaryStore};
pub use view::{BamReachedSetView, ViewNode};
