//! Engine configuration.

/// Which enclosing block instances receive an updated precision during
/// subtree removal. The two policies come from divergent refinement
/// behaviors; both are preserved deliberately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefinePolicy {
    /// Only the innermost instance (the one containing the cut node) is
    /// re-inserted with the new precision.
    InnermostOnly,
    /// Every instance on the path from the cut to the outermost block is
    /// re-inserted with the new precision.
    AllOnPath,
}

/// How a subtree is physically removed from a cached reached set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalStrategy {
    /// Mutate the live reached set and cache entry directly. Unsafe when
    /// the cache entry is shared by another, unaffected caller.
    InPlace,
    /// Build a structural copy omitting the removed subtree, patch the
    /// bookkeeping to point at the copy, and swap the cache entry; the
    /// original stays untouched for other referrers.
    CopyOnWrite,
}

/// What a cache miss at a block entry does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryMode {
    /// Run a nested analysis to fill the miss (the normal mode).
    Recompute,
    /// Never recurse: emit a typed placeholder node the enclosing
    /// algorithm must detect. Used when composing with proof-checking
    /// modes where re-analysis is forbidden.
    Strict,
}

/// Configuration for one engine instance.
#[derive(Debug, Clone)]
pub struct BamConfig {
    /// Accept precision-mismatched cache entries, selecting the closest by
    /// the reducer's precision distance.
    pub aggressive_caching: bool,
    /// During refinement, additionally walk the whole counterexample path
    /// creating precise-precision cache entries ahead of the cut, so the
    /// next pass gets exact hits instead of imprecise ones.
    pub aggressive_refinement: bool,
    /// Precision installation policy during subtree removal.
    pub refine_policy: RefinePolicy,
    /// Subtree removal strategy.
    pub removal_strategy: RemovalStrategy,
    /// Cache-miss behavior at block entries.
    pub summary_mode: SummaryMode,
    /// Abort recursive block re-entry past this many same-block frames.
    /// UNSOUND: a cut-off call contributes no successors, so violations
    /// beyond the bound are missed. `None` disables the bound.
    pub max_recursion_depth: Option<usize>,
    /// Record per-entry proof-subtree roots and the last-analyzed-block
    /// pointer for proof export.
    pub proof_export: bool,
}

impl Default for BamConfig {
    fn default() -> Self {
        Self {
            aggressive_caching: false,
            aggressive_refinement: false,
            refine_policy: RefinePolicy::InnermostOnly,
            removal_strategy: RemovalStrategy::InPlace,
            summary_mode: SummaryMode::Recompute,
            max_recursion_depth: None,
            proof_export: false,
        }
    }
}
