//! Memoization table for block analyses.
//!
//! Keyed by (reduced entry state, reduced precision, block). The precise
//! index is always consulted first; aggressive mode additionally indexes
//! entries ignoring precision and resolves a miss to the entry whose
//! precision is closest by the reducer's distance metric, memoizing the
//! association so the same request hits exactly next time.

use crate::reached::{NodeId, ReachedSetId};
use ahash::AHashMap;
use bam_cfa::BlockId;
use bam_domain::AbstractDomain;
use std::fmt;
use std::hash::{Hash, Hasher};
use tracing::{debug, trace};

/// Cache key: reduced entry state + reduced precision + block identity.
pub struct CacheKey<D: AbstractDomain> {
    pub state: D::State,
    pub precision: D::Precision,
    pub block: BlockId,
}

impl<D: AbstractDomain> CacheKey<D> {
    pub fn new(state: D::State, precision: D::Precision, block: BlockId) -> Self {
        Self {
            state,
            precision,
            block,
        }
    }

    /// Same state and block, different precision.
    pub fn with_precision(&self, precision: D::Precision) -> Self {
        Self {
            state: self.state.clone(),
            precision,
            block: self.block,
        }
    }
}

impl<D: AbstractDomain> Clone for CacheKey<D> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            precision: self.precision.clone(),
            block: self.block,
        }
    }
}

impl<D: AbstractDomain> PartialEq for CacheKey<D> {
    fn eq(&self, other: &Self) -> bool {
        self.block == other.block && self.state == other.state && self.precision == other.precision
    }
}

impl<D: AbstractDomain> Eq for CacheKey<D> {}

impl<D: AbstractDomain> Hash for CacheKey<D> {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.state.hash(hasher);
        self.precision.hash(hasher);
        self.block.hash(hasher);
    }
}

impl<D: AbstractDomain> fmt::Debug for CacheKey<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheKey")
            .field("block", &self.block)
            .field("state", &self.state)
            .field("precision", &self.precision)
            .finish()
    }
}

/// One memoized block analysis.
pub struct CacheEntry<D: AbstractDomain> {
    reached: ReachedSetId,
    /// Exit nodes within the reached set. Invariant: all of them are
    /// members of `reached`. After a reopen they stay behind as the
    /// provisional summary the recursion fixpoint compares against.
    exits: Option<Vec<NodeId>>,
    /// Whether the analysis behind this entry ran to completion.
    finished: bool,
    /// Proof-subtree root for proof-carrying-code export.
    proof_root: Option<NodeId>,
    _marker: std::marker::PhantomData<fn() -> D>,
}

impl<D: AbstractDomain> CacheEntry<D> {
    #[inline]
    pub fn reached(&self) -> ReachedSetId {
        self.reached
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Exit nodes: final when `is_finished`, otherwise the provisional
    /// summary left behind by a reopen.
    pub fn exits(&self) -> Option<&[NodeId]> {
        self.exits.as_deref()
    }

    pub fn proof_root(&self) -> Option<NodeId> {
        self.proof_root
    }
}

impl<D: AbstractDomain> Clone for CacheEntry<D> {
    fn clone(&self) -> Self {
        Self {
            reached: self.reached,
            exits: self.exits.clone(),
            finished: self.finished,
            proof_root: self.proof_root,
            _marker: std::marker::PhantomData,
        }
    }
}

/// Outcome of a cache lookup.
pub enum CacheLookup<D: AbstractDomain> {
    /// No entry usable for this key; a block analysis must run from scratch.
    Miss,
    /// An entry exists but its analysis never finished; resume it.
    Partial { reached: ReachedSetId },
    /// A finished entry under the exact key.
    Finished {
        reached: ReachedSetId,
        exits: Vec<NodeId>,
    },
    /// Aggressive mode: a same-state entry with the closest precision.
    /// Unfinished approximate entries are resumed with a widened waitlist.
    Approximate {
        reached: ReachedSetId,
        exits: Option<Vec<NodeId>>,
        matched_precision: D::Precision,
    },
}

/// Running cache counters, merged into the engine statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub exact_hits: u64,
    pub aggressive_hits: u64,
    pub partial_hits: u64,
    pub misses: u64,
}

/// The block-analysis cache.
pub struct BlockCache<D: AbstractDomain> {
    entries: AHashMap<CacheKey<D>, CacheEntry<D>>,
    /// Aggressive index: precisions present per (state, block).
    by_state: AHashMap<(D::State, BlockId), Vec<D::Precision>>,
    /// Memoized aggressive matches: requested key -> matched precision.
    approx_memo: AHashMap<CacheKey<D>, D::Precision>,
    /// Reverse index for refinement: which key owns a reached set.
    by_reached: AHashMap<ReachedSetId, CacheKey<D>>,
    aggressive: bool,
    /// Only maintained when proof export is enabled.
    last_analyzed: Option<CacheKey<D>>,
    track_last: bool,
    stats: CacheStats,
}

impl<D: AbstractDomain> BlockCache<D> {
    pub fn new(aggressive: bool, track_last: bool) -> Self {
        Self {
            entries: AHashMap::new(),
            by_state: AHashMap::new(),
            approx_memo: AHashMap::new(),
            by_reached: AHashMap::new(),
            aggressive,
            last_analyzed: None,
            track_last,
            stats: CacheStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// The key of the most recently looked-up entry; only maintained when
    /// proof export is enabled.
    pub fn last_analyzed(&self) -> Option<&CacheKey<D>> {
        self.last_analyzed.as_ref()
    }

    pub fn contains(&self, key: &CacheKey<D>) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entry(&self, key: &CacheKey<D>) -> Option<&CacheEntry<D>> {
        self.entries.get(key)
    }

    /// The key owning a reached set, if any. Uncacheable block entries
    /// analyze without a key.
    pub fn key_for_reached(&self, reached: ReachedSetId) -> Option<&CacheKey<D>> {
        self.by_reached.get(&reached)
    }

    /// Finished entries, for summary export.
    pub fn iter_finished(&self) -> impl Iterator<Item = (&CacheKey<D>, &CacheEntry<D>)> {
        self.entries.iter().filter(|(_, e)| e.finished)
    }

    /// Core lookup. `distance` is the reducer's precision metric, injected
    /// so the cache stays domain-agnostic.
    pub fn get(
        &mut self,
        key: &CacheKey<D>,
        distance: impl Fn(&D::Precision, &D::Precision) -> u64,
    ) -> CacheLookup<D> {
        if self.track_last {
            self.last_analyzed = Some(key.clone());
        }

        // Exact match always wins, regardless of insertion order.
        if let Some(entry) = self.entries.get(key) {
            return if entry.finished {
                self.stats.exact_hits += 1;
                trace!(block = %key.block, "cache hit (exact)");
                CacheLookup::Finished {
                    reached: entry.reached,
                    exits: entry.exits.clone().unwrap_or_default(),
                }
            } else {
                self.stats.partial_hits += 1;
                trace!(block = %key.block, "cache hit (partial)");
                CacheLookup::Partial {
                    reached: entry.reached,
                }
            };
        }

        if !self.aggressive {
            self.stats.misses += 1;
            return CacheLookup::Miss;
        }

        // Previously memoized approximate match?
        let matched = if let Some(p) = self.approx_memo.get(key) {
            Some(p.clone())
        } else {
            self.closest_precision(key, &distance)
        };

        let Some(matched) = matched else {
            self.stats.misses += 1;
            return CacheLookup::Miss;
        };

        let approx_key = key.with_precision(matched.clone());
        let Some(entry) = self.entries.get(&approx_key) else {
            // The memoized match was evicted; forget it and report a miss.
            self.approx_memo.remove(key);
            self.stats.misses += 1;
            return CacheLookup::Miss;
        };

        let exits = if entry.finished {
            Some(entry.exits.clone().unwrap_or_default())
        } else {
            None
        };
        let reached = entry.reached;
        self.approx_memo.insert(key.clone(), matched.clone());
        self.stats.aggressive_hits += 1;
        debug!(block = %key.block, "cache hit (aggressive)");
        CacheLookup::Approximate {
            reached,
            exits,
            matched_precision: matched,
        }
    }

    fn closest_precision(
        &self,
        key: &CacheKey<D>,
        distance: &impl Fn(&D::Precision, &D::Precision) -> u64,
    ) -> Option<D::Precision> {
        let candidates = self
            .by_state
            .get(&(key.state.clone(), key.block))?;
        candidates
            .iter()
            .filter(|p| {
                self.entries
                    .contains_key(&key.with_precision((*p).clone()))
            })
            .min_by_key(|p| distance(*p, &key.precision))
            .cloned()
    }

    /// Register a freshly created (still-open) block analysis.
    pub fn put_reached(&mut self, key: CacheKey<D>, reached: ReachedSetId) {
        self.by_state
            .entry((key.state.clone(), key.block))
            .or_default()
            .push(key.precision.clone());
        self.by_reached.insert(reached, key.clone());
        let prev = self.entries.insert(
            key,
            CacheEntry {
                reached,
                exits: None,
                finished: false,
                proof_root: None,
                _marker: std::marker::PhantomData,
            },
        );
        assert!(
            prev.is_none() || prev.as_ref().map(|e| e.reached) == Some(reached),
            "cache entry rebound to a different reached set without removal"
        );
    }

    /// Mark an entry finished with its exit nodes.
    pub fn put_finished(
        &mut self,
        key: &CacheKey<D>,
        exits: Vec<NodeId>,
        proof_root: Option<NodeId>,
    ) {
        let entry = self
            .entries
            .get_mut(key)
            .expect("put_finished for a key that was never registered");
        entry.exits = Some(exits);
        entry.finished = true;
        entry.proof_root = proof_root;
    }

    /// Reopen an entry so its analysis resumes. The old exits stay behind
    /// as the provisional summary consulted on recursive re-entry.
    pub fn reopen(&mut self, key: &CacheKey<D>) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.finished = false;
            entry.proof_root = None;
        }
    }

    /// Evict an entry. Memoized aggressive associations pointing at it are
    /// dropped lazily on their next lookup.
    pub fn remove(&mut self, key: &CacheKey<D>) -> Option<CacheEntry<D>> {
        let entry = self.entries.remove(key)?;
        if let Some(precisions) = self.by_state.get_mut(&(key.state.clone(), key.block)) {
            if let Some(pos) = precisions.iter().position(|p| *p == key.precision) {
                precisions.swap_remove(pos);
            }
        }
        self.by_reached.remove(&entry.reached);
        Some(entry)
    }

    /// Re-key an entry under a new precision. Subtree removal uses this
    /// under [`RefinePolicy::AllOnPath`], where the caller re-enters with
    /// the refined precision and must resume the cut set instead of missing
    /// on the retired key.
    ///
    /// [`RefinePolicy::AllOnPath`]: crate::config::RefinePolicy::AllOnPath
    pub fn update_precision(&mut self, key: &CacheKey<D>, precision: D::Precision) {
        if let Some(entry) = self.remove(key) {
            let new_key = key.with_precision(precision);
            // An open alias may already sit under the new key; the moved
            // entry replaces it.
            self.remove(&new_key);
            self.by_state
                .entry((new_key.state.clone(), new_key.block))
                .or_default()
                .push(new_key.precision.clone());
            self.by_reached.insert(entry.reached, new_key.clone());
            self.entries.insert(new_key, entry);
        }
    }

    /// Add a second key for an existing entry under a different precision,
    /// without removing the original. The alias is inserted open, so the
    /// next exact-key hit resumes the shared reached set instead of
    /// trusting exits computed under the other precision. Used by the
    /// aggressive refinement pre-pass.
    pub fn alias_with_precision(&mut self, key: &CacheKey<D>, precision: D::Precision) {
        if let Some(entry) = self.entries.get(key) {
            let alias = CacheEntry {
                reached: entry.reached,
                exits: None,
                finished: false,
                proof_root: None,
                _marker: std::marker::PhantomData,
            };
            let new_key = key.with_precision(precision);
            if self.entries.contains_key(&new_key) {
                return;
            }
            self.by_state
                .entry((new_key.state.clone(), new_key.block))
                .or_default()
                .push(new_key.precision.clone());
            self.entries.insert(new_key, alias);
        }
    }

    /// Swap the reached set an entry points at (copy-on-write removal).
    pub fn swap_reached(&mut self, key: &CacheKey<D>, new_reached: ReachedSetId) {
        let entry = self
            .entries
            .get_mut(key)
            .expect("swap_reached for unknown key");
        self.by_reached.remove(&entry.reached);
        entry.reached = new_reached;
        entry.exits = None;
        entry.finished = false;
        entry.proof_root = None;
        self.by_reached.insert(new_reached, key.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reached::NodeId;
    use bam_cfa::VarId;
    use bam_domain::{ExplicitDomain, ExplicitPrecision, ExplicitReducer, ExplicitState, Reducer};

    type D = ExplicitDomain;

    fn v(i: usize) -> VarId {
        VarId::from_index(i)
    }

    fn key(vars: &[usize]) -> CacheKey<D> {
        CacheKey::new(
            ExplicitState::from_bindings([(v(0), 1)]),
            ExplicitPrecision::tracking(vars.iter().map(|i| v(*i))),
            BlockId::from_index(0),
        )
    }

    fn dist(a: &ExplicitPrecision, b: &ExplicitPrecision) -> u64 {
        ExplicitReducer.precision_distance(a, b)
    }

    fn rs(i: usize) -> ReachedSetId {
        ReachedSetId::from_index(i)
    }

    #[test]
    fn test_round_trip() {
        let mut cache: BlockCache<D> = BlockCache::new(false, false);
        let k = key(&[0]);
        cache.put_reached(k.clone(), rs(7));
        match cache.get(&k, dist) {
            CacheLookup::Partial { reached } => assert_eq!(reached, rs(7)),
            _ => panic!("expected partial"),
        }
        cache.put_finished(&k, vec![NodeId::from_index(3)], None);
        match cache.get(&k, dist) {
            CacheLookup::Finished { reached, exits } => {
                assert_eq!(reached, rs(7));
                assert_eq!(exits, vec![NodeId::from_index(3)]);
            }
            _ => panic!("expected finished"),
        }
    }

    #[test]
    fn test_miss_without_aggressive() {
        let mut cache: BlockCache<D> = BlockCache::new(false, false);
        cache.put_reached(key(&[0]), rs(0));
        assert!(matches!(cache.get(&key(&[1]), dist), CacheLookup::Miss));
    }

    #[test]
    fn test_aggressive_picks_minimal_distance() {
        let mut cache: BlockCache<D> = BlockCache::new(true, false);
        // distance({0,1} -> {}) = 2, distance({0,1} -> {0}) = 1
        cache.put_reached(key(&[]), rs(0));
        cache.put_finished(&key(&[]), vec![], None);
        cache.put_reached(key(&[0]), rs(1));
        cache.put_finished(&key(&[0]), vec![], None);

        match cache.get(&key(&[0, 1]), dist) {
            CacheLookup::Approximate {
                reached,
                matched_precision,
                ..
            } => {
                assert_eq!(reached, rs(1));
                assert_eq!(matched_precision, ExplicitPrecision::tracking([v(0)]));
            }
            _ => panic!("expected approximate"),
        }
        // The association is memoized.
        assert_eq!(cache.stats().aggressive_hits, 1);
        let _ = cache.get(&key(&[0, 1]), dist);
        assert_eq!(cache.stats().aggressive_hits, 2);
    }

    #[test]
    fn test_exact_beats_approximate_any_insertion_order() {
        let mut cache: BlockCache<D> = BlockCache::new(true, false);
        // Approximate candidate first, exact second.
        cache.put_reached(key(&[0]), rs(0));
        cache.put_finished(&key(&[0]), vec![], None);
        cache.put_reached(key(&[0, 1]), rs(1));
        cache.put_finished(&key(&[0, 1]), vec![], None);

        match cache.get(&key(&[0, 1]), dist) {
            CacheLookup::Finished { reached, .. } => assert_eq!(reached, rs(1)),
            _ => panic!("exact entry must win"),
        }

        // Reverse order.
        let mut cache: BlockCache<D> = BlockCache::new(true, false);
        cache.put_reached(key(&[0, 1]), rs(1));
        cache.put_finished(&key(&[0, 1]), vec![], None);
        cache.put_reached(key(&[0]), rs(0));
        cache.put_finished(&key(&[0]), vec![], None);
        match cache.get(&key(&[0, 1]), dist) {
            CacheLookup::Finished { reached, .. } => assert_eq!(reached, rs(1)),
            _ => panic!("exact entry must win"),
        }
    }

    #[test]
    fn test_memoized_match_dropped_after_eviction() {
        let mut cache: BlockCache<D> = BlockCache::new(true, false);
        cache.put_reached(key(&[0]), rs(0));
        cache.put_finished(&key(&[0]), vec![], None);
        assert!(matches!(
            cache.get(&key(&[0, 1]), dist),
            CacheLookup::Approximate { .. }
        ));
        cache.remove(&key(&[0]));
        assert!(matches!(cache.get(&key(&[0, 1]), dist), CacheLookup::Miss));
    }

    #[test]
    fn test_update_precision_rekeys() {
        let mut cache: BlockCache<D> = BlockCache::new(false, false);
        let k = key(&[]);
        cache.put_reached(k.clone(), rs(4));
        cache.update_precision(&k, ExplicitPrecision::tracking([v(0)]));
        assert!(!cache.contains(&k));
        assert!(cache.contains(&key(&[0])));
        assert_eq!(
            cache.key_for_reached(rs(4)).unwrap().precision,
            ExplicitPrecision::tracking([v(0)])
        );
    }

    #[test]
    fn test_last_analyzed_only_when_tracking() {
        let mut cache: BlockCache<D> = BlockCache::new(false, false);
        let _ = cache.get(&key(&[0]), dist);
        assert!(cache.last_analyzed().is_none());

        let mut cache: BlockCache<D> = BlockCache::new(false, true);
        let _ = cache.get(&key(&[0]), dist);
        assert!(cache.last_analyzed().is_some());
    }
}
