//! End-to-end engine scenarios: memoization across call sites, the
//! refine/resume loop, the recursion fixpoint, strict summaries and
//! counterexample reconstruction across nested blocks.

use bam_cfa::{BlockId, BlockPartitionBuilder, CfaBuilder, Cond, Expr, Location};
use bam_core::{
    AnalysisOutcome, BamConfig, BamEngine, RefinePolicy, SummaryMode, SummaryStore,
};
use bam_domain::{ExplicitDomain, ExplicitPrecision, ExplicitReducer, ExplicitState};
use proptest::prelude::*;
use std::sync::Arc;

type Engine = BamEngine<ExplicitDomain, ExplicitReducer>;

/// Route engine logs through the test harness capture.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn run(engine: &mut Engine, precision: ExplicitPrecision) -> AnalysisOutcome {
    init_tracing();
    engine
        .analyze(ExplicitState::empty(), precision)
        .expect("analysis failed")
}

/// Two call contexts with different caller-only state reach the same block:
/// the second entry must be answered from the cache.
#[test]
fn test_second_call_site_hits_cache() {
    let mut b = CfaBuilder::new();
    let [l0, l1, l2, l3] = b.locations();
    let x = b.var("x");
    let y = b.var("y");
    // Two paths into the call node, differing only in x.
    b.assign(l0, l1, x, Expr::Const(1));
    b.assign(l0, l1, x, Expr::Const(7));
    // f: y := 2
    b.assign(l1, l2, y, Expr::Const(2));
    b.skip(l2, l3);
    let cfa = Arc::new(b.build());

    let mut pb = BlockPartitionBuilder::new();
    pb.main_block("main", [l0], [l3], [x, y]);
    let f = pb.block("f", [l1], [l2], [y]);
    let partition = Arc::new(pb.build().unwrap());

    let domain = ExplicitDomain::new(cfa, []);
    let mut engine = BamEngine::new(domain, ExplicitReducer, partition, BamConfig::default());
    let outcome = run(&mut engine, ExplicitPrecision::tracking([x, y]));
    assert_eq!(outcome, AnalysisOutcome::Safe);

    let stats = engine.stats();
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_exact_hits, 1);
    // f was analyzed exactly once.
    assert_eq!(stats.per_block.get(&f).map(|b| b.analyses), Some(1));

    // Both contexts see the callee effect with their own x restored.
    let main = engine.main_reached().unwrap();
    let mut exits: Vec<i64> = engine
        .pool()
        .expect(main)
        .iter()
        .filter(|n| n.location() == l3)
        .map(|n| n.state().get(x).unwrap())
        .collect();
    exits.sort_unstable();
    assert_eq!(exits, vec![1, 7]);
    assert!(engine
        .pool()
        .expect(main)
        .iter()
        .filter(|n| n.location() == l3)
        .all(|n| n.state().get(y) == Some(2)));
}

/// Coarse run reaches a spurious target; cutting back to the pivot with a
/// refined precision and resuming proves safety.
#[test]
fn test_refine_and_resume_eliminates_spurious_target() {
    let mut b = CfaBuilder::new();
    let [l0, l1, l2, l3] = b.locations();
    let x = b.var("x");
    b.assign(l0, l1, x, Expr::Const(0));
    // f: the branch to the error location is infeasible when x is tracked.
    b.assume(l1, l2, Cond::Eq(x, 1));
    b.assume(l1, l3, Cond::Ne(x, 1));
    let cfa = Arc::new(b.build());

    let mut pb = BlockPartitionBuilder::new();
    pb.main_block("main", [l0], [l3], [x]);
    pb.block("f", [l1], [l3], [x]);
    let partition = Arc::new(pb.build().unwrap());

    let domain = ExplicitDomain::new(cfa, [l2]);
    let config = BamConfig {
        refine_policy: RefinePolicy::AllOnPath,
        ..BamConfig::default()
    };
    let mut engine = BamEngine::new(domain, ExplicitReducer, partition, config);

    let AnalysisOutcome::TargetReached { target } = run(&mut engine, ExplicitPrecision::coarse())
    else {
        panic!("coarse run must reach the spurious target");
    };

    // The refiner walks the reconstructed path and cuts at the node before
    // the precision-relevant assignment took effect.
    let view = engine.counterexample_subgraph(target).unwrap();
    let main = engine.main_reached().unwrap();
    let pivot = view
        .error_path()
        .into_iter()
        .find(|n| n.source.set == main && n.location == l1)
        .expect("call node on the path")
        .source;
    engine.remove_subtree(pivot, ExplicitPrecision::tracking([x]));

    let outcome = engine.resume().expect("resumed analysis failed");
    assert_eq!(outcome, AnalysisOutcome::Safe);
    // The refined run pruned the error branch.
    assert!(engine
        .pool()
        .expect(main)
        .iter()
        .all(|n| n.location() != l2));
}

/// main calls g; g re-enters itself with the same reduced state. The first
/// pass uses an empty provisional summary, the second confirms it grew and
/// the third-pass-worth of work is avoided because the exits stabilized.
#[test]
fn test_recursion_reaches_fixpoint() {
    let mut b = CfaBuilder::new();
    let [l0, l1, l2, l3, l4] = b.locations();
    let n = b.var("n");
    b.skip(l0, l1);
    // g: if n > 0 { n := n - 1; g() } else { return }
    b.assume(l1, l3, Cond::Gt(n, 0));
    b.assign(l3, l1, n, Expr::Add(n, -1));
    b.assume(l1, l2, Cond::Le(n, 0));
    b.skip(l2, l4);
    let cfa = Arc::new(b.build());

    let mut pb = BlockPartitionBuilder::new();
    pb.main_block("main", [l0], [l4], [n]);
    let g = pb.block("g", [l1], [l2], [n]);
    let partition = Arc::new(pb.build().unwrap());

    let domain = ExplicitDomain::new(cfa, []);
    let mut engine = BamEngine::new(domain, ExplicitReducer, partition, BamConfig::default());
    // Coarse precision: n is unknown, so the recursive entry has the same
    // reduced state as the outer one.
    let outcome = run(&mut engine, ExplicitPrecision::coarse());
    assert_eq!(outcome, AnalysisOutcome::Safe);

    let stats = engine.stats();
    assert_eq!(stats.fixpoint_passes, 2);
    assert_eq!(stats.per_block.get(&g).map(|b| b.analyses), Some(2));
    // The expanded exit survived into main.
    let main = engine.main_reached().unwrap();
    assert!(engine
        .pool()
        .expect(main)
        .iter()
        .any(|node| node.location() == l4));
}

/// With a recursion depth bound and a tracked counter every re-entry has a
/// fresh cache key; the bound cuts the descent off (unsoundly) instead of
/// overflowing.
#[test]
fn test_recursion_depth_bound_cuts_off() {
    let mut b = CfaBuilder::new();
    let [l0, l1, l2, l3, l4] = b.locations();
    let n = b.var("n");
    b.assign(l0, l1, n, Expr::Const(5));
    b.assume(l1, l3, Cond::Gt(n, 0));
    b.assign(l3, l1, n, Expr::Add(n, -1));
    b.assume(l1, l2, Cond::Le(n, 0));
    b.skip(l2, l4);
    let cfa = Arc::new(b.build());

    let mut pb = BlockPartitionBuilder::new();
    pb.main_block("main", [l0], [l4], [n]);
    pb.block("g", [l1], [l2], [n]);
    let partition = Arc::new(pb.build().unwrap());

    let domain = ExplicitDomain::new(cfa, []);
    let config = BamConfig {
        max_recursion_depth: Some(2),
        ..BamConfig::default()
    };
    let mut engine = BamEngine::new(domain, ExplicitReducer, partition, config);
    let outcome = run(&mut engine, ExplicitPrecision::tracking([n]));
    assert_eq!(outcome, AnalysisOutcome::Safe);
    assert_eq!(engine.stats().recursion_cutoffs, 1);
    assert!(engine.stats().max_frame_depth <= 3);
}

/// Strict mode never recurses into a missing summary: it emits a typed
/// placeholder. Seeding the cache first makes the same run complete.
#[test]
fn test_strict_mode_placeholder_and_warm_start() {
    fn build(mode: SummaryMode) -> (Engine, BlockId, Location) {
        let mut b = CfaBuilder::new();
        let [l0, l1, l2, l3] = b.locations();
        let y = b.var("y");
        b.skip(l0, l1);
        b.assign(l1, l2, y, Expr::Const(2));
        b.skip(l2, l3);
        let cfa = Arc::new(b.build());

        let mut pb = BlockPartitionBuilder::new();
        pb.main_block("main", [l0], [l3], [y]);
        let f = pb.block("f", [l1], [l2], [y]);
        let partition = Arc::new(pb.build().unwrap());

        let domain = ExplicitDomain::new(cfa, []);
        let config = BamConfig {
            summary_mode: mode,
            ..BamConfig::default()
        };
        (
            BamEngine::new(domain, ExplicitReducer, partition, config),
            f,
            l3,
        )
    }

    // Cold strict run: the call is never expanded.
    let (mut strict, f, exit_loc) = build(SummaryMode::Strict);
    let outcome = run(&mut strict, ExplicitPrecision::coarse());
    assert_eq!(outcome, AnalysisOutcome::Safe);
    let placeholders = strict.missing_summaries();
    assert_eq!(placeholders.len(), 1);
    let main = strict.main_reached().unwrap();
    let node = strict.pool().expect(main).node(placeholders[0].node);
    assert_eq!(node.missing_summary(), Some(f));
    assert!(strict
        .pool()
        .expect(main)
        .iter()
        .all(|n| n.location() != exit_loc));

    // Warm the store from a recomputing engine, then strict completes.
    let (mut recompute, _, _) = build(SummaryMode::Recompute);
    run(&mut recompute, ExplicitPrecision::coarse());
    let store = SummaryStore::new();
    store.absorb(&recompute);

    let (mut warmed, _, _) = build(SummaryMode::Strict);
    store.seed(&mut warmed);
    let outcome = run(&mut warmed, ExplicitPrecision::coarse());
    assert_eq!(outcome, AnalysisOutcome::Safe);
    assert!(warmed.missing_summaries().is_empty());
    let main = warmed.main_reached().unwrap();
    assert!(warmed
        .pool()
        .expect(main)
        .iter()
        .any(|n| n.location() == exit_loc));
}

/// A target two blocks deep reconstructs through both splices.
#[test]
fn test_counterexample_through_two_nested_blocks() {
    let mut b = CfaBuilder::new();
    let [l0, l1, l2, l3, l4, l5, l6] = b.locations();
    let x = b.var("x");
    b.skip(l0, l1);
    b.skip(l1, l2);
    b.assign(l2, l3, x, Expr::Const(1));
    b.skip(l3, l4);
    b.skip(l4, l5);
    b.skip(l5, l6);
    let cfa = Arc::new(b.build());

    let mut pb = BlockPartitionBuilder::new();
    pb.main_block("main", [l0], [l6], [x]);
    pb.block("f", [l1], [l5], [x]);
    pb.block("g", [l2], [l4], [x]);
    let partition = Arc::new(pb.build().unwrap());

    // Error deep inside g.
    let domain = ExplicitDomain::new(cfa, [l3]);
    let mut engine = BamEngine::new(domain, ExplicitReducer, partition, BamConfig::default());
    let AnalysisOutcome::TargetReached { target } =
        run(&mut engine, ExplicitPrecision::tracking([x]))
    else {
        panic!("expected target");
    };

    let view = engine.counterexample_subgraph(target).unwrap();
    let path = view.error_path();
    let locations: Vec<Location> = path.iter().map(|n| n.location).collect();
    assert_eq!(locations, vec![l0, l1, l1, l2, l2, l3, l3, l3]);
    // Nodes along the path come from three different reached sets.
    let mut sets: Vec<_> = path.iter().map(|n| n.source.set).collect();
    sets.dedup();
    assert_eq!(sets.len(), 5); // main, f, g, f, main
    assert!(path.last().unwrap().target);
    assert_eq!(path.last().unwrap().state.get(x), Some(1));
}

proptest! {
    /// Straight-line programs over one block: exploration terminates safe
    /// and creates at most one node per location (deterministic assigns,
    /// merge-sep, coverage).
    #[test]
    fn prop_straight_line_is_safe_and_small(
        ops in proptest::collection::vec(0u8..3, 1..12),
        values in proptest::collection::vec(-5i64..5, 12),
    ) {
        let mut b = CfaBuilder::new();
        let num_locs = ops.len() + 1;
        let locs: Vec<Location> = (0..num_locs).map(|_| b.location()).collect();
        let x = b.var("x");
        for (i, op) in ops.iter().enumerate() {
            let (from, to) = (locs[i], locs[i + 1]);
            match *op {
                0 => b.skip(from, to),
                1 => b.assign(from, to, x, Expr::Const(values[i])),
                _ => b.assume(from, to, Cond::Le(x, values[i])),
            };
        }
        let cfa = Arc::new(b.build());

        let mut pb = BlockPartitionBuilder::new();
        pb.main_block("main", [locs[0]], [locs[num_locs - 1]], [x]);
        let partition = Arc::new(pb.build().unwrap());

        let domain = ExplicitDomain::new(cfa, []);
        let mut engine =
            BamEngine::new(domain, ExplicitReducer, partition, BamConfig::default());
        let outcome = engine
            .analyze(ExplicitState::empty(), ExplicitPrecision::tracking([x]))
            .unwrap();
        prop_assert_eq!(outcome, AnalysisOutcome::Safe);
        let main = engine.main_reached().unwrap();
        prop_assert!(engine.pool().expect(main).len() <= num_locs);
    }
}
