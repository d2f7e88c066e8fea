//! Control-flow automaton (CFA) and block partition.
//!
//! This crate is the program-representation side of the analysis: locations,
//! edges with simple operations, and the partition of the CFA into blocks
//! (function bodies, loops) that the engine memoizes. The engine itself only
//! consumes the partition queries; the builder here exists so tests and
//! examples can construct programs programmatically.

pub mod block;
pub mod cfa;

pub use block::{Block, BlockId, BlockPartition, BlockPartitionBuilder, PartitionError};
pub use cfa::{Cfa, CfaBuilder, CfaEdge, Cond, EdgeOp, Expr, Location, VarId};
