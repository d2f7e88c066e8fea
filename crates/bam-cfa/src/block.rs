//! Block partition: the unit of memoization.
//!
//! A block is a contiguous program region (function body, loop) described by
//! its call nodes (entries), return nodes (exits) and the variables visible
//! inside it. Blocks are produced once by the partition builder and keyed by
//! `BlockId` for cache lookups; the engine never inspects edges through this
//! interface, only membership queries.

use crate::cfa::{Location, VarId};
use smallvec::SmallVec;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use thiserror::Error;

/// Identity of a block within one partition.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn from_index(i: usize) -> Self {
        BlockId(i as u32)
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Immutable block descriptor.
#[derive(Debug, Clone)]
pub struct Block {
    id: BlockId,
    name: String,
    call_nodes: BTreeSet<Location>,
    return_nodes: BTreeSet<Location>,
    variables: BTreeSet<VarId>,
}

impl Block {
    #[inline]
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_call_node(&self, loc: Location) -> bool {
        self.call_nodes.contains(&loc)
    }

    #[inline]
    pub fn is_return_node(&self, loc: Location) -> bool {
        self.return_nodes.contains(&loc)
    }

    pub fn call_nodes(&self) -> impl Iterator<Item = Location> + '_ {
        self.call_nodes.iter().copied()
    }

    pub fn return_nodes(&self) -> impl Iterator<Item = Location> + '_ {
        self.return_nodes.iter().copied()
    }

    /// Variables visible inside the block. Reducers project states onto this
    /// set at block entry.
    pub fn variables(&self) -> &BTreeSet<VarId> {
        &self.variables
    }

    pub fn contains_variable(&self, var: VarId) -> bool {
        self.variables.contains(&var)
    }
}

/// Errors raised while assembling a partition.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("block '{0}' has no call nodes")]
    NoCallNodes(String),
    #[error("location {0} is a call node of two blocks ({1} and {2})")]
    OverlappingCallNode(Location, BlockId, BlockId),
    #[error("partition has no main block")]
    NoMainBlock,
}

/// The partition of a CFA into blocks, with the index structures the engine
/// queries on every step.
#[derive(Debug, Clone)]
pub struct BlockPartition {
    blocks: Vec<Block>,
    main: BlockId,
    call_index: HashMap<Location, BlockId>,
    return_index: HashMap<Location, SmallVec<[BlockId; 2]>>,
}

impl BlockPartition {
    /// The block covering the whole program.
    #[inline]
    pub fn main_block(&self) -> &Block {
        &self.blocks[self.main.index()]
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    /// Is this location the entry of some block?
    #[inline]
    pub fn is_call_node(&self, loc: Location) -> bool {
        self.call_index.contains_key(&loc)
    }

    /// Is this location the exit of some block?
    #[inline]
    pub fn is_return_node(&self, loc: Location) -> bool {
        self.return_index.contains_key(&loc)
    }

    /// The block entered at a call node, if any.
    #[inline]
    pub fn block_for_call_node(&self, loc: Location) -> Option<&Block> {
        self.call_index.get(&loc).map(|id| self.block(*id))
    }

    /// All blocks a return node exits. A location can close several nested
    /// blocks at once (e.g. a loop exit that is also the function exit).
    pub fn blocks_for_return_node(&self, loc: Location) -> impl Iterator<Item = &Block> {
        self.return_index
            .get(&loc)
            .into_iter()
            .flat_map(|ids| ids.iter().map(|id| self.block(*id)))
    }
}

/// Builder for block partitions. Tests and frontends declare blocks by name;
/// the last block declared with `main_block` covers the whole program.
pub struct BlockPartitionBuilder {
    blocks: Vec<Block>,
    main: Option<BlockId>,
}

impl BlockPartitionBuilder {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            main: None,
        }
    }

    /// Declare a block. Returns its id.
    pub fn block(
        &mut self,
        name: &str,
        call_nodes: impl IntoIterator<Item = Location>,
        return_nodes: impl IntoIterator<Item = Location>,
        variables: impl IntoIterator<Item = VarId>,
    ) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            id,
            name: name.to_string(),
            call_nodes: call_nodes.into_iter().collect(),
            return_nodes: return_nodes.into_iter().collect(),
            variables: variables.into_iter().collect(),
        });
        id
    }

    /// Declare the block covering the whole program. Its call node is the
    /// program entry and it is never entered through the cache.
    pub fn main_block(
        &mut self,
        name: &str,
        call_nodes: impl IntoIterator<Item = Location>,
        return_nodes: impl IntoIterator<Item = Location>,
        variables: impl IntoIterator<Item = VarId>,
    ) -> BlockId {
        let id = self.block(name, call_nodes, return_nodes, variables);
        self.main = Some(id);
        id
    }

    pub fn build(self) -> Result<BlockPartition, PartitionError> {
        let main = self.main.ok_or(PartitionError::NoMainBlock)?;

        let mut call_index = HashMap::new();
        let mut return_index: HashMap<Location, SmallVec<[BlockId; 2]>> = HashMap::new();
        for block in &self.blocks {
            if block.call_nodes.is_empty() {
                return Err(PartitionError::NoCallNodes(block.name.clone()));
            }
            for &loc in &block.call_nodes {
                // The main block's entry may coincide with an inner block's
                // call node; inner blocks win the index so the transfer
                // relation sees the boundary. Two inner blocks sharing a
                // call node is a frontend bug.
                if block.id == main {
                    call_index.entry(loc).or_insert(block.id);
                } else if let Some(&prev) = call_index.get(&loc) {
                    if prev != main {
                        return Err(PartitionError::OverlappingCallNode(loc, prev, block.id));
                    }
                    call_index.insert(loc, block.id);
                } else {
                    call_index.insert(loc, block.id);
                }
            }
            for &loc in &block.return_nodes {
                return_index.entry(loc).or_default().push(block.id);
            }
        }

        Ok(BlockPartition {
            blocks: self.blocks,
            main,
            call_index,
            return_index,
        })
    }
}

impl Default for BlockPartitionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
