//! Precision adjustment at node expansion time.
//!
//! Every node popped from a waitlist has its precision finalized by the
//! domain before being explored. Expanded nodes at block boundaries carry a
//! subtlety: their own stored precision may be stale after the inner block
//! was refined, so for target and block-exit nodes the precision recorded
//! in the expansion table is consulted instead.

use crate::driver::BamEngine;
use crate::error::BamResult;
use crate::reached::{NodeId, NodeRef, ReachedSetId};
use bam_cfa::BlockId;
use bam_domain::{AbstractDomain, PrecisionAdjustmentAction, Reducer};
use tracing::trace;

impl<D: AbstractDomain, R: Reducer<D>> BamEngine<D, R> {
    /// Finalize a node's state and precision before it is explored. When
    /// the domain replaces the state, the node is replaced in the graph and
    /// the bookkeeping rewritten; the new id is returned. A `Break` action
    /// means the node is a target and exploration must stop.
    pub(crate) fn adjust_node(
        &mut self,
        rsid: ReachedSetId,
        node_id: NodeId,
        block_id: BlockId,
    ) -> BamResult<(NodeId, D::State, D::Precision, PrecisionAdjustmentAction), D::Error> {
        let node_ref = NodeRef::new(rsid, node_id);
        let (loc, state, own_precision) = {
            let node = self.pool.expect(rsid).node(node_id);
            (node.location(), node.state().clone(), node.precision().clone())
        };

        let at_boundary = {
            let block = self.partition.block(block_id);
            block.is_return_node(loc) || self.domain.is_target(loc, &state)
        };
        let precision = if at_boundary {
            match self.data.expansion_of(node_ref) {
                Some(info) => info.expanded_precision.clone(),
                None => own_precision.clone(),
            }
        } else {
            own_precision.clone()
        };

        let adjusted = self.domain.adjust_precision(loc, &state, &precision)?;

        if adjusted.state != state {
            trace!(node = %node_ref, "precision adjustment replaced the state");
            let new_id = self.pool.expect_mut(rsid).replace_node(
                node_id,
                adjusted.state.clone(),
                adjusted.precision.clone(),
            );
            self.data
                .replace_node(node_ref, NodeRef::new(rsid, new_id));
            return Ok((new_id, adjusted.state, adjusted.precision, adjusted.action));
        }
        if adjusted.precision != own_precision {
            self.pool
                .expect_mut(rsid)
                .node_mut(node_id)
                .set_precision(adjusted.precision.clone());
        }
        Ok((node_id, adjusted.state, adjusted.precision, adjusted.action))
    }
}
