//! Data-only view over a reconstructed counterexample subgraph.
//!
//! Refiners inspect paths without holding references into the live arenas,
//! so the subgraph computer copies the relevant states out and keeps the
//! original [`NodeRef`]s as provenance. Removal requests made from a view
//! hand those refs back to [`crate::driver::BamEngine::remove_subtree`].

use crate::reached::NodeRef;
use bam_cfa::Location;
use bam_domain::AbstractDomain;
use std::fmt;

/// One node of a reconstructed subgraph.
pub struct ViewNode<D: AbstractDomain> {
    /// The live node this was copied from.
    pub source: NodeRef,
    pub location: Location,
    pub state: D::State,
    pub precision: D::Precision,
    pub target: bool,
    /// Indices into the owning view.
    pub parents: Vec<usize>,
    pub children: Vec<usize>,
}

impl<D: AbstractDomain> fmt::Debug for ViewNode<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewNode")
            .field("source", &self.source)
            .field("location", &self.location)
            .field("state", &self.state)
            .field("target", &self.target)
            .finish()
    }
}

/// A counterexample subgraph: the ancestor closure of a target node with
/// nested block analyses spliced in between call and return.
pub struct BamReachedSetView<D: AbstractDomain> {
    nodes: Vec<ViewNode<D>>,
    root: usize,
    target: usize,
}

impl<D: AbstractDomain> BamReachedSetView<D> {
    pub(crate) fn new(nodes: Vec<ViewNode<D>>, root: usize, target: usize) -> Self {
        Self {
            nodes,
            root,
            target,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &ViewNode<D> {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[ViewNode<D>] {
        &self.nodes
    }

    pub fn root(&self) -> &ViewNode<D> {
        &self.nodes[self.root]
    }

    pub fn target(&self) -> &ViewNode<D> {
        &self.nodes[self.target]
    }

    /// One concrete path from the root to the target, following the lowest
    /// numbered parent at joins. The subgraph is acyclic, so this always
    /// terminates at the root.
    pub fn error_path(&self) -> Vec<&ViewNode<D>> {
        let mut path = Vec::new();
        let mut current = self.target;
        loop {
            path.push(&self.nodes[current]);
            if current == self.root {
                break;
            }
            let Some(&next) = self.nodes[current].parents.iter().min() else {
                break;
            };
            current = next;
        }
        path.reverse();
        path
    }
}

impl<D: AbstractDomain> fmt::Debug for BamReachedSetView<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BamReachedSetView")
            .field("nodes", &self.nodes.len())
            .field("root", &self.root)
            .field("target", &self.target)
            .finish()
    }
}
