//! Engine error taxonomy.
//!
//! Missing-block and recursion failures are recoverable conditions the
//! enclosing fixpoint/refinement loop handles explicitly; domain errors pass
//! through untouched. Bookkeeping invariant violations are not represented
//! here — those are bugs and assert.

use crate::reached::NodeRef;
use thiserror::Error;

/// Errors surfaced by the engine. `E` is the wrapped domain's error type.
#[derive(Debug, Error)]
pub enum BamError<E>
where
    E: std::error::Error + 'static,
{
    /// A required cache entry or one of its nodes was evicted or destroyed
    /// between being referenced and being used. Recovery: drop the entry,
    /// retry from the nearest clean state.
    #[error("missing block summary between entry {entry} and exit {exit}")]
    MissingBlock { entry: NodeRef, exit: NodeRef },

    /// A nested block analysis failed. The original cause is preserved and
    /// annotated with the recursion depth at which it surfaced; silently
    /// treating a failed block as "no successors" would unsoundly prune
    /// the program.
    #[error("nested block analysis failed at depth {depth}")]
    RecursiveAnalysis {
        depth: usize,
        #[source]
        source: Box<BamError<E>>,
    },

    /// An external shutdown request aborted the analysis. Nothing partial
    /// was committed to the cache as finished.
    #[error("analysis interrupted: {reason}")]
    Interrupted { reason: String },

    /// Error from the wrapped domain's transfer or precision adjustment.
    #[error("domain error")]
    Domain(#[from] E),
}

impl<E> BamError<E>
where
    E: std::error::Error + 'static,
{
    /// Wrap an error that crossed a block boundary with the depth it
    /// surfaced at. Already-wrapped errors keep their innermost depth.
    pub fn at_depth(self, depth: usize) -> Self {
        match self {
            BamError::RecursiveAnalysis { .. } | BamError::Interrupted { .. } => self,
            other => BamError::RecursiveAnalysis {
                depth,
                source: Box::new(other),
            },
        }
    }
}

pub type BamResult<T, E> = Result<T, BamError<E>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reached::{NodeId, NodeRef, ReachedSetId};

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_at_depth_wraps_once() {
        let e: BamError<Boom> = BamError::Domain(Boom);
        let wrapped = e.at_depth(3);
        let rewrapped = wrapped.at_depth(5);
        match rewrapped {
            BamError::RecursiveAnalysis { depth, .. } => assert_eq!(depth, 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_interrupted_not_wrapped() {
        let e: BamError<Boom> = BamError::Interrupted {
            reason: "test".into(),
        };
        assert!(matches!(e.at_depth(2), BamError::Interrupted { .. }));
    }

    #[test]
    fn test_missing_block_display() {
        let e: BamError<Boom> = BamError::MissingBlock {
            entry: NodeRef::new(ReachedSetId::from_index(0), NodeId::from_index(1)),
            exit: NodeRef::new(ReachedSetId::from_index(2), NodeId::from_index(3)),
        };
        let msg = e.to_string();
        assert!(msg.contains("missing block summary"));
    }
}
