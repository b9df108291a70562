//! Monotonic node id allocation for newly admitted devices

use thiserror::Error;
use tracing::debug;

use crate::NodeId;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("stale allocation: node id {node_id} is not above last used {last_used}")]
    StaleAllocation { node_id: NodeId, last_used: NodeId },
}

/// Hands out never-reused node ids, seeded from the highest id previously
/// committed. Allocation is two-phase: `peek_next` proposes a candidate and
/// `commit` records it once the device is actually paired, so an abandoned
/// admission never burns an id.
#[derive(Debug, Default)]
pub struct NodeIdAllocator {
    last_used: NodeId,
}

impl NodeIdAllocator {
    pub fn new(last_used: NodeId) -> Self {
        Self { last_used }
    }

    /// The next candidate node id. Not a commitment: the caller may abandon
    /// commissioning before the id is ever used.
    pub fn peek_next(&self) -> NodeId {
        self.last_used + 1
    }

    /// Record `node_id` as used. Fails if the id was already superseded by
    /// a later commit.
    pub fn commit(&mut self, node_id: NodeId) -> Result<(), AllocatorError> {
        if node_id <= self.last_used {
            return Err(AllocatorError::StaleAllocation {
                node_id,
                last_used: self.last_used,
            });
        }
        self.last_used = node_id;
        debug!(node_id, "Node id committed");
        Ok(())
    }

    pub fn last_used(&self) -> NodeId {
        self.last_used
    }
}
