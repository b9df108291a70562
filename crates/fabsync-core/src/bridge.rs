//! Remote bridge link state

use tracing::info;

use crate::NodeId;

/// Identity of the remote fabric bridge, if one is paired.
///
/// Cross-fabric sync is usable exactly while a bridge is bound.
#[derive(Debug, Default)]
pub struct BridgeLink {
    remote_bridge: Option<NodeId>,
}

impl BridgeLink {
    pub fn new(remote_bridge: Option<NodeId>) -> Self {
        Self { remote_bridge }
    }

    /// Bind the remote bridge identity, replacing any previous binding.
    pub fn bind(&mut self, node_id: NodeId) {
        info!(node_id, "Remote bridge bound");
        self.remote_bridge = Some(node_id);
    }

    /// Clear the binding (bridge unpaired).
    pub fn unbind(&mut self) {
        if let Some(node_id) = self.remote_bridge.take() {
            info!(node_id, "Remote bridge unbound");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.remote_bridge.is_some()
    }

    /// Whether `node_id` is the currently bound bridge.
    pub fn is_bridge(&self, node_id: NodeId) -> bool {
        self.remote_bridge == Some(node_id)
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.remote_bridge
    }
}
