//! Synced device registry keyed by (node id, endpoint id)

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::{EndpointId, NodeId};

/// A remote device that has been mirrored into the local fabric.
///
/// Identity only: the node id assigned during admission and the bridge
/// endpoint the device is exposed on. Replacing a device means
/// remove-then-add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncedDevice {
    pub node_id: NodeId,
    pub endpoint_id: EndpointId,
}

impl SyncedDevice {
    pub fn new(node_id: NodeId, endpoint_id: EndpointId) -> Self {
        Self {
            node_id,
            endpoint_id,
        }
    }
}

/// Ordered set of synced devices, unique on the full (node, endpoint) key.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeSet<SyncedDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device. Idempotent: adding an existing key is a no-op since
    /// entries carry no mutable state.
    pub fn add(&mut self, device: SyncedDevice) {
        if self.devices.insert(device) {
            debug!(
                node_id = device.node_id,
                endpoint_id = device.endpoint_id,
                "Synced device added"
            );
        }
    }

    /// Remove a device if present. Removing an unknown device is not an
    /// error: the bridge may report a removal we never learned about,
    /// e.g. after a restart.
    pub fn remove(&mut self, node_id: NodeId, endpoint_id: EndpointId) {
        if self.devices.remove(&SyncedDevice::new(node_id, endpoint_id)) {
            debug!(node_id, endpoint_id, "Synced device removed");
        }
    }

    /// Look up a device by its assigned node id.
    pub fn find_by_node(&self, node_id: NodeId) -> Option<&SyncedDevice> {
        self.devices.iter().find(|d| d.node_id == node_id)
    }

    /// Look up a device by the bridge endpoint it is exposed on.
    pub fn find_by_endpoint(&self, endpoint_id: EndpointId) -> Option<&SyncedDevice> {
        self.devices.iter().find(|d| d.endpoint_id == endpoint_id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Iterate devices in (node id, endpoint id) order.
    pub fn iter(&self) -> impl Iterator<Item = &SyncedDevice> {
        self.devices.iter()
    }
}
