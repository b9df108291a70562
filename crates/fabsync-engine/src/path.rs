//! Concrete paths for routed attribute, event, and command payloads

use serde::{Deserialize, Serialize};

use fabsync_core::EndpointId;

pub type ClusterId = u32;

/// Descriptor cluster, carries the bridge's parts list.
pub const DESCRIPTOR_CLUSTER: ClusterId = 0x001D;
/// Descriptor PartsList attribute: child endpoints of the aggregator.
pub const PARTS_LIST_ATTRIBUTE: u32 = 0x0003;

/// Commissioner Control cluster on the remote bridge.
pub const COMMISSIONER_CONTROL_CLUSTER: ClusterId = 0x0751;
/// Bitmap of device categories the bridge can hand over.
pub const SUPPORTED_DEVICE_CATEGORIES_ATTRIBUTE: u32 = 0x0000;
/// Command whose response carries the commissioning-approval result.
pub const REQUEST_COMMISSIONING_APPROVAL_COMMAND: u32 = 0x0000;
/// Event the bridge emits to ask us to open a local commissioning window.
pub const REVERSE_OPEN_WINDOW_EVENT: u32 = 0x0000;

/// Bit in the supported-categories bitmap for fabric synchronization.
pub const FABRIC_SYNC_CATEGORY: u32 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributePath {
    pub endpoint_id: EndpointId,
    pub cluster_id: ClusterId,
    pub attribute_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandPath {
    pub endpoint_id: EndpointId,
    pub cluster_id: ClusterId,
    pub command_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventPath {
    pub endpoint_id: EndpointId,
    pub cluster_id: ClusterId,
    pub event_id: u32,
}

/// Header delivered alongside event payloads by the subscription feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    pub path: EventPath,
    /// Monotonic event number assigned by the emitting node.
    pub event_number: u64,
}
