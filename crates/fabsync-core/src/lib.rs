//! Fabsync Core - Registry and bookkeeping for cross-fabric device sync
//!
//! This crate provides the foundational pieces of the fabric-sync admin:
//! - Synced device registry keyed by (node id, endpoint id)
//! - Monotonic node id allocation for newly admitted devices
//! - Remote bridge link state
//! - Correlation of in-flight commissioning-approval requests
//! - Parts-list diffing against the bridge's reported endpoint set
//! - Durable admin state (last used node id, bridge node id)

pub mod allocator;
pub mod bridge;
pub mod correlator;
pub mod device;
pub mod partslist;
pub mod store;

pub use allocator::{AllocatorError, NodeIdAllocator};
pub use bridge::BridgeLink;
pub use correlator::{Correlation, CorrelatorError, RequestCorrelator, RESPONSE_TIMEOUT};
pub use device::{DeviceRegistry, SyncedDevice};
pub use partslist::{PartsChange, PartsListTracker};
pub use store::{AdminStore, PersistedState, StoreError};

/// Operational node identifier on a fabric.
pub type NodeId = u64;

/// Endpoint identifier within a node.
pub type EndpointId = u16;
