//! Decoded payload shapes delivered by the subscription feed
//!
//! The feed hands us structured values; the binary wire decoding happens
//! in the transport layer outside this crate.

use serde::{Deserialize, Serialize};

use crate::path::FABRIC_SYNC_CATEGORY;
use fabsync_core::EndpointId;

/// Parts-list attribute payload: the bridge's current child endpoints.
pub type PartsList = Vec<EndpointId>;

/// SupportedDeviceCategories attribute payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeviceCategories {
    pub supported_categories: u32,
}

impl DeviceCategories {
    pub fn supports_fabric_sync(&self) -> bool {
        self.supported_categories & FABRIC_SYNC_CATEGORY != 0
    }
}

/// Response payload to a RequestCommissioningApproval command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ApprovalResult {
    /// Correlation id echoed back from the request.
    pub request_id: u64,
    /// 0 means approved; anything else is a denial status.
    pub status_code: u8,
}

impl ApprovalResult {
    pub fn approved(&self) -> bool {
        self.status_code == 0
    }
}

/// Bridge-initiated request that we open a commissioning window on the
/// local fabric for one of its devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseWindowRequest {
    pub iterations: u32,
    pub timeout_secs: u16,
    pub discriminator: u16,
    pub salt: Vec<u8>,
    pub verifier: Vec<u8>,
}
