//! Collaborator contracts for pairing, window opening, and bridge commands
//!
//! The secure-session machinery lives behind these traits; the engine only
//! sequences the calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::payload::ReverseWindowRequest;
use fabsync_core::{EndpointId, NodeId};

/// Fixed setup PIN used when no caller-supplied parameters are given.
pub const DEFAULT_SETUP_PIN: u32 = 20202021;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("pairing failed: {0}")]
    PairingFailure(String),
    #[error("unpairing failed: {0}")]
    UnpairingFailure(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    #[error("invalid commissioning window parameters: {0}")]
    InvalidParams(String),
    #[error("failed to open commissioning window: {0}")]
    WindowOpenFailure(String),
}

/// Parameters for opening a commissioning window.
///
/// An empty salt and verifier mean the collaborator derives the PAKE
/// verifier from [`DEFAULT_SETUP_PIN`]; explicit values come from the
/// operator or a reverse request off the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowParams {
    /// PBKDF iteration count for verifier derivation.
    pub iterations: u32,
    /// Seconds before the window closes again.
    pub timeout_secs: u16,
    /// Discriminator advertised while the window is open (12-bit).
    pub discriminator: u16,
    pub salt: Vec<u8>,
    pub verifier: Vec<u8>,
}

impl WindowParams {
    /// Default PIN-derivation policy used during device admission.
    pub fn pin_policy() -> Self {
        Self {
            iterations: 1000,
            timeout_secs: 300,
            discriminator: 3840,
            salt: Vec::new(),
            verifier: Vec::new(),
        }
    }

    /// Validate an externally supplied parameter set. The bridge is not
    /// trusted to send well-formed reverse requests.
    pub fn validate(&self) -> Result<(), WindowError> {
        if !(1000..=100_000).contains(&self.iterations) {
            return Err(WindowError::InvalidParams(format!(
                "iteration count {} out of range",
                self.iterations
            )));
        }
        if self.timeout_secs == 0 || self.timeout_secs > 900 {
            return Err(WindowError::InvalidParams(format!(
                "window timeout {}s out of range",
                self.timeout_secs
            )));
        }
        if self.discriminator > 0x0FFF {
            return Err(WindowError::InvalidParams(format!(
                "discriminator {} exceeds 12 bits",
                self.discriminator
            )));
        }
        if !(16..=32).contains(&self.salt.len()) {
            return Err(WindowError::InvalidParams(format!(
                "salt length {} out of range",
                self.salt.len()
            )));
        }
        if self.verifier.is_empty() {
            return Err(WindowError::InvalidParams("empty verifier".into()));
        }
        Ok(())
    }
}

impl From<ReverseWindowRequest> for WindowParams {
    fn from(request: ReverseWindowRequest) -> Self {
        Self {
            iterations: request.iterations,
            timeout_secs: request.timeout_secs,
            discriminator: request.discriminator,
            salt: request.salt,
            verifier: request.verifier,
        }
    }
}

/// Performs secure pairing and unpairing on behalf of the engine.
#[async_trait]
pub trait PairingService: Send + Sync {
    async fn pair_device(&self, node_id: NodeId, setup_pin: u32) -> Result<(), PairingError>;

    async fn unpair_device(&self, node_id: NodeId) -> Result<(), PairingError>;

    async fn pair_bridge(
        &self,
        node_id: NodeId,
        setup_pin: u32,
        host: &str,
        port: u16,
    ) -> Result<(), PairingError>;

    async fn unpair_bridge(&self) -> Result<(), PairingError>;
}

/// Opens commissioning windows locally or on a remote node.
#[async_trait]
pub trait WindowService: Send + Sync {
    async fn open_local_window(&self, params: &WindowParams) -> Result<(), WindowError>;

    /// Ask `target` to open the commissioning window for the device it
    /// exposes on `endpoint_id`.
    async fn open_remote_window(
        &self,
        target: NodeId,
        endpoint_id: EndpointId,
        params: &WindowParams,
    ) -> Result<(), WindowError>;
}

/// Outbound reads and commands to the remote bridge. Answers come back
/// asynchronously through the subscription feed.
#[async_trait]
pub trait BridgeClient: Send + Sync {
    /// Establish the subscription that delivers parts-list updates and
    /// commissioning events off the bridge.
    async fn subscribe_bridge(&self, bridge: NodeId) -> anyhow::Result<()>;

    /// Read the bridge's SupportedDeviceCategories attribute.
    async fn read_device_categories(&self, bridge: NodeId) -> anyhow::Result<()>;

    /// Send a RequestCommissioningApproval command carrying `request_id`.
    async fn request_commissioning_approval(
        &self,
        bridge: NodeId,
        request_id: u64,
        endpoint_id: EndpointId,
        response_timeout_secs: u16,
    ) -> anyhow::Result<()>;
}
