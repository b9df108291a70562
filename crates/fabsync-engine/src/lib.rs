//! Fabsync Engine - Commissioning orchestration for cross-fabric device sync
//!
//! This crate sequences the admission of devices exposed by a remote
//! fabric bridge:
//! - Subscription routing for attribute, event, and command payloads
//! - The admission state machine (categories -> approval -> window -> pairing)
//! - Collaborator contracts for pairing, window opening, and bridge commands

pub mod engine;
pub mod path;
pub mod payload;
pub mod router;
pub mod service;

pub use engine::{AdmissionError, AdmissionOutcome, EngineConfig, SyncEngine};
pub use path::{AttributePath, ClusterId, CommandPath, EventHeader, EventPath};
pub use payload::{ApprovalResult, DeviceCategories, PartsList, ReverseWindowRequest};
pub use router::{Route, RouteKey, RouteKind, SubscriptionRouter};
pub use service::{
    BridgeClient, PairingError, PairingService, WindowError, WindowParams, WindowService,
    DEFAULT_SETUP_PIN,
};
