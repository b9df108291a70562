//! Durable admin state
//!
//! Two integers must survive a restart: the highest node id ever committed
//! and the node id of the paired remote bridge (absent until a bridge is
//! paired). Stored as a small JSON document, written via a temp file and
//! rename so a crash mid-write never truncates the previous state.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::NodeId;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// The on-disk record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Highest node id ever committed by the allocator.
    #[serde(default)]
    pub last_used_node_id: NodeId,
    /// Node id of the paired remote bridge. `None` means no bridge has
    /// been paired yet.
    #[serde(default)]
    pub bridge_node_id: Option<NodeId>,
}

/// Loads and saves [`PersistedState`] at a fixed path.
#[derive(Debug)]
pub struct AdminStore {
    path: PathBuf,
}

impl AdminStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state. A missing file is the zero state, not an
    /// error: first run.
    pub fn load(&self) -> Result<PersistedState, StoreError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No persisted admin state, starting fresh");
            return Ok(PersistedState::default());
        }
        let data = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Persist `state`, replacing the previous record atomically.
    pub fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(state)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!(
            path = %self.path.display(),
            last_used_node_id = state.last_used_node_id,
            bridge_node_id = ?state.bridge_node_id,
            "Admin state saved"
        );
        Ok(())
    }
}
