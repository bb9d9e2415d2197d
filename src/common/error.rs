//! Error types for volwatch

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === State Errors ===
    #[error("Volume not found: {namespace}/{volume_id}")]
    VolumeNotFound { volume_id: String, namespace: String },

    #[error("Allocation not found: {0}")]
    AllocNotFound(String),

    #[error("Claim rejected on {volume_id}: {reason}")]
    ClaimRejected { volume_id: String, reason: String },

    #[error("Volume in use: {0}")]
    VolumeInUse(String),

    // === Detach Errors ===
    #[error("Could not detach {volume_id} from node {node_id}: {reason}")]
    NodeDetach {
        volume_id: String,
        node_id: String,
        reason: String,
    },

    #[error("Could not detach {volume_id} from controller: {reason}")]
    ControllerDetach { volume_id: String, reason: String },

    #[error("Volume {0} already detached")]
    AlreadyDetached(String),

    #[error("No external node id for node {node_id} (plugin {plugin_id})")]
    UnknownExternalNode { node_id: String, plugin_id: String },

    // === Write Errors ===
    #[error("Claim write failed: {0}")]
    ClaimWrite(String),

    // === Lifecycle ===
    #[error("Operation cancelled")]
    Cancelled,

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NodeDetach { .. }
                | Error::ControllerDetach { .. }
                | Error::ClaimWrite(_)
                | Error::UnknownExternalNode { .. }
        )
    }

    /// The backend reported the volume as already detached.
    pub fn is_already_detached(&self) -> bool {
        matches!(self, Error::AlreadyDetached(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
