//! Cluster objects the claim reconciler reads and writes
//!
//! Volumes are keyed by (ID, namespace). Claims on a volume are keyed by
//! allocation ID; past claims from job deregistration carry an empty
//! allocation ID.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How an allocation uses a volume, or a request to stop using it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimMode {
    Read,
    Write,
    Release,
}

/// Detachment progress of a claim. Ordering follows the pipeline, so a
/// claim may only move to a state that compares greater or equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    Taken,
    NodeUnpublishing,
    NodeDetached,
    ControllerUnpublishing,
    ReadyToFree,
}

impl ClaimState {
    /// Node-side work is finished for this claim.
    pub fn past_node_detach(&self) -> bool {
        *self >= ClaimState::NodeDetached
    }
}

impl std::fmt::Display for ClaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimState::Taken => write!(f, "taken"),
            ClaimState::NodeUnpublishing => write!(f, "node-unpublishing"),
            ClaimState::NodeDetached => write!(f, "node-detached"),
            ClaimState::ControllerUnpublishing => write!(f, "controller-unpublishing"),
            ClaimState::ReadyToFree => write!(f, "ready-to-free"),
        }
    }
}

/// An allocation's use of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Empty for claims written by job deregistration
    pub allocation_id: String,
    pub node_id: String,
    /// Node ID as reported by the storage plugin
    #[serde(default)]
    pub external_node_id: String,
    pub mode: ClaimMode,
    pub state: ClaimState,
}

impl Claim {
    pub fn new(allocation_id: impl Into<String>, node_id: impl Into<String>, mode: ClaimMode) -> Self {
        Self {
            allocation_id: allocation_id.into(),
            node_id: node_id.into(),
            external_node_id: String::new(),
            mode,
            state: ClaimState::Taken,
        }
    }

    /// Release request carrying no allocation or node, as job deregistration writes.
    pub fn job_release() -> Self {
        Self::new("", "", ClaimMode::Release)
    }

    pub fn with_state(mut self, state: ClaimState) -> Self {
        self.state = state;
        self
    }
}

/// A claim update addressed to one volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub volume_id: String,
    pub namespace: String,
    pub claim: Claim,
}

impl ClaimRequest {
    /// De-duplication key inside a write batch
    pub fn batch_key(&self) -> (String, String, String) {
        (
            self.volume_id.clone(),
            self.namespace.clone(),
            self.claim.allocation_id.clone(),
        )
    }
}

/// Externally attached storage volume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub namespace: String,
    /// Volume ID known to the storage provider
    pub external_id: String,
    pub plugin_id: String,
    pub schedulable: bool,
    /// The plugin needs a controller unpublish after node detach
    pub controller_required: bool,
    #[serde(default)]
    pub read_claims: HashMap<String, Claim>,
    #[serde(default)]
    pub write_claims: HashMap<String, Claim>,
    #[serde(default)]
    pub past_claims: HashMap<String, Claim>,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Volume {
    pub fn key(&self) -> String {
        crate::common::volume_key(&self.id, &self.namespace)
    }

    /// Any claim at all, active or past.
    pub fn has_claims(&self) -> bool {
        !self.read_claims.is_empty() || !self.write_claims.is_empty() || !self.past_claims.is_empty()
    }

    /// Live read or write claims block deregistration.
    pub fn in_use(&self) -> bool {
        !self.read_claims.is_empty() || !self.write_claims.is_empty()
    }

    /// Current read and write claims
    pub fn active_claims(&self) -> impl Iterator<Item = &Claim> {
        self.read_claims.values().chain(self.write_claims.values())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocClientStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
}

/// A scheduled unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub namespace: String,
    pub job_id: String,
    pub node_id: String,
    pub client_status: AllocClientStatus,
    /// Set by the scheduler when the allocation must stop
    #[serde(default)]
    pub desired_stop: bool,
}

impl Allocation {
    pub fn is_terminal(&self) -> bool {
        self.desired_stop
            || matches!(
                self.client_status,
                AllocClientStatus::Complete | AllocClientStatus::Failed | AllocClientStatus::Lost
            )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub namespace: String,
    #[serde(default)]
    pub stop: bool,
}

/// Cluster node with the plugin node IDs it fingerprinted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    /// plugin ID → external node ID
    #[serde(default)]
    pub plugin_node_ids: HashMap<String, String>,
}
