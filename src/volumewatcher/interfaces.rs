//! Seams to the outside world: the replicated write path and the storage
//! plugin RPCs.

use crate::common::Result;
use crate::state::ClaimRequest;
use async_trait::async_trait;

/// Commits claim updates to the consistent state log.
#[async_trait]
pub trait ClaimWriter: Send + Sync {
    /// Apply all `requests` in one write and return the index it committed at.
    ///
    /// The backend applies each claim independently; an error means at least
    /// one claim in the batch was not applied.
    async fn upsert_volume_claims(&self, requests: Vec<ClaimRequest>) -> Result<u64>;
}

/// Sends detach RPCs to the storage plugin on a node or to its controller.
///
/// Both calls must be idempotent: a volume that is already detached may be
/// reported either as success or as [`crate::Error::AlreadyDetached`].
#[async_trait]
pub trait ClaimDetacher: Send + Sync {
    /// Unpublish and unstage the volume from the allocation's mount on `node_id`.
    async fn detach_at_node(&self, node_id: &str, volume_id: &str, allocation_id: &str) -> Result<()>;

    /// Unpublish the volume from the node at the storage controller.
    async fn detach_at_controller(&self, external_volume_id: &str, external_node_id: &str) -> Result<()>;
}
