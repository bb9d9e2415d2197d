//! Cluster state the reconciler consumes
//!
//! `types` holds volumes, claims and the allocation/job/node records used to
//! decide whether a claim can be reaped. `store` is the indexed in-memory
//! store with a blocking change query on the volume table.

pub mod store;
pub mod types;

pub use store::StateStore;
pub use types::{
    AllocClientStatus, Allocation, Claim, ClaimMode, ClaimRequest, ClaimState, Job, Node, Volume,
};
