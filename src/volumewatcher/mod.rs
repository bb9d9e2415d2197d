//! Volume claim reconciliation
//!
//! - `batcher`: coalesces claim writes from all watchers into one write per window
//! - `volume_watcher`: per-volume loop that detaches and frees terminal claims
//! - `volumes_watcher`: the leader-owned set of watchers and its change subscription
//! - `interfaces`: the write path and detach RPCs the loop depends on

pub mod batcher;
pub mod interfaces;
pub mod volume_watcher;
pub mod volumes_watcher;

pub use batcher::{BatchFuture, UpdateBatcher};
pub use interfaces::{ClaimDetacher, ClaimWriter};
pub use volume_watcher::VolumeWatcher;
pub use volumes_watcher::VolumesWatcher;
