//! Leadership hook
//!
//! The coordinator is responsible for:
//! - Tracking whether this server is the leader
//! - Enabling the volume watcher set on leadership gain
//! - Disabling it, synchronously, on leadership loss
//! - Periodically sweeping watchers of deregistered volumes

pub mod leader;
pub mod server;

pub use leader::{LeaderRole, LeaderState};
pub use server::Coordinator;
