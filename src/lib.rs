//! # volwatch
//!
//! Leader-driven reconciliation of storage volume claims:
//! - One reaper task per volume with terminal or released claims
//! - Detach at the node, then at the storage controller, then free the claim
//! - Progress checkpointed after each step so a new leader resumes it
//! - Claim writes from all volumes coalesced into one write per window
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Coordinator (leadership hook)            │
//! │   establish → enable, revoke → disable   │
//! └───────────┬──────────────────────────────┘
//!             │
//! ┌───────────▼──────────────────────────────┐
//! │ VolumesWatcher                           │
//! │   blocking volume-table query (limited)  │
//! └──┬──────────────┬──────────────┬─────────┘
//!    │              │              │ notify
//! ┌──▼────────┐ ┌───▼───────┐ ┌────▼──────┐
//! │ vol-a     │ │ vol-b     │ │ vol-c     │   detach RPCs
//! │ watcher   │ │ watcher   │ │ watcher   │ ─────────────▶ ClaimDetacher
//! └──┬────────┘ └───┬───────┘ └────┬──────┘
//!    └──────────────┼──────────────┘
//!            ┌──────▼───────┐
//!            │ UpdateBatcher│ ─── one write per window ──▶ ClaimWriter
//!            └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Run the engine against the in-memory store with simulated terminations
//! volwatch-sim run --volumes 50 --allocs-per-volume 4
//!
//! # With a config file; VOLWATCH_* variables override it
//! VOLWATCH_WATCHER__QUERY_BURST=10 volwatch-sim run --config volwatch.toml
//! ```

pub mod common;
pub mod coordinator;
pub mod mock;
pub mod state;
pub mod volumewatcher;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::Coordinator;
pub use state::StateStore;
pub use volumewatcher::{ClaimDetacher, ClaimWriter, VolumesWatcher};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
