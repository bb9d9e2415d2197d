//! Common utilities and types shared across volwatch

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod utils;

pub use config::{Config, WatcherConfig};
pub use error::{Error, Result};
pub use ratelimit::QueryLimiter;
pub use utils::{parse_duration, volume_key};
