//! # PlayerKit Common Library
//!
//! Shared code for the PlayerKit composition runtime:
//! - Common error type
//! - Event types (PlayerEvent enum) and the EventBus
//! - Configuration model and loading
//! - Timestamp helpers

pub mod config;
pub mod error;
pub mod events;
pub mod time;

pub use config::{BusyMatchPolicy, PlayerKitConfig, PoolConfig};
pub use error::{Error, Result};
pub use events::{EventBus, LoadState, PlaybackState, PlayerEvent};
