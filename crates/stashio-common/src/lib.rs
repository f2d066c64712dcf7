//! StashIO Common - Shared types and utilities
//!
//! This crate provides the envelope and metadata types, configuration,
//! error definitions, and the clock abstraction used by the storage manager.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::StoreConfig;
pub use error::{Error, Result};
pub use types::*;
