//! Core types for the gateway engine
//!
//! This module contains the building blocks shared by every protocol component.

pub mod config;
pub mod error;
pub mod serde;
pub mod types;

pub use self::config::GatewayConfig;
pub use self::error::{DecodeError, Error, Result};
pub use self::types::{Address, HalfSeconds, LogicalId, UNINCLUDED_ADDRESS};

/// Version tag of the persisted registry snapshot
pub const STATE_VERSION: u32 = 1;

/// Largest frame the radio carries in one transmission (length field is one byte)
pub const MAX_FRAME_LEN: usize = u8::MAX as usize;
