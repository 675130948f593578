//! Spur gateway: radio protocol engine for low-power button/display nodes
//!
//! This library assigns radio addresses to battery powered field devices,
//! encodes and decodes their compact binary frames, schedules their sleep
//! intervals, and delivers display configuration with ack/retry semantics.
//! Device events are reported to a management layer as JSON records.
pub mod core;
pub mod delivery;
pub mod discovery;
pub mod display;
pub mod engine;
pub mod management;
pub mod protocol;
pub mod registry;
pub mod schedule;
pub mod util;

// Re-export commonly used items
pub use self::core::{Error, GatewayConfig, Result};
pub use self::engine::runtime::{run, InboundEvent};
pub use self::engine::{Gateway, GatewayStatus, RadioCommand};
pub use self::management::{ManagementCommand, ManagementEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
