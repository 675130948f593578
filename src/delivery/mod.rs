//! Outbound delivery module
//!
//! This module queues radio frames, paces them into transmission windows,
//! and tracks acknowledgements and retries per destination.

pub mod cadence;
pub mod queue;

pub use self::cadence::BeaconCadence;
pub use self::queue::{AckOutcome, DeliveryPolicy, DeliveryQueue, DrainReport, OutboundMessage};
