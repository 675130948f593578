//! Scheduling module
//!
//! This module chooses node sleep intervals and holds the engine's deferred
//! actions on a single logical clock.

pub mod timer;
pub mod wakeup;

pub use self::timer::TimerQueue;
pub use self::wakeup::{WakeupDecision, WakeupScheduler};
