//! Display and configuration encoding module
//!
//! This module parses config pushes from the management layer, merges partial
//! updates, and encodes them into the segment format the display firmware reads.

pub mod charset;
pub mod encoder;
pub mod layout;
pub mod request;

pub use self::encoder::{ConfigFrame, DisplayConfigEncoder, EncodedConfig};
pub use self::request::{ConfigFields, ConfigRequest, ConfigSegment, ModeRecord};
