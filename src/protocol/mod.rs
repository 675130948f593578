//! Radio protocol implementation module
//!
//! This module defines the binary radio frame, its function codes,
//! encoding/decoding, and the function-specific payload layouts.

pub mod codec;
pub mod frame;
pub mod function;
pub mod payload;

pub use self::codec::{decode, encode, RadioCodec, MAX_PAYLOAD_LEN};
pub use self::frame::{DecodedFrame, Frame, ADDRESS_HEADER_LEN, HEADER_LEN};
pub use self::function::FunctionCode;
pub use self::payload::{Alert, AlertCategory, IncludeRequest};
