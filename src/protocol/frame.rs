use bytes::Bytes;

use crate::core::{Address, HalfSeconds};
use super::function::FunctionCode;

/// Bytes in the destination/source pair every frame starts with
pub const ADDRESS_HEADER_LEN: usize = 4;

/// Bytes in the full header of an addressed frame
pub const HEADER_LEN: usize = 10;

/// Header fields of a frame that carries a function code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Destination address
    pub destination: Address,
    /// Sender's address
    pub source: Address,
    /// Function code
    pub function: FunctionCode,
    /// Header-plus-payload size as declared by the sender
    pub length: u8,
    /// Reserved, always zero from this gateway
    pub timestamp: u32,
    /// Sleep interval the receiver is told to use
    pub wakeup: HalfSeconds,
    /// Function-specific payload
    pub payload: Bytes,
}

/// A radio frame in either of its two shapes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Broadcast presence frame, the address pair only
    Beacon {
        destination: Address,
        source: Address,
    },
    /// Every other function
    Addressed(DecodedFrame),
}

impl Frame {
    /// Creates a beacon frame
    pub fn beacon(destination: Address, source: Address) -> Self {
        Frame::Beacon { destination, source }
    }

    /// Creates an addressed frame; the length field is filled in on encode.
    /// `function` is stored in the form a receiver would decode.
    pub fn addressed(
        destination: Address,
        source: Address,
        function: FunctionCode,
        wakeup: HalfSeconds,
        payload: impl Into<Bytes>,
    ) -> Self {
        let payload = payload.into();
        let length = (HEADER_LEN + payload.len()).min(u8::MAX as usize) as u8;
        Frame::Addressed(DecodedFrame {
            destination,
            source,
            function: function.canonical(),
            length,
            timestamp: 0,
            wakeup,
            payload,
        })
    }

    /// Destination address
    pub fn destination(&self) -> Address {
        match self {
            Frame::Beacon { destination, .. } => *destination,
            Frame::Addressed(frame) => frame.destination,
        }
    }

    /// Sender's address
    pub fn source(&self) -> Address {
        match self {
            Frame::Beacon { source, .. } => *source,
            Frame::Addressed(frame) => frame.source,
        }
    }

    /// Function code; beacons report `Beacon`
    pub fn function(&self) -> FunctionCode {
        match self {
            Frame::Beacon { .. } => FunctionCode::Beacon,
            Frame::Addressed(frame) => frame.function,
        }
    }
}
