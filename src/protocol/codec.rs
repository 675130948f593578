use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{Address, DecodeError, Error, HalfSeconds, Result, MAX_FRAME_LEN};
use super::frame::{DecodedFrame, Frame, ADDRESS_HEADER_LEN, HEADER_LEN};
use super::function::FunctionCode;

/// Largest payload an addressed frame can carry
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - HEADER_LEN;

/// Encodes one frame for transmission.
///
/// The beacon function produces the bare address pair; every other function
/// gets the full header with `length` set to header plus payload size.
pub fn encode(
    destination: Address,
    source: Address,
    function: FunctionCode,
    wakeup: HalfSeconds,
    payload: &[u8],
) -> Result<Bytes> {
    if function == FunctionCode::Beacon {
        let mut buf = BytesMut::with_capacity(ADDRESS_HEADER_LEN);
        buf.put_u16(destination);
        buf.put_u16(source);
        return Ok(buf.freeze());
    }

    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Error::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let length = HEADER_LEN + payload.len();
    let mut buf = BytesMut::with_capacity(length);
    buf.put_u16(destination);
    buf.put_u16(source);
    buf.put_u8(function.code());
    buf.put_u8(length as u8);
    buf.put_u32(0);
    buf.put_u16(wakeup.raw());
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Decodes one received frame.
///
/// A frame of exactly the address pair is a beacon. Anything else shorter than
/// the full header is malformed. The payload ends where the declared length
/// says; a datagram shorter than that is rejected and trailing bytes are
/// ignored.
pub fn decode(bytes: &[u8]) -> std::result::Result<Frame, DecodeError> {
    if bytes.len() == ADDRESS_HEADER_LEN {
        let mut buf = bytes;
        return Ok(Frame::Beacon {
            destination: buf.get_u16(),
            source: buf.get_u16(),
        });
    }

    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Malformed {
            len: bytes.len(),
            min: HEADER_LEN,
        });
    }

    let declared = bytes[5];
    let end = usize::from(declared);
    if end < HEADER_LEN || end > bytes.len() {
        return Err(DecodeError::Length {
            declared,
            len: bytes.len(),
        });
    }

    let mut buf = &bytes[..end];
    let destination = buf.get_u16();
    let source = buf.get_u16();
    let function = FunctionCode::from_code(buf.get_u8());
    let length = buf.get_u8();
    let timestamp = buf.get_u32();
    let wakeup = HalfSeconds(buf.get_u16());
    let payload = Bytes::copy_from_slice(buf);

    Ok(Frame::Addressed(DecodedFrame {
        destination,
        source,
        function,
        length,
        timestamp,
        wakeup,
        payload,
    }))
}

impl Frame {
    /// Encodes this frame
    pub fn encode(&self) -> Result<Bytes> {
        match self {
            Frame::Beacon { destination, source } => {
                encode(*destination, *source, FunctionCode::Beacon, HalfSeconds::ZERO, &[])
            }
            Frame::Addressed(frame) => encode(
                frame.destination,
                frame.source,
                frame.function,
                frame.wakeup,
                &frame.payload,
            ),
        }
    }

    /// Decodes a frame
    pub fn decode(bytes: &[u8]) -> std::result::Result<Frame, DecodeError> {
        decode(bytes)
    }
}

/// Codec for radio adaptors that deliver one frame per datagram
#[derive(Clone, Default)]
pub struct RadioCodec;

impl RadioCodec {
    /// Creates a new radio codec
    pub fn new() -> Self {
        RadioCodec
    }
}

impl Decoder for RadioCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }

        // The whole buffer is one datagram
        let datagram = src.split();
        Ok(Some(decode(&datagram)?))
    }
}

impl Encoder<Frame> for RadioCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        let bytes = item.encode()?;
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}
