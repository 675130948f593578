//! Function-specific payload layouts

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::core::{Address, LogicalId};

/// Battery ADC calibration factor, from the hardware design
pub const BATTERY_SCALE: f64 = 0.235668;

/// Alert code reported by devices whose alert payload could not be read
pub const UNREADABLE_ALERT: u16 = 0xFFFF;

/// Category selected by the high byte of an alert code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    Pressed,
    Cleared,
    Battery,
    Unknown,
}

/// Decoded alert payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alert {
    /// Raw two-byte alert code
    pub code: u16,
    /// Signal strength as measured by the node (extended variant only)
    pub rssi: Option<i8>,
    /// Node temperature (extended variant only)
    pub temperature: Option<i8>,
}

impl Alert {
    /// Decodes an alert payload. A payload too short for the code yields
    /// `UNREADABLE_ALERT` rather than failing, so the sender is still acked.
    pub fn decode(payload: &[u8]) -> Self {
        let mut buf = payload;
        if buf.remaining() < 2 {
            return Alert {
                code: UNREADABLE_ALERT,
                rssi: None,
                temperature: None,
            };
        }
        let code = buf.get_u16();
        let (rssi, temperature) = if buf.remaining() >= 2 {
            (Some(buf.get_i8()), Some(buf.get_i8()))
        } else {
            (None, None)
        };
        Alert {
            code,
            rssi,
            temperature,
        }
    }

    /// Category of this alert
    pub fn category(&self) -> AlertCategory {
        match self.code >> 8 {
            0x00 => AlertCategory::Pressed,
            0x01 => AlertCategory::Cleared,
            0x02 => AlertCategory::Battery,
            _ => AlertCategory::Unknown,
        }
    }

    /// Category-specific low byte: button id, mode state or raw battery reading
    pub fn data(&self) -> u8 {
        (self.code & 0xFF) as u8
    }

    /// Scaled battery level for battery alerts
    pub fn battery_level(&self) -> Option<f64> {
        match self.category() {
            AlertCategory::Battery => Some(f64::from(self.data()) * BATTERY_SCALE / 10.0),
            _ => None,
        }
    }
}

/// Decoded include request payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncludeRequest {
    pub logical_id: LogicalId,
    /// Protocol version (extended variant only, 0 otherwise)
    pub version: i8,
    /// Signal strength as measured by the node (extended variant only, 0 otherwise)
    pub rssi: i8,
}

impl IncludeRequest {
    /// Decodes an include request; `None` if the id is missing
    pub fn decode(payload: &[u8]) -> Option<Self> {
        let mut buf = payload;
        if buf.remaining() < 4 {
            return None;
        }
        let logical_id = buf.get_u32();
        let (version, rssi) = if buf.remaining() >= 2 {
            (buf.get_i8(), buf.get_i8())
        } else {
            (0, 0)
        };
        Some(IncludeRequest {
            logical_id,
            version,
            rssi,
        })
    }
}

/// Payload of an include_grant frame
pub fn include_grant_payload(logical_id: LogicalId, address: Address) -> Bytes {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u32(logical_id);
    buf.put_u16(address);
    buf.freeze()
}

/// Payload of an include_not frame
pub fn include_not_payload(logical_id: LogicalId) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(logical_id);
    buf.freeze()
}
