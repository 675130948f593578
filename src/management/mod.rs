//! Management channel module
//!
//! This module defines the JSON records exchanged with the management layer.
//! Every record carries a `"function"` tag naming its kind.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::core::{Address, LogicalId, Result};
use crate::protocol::AlertCategory;

/// Requests from the management layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum ManagementCommand {
    /// Link handshake
    Init,
    /// Accept an inclusion request; no address means allocate one
    IncludeGrant {
        id: LogicalId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<Address>,
    },
    /// Refuse an inclusion request
    IncludeNot { id: LogicalId },
    /// Full or partial display config, in field order
    Config {
        id: LogicalId,
        config: Map<String, Value>,
    },
    /// Ask the node for a battery reading
    SendBattery { id: LogicalId },
    UpdateAddress { id: LogicalId, address: Address },
    #[serde(alias = "remove_button")]
    RemoveNode { id: LogicalId },
    /// The node now belongs to the gateway at `gateway`
    AssignNode {
        id: LogicalId,
        #[serde(alias = "bid", deserialize_with = "gateway_address")]
        gateway: Address,
    },
    /// Reset the device
    Reset { id: LogicalId },
}

impl ManagementCommand {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Logical id the command is about, if any
    pub fn logical_id(&self) -> Option<LogicalId> {
        match self {
            ManagementCommand::Init => None,
            ManagementCommand::IncludeGrant { id, .. }
            | ManagementCommand::IncludeNot { id }
            | ManagementCommand::Config { id, .. }
            | ManagementCommand::SendBattery { id }
            | ManagementCommand::UpdateAddress { id, .. }
            | ManagementCommand::RemoveNode { id }
            | ManagementCommand::AssignNode { id, .. }
            | ManagementCommand::Reset { id } => Some(*id),
        }
    }
}

/// Accepts a bare address or a bridge id such as `"BID12"`, whose digits
/// after the three letter prefix are the address
fn gateway_address<'de, D>(deserializer: D) -> std::result::Result<Address, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Bridge {
        Address(Address),
        BridgeId(String),
    }

    match Bridge::deserialize(deserializer)? {
        Bridge::Address(address) => Ok(address),
        Bridge::BridgeId(bid) => bid
            .get(3..)
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| serde::de::Error::custom(format!("invalid bridge id: {}", bid))),
    }
}

/// Device events reported to the management layer.
/// Timestamps are Unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum ManagementEvent {
    /// Link status probe
    Init,
    IncludeReq {
        id: LogicalId,
        version: i8,
        /// Absent if the measurement timed out
        rssi: Option<i16>,
        time_stamp: i64,
    },
    IncludeGrant { id: LogicalId, address: Address },
    Alert {
        id: LogicalId,
        #[serde(rename = "type")]
        alert_type: u16,
        category: AlertCategory,
    },
    Battery {
        id: LogicalId,
        percent: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rssi: Option<i8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temperature: Option<i8>,
    },
    WokenUp {
        id: LogicalId,
        rssi: Option<i16>,
        time_stamp: i64,
    },
    Rssi {
        address: Address,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<LogicalId>,
        rssi: i16,
        time_stamp: i64,
    },
    /// The node missed its check-in deadline
    ExcludeReq { id: LogicalId },
}

impl ManagementEvent {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Current Unix time in seconds
pub fn unix_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
