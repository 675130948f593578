use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Short radio address assigned by this gateway (0 = not yet included)
pub type Address = u16;

/// Stable node identity assigned by the management layer
pub type LogicalId = u32;

/// Address used by nodes that have not been included yet
pub const UNINCLUDED_ADDRESS: Address = 0;

/// Wake interval as carried on the wire, in half-second units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HalfSeconds(pub u16);

impl HalfSeconds {
    /// Keep the radio awake
    pub const ZERO: HalfSeconds = HalfSeconds(0);

    /// Raw wire value
    pub fn raw(&self) -> u16 {
        self.0
    }

    /// Whether the node is being told to stay awake
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Real time the node will sleep for
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.0) * 500)
    }
}

impl From<u16> for HalfSeconds {
    fn from(value: u16) -> Self {
        HalfSeconds(value)
    }
}

impl fmt::Display for HalfSeconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} half-seconds", self.0)
    }
}
