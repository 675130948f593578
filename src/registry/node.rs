use std::collections::BTreeMap;
use std::time::Instant;

use crate::core::{Address, HalfSeconds, LogicalId};
use crate::display::ConfigRequest;

/// Wakeup interval lists keyed by alert state
pub type WakeupTable = BTreeMap<u8, Vec<HalfSeconds>>;

/// State kept for one included field device
#[derive(Debug, Clone)]
pub struct Node {
    /// Stable identity
    pub logical_id: LogicalId,
    /// Radio address granted by this gateway
    pub address: Address,
    /// Last reported button/mode state
    pub alert_state: Option<u8>,
    /// Position in the wakeup list for `alert_state`
    pub wakeup_cursor: usize,
    /// Wakeup lists populated from mode records
    pub wakeup_table: WakeupTable,
    /// The node is reported missing if not heard from by then
    pub next_deadline: Option<Instant>,
    /// Display/config update waiting for the node to wake
    pub pending_config: Option<ConfigRequest>,
    /// A config push is in progress; a `start` frame follows it
    pub configuring: bool,
    /// A deferred config send is already scheduled
    pub config_send_scheduled: bool,
    /// The management layer asked for a battery/RSSI report
    pub battery_requested: bool,
    /// Report alert state 0 once the node acks its `start` frame
    pub alert_after_start: bool,
    /// Last alert code forwarded to the management layer
    pub last_alert: Option<u16>,
}

impl Node {
    /// Creates a node with no state beyond its identity
    pub fn new(logical_id: LogicalId, address: Address) -> Self {
        Node {
            logical_id,
            address,
            alert_state: None,
            wakeup_cursor: 0,
            wakeup_table: WakeupTable::new(),
            next_deadline: None,
            pending_config: None,
            configuring: false,
            config_send_scheduled: false,
            battery_requested: false,
            alert_after_start: false,
            last_alert: None,
        }
    }

    /// Records a new alert state and restarts its wakeup list
    pub fn set_alert_state(&mut self, state: u8) {
        self.alert_state = Some(state);
        self.wakeup_cursor = 0;
    }

    /// Drops everything but the identity
    pub fn reset(&mut self) {
        *self = Node::new(self.logical_id, self.address);
    }
}
