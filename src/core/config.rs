use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{Error, Result};
use super::types::{Address, HalfSeconds};

/// Configuration for the gateway engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// This gateway's radio address, carried as the source of every frame
    pub gateway_address: Address,
    /// Destination of include_grant and include_not frames
    pub grant_address: Address,
    /// Destination of beacon frames
    pub beacon_address: Address,
    /// Wake value of `start` frames and of the sleep ack after a delivery
    pub pressed_wakeup: HalfSeconds,
    /// Wake value of the trailing app_value frame
    pub app_value_wakeup: HalfSeconds,
    /// Single-entry list used for mode records that carry no wakeup list
    pub default_wakeup_interval: HalfSeconds,
    /// Returned when a node has no alert state or no matching table entry
    pub fallback_wakeup: HalfSeconds,
    /// Floor applied to an interval before its deadline is computed
    pub min_deadline_interval: HalfSeconds,
    /// Grace factor applied to deadlines of sleeping nodes
    pub grace_multiplier: f64,
    /// Deadline window while a node is kept awake
    #[serde(with = "duration_secs")]
    pub awake_grace: Duration,
    /// Deadline window after a node is assigned to this gateway
    #[serde(with = "duration_secs")]
    pub assign_grace: Duration,
    /// Retransmission timeout for unacknowledged frames
    #[serde(with = "duration_secs")]
    pub ack_timeout: Duration,
    /// Attempts after which the destination node is evicted
    pub max_attempts: u32,
    /// Frame bytes allowed per drain pass
    pub window_budget: usize,
    /// Drain tick period
    #[serde(with = "duration_secs")]
    pub tick_interval: Duration,
    /// Delay before the first drain tick
    #[serde(with = "duration_secs")]
    pub beacon_start_delay: Duration,
    /// Ticks before the first beacon cycle
    pub initial_beacon_interval: u32,
    /// Tick counts a beacon interval is drawn from
    pub beacon_interval_choices: Vec<u32>,
    /// Liveness monitor period
    #[serde(with = "duration_secs")]
    pub monitor_interval: Duration,
    /// Delay between a node being told to stay awake and the config send
    #[serde(with = "duration_secs")]
    pub config_send_delay: Duration,
    /// Delay before a granted node's include_grant frame is queued
    #[serde(with = "duration_secs")]
    pub grant_delay: Duration,
    /// Delay of the repeated include_not frame
    #[serde(with = "duration_secs")]
    pub include_not_repeat: Duration,
    /// Delay of standalone rssi reports
    #[serde(with = "duration_secs")]
    pub rssi_report_delay: Duration,
    /// An unanswered RSSI measurement is abandoned after this long
    #[serde(with = "duration_secs")]
    pub rssi_timeout: Duration,
    /// Delay of the first management link check
    #[serde(with = "duration_secs")]
    pub link_check_start: Duration,
    /// Link check period while connected
    #[serde(with = "duration_secs")]
    pub link_check_interval: Duration,
    /// Link check period while disconnected
    #[serde(with = "duration_secs")]
    pub link_fast_check_interval: Duration,
    /// Silence after which the management link is considered down
    #[serde(with = "duration_secs")]
    pub link_timeout: Duration,
    /// Registry snapshot file
    pub state_path: Option<PathBuf>,
    /// Seed for the beacon jitter
    pub rng_seed: Option<u64>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            gateway_address: 1,
            grant_address: 0xBB00,
            beacon_address: 0xBBBB,
            pressed_wakeup: HalfSeconds(5 * 60),
            app_value_wakeup: HalfSeconds(30),
            default_wakeup_interval: HalfSeconds(21600),
            fallback_wakeup: HalfSeconds(7200),
            min_deadline_interval: HalfSeconds(300),
            grace_multiplier: 1.2,
            awake_grace: Duration::from_secs(720),
            assign_grace: Duration::from_secs(86396),
            ack_timeout: Duration::from_secs(9),
            max_attempts: 9,
            window_budget: 60,
            tick_interval: Duration::from_millis(500),
            beacon_start_delay: Duration::from_secs(5),
            initial_beacon_interval: 6,
            beacon_interval_choices: vec![10, 12],
            monitor_interval: Duration::from_secs(10),
            config_send_delay: Duration::from_secs(3),
            grant_delay: Duration::from_millis(500),
            include_not_repeat: Duration::from_secs(2),
            rssi_report_delay: Duration::from_secs(3),
            rssi_timeout: Duration::from_secs(5),
            link_check_start: Duration::from_secs(10),
            link_check_interval: Duration::from_secs(900),
            link_fast_check_interval: Duration::from_secs(60),
            link_timeout: Duration::from_secs(900 + 120),
            state_path: None,
            rng_seed: None,
        }
    }
}

impl GatewayConfig {
    /// Parses a configuration, filling absent fields with defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: GatewayConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values the engine relies on
    pub fn validate(&self) -> Result<()> {
        if !(self.grace_multiplier > 1.0 && self.grace_multiplier <= MAX_GRACE_MULTIPLIER) {
            return Err(Error::config(format!(
                "grace_multiplier must be greater than 1 and at most {}",
                MAX_GRACE_MULTIPLIER
            )));
        }
        if self.beacon_interval_choices.is_empty() {
            return Err(Error::config("beacon_interval_choices must not be empty"));
        }
        if self.max_attempts == 0 {
            return Err(Error::config("max_attempts must be at least 1"));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::config("tick_interval must be non-zero"));
        }
        if self.gateway_address == self.beacon_address || self.gateway_address == self.grant_address {
            return Err(Error::config("gateway_address collides with a reserved address"));
        }
        Ok(())
    }
}

/// Upper bound accepted for `grace_multiplier`
const MAX_GRACE_MULTIPLIER: f64 = 100.0;

mod duration_secs {
    pub use crate::core::serde::deserialize_duration as deserialize;
    pub use crate::core::serde::serialize_duration as serialize;
}
