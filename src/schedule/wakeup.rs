//! Sleep interval selection

use std::time::{Duration, Instant};

use tracing::debug;

use crate::core::{GatewayConfig, HalfSeconds};
use crate::registry::Node;

/// Interval chosen for a node's next sleep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeupDecision {
    /// Value for the frame's wakeup field
    pub interval: HalfSeconds,
    /// The caller must schedule the deferred config send for this node
    pub schedule_config_send: bool,
}

/// Computes wakeup intervals and liveness deadlines
#[derive(Debug, Clone)]
pub struct WakeupScheduler {
    fallback_wakeup: HalfSeconds,
    min_deadline_interval: HalfSeconds,
    grace_multiplier: f64,
    awake_grace: Duration,
}

impl WakeupScheduler {
    pub fn new(config: &GatewayConfig) -> Self {
        WakeupScheduler {
            fallback_wakeup: config.fallback_wakeup,
            min_deadline_interval: config.min_deadline_interval,
            grace_multiplier: config.grace_multiplier,
            awake_grace: config.awake_grace,
        }
    }

    /// Picks the wakeup for the next frame sent to `node`.
    ///
    /// Zero keeps the radio awake when a config push, a battery request or
    /// any other queued frame is waiting. Otherwise the node's wakeup list
    /// for its alert state is walked one entry per call, stopping at the
    /// last entry. Updates `next_deadline` either way.
    pub fn next_wakeup(&self, node: &mut Node, queue_has_pending: bool, now: Instant) -> WakeupDecision {
        let config_waiting = node
            .pending_config
            .as_ref()
            .map_or(false, |request| !request.is_reassign());

        let interval = if config_waiting || node.configuring || node.battery_requested || queue_has_pending {
            node.next_deadline = Some(now + self.awake_grace);
            HalfSeconds::ZERO
        } else {
            let interval = self.walk_table(node);
            node.next_deadline = Some(now + self.deadline_window(interval));
            interval
        };

        let schedule_config_send = node.pending_config.is_some() && !node.config_send_scheduled;
        if schedule_config_send {
            node.config_send_scheduled = true;
        }

        debug!(
            address = node.address,
            logical_id = node.logical_id,
            wakeup = %interval,
            schedule_config_send,
            "Wakeup chosen"
        );
        WakeupDecision {
            interval,
            schedule_config_send,
        }
    }

    /// Liveness window granted after a sleep of `interval`
    pub fn deadline_window(&self, interval: HalfSeconds) -> Duration {
        let floored = interval.raw().max(self.min_deadline_interval.raw());
        Duration::from_secs_f64(f64::from(floored) * 2.0 * self.grace_multiplier)
    }

    fn walk_table(&self, node: &mut Node) -> HalfSeconds {
        let list = match node
            .alert_state
            .and_then(|state| node.wakeup_table.get(&state))
            .filter(|list| !list.is_empty())
        {
            Some(list) => list,
            None => return self.fallback_wakeup,
        };

        let last = list.len() - 1;
        let interval = list[node.wakeup_cursor.min(last)];
        node.wakeup_cursor = (node.wakeup_cursor + 1).min(last);
        interval
    }
}
