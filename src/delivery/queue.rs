//! Outbound frame queue with per-destination ack tracking

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::core::{Address, GatewayConfig};
use crate::protocol::FunctionCode;
use crate::util::hex;

/// One queued radio transmission
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Encoded frame
    pub frame: Bytes,
    /// Node the message belongs to; grant frames use the granted address
    pub destination: Address,
    pub function: FunctionCode,
    /// Transmissions so far; zero until first sent
    pub attempt: u32,
    pub last_sent_at: Option<Instant>,
}

impl OutboundMessage {
    pub fn new(frame: Bytes, destination: Address, function: FunctionCode) -> Self {
        OutboundMessage {
            frame,
            destination,
            function,
            attempt: 0,
            last_sent_at: None,
        }
    }

    /// Sent and waiting for an ack
    pub fn in_flight(&self) -> bool {
        self.attempt > 0
    }
}

/// Retry and pacing limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliveryPolicy {
    /// Retransmit after this long without an ack
    pub ack_timeout: Duration,
    /// The destination is evicted once `attempt` exceeds this
    pub max_attempts: u32,
    /// Frame bytes per drain pass
    pub window_budget: usize,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        DeliveryPolicy {
            ack_timeout: Duration::from_secs(9),
            max_attempts: 9,
            window_budget: 60,
        }
    }
}

impl From<&GatewayConfig> for DeliveryPolicy {
    fn from(config: &GatewayConfig) -> Self {
        DeliveryPolicy {
            ack_timeout: config.ack_timeout,
            max_attempts: config.max_attempts,
            window_budget: config.window_budget,
        }
    }
}

/// Result of matching an ack against the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The in-flight message was removed
    Delivered {
        function: FunctionCode,
        /// Unsent messages for the same node remain queued
        more_pending: bool,
    },
    /// Nothing was in flight for the acking node
    Spurious,
}

/// What one drain pass did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DrainReport {
    /// Frames to hand to the radio, in order
    pub transmitted: Vec<Bytes>,
    /// Destinations an ack was sent to in this pass
    pub acks_sent_to: Vec<Address>,
    /// Destination whose retries ran out; its messages are already purged
    pub evicted: Option<Address>,
    /// The beacon cycle found nothing to send
    pub beacon_due: bool,
}

/// Ordered outbound queue.
///
/// At most one message per destination is in flight. Acks and
/// include_not frames are sent once and never wait for an ack.
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    messages: VecDeque<OutboundMessage>,
    in_flight: HashSet<Address>,
    policy: DeliveryPolicy,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::with_policy(DeliveryPolicy::default())
    }

    pub fn with_policy(policy: DeliveryPolicy) -> Self {
        DeliveryQueue {
            messages: VecDeque::new(),
            in_flight: HashSet::new(),
            policy,
        }
    }

    /// Appends a frame for `destination`
    pub fn enqueue(&mut self, frame: Bytes, destination: Address, function: FunctionCode) {
        debug!(destination, %function, "Queuing frame");
        self.messages
            .push_back(OutboundMessage::new(frame, destination, function));
    }

    /// True if anything is queued for `destination`
    pub fn has_pending_for(&self, destination: Address) -> bool {
        self.messages.iter().any(|m| m.destination == destination)
    }

    pub fn is_in_flight(&self, destination: Address) -> bool {
        self.in_flight.contains(&destination)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutboundMessage> {
        self.messages.iter()
    }

    /// Drops everything queued for `destination`. Returns how many.
    pub fn purge(&mut self, destination: Address) -> usize {
        let before = self.messages.len();
        self.messages.retain(|m| m.destination != destination);
        self.in_flight.remove(&destination);
        before - self.messages.len()
    }

    /// Drops unsent `function` messages for `destination`
    pub fn supersede(&mut self, destination: Address, function: FunctionCode) -> usize {
        let before = self.messages.len();
        self.messages
            .retain(|m| m.destination != destination || m.function != function || m.in_flight());
        before - self.messages.len()
    }

    /// Matches an ack from `source` against its in-flight message
    pub fn acknowledge(&mut self, source: Address) -> AckOutcome {
        if !self.in_flight.remove(&source) {
            debug!(source, "Ack with nothing in flight");
            return AckOutcome::Spurious;
        }

        let position = self
            .messages
            .iter()
            .position(|m| m.destination == source && m.in_flight());
        let delivered = match position.and_then(|index| self.messages.remove(index)) {
            Some(message) => message,
            None => {
                warn!(source, "In-flight destination without a queued message");
                return AckOutcome::Spurious;
            }
        };

        let more_pending = self.has_pending_for(source);
        debug!(source, function = %delivered.function, more_pending, "Delivered");
        AckOutcome::Delivered {
            function: delivered.function,
            more_pending,
        }
    }

    /// Runs one transmission window.
    ///
    /// On a beacon cycle only acks and include_not frames go out, and the
    /// report asks for a beacon if nothing else was sent. A pass stops
    /// early once a destination is evicted.
    pub fn drain(&mut self, now: Instant, beacon: bool) -> DrainReport {
        let mut report = DrainReport::default();
        let mut sent_len = 0usize;
        let mut index = 0;

        while index < self.messages.len() {
            if sent_len >= self.policy.window_budget || report.evicted.is_some() {
                break;
            }

            let message = &mut self.messages[index];
            let destination = message.destination;
            let acked_this_pass = report.acks_sent_to.contains(&destination);

            match message.function {
                FunctionCode::Ack | FunctionCode::IncludeNot
                    if message.function == FunctionCode::IncludeNot || !acked_this_pass =>
                {
                    sent_len += message.frame.len();
                    debug!(destination, function = %message.function, frame = %hex(&message.frame), "Tx");
                    if let Some(sent) = self.messages.remove(index) {
                        report.transmitted.push(sent.frame);
                    }
                    report.acks_sent_to.push(destination);
                    continue;
                }
                FunctionCode::Ack | FunctionCode::IncludeNot => {}
                _ if beacon || acked_this_pass => {}
                _ if !message.in_flight() && !self.in_flight.contains(&destination) => {
                    message.attempt = 1;
                    message.last_sent_at = Some(now);
                    sent_len += message.frame.len();
                    debug!(destination, function = %message.function, attempt = 1, frame = %hex(&message.frame), "Tx");
                    report.transmitted.push(message.frame.clone());
                    self.in_flight.insert(destination);
                }
                _ if message.in_flight() && timed_out(message, now, self.policy.ack_timeout) => {
                    if message.attempt > self.policy.max_attempts {
                        warn!(destination, function = %message.function, attempts = message.attempt, "No ack, evicting destination");
                        report.evicted = Some(destination);
                        self.purge(destination);
                        break;
                    }
                    message.attempt += 1;
                    message.last_sent_at = Some(now);
                    sent_len += message.frame.len();
                    debug!(destination, function = %message.function, attempt = message.attempt, "Retransmit");
                    report.transmitted.push(message.frame.clone());
                }
                _ => {}
            }
            index += 1;
        }

        report.beacon_due = beacon && sent_len == 0;
        report
    }
}

fn timed_out(message: &OutboundMessage, now: Instant, timeout: Duration) -> bool {
    message
        .last_sent_at
        .map_or(true, |sent| now.saturating_duration_since(sent) > timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(len: usize) -> Bytes {
        Bytes::from(vec![0u8; len])
    }

    fn in_flight_per_destination(queue: &DeliveryQueue) -> bool {
        let mut seen = HashSet::new();
        queue
            .iter()
            .filter(|m| m.in_flight())
            .all(|m| seen.insert(m.destination))
    }

    #[test]
    fn test_one_in_flight_per_destination() {
        let mut queue = DeliveryQueue::new();
        queue.enqueue(frame(10), 1, FunctionCode::Config);
        queue.enqueue(frame(10), 1, FunctionCode::Config);
        queue.enqueue(frame(10), 2, FunctionCode::Config);

        let now = Instant::now();
        let report = queue.drain(now, false);
        assert_eq!(report.transmitted.len(), 2);
        assert!(in_flight_per_destination(&queue));

        let report = queue.drain(now + Duration::from_secs(1), false);
        assert!(report.transmitted.is_empty());
        assert!(in_flight_per_destination(&queue));
    }

    /// In-flight marks and the in-flight set agree, one message per destination at most
    fn assert_in_flight_consistent(queue: &DeliveryQueue) {
        for destination in 1..=4 {
            let in_flight = queue
                .iter()
                .filter(|m| m.destination == destination && m.in_flight())
                .count();
            assert!(in_flight <= 1, "{} in flight to {}", in_flight, destination);
            assert_eq!(queue.is_in_flight(destination), in_flight == 1);
        }
        assert!(queue
            .iter()
            .filter(|m| m.function.is_fire_and_forget())
            .all(|m| !m.in_flight()));
    }

    #[test]
    fn test_in_flight_holds_for_generated_sequences() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let functions = [
            FunctionCode::Ack,
            FunctionCode::IncludeNot,
            FunctionCode::Config,
            FunctionCode::Start,
            FunctionCode::SendBattery,
        ];

        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut queue = DeliveryQueue::with_policy(DeliveryPolicy {
                max_attempts: rng.gen_range(1..4),
                ..DeliveryPolicy::default()
            });
            let mut now = Instant::now();

            for _ in 0..500 {
                let destination = rng.gen_range(1..=4);
                match rng.gen_range(0..10) {
                    0..=3 => {
                        let function = functions[rng.gen_range(0..functions.len())];
                        queue.enqueue(frame(rng.gen_range(5..30)), destination, function);
                    }
                    4..=6 => {
                        queue.drain(now, rng.gen_bool(0.25));
                    }
                    7 => {
                        queue.acknowledge(destination);
                    }
                    8 => {
                        if rng.gen_bool(0.5) {
                            queue.supersede(destination, FunctionCode::Config);
                        } else {
                            queue.purge(destination);
                        }
                    }
                    _ => now += Duration::from_millis(rng.gen_range(0..12_000)),
                }
                assert_in_flight_consistent(&queue);
            }
        }
    }

    #[test]
    fn test_ack_sent_once_and_removed() {
        let mut queue = DeliveryQueue::new();
        queue.enqueue(frame(10), 1, FunctionCode::Ack);
        let report = queue.drain(Instant::now(), false);
        assert_eq!(report.transmitted.len(), 1);
        assert_eq!(report.acks_sent_to, vec![1]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_one_ack_per_destination_per_pass() {
        let mut queue = DeliveryQueue::new();
        queue.enqueue(frame(10), 1, FunctionCode::Ack);
        queue.enqueue(frame(10), 1, FunctionCode::Ack);
        queue.enqueue(frame(10), 1, FunctionCode::Config);

        let report = queue.drain(Instant::now(), false);
        assert_eq!(report.transmitted.len(), 1);
        assert_eq!(queue.len(), 2);
        assert!(!queue.is_in_flight(1));
    }

    #[test]
    fn test_window_budget() {
        let mut queue = DeliveryQueue::new();
        for destination in 1..=5 {
            queue.enqueue(frame(25), destination, FunctionCode::Config);
        }
        let report = queue.drain(Instant::now(), false);
        assert_eq!(report.transmitted.len(), 3);
    }

    #[test]
    fn test_beacon_cycle_sends_only_acks() {
        let mut queue = DeliveryQueue::new();
        queue.enqueue(frame(10), 1, FunctionCode::Config);
        let report = queue.drain(Instant::now(), true);
        assert!(report.transmitted.is_empty());
        assert!(report.beacon_due);

        queue.enqueue(frame(10), 2, FunctionCode::IncludeNot);
        let report = queue.drain(Instant::now(), true);
        assert_eq!(report.transmitted.len(), 1);
        assert!(!report.beacon_due);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_acknowledge() {
        let mut queue = DeliveryQueue::new();
        queue.enqueue(frame(10), 1, FunctionCode::Config);
        queue.enqueue(frame(10), 1, FunctionCode::Start);
        queue.drain(Instant::now(), false);

        assert_eq!(
            queue.acknowledge(1),
            AckOutcome::Delivered {
                function: FunctionCode::Config,
                more_pending: true
            }
        );
        queue.drain(Instant::now(), false);
        assert_eq!(
            queue.acknowledge(1),
            AckOutcome::Delivered {
                function: FunctionCode::Start,
                more_pending: false
            }
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_spurious_ack() {
        let mut queue = DeliveryQueue::new();
        assert_eq!(queue.acknowledge(7), AckOutcome::Spurious);
        queue.enqueue(frame(10), 7, FunctionCode::Config);
        assert_eq!(queue.acknowledge(7), AckOutcome::Spurious);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_retry_then_evict() {
        let mut queue = DeliveryQueue::new();
        queue.enqueue(frame(11), 1, FunctionCode::Config);
        queue.enqueue(frame(11), 1, FunctionCode::Start);
        queue.enqueue(frame(12), 2, FunctionCode::Config);

        let step = Duration::from_secs(10);
        let mut now = Instant::now();
        let mut transmissions = 0;
        let mut evictions = Vec::new();
        for _ in 0..15 {
            let report = queue.drain(now, false);
            transmissions += report.transmitted.iter().filter(|f| f.len() == 11).count();
            if let Some(address) = report.evicted {
                evictions.push(address);
            }
            // Keep destination 2 healthy
            if queue.is_in_flight(2) {
                queue.acknowledge(2);
            }
            now += step;
        }

        assert_eq!(evictions, vec![1]);
        assert!(!queue.has_pending_for(1));
        assert!(!queue.is_in_flight(1));
        assert_eq!(transmissions, 10);
    }

    #[test]
    fn test_retransmit_waits_for_timeout() {
        let mut queue = DeliveryQueue::new();
        queue.enqueue(frame(10), 1, FunctionCode::Config);
        let start = Instant::now();
        queue.drain(start, false);

        assert!(queue.drain(start + Duration::from_secs(9), false).transmitted.is_empty());
        let report = queue.drain(start + Duration::from_secs(10), false);
        assert_eq!(report.transmitted.len(), 1);
        assert_eq!(queue.iter().next().unwrap().attempt, 2);
    }

    #[test]
    fn test_eviction_stops_pass() {
        let mut queue = DeliveryQueue::with_policy(DeliveryPolicy {
            max_attempts: 0,
            ..DeliveryPolicy::default()
        });
        queue.enqueue(frame(10), 1, FunctionCode::Config);
        let start = Instant::now();
        queue.drain(start, false);
        queue.enqueue(frame(10), 2, FunctionCode::Config);

        let report = queue.drain(start + Duration::from_secs(10), false);
        assert_eq!(report.evicted, Some(1));
        assert!(report.transmitted.is_empty());
        assert_eq!(queue.len(), 1);
        assert!(!queue.is_in_flight(2));
    }

    #[test]
    fn test_supersede_keeps_in_flight() {
        let mut queue = DeliveryQueue::new();
        queue.enqueue(frame(10), 1, FunctionCode::Config);
        queue.enqueue(frame(10), 1, FunctionCode::Config);
        queue.enqueue(frame(10), 1, FunctionCode::Start);
        queue.drain(Instant::now(), false);

        assert_eq!(queue.supersede(1, FunctionCode::Config), 1);
        assert_eq!(queue.len(), 2);
        assert!(queue.is_in_flight(1));
    }

    #[test]
    fn test_purge() {
        let mut queue = DeliveryQueue::new();
        queue.enqueue(frame(10), 1, FunctionCode::Config);
        queue.enqueue(frame(10), 2, FunctionCode::Config);
        queue.drain(Instant::now(), false);
        assert_eq!(queue.purge(1), 1);
        assert!(!queue.is_in_flight(1));
        assert!(queue.is_in_flight(2));
    }
}
