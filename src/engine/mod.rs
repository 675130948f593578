//! Gateway engine module
//!
//! [`Gateway`] owns every piece of protocol state and is driven through
//! synchronous entry points taking an explicit `now`. Radio output and
//! management events leave through unbounded channels.

pub mod runtime;

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::core::{Address, Error, GatewayConfig, HalfSeconds, LogicalId, Result, UNINCLUDED_ADDRESS};
use crate::delivery::{AckOutcome, BeaconCadence, DeliveryPolicy, DeliveryQueue};
use crate::discovery::{Correlated, DiscoveryCoordinator, MeasurementPurpose};
use crate::display::{ConfigRequest, DisplayConfigEncoder};
use crate::management::{unix_timestamp, ManagementCommand, ManagementEvent};
use crate::protocol::payload::{include_grant_payload, include_not_payload};
use crate::protocol::{decode, encode, Alert, AlertCategory, DecodedFrame, Frame, FunctionCode, IncludeRequest};
use crate::registry::{load_state, save_state, NodeRegistry};
use crate::schedule::{TimerQueue, WakeupScheduler};
use crate::util::hex;

/// Requests to the radio adaptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCommand {
    /// Send one encoded frame
    Transmit(Bytes),
    /// Measure the signal strength of the last received frame
    MeasureRssi,
}

/// Work deferred onto the engine clock
#[derive(Debug, Clone)]
enum Deferred {
    SendConfig(Address),
    /// Dropped if the node lost this address or its grant in the meantime
    Grant {
        frame: Bytes,
        logical_id: LogicalId,
        address: Address,
    },
    Enqueue {
        frame: Bytes,
        destination: Address,
        function: FunctionCode,
    },
    Report(ManagementEvent),
}

/// Management link supervision
#[derive(Debug)]
struct Link {
    connected: bool,
    last_message: Option<Instant>,
    next_check: Instant,
}

/// Snapshot of engine state for status displays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayStatus {
    /// Management link is up
    pub connected: bool,
    /// Mapped nodes
    pub nodes: usize,
    /// Queued radio messages
    pub queued: usize,
    /// An RSSI measurement is outstanding
    pub measuring: bool,
}

/// The radio protocol engine
#[derive(Debug)]
pub struct Gateway {
    config: GatewayConfig,
    registry: NodeRegistry,
    queue: DeliveryQueue,
    scheduler: WakeupScheduler,
    encoder: DisplayConfigEncoder,
    discovery: DiscoveryCoordinator,
    cadence: BeaconCadence,
    timers: TimerQueue<Deferred>,
    link: Link,
    /// Drain ticks are ignored before this
    ticks_from: Instant,
    radio_tx: UnboundedSender<RadioCommand>,
    events_tx: UnboundedSender<ManagementEvent>,
}

impl Gateway {
    /// Creates an engine, restoring the registry from `state_path` if set.
    ///
    /// An unreadable state file is logged and the registry starts empty.
    pub fn new(
        config: GatewayConfig,
        radio_tx: UnboundedSender<RadioCommand>,
        events_tx: UnboundedSender<ManagementEvent>,
        now: Instant,
    ) -> Result<Self> {
        config.validate()?;

        let registry = match config.state_path.as_deref().map(load_state) {
            Some(Ok(Some(snapshot))) => NodeRegistry::restore(snapshot),
            Some(Ok(None)) | None => NodeRegistry::new(),
            Some(Err(e)) => {
                warn!(error = %e, "Could not restore registry state, starting empty");
                NodeRegistry::new()
            }
        };

        Ok(Gateway {
            queue: DeliveryQueue::with_policy(DeliveryPolicy::from(&config)),
            scheduler: WakeupScheduler::new(&config),
            encoder: DisplayConfigEncoder::new(&config),
            discovery: DiscoveryCoordinator::new(config.rssi_timeout),
            cadence: BeaconCadence::from_config(&config),
            timers: TimerQueue::new(),
            link: Link {
                connected: false,
                last_message: None,
                next_check: now + config.link_check_start,
            },
            ticks_from: now + config.beacon_start_delay,
            registry,
            radio_tx,
            events_tx,
            config,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub fn is_connected(&self) -> bool {
        self.link.connected
    }

    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            connected: self.link.connected,
            nodes: self.registry.len(),
            queued: self.queue.len(),
            measuring: self.discovery.is_busy(),
        }
    }

    /// Handles one frame from the radio adaptor
    pub fn on_radio_frame(&mut self, bytes: &[u8], now: Instant) {
        if !self.link.connected {
            debug!(frame = %hex(bytes), "Management link down, radio frame dropped");
            return;
        }

        match decode(bytes) {
            Ok(Frame::Addressed(frame)) => {
                debug!(
                    source = frame.source,
                    destination = frame.destination,
                    function = %frame.function,
                    frame = %hex(bytes),
                    "Rx"
                );
                self.route(frame, now);
            }
            Ok(Frame::Beacon { source, .. }) => debug!(source, "Beacon from another gateway"),
            Err(e) => warn!(error = %e, frame = %hex(bytes), "Dropping malformed radio frame"),
        }
    }

    /// Handles the adaptor's answer to [`RadioCommand::MeasureRssi`]
    pub fn on_rssi(&mut self, rssi: i16, now: Instant) {
        if let Some(result) = self.discovery.complete(rssi) {
            self.finish_measurement(result, now);
        }
    }

    /// Handles one management command. Every command marks the link up.
    pub fn on_management_command(&mut self, command: ManagementCommand, now: Instant) {
        if !self.link.connected {
            info!("Management link up");
        }
        self.link.connected = true;
        self.link.last_message = Some(now);

        let result = match command {
            ManagementCommand::Init => Ok(()),
            ManagementCommand::IncludeGrant { id, address } => self.include_grant(id, address, now),
            ManagementCommand::IncludeNot { id } => self.include_not(id, now),
            ManagementCommand::Config { id, config } => {
                ConfigRequest::from_json(&config).and_then(|request| self.accept_config(id, request))
            }
            ManagementCommand::SendBattery { id } => self.send_battery(id),
            ManagementCommand::UpdateAddress { id, address } => self.update_address(id, address, now),
            ManagementCommand::RemoveNode { id } => {
                self.registry.remove(id, &mut self.queue);
                self.save();
                Ok(())
            }
            ManagementCommand::AssignNode { id, gateway } => self.assign_node(id, gateway, now),
            ManagementCommand::Reset { id } => self.reset_node(id),
        };

        if let Err(e) = result {
            warn!(error = %e, "Management command failed");
        }
    }

    /// Runs due timers and one transmission window
    pub fn tick(&mut self, now: Instant) {
        for action in self.timers.pop_due(now) {
            self.run_deferred(action, now);
        }

        if let Some(expired) = self.discovery.expire(now) {
            self.finish_measurement(expired, now);
        }

        if now >= self.link.next_check {
            self.emit(ManagementEvent::Init);
            let interval = if self.link.connected {
                self.config.link_check_interval
            } else {
                self.config.link_fast_check_interval
            };
            self.link.next_check = now + interval;
        }

        if now < self.ticks_from {
            return;
        }
        let beacon = self.cadence.next_tick();
        if !self.link.connected || self.discovery.is_busy() {
            return;
        }

        let report = self.queue.drain(now, beacon);
        for frame in report.transmitted {
            self.transmit(frame);
        }

        if let Some(address) = report.evicted {
            let error = Error::DeliveryExhausted {
                address,
                attempts: self.config.max_attempts + 1,
            };
            warn!(%error, "Evicting node");
            if let Some(logical_id) = self.registry.remove_address(address, &mut self.queue) {
                info!(logical_id, address, "Node evicted after delivery failure");
            }
            self.save();
        }

        for address in report.acks_sent_to {
            let requested = self
                .registry
                .node(address)
                .map_or(false, |node| node.battery_requested);
            if requested {
                self.request_battery(address, now);
            }
        }

        if report.beacon_due {
            let beacon_address = self.config.beacon_address;
            self.send_now(beacon_address, FunctionCode::Beacon);
        }
    }

    /// Reports nodes past their deadline and supervises the management link
    pub fn monitor(&mut self, now: Instant) {
        for (logical_id, address) in self.registry.overdue(now) {
            if self.registry.mark_excluded(logical_id) {
                if let Some(node) = self.registry.node_mut(address) {
                    node.next_deadline = None;
                }
                info!(logical_id, address, "Node missed its deadline");
                self.emit(ManagementEvent::ExcludeReq { id: logical_id });
            }
        }

        let silent = self
            .link
            .last_message
            .map_or(true, |last| now.saturating_duration_since(last) > self.config.link_timeout);
        if self.link.connected && silent {
            warn!("No management traffic, link down");
            self.link.connected = false;
        }
    }

    /// Writes the registry to `state_path`, if configured
    pub fn persist(&self) -> Result<()> {
        match &self.config.state_path {
            Some(path) => save_state(path, &self.registry.snapshot()),
            None => Ok(()),
        }
    }

    fn save(&self) {
        if let Err(e) = self.persist() {
            warn!(error = %e, "Could not save registry state");
        }
    }

    fn route(&mut self, frame: DecodedFrame, now: Instant) {
        let source = frame.source;

        if frame.function == FunctionCode::IncludeReq {
            self.include_request(source, &frame.payload, now);
            return;
        }

        if !self.registry.is_active_address(source) {
            if frame.function == FunctionCode::WokenUp {
                self.measure(source, MeasurementPurpose::Probe, now);
            } else {
                debug!(source, function = %frame.function, "Frame from inactive address ignored");
            }
            return;
        }

        match frame.function {
            FunctionCode::Alert => self.alert(source, &frame.payload, now),
            FunctionCode::WokenUp => self.measure(source, MeasurementPurpose::Wake, now),
            FunctionCode::Ack => self.ack(source),
            FunctionCode::Undefined(code) => {
                warn!(source, code, "Undefined function, acknowledging anyway");
                self.queue_ack(source, now);
            }
            other => warn!(source, function = %other, "Unexpected function from node"),
        }
    }

    fn include_request(&mut self, source: Address, payload: &[u8], now: Instant) {
        let request = match IncludeRequest::decode(payload) {
            Some(request) => request,
            None => {
                warn!(source, payload = %hex(payload), "Include request without a logical id");
                return;
            }
        };
        info!(source, logical_id = request.logical_id, version = request.version, "Include request");

        self.registry
            .reset_for_inclusion(request.logical_id, &mut self.queue);
        self.measure(
            source,
            MeasurementPurpose::Include {
                logical_id: request.logical_id,
                version: request.version,
            },
            now,
        );
    }

    fn alert(&mut self, source: Address, payload: &[u8], now: Instant) {
        let alert = Alert::decode(payload);
        let event = match self.registry.node_mut(source) {
            Some(node) if node.last_alert != Some(alert.code) => {
                node.last_alert = Some(alert.code);
                match alert.battery_level() {
                    Some(percent) => Some(ManagementEvent::Battery {
                        id: node.logical_id,
                        percent,
                        rssi: alert.rssi,
                        temperature: alert.temperature,
                    }),
                    None => {
                        node.set_alert_state(alert.data());
                        Some(ManagementEvent::Alert {
                            id: node.logical_id,
                            alert_type: alert.code,
                            category: alert.category(),
                        })
                    }
                }
            }
            Some(_) => {
                debug!(source, code = alert.code, "Repeated alert not forwarded");
                None
            }
            None => return,
        };

        if let Some(event) = event {
            self.emit(event);
        }
        self.queue_ack(source, now);
    }

    fn ack(&mut self, source: Address) {
        let (function, more_pending) = match self.queue.acknowledge(source) {
            AckOutcome::Delivered {
                function,
                more_pending,
            } => (function, more_pending),
            AckOutcome::Spurious => {
                warn!(source, "Ack does not match a sent message");
                return;
            }
        };

        let (report, configuring) = match self.registry.node_mut(source) {
            Some(node) => {
                let report = function == FunctionCode::Start && node.alert_after_start;
                if report {
                    node.alert_after_start = false;
                }
                (report.then_some(node.logical_id), node.configuring)
            }
            None => return,
        };

        if let Some(id) = report {
            self.emit(ManagementEvent::Alert {
                id,
                alert_type: 0,
                category: AlertCategory::Pressed,
            });
        }

        if !more_pending && !configuring {
            let wakeup = self.config.pressed_wakeup;
            self.enqueue(source, source, FunctionCode::Ack, wakeup, &[]);
        }
    }

    fn measure(&mut self, address: Address, purpose: MeasurementPurpose, now: Instant) {
        if self.discovery.request(address, purpose, now) {
            self.radio(RadioCommand::MeasureRssi);
        }
    }

    fn finish_measurement(&mut self, result: Correlated, now: Instant) {
        let Correlated { measurement, rssi } = result;
        let address = measurement.address;

        match measurement.purpose {
            MeasurementPurpose::Include {
                logical_id,
                version,
            } => self.emit(ManagementEvent::IncludeReq {
                id: logical_id,
                version,
                rssi,
                time_stamp: unix_timestamp(),
            }),
            MeasurementPurpose::Wake => {
                let logical_id = match self.registry.id_of(address) {
                    Some(id) if self.registry.is_active(id) => id,
                    _ => {
                        debug!(address, "Woken node no longer active");
                        return;
                    }
                };
                self.queue_ack(address, now);
                self.emit(ManagementEvent::WokenUp {
                    id: logical_id,
                    rssi,
                    time_stamp: unix_timestamp(),
                });
            }
            MeasurementPurpose::Probe => {
                // Reported late so it arrives after any wake event
                if let Some(rssi) = rssi {
                    let event = ManagementEvent::Rssi {
                        address,
                        id: self.registry.id_of(address),
                        rssi,
                        time_stamp: unix_timestamp(),
                    };
                    self.timers
                        .schedule(now + self.config.rssi_report_delay, Deferred::Report(event));
                }
            }
        }
    }

    fn include_grant(&mut self, id: LogicalId, address: Option<Address>, now: Instant) -> Result<()> {
        let displaced = address.filter(|wanted| {
            self.registry
                .id_of(*wanted)
                .map_or(false, |holder| holder != id)
        });
        let address = self
            .registry
            .grant_address(id, address, now + self.config.awake_grace)?;
        if let Some(taken) = displaced {
            self.queue.purge(taken);
        }
        if let Some(node) = self.registry.node_mut(address) {
            node.battery_requested = false;
        }
        self.save();

        let frame = encode(
            self.config.grant_address,
            self.config.gateway_address,
            FunctionCode::IncludeGrant,
            HalfSeconds::ZERO,
            &include_grant_payload(id, address),
        )?;
        self.timers.schedule(
            now + self.config.grant_delay,
            Deferred::Grant {
                frame,
                logical_id: id,
                address,
            },
        );
        self.emit(ManagementEvent::IncludeGrant { id, address });
        Ok(())
    }

    fn include_not(&mut self, id: LogicalId, now: Instant) -> Result<()> {
        let frame = encode(
            self.config.grant_address,
            self.config.gateway_address,
            FunctionCode::IncludeNot,
            HalfSeconds::ZERO,
            &include_not_payload(id),
        )?;
        info!(logical_id = id, "Inclusion refused");
        self.queue
            .enqueue(frame.clone(), UNINCLUDED_ADDRESS, FunctionCode::IncludeNot);
        self.timers.schedule(
            now + self.config.include_not_repeat,
            Deferred::Enqueue {
                frame,
                destination: UNINCLUDED_ADDRESS,
                function: FunctionCode::IncludeNot,
            },
        );
        Ok(())
    }

    /// Merges a config push into the node's pending request.
    /// It is encoded once the node next wakes.
    fn accept_config(&mut self, id: LogicalId, request: ConfigRequest) -> Result<()> {
        let address = self.registry.address_of(id).ok_or(Error::UnknownNode(id))?;
        let node = self
            .registry
            .node_mut(address)
            .ok_or(Error::UnknownNode(id))?;

        let reassign = request.is_reassign();
        let update = request.fields().is_update();
        node.pending_config = Some(ConfigRequest::merge(node.pending_config.take(), request));

        if !node.configuring {
            node.configuring = true;
            // Devices do not report entering state 0 after an auto reset
            if reassign {
                node.set_alert_state(0);
            } else if !update {
                node.alert_after_start = true;
                node.set_alert_state(0);
            }
        }
        debug!(logical_id = id, address, reassign, update, "Config pending");
        Ok(())
    }

    fn send_battery(&mut self, id: LogicalId) -> Result<()> {
        let address = self.registry.address_of(id).ok_or(Error::UnknownNode(id))?;
        if let Some(node) = self.registry.node_mut(address) {
            if node.battery_requested {
                debug!(logical_id = id, "Battery request already pending");
            }
            node.battery_requested = true;
        }
        Ok(())
    }

    fn update_address(&mut self, id: LogicalId, address: Address, now: Instant) -> Result<()> {
        self.registry.update_address(id, address, &mut self.queue)?;
        // A send scheduled under the old address would never find the node
        let rescheduled = self
            .registry
            .node(address)
            .map_or(false, |node| node.config_send_scheduled);
        if rescheduled {
            self.timers
                .schedule(now + self.config.config_send_delay, Deferred::SendConfig(address));
        }
        self.save();
        Ok(())
    }

    fn assign_node(&mut self, id: LogicalId, gateway: Address, now: Instant) -> Result<()> {
        if gateway == self.config.gateway_address {
            if self.registry.is_active(id) {
                info!(logical_id = id, "Node already active on this gateway");
                return Ok(());
            }
            self.registry.activate(id, now + self.config.assign_grace)?;
            info!(logical_id = id, "Node assigned to this gateway");
        } else if self.registry.is_active(id) {
            self.registry.deactivate(id);
            if let Some(address) = self.registry.address_of(id) {
                self.queue.purge(address);
            }
            info!(logical_id = id, gateway, "Node assigned to another gateway");
        } else {
            return Ok(());
        }
        self.save();
        Ok(())
    }

    fn reset_node(&mut self, id: LogicalId) -> Result<()> {
        let address = self.registry.address_of(id).ok_or(Error::UnknownNode(id))?;
        self.enqueue(address, address, FunctionCode::Reset, HalfSeconds::ZERO, &[]);
        Ok(())
    }

    fn request_battery(&mut self, address: Address, now: Instant) {
        if let Some(node) = self.registry.node_mut(address) {
            node.battery_requested = false;
        }
        info!(address, "Battery requested");
        let wakeup = self.next_wakeup(address, now);
        self.enqueue(address, address, FunctionCode::SendBattery, wakeup, &[]);
    }

    /// Encodes the node's pending config into queued frames
    fn send_config(&mut self, address: Address, now: Instant) {
        let pressed_wakeup = self.config.pressed_wakeup;
        let grace = self.config.grace_multiplier;

        let (frames, configuring) = {
            let node = match self.registry.node_mut(address) {
                Some(node) => node,
                None => return,
            };
            node.config_send_scheduled = false;
            let request = match node.pending_config.take() {
                Some(request) => request,
                None => return,
            };

            let encoded = self.encoder.encode(&request);
            if request.fields().contains("app_value") || encoded.has_modes() {
                node.wakeup_cursor = 0;
            }
            for (state, list) in encoded.wakeup_tables {
                node.wakeup_table.insert(state, list);
            }
            let configuring = std::mem::replace(&mut node.configuring, false);

            if let Some(delay) = encoded.reassign {
                let window = u32::from(pressed_wakeup.raw()).max(delay);
                node.next_deadline = Some(now + Duration::from_secs_f64(f64::from(window) * grace));
                info!(address, delay, "Reassign, config not transmitted");
                return;
            }
            (encoded.frames, configuring)
        };

        self.queue.supersede(address, FunctionCode::Config);
        for frame in frames {
            self.enqueue(address, address, FunctionCode::Config, frame.wakeup, &frame.payload);
        }
        if configuring {
            self.enqueue(address, address, FunctionCode::Start, pressed_wakeup, &[]);
        }
    }

    fn queue_ack(&mut self, address: Address, now: Instant) {
        let wakeup = self.next_wakeup(address, now);
        self.enqueue(address, address, FunctionCode::Ack, wakeup, &[]);
    }

    /// Wakeup for the next frame to `address`, scheduling a config send if due
    fn next_wakeup(&mut self, address: Address, now: Instant) -> HalfSeconds {
        let pending = self.queue.has_pending_for(address);
        let decision = match self.registry.node_mut(address) {
            Some(node) => self.scheduler.next_wakeup(node, pending, now),
            None => return self.config.fallback_wakeup,
        };
        if decision.schedule_config_send {
            self.timers
                .schedule(now + self.config.config_send_delay, Deferred::SendConfig(address));
        }
        decision.interval
    }

    fn run_deferred(&mut self, action: Deferred, now: Instant) {
        match action {
            Deferred::SendConfig(address) => self.send_config(address, now),
            Deferred::Grant {
                frame,
                logical_id,
                address,
            } => {
                let granted = self.registry.address_of(logical_id) == Some(address)
                    && self.registry.is_active(logical_id);
                if granted {
                    self.queue.enqueue(frame, address, FunctionCode::IncludeGrant);
                } else {
                    debug!(logical_id, address, "Grant superseded before sending");
                }
            }
            Deferred::Enqueue {
                frame,
                destination,
                function,
            } => self.queue.enqueue(frame, destination, function),
            Deferred::Report(event) => self.emit(event),
        }
    }

    fn enqueue(
        &mut self,
        frame_destination: Address,
        destination: Address,
        function: FunctionCode,
        wakeup: HalfSeconds,
        payload: &[u8],
    ) {
        match encode(frame_destination, self.config.gateway_address, function, wakeup, payload) {
            Ok(frame) => self.queue.enqueue(frame, destination, function),
            Err(e) => warn!(destination, %function, error = %e, "Frame not queued"),
        }
    }

    fn send_now(&mut self, destination: Address, function: FunctionCode) {
        match encode(destination, self.config.gateway_address, function, HalfSeconds::ZERO, &[]) {
            Ok(frame) => self.transmit(frame),
            Err(e) => warn!(destination, %function, error = %e, "Frame not sent"),
        }
    }

    fn transmit(&self, frame: Bytes) {
        self.radio(RadioCommand::Transmit(frame));
    }

    fn radio(&self, command: RadioCommand) {
        if self.radio_tx.send(command).is_err() {
            warn!("Radio adaptor channel closed");
        }
    }

    fn emit(&self, event: ManagementEvent) {
        debug!(?event, "Management event");
        if self.events_tx.send(event).is_err() {
            warn!("Management channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HEADER_LEN;
    use serde_json::json;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Harness {
        gateway: Gateway,
        radio: UnboundedReceiver<RadioCommand>,
        events: UnboundedReceiver<ManagementEvent>,
        now: Instant,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(GatewayConfig {
                rng_seed: Some(3),
                ..GatewayConfig::default()
            })
        }

        fn with_config(config: GatewayConfig) -> Self {
            let (radio_tx, radio) = mpsc::unbounded_channel();
            let (events_tx, events) = mpsc::unbounded_channel();
            let now = Instant::now();
            let mut gateway = Gateway::new(config, radio_tx, events_tx, now).unwrap();
            gateway.on_management_command(ManagementCommand::Init, now);
            Harness {
                gateway,
                radio,
                events,
                now,
            }
        }

        fn advance(&mut self, duration: Duration) {
            self.now += duration;
        }

        /// Ticks every 500ms until `duration` has passed
        fn run_for(&mut self, duration: Duration) {
            let end = self.now + duration;
            while self.now < end {
                self.advance(Duration::from_millis(500));
                self.gateway.tick(self.now);
            }
        }

        fn command(&mut self, command: ManagementCommand) {
            self.gateway.on_management_command(command, self.now);
        }

        fn receive(&mut self, source: Address, function: FunctionCode, payload: &[u8]) {
            let bytes = encode(1, source, function, HalfSeconds::ZERO, payload).unwrap();
            self.gateway.on_radio_frame(&bytes, self.now);
        }

        fn events(&mut self) -> Vec<ManagementEvent> {
            std::iter::from_fn(|| self.events.try_recv().ok()).collect()
        }

        fn sent(&mut self) -> Vec<DecodedFrame> {
            std::iter::from_fn(|| self.radio.try_recv().ok())
                .filter_map(|command| match command {
                    RadioCommand::Transmit(bytes) => match decode(&bytes).unwrap() {
                        Frame::Addressed(frame) => Some(frame),
                        Frame::Beacon { .. } => None,
                    },
                    RadioCommand::MeasureRssi => None,
                })
                .collect()
        }

        fn radio_commands(&mut self) -> Vec<RadioCommand> {
            std::iter::from_fn(|| self.radio.try_recv().ok()).collect()
        }

        fn queued(&self, destination: Address) -> Vec<DecodedFrame> {
            self.gateway
                .queue()
                .iter()
                .filter(|m| m.destination == destination)
                .filter_map(|m| match decode(&m.frame).unwrap() {
                    Frame::Addressed(frame) => Some(frame),
                    Frame::Beacon { .. } => None,
                })
                .collect()
        }

        /// Runs include_req, RSSI, grant, and the grant transmission for `id`
        fn include(&mut self, id: LogicalId) -> Address {
            self.receive(UNINCLUDED_ADDRESS, FunctionCode::IncludeReq, &id.to_be_bytes());
            self.gateway.on_rssi(-60, self.now);
            self.command(ManagementCommand::IncludeGrant { id, address: None });
            self.run_for(Duration::from_secs(6));
            self.events();
            self.radio_commands();
            self.gateway.registry().address_of(id).unwrap()
        }
    }

    #[test]
    fn test_include_then_alert_happy_path() {
        let mut h = Harness::new();

        h.receive(UNINCLUDED_ADDRESS, FunctionCode::IncludeReq, &[0, 0, 0, 42, 2, 0xF0]);
        assert_eq!(h.radio_commands(), vec![RadioCommand::MeasureRssi]);
        h.gateway.on_rssi(-70, h.now);
        match h.events().as_slice() {
            [ManagementEvent::IncludeReq {
                id: 42,
                version: 2,
                rssi: Some(-70),
                ..
            }] => {}
            other => panic!("unexpected events {:?}", other),
        }

        h.command(ManagementCommand::IncludeGrant { id: 42, address: None });
        assert_eq!(
            h.events(),
            vec![ManagementEvent::IncludeGrant { id: 42, address: 1 }]
        );
        assert!(h.queued(1).is_empty());

        h.run_for(Duration::from_secs(6));
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].function, FunctionCode::IncludeGrant);
        assert_eq!(sent[0].destination, 0xBB00);
        assert_eq!(sent[0].wakeup, HalfSeconds::ZERO);
        assert_eq!(sent[0].payload.as_ref(), &[0, 0, 0, 42, 0, 1]);

        h.receive(1, FunctionCode::Alert, &[0x01, 0x00]);
        assert_eq!(
            h.events(),
            vec![ManagementEvent::Alert {
                id: 42,
                alert_type: 0x0100,
                category: AlertCategory::Cleared,
            }]
        );
        let acks: Vec<_> = h
            .queued(1)
            .into_iter()
            .filter(|f| f.function == FunctionCode::Ack)
            .collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].wakeup, HalfSeconds::ZERO);
    }

    #[test]
    fn test_grant_ack_queues_sleep_ack() {
        let mut h = Harness::new();
        let address = h.include(42);

        h.receive(address, FunctionCode::Ack, &[]);
        let queued = h.queued(address);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].function, FunctionCode::Ack);
        assert_eq!(queued[0].wakeup, HalfSeconds(300));
    }

    #[test]
    fn test_repeated_alert_acked_not_forwarded() {
        let mut h = Harness::new();
        let address = h.include(42);
        h.receive(address, FunctionCode::Ack, &[]);
        h.run_for(Duration::from_secs(1));
        h.sent();

        h.receive(address, FunctionCode::Alert, &[0x00, 0x02]);
        assert_eq!(h.events().len(), 1);
        h.run_for(Duration::from_secs(1));
        h.receive(address, FunctionCode::Alert, &[0x00, 0x02]);
        assert!(h.events().is_empty());
        assert_eq!(h.queued(address).len(), 1);
        assert_eq!(h.gateway.registry().node(address).unwrap().alert_state, Some(2));
    }

    #[test]
    fn test_battery_alert() {
        let mut h = Harness::new();
        let address = h.include(42);

        h.receive(address, FunctionCode::Alert, &[0x02, 100, 0xC4, 21]);
        match h.events().as_slice() {
            [ManagementEvent::Battery {
                id: 42,
                percent,
                rssi: Some(-60),
                temperature: Some(21),
            }] => assert!((percent - 100.0 * 0.235668 / 10.0).abs() < 1e-9),
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(h.gateway.registry().node(address).unwrap().alert_state, None);
    }

    #[test]
    fn test_config_push_merges_and_sends_app_value_last() {
        let mut h = Harness::new();
        let address = h.include(42);
        h.receive(address, FunctionCode::Ack, &[]);
        h.run_for(Duration::from_secs(1));
        h.sent();

        let full = json!({"name": "X"});
        let partial = json!({"app_value": 3});
        h.command(ManagementCommand::Config {
            id: 42,
            config: full.as_object().unwrap().clone(),
        });
        h.command(ManagementCommand::Config {
            id: 42,
            config: partial.as_object().unwrap().clone(),
        });

        let pending = h
            .gateway
            .registry()
            .node(address)
            .unwrap()
            .pending_config
            .clone()
            .unwrap();
        assert!(matches!(pending, ConfigRequest::Full(_)));
        assert!(pending.fields().contains("name"));
        assert!(pending.fields().contains("app_value"));

        // Node wakes: ack carries wakeup 0 and the send follows after the delay
        h.receive(address, FunctionCode::Alert, &[0x00, 0x01]);
        assert!(h.queued(address)[0].wakeup.is_zero());
        h.run_for(Duration::from_secs(4));

        let mut functions = Vec::new();
        for _ in 0..6 {
            for frame in h.sent() {
                if frame.function != FunctionCode::Ack {
                    functions.push((frame.function, frame.payload.clone(), frame.wakeup));
                    h.receive(address, FunctionCode::Ack, &[]);
                }
            }
            h.run_for(Duration::from_secs(1));
        }

        assert_eq!(functions.len(), 3);
        assert_eq!(functions[0].0, FunctionCode::Config);
        assert!(functions[0].1.starts_with(&[b'S', 22]));
        assert_eq!(functions[1].0, FunctionCode::Config);
        assert_eq!(functions[1].1.as_ref(), &[b'A', 3, b'E', b'S']);
        assert_eq!(functions[1].2, HalfSeconds(30));
        assert_eq!(functions[2].0, FunctionCode::Start);
        assert_eq!(functions[2].2, HalfSeconds(300));

        // The start ack reports alert state 0
        assert!(h.events().contains(&ManagementEvent::Alert {
            id: 42,
            alert_type: 0,
            category: AlertCategory::Pressed,
        }));
        assert!(!h.gateway.registry().node(address).unwrap().configuring);
    }

    #[test]
    fn test_reassign_config_not_transmitted() {
        let mut h = Harness::new();
        let address = h.include(42);
        h.receive(address, FunctionCode::Ack, &[]);
        h.run_for(Duration::from_secs(1));
        h.sent();

        let config = json!({"reassign": 600});
        h.command(ManagementCommand::Config {
            id: 42,
            config: config.as_object().unwrap().clone(),
        });
        h.receive(address, FunctionCode::Alert, &[0x00, 0x01]);
        h.run_for(Duration::from_secs(5));

        let node = h.gateway.registry().node(address).unwrap();
        assert!(node.pending_config.is_none());
        assert!(!node.configuring);
        assert!(h
            .queued(address)
            .iter()
            .all(|f| f.function != FunctionCode::Config));
    }

    #[test]
    fn test_retry_exhaustion_evicts_node() {
        let mut h = Harness::new();
        let address = h.include(42);
        assert!(h.gateway.queue().is_in_flight(address));

        h.run_for(Duration::from_secs(120));
        assert_eq!(h.gateway.registry().address_of(42), None);
        assert!(!h.gateway.queue().has_pending_for(address));

        let grants = h
            .sent()
            .into_iter()
            .filter(|f| f.function == FunctionCode::IncludeGrant)
            .count();
        assert_eq!(grants, 9);
    }

    #[test]
    fn test_battery_request_after_ack() {
        let mut h = Harness::new();
        let address = h.include(42);
        h.receive(address, FunctionCode::Ack, &[]);
        h.command(ManagementCommand::SendBattery { id: 42 });

        h.run_for(Duration::from_secs(1));
        let sent = h.sent();
        assert_eq!(sent[0].function, FunctionCode::Ack);
        assert!(h
            .queued(address)
            .iter()
            .any(|f| f.function == FunctionCode::SendBattery));
        assert!(!h.gateway.registry().node(address).unwrap().battery_requested);
    }

    #[test]
    fn test_woken_up_from_active_node() {
        let mut h = Harness::new();
        let address = h.include(42);
        h.receive(address, FunctionCode::Ack, &[]);
        h.run_for(Duration::from_secs(1));
        h.sent();

        h.receive(address, FunctionCode::WokenUp, &[]);
        assert_eq!(h.radio_commands(), vec![RadioCommand::MeasureRssi]);
        h.gateway.on_rssi(-55, h.now);
        match h.events().as_slice() {
            [ManagementEvent::WokenUp {
                id: 42,
                rssi: Some(-55),
                ..
            }] => {}
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(h.queued(address)[0].function, FunctionCode::Ack);
    }

    #[test]
    fn test_woken_up_from_unknown_reports_rssi_later() {
        let mut h = Harness::new();
        h.receive(77, FunctionCode::WokenUp, &[]);
        assert_eq!(h.radio_commands(), vec![RadioCommand::MeasureRssi]);
        h.gateway.on_rssi(-80, h.now);
        assert!(h.events().is_empty());

        h.run_for(Duration::from_secs(4));
        match h.events().as_slice() {
            [ManagementEvent::Rssi {
                address: 77,
                id: None,
                rssi: -80,
                ..
            }] => {}
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_measurement_is_single_flight() {
        let mut h = Harness::new();
        h.receive(77, FunctionCode::WokenUp, &[]);
        h.receive(78, FunctionCode::WokenUp, &[]);
        assert_eq!(h.radio_commands(), vec![RadioCommand::MeasureRssi]);
        assert!(h.gateway.status().measuring);
    }

    #[test]
    fn test_monitor_excludes_once() {
        let mut h = Harness::new();
        h.include(42);

        h.advance(Duration::from_secs(721));
        h.gateway.monitor(h.now);
        assert_eq!(h.events(), vec![ManagementEvent::ExcludeReq { id: 42 }]);
        h.advance(Duration::from_secs(10));
        h.gateway.monitor(h.now);
        assert!(h.events().is_empty());
        assert!(h.gateway.registry().is_excluded(42));
    }

    #[test]
    fn test_link_down_drops_frames() {
        let mut h = Harness::new();
        h.advance(Duration::from_secs(1021));
        h.gateway.monitor(h.now);
        assert!(!h.gateway.is_connected());

        h.receive(UNINCLUDED_ADDRESS, FunctionCode::IncludeReq, &[0, 0, 0, 42]);
        assert!(h.radio_commands().is_empty());
    }

    #[test]
    fn test_link_check_emits_init() {
        let mut h = Harness::new();
        h.run_for(Duration::from_secs(10));
        assert_eq!(h.events(), vec![ManagementEvent::Init]);
        h.run_for(Duration::from_secs(60));
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_include_not_sent_twice() {
        let mut h = Harness::new();
        h.command(ManagementCommand::IncludeNot { id: 9 });
        h.run_for(Duration::from_secs(8));
        let refusals: Vec<_> = h
            .sent()
            .into_iter()
            .filter(|f| f.function == FunctionCode::IncludeNot)
            .collect();
        assert_eq!(refusals.len(), 2);
        assert_eq!(refusals[0].payload.as_ref(), &[0, 0, 0, 9]);
    }

    #[test]
    fn test_beacon_when_idle() {
        let mut h = Harness::new();
        h.run_for(Duration::from_secs(10));
        let beacons = h
            .radio_commands()
            .into_iter()
            .filter(|c| matches!(c, RadioCommand::Transmit(bytes) if bytes.len() < HEADER_LEN))
            .count();
        assert_eq!(beacons, 1);
    }

    #[test]
    fn test_undefined_function_acked() {
        let mut h = Harness::new();
        let address = h.include(42);
        h.receive(address, FunctionCode::Undefined(0x42), &[]);
        assert!(h
            .queued(address)
            .iter()
            .any(|f| f.function == FunctionCode::Ack));
    }

    #[test]
    fn test_assign_node_elsewhere_deactivates() {
        let mut h = Harness::new();
        let address = h.include(42);
        h.command(ManagementCommand::AssignNode { id: 42, gateway: 9 });
        assert!(!h.gateway.registry().is_active(42));
        assert!(!h.gateway.queue().has_pending_for(address));

        h.command(ManagementCommand::AssignNode { id: 42, gateway: 1 });
        assert!(h.gateway.registry().is_active(42));
    }

    #[test]
    fn test_remove_node_is_idempotent() {
        let mut h = Harness::new();
        let address = h.include(42);
        h.command(ManagementCommand::RemoveNode { id: 42 });
        h.command(ManagementCommand::RemoveNode { id: 42 });
        assert!(h.gateway.registry().is_empty());
        assert!(!h.gateway.queue().has_pending_for(address));
    }

    #[test]
    fn test_withdrawn_grant_is_not_sent() {
        let mut h = Harness::new();
        h.command(ManagementCommand::IncludeGrant { id: 42, address: None });
        h.command(ManagementCommand::RemoveNode { id: 42 });
        h.run_for(Duration::from_secs(75));

        assert!(h.gateway.registry().is_empty());
        assert!(h.gateway.queue().is_empty());
        assert!(h
            .sent()
            .iter()
            .all(|f| f.function != FunctionCode::IncludeGrant));
    }

    #[test]
    fn test_grant_superseded_by_new_include_request() {
        let mut h = Harness::new();
        h.command(ManagementCommand::IncludeGrant { id: 42, address: None });
        h.receive(UNINCLUDED_ADDRESS, FunctionCode::IncludeReq, &42u32.to_be_bytes());
        h.run_for(Duration::from_secs(10));

        assert_eq!(h.gateway.registry().address_of(42), Some(1));
        assert!(!h.gateway.registry().is_active(42));
        assert!(h
            .sent()
            .iter()
            .all(|f| f.function != FunctionCode::IncludeGrant));
    }

    #[test]
    fn test_update_address_keeps_scheduled_config_send() {
        let mut h = Harness::new();
        let address = h.include(42);
        h.receive(address, FunctionCode::Ack, &[]);
        h.run_for(Duration::from_secs(1));
        h.sent();

        let config = json!({"name": "X"});
        h.command(ManagementCommand::Config {
            id: 42,
            config: config.as_object().unwrap().clone(),
        });
        h.receive(address, FunctionCode::Alert, &[0x00, 0x01]);
        assert!(h.gateway.registry().node(address).unwrap().config_send_scheduled);

        h.command(ManagementCommand::UpdateAddress { id: 42, address: 7 });
        assert!(!h.gateway.queue().has_pending_for(address));
        h.run_for(Duration::from_secs(5));

        let node = h.gateway.registry().node(7).unwrap();
        assert!(node.pending_config.is_none());
        assert!(h
            .sent()
            .iter()
            .any(|f| f.function == FunctionCode::Config && f.destination == 7));
    }

    #[test]
    fn test_explicit_grant_takes_over_address_and_its_traffic() {
        let mut h = Harness::new();
        let address = h.include(42);
        h.command(ManagementCommand::Reset { id: 42 });
        assert!(h.gateway.queue().has_pending_for(address));

        h.command(ManagementCommand::IncludeGrant {
            id: 43,
            address: Some(address),
        });
        assert_eq!(h.gateway.registry().address_of(42), None);
        assert_eq!(h.gateway.registry().id_of(address), Some(43));
        assert!(!h.gateway.queue().has_pending_for(address));
    }

    #[test]
    fn test_state_survives_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = GatewayConfig {
            state_path: Some(dir.path().join("registry.bin")),
            ..GatewayConfig::default()
        };
        let mut h = Harness::with_config(config.clone());
        h.include(42);
        h.gateway.persist().unwrap();

        let restarted = Harness::with_config(config);
        assert_eq!(restarted.gateway.registry().address_of(42), Some(1));
        assert!(restarted.gateway.registry().is_active(42));
    }
}
