//! Tokio driver for the gateway engine
//!
//! A single task owns the [`Gateway`] and feeds it inbound events, the drain
//! tick, and the monitor tick until shutdown.

use std::future::Future;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::Gateway;
use crate::core::{Error, Result};
use crate::management::ManagementCommand;

/// Input delivered to the engine task
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Raw frame from the radio adaptor
    RadioFrame(Bytes),
    /// Answer to an RSSI measurement request
    Rssi(i16),
    /// Parsed management command
    Management(ManagementCommand),
}

/// Runs `gateway` until `shutdown` resolves, then persists the registry.
///
/// Returns an error if the inbound channel closes before shutdown.
pub async fn run<F>(
    mut gateway: Gateway,
    mut inbound: mpsc::Receiver<InboundEvent>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let config = gateway.config().clone();
    let mut tick = interval(config.tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut monitor = interval(config.monitor_interval);
    monitor.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    info!(address = config.gateway_address, "Gateway running");

    let result = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break Ok(());
            }
            event = inbound.recv() => {
                let now = Instant::now().into_std();
                match event {
                    Some(InboundEvent::RadioFrame(frame)) => gateway.on_radio_frame(&frame, now),
                    Some(InboundEvent::Rssi(rssi)) => gateway.on_rssi(rssi, now),
                    Some(InboundEvent::Management(command)) => {
                        debug!(?command, "Management command");
                        gateway.on_management_command(command, now);
                    }
                    None => break Err(Error::channel("inbound channel closed")),
                }
            }
            instant = tick.tick() => gateway.tick(instant.into_std()),
            instant = monitor.tick() => gateway.monitor(instant.into_std()),
        }
    };

    if let Err(e) = gateway.persist() {
        warn!(error = %e, "Could not save registry state on shutdown");
    }
    result
}
