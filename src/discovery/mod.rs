//! Signal strength discovery module
//!
//! This module tracks the single outstanding RSSI measurement and remembers
//! what prompted it, so the result can be attached to the right event.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::core::{Address, LogicalId};

/// Why a measurement was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementPurpose {
    /// A node asked to be included
    Include { logical_id: LogicalId, version: i8 },
    /// An active node reported it woke up
    Wake,
    /// Contact from an unknown or inactive address
    Probe,
}

/// The outstanding measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    /// Source address of the frame being measured
    pub address: Address,
    pub purpose: MeasurementPurpose,
    pub requested_at: Instant,
}

/// Result correlated with the request that caused it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlated {
    pub measurement: Measurement,
    /// `None` when the measurement timed out
    pub rssi: Option<i16>,
}

/// Single-flight RSSI measurement tracker
#[derive(Debug)]
pub struct DiscoveryCoordinator {
    pending: Option<Measurement>,
    timeout: Duration,
}

impl DiscoveryCoordinator {
    pub fn new(timeout: Duration) -> Self {
        DiscoveryCoordinator {
            pending: None,
            timeout,
        }
    }

    /// Starts a measurement for `address`.
    ///
    /// Returns false, dropping the request, if one is already outstanding.
    /// The caller issues the radio request only on true.
    pub fn request(&mut self, address: Address, purpose: MeasurementPurpose, now: Instant) -> bool {
        if let Some(pending) = &self.pending {
            warn!(
                address,
                busy_with = pending.address,
                ?purpose,
                "RSSI measurement already outstanding, request dropped"
            );
            return false;
        }
        debug!(address, ?purpose, "RSSI measurement requested");
        self.pending = Some(Measurement {
            address,
            purpose,
            requested_at: now,
        });
        true
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<&Measurement> {
        self.pending.as_ref()
    }

    /// Closes the outstanding measurement with its result.
    /// An unrequested result yields `None`.
    pub fn complete(&mut self, rssi: i16) -> Option<Correlated> {
        match self.pending.take() {
            Some(measurement) => {
                debug!(address = measurement.address, rssi, "RSSI measured");
                Some(Correlated {
                    measurement,
                    rssi: Some(rssi),
                })
            }
            None => {
                warn!(rssi, "RSSI result with no outstanding request");
                None
            }
        }
    }

    /// Abandons a measurement unanswered for longer than the timeout
    pub fn expire(&mut self, now: Instant) -> Option<Correlated> {
        let expired = self
            .pending
            .filter(|m| now.saturating_duration_since(m.requested_at) > self.timeout)?;
        self.pending = None;
        warn!(address = expired.address, "RSSI measurement timed out");
        Some(Correlated {
            measurement: expired,
            rssi: None,
        })
    }
}
