//! Beacon cycle pacing

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::core::GatewayConfig;

/// Decides which drain ticks are beacon cycles.
///
/// The first beacon follows `initial_interval` plain ticks; each later gap
/// is drawn from `choices` so neighbouring gateways drift apart.
#[derive(Debug)]
pub struct BeaconCadence {
    ticks_since_beacon: u32,
    interval: u32,
    choices: Vec<u32>,
    rng: StdRng,
}

impl BeaconCadence {
    pub fn new(initial_interval: u32, choices: Vec<u32>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        BeaconCadence {
            ticks_since_beacon: 0,
            interval: initial_interval,
            choices,
            rng,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.initial_beacon_interval,
            config.beacon_interval_choices.clone(),
            config.rng_seed,
        )
    }

    /// Advances one tick; true if this tick is a beacon cycle
    pub fn next_tick(&mut self) -> bool {
        if self.ticks_since_beacon >= self.interval {
            self.ticks_since_beacon = 0;
            if let Some(next) = self.choices.choose(&mut self.rng) {
                self.interval = *next;
            }
            true
        } else {
            self.ticks_since_beacon += 1;
            false
        }
    }

    /// Plain ticks until the next beacon cycle
    pub fn interval(&self) -> u32 {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon_ticks(cadence: &mut BeaconCadence, ticks: usize) -> Vec<usize> {
        (0..ticks).filter(|_| cadence.next_tick()).collect::<Vec<_>>()
    }

    #[test]
    fn test_first_beacon_after_initial_interval() {
        let mut cadence = BeaconCadence::new(6, vec![10, 12], Some(1));
        let flags: Vec<bool> = (0..7).map(|_| cadence.next_tick()).collect();
        assert_eq!(flags, vec![false, false, false, false, false, false, true]);
        assert!(cadence.interval() == 10 || cadence.interval() == 12);
    }

    #[test]
    fn test_gaps_drawn_from_choices() {
        let mut cadence = BeaconCadence::new(0, vec![10, 12], Some(7));
        let mut last = None;
        let mut beacons = 0;
        for tick in 0..500usize {
            if cadence.next_tick() {
                if let Some(previous) = last {
                    let gap = tick - previous;
                    assert!(gap == 11 || gap == 13, "gap {}", gap);
                }
                last = Some(tick);
                beacons += 1;
            }
        }
        assert!(beacons > 30);
    }

    #[test]
    fn test_seeded_cadence_is_deterministic() {
        let mut a = BeaconCadence::new(6, vec![10, 12], Some(99));
        let mut b = BeaconCadence::new(6, vec![10, 12], Some(99));
        assert_eq!(beacon_ticks(&mut a, 300), beacon_ticks(&mut b, 300));
    }
}
