//! Rolling device-tick to wall-clock conversion.
//!
//! Streaming devices stamp samples with a 32-bit hardware tick counter that
//! wraps every few minutes at the default 50 MHz tick rate. This module keeps
//! one record per device id and turns consecutive tick values into absolute
//! timestamps, detecting counter rollover and guarding against out-of-order
//! ticks that would otherwise look like a rollover.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

/// 20 ns per tick, i.e. a 50 MHz tick counter.
pub const DEFAULT_TICK_PERIOD: f64 = 20e-9;

/// A genuine rollover at the default tick rate advances time by well under a
/// second. A "rollover" that would advance time by more than this many seconds
/// is an out-of-order tick instead.
const ROLLOVER_GUARD_SECONDS: f64 = 10.0;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClockError {
    #[error("tick period must be strictly positive, got {0}")]
    InvalidTickPeriod(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedTick {
    pub timestamp: DateTime<Utc>,
    pub is_first: bool,
    pub cycles: u32,
    pub seconds: f64,
    pub rollover: bool,
}

/// Elapsed cycles and seconds between two tick readings, modulo 2^32.
/// Returns `(cycles, seconds, rollover)`; `seconds` is negative when the
/// false-positive guard reclassifies the step as out-of-order.
pub(crate) fn tick_delta(prev: u32, next: u32, tick_period: f64) -> (u32, f64, bool) {
    let rollover = prev > next;
    let cycles = next.wrapping_sub(prev);
    let seconds = cycles as f64 * tick_period;
    if rollover && seconds > ROLLOVER_GUARD_SECONDS {
        let cycles = prev - next;
        return (cycles, -(cycles as f64) * tick_period, false);
    }
    (cycles, seconds, rollover)
}

fn seconds_to_delta(seconds: f64) -> TimeDelta {
    TimeDelta::nanoseconds((seconds * 1e9).round() as i64)
}

struct DeviceTickState {
    prev_tick: u32,
    prev_wall: DateTime<Utc>,
}

/// Per-device tick-to-wall-clock state. The device map is safe for concurrent
/// lookup; each device's record is serialized by its own mutex.
pub struct TimestampProcessor {
    tick_period: f64,
    devices: Mutex<HashMap<String, Arc<Mutex<Option<DeviceTickState>>>>>,
}

impl Default for TimestampProcessor {
    fn default() -> Self {
        TimestampProcessor::new(DEFAULT_TICK_PERIOD).unwrap()
    }
}

impl TimestampProcessor {
    pub fn new(tick_period: f64) -> Result<Self, ClockError> {
        if !(tick_period > 0.0) {
            return Err(ClockError::InvalidTickPeriod(tick_period));
        }
        Ok(TimestampProcessor {
            tick_period,
            devices: Mutex::new(HashMap::new()),
        })
    }

    pub fn tick_period(&self) -> f64 {
        self.tick_period
    }

    /// Convert one tick reading for `device_id`, anchoring the first reading
    /// at the current wall-clock.
    pub fn process(&self, device_id: &str, device_tick: u32) -> ProcessedTick {
        self.process_at(device_id, device_tick, Utc::now())
    }

    /// Convert one tick reading, anchoring the first reading at `now`.
    /// Readings after the first ignore `now` entirely.
    pub fn process_at(&self, device_id: &str, device_tick: u32, now: DateTime<Utc>) -> ProcessedTick {
        let entry = {
            let mut devices = self.devices.lock().unwrap();
            devices.entry(device_id.to_string()).or_default().clone()
        };
        let mut state = entry.lock().unwrap();

        match state.as_mut() {
            None => {
                *state = Some(DeviceTickState {
                    prev_tick: device_tick,
                    prev_wall: now,
                });
                ProcessedTick {
                    timestamp: now,
                    is_first: true,
                    cycles: 0,
                    seconds: 0.0,
                    rollover: false,
                }
            }
            Some(prev) => {
                let (cycles, seconds, rollover) =
                    tick_delta(prev.prev_tick, device_tick, self.tick_period);
                let timestamp = prev.prev_wall + seconds_to_delta(seconds);
                prev.prev_tick = device_tick;
                prev.prev_wall = timestamp;
                ProcessedTick {
                    timestamp,
                    is_first: false,
                    cycles,
                    seconds,
                    rollover,
                }
            }
        }
    }

    /// Drop one device's state so its next reading re-anchors.
    pub fn reset(&self, device_id: &str) {
        self.devices.lock().unwrap().remove(device_id);
    }

    pub fn reset_all(&self) {
        self.devices.lock().unwrap().clear();
    }
}
