//! Latest-value telemetry cache shared between the receive loop, the sequencer
//! and any external poller.
//!
//! This is not a queue: every decoded frame overwrites the previous value of its
//! kind. Readers that want an average sample the store repeatedly.

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use crate::codec::{CurrentBlock, TelemetryEvent};

/// Weight of a new sample in the filtered output voltage.
pub const VOLTAGE_FILTER_ALPHA: f64 = 0.1;

/// RMS and mean of one leg's current, raw ADC units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct LegCurrent {
    pub rms: f64,
    pub avg: f64,
}

impl LegCurrent {
    /// Both values are NaN for an empty sample set.
    pub fn from_samples(samples: &[i16]) -> Self {
        let n = samples.len() as f64;
        let sum: f64 = samples.iter().map(|&s| f64::from(s)).sum();
        let sum_sq: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
        Self {
            rms: (sum_sq / n).sqrt(),
            avg: sum / n,
        }
    }
}

/// Per-leg current statistics of the latest block.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PhaseCurrents {
    pub a: LegCurrent,
    pub b: LegCurrent,
    pub c: LegCurrent,
}

impl PhaseCurrents {
    pub fn from_block(block: &CurrentBlock) -> Self {
        Self {
            a: LegCurrent::from_samples(&block.ia),
            b: LegCurrent::from_samples(&block.ib),
            c: LegCurrent::from_samples(&block.ic),
        }
    }

    pub fn rms(&self) -> [f64; 3] {
        [self.a.rms, self.b.rms, self.c.rms]
    }

    pub fn avg(&self) -> [f64; 3] {
        [self.a.avg, self.b.avg, self.c.avg]
    }

    /// False when any leg statistic is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.rms().iter().chain(self.avg().iter()).all(|v| v.is_finite())
    }
}

/// Point-in-time copy of the store, as handed to pollers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    /// Last output-voltage sample, volts.
    pub output_voltage: f64,
    /// Single-pole IIR average of the output voltage, volts.
    pub filtered_voltage: f64,
    /// Commanded load current, amps.
    pub load_current_setpoint: f64,
    /// Commanded test current, amps.
    pub test_current_setpoint: f64,
    pub currents: PhaseCurrents,
    pub acks: u64,
    pub unrecognized: u64,
    /// Milliseconds since the last voltage or current frame; `None` before the first one.
    pub age_ms: Option<u64>,
    pub voltage_age_ms: Option<u64>,
    pub currents_age_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct Telemetry {
    output_voltage: f64,
    filtered_voltage: f64,
    load_current_setpoint: f64,
    test_current_setpoint: f64,
    currents: PhaseCurrents,
    acks: u64,
    unrecognized: u64,
    voltage_updated_at: Option<Instant>,
    currents_updated_at: Option<Instant>,
}

impl Telemetry {
    fn updated_at(&self) -> Option<Instant> {
        self.voltage_updated_at.max(self.currents_updated_at)
    }
}

fn elapsed_ms(at: Option<Instant>) -> Option<u64> {
    at.map(|t| t.elapsed().as_millis() as u64)
}

/// Thread-safe latest-value cache.
#[derive(Debug)]
pub struct TelemetryStore {
    inner: RwLock<Telemetry>,
    voltage_scale: RwLock<f64>,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl TelemetryStore {
    /// `voltage_scale` multiplies every decoded voltage sample (fixture correction).
    pub fn new(voltage_scale: f64) -> Self {
        Self {
            inner: RwLock::new(Telemetry::default()),
            voltage_scale: RwLock::new(voltage_scale),
        }
    }

    pub fn set_voltage_scale(&self, scale: f64) {
        *self.voltage_scale.write() = scale;
    }

    /// Fold one decoded event into the store.
    pub fn apply(&self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::Ack => self.inner.write().acks += 1,
            TelemetryEvent::VoltageSample { .. } => {
                let Some(volts) = event.volts() else { return };
                let volts = volts * *self.voltage_scale.read();
                let mut t = self.inner.write();
                t.output_voltage = volts;
                t.filtered_voltage += (volts - t.filtered_voltage) * VOLTAGE_FILTER_ALPHA;
                t.voltage_updated_at = Some(Instant::now());
            }
            // A block without a single pair carries no statistics.
            TelemetryEvent::CurrentTriplet(block) if block.is_empty() => {
                self.inner.write().unrecognized += 1
            }
            TelemetryEvent::CurrentTriplet(block) => {
                let currents = PhaseCurrents::from_block(block);
                let mut t = self.inner.write();
                t.currents = currents;
                t.currents_updated_at = Some(Instant::now());
            }
            TelemetryEvent::Unrecognized(_) => self.inner.write().unrecognized += 1,
        }
    }

    pub fn set_load_current_setpoint(&self, milliamps: i16) {
        self.inner.write().load_current_setpoint = f64::from(milliamps) / 1000.0;
    }

    pub fn set_test_current_setpoint(&self, milliamps: i16) {
        self.inner.write().test_current_setpoint = f64::from(milliamps) / 1000.0;
    }

    pub fn output_voltage(&self) -> f64 {
        self.inner.read().output_voltage
    }

    pub fn filtered_voltage(&self) -> f64 {
        self.inner.read().filtered_voltage
    }

    pub fn currents(&self) -> PhaseCurrents {
        self.inner.read().currents
    }

    /// Time since the last voltage or current frame.
    pub fn age(&self) -> Option<Duration> {
        self.inner.read().updated_at().map(|t| t.elapsed())
    }

    pub fn voltage_age(&self) -> Option<Duration> {
        self.inner.read().voltage_updated_at.map(|t| t.elapsed())
    }

    pub fn currents_age(&self) -> Option<Duration> {
        self.inner.read().currents_updated_at.map(|t| t.elapsed())
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let t = self.inner.read();
        TelemetrySnapshot {
            output_voltage: t.output_voltage,
            filtered_voltage: t.filtered_voltage,
            load_current_setpoint: t.load_current_setpoint,
            test_current_setpoint: t.test_current_setpoint,
            currents: t.currents,
            acks: t.acks,
            unrecognized: t.unrecognized,
            age_ms: elapsed_ms(t.updated_at()),
            voltage_age_ms: elapsed_ms(t.voltage_updated_at),
            currents_age_ms: elapsed_ms(t.currents_updated_at),
        }
    }

    /// Forget everything, e.g. after the link was reopened.
    pub fn clear(&self) {
        *self.inner.write() = Telemetry::default();
    }
}
