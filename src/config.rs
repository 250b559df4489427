//! Bench and test-profile configuration.
//!
//! Everything that drifted between bench firmware/fixture revisions (regulation
//! setpoint, tolerance, voltage scale correction, stimulus ramps, window sizes)
//! lives in a named [`TestProfile`] instead of in the sequencer code.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{BenchError, Result};

/// Baud rate of the bench controller's virtual COM port.
pub const BAUD_RATE: u32 = 1_843_200;

/// Profile used when none is configured.
pub const DEFAULT_PROFILE: &str = "parallel-v3";

const STLINK_VID: u16 = 0x0483;
const STLINK_PID: u16 = 0x374B;
const BENCH_SERIAL_NUMBER: &str = "066DFF313358353143085514";

/// Timing of one command on the wire: header, settle, payload, then pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireTiming {
    /// Delay between the 4-byte header and the payload write.
    pub header_settle_ms: u64,
    /// Delay after the payload before the next command may be written.
    pub inter_command_ms: u64,
}

impl WireTiming {
    /// No delays at all. Only useful against simulated links.
    pub const ZERO: WireTiming = WireTiming {
        header_settle_ms: 0,
        inter_command_ms: 0,
    };

    pub fn header_settle(&self) -> Duration {
        Duration::from_millis(self.header_settle_ms)
    }

    pub fn inter_command(&self) -> Duration {
        Duration::from_millis(self.inter_command_ms)
    }
}

impl Default for WireTiming {
    fn default() -> Self {
        Self {
            header_settle_ms: 2,
            inter_command_ms: 100,
        }
    }
}

/// USB identity of the bench controller's ST-Link bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbMatch {
    pub vid: u16,
    pub pid: u16,
    /// When `None`, any serial number matches.
    pub serial_number: Option<String>,
}

impl Default for UsbMatch {
    fn default() -> Self {
        Self {
            vid: STLINK_VID,
            pid: STLINK_PID,
            serial_number: Some(BENCH_SERIAL_NUMBER.to_string()),
        }
    }
}

/// A stimulus ramp in milliamps, inclusive of both ends, ascending or descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ramp {
    pub from_ma: i16,
    pub to_ma: i16,
    pub step_ma: i16,
    /// Wait after each step.
    pub settle_ms: u64,
    /// Extra wait after the last step.
    #[serde(default)]
    pub hold_ms: u64,
}

impl Ramp {
    pub const fn new(from_ma: i16, to_ma: i16, step_ma: i16, settle_ms: u64) -> Self {
        Self {
            from_ma,
            to_ma,
            step_ma,
            settle_ms,
            hold_ms: 0,
        }
    }

    pub const fn with_hold(mut self, hold_ms: u64) -> Self {
        self.hold_ms = hold_ms;
        self
    }

    /// Setpoints visited by the ramp. A zero step is treated as 1 mA.
    pub fn points(&self) -> Vec<i16> {
        let step = i32::from(self.step_ma).abs().max(1);
        let from = i32::from(self.from_ma);
        let to = i32::from(self.to_ma);
        let step = if to >= from { step } else { -step };

        let mut points = Vec::new();
        let mut value = from;
        while (step > 0 && value <= to) || (step < 0 && value >= to) {
            points.push(value as i16);
            value += step;
        }
        points
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }
}

/// Fixed waits used by the sequencer outside of ramps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerTiming {
    /// Interval between two reads of the telemetry store inside a sampling window.
    pub sample_interval_ms: u64,
    /// Wait between arming Ia/Ib sampling and starting the inverter.
    pub arm_delay_ms: u64,
    /// Wait between the regulation verdict and the stop command.
    pub pre_stop_delay_ms: u64,
    /// Maximum telemetry age accepted before a sampling window; `None` disables the check.
    pub stall_timeout_ms: Option<u64>,
}

impl SequencerTiming {
    pub const ZERO: SequencerTiming = SequencerTiming {
        sample_interval_ms: 0,
        arm_delay_ms: 0,
        pre_stop_delay_ms: 0,
        stall_timeout_ms: None,
    };

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn arm_delay(&self) -> Duration {
        Duration::from_millis(self.arm_delay_ms)
    }

    pub fn pre_stop_delay(&self) -> Duration {
        Duration::from_millis(self.pre_stop_delay_ms)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for SequencerTiming {
    fn default() -> Self {
        Self {
            sample_interval_ms: 100,
            arm_delay_ms: 100,
            pre_stop_delay_ms: 200,
            stall_timeout_ms: Some(2_000),
        }
    }
}

/// Thresholds, ramps and windows of one acceptance-test revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestProfile {
    pub name: String,
    /// Expected regulated output voltage, volts.
    pub regulation_setpoint_v: f64,
    /// Accepted absolute deviation from the setpoint, volts.
    pub regulation_tolerance_v: f64,
    /// Correction applied to every decoded output-voltage sample.
    pub voltage_scale: f64,
    /// A leg whose mean RMS deviates from the largest leg by more than this
    /// fraction of it is reported as an open phase.
    pub rms_deviation_ratio: f64,
    /// Mean ADC average below which a leg is reported as a non-conducting device.
    pub device_open_avg_threshold: f64,
    pub current_window: usize,
    pub voltage_window: usize,
    pub phase_loss_load: Ramp,
    pub phase_loss_test: Ramp,
    pub conduction_load: Ramp,
    pub conduction_test: Ramp,
    pub regulation_load: Ramp,
    pub regulation_test: Ramp,
    #[serde(default)]
    pub timing: SequencerTiming,
}

impl TestProfile {
    /// Current shunt-regulator test as deployed on the bench.
    pub fn parallel_v3() -> Self {
        Self {
            name: "parallel-v3".to_string(),
            regulation_setpoint_v: 14.45,
            regulation_tolerance_v: 0.3,
            voltage_scale: 14.7 / 15.0,
            rms_deviation_ratio: 0.2,
            device_open_avg_threshold: -500.0,
            current_window: 20,
            voltage_window: 25,
            phase_loss_load: Ramp::new(0, 200, 50, 50),
            phase_loss_test: Ramp::new(0, 400, 100, 100),
            conduction_load: Ramp::new(200, 400, 100, 100),
            conduction_test: Ramp::new(400, 1600, 50, 50),
            regulation_load: Ramp::new(1000, 100, 100, 100),
            regulation_test: Ramp::new(1000, 1500, 100, 100).with_hold(2_000),
            timing: SequencerTiming::default(),
        }
    }

    /// Earlier revision with a higher setpoint, a tighter band and no scale correction.
    pub fn parallel_v2() -> Self {
        Self {
            name: "parallel-v2".to_string(),
            regulation_setpoint_v: 14.6,
            regulation_tolerance_v: 0.2,
            voltage_scale: 1.0,
            rms_deviation_ratio: 0.2,
            device_open_avg_threshold: -500.0,
            current_window: 10,
            voltage_window: 10,
            phase_loss_load: Ramp::new(0, 200, 50, 50),
            phase_loss_test: Ramp::new(0, 300, 100, 100).with_hold(500),
            conduction_load: Ramp::new(400, 1000, 100, 100),
            conduction_test: Ramp::new(400, 2400, 100, 100).with_hold(1_500),
            regulation_load: Ramp::new(1000, 100, 100, 100),
            regulation_test: Ramp::new(1000, 1900, 100, 100).with_hold(1_500),
            timing: SequencerTiming::default(),
        }
    }

    pub fn builtin_names() -> &'static [&'static str] {
        &["parallel-v3", "parallel-v2"]
    }

    pub fn builtin(name: &str) -> Result<Self> {
        match name {
            "parallel-v3" => Ok(Self::parallel_v3()),
            "parallel-v2" => Ok(Self::parallel_v2()),
            other => Err(BenchError::Config(format!(
                "unknown test profile '{other}' (known: {})",
                Self::builtin_names().join(", ")
            ))),
        }
    }
}

impl Default for TestProfile {
    fn default() -> Self {
        Self::parallel_v3()
    }
}

/// Everything needed to open a session against the bench.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Serial port; discovered over USB when absent.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Upper bound on one blocking read of the port.
    pub read_timeout_ms: u64,
    /// Receive loop poll interval (10-50 ms is what the controller tolerates).
    pub poll_interval_ms: u64,
    pub keep_alive_period_ms: u64,
    /// Pause between closing and reopening the port on a link reset.
    pub reset_delay_ms: u64,
    pub wire: WireTiming,
    /// Board bring-up frames use a longer header settle than test commands.
    pub bring_up_wire: WireTiming,
    /// Repeat the board bring-up at the start of every test, not only when the link opens.
    pub bring_up_each_test: bool,
    pub usb: UsbMatch,
    /// Name of a built-in profile; ignored when `custom_profile` is set.
    pub profile: String,
    pub custom_profile: Option<TestProfile>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: BAUD_RATE,
            read_timeout_ms: 20,
            poll_interval_ms: 10,
            keep_alive_period_ms: 200,
            reset_delay_ms: 2_000,
            wire: WireTiming::default(),
            bring_up_wire: WireTiming {
                header_settle_ms: 10,
                inter_command_ms: 50,
            },
            bring_up_each_test: false,
            usb: UsbMatch::default(),
            profile: DEFAULT_PROFILE.to_string(),
            custom_profile: None,
        }
    }
}

impl BenchConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| BenchError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BenchError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// The profile the sequencer should run.
    pub fn test_profile(&self) -> Result<TestProfile> {
        match &self.custom_profile {
            Some(profile) => Ok(profile.clone()),
            None => TestProfile::builtin(&self.profile),
        }
    }

    /// Configuration for driving a simulated bench: every wait set to zero.
    pub fn instantaneous() -> Self {
        let mut profile = TestProfile::default();
        profile.timing = SequencerTiming::ZERO;
        for ramp in [
            &mut profile.phase_loss_load,
            &mut profile.phase_loss_test,
            &mut profile.conduction_load,
            &mut profile.conduction_test,
            &mut profile.regulation_load,
            &mut profile.regulation_test,
        ] {
            ramp.settle_ms = 0;
            ramp.hold_ms = 0;
        }

        Self {
            read_timeout_ms: 1,
            poll_interval_ms: 1,
            keep_alive_period_ms: 5,
            reset_delay_ms: 0,
            wire: WireTiming::ZERO,
            bring_up_wire: WireTiming::ZERO,
            custom_profile: Some(profile),
            ..Self::default()
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn keep_alive_period(&self) -> Duration {
        Duration::from_millis(self.keep_alive_period_ms)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }
}
