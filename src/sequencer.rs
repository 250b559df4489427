//! Automated acceptance test of a shunt (parallel) regulator.
//!
//! A run walks `Idle → Configuring → PhaseLoss → Conduction → VoltageRegulation →
//! Done`. Each sub-test ramps the electronic load and the test-current source,
//! then samples the [`TelemetryStore`] at a fixed interval and decides on the
//! window means:
//!
//! 1. **Phase loss**: a leg whose mean RMS deviates from the largest leg by more
//!    than `rms_deviation_ratio` of it is an open phase; a leg whose mean average
//!    is below `device_open_avg_threshold` is a non-conducting device (this wins).
//! 2. **Conduction**: at high test current, only the device-open rule is applied
//!    and verdicts are only ever made worse.
//! 3. **Voltage regulation**: the mean output voltage must lie within
//!    `regulation_tolerance_v` of `regulation_setpoint_v`. This decides Pass/Fail.
//!
//! The stop-inverter command is sent at the end of every run, including aborted
//! and failed ones.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde::Serialize;

use crate::codec::{bring_up_frames, Command};
use crate::config::{Ramp, TestProfile, WireTiming};
use crate::errors::{BenchError, Result};
use crate::link::Link;
use crate::report::{CurrentStats, Outcome, PhaseVerdict, PhaseVerdicts, TestResult};
use crate::store::{LegCurrent, PhaseCurrents, TelemetryStore};

/// Longest uninterrupted sleep; cancellation is noticed within this delay.
const CANCEL_SLICE: Duration = Duration::from_millis(20);

const LEGS: [&str; 3] = ["A", "B", "C"];

/// Cooperative cancellation flag shared between a running test and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the token for the next run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(BenchError::TestAborted)
        } else {
            Ok(())
        }
    }
}

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TestStage {
    #[default]
    Idle,
    Configuring,
    PhaseLoss,
    Conduction,
    VoltageRegulation,
    Done(Outcome),
}

/// Send the board bring-up sequence.
pub fn bring_up_board(link: &Link, wire: &WireTiming) -> Result<()> {
    let frames = bring_up_frames()?;
    for frame in &frames {
        link.send(frame, wire)?;
        debug!("bring-up TX {}", frame);
    }
    info!("board configured ({} frames)", frames.len());
    Ok(())
}

/// Phase-loss rule applied to the window means of the first sub-test.
/// A leg without a finite mean was not measured and counts as open.
pub fn classify_phase_loss(
    means: &PhaseCurrents,
    rms_deviation_ratio: f64,
    device_open_avg_threshold: f64,
) -> [PhaseVerdict; 3] {
    let rms = means.rms();
    let avg = means.avg();
    let max_rms = rms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let max_deviation = rms_deviation_ratio * max_rms;

    let mut verdicts = [PhaseVerdict::Ok; 3];
    for leg in 0..3 {
        verdicts[leg] = if !rms[leg].is_finite() || !avg[leg].is_finite() {
            PhaseVerdict::PhaseOpen
        } else if avg[leg] < device_open_avg_threshold {
            PhaseVerdict::DeviceOpen
        } else if (rms[leg] - max_rms).abs() > max_deviation {
            PhaseVerdict::PhaseOpen
        } else {
            PhaseVerdict::Ok
        };
    }
    verdicts
}

/// Conduction rule: a leg only ever moves to `DeviceOpen`, never back to OK.
/// A non-finite mean moves it too.
pub fn refine_conduction(
    prior: [PhaseVerdict; 3],
    means: &PhaseCurrents,
    device_open_avg_threshold: f64,
) -> [PhaseVerdict; 3] {
    let avg = means.avg();
    let mut verdicts = prior;
    for leg in 0..3 {
        if !avg[leg].is_finite() || avg[leg] < device_open_avg_threshold {
            verdicts[leg] = PhaseVerdict::DeviceOpen;
        }
    }
    verdicts
}

/// `true` when `mean_v` lies inside the regulation band. NaN never does.
pub fn regulation_within(mean_v: f64, setpoint_v: f64, tolerance_v: f64) -> bool {
    (mean_v - setpoint_v).abs() <= tolerance_v
}

fn mean(values: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, n) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    sum / n as f64
}

fn mean_currents(window: &[PhaseCurrents]) -> PhaseCurrents {
    let leg = |pick: fn(&PhaseCurrents) -> LegCurrent| LegCurrent {
        rms: mean(window.iter().map(|c| pick(c).rms)),
        avg: mean(window.iter().map(|c| pick(c).avg)),
    };
    PhaseCurrents {
        a: leg(|c| c.a),
        b: leg(|c| c.b),
        c: leg(|c| c.c),
    }
}

fn describe_faults(verdicts: &PhaseVerdicts) -> Option<String> {
    let faults: Vec<String> = LEGS
        .iter()
        .zip(verdicts.to_array())
        .filter(|(_, v)| v.is_fault())
        .map(|(leg, v)| format!("{leg}: {}", v.description()))
        .collect();
    if faults.is_empty() {
        None
    } else {
        Some(faults.join(", "))
    }
}

/// Drives one acceptance-test run over an open link.
pub struct TestSequencer<'a> {
    link: &'a Link,
    store: &'a TelemetryStore,
    profile: &'a TestProfile,
    wire: WireTiming,
    bring_up_wire: Option<WireTiming>,
    cancel: CancelToken,
    stage: Arc<RwLock<TestStage>>,
}

impl<'a> TestSequencer<'a> {
    pub fn new(
        link: &'a Link,
        store: &'a TelemetryStore,
        profile: &'a TestProfile,
        wire: WireTiming,
    ) -> Self {
        Self {
            link,
            store,
            profile,
            wire,
            bring_up_wire: None,
            cancel: CancelToken::new(),
            stage: Arc::new(RwLock::new(TestStage::Idle)),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Publish stage transitions into a cell owned by the caller.
    pub fn with_stage(mut self, stage: Arc<RwLock<TestStage>>) -> Self {
        self.stage = stage;
        self
    }

    /// Run the board bring-up sequence while configuring.
    pub fn with_bring_up(mut self, wire: WireTiming) -> Self {
        self.bring_up_wire = Some(wire);
        self
    }

    pub fn stage(&self) -> TestStage {
        *self.stage.read()
    }

    /// Execute one full run. Fails only if the link is not usable at all; every
    /// later problem is reported inside the returned result.
    pub fn run(&self) -> Result<TestResult> {
        if !self.link.is_open() {
            return Err(BenchError::LinkClosed);
        }

        let mut result = TestResult::new(&self.profile.name);
        result.outcome = Outcome::Running;
        info!("--- shunt regulator test ({}) ---", self.profile.name);

        match self.run_stages(&mut result) {
            Ok(()) => {
                if let Err(e) = self.pause(self.profile.timing.pre_stop_delay()) {
                    debug!("pre-stop delay cut short: {}", e);
                }
            }
            Err(BenchError::TestAborted) => {
                warn!("test aborted during {:?}", self.stage());
                result.outcome = Outcome::Aborted;
                result.message = format!("test aborted during {:?}", self.stage());
            }
            Err(e) => {
                error!("test failed during {:?}: {}", self.stage(), e);
                result.outcome = Outcome::Fail;
                result.message = format!("test interrupted during {:?}: {e}", self.stage());
            }
        }

        if let Err(e) = self.send(Command::StopInverter) {
            error!("could not stop the inverter: {}", e);
            result.message.push_str(&format!("; stop command failed: {e}"));
        }

        self.enter(TestStage::Done(result.outcome));
        Ok(result.sanitized())
    }

    fn run_stages(&self, result: &mut TestResult) -> Result<()> {
        let p = self.profile;

        self.enter(TestStage::Configuring);
        self.configure()?;

        self.enter(TestStage::PhaseLoss);
        let means = self.phase_loss()?;
        let verdicts = PhaseVerdicts::from_array(classify_phase_loss(
            &means,
            p.rms_deviation_ratio,
            p.device_open_avg_threshold,
        ));
        self.log_verdicts("phase loss", &verdicts);
        result.phase_loss_currents = Some(CurrentStats::from_means(&means));
        result.phase_loss_verdicts = Some(verdicts);

        self.enter(TestStage::Conduction);
        let means = self.conduction()?;
        let verdicts = PhaseVerdicts::from_array(refine_conduction(
            verdicts.to_array(),
            &means,
            p.device_open_avg_threshold,
        ));
        self.log_verdicts("conduction", &verdicts);
        result.conduction_currents = Some(CurrentStats::from_means(&means));
        result.conduction_verdicts = Some(verdicts);

        self.enter(TestStage::VoltageRegulation);
        let vout = self.voltage_regulation()?;
        result.output_voltage = Some(vout);

        let band = format!(
            "{:.2} ± {:.2} V",
            p.regulation_setpoint_v, p.regulation_tolerance_v
        );
        if regulation_within(vout, p.regulation_setpoint_v, p.regulation_tolerance_v) {
            info!("regulator OK: output {:.2} V", vout);
            result.outcome = Outcome::Pass;
            result.message = format!("output voltage {vout:.2} V within {band}");
        } else {
            warn!("regulation error: output {:.2} V", vout);
            result.outcome = Outcome::Fail;
            result.message = format!("output voltage {vout:.2} V outside {band}");
        }
        if let Some(faults) = describe_faults(&verdicts) {
            result.message.push_str(&format!("; leg faults: {faults}"));
        }
        Ok(())
    }

    fn configure(&self) -> Result<()> {
        if let Some(wire) = &self.bring_up_wire {
            bring_up_board(self.link, wire)?;
        }
        self.send(Command::AckPreviousError)?;
        self.send(Command::SelectParallelMode)
    }

    fn phase_loss(&self) -> Result<PhaseCurrents> {
        let p = self.profile;
        self.ramp(&p.phase_loss_load, Command::SetLoadCurrent)?;

        self.send(Command::ArmIaSampling)?;
        self.send(Command::ArmIbSampling)?;
        self.pause(p.timing.arm_delay())?;
        self.send(Command::StartInverter)?;

        self.ramp(&p.phase_loss_test, Command::SetTestCurrent)?;
        self.sample_currents(p.current_window)
    }

    fn conduction(&self) -> Result<PhaseCurrents> {
        let p = self.profile;
        self.ramp(&p.conduction_load, Command::SetLoadCurrent)?;
        self.ramp(&p.conduction_test, Command::SetTestCurrent)?;
        self.sample_currents(p.current_window)
    }

    fn voltage_regulation(&self) -> Result<f64> {
        let p = self.profile;
        self.ramp(&p.regulation_load, Command::SetLoadCurrent)?;
        self.ramp(&p.regulation_test, Command::SetTestCurrent)?;
        self.sample_voltage(p.voltage_window)
    }

    fn ramp(&self, ramp: &Ramp, command: fn(i16) -> Command) -> Result<()> {
        for ma in ramp.points() {
            self.cancel.check()?;
            let cmd = command(ma);
            self.send(cmd)?;
            match cmd {
                Command::SetLoadCurrent(ma) => self.store.set_load_current_setpoint(ma),
                Command::SetTestCurrent(ma) => self.store.set_test_current_setpoint(ma),
                _ => {}
            }
            self.pause(ramp.settle())?;
        }
        self.pause(ramp.hold())
    }

    fn sample_currents(&self, count: usize) -> Result<PhaseCurrents> {
        self.check_telemetry(self.store.currents_age())?;
        let mut window = Vec::with_capacity(count);
        for _ in 0..count {
            self.cancel.check()?;
            window.push(self.store.currents());
            self.pause(self.profile.timing.sample_interval())?;
        }
        let means = mean_currents(&window);
        if !means.is_finite() {
            warn!("current window has no finite statistics");
        }
        info!(
            "RMS: Ia {:5.1} - Ib {:5.1} - Ic {:5.1} | AVG: Ia {:5.1} - Ib {:5.1} - Ic {:5.1}",
            means.a.rms, means.b.rms, means.c.rms, means.a.avg, means.b.avg, means.c.avg
        );
        Ok(means)
    }

    fn sample_voltage(&self, count: usize) -> Result<f64> {
        self.check_telemetry(self.store.voltage_age())?;
        let mut window = Vec::with_capacity(count);
        for _ in 0..count {
            self.cancel.check()?;
            window.push(self.store.output_voltage());
            self.pause(self.profile.timing.sample_interval())?;
        }
        Ok(mean(window))
    }

    /// `age` is the time since the last frame of the kind about to be sampled.
    fn check_telemetry(&self, age: Option<Duration>) -> Result<()> {
        let Some(limit) = self.profile.timing.stall_timeout() else {
            return Ok(());
        };
        match age {
            Some(age) if age <= limit => Ok(()),
            Some(age) => Err(BenchError::TelemetryStalled(age)),
            None => Err(BenchError::TelemetryStalled(limit)),
        }
    }

    fn send(&self, cmd: Command) -> Result<()> {
        let frame = cmd.frame()?;
        debug!("TX {}: {}", cmd, frame);
        self.link.send(&frame, &self.wire)
    }

    /// Sleep that gives up early when the run is cancelled.
    fn pause(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.cancel.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(CANCEL_SLICE));
        }
    }

    fn enter(&self, stage: TestStage) {
        debug!("stage {:?} -> {:?}", self.stage(), stage);
        *self.stage.write() = stage;
    }

    fn log_verdicts(&self, sub_test: &str, verdicts: &PhaseVerdicts) {
        let line = LEGS
            .iter()
            .zip(verdicts.to_array())
            .map(|(leg, v)| format!("{leg}: {}", v.description()))
            .collect::<Vec<_>>()
            .join(" - ");
        if verdicts.any_fault() {
            warn!("{sub_test}: {line}");
        } else {
            info!("{sub_test}: {line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::codec::{CommandFrame, CurrentBlock, TelemetryEvent};
    use crate::config::{BenchConfig, SequencerTiming};
    use crate::link::testing::{RecordingWriter, ScriptedReader};

    fn means(rms: [f64; 3], avg: [f64; 3]) -> PhaseCurrents {
        let leg = |i: usize| LegCurrent {
            rms: rms[i],
            avg: avg[i],
        };
        PhaseCurrents {
            a: leg(0),
            b: leg(1),
            c: leg(2),
        }
    }

    fn instant_profile() -> TestProfile {
        BenchConfig::instantaneous().test_profile().unwrap()
    }

    /// Pairs header and payload writes, so only valid while every frame sent
    /// carries a payload (true of all `Command`s, not of the bring-up frames).
    fn sent_frames(writer: &RecordingWriter) -> Vec<Vec<u8>> {
        writer
            .writes
            .lock()
            .chunks(2)
            .map(|pair| pair.concat())
            .collect()
    }

    fn frame_bytes(cmd: Command) -> Vec<u8> {
        cmd.frame().unwrap().as_bytes().to_vec()
    }

    #[test]
    fn weak_leg_is_an_open_phase() {
        let verdicts = classify_phase_loss(&means([100.0, 100.0, 40.0], [0.0; 3]), 0.2, -500.0);
        assert_eq!(
            verdicts,
            [PhaseVerdict::Ok, PhaseVerdict::Ok, PhaseVerdict::PhaseOpen]
        );
    }

    #[test]
    fn deviation_within_twenty_percent_is_ok() {
        let verdicts = classify_phase_loss(&means([100.0, 85.0, 80.0], [0.0; 3]), 0.2, -500.0);
        assert_eq!(verdicts, [PhaseVerdict::Ok; 3]);
    }

    #[test]
    fn negative_average_means_device_open_regardless_of_rms() {
        let verdicts =
            classify_phase_loss(&means([100.0, 100.0, 10.0], [0.0, -600.0, -600.0]), 0.2, -500.0);
        assert_eq!(
            verdicts,
            [
                PhaseVerdict::Ok,
                PhaseVerdict::DeviceOpen,
                PhaseVerdict::DeviceOpen
            ]
        );
    }

    #[test]
    fn conduction_only_makes_verdicts_worse() {
        let prior = [
            PhaseVerdict::PhaseOpen,
            PhaseVerdict::Ok,
            PhaseVerdict::DeviceOpen,
        ];
        let verdicts = refine_conduction(prior, &means([1.0; 3], [0.0, -501.0, 0.0]), -500.0);
        assert_eq!(
            verdicts,
            [
                PhaseVerdict::PhaseOpen,
                PhaseVerdict::DeviceOpen,
                PhaseVerdict::DeviceOpen
            ]
        );
    }

    #[test]
    fn regulation_band_boundaries() {
        assert!(regulation_within(14.74, 14.45, 0.3));
        assert!(regulation_within(14.16, 14.45, 0.3));
        assert!(!regulation_within(14.76, 14.45, 0.3));
        assert!(!regulation_within(f64::NAN, 14.45, 0.3));
    }

    #[test]
    fn unmeasured_legs_are_never_ok() {
        let nan = f64::NAN;
        let verdicts = classify_phase_loss(&means([nan; 3], [nan; 3]), 0.2, -500.0);
        assert_eq!(verdicts, [PhaseVerdict::PhaseOpen; 3]);

        let verdicts = refine_conduction(
            [PhaseVerdict::Ok; 3],
            &means([100.0, 100.0, nan], [0.0, 0.0, nan]),
            -500.0,
        );
        assert_eq!(
            verdicts,
            [PhaseVerdict::Ok, PhaseVerdict::Ok, PhaseVerdict::DeviceOpen]
        );
    }

    #[test]
    fn empty_window_mean_is_nan() {
        assert!(mean(Vec::new()).is_nan());
        assert!(mean_currents(&[]).a.rms.is_nan());
        assert_eq!(mean([1.0, 2.0, 3.0]), 2.0);
    }

    #[test]
    fn cancellation_is_sticky_until_reset() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.clone().cancel();
        assert!(matches!(token.check(), Err(BenchError::TestAborted)));
        token.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn healthy_regulator_passes() {
        let writer = RecordingWriter::default();
        let link = Link::from_io("sim", ScriptedReader::default(), writer.clone());
        let store = TelemetryStore::new(1.0);
        store.apply(&TelemetryEvent::VoltageSample { millivolts: 14_500 });
        store.apply(&TelemetryEvent::CurrentTriplet(CurrentBlock::from_interleaved(&[
            100, -100, 0, 100, -100, 0,
        ])));
        let profile = instant_profile();

        let result = TestSequencer::new(&link, &store, &profile, WireTiming::ZERO)
            .run()
            .unwrap();

        assert_eq!(result.outcome, Outcome::Pass, "{}", result.message);
        assert!(result.outcome.is_terminal());
        assert!((result.output_voltage.unwrap() - 14.5).abs() < 1e-9);
        assert_eq!(result.conduction_verdicts, Some(PhaseVerdicts::default()));

        let frames = sent_frames(&writer);
        assert_eq!(frames[0], frame_bytes(Command::AckPreviousError));
        assert_eq!(frames[1], frame_bytes(Command::SelectParallelMode));
        assert_eq!(frames.last(), Some(&frame_bytes(Command::StopInverter)));
        assert!(frames.contains(&frame_bytes(Command::StartInverter)));
        assert!(frames.contains(&frame_bytes(Command::SetTestCurrent(1600))));
        assert_eq!(store.snapshot().test_current_setpoint, 1.5);
        assert_eq!(store.snapshot().load_current_setpoint, 0.1);
    }

    #[test]
    fn out_of_band_voltage_fails() {
        let link = Link::from_io("sim", ScriptedReader::default(), RecordingWriter::default());
        let store = TelemetryStore::new(1.0);
        store.apply(&TelemetryEvent::VoltageSample { millivolts: 14_760 });
        let profile = instant_profile();

        let result = TestSequencer::new(&link, &store, &profile, WireTiming::ZERO)
            .run()
            .unwrap();

        assert_eq!(result.outcome, Outcome::Fail);
        assert!(result.message.contains("outside"));
    }

    #[test]
    fn cancelled_run_is_aborted_and_still_stops_the_inverter() {
        let writer = RecordingWriter::default();
        let link = Link::from_io("sim", ScriptedReader::default(), writer.clone());
        let store = TelemetryStore::new(1.0);
        let profile = instant_profile();
        let cancel = CancelToken::new();
        cancel.cancel();
        let stage = Arc::new(RwLock::new(TestStage::Idle));

        let result = TestSequencer::new(&link, &store, &profile, WireTiming::ZERO)
            .with_cancel(cancel)
            .with_stage(Arc::clone(&stage))
            .run()
            .unwrap();

        assert_eq!(result.outcome, Outcome::Aborted);
        assert_eq!(*stage.read(), TestStage::Done(Outcome::Aborted));
        assert_eq!(result.phase_loss_verdicts, None);
        assert_eq!(
            sent_frames(&writer).last(),
            Some(&frame_bytes(Command::StopInverter))
        );
    }

    #[test]
    fn stalled_telemetry_fails_the_run() {
        let link = Link::from_io("sim", ScriptedReader::default(), RecordingWriter::default());
        let store = TelemetryStore::new(1.0);
        let mut profile = instant_profile();
        profile.timing = SequencerTiming {
            stall_timeout_ms: Some(1_000),
            ..SequencerTiming::ZERO
        };

        let result = TestSequencer::new(&link, &store, &profile, WireTiming::ZERO)
            .run()
            .unwrap();

        assert_eq!(result.outcome, Outcome::Fail);
        assert!(result.message.contains("stalled"), "{}", result.message);
    }

    #[test]
    fn fresh_voltage_does_not_hide_missing_currents() {
        let link = Link::from_io("sim", ScriptedReader::default(), RecordingWriter::default());
        let store = TelemetryStore::new(1.0);
        store.apply(&TelemetryEvent::VoltageSample { millivolts: 14_450 });
        let mut profile = instant_profile();
        profile.timing = SequencerTiming {
            stall_timeout_ms: Some(2_000),
            ..SequencerTiming::ZERO
        };

        let result = TestSequencer::new(&link, &store, &profile, WireTiming::ZERO)
            .run()
            .unwrap();

        assert_eq!(result.outcome, Outcome::Fail);
        assert!(
            result.message.contains("telemetry stalled"),
            "{}",
            result.message
        );
        assert_eq!(result.phase_loss_verdicts, None);
    }

    #[test]
    fn bring_up_each_test_runs_before_configuration() {
        let writer = RecordingWriter::default();
        let link = Link::from_io("sim", ScriptedReader::default(), writer.clone());
        let store = TelemetryStore::new(1.0);
        store.apply(&TelemetryEvent::VoltageSample { millivolts: 14_450 });
        store.apply(&TelemetryEvent::CurrentTriplet(CurrentBlock::from_interleaved(&[
            100, -100, 0, 100, -100, 0,
        ])));
        let profile = instant_profile();

        let result = TestSequencer::new(&link, &store, &profile, WireTiming::ZERO)
            .with_bring_up(WireTiming::ZERO)
            .run()
            .unwrap();
        assert_eq!(result.outcome, Outcome::Pass, "{}", result.message);

        let mut expected: Vec<u8> = bring_up_frames()
            .unwrap()
            .iter()
            .flat_map(|f| f.as_bytes().to_vec())
            .collect();
        expected.extend(frame_bytes(Command::AckPreviousError));
        expected.extend(frame_bytes(Command::SelectParallelMode));
        let sent: Vec<u8> = writer.writes.lock().concat();
        assert!(sent.starts_with(&expected));
        assert!(sent.ends_with(&frame_bytes(Command::StopInverter)));
    }

    #[test]
    fn write_failure_mid_test_is_reported_as_fail() {
        struct BrokenWriter;
        impl io::Write for BrokenWriter {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let link = Link::from_io("sim", ScriptedReader::default(), BrokenWriter);
        let store = TelemetryStore::new(1.0);
        let profile = instant_profile();

        let result = TestSequencer::new(&link, &store, &profile, WireTiming::ZERO)
            .run()
            .unwrap();

        assert_eq!(result.outcome, Outcome::Fail);
        assert!(result.message.contains("stop command failed"));
    }

    #[test]
    fn closed_link_cannot_start_a_test() {
        let link = Link::from_io("sim", ScriptedReader::default(), RecordingWriter::default());
        link.close();
        let store = TelemetryStore::new(1.0);
        let profile = instant_profile();

        let err = TestSequencer::new(&link, &store, &profile, WireTiming::ZERO)
            .run()
            .unwrap_err();
        assert!(matches!(err, BenchError::LinkClosed));
    }

    #[test]
    fn bring_up_sends_every_frame_in_order() {
        let writer = RecordingWriter::default();
        let link = Link::from_io("sim", ScriptedReader::default(), writer.clone());
        bring_up_board(&link, &WireTiming::ZERO).unwrap();

        let sent: Vec<u8> = writer.writes.lock().concat();
        let expected: Vec<u8> = bring_up_frames()
            .unwrap()
            .iter()
            .flat_map(|f: &CommandFrame| f.as_bytes().to_vec())
            .collect();
        assert_eq!(sent, expected);
    }
}
