//! Serial driver and automated acceptance sequencer for the DZE power-regulator
//! test bench.
//!
//! The bench controller speaks a fixed binary protocol over an ST-Link virtual
//! COM port at 1 843 200 bps. This crate owns that link, keeps the controller
//! session alive, decodes telemetry into a shared latest-value store and runs the
//! three-stage shunt-regulator test on top of it.
//!
//! # Layers
//!
//! 1. [`Link`]: exclusive owner of the byte stream; one locked critical section
//!    per command so concurrent senders never interleave mid-frame.
//! 2. [`codec`]: command templates out, typed [`TelemetryEvent`]s in.
//! 3. [`TelemetryStore`]: last value of every measurement, shared across threads.
//! 4. [`Session`]: receive and keep-alive loops around one link.
//! 5. [`TestSequencer`]: ramps, sampling windows and the pass/fail decision.
//!
//! # Example
//!
//! ```no_run
//! use dze_tester::{BenchConfig, CancelToken, Session};
//!
//! let mut session = Session::open(BenchConfig::default())?;
//! let result = session.run_test(&CancelToken::new())?;
//! println!("{}", serde_json::to_string_pretty(&result)?);
//! session.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod codec;
pub mod config;
pub mod discovery;
mod errors;
pub mod link;
pub mod logging;
pub mod report;
pub mod sequencer;
pub mod session;
pub mod store;

pub use codec::{Command, CommandFrame, CurrentBlock, FrameDecoder, TelemetryEvent};
pub use config::{BenchConfig, Ramp, SequencerTiming, TestProfile, UsbMatch, WireTiming};
pub use errors::*;
pub use link::Link;
pub use report::{CurrentStats, Outcome, PhaseVerdict, PhaseVerdicts, TestResult};
pub use sequencer::{CancelToken, TestSequencer, TestStage};
pub use session::Session;
pub use store::{PhaseCurrents, TelemetrySnapshot, TelemetryStore};
