//! Wire format of the bench controller.
//!
//! # Outbound
//!
//! Every command is a fixed hexadecimal template (optionally followed by a
//! little-endian `i16` argument). The controller latches a 4-byte header before
//! it accepts payload bytes, so a command always goes out as two writes:
//! header, a short settle, then the rest. See [`CommandFrame::wire_writes`].
//!
//! # Inbound
//!
//! Telemetry frames are classified by fixed byte prefixes:
//!
//! | Prefix              | Event                                             |
//! |---------------------|---------------------------------------------------|
//! | `1a 00 00 20 00`    | [`TelemetryEvent::Ack`] (exact match)             |
//! | `2a 05 00 40`       | [`TelemetryEvent::VoltageSample`], i16 mV at 44   |
//! | `e9 3f 00 b0`       | [`TelemetryEvent::CurrentTriplet`], i16 from 8    |
//! | `a9 3f 00 50`       | [`TelemetryEvent::CurrentTriplet`], i16 from 8    |
//!
//! The controller does not length-prefix its frames. Delivery is assumed to be one
//! frame per read; the only reassembly done is for a voltage frame cut short
//! before its sample offset (see [`FrameDecoder`]).

use std::fmt;

use log::trace;

use crate::errors::{BenchError, Result};

/// Bytes written before the header settle delay.
pub const HEADER_LEN: usize = 4;

const ACK_FRAME: [u8; 5] = [0x1a, 0x00, 0x00, 0x20, 0x00];
const VOLTAGE_PREFIX: [u8; 4] = [0x2a, 0x05, 0x00, 0x40];
const CURRENT_PREFIXES: [[u8; 4]; 2] = [[0xe9, 0x3f, 0x00, 0xb0], [0xa9, 0x3f, 0x00, 0x50]];

/// Byte offset of the output-voltage sample inside a voltage frame.
pub const VOLTAGE_OFFSET: usize = 44;
/// Byte offset of the first current sample inside a current block.
pub const CURRENT_OFFSET: usize = 8;

const SAMPLE_WIDTH: usize = 2;

// Command templates
const ACK_PREVIOUS_ERROR: &str = "290000E03900";
const SELECT_PARALLEL_MODE: &str = "590000F00800890002";
const SET_LOAD_CURRENT: &str = "6900000008009100";
const SET_TEST_CURRENT: &str = "6900000008009109";
const ARM_IA_SAMPLING: &str = "F9000030080029050900FE030001FF00D10713";
const ARM_IB_SAMPLING: &str = "190100A0080029050B00FC030002FF00D107110814";
const START_INVERTER: &str = "290000E01900";
const STOP_INVERTER: &str = "290000E02100";
const STATUS_REQUEST: &str = "A9040070110019005900591B9900D90019019102D10251099101D101911451149100D1009109D1081109D105910551039103910451041119D118910B510BD10B110C510C910CD11A49008900C900";

const BRING_UP: [&str; 15] = [
    "85FFFFBF",
    "05C30082",
    "06000060",
    "06000060",
    "4900007010002800",
    "4900007010002000",
    "4900007010006000",
    "4900007011006900",
    "490000701100A900",
    "490000701100E900",
    "490000701100A100",
    "490000701100E100",
    "4900007011002901",
    "4900007011002902",
    "D900004008002905070000040000FF0000",
];

/// Amps per raw unit of the test-current DAC argument.
const TEST_CURRENT_LSB_A: f64 = 0.000_671_501_477_3;

/// One outbound command, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    bytes: Vec<u8>,
}

impl CommandFrame {
    /// Parse a hexadecimal template such as `"290000E03900"`.
    pub fn from_hex(template: &str) -> Result<Self> {
        let bytes = hex::decode(template)
            .map_err(|e| BenchError::InvalidFrame(format!("{template}: {e}")))?;
        if bytes.is_empty() {
            return Err(BenchError::InvalidFrame("empty template".into()));
        }
        Ok(Self { bytes })
    }

    /// Template followed by `value` as a little-endian `i16`.
    pub fn with_i16(template: &str, value: i16) -> Result<Self> {
        let mut frame = Self::from_hex(template)?;
        frame.bytes.extend_from_slice(&value.to_le_bytes());
        Ok(frame)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn header(&self) -> &[u8] {
        &self.bytes[..HEADER_LEN.min(self.bytes.len())]
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN.min(self.bytes.len())..]
    }

    /// The two writes this command takes on the wire, header first.
    /// The payload is empty for 4-byte commands such as the first bring-up
    /// frames; those go out as a single write followed by the settle.
    pub fn wire_writes(&self) -> [&[u8]; 2] {
        [self.header(), self.payload()]
    }
}

impl fmt::Display for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(&self.bytes))
    }
}

/// Commands understood by the bench controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Clear a latched fault from a previous run.
    AckPreviousError,
    SelectParallelMode,
    /// Electronic load current, mA.
    SetLoadCurrent(i16),
    /// Shunt-regulator test current, mA.
    SetTestCurrent(i16),
    ArmIaSampling,
    ArmIbSampling,
    StartInverter,
    StopInverter,
    /// Periodic status poll that keeps the controller session alive.
    StatusRequest,
}

impl Command {
    pub fn frame(&self) -> Result<CommandFrame> {
        match *self {
            Command::AckPreviousError => CommandFrame::from_hex(ACK_PREVIOUS_ERROR),
            Command::SelectParallelMode => CommandFrame::from_hex(SELECT_PARALLEL_MODE),
            Command::SetLoadCurrent(ma) => CommandFrame::with_i16(SET_LOAD_CURRENT, ma),
            Command::SetTestCurrent(ma) => {
                CommandFrame::with_i16(SET_TEST_CURRENT, test_current_counts(ma))
            }
            Command::ArmIaSampling => CommandFrame::from_hex(ARM_IA_SAMPLING),
            Command::ArmIbSampling => CommandFrame::from_hex(ARM_IB_SAMPLING),
            Command::StartInverter => CommandFrame::from_hex(START_INVERTER),
            Command::StopInverter => CommandFrame::from_hex(STOP_INVERTER),
            Command::StatusRequest => CommandFrame::from_hex(STATUS_REQUEST),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::AckPreviousError => write!(f, "ack previous error"),
            Command::SelectParallelMode => write!(f, "select parallel regulator mode"),
            Command::SetLoadCurrent(ma) => write!(f, "set load current {ma} mA"),
            Command::SetTestCurrent(ma) => write!(f, "set test current {ma} mA"),
            Command::ArmIaSampling => write!(f, "arm Ia sampling"),
            Command::ArmIbSampling => write!(f, "arm Ib sampling"),
            Command::StartInverter => write!(f, "start inverter"),
            Command::StopInverter => write!(f, "stop inverter"),
            Command::StatusRequest => write!(f, "status request"),
        }
    }
}

/// DAC counts for a test current in mA, truncated toward zero.
pub fn test_current_counts(ma: i16) -> i16 {
    (f64::from(ma) / TEST_CURRENT_LSB_A / 1000.0) as i16
}

/// Board bring-up frames, in the order the controller expects them.
pub fn bring_up_frames() -> Result<Vec<CommandFrame>> {
    BRING_UP.iter().map(|t| CommandFrame::from_hex(t)).collect()
}

/// One decoded block of phase-current samples.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CurrentBlock {
    pub ia: Vec<i16>,
    pub ib: Vec<i16>,
    /// Derived: `ic[i] == -(ia[i] + ib[i])`, with i16 wrap-around.
    pub ic: Vec<i16>,
}

impl CurrentBlock {
    /// Build from interleaved `Ia, Ib, Ia, Ib, ...` samples; an unpaired trailing Ia is dropped.
    pub fn from_interleaved(samples: &[i16]) -> Self {
        let pairs = samples.len() / 2;
        let mut block = CurrentBlock {
            ia: Vec::with_capacity(pairs),
            ib: Vec::with_capacity(pairs),
            ic: Vec::with_capacity(pairs),
        };
        for pair in samples.chunks_exact(2) {
            let (a, b) = (pair[0], pair[1]);
            block.ia.push(a);
            block.ib.push(b);
            block.ic.push(a.wrapping_add(b).wrapping_neg());
        }
        block
    }

    pub fn len(&self) -> usize {
        self.ia.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ia.is_empty()
    }
}

/// Typed inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    Ack,
    VoltageSample { millivolts: i16 },
    CurrentTriplet(CurrentBlock),
    Unrecognized(Vec<u8>),
}

impl TelemetryEvent {
    /// Output voltage in volts, before any fixture scale correction.
    pub fn volts(&self) -> Option<f64> {
        match self {
            TelemetryEvent::VoltageSample { millivolts } => Some(f64::from(*millivolts) / 1000.0),
            _ => None,
        }
    }
}

fn starts_with_known_prefix(bytes: &[u8]) -> bool {
    bytes.starts_with(&ACK_FRAME)
        || bytes.starts_with(&VOLTAGE_PREFIX)
        || CURRENT_PREFIXES.iter().any(|p| bytes.starts_with(p))
}

fn read_i16_le(bytes: &[u8], offset: usize) -> Option<i16> {
    let raw = bytes.get(offset..offset + SAMPLE_WIDTH)?;
    Some(i16::from_le_bytes([raw[0], raw[1]]))
}

/// Classify one complete frame.
pub fn decode_frame(bytes: &[u8]) -> TelemetryEvent {
    if bytes == ACK_FRAME {
        return TelemetryEvent::Ack;
    }

    if bytes.starts_with(&VOLTAGE_PREFIX) {
        return match read_i16_le(bytes, VOLTAGE_OFFSET) {
            Some(millivolts) => TelemetryEvent::VoltageSample { millivolts },
            None => TelemetryEvent::Unrecognized(bytes.to_vec()),
        };
    }

    if CURRENT_PREFIXES.iter().any(|p| bytes.starts_with(p)) {
        let body = bytes.get(CURRENT_OFFSET..).unwrap_or_default();
        if body.len() % SAMPLE_WIDTH != 0 {
            return TelemetryEvent::Unrecognized(bytes.to_vec());
        }
        let samples: Vec<i16> = body
            .chunks_exact(SAMPLE_WIDTH)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        return TelemetryEvent::CurrentTriplet(CurrentBlock::from_interleaved(&samples));
    }

    TelemetryEvent::Unrecognized(bytes.to_vec())
}

/// Stateful front end of [`decode_frame`] for the receive loop.
///
/// Holds back a voltage frame that ended before its sample offset and completes it
/// with the next chunk, unless that chunk starts a new frame of its own.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk as returned by a read. `None` means the bytes were buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Option<TelemetryEvent> {
        if chunk.is_empty() {
            return None;
        }

        let frame = if self.pending.is_empty() {
            chunk.to_vec()
        } else if starts_with_known_prefix(chunk) {
            trace!(
                "discarding {} buffered bytes, new frame started",
                self.pending.len()
            );
            self.pending.clear();
            chunk.to_vec()
        } else {
            let mut joined = std::mem::take(&mut self.pending);
            joined.extend_from_slice(chunk);
            joined
        };

        // Held back at most VOLTAGE_OFFSET + SAMPLE_WIDTH - 1 bytes.
        if frame.starts_with(&VOLTAGE_PREFIX) && frame.len() < VOLTAGE_OFFSET + SAMPLE_WIDTH {
            self.pending = frame;
            return None;
        }

        Some(decode_frame(&frame))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voltage_frame(millivolts: i16) -> Vec<u8> {
        let mut frame = VOLTAGE_PREFIX.to_vec();
        frame.resize(VOLTAGE_OFFSET, 0x11);
        frame.extend_from_slice(&millivolts.to_le_bytes());
        frame.extend_from_slice(&[0x00, 0x00]);
        frame
    }

    fn current_frame(prefix: [u8; 4], samples: &[i16]) -> Vec<u8> {
        let mut frame = prefix.to_vec();
        frame.extend_from_slice(&[0x42, 0x01, 0x5e, 0x03]);
        for s in samples {
            frame.extend_from_slice(&s.to_le_bytes());
        }
        frame
    }

    #[test]
    fn every_catalog_command_splits_into_header_and_payload() {
        let mut frames = bring_up_frames().unwrap();
        for cmd in [
            Command::AckPreviousError,
            Command::SelectParallelMode,
            Command::SetLoadCurrent(200),
            Command::SetTestCurrent(1600),
            Command::ArmIaSampling,
            Command::ArmIbSampling,
            Command::StartInverter,
            Command::StopInverter,
            Command::StatusRequest,
        ] {
            frames.push(cmd.frame().unwrap());
        }

        for frame in &frames {
            let [header, payload] = frame.wire_writes();
            assert_eq!(header.len(), HEADER_LEN, "{frame}");
            assert_eq!(header.len() + payload.len(), frame.len());
            assert_eq!([header, payload].concat(), frame.as_bytes());
        }
    }

    #[test]
    fn template_parsing_rejects_bad_hex() {
        assert!(matches!(
            CommandFrame::from_hex("29000"),
            Err(BenchError::InvalidFrame(_))
        ));
        assert!(matches!(
            CommandFrame::from_hex("ZZ00"),
            Err(BenchError::InvalidFrame(_))
        ));
        assert!(CommandFrame::from_hex("").is_err());
    }

    #[test]
    fn load_current_argument_is_little_endian_milliamps() {
        let frame = Command::SetLoadCurrent(200).frame().unwrap();
        assert_eq!(frame.to_string(), "6900000008009100C800");
    }

    #[test]
    fn test_current_argument_is_scaled_to_dac_counts() {
        assert_eq!(test_current_counts(0), 0);
        assert_eq!(test_current_counts(400), 595);
        assert_eq!(test_current_counts(1600), 2382);
        let frame = Command::SetTestCurrent(1600).frame().unwrap();
        assert_eq!(frame.payload(), &[0x08, 0x00, 0x91, 0x09, 0x4e, 0x09]);
    }

    #[test]
    fn status_request_is_the_fixed_literal() {
        let frame = Command::StatusRequest.frame().unwrap();
        assert_eq!(frame.len(), 78);
        assert_eq!(frame.header(), &[0xA9, 0x04, 0x00, 0x70]);
    }

    #[test]
    fn ack_requires_exact_match() {
        assert_eq!(decode_frame(&ACK_FRAME), TelemetryEvent::Ack);
        let mut longer = ACK_FRAME.to_vec();
        longer.push(0x00);
        assert!(matches!(
            decode_frame(&longer),
            TelemetryEvent::Unrecognized(_)
        ));
    }

    #[test]
    fn voltage_sample_decodes_to_volts() {
        for mv in [14_450i16, 0, -1_250, i16::MAX] {
            let event = decode_frame(&voltage_frame(mv));
            assert_eq!(event, TelemetryEvent::VoltageSample { millivolts: mv });
            let volts = event.volts().unwrap();
            assert!((volts - f64::from(mv) / 1000.0).abs() < 1e-12);
        }
    }

    #[test]
    fn truncated_voltage_frame_is_unrecognized() {
        let frame = voltage_frame(14_450);
        assert!(matches!(
            decode_frame(&frame[..VOLTAGE_OFFSET + 1]),
            TelemetryEvent::Unrecognized(_)
        ));
    }

    #[test]
    fn phase_c_is_derived_from_a_and_b() {
        let samples = [100, -40, -300, 120, 7, 7, i16::MIN, -1];
        for prefix in CURRENT_PREFIXES {
            let TelemetryEvent::CurrentTriplet(block) = decode_frame(&current_frame(prefix, &samples))
            else {
                panic!("expected a current block");
            };
            assert_eq!(block.ia, vec![100, -300, 7, i16::MIN]);
            assert_eq!(block.ib, vec![-40, 120, 7, -1]);
            for i in 0..block.len() {
                assert_eq!(
                    block.ic[i],
                    block.ia[i].wrapping_add(block.ib[i]).wrapping_neg()
                );
            }
            assert_eq!(&block.ic[..3], &[-60, 180, -14]);
        }
    }

    #[test]
    fn odd_current_body_length_is_unrecognized() {
        let mut frame = current_frame(CURRENT_PREFIXES[0], &[1, 2]);
        frame.push(0xff);
        assert!(matches!(
            decode_frame(&frame),
            TelemetryEvent::Unrecognized(_)
        ));
    }

    #[test]
    fn unpaired_trailing_sample_is_dropped() {
        let TelemetryEvent::CurrentTriplet(block) =
            decode_frame(&current_frame(CURRENT_PREFIXES[1], &[10, 20, 30]))
        else {
            panic!("expected a current block");
        };
        assert_eq!(block.len(), 1);
    }

    #[test]
    fn unknown_prefix_is_unrecognized() {
        let bytes = [0xde, 0xad, 0xbe, 0xef];
        assert_eq!(
            decode_frame(&bytes),
            TelemetryEvent::Unrecognized(bytes.to_vec())
        );
    }

    #[test]
    fn decoder_reassembles_a_split_voltage_frame() {
        let frame = voltage_frame(14_600);
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.push(&frame[..20]), None);
        assert_eq!(decoder.pending_len(), 20);
        assert_eq!(
            decoder.push(&frame[20..]),
            Some(TelemetryEvent::VoltageSample { millivolts: 14_600 })
        );
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn decoder_buffer_never_outgrows_one_voltage_frame() {
        let frame = voltage_frame(-1_200);
        let complete = VOLTAGE_OFFSET + SAMPLE_WIDTH;
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.push(&frame[..4]), None);
        for i in 4..complete - 1 {
            assert_eq!(decoder.push(&frame[i..i + 1]), None);
            assert!(decoder.pending_len() < complete);
        }
        assert_eq!(
            decoder.push(&frame[complete - 1..]),
            Some(TelemetryEvent::VoltageSample { millivolts: -1_200 })
        );
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn decoder_drops_partial_frame_when_a_new_frame_starts() {
        let frame = voltage_frame(14_600);
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.push(&frame[..10]), None);
        assert_eq!(decoder.push(&ACK_FRAME), Some(TelemetryEvent::Ack));
        assert_eq!(decoder.pending_len(), 0);
    }
}
