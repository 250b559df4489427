//! Exclusive owner of the serial byte stream.
//!
//! The link knows nothing about the protocol beyond the two-write command
//! discipline: every [`CommandFrame`] is sent as header, settle, payload, pacing,
//! and the whole sequence runs under one writer lock so a concurrent sender can
//! never slip its header in between another command's header and payload.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use crate::codec::CommandFrame;
use crate::config::WireTiming;
use crate::errors::{BenchError, Result};

const READ_CHUNK: usize = 4096;

/// Read half of the stream.
pub trait WireReader: Read + Send {}
impl<T: Read + Send> WireReader for T {}

/// Write half of the stream.
pub trait WireWriter: Write + Send {}
impl<T: Write + Send> WireWriter for T {}

/// An open duplex link to the bench controller.
pub struct Link {
    port: String,
    baud_rate: u32,
    reader: Mutex<Option<Box<dyn WireReader>>>,
    writer: Mutex<Option<Box<dyn WireWriter>>>,
    open: AtomicBool,
}

impl Link {
    /// Open a serial port. Reads block for at most `read_timeout`.
    pub fn open(port: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self> {
        let serial = serialport::new(port, baud_rate)
            .timeout(read_timeout)
            .open()
            .map_err(|source| BenchError::LinkOpen {
                port: port.to_string(),
                source,
            })?;
        let reader = serial.try_clone().map_err(|source| BenchError::LinkOpen {
            port: port.to_string(),
            source,
        })?;
        info!("serial port {} open at {} bps", port, baud_rate);

        Ok(Self::assemble(port, baud_rate, Box::new(reader), Box::new(serial)))
    }

    /// Build a link over arbitrary streams, e.g. a simulated bench.
    pub fn from_io(
        name: &str,
        reader: impl WireReader + 'static,
        writer: impl WireWriter + 'static,
    ) -> Self {
        Self::assemble(name, 0, Box::new(reader), Box::new(writer))
    }

    fn assemble(
        port: &str,
        baud_rate: u32,
        reader: Box<dyn WireReader>,
        writer: Box<dyn WireWriter>,
    ) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            open: AtomicBool::new(true),
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Write raw bytes, no pacing.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(BenchError::LinkClosed)?;
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Send one command: header, settle, payload, then hold the bus for the
    /// inter-command gap. The writer lock is held for the whole sequence.
    pub fn send(&self, frame: &CommandFrame, timing: &WireTiming) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(BenchError::LinkClosed)?;

        let [header, payload] = frame.wire_writes();
        writer.write_all(header)?;
        writer.flush()?;
        thread::sleep(timing.header_settle());
        if !payload.is_empty() {
            writer.write_all(payload)?;
            writer.flush()?;
        }
        trace!("TX {}", frame);

        thread::sleep(timing.inter_command());
        Ok(())
    }

    /// Whatever bytes arrived within one read timeout; empty when the line was quiet.
    pub fn read_available(&self) -> Result<Vec<u8>> {
        let mut guard = self.reader.lock();
        let reader = guard.as_mut().ok_or(BenchError::LinkClosed)?;

        let mut buf = vec![0u8; READ_CHUNK];
        match reader.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop both halves of the stream. Idempotent.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(mut writer) = self.writer.lock().take() {
            if let Err(e) = writer.flush() {
                warn!("flush on close failed: port={}, error={}", self.port, e);
            }
        }
        self.reader.lock().take();
        debug!("link {} closed", self.port);
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("port", &self.port)
            .field("baud_rate", &self.baud_rate)
            .field("open", &self.is_open())
            .finish()
    }
}
