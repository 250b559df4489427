use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("could not open serial port {port}: {source}")]
    LinkOpen {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("link io error: {0}")]
    LinkIo(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("link is closed")]
    LinkClosed,
    #[error("invalid command frame: {0}")]
    InvalidFrame(String),
    #[error("test aborted")]
    TestAborted,
    #[error("telemetry stalled: no frame decoded for {0:?}")]
    TelemetryStalled(Duration),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("test bench not found: {0}")]
    PortNotFound(String),
}

impl BenchError {
    /// Errors that mean the byte stream itself is gone, as opposed to a bad frame or an abort.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            BenchError::LinkOpen { .. }
                | BenchError::LinkIo(_)
                | BenchError::Serial(_)
                | BenchError::LinkClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, BenchError>;
