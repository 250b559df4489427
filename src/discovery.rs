//! Locating the bench controller among the host's serial ports.
//!
//! The controller enumerates as an ST-Link virtual COM port; it is recognised by
//! USB vendor id, product id and, when configured, serial number.

use log::{debug, info};
use serde::Serialize;
use serialport::SerialPortType;

use crate::config::UsbMatch;
use crate::errors::{BenchError, Result};

/// USB descriptor fields of a serial port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsbIdentity {
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// One serial port as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub usb: Option<UsbIdentity>,
    /// The port matches the configured bench identity.
    pub is_bench: bool,
}

impl UsbIdentity {
    /// Vendor and product must match; the serial number only when one is configured.
    pub fn matches(&self, want: &UsbMatch) -> bool {
        if self.vid != want.vid || self.pid != want.pid {
            return false;
        }
        match &want.serial_number {
            Some(serial) => self.serial_number.as_deref() == Some(serial.as_str()),
            None => true,
        }
    }
}

fn identity(port_type: &SerialPortType) -> Option<UsbIdentity> {
    match port_type {
        SerialPortType::UsbPort(info) => Some(UsbIdentity {
            vid: info.vid,
            pid: info.pid,
            serial_number: info.serial_number.clone(),
            manufacturer: info.manufacturer.clone(),
            product: info.product.clone(),
        }),
        _ => None,
    }
}

/// Every serial port on the host, flagged when it looks like the bench.
pub fn list_ports(want: &UsbMatch) -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports()?;
    debug!("{} serial ports present", ports.len());
    Ok(ports
        .into_iter()
        .map(|p| {
            let usb = identity(&p.port_type);
            let is_bench = usb.as_ref().is_some_and(|u| u.matches(want));
            PortInfo {
                name: p.port_name,
                usb,
                is_bench,
            }
        })
        .collect())
}

/// First port whose identity matches `ports`.
pub fn select_bench_port(ports: &[PortInfo]) -> Option<&PortInfo> {
    ports.iter().find(|p| p.is_bench)
}

/// Name of the port the bench controller is attached to.
pub fn find_bench_port(want: &UsbMatch) -> Result<String> {
    let ports = list_ports(want)?;
    match select_bench_port(&ports) {
        Some(port) => {
            info!("bench controller found on {}", port.name);
            Ok(port.name.clone())
        }
        None => Err(BenchError::PortNotFound(format!(
            "no serial port with VID {:04x} PID {:04x}{}",
            want.vid,
            want.pid,
            want.serial_number
                .as_deref()
                .map(|s| format!(" serial {s}"))
                .unwrap_or_default()
        ))),
    }
}
