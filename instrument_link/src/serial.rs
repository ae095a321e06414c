//! This module provides the implementation for an instrument controlled via a serial port.
//!
//! USB-to-GPIB bridges enumerate as serial ports, so this is also how a GPIB instrument is
//! reached. Opening uses the `serialport` crate.

use std::time::Duration;

use serialport::{SerialPort, SerialPortBuilder};

use crate::{Instrument, InstrumentError};

/// Longest single read on an opened port. The [`Instrument`] keeps reading until its own reply
/// timeout has passed.
const READ_SLICE: Duration = Duration::from_millis(50);

/// A blocking serial port implementation using the `serialport` crate.
#[derive(Debug)]
pub struct SerialInterface {}

impl SerialInterface {
    /// Try to open a serial port with the given name and baud rate.
    ///
    /// The port is opened with 8 data bits, one stop bit, no parity, and a reply timeout of three
    /// seconds. If the device is absent or busy, [`InstrumentError::Serialport`] is returned.
    ///
    /// # Arguments
    /// * `port` - The name of the serial port, e.g., `"/dev/ttyUSB0"` or `"COM3"`.
    /// * `baud` - The baud rate.
    pub fn simple(
        port: &str,
        baud: u32,
    ) -> Result<Instrument<Box<dyn SerialPort>>, InstrumentError> {
        let spb = serialport::new(port, baud)
            .timeout(Duration::from_secs(3))
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
        SerialInterface::full(spb)
    }

    /// Try to open a serial port from a fully configured [`SerialPortBuilder`].
    ///
    /// The timeout configured on the builder becomes the reply timeout of the returned
    /// [`Instrument`]. The port itself is then set to read at most 50 ms at a time, so
    /// that [`crate::InstrumentInterface::set_timeout`] takes effect on the next read.
    ///
    /// # Arguments
    /// * `spb` - A `SerialPortBuilder` to configure the serial port. See
    ///   [`serialport::SerialPortBuilder`] and the [`serialport::new`] function for more details.
    pub fn full(
        spb: SerialPortBuilder,
    ) -> Result<Instrument<Box<dyn SerialPort>>, InstrumentError> {
        let mut port = spb.open()?;
        let timeout = port.timeout();
        port.set_timeout(timeout.min(READ_SLICE))?;
        log::debug!(
            "opened serial port {:?} at {:?} baud",
            port.name(),
            port.baud_rate().ok()
        );
        Ok(Instrument::new(port, timeout))
    }
}

/// List the names of all serial ports that are currently available on this machine.
pub fn list_ports() -> Result<Vec<String>, InstrumentError> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
