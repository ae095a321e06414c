//! A rust driver for the HP 6626A precision system power supply.
//!
//! The HP 6626A has four independent outputs and speaks a plain ASCII command set over GPIB
//! (`VSET`, `ISET`, `VOUT?`, `IOUT?`, `OUT`, ...). This driver talks to it either directly over
//! any [`InstrumentInterface`], or through a Prologix-compatible USB-to-GPIB bridge, e.g., an
//! AR488 adapter, which shows up as a serial port.
//!
//! # Example
//!
//! This example shows the usage via a USB-to-GPIB bridge with the supply at GPIB address 5.
//! ```no_run
//! use measurements::{Current, Voltage};
//! use hp_6626a::{Hp6626a, SerialInterfaceHp6626a};
//!
//! let interface = SerialInterfaceHp6626a::simple("/dev/ttyUSB0", 115200).unwrap();
//! let mut inst = Hp6626a::with_bridge(interface, 5).unwrap();
//! println!("{}", inst.get_name().unwrap());
//!
//! let mut out1 = inst.get_channel(1).unwrap();
//! out1.set_voltage(Voltage::from_volts(3.3)).unwrap();
//! out1.set_current_limit(Current::from_amperes(0.1)).unwrap();
//! out1.set_output_enabled(true).unwrap();
//! println!("Output 1: {:?}", out1.get_voltage());
//! ```

#![warn(missing_docs)]

mod command;

pub use command::Command;

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use instrument_link::{Instrument, InstrumentError, InstrumentInterface, SerialInterface};
use measurements::{Current, Voltage};
use serialport::SerialPort;

/// Number of outputs of the HP 6626A.
pub const NUM_CHANNELS: usize = 4;

/// Highest valid primary GPIB address.
pub const MAX_GPIB_ADDRESS: u8 = 30;

/// Programming range of a single output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputRange {
    /// Highest programmable voltage in volts.
    pub max_voltage: f64,
    /// Highest programmable current limit in amperes.
    pub max_current: f64,
}

impl OutputRange {
    /// Programming range of the given 1-based output.
    ///
    /// Outputs 1 and 2 are the low voltage outputs (16 V, 1 A), outputs 3 and 4 the high voltage
    /// outputs (50 V, 0.5 A).
    pub fn for_channel(channel: usize) -> Self {
        match channel {
            1 | 2 => OutputRange {
                max_voltage: 16.0,
                max_current: 1.0,
            },
            _ => OutputRange {
                max_voltage: 50.0,
                max_current: 0.5,
            },
        }
    }
}

/// A SerialInterface for a USB-to-GPIB bridge.
///
/// Builds an instrument link serial interface with the settings Prologix-compatible bridges use.
#[derive(Debug)]
pub struct SerialInterfaceHp6626a {}

impl SerialInterfaceHp6626a {
    /// Try to open the bridge's serial port.
    ///
    /// The reply timeout is set to 3 seconds. Use [`InstrumentInterface::set_timeout`] on the
    /// returned interface, or [`Hp6626a::set_timeout`], to shorten it for polling.
    ///
    /// Arguments:
    /// * `port` - The name of the serial port, e.g., `"/dev/ttyUSB0"` or `"COM3"`.
    /// * `baud` - Baud rate of the bridge.
    pub fn simple(
        port: &str,
        baud: u32,
    ) -> Result<Instrument<Box<dyn SerialPort>>, InstrumentError> {
        let timeout = Duration::from_secs(3);
        let port = serialport::new(port, baud)
            .timeout(timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None);
        SerialInterface::full(port)
    }
}

/// Shared access to the interface.
///
/// Every transaction holds the lock from the first byte written until the reply has been read, so
/// concurrent users of the same supply never see each other's replies. After a failed query the
/// link is marked stale, and the next query first discards whatever input is pending, e.g., a
/// reply that arrived after its timeout.
struct Link<T: InstrumentInterface> {
    interface: Arc<Mutex<T>>,
    stale: Arc<AtomicBool>,
    bridge: bool,
}

impl<T: InstrumentInterface> Link<T> {
    fn sendcmd(&self, cmd: &str) -> Result<(), InstrumentError> {
        let mut intf = self.interface.lock().expect("Mutex should not be poisoned");
        intf.sendcmd(cmd)
    }

    fn query(&self, cmd: &str) -> Result<String, InstrumentError> {
        let mut intf = self.interface.lock().expect("Mutex should not be poisoned");
        if self.stale.swap(false, Ordering::SeqCst) {
            log::debug!("discarding stale input before {cmd:?}");
            intf.clear_input()?;
        }
        let result = if self.bridge {
            bridge_query(&mut *intf, cmd)
        } else {
            intf.query(cmd)
        };
        if result.is_err() {
            self.stale.store(true, Ordering::SeqCst);
        }
        result
    }

    fn query_f64(&self, cmd: &str) -> Result<f64, InstrumentError> {
        let resp = self.query(cmd)?;
        resp.trim()
            .parse::<f64>()
            .map_err(|_| self.unexpected(resp))
    }

    /// Report a reply the driver cannot parse.
    ///
    /// Such a line may be a late reply with the real one still on its way, so the link is marked
    /// stale as well.
    fn unexpected(&self, resp: String) -> InstrumentError {
        self.stale.store(true, Ordering::SeqCst);
        InstrumentError::ResponseParseError(resp)
    }

    fn run(&self, cmd: Command) -> Result<(), InstrumentError> {
        self.sendcmd(&cmd.to_string())
    }
}

fn bridge_query<T: InstrumentInterface>(
    intf: &mut T,
    cmd: &str,
) -> Result<String, InstrumentError> {
    intf.sendcmd(cmd)?;
    // the bridge only reads from the bus when told to
    intf.sendcmd("++read eoi")?;
    intf.read_until_terminator().map_err(|err| match err {
        InstrumentError::Timeout(timeout) => InstrumentError::TimeoutQuery {
            query: cmd.to_string(),
            timeout,
        },
        other => other,
    })
}

impl<T: InstrumentInterface> Clone for Link<T> {
    fn clone(&self) -> Self {
        Self {
            interface: Arc::clone(&self.interface),
            stale: Arc::clone(&self.stale),
            bridge: self.bridge,
        }
    }
}

/// A rust driver for the HP 6626A.
///
/// See the top-level documentation for an example on how to use this driver.
pub struct Hp6626a<T: InstrumentInterface> {
    link: Link<T>,
    num_channels: usize,
}

impl<T: InstrumentInterface> Hp6626a<T> {
    /// Create a new HP 6626A instance that talks to the supply directly over `interface`.
    ///
    /// # Arguments
    /// * `interface` - An instrument interface that implements the [`InstrumentInterface`] trait.
    pub fn new(interface: T) -> Self {
        Hp6626a {
            link: Link {
                interface: Arc::new(Mutex::new(interface)),
                stale: Arc::new(AtomicBool::new(false)),
                bridge: false,
            },
            num_channels: NUM_CHANNELS,
        }
    }

    /// Create a new HP 6626A instance behind a Prologix-compatible USB-to-GPIB bridge.
    ///
    /// This configures the bridge as controller, selects the supply's GPIB address, and disables
    /// automatic read-after-write. Afterwards, every query is followed by `++read eoi` so that the
    /// bridge fetches the reply from the bus.
    ///
    /// # Arguments
    /// * `interface` - The bridge's interface, e.g., from [`SerialInterfaceHp6626a::simple`].
    /// * `address` - Primary GPIB address of the supply, `0..=30`.
    pub fn with_bridge(interface: T, address: u8) -> Result<Self, InstrumentError> {
        if address > MAX_GPIB_ADDRESS {
            return Err(InstrumentError::IntValueOutOfRange {
                value: address.into(),
                min: 0,
                max: MAX_GPIB_ADDRESS.into(),
            });
        }
        let mut inst = Self::new(interface);
        inst.link.bridge = true;
        {
            let mut intf = inst
                .link
                .interface
                .lock()
                .expect("Mutex should not be poisoned");
            intf.sendcmd("++mode 1")?;
            intf.sendcmd(&format!("++addr {address}"))?;
            intf.sendcmd("++auto 0")?;
            intf.sendcmd("++eoi 1")?;
            intf.sendcmd("++eos 2")?;
        }
        log::info!("GPIB bridge configured for address {address}");
        Ok(inst)
    }

    /// Get a new channel with a given index.
    ///
    /// Channels use the supply's 1-based output numbers.
    pub fn get_channel(&mut self, idx: usize) -> Result<Channel<T>, InstrumentError> {
        if idx == 0 || idx > self.num_channels {
            return Err(InstrumentError::ChannelIndexOutOfRange {
                idx,
                nof_channels: self.num_channels,
            });
        }
        Ok(Channel::new(idx, self.link.clone()))
    }

    /// Number of outputs of this supply.
    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Query the model identification, e.g., `HP6626A`.
    pub fn get_name(&mut self) -> Result<String, InstrumentError> {
        self.link.query(&Command::Identify.to_string())
    }

    /// Query and clear the programming error register. `0` means no error.
    pub fn get_error(&mut self) -> Result<i64, InstrumentError> {
        let resp = self.link.query(&Command::Error.to_string())?;
        resp.trim()
            .parse::<i64>()
            .map_err(|_| self.link.unexpected(resp))
    }

    /// Return the supply to its power-on state. All outputs are disabled.
    pub fn clear(&mut self) -> Result<(), InstrumentError> {
        self.link.run(Command::Clear)
    }

    /// Send a raw command string to the supply.
    pub fn sendcmd(&mut self, cmd: &str) -> Result<(), InstrumentError> {
        self.link.sendcmd(cmd)
    }

    /// Send a raw query string to the supply and return its reply.
    pub fn query(&mut self, cmd: &str) -> Result<String, InstrumentError> {
        self.link.query(cmd)
    }

    /// Set the reply timeout of the underlying interface.
    pub fn set_timeout(&mut self, timeout: Duration) {
        let mut intf = self
            .link
            .interface
            .lock()
            .expect("Mutex should not be poisoned");
        intf.set_timeout(timeout);
    }

    /// Release the underlying interface. Calling this more than once is fine.
    pub fn close(&mut self) -> Result<(), InstrumentError> {
        let mut intf = self
            .link
            .interface
            .lock()
            .expect("Mutex should not be poisoned");
        intf.close()
    }
}

impl<T: InstrumentInterface> Clone for Hp6626a<T> {
    fn clone(&self) -> Self {
        Self {
            link: self.link.clone(),
            num_channels: self.num_channels,
        }
    }
}

/// Channel structure representing a single output of the HP 6626A.
///
/// **This structure can only be created through the [`Hp6626a`] struct.**
pub struct Channel<T: InstrumentInterface> {
    idx: usize,
    range: OutputRange,
    link: Link<T>,
}

impl<T: InstrumentInterface> Channel<T> {
    fn new(idx: usize, link: Link<T>) -> Self {
        Channel {
            idx,
            range: OutputRange::for_channel(idx),
            link,
        }
    }

    /// The 1-based output number of this channel.
    pub fn index(&self) -> usize {
        self.idx
    }

    /// Programming range of this output.
    pub fn range(&self) -> OutputRange {
        self.range
    }

    /// Program the output voltage.
    ///
    /// Values outside of the output's range are rejected before anything is sent.
    pub fn set_voltage(&mut self, voltage: Voltage) -> Result<(), InstrumentError> {
        let volts = voltage.as_volts();
        check_range(volts, self.range.max_voltage)?;
        self.link.run(Command::SetVoltage {
            channel: self.idx,
            volts,
        })
    }

    /// Program the output current limit.
    ///
    /// Values outside of the output's range are rejected before anything is sent.
    pub fn set_current_limit(&mut self, current: Current) -> Result<(), InstrumentError> {
        let amps = current.as_amperes();
        check_range(amps, self.range.max_current)?;
        self.link.run(Command::SetCurrentLimit {
            channel: self.idx,
            amps,
        })
    }

    /// Enable or disable the output.
    pub fn set_output_enabled(&mut self, enabled: bool) -> Result<(), InstrumentError> {
        self.link.run(Command::SetOutput {
            channel: self.idx,
            enabled,
        })
    }

    /// Measure the output voltage.
    pub fn get_voltage(&mut self) -> Result<Voltage, InstrumentError> {
        let val = self
            .link
            .query_f64(&Command::MeasureVoltage(self.idx).to_string())?;
        Ok(Voltage::from_volts(val))
    }

    /// Measure the output current.
    pub fn get_current(&mut self) -> Result<Current, InstrumentError> {
        let val = self
            .link
            .query_f64(&Command::MeasureCurrent(self.idx).to_string())?;
        Ok(Current::from_amperes(val))
    }

    /// Read back the programmed output voltage.
    pub fn get_programmed_voltage(&mut self) -> Result<Voltage, InstrumentError> {
        let val = self
            .link
            .query_f64(&Command::ProgrammedVoltage(self.idx).to_string())?;
        Ok(Voltage::from_volts(val))
    }

    /// Read back the programmed current limit.
    pub fn get_programmed_current_limit(&mut self) -> Result<Current, InstrumentError> {
        let val = self
            .link
            .query_f64(&Command::ProgrammedCurrentLimit(self.idx).to_string())?;
        Ok(Current::from_amperes(val))
    }

    /// Read back whether the output is enabled.
    pub fn get_output_enabled(&mut self) -> Result<bool, InstrumentError> {
        let resp = self.link.query(&Command::OutputState(self.idx).to_string())?;
        match resp.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            _ => Err(self.link.unexpected(resp)),
        }
    }
}

impl<T: InstrumentInterface> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            idx: self.idx,
            range: self.range,
            link: self.link.clone(),
        }
    }
}

fn check_range(value: f64, max: f64) -> Result<(), InstrumentError> {
    if !(0.0..=max).contains(&value) {
        return Err(InstrumentError::FloatValueOutOfRange {
            value,
            min: 0.0,
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_ranges() {
        assert_eq!(OutputRange::for_channel(1).max_voltage, 16.0);
        assert_eq!(OutputRange::for_channel(2).max_current, 1.0);
        assert_eq!(OutputRange::for_channel(3).max_voltage, 50.0);
        assert_eq!(OutputRange::for_channel(4).max_current, 0.5);
    }

    #[test]
    fn test_check_range() {
        assert!(check_range(0.0, 16.0).is_ok());
        assert!(check_range(16.0, 16.0).is_ok());
        assert!(check_range(-0.1, 16.0).is_err());
        assert!(check_range(16.01, 16.0).is_err());
        assert!(check_range(f64::NAN, 16.0).is_err());
    }
}
