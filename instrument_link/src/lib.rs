//! Instrument link: talk to line-oriented instruments from Rust.
//!
//! This crate provides the transport layer for instruments that are controlled with short ASCII
//! commands and answer with line-terminated replies, e.g., a power supply sitting behind a
//! USB-to-GPIB bridge. It provides the [`InstrumentInterface`] trait, a generic [`Instrument`]
//! implementation for anything that implements [`std::io::Read`] and [`std::io::Write`], a
//! [`SerialInterface`] to open serial ports, and a [`LoopbackInterface`] to test drivers without
//! hardware.
//!
//! Only one command is ever in flight on an interface: [`InstrumentInterface::query`] writes the
//! command and then blocks until the terminator arrives or the timeout expires. No retries are
//! performed here, retry policy belongs to the caller.
//!
//! # Example
//!
//! ```no_run
//! use instrument_link::{InstrumentInterface, SerialInterface};
//!
//! let mut inst = SerialInterface::simple("/dev/ttyUSB0", 9600).unwrap();
//! inst.sendcmd("++ver").unwrap();
//! println!("{}", inst.read_until_terminator().unwrap());
//! inst.close().unwrap();
//! ```

#![warn(missing_docs)]

mod instrument;
mod loopback;
#[cfg(feature = "serial")]
mod serial;

pub use instrument::Instrument;
pub use loopback::LoopbackInterface;
#[cfg(feature = "serial")]
pub use serial::{SerialInterface, list_ports};

use std::time::{Duration, Instant};

use thiserror::Error;

/// The error enum for all instruments.
///
/// For any command sending or querying, your instrument should return either an empty result or a
/// result with the query where this Error is the alternative. [`InstrumentError`] makes it easy to
/// propagate all the sending commands, querying errors forward with the `?` operator such that
/// errors propagate nicely.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InstrumentError {
    /// The instrument did not acknowledge the command that was sent. The response received is
    /// returned in the error as a String.
    #[error("Instrument did not acknowledge the command sent, but responded with: {0}")]
    NotAcknowledged(String),
    /// The channel index requested is out of range. The error contains the index requested and
    /// the number of channels that are currently configured.
    #[error(
        "Channel with index {idx} is out of range. Number of channels available: {nof_channels}"
    )]
    ChannelIndexOutOfRange {
        /// Index of the channel that is out of range.
        idx: usize,
        /// Total number of channels.
        nof_channels: usize,
    },
    /// A given float value is out of the specified range.
    #[error("Float value {value} is out of range. Allowed range is [{min}, {max}]")]
    FloatValueOutOfRange {
        /// The value that is out of range.
        value: f64,
        /// The minimum value that is allowed.
        min: f64,
        /// The maximum value that is allowed.
        max: f64,
    },
    /// A given integer value is out of the specified range.
    #[error("Integer value {value} is out of range. Allowed range is [{min}, {max}]")]
    IntValueOutOfRange {
        /// The value that is out of range.
        value: i64,
        /// The minimum value that is allowed.
        min: i64,
        /// The maximum value that is allowed.
        max: i64,
    },
    /// Error when an invalid argument is passed to a function. It is intended for the user.
    #[error("{0}")]
    InvalidArgument(String),
    /// Error when reading from/writing to an interface. See [`std::io::Error`] for more details.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The interface was closed and can no longer be used.
    #[error("The instrument interface is not connected.")]
    NotConnected,
    /// Instrument response could not be parsed becuase it was unexpected by the driver. This error
    /// contains the response that was received from the instrument.
    #[error("Response from instrument could not be parsed. Response was: {0}")]
    ResponseParseError(String),
    #[cfg(feature = "serial")]
    /// Serial port errors occur when opening a serial interface, e.g., when the device is absent
    /// or busy. See the [`serialport::Error`] documentation for more information.
    #[error(transparent)]
    Serialport(#[from] serialport::Error),
    /// Timeout occurred while waiting for a response from the instrument. The error contains the
    /// timeout that was exceeded.
    #[error(
        "Timeout occured while waiting for a response from the instrument. Timeout was set to {0:?}."
    )]
    Timeout(Duration),
    /// Timeout occurred while waiting for a response to a query. The error contains the query
    /// that was sent and the timeout that was exceeded.
    #[error(
        "Timeout occured while waiting for a response to query: {query}. Timeout was set to {timeout:?}."
    )]
    TimeoutQuery {
        /// The query that timed out.
        query: String,
        /// The timeout that was set.
        timeout: Duration,
    },
}

impl InstrumentError {
    /// Returns `true` if this error is one of the two timeout variants.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            InstrumentError::Timeout(_) | InstrumentError::TimeoutQuery { .. }
        )
    }
}

/// The `InstrumentInterface` trait defines the interface for controlling instruments.
///
/// Implementors only have to provide [`InstrumentInterface::read_exact`] and
/// [`InstrumentInterface::write_raw`]. Everything else, i.e., framing commands with the
/// terminator, reading replies until the terminator, and enforcing the timeout, is provided by
/// default methods.
pub trait InstrumentInterface {
    /// Read exactly `buf.len()` bytes from the interface.
    ///
    /// Implementations backed by a port with a read timeout should return an
    /// [`std::io::ErrorKind::TimedOut`] I/O error when nothing arrives in time.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), InstrumentError>;

    /// Write all bytes to the interface and flush it.
    fn write_raw(&mut self, data: &[u8]) -> Result<(), InstrumentError>;

    /// Get the terminator of the interface. Defaults to `"\n"`.
    fn get_terminator(&self) -> &str {
        "\n"
    }

    /// Set the terminator of an interface from a `&str`.
    ///
    /// # Arguments:
    /// - `_terminator` - A string slice that will be used as the terminator for commands
    fn set_terminator(&mut self, _terminator: &str) {}

    /// Get the timeout for reading replies. Defaults to three seconds.
    fn get_timeout(&self) -> Duration {
        Duration::from_secs(3)
    }

    /// Set the timeout for reading replies.
    fn set_timeout(&mut self, _timeout: Duration) {}

    /// Write a string to the interface as is, i.e., without appending the terminator.
    fn write(&mut self, data: &str) -> Result<(), InstrumentError> {
        self.write_raw(data.as_bytes())
    }

    /// Send a command to the instrument.
    ///
    /// This function takes the command, appends the terminator, and writes it to the instrument.
    ///
    /// # Arguments:
    /// - `cmd` - A string slice that will be sent to the instrument.
    fn sendcmd(&mut self, cmd: &str) -> Result<(), InstrumentError> {
        log::trace!("tx: {cmd:?}");
        let cmd = format!("{cmd}{}", self.get_terminator());
        self.write_raw(cmd.as_bytes())
    }

    /// Read from the interface until the terminator is found and return the trimmed reply.
    ///
    /// Blocks at most for the interface timeout. If no terminator arrives in time, or the
    /// underlying port reports a timed out read, [`InstrumentError::Timeout`] is returned.
    /// Non-UTF-8 bytes are skipped.
    fn read_until_terminator(&mut self) -> Result<String, InstrumentError> {
        let timeout = self.get_timeout();
        let terminator = self.get_terminator().to_string();
        let mut response = String::new();
        let mut single_buf = [0u8];

        let tic = Instant::now();
        loop {
            if tic.elapsed() > timeout {
                return Err(InstrumentError::Timeout(timeout));
            }
            match self.read_exact(&mut single_buf) {
                Ok(()) => {}
                Err(InstrumentError::Io(err))
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::UnexpectedEof
                    ) =>
                {
                    return Err(InstrumentError::Timeout(timeout));
                }
                Err(err) => return Err(err),
            }
            match std::str::from_utf8(&single_buf) {
                Ok(val) => response.push_str(val),
                Err(_) => log::warn!("Received invalid UTF-8 data: {single_buf:?}"),
            }
            if response.ends_with(&terminator) {
                break;
            }
        }
        log::trace!("rx: {response:?}");
        Ok(response.trim().to_string())
    }

    /// Query the instrument with a command and return the response as a String.
    ///
    /// This function uses `sendcmd` to send the command and then `read_until_terminator` to read
    /// the reply. A timeout is reported as [`InstrumentError::TimeoutQuery`] which carries the
    /// query that was sent.
    ///
    /// # Arguments
    /// * `cmd` - The command to send to the instrument for which we expect a response.
    fn query(&mut self, cmd: &str) -> Result<String, InstrumentError> {
        self.sendcmd(cmd)?;
        self.read_until_terminator().map_err(|err| match err {
            InstrumentError::Timeout(timeout) => InstrumentError::TimeoutQuery {
                query: cmd.to_string(),
                timeout,
            },
            other => other,
        })
    }

    /// Discard everything the instrument sent that has not been read yet.
    ///
    /// Call this after a failed query, so that a reply arriving after its timeout is not taken
    /// as the answer to the next query. The default does nothing, interfaces that buffer input
    /// override it.
    fn clear_input(&mut self) -> Result<(), InstrumentError> {
        Ok(())
    }

    /// Read one line and check that it equals the expected acknowledgment.
    fn check_acknowledgment(&mut self, ack: &str) -> Result<(), InstrumentError> {
        let resp = self.read_until_terminator()?;
        if resp == ack {
            Ok(())
        } else {
            Err(InstrumentError::NotAcknowledged(resp))
        }
    }

    /// Release the underlying transport.
    ///
    /// Closing is idempotent. After closing, all reads and writes fail with
    /// [`InstrumentError::NotConnected`].
    fn close(&mut self) -> Result<(), InstrumentError> {
        Ok(())
    }
}
