//! [`Instrument`] wraps any byte stream, usually an opened serial port, into an
//! [`InstrumentInterface`].

use std::{
    io::ErrorKind,
    time::{Duration, Instant},
};

use crate::{InstrumentError, InstrumentInterface};

/// Line framing and timeouts on top of a byte stream.
///
/// The reply timeout is enforced by the [`Instrument`] itself. A port that reports a timed out
/// read is asked again until the reply timeout has passed, so the port's own read timeout only
/// sets how often the deadline is checked. Keep it short, as [`crate::SerialInterface`] does.
///
/// The stream is owned exclusively by the [`Instrument`]. Calling
/// [`InstrumentInterface::close`] flushes and drops it; every later read or write returns
/// [`InstrumentError::NotConnected`].
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
///
/// use instrument_link::{Instrument, InstrumentInterface};
///
/// let port = serialport::new("/dev/ttyUSB0", 115200)
///     .timeout(Duration::from_millis(500))
///     .open()
///     .unwrap();
/// let mut bridge = Instrument::new(port, Duration::from_secs(1));
/// bridge.sendcmd("++ver").unwrap();
/// ```
#[derive(Debug)]
pub struct Instrument<P: std::io::Read + std::io::Write> {
    port: Option<P>,
    terminator: String,
    timeout: Duration,
}

impl<P: std::io::Read + std::io::Write> Instrument<P> {
    /// Wrap `port`. Replies must arrive within `timeout`, lines end with `"\n"`.
    pub fn new(port: P, timeout: Duration) -> Self {
        Self {
            port: Some(port),
            terminator: "\n".to_string(),
            timeout,
        }
    }

    /// Returns `true` until the instrument has been closed.
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn port_mut(&mut self) -> Result<&mut P, InstrumentError> {
        self.port.as_mut().ok_or(InstrumentError::NotConnected)
    }

    /// Read one byte. `Ok(None)` means nothing arrived within one read of the port.
    fn read_byte(&mut self) -> Result<Option<u8>, InstrumentError> {
        let mut byte = [0u8];
        match self.port_mut()?.read_exact(&mut byte) {
            Ok(()) => Ok(Some(byte[0])),
            Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl<P: std::io::Read + std::io::Write> InstrumentInterface for Instrument<P> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), InstrumentError> {
        self.port_mut()?.read_exact(buf)?;
        Ok(())
    }

    fn get_terminator(&self) -> &str {
        &self.terminator
    }

    fn set_terminator(&mut self, terminator: &str) {
        terminator.clone_into(&mut self.terminator);
    }

    fn get_timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn read_until_terminator(&mut self) -> Result<String, InstrumentError> {
        let deadline = Instant::now() + self.timeout;
        let terminator = self.terminator.clone().into_bytes();
        let mut line = Vec::new();

        while !line.ends_with(&terminator) {
            if Instant::now() > deadline {
                return Err(InstrumentError::Timeout(self.timeout));
            }
            match self.read_byte() {
                Ok(Some(byte)) => line.push(byte),
                Ok(None) => {}
                Err(InstrumentError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                    return Err(InstrumentError::Timeout(self.timeout));
                }
                Err(err) => return Err(err),
            }
        }
        let response = match String::from_utf8(line) {
            Ok(response) => response,
            Err(err) => {
                log::warn!("Received invalid UTF-8 data: {:?}", err.as_bytes());
                String::from_utf8_lossy(err.as_bytes()).replace('\u{FFFD}', "")
            }
        };
        log::trace!("rx: {response:?}");
        Ok(response.trim().to_string())
    }

    fn clear_input(&mut self) -> Result<(), InstrumentError> {
        let deadline = Instant::now() + self.timeout;
        let mut discarded = 0usize;
        while Instant::now() <= deadline {
            match self.read_byte() {
                Ok(Some(_)) => discarded += 1,
                Ok(None) => break,
                Err(InstrumentError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err),
            }
        }
        if discarded > 0 {
            log::debug!("discarded {discarded} stale bytes");
        }
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<(), InstrumentError> {
        let port = self.port_mut()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), InstrumentError> {
        if let Some(mut port) = self.port.take() {
            log::debug!("closing instrument port");
            port.flush()?;
        }
        Ok(())
    }
}
