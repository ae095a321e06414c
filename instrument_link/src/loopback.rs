//! Scripted fake transport for driver tests.
//!
//! [`LoopbackInterface`] holds two scripts: the lines the driver must write, in order, and the
//! lines the instrument answers with. Every entry of both scripts gets the same line ending
//! appended, usually `"\n"`.

use std::collections::VecDeque;

use crate::{InstrumentError, InstrumentInterface};

/// A transport that checks a driver's traffic against a script.
///
/// A write that differs from the next scripted line panics, so does reading past the scripted
/// replies. Dropping the interface with scripted lines left over panics as well, unless the
/// thread is already panicking.
///
/// # Example
///
/// ```
/// use instrument_link::{InstrumentInterface, LoopbackInterface};
///
/// let mut lbk = LoopbackInterface::new(vec!["VOUT? 1"], vec!["5.0012"], "\n");
/// assert_eq!("5.0012", lbk.query("VOUT? 1").unwrap());
/// ```
#[derive(Debug)]
pub struct LoopbackInterface {
    expected_writes: VecDeque<String>,
    replies: VecDeque<String>,
    line_end: String,
    pending: VecDeque<u8>,
    terminator: String,
    closed: bool,
}

impl LoopbackInterface {
    /// Create a loopback from the two scripts.
    ///
    /// # Arguments:
    /// * `from_host` - Lines the driver must send, without line ending.
    /// * `from_inst` - Lines the instrument replies with, without line ending.
    /// * `line_end` - Appended to every scripted line.
    pub fn new<S: Into<String>>(from_host: Vec<S>, from_inst: Vec<S>, line_end: &str) -> Self {
        LoopbackInterface {
            expected_writes: from_host.into_iter().map(Into::into).collect(),
            replies: from_inst.into_iter().map(Into::into).collect(),
            line_end: line_end.to_string(),
            pending: VecDeque::new(),
            terminator: "\n".to_string(),
            closed: false,
        }
    }

    /// Panic if any scripted line was not used.
    ///
    /// Runs on drop, call it directly to check at a specific point of a test.
    pub fn finalize(&mut self) {
        if let Some(cmd) = self.expected_writes.front() {
            panic!("Driver never sent the scripted command {cmd:?}");
        }
        if let Some(reply) = self.replies.front() {
            panic!("Driver never read the scripted reply {reply:?}");
        }
    }

    /// Assert the terminator the driver configured on this interface.
    pub fn test_terminator(&self, expected: &str) {
        assert_eq!(
            expected, self.terminator,
            "Terminator should be {expected:?}, but is {:?}",
            self.terminator
        );
    }

    /// Returns `true` once [`InstrumentInterface::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn next_byte(&mut self) -> u8 {
        loop {
            if let Some(byte) = self.pending.pop_front() {
                return byte;
            }
            let Some(reply) = self.replies.pop_front() else {
                panic!("Driver reads, but no more replies are scripted");
            };
            self.pending.extend(reply.bytes().chain(self.line_end.bytes()));
        }
    }
}

impl InstrumentInterface for LoopbackInterface {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), InstrumentError> {
        if self.closed {
            return Err(InstrumentError::NotConnected);
        }
        buf.iter_mut().for_each(|b| *b = self.next_byte());
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<(), InstrumentError> {
        if self.closed {
            return Err(InstrumentError::NotConnected);
        }
        let Some(cmd) = self.expected_writes.pop_front() else {
            panic!(
                "Driver sent {:?}, but no more commands are scripted",
                String::from_utf8_lossy(data)
            );
        };
        let expected = format!("{cmd}{}", self.line_end);
        assert_eq!(
            expected.as_bytes(),
            data,
            "Driver should send {expected:?}, but sent {:?}",
            String::from_utf8_lossy(data)
        );
        Ok(())
    }

    fn get_terminator(&self) -> &str {
        &self.terminator
    }

    fn set_terminator(&mut self, terminator: &str) {
        terminator.clone_into(&mut self.terminator);
    }

    /// Drops the unread rest of the current reply. Scripted replies that were not started are
    /// kept.
    fn clear_input(&mut self) -> Result<(), InstrumentError> {
        self.pending.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), InstrumentError> {
        self.closed = true;
        Ok(())
    }
}

impl Drop for LoopbackInterface {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.finalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replies_are_served_byte_by_byte() {
        let mut lbk = LoopbackInterface::new(vec![], vec!["ab", "c"], "\r\n");
        let mut buf = [0u8; 3];
        lbk.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ab\r");
        let mut buf = [0u8; 4];
        lbk.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"\nc\r\n");
    }
}
