//! An in-process HP 6626A simulator.
//!
//! [`SimulatedSupply`] implements [`InstrumentInterface`] on the byte level: it parses every
//! line the driver writes, keeps programmed values per output, and queues the reply the real
//! supply would give. Each output drives a resistive load, so measured values follow the usual
//! constant voltage / constant current behavior.
//!
//! All clones attached through a [`SimProbe`] share one state, which lets a test keep the probe,
//! hand the supply to the poller, script faults, and inspect the transcript afterwards.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use hp_6626a::{NUM_CHANNELS, OutputRange};
use instrument_link::{InstrumentError, InstrumentInterface};

/// Misbehavior to apply to the next query.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Swallow the query and never reply.
    Timeout,
    /// Reply with a line that is not a number.
    Garbage,
    /// Reply with exactly this line.
    Reply(String),
    /// Reply too late: the answer arrives only after the read waiting for it has timed out.
    Late,
}

/// One line sent to the simulator and what it answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    /// The line as received, without terminator.
    pub command: String,
    /// The reply line, `None` for set-commands and swallowed queries. Late replies are recorded
    /// as well.
    pub reply: Option<String>,
}

/// Programmed state of one simulated output.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SimOutput {
    /// Programmed voltage in volts.
    pub voltage: f64,
    /// Programmed current limit in amperes.
    pub current_limit: f64,
    /// Whether the output is on.
    pub enabled: bool,
}

#[derive(Debug)]
struct SimState {
    outputs: Vec<SimOutput>,
    load_ohms: f64,
    faults: VecDeque<Fault>,
    transcript: Vec<Transaction>,
    error: i64,
    latency: Duration,
    unplugged: bool,
}

impl Default for SimState {
    fn default() -> Self {
        SimState {
            outputs: vec![SimOutput::default(); NUM_CHANNELS],
            load_ohms: 1000.0,
            faults: VecDeque::new(),
            transcript: Vec::new(),
            error: 0,
            latency: Duration::ZERO,
            unplugged: false,
        }
    }
}

// HP 6626A programming error codes
const ERR_INVALID_CHARACTER: i64 = 1;
const ERR_INVALID_NUMBER: i64 = 2;
const ERR_SYNTAX: i64 = 4;
const ERR_NUMBER_RANGE: i64 = 5;

impl SimState {
    fn output(&self, channel: usize) -> Option<&SimOutput> {
        channel.checked_sub(1).and_then(|i| self.outputs.get(i))
    }

    /// Voltage and current at the load of the given output.
    fn measure(&self, channel: usize) -> Option<(f64, f64)> {
        let out = self.output(channel)?;
        if !out.enabled || self.load_ohms <= 0.0 {
            return Some((0.0, 0.0));
        }
        let cv_current = out.voltage / self.load_ohms;
        if cv_current <= out.current_limit {
            Some((out.voltage, cv_current))
        } else {
            Some((out.current_limit * self.load_ohms, out.current_limit))
        }
    }

    /// Execute one line and return the reply for queries.
    fn execute(&mut self, line: &str) -> Option<String> {
        let mut parts = line.splitn(2, char::is_whitespace);
        let header = parts.next().unwrap_or_default().to_ascii_uppercase();
        let args: Vec<&str> = parts
            .next()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .collect();

        match header.as_str() {
            "ID?" => Some("HP6626A".to_string()),
            "ERR?" => {
                let err = self.error;
                self.error = 0;
                Some(err.to_string())
            }
            "CLR" => {
                self.outputs = vec![SimOutput::default(); NUM_CHANNELS];
                None
            }
            "VSET" | "ISET" | "OUT" => {
                self.program(&header, &args);
                None
            }
            "VOUT?" | "IOUT?" | "VSET?" | "ISET?" | "OUT?" => {
                let Some(channel) = self.channel_arg(&args) else {
                    return None;
                };
                let out = self.output(channel).copied().unwrap_or_default();
                let (volts, amps) = self.measure(channel).unwrap_or_default();
                Some(match header.as_str() {
                    "VOUT?" => format!("{volts:.4}"),
                    "IOUT?" => format!("{amps:.4}"),
                    "VSET?" => format!("{:.4}", out.voltage),
                    "ISET?" => format!("{:.4}", out.current_limit),
                    _ => (if out.enabled { "1" } else { "0" }).to_string(),
                })
            }
            _ => {
                self.error = ERR_INVALID_CHARACTER;
                None
            }
        }
    }

    fn channel_arg(&mut self, args: &[&str]) -> Option<usize> {
        let Some(arg) = args.first() else {
            self.error = ERR_SYNTAX;
            return None;
        };
        match arg.parse::<usize>() {
            Ok(ch) if (1..=NUM_CHANNELS).contains(&ch) => Some(ch),
            Ok(_) => {
                self.error = ERR_NUMBER_RANGE;
                None
            }
            Err(_) => {
                self.error = ERR_INVALID_NUMBER;
                None
            }
        }
    }

    fn program(&mut self, header: &str, args: &[&str]) {
        let Some(channel) = self.channel_arg(args) else {
            return;
        };
        let Some(value) = args.get(1).and_then(|v| v.parse::<f64>().ok()) else {
            self.error = ERR_INVALID_NUMBER;
            return;
        };
        let range = OutputRange::for_channel(channel);
        let max = match header {
            "VSET" => range.max_voltage,
            "ISET" => range.max_current,
            _ => 1.0,
        };
        if !(0.0..=max).contains(&value) {
            self.error = ERR_NUMBER_RANGE;
            return;
        }
        let out = &mut self.outputs[channel - 1];
        match header {
            "VSET" => out.voltage = value,
            "ISET" => out.current_limit = value,
            _ => out.enabled = value != 0.0,
        }
    }
}

/// Shared control over a simulated supply.
#[derive(Debug, Clone, Default)]
pub struct SimProbe {
    state: Arc<Mutex<SimState>>,
}

impl SimProbe {
    /// A fresh simulator with all outputs off and a 1 kOhm load on each.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().expect("Mutex should not be poisoned")
    }

    /// Open a new interface to the simulated supply.
    ///
    /// Fails like an absent serial device while the supply is unplugged.
    pub fn connect(&self) -> Result<SimulatedSupply, InstrumentError> {
        if self.lock().unplugged {
            return Err(InstrumentError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "simulated supply is unplugged",
            )));
        }
        Ok(SimulatedSupply {
            state: Arc::clone(&self.state),
            line: Vec::new(),
            reply: VecDeque::new(),
            late: Vec::new(),
            timeout: Duration::from_secs(3),
            closed: false,
        })
    }

    /// Apply `fault` to the next query that has no fault queued yet.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    /// Number of faults that have not been consumed yet.
    pub fn pending_faults(&self) -> usize {
        self.lock().faults.len()
    }

    /// Every line received so far.
    pub fn transcript(&self) -> Vec<Transaction> {
        self.lock().transcript.clone()
    }

    /// Forget the transcript.
    pub fn clear_transcript(&self) {
        self.lock().transcript.clear();
    }

    /// Program an output directly, bypassing the command parser.
    pub fn set_output(&self, channel: usize, output: SimOutput) {
        let mut state = self.lock();
        if let Some(out) = channel.checked_sub(1).and_then(|i| state.outputs.get_mut(i)) {
            *out = output;
        }
    }

    /// Current programmed state of an output.
    pub fn output(&self, channel: usize) -> Option<SimOutput> {
        self.lock().output(channel).copied()
    }

    /// Resistance of the load connected to every output.
    pub fn set_load(&self, ohms: f64) {
        self.lock().load_ohms = ohms;
    }

    /// Delay before every reply, to mimic the bus.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Pull or plug the cable. While unplugged, writes fail and new connections are refused.
    pub fn set_unplugged(&self, unplugged: bool) {
        self.lock().unplugged = unplugged;
    }
}

/// One open interface to the simulated supply.
#[derive(Debug)]
pub struct SimulatedSupply {
    state: Arc<Mutex<SimState>>,
    line: Vec<u8>,
    reply: VecDeque<u8>,
    late: Vec<u8>,
    timeout: Duration,
    closed: bool,
}

impl SimulatedSupply {
    fn handle_line(&mut self, line: &str) -> Result<(), InstrumentError> {
        let latency;
        {
            let mut state = self.state.lock().expect("Mutex should not be poisoned");
            if state.unplugged {
                return Err(InstrumentError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "simulated supply is unplugged",
                )));
            }
            latency = state.latency;

            // bridge commands are accepted and ignored
            let mut late = false;
            let reply = if line.starts_with("++") {
                None
            } else {
                let reply = state.execute(line);
                match (reply, line.trim_end().ends_with('?')) {
                    (Some(reply), true) => match state.faults.pop_front() {
                        None => Some(reply),
                        Some(Fault::Timeout) => None,
                        Some(Fault::Garbage) => Some("#?!".to_string()),
                        Some(Fault::Reply(scripted)) => Some(scripted),
                        Some(Fault::Late) => {
                            late = true;
                            Some(reply)
                        }
                    },
                    (reply, _) => reply,
                }
            };
            if let Some(reply) = &reply {
                let bytes = reply.bytes().chain(std::iter::once(b'\n'));
                if late {
                    self.late.extend(bytes);
                } else {
                    self.reply.extend(bytes);
                }
            }
            state.transcript.push(Transaction {
                command: line.to_string(),
                reply,
            });
        }
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        Ok(())
    }
}

impl InstrumentInterface for SimulatedSupply {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), InstrumentError> {
        if self.closed {
            return Err(InstrumentError::NotConnected);
        }
        if self.reply.len() < buf.len() {
            // a late reply shows up just after the read gave up on it
            self.reply.extend(self.late.drain(..));
            return Err(InstrumentError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no reply from simulated supply",
            )));
        }
        for byte in buf.iter_mut() {
            *byte = self.reply.pop_front().unwrap_or_default();
        }
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<(), InstrumentError> {
        if self.closed {
            return Err(InstrumentError::NotConnected);
        }
        for &byte in data {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&self.line).trim().to_string();
                self.line.clear();
                if !line.is_empty() {
                    self.handle_line(&line)?;
                }
            } else {
                self.line.push(byte);
            }
        }
        Ok(())
    }

    fn get_timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn clear_input(&mut self) -> Result<(), InstrumentError> {
        if self.closed {
            return Err(InstrumentError::NotConnected);
        }
        self.reply.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), InstrumentError> {
        self.closed = true;
        self.line.clear();
        self.reply.clear();
        self.late.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supply() -> (SimProbe, SimulatedSupply) {
        let probe = SimProbe::new();
        let sim = probe.connect().unwrap();
        (probe, sim)
    }

    #[test]
    fn test_identify_and_error_register() {
        let (_probe, mut sim) = supply();
        assert_eq!(sim.query("ID?").unwrap(), "HP6626A");
        assert_eq!(sim.query("ERR?").unwrap(), "0");
        sim.sendcmd("BOGUS 1").unwrap();
        assert_eq!(sim.query("ERR?").unwrap(), "1");
        assert_eq!(sim.query("ERR?").unwrap(), "0");
    }

    #[test]
    fn test_constant_voltage_and_constant_current() {
        let (probe, mut sim) = supply();
        probe.set_load(100.0);
        sim.sendcmd("VSET 1,5.0000").unwrap();
        sim.sendcmd("ISET 1,0.5000").unwrap();
        sim.sendcmd("OUT 1,1").unwrap();
        assert_eq!(sim.query("VOUT? 1").unwrap(), "5.0000");
        assert_eq!(sim.query("IOUT? 1").unwrap(), "0.0500");

        sim.sendcmd("ISET 1,0.0100").unwrap();
        assert_eq!(sim.query("VOUT? 1").unwrap(), "1.0000");
        assert_eq!(sim.query("IOUT? 1").unwrap(), "0.0100");

        sim.sendcmd("OUT 1,0").unwrap();
        assert_eq!(sim.query("VOUT? 1").unwrap(), "0.0000");
        assert_eq!(sim.query("OUT? 1").unwrap(), "0");
    }

    #[test]
    fn test_out_of_range_is_refused() {
        let (probe, mut sim) = supply();
        sim.sendcmd("VSET 1,20.0").unwrap();
        assert_eq!(probe.output(1).unwrap().voltage, 0.0);
        assert_eq!(sim.query("ERR?").unwrap(), "5");
        sim.sendcmd("VSET 3,20.0").unwrap();
        assert_eq!(probe.output(3).unwrap().voltage, 20.0);
    }

    #[test]
    fn test_faults_apply_to_queries_only() {
        let (probe, mut sim) = supply();
        probe.inject(Fault::Timeout);
        sim.sendcmd("VSET 1,1.0").unwrap();
        assert_eq!(probe.pending_faults(), 1);
        assert!(sim.query("VOUT? 1").unwrap_err().is_timeout());

        probe.inject(Fault::Garbage);
        assert_eq!(sim.query("VOUT? 1").unwrap(), "#?!");

        probe.inject(Fault::Reply("5.0012".to_string()));
        assert_eq!(sim.query("VOUT? 1").unwrap(), "5.0012");
        assert_eq!(sim.query("VOUT? 1").unwrap(), "0.0000");
    }

    #[test]
    fn test_late_reply_waits_in_the_input_buffer() {
        let (probe, mut sim) = supply();
        probe.set_load(100.0);
        sim.sendcmd("VSET 1,5.0000").unwrap();
        sim.sendcmd("ISET 1,1.0000").unwrap();
        sim.sendcmd("OUT 1,1").unwrap();

        probe.inject(Fault::Late);
        assert!(sim.query("VOUT? 1").unwrap_err().is_timeout());
        // without clearing, the next query reads the old answer
        assert_eq!(sim.query("IOUT? 1").unwrap(), "5.0000");
        assert_eq!(sim.read_until_terminator().unwrap(), "0.0500");

        probe.inject(Fault::Late);
        assert!(sim.query("VOUT? 1").unwrap_err().is_timeout());
        sim.clear_input().unwrap();
        assert_eq!(sim.query("IOUT? 1").unwrap(), "0.0500");
    }

    #[test]
    fn test_transcript_records_every_line() {
        let (probe, mut sim) = supply();
        sim.sendcmd("++addr 5").unwrap();
        sim.sendcmd("VSET 2,1.5000").unwrap();
        sim.query("VSET? 2").unwrap();
        assert_eq!(
            probe.transcript(),
            vec![
                Transaction {
                    command: "++addr 5".to_string(),
                    reply: None
                },
                Transaction {
                    command: "VSET 2,1.5000".to_string(),
                    reply: None
                },
                Transaction {
                    command: "VSET? 2".to_string(),
                    reply: Some("1.5000".to_string())
                },
            ]
        );
    }

    #[test]
    fn test_unplugged_and_closed() {
        let (probe, mut sim) = supply();
        probe.set_unplugged(true);
        assert!(matches!(
            sim.sendcmd("ID?"),
            Err(InstrumentError::Io(_))
        ));
        assert!(probe.connect().is_err());
        probe.set_unplugged(false);
        sim.close().unwrap();
        sim.close().unwrap();
        assert!(matches!(
            sim.sendcmd("ID?"),
            Err(InstrumentError::NotConnected)
        ));
    }
}
