//! Wire representation of the HP 6626A command set.

use std::fmt::Display;

/// A single command for the HP 6626A.
///
/// Set commands carry a value and get no reply; queries end with `?` and expect one line back.
/// Channel numbers are the instrument's 1-based output numbers. Values are rendered in fixed
/// point with four decimals, e.g., `VSET 1,1.8000`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Program the output voltage in volts.
    SetVoltage {
        /// Output number.
        channel: usize,
        /// Voltage in volts.
        volts: f64,
    },
    /// Program the output current limit in amperes.
    SetCurrentLimit {
        /// Output number.
        channel: usize,
        /// Current in amperes.
        amps: f64,
    },
    /// Enable or disable an output.
    SetOutput {
        /// Output number.
        channel: usize,
        /// `true` to enable the output.
        enabled: bool,
    },
    /// Read back the measured output voltage.
    MeasureVoltage(usize),
    /// Read back the measured output current.
    MeasureCurrent(usize),
    /// Read back the programmed voltage.
    ProgrammedVoltage(usize),
    /// Read back the programmed current limit.
    ProgrammedCurrentLimit(usize),
    /// Read back whether the output is enabled.
    OutputState(usize),
    /// Model identification.
    Identify,
    /// Programming error register.
    Error,
    /// Device clear, returns the supply to its power-on state.
    Clear,
}

impl Command {
    /// Returns `true` if the instrument answers this command with a line.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            Command::MeasureVoltage(_)
                | Command::MeasureCurrent(_)
                | Command::ProgrammedVoltage(_)
                | Command::ProgrammedCurrentLimit(_)
                | Command::OutputState(_)
                | Command::Identify
                | Command::Error
        )
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::SetVoltage { channel, volts } => write!(f, "VSET {channel},{volts:.4}"),
            Command::SetCurrentLimit { channel, amps } => write!(f, "ISET {channel},{amps:.4}"),
            Command::SetOutput { channel, enabled } => {
                write!(f, "OUT {channel},{}", if *enabled { 1 } else { 0 })
            }
            Command::MeasureVoltage(channel) => write!(f, "VOUT? {channel}"),
            Command::MeasureCurrent(channel) => write!(f, "IOUT? {channel}"),
            Command::ProgrammedVoltage(channel) => write!(f, "VSET? {channel}"),
            Command::ProgrammedCurrentLimit(channel) => write!(f, "ISET? {channel}"),
            Command::OutputState(channel) => write!(f, "OUT? {channel}"),
            Command::Identify => write!(f, "ID?"),
            Command::Error => write!(f, "ERR?"),
            Command::Clear => write!(f, "CLR"),
        }
    }
}
