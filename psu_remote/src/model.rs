//! In-memory model of the supply as seen by the front-end.
//!
//! The poll thread owns one [`SupplyModel`] and the UI thread keeps a mirror of it. Both only
//! change through [`SupplyModel::apply`], fed with the same [`ModelEvent`]s, so the mirror never
//! diverges from the poller's view.

use std::{collections::VecDeque, fmt::Display, time::Instant};

/// Which measured quantity a reading belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    /// Output voltage, in volts.
    Voltage,
    /// Output current, in amperes.
    Current,
}

impl Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quantity::Voltage => write!(f, "voltage"),
            Quantity::Current => write!(f, "current"),
        }
    }
}

/// A measured value together with the moment it was read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Value in volts or amperes.
    pub value: f64,
    /// When the reply was parsed.
    pub at: Instant,
}

impl Reading {
    /// A reading of `value` taken now.
    pub fn now(value: f64) -> Self {
        Reading {
            value,
            at: Instant::now(),
        }
    }
}

/// Bounded FIFO of readings for plotting.
#[derive(Debug, Clone, PartialEq)]
pub struct History {
    readings: VecDeque<Reading>,
    capacity: usize,
}

impl History {
    /// An empty history that keeps at most `capacity` readings (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        History {
            readings: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a reading, evicting the oldest one once the window is full.
    pub fn push(&mut self, reading: Reading) {
        while self.readings.len() >= self.capacity {
            self.readings.pop_front();
        }
        self.readings.push_back(reading);
    }

    /// Number of readings currently kept.
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// `true` if nothing has been read yet.
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Maximum number of readings kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The most recent reading.
    pub fn latest(&self) -> Option<&Reading> {
        self.readings.back()
    }

    /// Readings from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Reading> {
        self.readings.iter()
    }

    /// Values from oldest to newest, ready to be plotted.
    pub fn values(&self) -> Vec<f64> {
        self.readings.iter().map(|r| r.value).collect()
    }
}

/// State of the link to the supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link is open.
    Disconnected,
    /// The link is open and replies arrive.
    Connected,
    /// Too many consecutive failures, or reopening the link failed.
    Error,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

/// State of the polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Connected but not polling.
    Idle,
    /// Querying all outputs on every tick.
    Polling,
    /// Suspended until the user reconnects.
    Error,
}

impl Display for PollState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollState::Idle => write!(f, "idle"),
            PollState::Polling => write!(f, "polling"),
            PollState::Error => write!(f, "error"),
        }
    }
}

/// A programmed setting of one output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Setting {
    /// Programmed voltage in volts.
    Voltage(f64),
    /// Programmed current limit in amperes.
    CurrentLimit(f64),
    /// Output enabled.
    Output(bool),
}

/// A change of the model, sent from the poll thread to the UI thread.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// A query reply was parsed.
    Measured {
        /// 1-based output number.
        channel: usize,
        /// What was measured.
        quantity: Quantity,
        /// The parsed value.
        reading: Reading,
    },
    /// A poll query timed out or its reply could not be parsed.
    PollFailed {
        /// 1-based output number.
        channel: usize,
        /// What should have been measured.
        quantity: Quantity,
        /// Description of the failure.
        error: String,
    },
    /// A setting was accepted by the supply.
    Programmed {
        /// 1-based output number.
        channel: usize,
        /// The new setting.
        setting: Setting,
    },
    /// The connection state changed.
    Connection(ConnectionState),
    /// The polling state changed.
    Poll(PollState),
    /// Failure counters were cleared after a reconnect.
    CountersReset,
    /// A user request could not be carried out.
    CommandFailed {
        /// The request as typed or issued.
        command: String,
        /// Description of the failure.
        error: String,
    },
    /// Reply to a raw command. Empty for commands without a reply.
    RawReply {
        /// The raw command.
        command: String,
        /// The supply's reply.
        reply: String,
    },
}

/// Everything the front-end knows about one output.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelState {
    /// 1-based output number.
    pub index: usize,
    /// Last programmed voltage in volts.
    pub set_voltage: f64,
    /// Last programmed current limit in amperes.
    pub set_current_limit: f64,
    /// Most recent successfully measured voltage.
    pub measured_voltage: Option<f64>,
    /// Most recent successfully measured current.
    pub measured_current: Option<f64>,
    /// Whether the output is enabled.
    pub output_enabled: bool,
    /// Voltage readings for plotting.
    pub voltage_history: History,
    /// Current readings for plotting.
    pub current_history: History,
}

impl ChannelState {
    fn new(index: usize, history_len: usize) -> Self {
        ChannelState {
            index,
            set_voltage: 0.0,
            set_current_limit: 0.0,
            measured_voltage: None,
            measured_current: None,
            output_enabled: false,
            voltage_history: History::new(history_len),
            current_history: History::new(history_len),
        }
    }

    /// History of the given quantity.
    pub fn history(&self, quantity: Quantity) -> &History {
        match quantity {
            Quantity::Voltage => &self.voltage_history,
            Quantity::Current => &self.current_history,
        }
    }
}

/// The model of the whole supply.
#[derive(Debug, Clone, PartialEq)]
pub struct SupplyModel {
    channels: Vec<ChannelState>,
    /// State of the link.
    pub connection: ConnectionState,
    /// State of the polling loop.
    pub poll: PollState,
    /// Poll failures since the last successful reading.
    pub consecutive_failures: u32,
    /// Poll failures since the last reconnect.
    pub total_failures: u64,
}

impl SupplyModel {
    /// A disconnected model with `num_channels` outputs.
    pub fn new(num_channels: usize, history_len: usize) -> Self {
        SupplyModel {
            channels: (1..=num_channels)
                .map(|idx| ChannelState::new(idx, history_len))
                .collect(),
            connection: ConnectionState::Disconnected,
            poll: PollState::Idle,
            consecutive_failures: 0,
            total_failures: 0,
        }
    }

    /// All outputs, ordered by output number.
    pub fn channels(&self) -> &[ChannelState] {
        &self.channels
    }

    /// The output with 1-based number `idx`.
    pub fn channel(&self, idx: usize) -> Option<&ChannelState> {
        idx.checked_sub(1).and_then(|i| self.channels.get(i))
    }

    fn channel_mut(&mut self, idx: usize) -> Option<&mut ChannelState> {
        idx.checked_sub(1).and_then(|i| self.channels.get_mut(i))
    }

    /// Apply one change. Events for unknown outputs are ignored.
    pub fn apply(&mut self, event: &ModelEvent) {
        match event {
            ModelEvent::Measured {
                channel,
                quantity,
                reading,
            } => {
                self.consecutive_failures = 0;
                if let Some(ch) = self.channel_mut(*channel) {
                    match quantity {
                        Quantity::Voltage => {
                            ch.measured_voltage = Some(reading.value);
                            ch.voltage_history.push(*reading);
                        }
                        Quantity::Current => {
                            ch.measured_current = Some(reading.value);
                            ch.current_history.push(*reading);
                        }
                    }
                }
            }
            ModelEvent::PollFailed { .. } => {
                self.consecutive_failures += 1;
                self.total_failures += 1;
            }
            ModelEvent::Programmed { channel, setting } => {
                if let Some(ch) = self.channel_mut(*channel) {
                    match setting {
                        Setting::Voltage(v) => ch.set_voltage = *v,
                        Setting::CurrentLimit(a) => ch.set_current_limit = *a,
                        Setting::Output(on) => ch.output_enabled = *on,
                    }
                }
            }
            ModelEvent::Connection(state) => self.connection = *state,
            ModelEvent::Poll(state) => self.poll = *state,
            ModelEvent::CountersReset => {
                self.consecutive_failures = 0;
                self.total_failures = 0;
            }
            ModelEvent::CommandFailed { .. } | ModelEvent::RawReply { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measured(channel: usize, quantity: Quantity, value: f64) -> ModelEvent {
        ModelEvent::Measured {
            channel,
            quantity,
            reading: Reading::now(value),
        }
    }

    #[test]
    fn test_history_evicts_oldest_first() {
        let mut history = History::new(3);
        for value in 0..5 {
            history.push(Reading::now(value as f64));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.values(), vec![2.0, 3.0, 4.0]);
        assert_eq!(history.latest().map(|r| r.value), Some(4.0));
    }

    #[test]
    fn test_history_has_room_for_one() {
        let mut history = History::new(0);
        assert_eq!(history.capacity(), 1);
        history.push(Reading::now(1.0));
        history.push(Reading::now(2.0));
        assert_eq!(history.values(), vec![2.0]);
    }

    #[test]
    fn test_measured_updates_value_and_history() {
        let mut model = SupplyModel::new(4, 10);
        model.apply(&measured(1, Quantity::Voltage, 5.0012));

        let ch = model.channel(1).unwrap();
        assert_eq!(ch.measured_voltage, Some(5.0012));
        assert_eq!(ch.measured_current, None);
        assert_eq!(ch.voltage_history.len(), 1);
        assert!(ch.current_history.is_empty());
    }

    #[test]
    fn test_failures_keep_last_value() {
        let mut model = SupplyModel::new(4, 10);
        model.apply(&measured(2, Quantity::Current, 0.25));
        let failed = ModelEvent::PollFailed {
            channel: 2,
            quantity: Quantity::Current,
            error: "timeout".to_string(),
        };
        model.apply(&failed);
        model.apply(&failed);

        assert_eq!(model.channel(2).unwrap().measured_current, Some(0.25));
        assert_eq!(model.consecutive_failures, 2);
        assert_eq!(model.total_failures, 2);

        model.apply(&measured(2, Quantity::Voltage, 1.0));
        assert_eq!(model.consecutive_failures, 0);
        assert_eq!(model.total_failures, 2);
    }

    #[test]
    fn test_programmed_and_states() {
        let mut model = SupplyModel::new(4, 10);
        model.apply(&ModelEvent::Programmed {
            channel: 3,
            setting: Setting::Voltage(12.0),
        });
        model.apply(&ModelEvent::Programmed {
            channel: 3,
            setting: Setting::Output(true),
        });
        model.apply(&ModelEvent::Connection(ConnectionState::Connected));
        model.apply(&ModelEvent::Poll(PollState::Polling));

        let ch = model.channel(3).unwrap();
        assert_eq!(ch.set_voltage, 12.0);
        assert!(ch.output_enabled);
        assert_eq!(model.connection, ConnectionState::Connected);
        assert_eq!(model.poll, PollState::Polling);
    }

    #[test]
    fn test_unknown_channel_is_ignored() {
        let mut model = SupplyModel::new(4, 10);
        let before = model.clone();
        model.apply(&ModelEvent::Programmed {
            channel: 0,
            setting: Setting::Voltage(1.0),
        });
        model.apply(&ModelEvent::Programmed {
            channel: 9,
            setting: Setting::Voltage(1.0),
        });
        assert_eq!(model, before);
        assert!(model.channel(0).is_none());
    }
}
