//! The poll loop body: owns the supply, polls all outputs, and carries out user requests.
//!
//! A [`Poller`] is driven step by step, one query transaction per step, so requests can be
//! handled between any two steps without ever splitting a transaction. Every change it makes to
//! its [`SupplyModel`] is also sent out as a [`ModelEvent`].

use std::{
    fmt::Display,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
    },
    time::Duration,
};

use hp_6626a::Hp6626a;
use instrument_link::{InstrumentError, InstrumentInterface};
use log::{debug, error, info, warn};
use measurements::{Current, Voltage};

use crate::{
    ControllerError,
    config::Config,
    model::{ConnectionState, ModelEvent, PollState, Quantity, Reading, Setting, SupplyModel},
};

/// Opens the link to the supply. Called on connect and on every reconnect.
pub type Connector<T> = Box<dyn FnMut() -> Result<Hp6626a<T>, InstrumentError> + Send>;

/// Box a closure as a [`Connector`].
pub fn connector<T, F>(open: F) -> Connector<T>
where
    T: InstrumentInterface,
    F: FnMut() -> Result<Hp6626a<T>, InstrumentError> + Send + 'static,
{
    Box::new(open)
}

/// A request from the user.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Program the voltage of a 1-based output.
    SetVoltage {
        /// Output number.
        channel: usize,
        /// Volts.
        volts: f64,
    },
    /// Program the current limit of a 1-based output.
    SetCurrentLimit {
        /// Output number.
        channel: usize,
        /// Amperes.
        amps: f64,
    },
    /// Switch a 1-based output on or off.
    SetOutputEnabled {
        /// Output number.
        channel: usize,
        /// `true` to switch on.
        enabled: bool,
    },
    /// Send a typed command. Commands ending with `?` are queries.
    Raw(String),
    /// Close the link, reopen it, and resume.
    Reconnect,
}

impl Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::SetVoltage { channel, volts } => write!(f, "vset {channel} {volts}"),
            Request::SetCurrentLimit { channel, amps } => write!(f, "iset {channel} {amps}"),
            Request::SetOutputEnabled { channel, enabled } => {
                write!(f, "{} {channel}", if *enabled { "on" } else { "off" })
            }
            Request::Raw(cmd) => write!(f, "raw {cmd}"),
            Request::Reconnect => write!(f, "reconnect"),
        }
    }
}

/// Polls the supply and applies requests.
pub struct Poller<T: InstrumentInterface> {
    supply: Option<Hp6626a<T>>,
    connector: Connector<T>,
    config: Config,
    model: SupplyModel,
    events: Sender<ModelEvent>,
    stop: Arc<AtomicBool>,
    running: bool,
    cursor: usize,
}

impl<T: InstrumentInterface> Poller<T> {
    /// Open the link through `connector` and prepare for polling.
    ///
    /// If `restore_outputs` is set, the saved presets are programmed, otherwise the programmed
    /// values are read back from the supply. The output states are always read back. The poller
    /// starts `Idle`; call [`Poller::start`] to begin polling.
    pub fn connect(
        connector: Connector<T>,
        config: Config,
        events: Sender<ModelEvent>,
    ) -> Result<Self, ControllerError> {
        let model = SupplyModel::new(hp_6626a::NUM_CHANNELS, config.history_len);
        let mut poller = Poller {
            supply: None,
            connector,
            config,
            model,
            events,
            stop: Arc::new(AtomicBool::new(false)),
            running: false,
            cursor: 0,
        };
        poller.open()?;
        Ok(poller)
    }

    /// The poller's view of the supply.
    pub fn model(&self) -> &SupplyModel {
        &self.model
    }

    /// Flag that makes the poller stop before its next command.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Returns `true` once a stop was requested.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Returns `true` while polling.
    pub fn is_polling(&self) -> bool {
        self.model.poll == PollState::Polling
    }

    /// Time between the starts of two poll cycles.
    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval()
    }

    /// Begin polling. Does nothing unless the poller is `Idle` and connected.
    pub fn start(&mut self) {
        self.running = true;
        if self.model.poll == PollState::Idle && self.supply.is_some() {
            info!("polling every {:?}", self.config.poll_interval());
            self.cursor = 0;
            self.emit(ModelEvent::Poll(PollState::Polling));
        }
    }

    /// Run one full poll cycle over all outputs.
    pub fn poll_cycle(&mut self) {
        while self.is_polling() && !self.poll_step() {}
    }

    /// Query the next output quantity.
    ///
    /// Outputs are visited in order, voltage before current. Returns `true` once the last step of
    /// the cycle is done, or if there is nothing to poll.
    pub fn poll_step(&mut self) -> bool {
        let steps = 2 * self.model.channels().len();
        while self.cursor < steps {
            let channel = self.cursor / 2 + 1;
            let quantity = if self.cursor % 2 == 0 {
                Quantity::Voltage
            } else {
                Quantity::Current
            };
            self.cursor += 1;

            if self.config.skip_disabled_outputs
                && !self
                    .model
                    .channel(channel)
                    .is_some_and(|ch| ch.output_enabled)
            {
                continue;
            }
            if self.stop_requested() || !self.is_polling() {
                return true;
            }
            self.measure(channel, quantity);
            if self.cursor < steps {
                return false;
            }
        }
        self.cursor = 0;
        true
    }

    fn measure(&mut self, channel: usize, quantity: Quantity) {
        let Some(supply) = self.supply.as_mut() else {
            return;
        };
        debug!("polling {quantity} of output {channel}");
        let result = supply.get_channel(channel).and_then(|mut ch| match quantity {
            Quantity::Voltage => ch.get_voltage().map(|v| v.as_volts()),
            Quantity::Current => ch.get_current().map(|c| c.as_amperes()),
        });
        match result {
            Ok(value) => self.emit(ModelEvent::Measured {
                channel,
                quantity,
                reading: Reading::now(value),
            }),
            Err(err) => {
                warn!("polling {quantity} of output {channel} failed: {err}");
                self.emit(ModelEvent::PollFailed {
                    channel,
                    quantity,
                    error: err.to_string(),
                });
                if self.model.consecutive_failures >= self.config.failure_threshold {
                    error!(
                        "{} consecutive poll failures, polling suspended until reconnect",
                        self.model.consecutive_failures
                    );
                    self.emit(ModelEvent::Connection(ConnectionState::Error));
                    self.emit(ModelEvent::Poll(PollState::Error));
                }
            }
        }
    }

    /// Carry out a request and report a failure as [`ModelEvent::CommandFailed`].
    pub fn dispatch(&mut self, request: Request) {
        let command = request.to_string();
        if let Err(err) = self.handle(request) {
            warn!("{command} failed: {err}");
            self.emit(ModelEvent::CommandFailed {
                command,
                error: err.to_string(),
            });
        }
    }

    /// Carry out a request.
    ///
    /// Everything but [`Request::Reconnect`] is rejected while polling is suspended or the link
    /// is closed.
    pub fn handle(&mut self, request: Request) -> Result<(), ControllerError> {
        let event = match request {
            Request::Reconnect => return self.reconnect(),
            Request::SetVoltage { channel, volts } => {
                self.ready_supply()?
                    .get_channel(channel)?
                    .set_voltage(Voltage::from_volts(volts))?;
                info!("output {channel} set to {volts:.4} V");
                ModelEvent::Programmed {
                    channel,
                    setting: Setting::Voltage(volts),
                }
            }
            Request::SetCurrentLimit { channel, amps } => {
                self.ready_supply()?
                    .get_channel(channel)?
                    .set_current_limit(Current::from_amperes(amps))?;
                info!("output {channel} current limit set to {amps:.4} A");
                ModelEvent::Programmed {
                    channel,
                    setting: Setting::CurrentLimit(amps),
                }
            }
            Request::SetOutputEnabled { channel, enabled } => {
                self.ready_supply()?
                    .get_channel(channel)?
                    .set_output_enabled(enabled)?;
                info!("output {channel} {}", if enabled { "on" } else { "off" });
                ModelEvent::Programmed {
                    channel,
                    setting: Setting::Output(enabled),
                }
            }
            Request::Raw(command) => {
                let command = command.trim().to_string();
                let supply = self.ready_supply()?;
                let reply = if command.ends_with('?') {
                    supply.query(&command)?
                } else {
                    supply.sendcmd(&command)?;
                    String::new()
                };
                ModelEvent::RawReply { command, reply }
            }
        };
        self.emit(event);
        Ok(())
    }

    fn ready_supply(&mut self) -> Result<&mut Hp6626a<T>, ControllerError> {
        if self.model.poll == PollState::Error {
            return Err(ControllerError::Suspended);
        }
        self.supply.as_mut().ok_or(ControllerError::Disconnected)
    }

    /// Close the link, reopen it, and resume polling if it was running.
    pub fn reconnect(&mut self) -> Result<(), ControllerError> {
        info!("reconnecting");
        self.close();
        self.emit(ModelEvent::CountersReset);
        if let Err(err) = self.open() {
            if matches!(err, ControllerError::Stopped) {
                info!("reconnect abandoned, stop requested");
                return Err(err);
            }
            error!("reconnect failed: {err}");
            self.emit(ModelEvent::Connection(ConnectionState::Error));
            self.emit(ModelEvent::Poll(PollState::Error));
            return Err(err);
        }
        if self.running {
            self.start();
        }
        Ok(())
    }

    /// Release the link. Calling this more than once is fine.
    pub fn close(&mut self) {
        if let Some(mut supply) = self.supply.take() {
            if let Err(err) = supply.close() {
                warn!("closing the link failed: {err}");
            }
            info!("link closed");
        }
        if self.model.connection != ConnectionState::Disconnected {
            self.emit(ModelEvent::Connection(ConnectionState::Disconnected));
        }
        if self.model.poll != PollState::Idle {
            self.emit(ModelEvent::Poll(PollState::Idle));
        }
        self.cursor = 0;
    }

    fn open(&mut self) -> Result<(), ControllerError> {
        let mut supply = (self.connector)()?;
        supply.set_timeout(self.config.query_timeout());
        self.supply = Some(supply);
        if let Err(err) = self.sync_outputs() {
            self.close();
            return Err(err);
        }
        info!("connected to the supply");
        self.emit(ModelEvent::Connection(ConnectionState::Connected));
        Ok(())
    }

    /// Bring the model in line with the supply right after opening the link.
    ///
    /// Gives up with [`ControllerError::Stopped`] before the next output once a stop was
    /// requested.
    fn sync_outputs(&mut self) -> Result<(), ControllerError> {
        let Some(supply) = self.supply.as_mut() else {
            return Err(ControllerError::Disconnected);
        };
        let mut events = Vec::new();
        for idx in 1..=supply.num_channels() {
            if self.stop.load(Ordering::SeqCst) {
                return Err(ControllerError::Stopped);
            }
            let mut channel = supply.get_channel(idx)?;
            let preset = self
                .config
                .preset(idx)
                .filter(|_| self.config.restore_outputs);
            let (volts, amps) = match preset {
                Some(preset) => {
                    let restored = channel
                        .set_voltage(Voltage::from_volts(preset.voltage))
                        .and_then(|_| {
                            channel.set_current_limit(Current::from_amperes(preset.current))
                        });
                    match restored {
                        Ok(()) => {
                            debug!(
                                "restored output {idx} to {:.4} V, {:.4} A",
                                preset.voltage, preset.current
                            );
                            (preset.voltage, preset.current)
                        }
                        Err(err @ InstrumentError::FloatValueOutOfRange { .. }) => {
                            warn!("saved preset of output {idx} not restored: {err}");
                            read_programmed(&mut channel)?
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                None => read_programmed(&mut channel)?,
            };
            let enabled = channel.get_output_enabled()?;
            events.push(ModelEvent::Programmed {
                channel: idx,
                setting: Setting::Voltage(volts),
            });
            events.push(ModelEvent::Programmed {
                channel: idx,
                setting: Setting::CurrentLimit(amps),
            });
            events.push(ModelEvent::Programmed {
                channel: idx,
                setting: Setting::Output(enabled),
            });
        }
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    fn emit(&mut self, event: ModelEvent) {
        self.model.apply(&event);
        if self.events.send(event).is_err() {
            debug!("no one is listening for model events");
        }
    }
}

fn read_programmed<T: InstrumentInterface>(
    channel: &mut hp_6626a::Channel<T>,
) -> Result<(f64, f64), InstrumentError> {
    let volts = channel.get_programmed_voltage()?.as_volts();
    let amps = channel.get_programmed_current_limit()?.as_amperes();
    Ok((volts, amps))
}

impl<T: InstrumentInterface> Drop for Poller<T> {
    fn drop(&mut self) {
        if let Some(mut supply) = self.supply.take() {
            if let Err(err) = supply.close() {
                warn!("closing the link failed: {err}");
            }
        }
    }
}
