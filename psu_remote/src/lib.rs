//! Remote control for the HP 6626A power supply.
//!
//! A [`poller::Poller`] owns the link to the supply. It queries every output's voltage and
//! current on a fixed interval and carries out user requests between two queries, so only one
//! transaction is ever on the bus. [`controller::PollingController`] runs it on a dedicated thread;
//! the UI side holds a [`controller::ControllerHandle`] and mirrors the state from the stream of
//! [`model::ModelEvent`]s.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::mpsc;
//!
//! use hp_6626a::Hp6626a;
//! use psu_remote::{
//!     config::Config, controller::PollingController, model::SupplyModel,
//!     poller::{Poller, connector}, sim::SimProbe,
//! };
//!
//! let probe = SimProbe::new();
//! let (tx, rx) = mpsc::channel();
//! let open = connector(move || probe.connect().map(Hp6626a::new));
//! let mut mirror = SupplyModel::new(hp_6626a::NUM_CHANNELS, 100);
//! let poller = Poller::connect(open, Config::default(), tx).unwrap();
//!
//! let mut handle = PollingController::spawn(poller);
//! handle.set_voltage(1, 5.0).unwrap();
//! for event in rx.try_iter() {
//!     mirror.apply(&event);
//! }
//! handle.stop();
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod controller;
pub mod model;
pub mod poller;
pub mod sim;

use instrument_link::InstrumentError;
use thiserror::Error;

/// Errors of the polling controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The supply or the link reported an error.
    #[error(transparent)]
    Instrument(#[from] InstrumentError),
    /// Polling was suspended after too many consecutive failures.
    #[error("Polling is suspended after repeated failures. Reconnect first.")]
    Suspended,
    /// The link to the supply is closed.
    #[error("The power supply is not connected.")]
    Disconnected,
    /// The poll thread is no longer running.
    #[error("The polling controller has been stopped.")]
    Stopped,
}
