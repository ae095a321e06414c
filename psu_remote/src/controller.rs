//! Runs a [`Poller`] on its own thread.
//!
//! The UI keeps a [`ControllerHandle`] and talks to the poll thread only through a request
//! channel. Results come back as [`crate::model::ModelEvent`]s on the channel the poller was
//! created with.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use instrument_link::InstrumentInterface;
use log::{debug, info, warn};

use crate::{
    ControllerError,
    poller::{Poller, Request},
};

/// Starts the poll thread.
#[derive(Debug)]
pub struct PollingController {}

impl PollingController {
    /// Move `poller` to a new thread, start polling, and return the handle to control it.
    pub fn spawn<T>(poller: Poller<T>) -> ControllerHandle
    where
        T: InstrumentInterface + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let stop = poller.stop_flag();
        let thread = thread::Builder::new()
            .name("psu-poll".to_string())
            .spawn(move || run(poller, rx));
        let thread = match thread {
            Ok(thread) => Some(thread),
            Err(err) => {
                warn!("could not start the poll thread: {err}");
                None
            }
        };
        ControllerHandle {
            requests: thread.as_ref().map(|_| tx),
            stop,
            thread,
        }
    }
}

/// UI side of a running [`PollingController`].
///
/// Dropping the handle stops the poll thread and closes the link.
#[derive(Debug)]
pub struct ControllerHandle {
    requests: Option<Sender<Request>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ControllerHandle {
    /// Queue a request. Fails only if the poll thread is gone.
    pub fn submit(&self, request: Request) -> Result<(), ControllerError> {
        let requests = self.requests.as_ref().ok_or(ControllerError::Stopped)?;
        requests.send(request).map_err(|_| ControllerError::Stopped)
    }

    /// Program the voltage of a 1-based output.
    pub fn set_voltage(&self, channel: usize, volts: f64) -> Result<(), ControllerError> {
        self.submit(Request::SetVoltage { channel, volts })
    }

    /// Program the current limit of a 1-based output.
    pub fn set_current_limit(&self, channel: usize, amps: f64) -> Result<(), ControllerError> {
        self.submit(Request::SetCurrentLimit { channel, amps })
    }

    /// Switch a 1-based output on or off.
    pub fn set_output_enabled(&self, channel: usize, enabled: bool) -> Result<(), ControllerError> {
        self.submit(Request::SetOutputEnabled { channel, enabled })
    }

    /// Send a typed command; a command ending with `?` is a query.
    pub fn send_raw(&self, command: &str) -> Result<(), ControllerError> {
        self.submit(Request::Raw(command.to_string()))
    }

    /// Close and reopen the link, e.g., after polling was suspended.
    pub fn reconnect(&self) -> Result<(), ControllerError> {
        self.submit(Request::Reconnect)
    }

    /// Returns `true` while the poll thread is alive.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop polling, wait for the thread to finish, and close the link.
    ///
    /// The command in flight, if any, completes first. Calling this more than once is fine.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // dropping the sender wakes the thread
        self.requests = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("poll thread panicked");
            }
        }
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<T: InstrumentInterface>(mut poller: Poller<T>, requests: Receiver<Request>) {
    debug!("poll thread started");
    poller.start();
    let period = poller.poll_interval();
    let mut next_cycle = Instant::now();

    'outer: loop {
        loop {
            match requests.try_recv() {
                Ok(request) => poller.dispatch(request),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'outer,
            }
        }
        if poller.stop_requested() {
            break;
        }

        if poller.is_polling() && Instant::now() >= next_cycle {
            if poller.poll_step() {
                next_cycle += period;
                let now = Instant::now();
                if next_cycle < now {
                    next_cycle = now;
                }
            }
            continue;
        }

        let wait = if poller.is_polling() {
            next_cycle.saturating_duration_since(Instant::now())
        } else {
            period
        };
        match requests.recv_timeout(wait) {
            Ok(request) => poller.dispatch(request),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if !poller.is_polling() {
            // restart the schedule once polling resumes
            next_cycle = Instant::now();
        }
    }

    poller.close();
    info!("poll thread stopped");
}
