//! Terminal front-end for the HP 6626A.
//!
//! Usage: `psu-remote [config.json]`. Type `help` for the list of commands.

use std::{
    env,
    error::Error,
    io::{self, BufRead},
    process::ExitCode,
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    thread,
    time::Duration,
};

use hp_6626a::{Hp6626a, SerialInterfaceHp6626a};
use instrument_link::InstrumentInterface;
use log::{error, info};

use psu_remote::{
    cli::{HELP, Input, InputError, parse_line, status_lines},
    config::Config,
    controller::PollingController,
    model::{ModelEvent, SupplyModel},
    poller::{Connector, Poller, connector},
    sim::SimProbe,
};

const DEFAULT_CONFIG: &str = "config.json";
const RENDER_INTERVAL: Duration = Duration::from_millis(100);

fn main() -> ExitCode {
    env_logger::Builder::from_default_env()
        .format_timestamp_micros()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(err) => {
            error!("could not load {path}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let result = if config.simulate {
        info!("using the simulated supply");
        let probe = SimProbe::new();
        probe.set_load(100.0);
        run(
            &path,
            config,
            connector(move || probe.connect().map(Hp6626a::new)),
        )
    } else {
        let port = config.serial_port.clone();
        let (baud, address) = (config.baud_rate, config.gpib_address);
        info!("using {port} at {baud} baud, GPIB address {address}");
        run(
            &path,
            config,
            connector(move || {
                let interface = SerialInterfaceHp6626a::simple(&port, baud)?;
                Hp6626a::with_bridge(interface, address)
            }),
        )
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run<T>(path: &str, mut config: Config, open: Connector<T>) -> Result<(), Box<dyn Error>>
where
    T: InstrumentInterface + Send + 'static,
{
    let (event_tx, event_rx) = mpsc::channel();
    // the mirror replays every event, including those sent while connecting
    let mut mirror = SupplyModel::new(hp_6626a::NUM_CHANNELS, config.history_len);
    let poller = Poller::connect(open, config.clone(), event_tx)?;
    let mut handle = PollingController::spawn(poller);
    let lines = spawn_stdin_reader();
    println!("{HELP}");

    loop {
        match lines.recv_timeout(RENDER_INTERVAL) {
            Ok(line) => match parse_line(&line) {
                Ok(Input::Quit) => break,
                Ok(Input::Request(request)) => {
                    if let Err(err) = handle.submit(request) {
                        error!("{err}");
                        break;
                    }
                }
                Ok(Input::Status) => {
                    for line in status_lines(&mirror) {
                        println!("{line}");
                    }
                }
                Ok(Input::Ports) => print_ports(),
                Ok(Input::Help) => println!("{HELP}"),
                Err(InputError::Empty) => {}
                Err(err) => println!("{err}"),
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        for event in event_rx.try_iter() {
            report(&event);
            mirror.apply(&event);
        }
    }

    handle.stop();
    for event in event_rx.try_iter() {
        mirror.apply(&event);
    }
    config.remember_outputs(&mirror);
    config.save(path)?;
    info!("saved settings to {path}");
    Ok(())
}

/// Read stdin on its own thread so the event loop never blocks on the terminal.
fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn report(event: &ModelEvent) {
    match event {
        ModelEvent::Connection(state) => println!("link {state}"),
        ModelEvent::Poll(state) => println!("polling {state}"),
        ModelEvent::CommandFailed { command, error } => println!("{command}: {error}"),
        ModelEvent::RawReply { command, reply } if !reply.is_empty() => {
            println!("{command} -> {reply}")
        }
        _ => {}
    }
}

fn print_ports() {
    match instrument_link::list_ports() {
        Ok(ports) if ports.is_empty() => println!("no serial ports found"),
        Ok(ports) => {
            for port in ports {
                println!("{port}");
            }
        }
        Err(err) => println!("could not list serial ports: {err}"),
    }
}
