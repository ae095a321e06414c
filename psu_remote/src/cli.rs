//! Line-based front-end commands.

use thiserror::Error;

use crate::{model::SupplyModel, poller::Request};

/// Help text listing all commands.
pub const HELP: &str = "\
commands:
  vset <ch> <volts>   program output voltage
  iset <ch> <amps>    program output current limit
  on <ch>             switch output on
  off <ch>            switch output off
  raw <command>       send a command, queries end with '?'
  reconnect           reopen the link after errors
  ports               list serial ports
  status              show all outputs
  help                show this text
  quit                leave, saving the programmed values";

/// A parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Forward to the poll thread.
    Request(Request),
    /// List serial ports.
    Ports,
    /// Print the model.
    Status,
    /// Print [`HELP`].
    Help,
    /// Leave the program.
    Quit,
}

/// Problems with a typed line.
#[derive(Debug, Error, PartialEq)]
pub enum InputError {
    /// Nothing but whitespace.
    #[error("empty input")]
    Empty,
    /// The first word is not a command.
    #[error("unknown command '{0}', type 'help' for a list")]
    UnknownCommand(String),
    /// A required argument is missing.
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),
    /// An argument is not a number.
    #[error("not a number: '{0}'")]
    InvalidNumber(String),
}

/// Parse one typed line.
pub fn parse_line(line: &str) -> Result<Input, InputError> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let mut args = rest.split_whitespace();

    let input = match word.to_ascii_lowercase().as_str() {
        "" => return Err(InputError::Empty),
        "vset" => Input::Request(Request::SetVoltage {
            channel: channel_arg(args.next())?,
            volts: number_arg(args.next(), "volts")?,
        }),
        "iset" => Input::Request(Request::SetCurrentLimit {
            channel: channel_arg(args.next())?,
            amps: number_arg(args.next(), "amps")?,
        }),
        "on" | "off" => Input::Request(Request::SetOutputEnabled {
            channel: channel_arg(args.next())?,
            enabled: word.eq_ignore_ascii_case("on"),
        }),
        "raw" => {
            if rest.is_empty() {
                return Err(InputError::MissingArgument("command"));
            }
            Input::Request(Request::Raw(rest.to_string()))
        }
        "reconnect" => Input::Request(Request::Reconnect),
        "ports" => Input::Ports,
        "status" => Input::Status,
        "help" | "?" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => return Err(InputError::UnknownCommand(other.to_string())),
    };
    Ok(input)
}

fn channel_arg(arg: Option<&str>) -> Result<usize, InputError> {
    let arg = arg.ok_or(InputError::MissingArgument("channel"))?;
    arg.parse()
        .map_err(|_| InputError::InvalidNumber(arg.to_string()))
}

fn number_arg(arg: Option<&str>, name: &'static str) -> Result<f64, InputError> {
    let arg = arg.ok_or(InputError::MissingArgument(name))?;
    arg.parse()
        .map_err(|_| InputError::InvalidNumber(arg.to_string()))
}

/// Render the model as one header line and one line per output.
pub fn status_lines(model: &SupplyModel) -> Vec<String> {
    let mut lines = vec![format!(
        "link {}, polling {}, failures {} in a row / {} total",
        model.connection, model.poll, model.consecutive_failures, model.total_failures
    )];
    for ch in model.channels() {
        let measured = |value: Option<f64>, unit: &str| match value {
            Some(v) => format!("{v:.4} {unit}"),
            None => "---".to_string(),
        };
        lines.push(format!(
            "output {}: {:>3}  {} / {}  (set {:.4} V, {:.4} A)",
            ch.index,
            if ch.output_enabled { "on" } else { "off" },
            measured(ch.measured_voltage, "V"),
            measured(ch.measured_current, "A"),
            ch.set_voltage,
            ch.set_current_limit,
        ));
    }
    lines
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use super::*;
    use crate::model::{ModelEvent, Quantity, Reading};

    #[rstest]
    #[case("vset 1 1.8", Request::SetVoltage { channel: 1, volts: 1.8 })]
    #[case("  ISET 4 0.25 ", Request::SetCurrentLimit { channel: 4, amps: 0.25 })]
    #[case("on 2", Request::SetOutputEnabled { channel: 2, enabled: true })]
    #[case("off 3", Request::SetOutputEnabled { channel: 3, enabled: false })]
    #[case("raw VOUT? 1", Request::Raw("VOUT? 1".to_string()))]
    #[case("reconnect", Request::Reconnect)]
    fn test_parse_requests(#[case] line: &str, #[case] expected: Request) {
        assert_eq!(parse_line(line), Ok(Input::Request(expected)));
    }

    #[rstest]
    #[case("status", Input::Status)]
    #[case("ports", Input::Ports)]
    #[case("help", Input::Help)]
    #[case("quit", Input::Quit)]
    fn test_parse_local_commands(#[case] line: &str, #[case] expected: Input) {
        assert_eq!(parse_line(line), Ok(expected));
    }

    #[rstest]
    #[case("", InputError::Empty)]
    #[case("volts 1 2", InputError::UnknownCommand("volts".to_string()))]
    #[case("vset", InputError::MissingArgument("channel"))]
    #[case("vset 1", InputError::MissingArgument("volts"))]
    #[case("vset one 1.0", InputError::InvalidNumber("one".to_string()))]
    #[case("iset 1 lots", InputError::InvalidNumber("lots".to_string()))]
    #[case("raw", InputError::MissingArgument("command"))]
    fn test_parse_errors(#[case] line: &str, #[case] expected: InputError) {
        assert_eq!(parse_line(line), Err(expected));
    }

    #[test]
    fn test_status_lines() {
        let mut model = SupplyModel::new(2, 10);
        model.apply(&ModelEvent::Measured {
            channel: 1,
            quantity: Quantity::Voltage,
            reading: Reading::now(5.0012),
        });
        let lines = status_lines(&model);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("link disconnected, polling idle"));
        assert!(lines[1].contains("5.0012 V / ---"));
        assert!(lines[2].contains("--- / ---"));
    }
}
