// Output format selection for the CLI.
//
// TTY gives human-readable text, a pipe or redirect gives JSON, and
// `--json` forces JSON.

use std::io::{self, IsTerminal, Write};

use serde::Serialize;

use crate::client::is_daemon_unavailable;
use crate::exit_code::RpcFailure;

const ANSI_RED: &str = "\x1b[31m";
const ANSI_YELLOW: &str = "\x1b[33m";
const ANSI_RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

impl OutputFormat {
    /// JSON if `--json` was passed or stdout is not a TTY.
    pub fn detect(json_flag: bool) -> Self {
        if json_flag {
            return Self::Json;
        }
        Self::detect_from_terminal(io::stdout().is_terminal())
    }

    pub fn detect_from_terminal(is_tty: bool) -> Self {
        if is_tty {
            Self::Human
        } else {
            Self::Json
        }
    }
}

pub fn print_output<T, F>(format: OutputFormat, value: &T, human_fn: F) -> io::Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    write_output(&mut io::stdout().lock(), format, value, human_fn)
}

pub fn write_output<W, T, F>(
    writer: &mut W,
    format: OutputFormat,
    value: &T,
    human_fn: F,
) -> io::Result<()>
where
    W: Write,
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    match format {
        OutputFormat::Human => writeln!(writer, "{}", human_fn(value)),
        OutputFormat::Json => {
            serde_json::to_writer(&mut *writer, value).map_err(io::Error::other)?;
            writeln!(writer)
        }
    }
}

pub fn print_error(format: OutputFormat, code: &str, message: &str) {
    print_diagnostic(format, "error", ANSI_RED, code, message);
}

pub fn print_warning(format: OutputFormat, code: &str, message: &str) {
    print_diagnostic(format, "warning", ANSI_YELLOW, code, message);
}

fn print_diagnostic(format: OutputFormat, label: &str, color: &str, code: &str, message: &str) {
    let mut err = io::stderr().lock();
    let _ = match format {
        OutputFormat::Human => {
            let line = render_human_stderr_line(label, message, io::stderr().is_terminal(), color);
            writeln!(err, "{line}")
        }
        OutputFormat::Json => {
            let mut obj = serde_json::Map::new();
            obj.insert(label.to_string(), serde_json::json!({ "code": code, "message": message }));
            writeln!(err, "{}", serde_json::Value::Object(obj))
        }
    };
}

/// Prints a command failure with a stable code and an actionable hint.
pub fn print_anyhow_error(format: OutputFormat, error: &anyhow::Error) {
    let (code, message) = actionable_error(error);
    print_error(format, &code, &message);
}

fn actionable_error(error: &anyhow::Error) -> (String, String) {
    if is_daemon_unavailable(error) {
        return (
            "DAEMON_NOT_RUNNING".to_string(),
            "Daemon is not running. Start it with: emendared".to_string(),
        );
    }

    if let Some(failure) = error.chain().find_map(|cause| cause.downcast_ref::<RpcFailure>()) {
        let hint = match failure.code.as_str() {
            "NOT_ELIGIBLE" => Some("Only followers may vote. Run: emendare follow <document>"),
            "STALE_VERSION" => Some("Pick a base version the document already has."),
            "ALREADY_VOTED" => Some("Vote the other way or retract instead."),
            _ => None,
        };
        let message = match hint {
            Some(hint) => format!("{}. {hint}", failure.message),
            None => failure.message.clone(),
        };
        return (failure.code.clone(), message);
    }

    let message = format!("{error:#}");
    if message.to_ascii_lowercase().contains("timed out") {
        return (
            "NETWORK_TIMEOUT".to_string(),
            "Could not reach the daemon in time. Check that emendared is running.".to_string(),
        );
    }

    ("CLI_ERROR".to_string(), message)
}

fn render_human_stderr_line(label: &str, message: &str, is_tty: bool, color: &str) -> String {
    if is_tty {
        format!("{color}{label}:{ANSI_RESET} {message}")
    } else {
        format!("{label}: {message}")
    }
}
