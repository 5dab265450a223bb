//! Reference command handlers.
//!
//! Real hosts register their own handlers; these cover window focus, console log access
//! and an echo used for diagnostics. [`builtin_registry`] wires them into a
//! [`CommandRegistry`].
use std::{fmt, fs, io::ErrorKind, path::PathBuf};

use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    config::ConsoleConfig,
    protocol::{CommandRegistry, CommandResult, Handler, Parameters},
};

pub const FOCUS_WINDOW: &str = "focus_window";
pub const READ_CONSOLE: &str = "read_console";
pub const ECHO: &str = "echo";

const DEFAULT_LAST_LINES: usize = 50;

pub fn builtin_registry(console: ConsoleConfig) -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry
        .register(FOCUS_WINDOW, focus_window)
        .register(READ_CONSOLE, ReadConsole::new(console.log_paths))
        .register(ECHO, echo);
    registry
}

pub fn focus_window(_parameters: &Parameters) -> CommandResult {
    Ok(message("Host window focused"))
}

pub fn echo(parameters: &Parameters) -> CommandResult {
    Ok(parameters.clone())
}

fn message(text: &str) -> Parameters {
    let mut result = Parameters::new();
    result.insert("message".into(), Value::from(text));
    result
}

fn content(text: String) -> Parameters {
    let mut result = Parameters::new();
    result.insert("content".into(), Value::from(text));
    result
}

/// Which console lines `read_console` returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleFilter {
    #[default]
    All,
    Errors,
    Warnings,
    Logs,
}

impl ConsoleFilter {
    pub fn matches(&self, line: &str) -> bool {
        let line = line.to_lowercase();
        let is_error =
            line.contains("error") || line.contains("exception") || line.contains("failed");
        let is_warning = line.contains("warn");

        match self {
            ConsoleFilter::All => true,
            ConsoleFilter::Errors => is_error,
            ConsoleFilter::Warnings => is_warning,
            ConsoleFilter::Logs => !is_error && !is_warning && !line.trim().is_empty(),
        }
    }
}

impl fmt::Display for ConsoleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsoleFilter::All => "all",
            ConsoleFilter::Errors => "errors",
            ConsoleFilter::Warnings => "warnings",
            ConsoleFilter::Logs => "logs",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Deserialize)]
struct ReadConsoleParameters {
    #[serde(default)]
    filter: ConsoleFilter,
    #[serde(default = "default_last_lines")]
    last_lines: usize,
}

fn default_last_lines() -> usize {
    DEFAULT_LAST_LINES
}

/// Returns the tail of the first readable log file.
///
/// Finding nothing is a successful result whose `content` says so.
#[derive(Debug, Clone)]
pub struct ReadConsole {
    paths: Vec<PathBuf>,
}

impl ReadConsole {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

impl Handler for ReadConsole {
    fn handle(&self, parameters: &Parameters) -> CommandResult {
        let ReadConsoleParameters { filter, last_lines } =
            serde_json::from_value(Value::Object(parameters.clone()))?;

        for path in &self.paths {
            let text = match fs::read(path) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("no log at {}", path.display());
                    continue;
                }
                Err(e) => {
                    warn!("could not read log {}: {e}", path.display());
                    continue;
                }
            };

            let lines: Vec<&str> = text.lines().filter(|l| filter.matches(l)).collect();
            if lines.is_empty() {
                return Ok(content(format!(
                    "Found log at: {}\n\nNo {filter} entries",
                    path.display()
                )));
            }

            let tail = &lines[lines.len().saturating_sub(last_lines)..];
            return Ok(content(format!(
                "Found log at: {}\n\n{}",
                path.display(),
                tail.join("\n")
            )));
        }

        Ok(content(
            "No log file found in any of the configured locations".to_string(),
        ))
    }
}
