//! CLI utilities for the bridge.
//!
//! The utilities present in this module back the interactive mode of `tether_cli`: each
//! line is either `.exit` or a command name optionally followed by a JSON object of
//! parameters, e.g. `read_console {"filter": "errors", "last_lines": 5}`.
use std::io::{self, BufRead, Write};

use serde_json::Value;
use thiserror::Error;

use crate::protocol::Parameters;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("unrecognized command '{0}'")]
    Unrecognized(String),
    #[error("parameters must be a JSON object, got '{0}'")]
    NotAnObject(String),
    #[error("invalid parameters: {0}")]
    Parameters(#[from] serde_json::Error),
    #[error("no command provided")]
    Empty,
    #[error("prompt IO Error: {0}")]
    Io(#[from] io::Error),
}

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Exit command `.exit`, also produced at end of input
    Exit,
    /// A command envelope to send to the host
    Send { kind: String, parameters: Parameters },
}

impl TryFrom<&str> for Command {
    type Error = PromptError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let line = value.trim();
        match line {
            "" => Err(PromptError::Empty),
            ".exit" => Ok(Command::Exit),
            s if s.starts_with('.') => Err(PromptError::Unrecognized(s.to_string())),
            s => {
                let (kind, rest) = s.split_once(char::is_whitespace).unwrap_or((s, ""));
                Ok(Command::Send {
                    kind: kind.to_string(),
                    parameters: parse_parameters(rest)?,
                })
            }
        }
    }
}

/// Parse an optional JSON object; blank input means no parameters.
pub fn parse_parameters(input: &str) -> Result<Parameters, PromptError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(Parameters::new());
    }
    match serde_json::from_str::<Value>(input)? {
        Value::Object(map) => Ok(map),
        _ => Err(PromptError::NotAnObject(input.to_string())),
    }
}

/// Prompt user for a bridge command.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, PromptError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(Command::Exit);
    }
    s.as_str().try_into()
}
