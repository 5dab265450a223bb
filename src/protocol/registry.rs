//! Command name to handler lookup.
//!
//! Handlers are registered once at startup and then shared read-only by every connection
//! thread, so they must be `Send + Sync`. A handler that needs host state it shares with
//! other handlers is responsible for locking it itself.
use std::{
    any::Any,
    collections::HashMap,
    fmt, io,
    panic::{self, AssertUnwindSafe},
};

use log::{debug, warn};
use thiserror::Error;

use super::{CommandEnvelope, Parameters, Response};

/// Failure reported by a command handler. Its message is sent to the client verbatim.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<io::Error> for HandlerError {
    fn from(value: io::Error) -> Self {
        Self::new(value.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(value: serde_json::Error) -> Self {
        Self::new(format!("invalid parameters: {value}"))
    }
}

pub type CommandResult = Result<Parameters, HandlerError>;

/// Implementation of a single command.
pub trait Handler: Send + Sync {
    fn handle(&self, parameters: &Parameters) -> CommandResult;
}

impl<F> Handler for F
where
    F: Fn(&Parameters) -> CommandResult + Send + Sync,
{
    fn handle(&self, parameters: &Parameters) -> CommandResult {
        self(parameters)
    }
}

#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handler` under `name`, replacing any earlier registration.
    pub fn register<H>(&mut self, name: impl Into<String>, handler: H) -> &mut Self
    where
        H: Handler + 'static,
    {
        let name = name.into();
        if self.handlers.insert(name.clone(), Box::new(handler)).is_some() {
            warn!("replaced handler for command '{name}'");
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Runs the handler named by the envelope and wraps its outcome.
    ///
    /// Always produces a response: unknown names, handler errors and handler panics all
    /// become error envelopes.
    pub fn dispatch(&self, envelope: &CommandEnvelope) -> Response {
        let Some(handler) = self.handlers.get(&envelope.kind) else {
            warn!("unknown command type '{}'", envelope.kind);
            return Response::error(format!("Unknown command type: {}", envelope.kind));
        };

        debug!("dispatching '{}'", envelope.kind);
        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&envelope.parameters))) {
            Ok(Ok(result)) => Response::success(result),
            Ok(Err(e)) => {
                warn!("command '{}' failed: {e}", envelope.kind);
                Response::error(e.message)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!("command '{}' panicked: {message}", envelope.kind);
                Response::error(message)
            }
        }
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "command handler panicked".to_string()
    }
}
