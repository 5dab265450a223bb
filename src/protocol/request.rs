use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::framer::{FrameError, Message};

/// Loosely typed key/value map carried by requests and successful responses.
pub type Parameters = Map<String, Value>;

/// Name of the liveness command.
pub const PING: &str = "ping";

/// `{"type": ..., "parameters": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, alias = "params")]
    pub parameters: Parameters,
}

impl CommandEnvelope {
    pub fn new(kind: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            kind: kind.into(),
            parameters,
        }
    }
}

/// A request as it travels from the bridge to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// The literal `ping`, also produced by an envelope whose type is `ping`.
    Ping,
    Command(CommandEnvelope),
}

impl Request {
    pub fn command(kind: impl Into<String>, parameters: Parameters) -> Self {
        let kind = kind.into();
        if kind == PING {
            Request::Ping
        } else {
            Request::Command(CommandEnvelope::new(kind, parameters))
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Request::Ping => PING,
            Request::Command(envelope) => &envelope.kind,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Request::Ping => Ok(PING.as_bytes().to_vec()),
            Request::Command(envelope) => serde_json::to_vec(envelope),
        }
    }
}

impl Message for Request {
    const FAST_PATH: &'static [u8] = PING.as_bytes();

    fn fast_path() -> Self {
        Request::Ping
    }

    fn from_document(document: Value) -> Result<Self, FrameError> {
        let envelope: CommandEnvelope =
            serde_json::from_value(document).map_err(FrameError::Envelope)?;
        Ok(Request::command(envelope.kind, envelope.parameters))
    }
}
