use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    framer::{FrameError, Message},
    request::Parameters,
};

/// Exact bytes of the host's reply to a ping.
pub const PONG: &[u8] = br#"{"status":"success","result":{"message":"pong"}}"#;

/// Outcome of one exchange, tagged by `status`.
///
/// A success always carries `result` and an error always carries `error`, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Success {
        #[serde(default)]
        result: Parameters,
    },
    Error {
        #[serde(default, alias = "message")]
        error: String,
    },
}

impl Response {
    pub fn success(result: Parameters) -> Self {
        Response::Success { result }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            error: message.into(),
        }
    }

    pub fn pong() -> Self {
        let mut result = Parameters::new();
        result.insert("message".into(), Value::from("pong"));
        Response::Success { result }
    }

    pub fn is_pong(&self) -> bool {
        match self {
            Response::Success { result } => {
                result.get("message").and_then(Value::as_str) == Some("pong")
            }
            Response::Error { .. } => false,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success { .. })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl Message for Response {
    const FAST_PATH: &'static [u8] = PONG;

    fn fast_path() -> Self {
        Response::pong()
    }

    fn from_document(document: Value) -> Result<Self, FrameError> {
        serde_json::from_value(document).map_err(FrameError::Envelope)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn pong_serializes_to_fast_path_bytes() {
        assert_eq!(Response::pong().to_bytes().unwrap(), PONG);
    }

    #[test]
    fn error_envelope_has_no_result() {
        let bytes = Response::error("Unknown command type: nope").to_bytes().unwrap();

        assert_eq!(
            serde_json::from_slice::<Value>(&bytes).unwrap(),
            json!({"status": "error", "error": "Unknown command type: nope"})
        );
    }

    #[test]
    fn success_without_result_decodes_as_empty() {
        let response = Response::from_document(json!({"status": "success"})).unwrap();

        assert_eq!(response, Response::success(Parameters::new()));
    }

    #[test]
    fn error_accepts_message_alias() {
        let response =
            Response::from_document(json!({"status": "error", "message": "boom"})).unwrap();

        assert_eq!(response, Response::error("boom"));
    }

    #[test]
    #[should_panic(expected = "Envelope")]
    fn unknown_status_is_rejected() {
        Response::from_document(json!({"status": "maybe"})).unwrap();
    }
}
