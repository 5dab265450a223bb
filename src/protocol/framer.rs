//! Message boundary detection for the length-prefix-free wire format.
//!
//! Envelopes are sent as bare JSON documents with no delimiter, so a buffer is complete
//! exactly when it parses as one whole document. Bytes that end mid-document are
//! [`Frame::Incomplete`]; bytes that can never become a document are a
//! [`FrameError::Malformed`].
//!
//! This only works because at most one envelope is in flight per connection. Two
//! envelopes written back-to-back would show up as trailing bytes and be rejected, and a
//! sender that pauses after a syntactically complete prefix of a longer document would
//! have that prefix accepted. The bridge client serializes its calls to keep this true.
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed message: {0}")]
    Malformed(serde_json::Error),
    #[error("invalid envelope: {0}")]
    Envelope(serde_json::Error),
}

#[derive(Debug, PartialEq)]
pub enum Frame<M> {
    Complete(M),
    Incomplete,
}

/// A document that can be recovered from a framed buffer.
pub trait Message: Sized {
    /// Literal byte form recognised without parsing.
    const FAST_PATH: &'static [u8];

    fn fast_path() -> Self;

    fn from_document(document: Value) -> Result<Self, FrameError>;
}

/// Decide whether `buffer` holds one complete message.
///
/// The buffer is everything received since the previous message; a `Complete` result
/// consumes all of it.
pub fn feed<M: Message>(buffer: &[u8]) -> Result<Frame<M>, FrameError> {
    let trimmed = buffer.trim_ascii();
    if trimmed == M::FAST_PATH {
        return Ok(Frame::Complete(M::fast_path()));
    }
    if trimmed.is_empty() || M::FAST_PATH.starts_with(trimmed) {
        return Ok(Frame::Incomplete);
    }

    let mut deserializer = serde_json::Deserializer::from_slice(trimmed);
    let document = match Value::deserialize(&mut deserializer).and_then(|v| {
        deserializer.end()?;
        Ok(v)
    }) {
        Ok(document) => document,
        Err(e) if e.is_eof() => return Ok(Frame::Incomplete),
        Err(e) => return Err(FrameError::Malformed(e)),
    };

    M::from_document(document).map(Frame::Complete)
}
