//! Host/bridge communication protocol.
//!
//! This module defines the wire format spoken between an automation process (the
//! bridge) and the long-lived host application, together with the host-side server that
//! answers it.
//!
//! # Wire Format
//!
//! Each exchange is one request followed by one response over a plain TCP stream:
//!
//! - Requests are a JSON command envelope `{"type": "...", "parameters": {...}}`, or the
//!   literal bytes `ping`.
//! - Responses are `{"status": "success", "result": {...}}` or
//!   `{"status": "error", "error": "..."}`.
//!
//! There is no length prefix and no delimiter. A message ends when the bytes received so
//! far parse as a single JSON document (see [`framer`]). That is only sound because a
//! connection carries at most one request at a time; the server answers each request
//! before reading the next and the bridge never pipelines.
//!
//! # Key Components
//!
//! - [`Request`] / [`Response`]: the two envelopes.
//! - [`framer::feed`]: message boundary detection.
//! - [`ProtocolTransport`]: framed reads and writes over a stream with deadlines.
//! - [`CommandRegistry`]: command name to handler lookup and dispatch.
//! - [`CommandServer`]: the host-side accept loop and per-connection handlers.
//!
//! # See Also
//!
//! - [`client`](crate::client): the bridge side of the connection.
mod connections;
pub mod framer;
mod registry;
mod request;
mod response;
mod server;
mod transport;

pub use framer::{Frame, FrameError};
pub use registry::{CommandRegistry, CommandResult, Handler, HandlerError};
pub use request::{CommandEnvelope, PING, Parameters, Request};
pub use response::{PONG, Response};
pub use server::{CommandServer, ServerError};
pub use transport::{Deadline, ProtocolTransport, Stream, TransportError};
