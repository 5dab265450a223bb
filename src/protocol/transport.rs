use std::{
    io::{self, ErrorKind, Read, Write},
    net::TcpStream,
    time::{Duration, Instant},
};

use log::trace;
use thiserror::Error;

use super::{
    Request, Response,
    framer::{self, Frame, FrameError, Message},
};

const CHUNK_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{0}")]
    Frame(#[from] FrameError),
    #[error("timed out waiting for a complete message")]
    Timeout,
    #[error("connection closed by peer")]
    PeerClosed,
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

/// A byte stream whose blocking reads and writes can be bounded.
pub trait Stream: Read + Write {
    /// Bound the next read; `None` blocks until data or close.
    fn set_read_deadline(&mut self, remaining: Option<Duration>) -> io::Result<()>;

    /// Bound the next write; `None` blocks until the peer drains enough to accept it.
    fn set_write_deadline(&mut self, remaining: Option<Duration>) -> io::Result<()>;
}

impl Stream for TcpStream {
    fn set_read_deadline(&mut self, remaining: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(remaining)
    }

    fn set_write_deadline(&mut self, remaining: Option<Duration>) -> io::Result<()> {
        self.set_write_timeout(remaining)
    }
}

/// How long a read may wait for the rest of a message, or a write may take.
///
/// Writes start at once, so for them `OnceStarted` simply allows that long for the whole
/// message.
#[derive(Debug, Clone, Copy)]
pub enum Deadline {
    /// The whole message must arrive before this instant.
    At(Instant),
    /// Wait forever for the first byte, then allow this long for the rest.
    OnceStarted(Duration),
}

impl Deadline {
    fn write_until(self) -> Instant {
        match self {
            Deadline::At(at) => at,
            Deadline::OnceStarted(limit) => Instant::now() + limit,
        }
    }
}

fn remaining_until(until: Instant) -> Result<Duration, TransportError> {
    until
        .checked_duration_since(Instant::now())
        .filter(|d| !d.is_zero())
        .ok_or(TransportError::Timeout)
}

/// Framed envelope exchange over a byte stream.
pub struct ProtocolTransport<T: Stream> {
    stream: T,
    buffer: Vec<u8>,
}

impl<T: Stream> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn write_request(
        &mut self,
        request: &Request,
        deadline: Deadline,
    ) -> Result<(), TransportError> {
        let bytes = request.to_bytes()?;
        self.write_bytes(&bytes, deadline)
    }

    pub fn write_response(
        &mut self,
        response: &Response,
        deadline: Deadline,
    ) -> Result<(), TransportError> {
        let bytes = response.to_bytes()?;
        self.write_bytes(&bytes, deadline)
    }

    pub fn read_request(&mut self, deadline: Deadline) -> Result<Request, TransportError> {
        self.read_message(deadline)
    }

    pub fn read_response(&mut self, deadline: Deadline) -> Result<Response, TransportError> {
        self.read_message(deadline)
    }

    /// Write the whole message before the deadline. The socket timeout only bounds a
    /// single write call, so it is narrowed to what is left before each one.
    fn write_bytes(&mut self, bytes: &[u8], deadline: Deadline) -> Result<(), TransportError> {
        trace!("writing {} bytes", bytes.len());
        let until = deadline.write_until();
        let mut written = 0;

        while written < bytes.len() {
            self.stream.set_write_deadline(Some(remaining_until(until)?))?;
            match self.stream.write(&bytes[written..]) {
                Ok(0) => return Err(TransportError::PeerClosed),
                Ok(n) => written += n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(TransportError::Timeout);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.stream.flush()?;
        Ok(())
    }

    /// Read until the framer reports a complete message. The buffer is emptied on
    /// completion and on malformed input so the next message starts clean.
    fn read_message<M: Message>(&mut self, deadline: Deadline) -> Result<M, TransportError> {
        let mut chunk = [0u8; CHUNK_SIZE];
        let mut started: Option<Instant> = None;

        loop {
            if !self.buffer.is_empty() {
                match framer::feed::<M>(&self.buffer) {
                    Ok(Frame::Complete(message)) => {
                        self.buffer.clear();
                        return Ok(message);
                    }
                    Ok(Frame::Incomplete) => {
                        trace!("waiting for more data ({} bytes buffered)", self.buffer.len());
                    }
                    Err(e) => {
                        self.buffer.clear();
                        return Err(e.into());
                    }
                }
            }

            let remaining = match deadline {
                Deadline::At(at) => Some(remaining_until(at)?),
                Deadline::OnceStarted(limit) if !self.buffer.is_empty() => {
                    let since = *started.get_or_insert_with(Instant::now);
                    Some(
                        limit
                            .checked_sub(since.elapsed())
                            .filter(|d| !d.is_zero())
                            .ok_or(TransportError::Timeout)?,
                    )
                }
                Deadline::OnceStarted(_) => None,
            };
            self.stream.set_read_deadline(remaining)?;

            let n = match self.stream.read(&mut chunk) {
                Ok(0) => return Err(TransportError::PeerClosed),
                Ok(n) => n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(TransportError::Timeout);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}
