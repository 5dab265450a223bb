//! Bridge client: the automation side of the connection.
//!
//! [`BridgeClient`] owns a single connection to the host's command server and exposes a
//! blocking [`send_command`](BridgeClient::send_command). Calls made from several threads
//! are queued on an internal lock, so at most one request is ever in flight on the
//! connection.
//!
//! # Connection State
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected
//!                               |  ^               |
//!                      attempt  +--+   I/O error,  |
//!                      failed  (bounded) timeout,  |
//!                               |      disconnect  |
//!                               v                  v
//!                          Disconnected <----------+
//! ```
//!
//! Any I/O failure or timeout while connected drops the socket before the error reaches
//! the caller, so the next call starts from a fresh connection.
use std::{
    io,
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    config::BridgeConfig,
    protocol::{Deadline, PING, Parameters, ProtocolTransport, Request, Response, TransportError},
};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("could not connect to host at {address} after {attempts} attempts: {source}")]
    ConnectFailed {
        address: SocketAddr,
        attempts: u32,
        source: io::Error,
    },
    #[error("'{command}' timed out after {after:?}")]
    Timeout { command: String, after: Duration },
    #[error("connection closed by host")]
    PeerClosed,
    #[error("Bridge IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid response from host: {0}")]
    InvalidResponse(String),
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("ping was not answered with pong")]
    PingFailed,
    #[error("host rejected '{command}': {message}")]
    Command { command: String, message: String },
}

impl BridgeError {
    /// True when the host could not be reached or the connection broke, as opposed to
    /// the host answering with an error.
    pub fn is_unreachable(&self) -> bool {
        !matches!(self, BridgeError::Command { .. })
    }

    fn from_transport(error: TransportError, command: &str, after: Duration) -> Self {
        match error {
            TransportError::Timeout => BridgeError::Timeout {
                command: command.to_string(),
                after,
            },
            TransportError::PeerClosed => BridgeError::PeerClosed,
            TransportError::Io(e) => BridgeError::Io(e),
            TransportError::Encode(e) => BridgeError::Encode(e),
            TransportError::Frame(e) => BridgeError::InvalidResponse(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

enum Session {
    Disconnected,
    Connected(ProtocolTransport<TcpStream>),
}

/// Connection status plus a handle on the live socket that can be shut down without
/// waiting for the exchange in progress.
struct Link {
    state: ConnectionState,
    socket: Option<TcpStream>,
}

pub struct BridgeClient {
    config: BridgeConfig,
    session: Mutex<Session>,
    link: Mutex<Link>,
}

impl BridgeClient {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            session: Mutex::new(Session::Disconnected),
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                socket: None,
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.link().state
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make sure a live connection exists.
    ///
    /// An existing connection is reused only if it still answers a ping. Otherwise a new
    /// one is opened, trying up to `connect_attempts` times.
    pub fn connect(&self) -> Result<(), BridgeError> {
        let mut session = self.session();
        if let Session::Connected(transport) = &mut *session {
            let probe = exchange(transport, &Request::Ping, self.config.ping_timeout)
                .and_then(check_pong);
            match probe {
                Ok(_) => return Ok(()),
                Err(e) => {
                    info!("existing connection is no longer usable: {e}");
                    self.reset(&mut session);
                }
            }
        }
        self.open(&mut session)
    }

    /// Send one command and wait for its result.
    ///
    /// Connects first when needed. A `status: "error"` reply is returned as
    /// [`BridgeError::Command`] and leaves the connection open; every other failure
    /// closes it.
    pub fn send_command(
        &self,
        command: &str,
        parameters: Parameters,
    ) -> Result<Parameters, BridgeError> {
        let request = Request::command(command, parameters);
        let timeout = match request {
            Request::Ping => self.config.ping_timeout,
            Request::Command(_) => self.config.command_timeout,
        };

        let mut session = self.session();
        if matches!(*session, Session::Disconnected) {
            self.open(&mut session)?;
        }
        let Session::Connected(transport) = &mut *session else {
            return Err(BridgeError::PeerClosed);
        };

        let response = match exchange(transport, &request, timeout) {
            Ok(response) => response,
            Err(e) => {
                warn!("'{command}' failed: {e}");
                self.reset(&mut session);
                return Err(e);
            }
        };

        match request {
            Request::Ping => check_pong(response).inspect_err(|_| self.reset(&mut session)),
            Request::Command(_) => match response {
                Response::Success { result } => Ok(result),
                Response::Error { error } => {
                    let message = if error.is_empty() {
                        "unknown host error".to_string()
                    } else {
                        error
                    };
                    warn!("host rejected '{command}': {message}");
                    Err(BridgeError::Command {
                        command: command.to_string(),
                        message,
                    })
                }
            },
        }
    }

    /// Liveness probe with the short ping timeout.
    pub fn ping(&self) -> Result<(), BridgeError> {
        self.send_command(PING, Parameters::new()).map(|_| ())
    }

    pub fn is_host_running(&self) -> bool {
        match self.ping() {
            Ok(()) => true,
            Err(e) => {
                debug!("host is not reachable: {e}");
                false
            }
        }
    }

    /// Close the connection. Interrupts an exchange blocked on another thread.
    pub fn disconnect(&self) {
        if let Some(socket) = self.link().socket.take() {
            shutdown(&socket);
        }
        let mut session = self.session();
        self.reset(&mut session);
        info!("disconnected from host");
    }

    /// Open a fresh connection, retrying up to `connect_attempts` times.
    fn open(&self, session: &mut Session) -> Result<(), BridgeError> {
        let address = self.config.address;
        let attempts = self.config.connect_attempts.max(1);
        self.link().state = ConnectionState::Connecting;

        let mut last_error = None;
        for attempt in 1..=attempts {
            info!("connecting to host at {address} (attempt {attempt}/{attempts})");
            match open_stream(address, self.config.connect_timeout) {
                Ok((stream, interrupt)) => {
                    *session = Session::Connected(ProtocolTransport::new(stream));
                    let mut link = self.link();
                    link.state = ConnectionState::Connected;
                    link.socket = Some(interrupt);
                    info!("connected to host at {address}");
                    return Ok(());
                }
                Err(e) => {
                    warn!("connection attempt {attempt}/{attempts} failed: {e}");
                    last_error = Some(e);
                    if attempt < attempts {
                        thread::sleep(self.config.retry_delay);
                    }
                }
            }
        }

        self.link().state = ConnectionState::Disconnected;
        Err(BridgeError::ConnectFailed {
            address,
            attempts,
            source: last_error.unwrap_or_else(|| io::Error::other("no attempt was made")),
        })
    }

    fn reset(&self, session: &mut Session) {
        *session = Session::Disconnected;
        let mut link = self.link();
        if let Some(socket) = link.socket.take() {
            shutdown(&socket);
        }
        link.state = ConnectionState::Disconnected;
    }
}

impl Default for BridgeClient {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}

/// Connect and return the stream plus a clone used to interrupt it.
fn open_stream(address: SocketAddr, timeout: Duration) -> io::Result<(TcpStream, TcpStream)> {
    let stream = TcpStream::connect_timeout(&address, timeout)?;
    stream.set_nodelay(true)?;
    let interrupt = stream.try_clone()?;
    Ok((stream, interrupt))
}

fn shutdown(socket: &TcpStream) {
    if let Err(e) = socket.shutdown(Shutdown::Both) {
        debug!("socket already closed: {e}");
    }
}

fn exchange(
    transport: &mut ProtocolTransport<TcpStream>,
    request: &Request,
    timeout: Duration,
) -> Result<Response, BridgeError> {
    let command = request.kind();
    let deadline = Deadline::At(Instant::now() + timeout);
    debug!("sending '{command}'");

    transport
        .write_request(request, deadline)
        .map_err(|e| BridgeError::from_transport(e, command, timeout))?;
    transport
        .read_response(deadline)
        .map_err(|e| BridgeError::from_transport(e, command, timeout))
}

fn check_pong(response: Response) -> Result<Parameters, BridgeError> {
    if !response.is_pong() {
        return Err(BridgeError::PingFailed);
    }
    match response {
        Response::Success { result } => Ok(result),
        Response::Error { .. } => Err(BridgeError::PingFailed),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener,
        sync::{Arc, mpsc},
    };

    use serde_json::{Value, json};

    use crate::{
        commands,
        config::{ConsoleConfig, ServerConfig},
        protocol::{CommandResult, CommandServer, HandlerError},
    };

    use super::*;

    fn params(value: Value) -> Parameters {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn host() -> (CommandServer, SocketAddr) {
        let mut registry = commands::builtin_registry(ConsoleConfig::default());
        registry
            .register("fail", |_: &Parameters| -> CommandResult {
                Err(HandlerError::new("nothing selected"))
            })
            .register("slow", |p: &Parameters| -> CommandResult {
                thread::sleep(Duration::from_millis(20));
                Ok(p.clone())
            });
        let server = CommandServer::new(ServerConfig::default(), registry);
        let address = server.start(0).unwrap();
        (server, address)
    }

    fn client(address: SocketAddr) -> BridgeClient {
        BridgeClient::new(BridgeConfig {
            retry_delay: Duration::from_millis(20),
            ..BridgeConfig::new(address)
        })
    }

    /// An address nothing is listening on.
    fn closed_address() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[test]
    fn focus_window_succeeds() {
        let (_server, address) = host();
        let client = client(address);

        let result = client.send_command("focus_window", Parameters::new()).unwrap();

        assert_eq!(result, params(json!({"message": "Host window focused"})));
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[test]
    fn read_console_without_logs_is_success() {
        let (_server, address) = host();
        let client = client(address);

        let result = client
            .send_command(
                "read_console",
                params(json!({"filter": "errors", "last_lines": 5})),
            )
            .unwrap();

        let content = result["content"].as_str().unwrap();
        assert!(content.starts_with("No log file found"));
    }

    #[test]
    fn ping_returns_pong_before_command_timeout() {
        let (_server, address) = host();
        let client = client(address);

        let started = Instant::now();
        let result = client.send_command(PING, Parameters::new()).unwrap();

        assert_eq!(result, params(json!({"message": "pong"})));
        assert!(started.elapsed() < client.config().command_timeout);
        assert!(client.is_host_running());
    }

    #[test]
    fn unknown_command_is_reported_and_connection_kept() {
        let (_server, address) = host();
        let client = client(address);

        let err = client
            .send_command("not-a-real-command", Parameters::new())
            .unwrap_err();

        assert!(!err.is_unreachable());
        assert!(err.to_string().contains("not-a-real-command"));
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[test]
    fn handler_error_carries_message() {
        let (_server, address) = host();
        let client = client(address);

        match client.send_command("fail", Parameters::new()) {
            Err(BridgeError::Command { command, message }) => {
                assert_eq!(command, "fail");
                assert_eq!(message, "nothing selected");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        client.ping().unwrap();
    }

    #[test]
    fn connect_retries_configured_attempts() {
        let delay = Duration::from_millis(300);
        let client = BridgeClient::new(BridgeConfig {
            connect_attempts: 3,
            retry_delay: delay,
            ..BridgeConfig::new(closed_address())
        });

        let started = Instant::now();
        let err = client.connect().unwrap_err();
        let elapsed = started.elapsed();

        match &err {
            BridgeError::ConnectFailed { attempts, .. } => assert_eq!(*attempts, 3),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains("after 3 attempts"));
        assert!(err.is_unreachable());
        // Two delays sit between three attempts; a fourth attempt would add a third.
        assert!(elapsed >= delay * 2, "gave up after {elapsed:?}");
        assert!(elapsed < delay * 3, "kept retrying for {elapsed:?}");
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn single_attempt_does_not_wait() {
        let client = BridgeClient::new(BridgeConfig {
            connect_attempts: 1,
            retry_delay: Duration::from_secs(5),
            ..BridgeConfig::new(closed_address())
        });

        let started = Instant::now();
        let err = client.connect().unwrap_err();

        assert!(err.to_string().contains("after 1 attempts"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn reconnects_after_host_restart() {
        let (server, address) = host();
        let client = client(address);
        client.ping().unwrap();

        server.restart().unwrap();
        client.connect().unwrap();

        let result = client
            .send_command("echo", params(json!({"after": "restart"})))
            .unwrap();
        assert_eq!(result, params(json!({"after": "restart"})));
    }

    #[test]
    fn timeout_tears_down_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let silent = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 256];
            // Read the request and never answer.
            let _ = stream.read(&mut buf);
            let _ = stream.read(&mut buf);
        });

        let client = BridgeClient::new(BridgeConfig {
            command_timeout: Duration::from_millis(200),
            ..BridgeConfig::new(address)
        });

        let err = client.send_command("echo", Parameters::new()).unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        silent.join().unwrap();
    }

    #[test]
    fn garbage_response_is_a_connection_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let liar = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 256];
            let _ = stream.read(&mut buf);
            stream.write_all(b"<html>").unwrap();
        });

        let client = client(address);
        let err = client.send_command("echo", Parameters::new()).unwrap_err();

        assert!(matches!(err, BridgeError::InvalidResponse(_)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        liar.join().unwrap();
    }

    #[test]
    fn connect_reuses_live_connection() {
        let (server, address) = host();
        let client = client(address);

        client.connect().unwrap();
        client.connect().unwrap();
        client.send_command("echo", Parameters::new()).unwrap();

        assert_eq!(server.connection_count(), 1);
    }

    #[test]
    fn disconnect_resets_state() {
        let (_server, address) = host();
        let client = client(address);
        client.connect().unwrap();

        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);

        client.ping().unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[test]
    fn disconnect_interrupts_blocked_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let silent = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 256];
            while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
        });

        let client = Arc::new(client(address));
        let caller = {
            let client = Arc::clone(&client);
            thread::spawn(move || client.send_command("echo", Parameters::new()))
        };
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        client.disconnect();
        let outcome = caller.join().unwrap();

        assert!(outcome.unwrap_err().is_unreachable());
        assert!(started.elapsed() < Duration::from_secs(5));
        silent.join().unwrap();
    }

    #[test]
    fn concurrent_callers_are_serialized() {
        let (_server, address) = host();
        let client = Arc::new(client(address));

        let callers: Vec<_> = (0..4)
            .map(|n| {
                let client = Arc::clone(&client);
                thread::spawn(move || {
                    for round in 0..5 {
                        let sent = params(json!({"caller": n, "round": round}));
                        let result = client.send_command("slow", sent.clone()).unwrap();
                        assert_eq!(result, sent);
                    }
                })
            })
            .collect();

        for caller in callers {
            caller.join().unwrap();
        }
    }

    #[test]
    fn stalled_request_write_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let (release, released) = mpsc::channel::<()>();
        let host = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            let _ = released.recv_timeout(Duration::from_secs(10));
        });

        let client = BridgeClient::new(BridgeConfig {
            command_timeout: Duration::from_millis(500),
            ..BridgeConfig::new(address)
        });
        let (outcome, finished) = mpsc::channel();
        thread::spawn(move || {
            let blob = params(json!({"blob": "x".repeat(32 * 1024 * 1024)}));
            let result = client.send_command("echo", blob);
            outcome.send((result, client.state())).unwrap();
        });

        let (result, state) = finished
            .recv_timeout(Duration::from_secs(5))
            .expect("send_command outlived its timeout");
        let _ = release.send(());
        host.join().unwrap();

        assert!(matches!(result, Err(BridgeError::Timeout { .. })));
        assert_eq!(state, ConnectionState::Disconnected);
    }
}
