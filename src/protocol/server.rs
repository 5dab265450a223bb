use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::config::{DEFAULT_PORT, ServerConfig};

use super::{
    CommandRegistry, ProtocolTransport, Request, Response,
    connections::{ConnectionId, ConnectionRegistry},
    transport::{Deadline, TransportError},
};

const WAKE_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        source: io::Error,
    },
    #[error("Server IO Error: {0}")]
    Io(#[from] io::Error),
}

/// Resources owned by one run of the accept loop.
struct Listening {
    address: SocketAddr,
    stopping: Arc<AtomicBool>,
    connections: Arc<ConnectionRegistry>,
    accept: JoinHandle<()>,
    finished: mpsc::Receiver<()>,
}

#[derive(Default)]
struct State {
    listening: Option<Listening>,
    port: Option<u16>,
}

/// Shared pieces every connection handler needs.
#[derive(Clone)]
struct Context {
    registry: Arc<CommandRegistry>,
    connections: Arc<ConnectionRegistry>,
    stopping: Arc<AtomicBool>,
    request_timeout: Duration,
}

/// Host-side command server.
///
/// One thread accepts connections and one thread per connection reads requests,
/// dispatches them through the [`CommandRegistry`] and writes responses. Requests on a
/// connection are handled strictly in order; separate connections run concurrently.
pub struct CommandServer {
    config: ServerConfig,
    registry: Arc<CommandRegistry>,
    state: Mutex<State>,
}

impl CommandServer {
    pub fn new(config: ServerConfig, registry: CommandRegistry) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `port` and start accepting. A no-op returning the current address when the
    /// server is already running.
    pub fn start(&self, port: u16) -> Result<SocketAddr, ServerError> {
        let mut state = self.lock();
        if let Some(listening) = &state.listening {
            info!("server is already running at {}", listening.address);
            return Ok(listening.address);
        }

        let address = SocketAddr::new(self.config.host, port);
        let listener =
            TcpListener::bind(address).map_err(|source| ServerError::Bind { address, source })?;
        let address = listener.local_addr()?;

        let stopping = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(ConnectionRegistry::new());
        let context = Context {
            registry: Arc::clone(&self.registry),
            connections: Arc::clone(&connections),
            stopping: Arc::clone(&stopping),
            request_timeout: self.config.request_timeout,
        };

        let (done, finished) = mpsc::channel::<()>();
        let accept = thread::Builder::new()
            .name("tether-accept".into())
            .spawn(move || {
                accept_loop(listener, context);
                drop(done);
            })?;

        info!("listening at {address}");
        state.port = Some(address.port());
        state.listening = Some(Listening {
            address,
            stopping,
            connections,
            accept,
            finished,
        });
        Ok(address)
    }

    /// Close every connection and the listener. Returns whether the server was running.
    ///
    /// The listener belongs to the accept thread and is released when that thread wakes.
    /// If it has not woken within `stop_grace` the thread is left behind and the port stays
    /// bound until it does.
    pub fn stop(&self) -> bool {
        let Some(listening) = self.lock().listening.take() else {
            info!("server is not running");
            return false;
        };

        listening.stopping.store(true, Ordering::SeqCst);
        let closed = listening.connections.close_all();
        debug!("closed {closed} connections");

        wake(listening.address);
        match listening.finished.recv_timeout(self.config.stop_grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if listening.accept.join().is_err() {
                    warn!("accept loop panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "accept loop did not exit within {:?}; leaving it behind",
                    self.config.stop_grace
                );
            }
        }

        info!("server at {} stopped", listening.address);
        true
    }

    /// Stop, wait for the configured settle delay, and start again on the last port.
    pub fn restart(&self) -> Result<SocketAddr, ServerError> {
        let port = self.lock().port.unwrap_or(DEFAULT_PORT);
        self.stop();
        thread::sleep(self.config.restart_delay);
        self.start(port)
    }

    pub fn is_running(&self) -> bool {
        self.lock().listening.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().listening.as_ref().map(|l| l.address)
    }

    /// Number of connections currently open.
    pub fn connection_count(&self) -> usize {
        self.lock()
            .listening
            .as_ref()
            .map_or(0, |l| l.connections.len())
    }
}

impl Drop for CommandServer {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

/// Unblock `accept` by connecting to ourselves.
fn wake(address: SocketAddr) {
    let target = match address.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), address.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), address.port())
        }
        _ => address,
    };
    if let Err(e) = TcpStream::connect_timeout(&target, WAKE_TIMEOUT) {
        debug!("wake connection to {target} failed: {e}");
    }
}

fn accept_loop(listener: TcpListener, context: Context) {
    for stream in listener.incoming() {
        if context.stopping.load(Ordering::SeqCst) {
            break;
        }

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                error!("failed to accept connection: {e}");
                continue;
            }
        };

        let id = match context.connections.register(&stream) {
            Ok(Some(id)) => id,
            Ok(None) => break,
            Err(e) => {
                warn!("could not track connection: {e}");
                continue;
            }
        };
        info!(
            "connection {id} accepted from {}",
            stream
                .peer_addr()
                .map_or_else(|_| "unknown peer".to_string(), |a| a.to_string())
        );

        let handler = context.clone();
        let spawned = thread::Builder::new()
            .name(format!("tether-conn-{id}"))
            .spawn(move || serve(id, stream, handler));
        if let Err(e) = spawned {
            error!("failed to spawn handler for connection {id}: {e}");
            context.connections.deregister(id);
        }
    }
    debug!("accept loop exited");
}

fn serve(id: ConnectionId, stream: TcpStream, context: Context) {
    match handle_connection(stream, &context) {
        Ok(()) => info!("connection {id} closed by peer"),
        Err(e) if context.stopping.load(Ordering::SeqCst) => {
            debug!("connection {id} ended during shutdown: {e}")
        }
        Err(TransportError::Timeout) => {
            warn!("connection {id} dropped: incomplete request timed out")
        }
        Err(e) => warn!("connection {id} dropped: {e}"),
    }
    context.connections.deregister(id);
}

fn handle_connection(stream: TcpStream, context: &Context) -> Result<(), TransportError> {
    let mut transport = ProtocolTransport::new(stream);
    let deadline = Deadline::OnceStarted(context.request_timeout);

    loop {
        let request = match transport.read_request(deadline) {
            Ok(request) => request,
            Err(TransportError::PeerClosed) => return Ok(()),
            Err(TransportError::Frame(e)) => {
                warn!("rejecting request: {e}");
                transport.write_response(&Response::error(e.to_string()), deadline)?;
                continue;
            }
            Err(e) => return Err(e),
        };
        debug!("received request: {}", request.kind());

        let response = match &request {
            Request::Ping => Response::pong(),
            Request::Command(envelope) => context.registry.dispatch(envelope),
        };
        transport.write_response(&response, deadline)?;
    }
}
