use std::{
    collections::HashMap,
    io,
    net::{Shutdown, TcpStream},
    sync::{Mutex, MutexGuard, PoisonError},
};

use log::debug;

pub type ConnectionId = u64;

#[derive(Debug, Default)]
struct Tracked {
    next_id: ConnectionId,
    closed: bool,
    streams: HashMap<ConnectionId, TcpStream>,
}

/// Connections accepted by one run of the server.
///
/// Holds a clone of every live stream so `close_all` can unblock handler threads
/// sitting in `read`. Once closed, no further connections are admitted.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Tracked>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `stream`. Returns `None` when the registry was already closed.
    pub fn register(&self, stream: &TcpStream) -> io::Result<Option<ConnectionId>> {
        let clone = stream.try_clone()?;
        let mut tracked = self.lock();
        if tracked.closed {
            return Ok(None);
        }

        let id = tracked.next_id;
        tracked.next_id += 1;
        tracked.streams.insert(id, clone);
        Ok(Some(id))
    }

    pub fn deregister(&self, id: ConnectionId) {
        if self.lock().streams.remove(&id).is_some() {
            debug!("connection {id} deregistered");
        }
    }

    /// Shut down every tracked stream and refuse new ones. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let streams: Vec<(ConnectionId, TcpStream)> = {
            let mut tracked = self.lock();
            tracked.closed = true;
            tracked.streams.drain().collect()
        };

        for (id, stream) in &streams {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!("connection {id} already closed: {e}");
            }
        }
        streams.len()
    }

    pub fn len(&self) -> usize {
        self.lock().streams.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Read, net::TcpListener};

    use super::*;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn register_and_deregister() {
        let registry = ConnectionRegistry::new();
        let (_client, server) = pair();

        let id = registry.register(&server).unwrap().unwrap();
        assert_eq!(registry.len(), 1);

        registry.deregister(id);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn close_all_shuts_streams_and_refuses_new_ones() {
        let registry = ConnectionRegistry::new();
        let (mut client, server) = pair();
        registry.register(&server).unwrap().unwrap();

        assert_eq!(registry.close_all(), 1);

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);

        let (_client, late) = pair();
        assert_eq!(registry.register(&late).unwrap(), None);
    }
}
