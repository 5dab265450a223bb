//! Host presence monitoring.
//!
//! [`HostMonitor`] runs a probe on a background thread at a fixed interval and reports
//! every change in the host's availability. It is a single periodic task: stopping it
//! wakes the thread at once instead of waiting out the interval.
use std::{
    io,
    sync::mpsc::{self, RecvTimeoutError, Sender},
    thread::{self, JoinHandle},
};

use log::{debug, info, warn};

use crate::config::MonitorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPresence {
    Up,
    Down,
}

impl From<bool> for HostPresence {
    fn from(value: bool) -> Self {
        if value {
            HostPresence::Up
        } else {
            HostPresence::Down
        }
    }
}

pub struct HostMonitor {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HostMonitor {
    /// Start probing. `on_change` sees the first observation and then every transition.
    pub fn spawn<P, F>(config: MonitorConfig, probe: P, mut on_change: F) -> io::Result<Self>
    where
        P: Fn() -> bool + Send + 'static,
        F: FnMut(HostPresence) + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("tether-monitor".into())
            .spawn(move || {
                info!("monitoring host every {:?}", config.interval);
                let mut last = None;
                loop {
                    let presence = HostPresence::from(probe());
                    if last != Some(presence) {
                        debug!("host presence changed to {presence:?}");
                        on_change(presence);
                        last = Some(presence);
                    }

                    match stopped.recv_timeout(config.interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("host monitor stopped");
            })?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Signal the monitor and wait for its thread to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("host monitor panicked");
            }
        }
    }
}

impl Drop for HostMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
