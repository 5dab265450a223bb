//! Runtime settings for the host server, the bridge client and the presence monitor.
//!
//! There is no configuration file. Every setting has a `const` default below and the
//! binaries expose overrides as command line flags.
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

/// Port the host command server listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 6401;
/// Upper bound for a general command exchange.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound for a liveness probe.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound for a single TCP connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Total connect attempts before the bridge gives up.
pub const CONNECT_ATTEMPTS: u32 = 3;
/// Pause between two connect attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);
/// Bound on receiving the rest of a partially buffered request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// How long `stop()` waits for the accept loop before abandoning it.
pub const STOP_GRACE: Duration = Duration::from_secs(1);
/// Pause between `stop()` and `start()` in a restart.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);
/// Interval between two presence probes.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Host command server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub request_timeout: Duration,
    pub stop_grace: Duration,
    pub restart_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            request_timeout: REQUEST_TIMEOUT,
            stop_grace: STOP_GRACE,
            restart_delay: RESTART_DELAY,
        }
    }
}

/// Bridge client settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub address: SocketAddr,
    pub command_timeout: Duration,
    pub ping_timeout: Duration,
    pub connect_timeout: Duration,
    pub connect_attempts: u32,
    pub retry_delay: Duration,
}

impl BridgeConfig {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            command_timeout: COMMAND_TIMEOUT,
            ping_timeout: PING_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            connect_attempts: CONNECT_ATTEMPTS,
            retry_delay: RETRY_DELAY,
        }
    }
}

/// Presence monitor settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: MONITOR_INTERVAL,
        }
    }
}

/// Where the `read_console` handler looks for the host's log, in order.
#[derive(Debug, Clone, Default)]
pub struct ConsoleConfig {
    pub log_paths: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_defaults_target_local_host() {
        let config = BridgeConfig::default();

        assert_eq!(config.address.port(), DEFAULT_PORT);
        assert!(config.address.ip().is_loopback());
        assert!(config.ping_timeout < config.command_timeout);
    }

    #[test]
    fn bridge_new_keeps_default_timeouts() {
        let address: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let config = BridgeConfig::new(address);

        assert_eq!(config.address, address);
        assert_eq!(config.connect_attempts, CONNECT_ATTEMPTS);
        assert_eq!(config.retry_delay, RETRY_DELAY);
    }
}
