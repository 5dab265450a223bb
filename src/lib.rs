pub mod cli;
pub mod client;
pub mod commands;
pub mod config;
pub mod monitor;
pub mod protocol;

pub use cli::{Command, prompt};
pub use client::{BridgeClient, BridgeError, ConnectionState};
pub use config::{BridgeConfig, ServerConfig};
pub use monitor::{HostMonitor, HostPresence};
pub use protocol::{CommandRegistry, CommandServer};
