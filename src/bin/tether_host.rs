use std::{error::Error, net::IpAddr, path::PathBuf, sync::mpsc, time::Duration};

use clap::Parser;
use log::info;
use tether::{
    CommandServer, ServerConfig, commands,
    config::{ConsoleConfig, DEFAULT_PORT, REQUEST_TIMEOUT},
};

#[derive(Debug, Parser)]
#[command(version, about = "Serve host commands to automation clients", long_about = None)]
struct Cli {
    /// Listen for new connections on this port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Interface to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,
    /// Seconds allowed for the rest of a partially received request
    #[arg(long, default_value_t = REQUEST_TIMEOUT.as_secs())]
    request_timeout: u64,
    /// Log file served by `read_console`; repeat to search several in order
    #[arg(long = "console-log")]
    console_logs: Vec<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let registry = commands::builtin_registry(ConsoleConfig {
        log_paths: cli.console_logs,
    });
    info!("serving commands: {:?}", registry.names());

    let server = CommandServer::new(
        ServerConfig {
            host: cli.host,
            request_timeout: Duration::from_secs(cli.request_timeout),
            ..ServerConfig::default()
        },
        registry,
    );

    let (interrupt, interrupted) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = interrupt.send(());
    })?;

    server.start(cli.port)?;
    let _ = interrupted.recv();

    info!("interrupted, shutting down");
    server.stop();
    Ok(())
}
