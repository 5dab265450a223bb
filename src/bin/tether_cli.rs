use std::{
    error::Error,
    io,
    net::SocketAddr,
    process::ExitCode,
    sync::{Arc, mpsc},
    time::Duration,
};

use clap::{Parser, Subcommand};
use tether::{
    BridgeClient, BridgeConfig, BridgeError, Command, HostMonitor, HostPresence,
    cli::parse_parameters,
    config::{COMMAND_TIMEOUT, CONNECT_ATTEMPTS, MONITOR_INTERVAL, MonitorConfig},
    prompt,
};

#[derive(Debug, Parser)]
#[command(version, about = "Send commands to a running host", long_about = None)]
struct Cli {
    /// Address of the host command server
    #[arg(short, long, default_value = "127.0.0.1:6401")]
    address: SocketAddr,
    /// Connect attempts before giving up
    #[arg(long, default_value_t = CONNECT_ATTEMPTS)]
    attempts: u32,
    /// Seconds to wait for a command's response
    #[arg(long, default_value_t = COMMAND_TIMEOUT.as_secs())]
    timeout: u64,
    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Check that the host answers
    Ping,
    /// Print whether the host is running
    Status,
    /// Send one command with optional JSON object parameters
    Send { kind: String, parameters: Option<String> },
    /// Report host availability changes until interrupted
    Watch {
        /// Seconds between probes
        #[arg(long, default_value_t = MONITOR_INTERVAL.as_secs())]
        interval: u64,
    },
    /// Read commands from stdin (the default)
    Repl,
}

fn main() -> Result<ExitCode, Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let client = BridgeClient::new(BridgeConfig {
        connect_attempts: cli.attempts,
        command_timeout: Duration::from_secs(cli.timeout),
        ..BridgeConfig::new(cli.address)
    });

    match cli.action.unwrap_or(Action::Repl) {
        Action::Ping => Ok(report(client.ping().map(|_| println!("pong")))),
        Action::Status => {
            let running = client.is_host_running();
            println!("{}", if running { "running" } else { "not running" });
            Ok(if running {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }
        Action::Send { kind, parameters } => {
            let parameters = parse_parameters(parameters.as_deref().unwrap_or(""))?;
            let outcome = client
                .send_command(&kind, parameters)
                .map(|result| println!("{}", pretty(&result)));
            Ok(report(outcome))
        }
        Action::Watch { interval } => {
            watch(client, Duration::from_secs(interval))?;
            Ok(ExitCode::SUCCESS)
        }
        Action::Repl => {
            repl(&client)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Exit code 2 when the host is unreachable, 1 when it rejected the command.
fn report(outcome: Result<(), BridgeError>) -> ExitCode {
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_unreachable() => {
            eprintln!("host not reachable: {e}");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("command failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn pretty(result: &tether::protocol::Parameters) -> String {
    serde_json::to_string_pretty(result).unwrap_or_else(|_| format!("{result:?}"))
}

fn watch(client: BridgeClient, interval: Duration) -> Result<(), Box<dyn Error>> {
    let client = Arc::new(client);
    let (interrupt, interrupted) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = interrupt.send(());
    })?;

    let probe = Arc::clone(&client);
    let monitor = HostMonitor::spawn(
        MonitorConfig { interval },
        move || probe.is_host_running(),
        |presence| match presence {
            HostPresence::Up => println!("host is up"),
            HostPresence::Down => println!("host is down"),
        },
    )?;

    let _ = interrupted.recv();
    monitor.stop();
    client.disconnect();
    Ok(())
}

fn repl(client: &BridgeClient) -> Result<(), Box<dyn Error>> {
    let stdin = io::stdin();
    let stdout = io::stdout();

    loop {
        let reader = stdin.lock();
        let writer = StdOut {
            inner: stdout.lock(),
        };

        let cmd = match prompt(reader, writer) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        match cmd {
            Command::Exit => break,
            Command::Send { kind, parameters } => match client.send_command(&kind, parameters) {
                Ok(result) => println!("{}", pretty(&result)),
                Err(e) if e.is_unreachable() => eprintln!("host not reachable: {e}"),
                Err(e) => eprintln!("command failed: {e}"),
            },
        }
    }

    client.disconnect();
    Ok(())
}

/// StdOut wrapper that flushes flushes content after every write.
struct StdOut<W: io::Write> {
    inner: W,
}

impl<W: io::Write> io::Write for StdOut<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let res = self.inner.write(buf);
        if res.is_ok() {
            self.inner.flush()?
        }
        res
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
