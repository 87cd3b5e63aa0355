mod daemon;
mod master;
mod node;
mod tunnel;

use anyhow::Result;
use clap::{Parser, Subcommand};
use devicehub_core::HubConfig;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "devicehub")]
#[command(about = "Device farm master and node daemons", long_about = None)]
struct Args {
    #[command(subcommand)]
    role: Command,

    /// Run in foreground (don't daemonize)
    #[arg(short, long, global = true)]
    foreground: bool,

    /// Config file (defaults to <config dir>/devicehub/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Coordinate devices and nodes
    Master,
    /// Serve this machine's devices to a master
    Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Node,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Node => write!(f, "node"),
        }
    }
}

impl From<Command> for Role {
    fn from(command: Command) -> Self {
        match command {
            Command::Master => Role::Master,
            Command::Node => Role::Node,
        }
    }
}

/// `RUST_LOG` wins over the default `info` level
pub fn init_logging(ansi: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(ansi);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let role = Role::from(args.role);

    if args.foreground {
        init_logging(true, args.json_logs);
        info!("devicehub {} starting in foreground", role);

        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(run(role, args.config))?;
    } else {
        // Daemonize FIRST, then start tokio runtime
        daemon::daemonize_and_run(role, args.config, args.json_logs)?;
    }

    Ok(())
}

pub async fn run(role: Role, config: Option<PathBuf>) -> Result<()> {
    let config = HubConfig::load(config.as_deref())?;
    let shutdown = setup_signal_handlers()?;

    match role {
        Role::Master => master::run(config, shutdown).await?,
        Role::Node => node::run(config, shutdown).await?,
    }

    info!("Shutdown complete");
    Ok(())
}

/// Flips the returned receiver to `true` on SIGINT or SIGTERM
fn setup_signal_handlers() -> Result<watch::Receiver<bool>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully");
            }
        }

        let _ = tx.send(true);
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_role_and_flags() {
        let args = Args::try_parse_from(["devicehub", "node", "--foreground", "-c", "/tmp/hub.json"])
            .unwrap();
        assert_eq!(Role::from(args.role), Role::Node);
        assert!(args.foreground);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/hub.json")));

        let args = Args::try_parse_from(["devicehub", "master"]).unwrap();
        assert_eq!(Role::from(args.role), Role::Master);
        assert!(!args.foreground);
    }

    #[test]
    fn test_role_names_files() {
        assert_eq!(Role::Master.to_string(), "master");
        assert_eq!(Role::Node.to_string(), "node");
    }
}
