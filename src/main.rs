use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use sling::{config, protocol, receiver, sender};

#[derive(Parser)]
#[command(name = "sling", version, about = "Point-to-point file transfer over TCP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Push files or directories to a receiver
    #[command(visible_alias = "upload")]
    Send {
        /// Receiver address, `host` or `host:port`
        address: String,

        /// Files and directories to send
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Listen for a sender and materialize incoming files
    #[command(visible_alias = "recv")]
    Receive {
        /// Port to listen on
        #[arg(long, default_value_t = protocol::DEFAULT_PORT)]
        port: u16,

        /// Directory incoming paths are created under
        #[arg(long, default_value = config::DEFAULT_RECEIVE_DIR)]
        dir: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Send { address, paths } => {
            if !sender::run(&address, &paths)? {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Receive { port, dir } => receiver::serve(port, &dir),
    }
}
