//! The one sanctioned CLI surface (§6.6): probe a coordinator node for
//! readiness, or dump the tickets held for one object name.

use clap::{Parser, Subcommand};
use lockd_client::grpc_transport::{list_tickets, probe_status};
use lockd_core::messages::ReadinessWire;

#[derive(Parser)]
#[command(name = "lockd-status", about = "Probe a lockd coordinator node")]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:4950")]
    endpoint: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// LOCK_STATUS probe: prints `ready` or `not ready`.
    Status,
    /// LIST_TICKETS probe for one object name.
    ListTickets { object_name: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    match cli.command {
        Command::Status => {
            let readiness = probe_status(cli.endpoint).await?;
            println!(
                "{}",
                match readiness {
                    ReadinessWire::LockReady => "ready",
                    ReadinessWire::NoLock => "not ready",
                }
            );
        }
        Command::ListTickets { object_name } => {
            let rendered = list_tickets(cli.endpoint, object_name).await?;
            println!("{rendered}");
        }
    }
    Ok(())
}
