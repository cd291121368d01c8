//! Cluster bootstrap tooling. Generates one env file per node for a local
//! `lockd-server` cluster, the way a small fleet is usually hand-rolled
//! before a real orchestrator takes over.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "xtask")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `node-<n>.env` files for a `nodes`-sized local cluster, each
    /// carrying that node's bind address, priority, and full peer list.
    Bootstrap {
        #[arg(long, default_value_t = 3)]
        nodes: usize,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 4950)]
        base_port: u16,
        #[arg(long, default_value = "target/cluster")]
        out_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Bootstrap {
            nodes,
            host,
            base_port,
            out_dir,
        } => bootstrap(nodes, &host, base_port, &out_dir),
    }
}

fn bootstrap(nodes: usize, host: &str, base_port: u16, out_dir: &PathBuf) -> Result<()> {
    anyhow::ensure!(nodes >= 1, "cluster must have at least one node");
    fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let names: Vec<String> = (0..nodes).map(|i| format!("node-{i}")).collect();
    let ports: Vec<u16> = (0..nodes).map(|i| base_port + i as u16).collect();

    for (i, name) in names.iter().enumerate() {
        let bind = format!("{host}:{}", ports[i]);
        let peers: Vec<String> = names
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(j, peer_name)| format!("{peer_name}=http://{host}:{}", ports[j]))
            .collect();

        let env = format!(
            "LOCKD_BIND={bind}\n\
             LOCKD_IP={host}\n\
             LOCKD_NODE_NAME={name}\n\
             LOCKD_PRIORITY=5\n\
             LOCKD_TOTAL_NODES={nodes}\n\
             LOCKD_PEERS={}\n",
            peers.join(",")
        );

        let path = out_dir.join(format!("{name}.env"));
        fs::write(&path, env).with_context(|| format!("writing {}", path.display()))?;
        println!("wrote {}", path.display());
    }

    Ok(())
}
