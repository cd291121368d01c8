use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use lockd_core::engine::Engine;
use lockd_core::node::Node;
use lockd_core::store_memory::InMemoryTicketStore;
use tonic::transport::Server;
use tracing::{info, warn};

use lockd_server::config::Config;
use lockd_server::grpc::{ClientGatewayService, GrpcClientRouter, PeerCoordinatorService};
use lockd_server::peer_client::PeerClient;
use lockd_server::proto::lockd::v1::client_gateway_server::ClientGatewayServer;
use lockd_server::proto::lockd::v1::peer_coordinator_server::PeerCoordinatorServer;

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Drives the timer wheel (§4.6): one `tokio::time::Sleep`, re-armed after
/// every tick against whatever deadline the engine reports next, rather
/// than a fixed poll interval. A fallback keeps the loop alive when nothing
/// is outstanding so a request arriving between ticks is still picked up
/// promptly.
async fn run_timer_wheel(engine: Arc<Engine>) {
    let fallback = Duration::from_secs(1);
    let sleep = tokio::time::sleep(fallback);
    tokio::pin!(sleep);
    loop {
        sleep.as_mut().await;
        let t = now();
        if let Err(err) = engine.tick(t).await {
            warn!(error = %err, "timer wheel tick failed");
        }
        let delay = engine
            .next_deadline(t)
            .await
            .map(|deadline| deadline.saturating_sub(t))
            .map(Duration::from_secs)
            .filter(|d| !d.is_zero())
            .unwrap_or(fallback);
        sleep.as_mut().reset(tokio::time::Instant::now() + delay);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::parse();
    let peers = config.parsed_peers()?;

    let self_node = Node::new(
        config.priority,
        config.ip.clone(),
        std::process::id(),
        config.node_name.clone(),
        now(),
    );

    let store = Arc::new(InMemoryTicketStore::new());
    let peer_client = Arc::new(PeerClient::new(&peers));
    let router = Arc::new(GrpcClientRouter::new());

    let engine = Arc::new(Engine::new(
        self_node,
        config.total_nodes,
        store,
        peer_client,
        router.clone(),
    ));
    engine.on_bus_connected().await;

    tokio::spawn(run_timer_wheel(engine.clone()));

    let client_gateway = ClientGatewayServer::new(ClientGatewayService {
        engine: engine.clone(),
        router,
        self_name: config.node_name.clone(),
    });
    let peer_coordinator = PeerCoordinatorServer::new(PeerCoordinatorService {
        engine: engine.clone(),
    });

    info!(bind = %config.bind, node = %config.node_name, "lockd-server starting");
    Server::builder()
        .add_service(client_gateway)
        .add_service(peer_coordinator)
        .serve(config.bind)
        .await?;

    Ok(())
}
