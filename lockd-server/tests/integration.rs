//! Integration tests: exercise a real `ClientGateway`/`PeerCoordinator`
//! server bound to a loopback port, driven over gRPC by the generated
//! client stubs — validating the proto<->domain conversions in `grpc.rs`
//! that a pure-engine test (see `lockd-core`) cannot reach.

use std::net::SocketAddr;
use std::sync::Arc;

use lockd_core::engine::Engine;
use lockd_core::node::Node;
use lockd_core::store_memory::InMemoryTicketStore;
use lockd_core::transport::NullPeerTransport;
use lockd_server::grpc::{ClientGatewayService, GrpcClientRouter, PeerCoordinatorService};
use lockd_server::proto::lockd::v1 as pb;
use tokio::net::TcpListener;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::Server;

async fn spawn_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let node = Node::new(1, "127.0.0.1", std::process::id(), "solo", 0);
    let self_id = node.id();
    let router = Arc::new(GrpcClientRouter::new());
    let engine = Arc::new(Engine::new(
        node,
        1,
        Arc::new(InMemoryTicketStore::new()),
        Arc::new(NullPeerTransport),
        router.clone(),
    ));
    engine.on_bus_connected().await;
    // Single-node cluster: seed self-leadership the way the real election
    // owner would announce it via LOCK_LEADERS.
    engine
        .on_lock_leaders(lockd_core::messages::LockLeadersMsg {
            election_date: 1,
            leader0: self_id,
            leader1: None,
            leader2: None,
        })
        .await;

    let client_gateway = pb::client_gateway_server::ClientGatewayServer::new(ClientGatewayService {
        engine: engine.clone(),
        router,
        self_name: "solo".into(),
    });
    let peer_coordinator =
        pb::peer_coordinator_server::PeerCoordinatorServer::new(PeerCoordinatorService { engine });

    tokio::spawn(async move {
        Server::builder()
            .add_service(client_gateway)
            .add_service(peer_coordinator)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    addr
}

#[tokio::test]
async fn lock_then_unlock_round_trip_over_grpc() {
    let addr = spawn_test_server().await;
    let endpoint = format!("http://{addr}");

    let mut client = pb::client_gateway_client::ClientGatewayClient::connect(endpoint)
        .await
        .unwrap();

    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let outbound = ReceiverStream::new(rx);
    let mut inbound = client.session(outbound).await.unwrap().into_inner();

    tx.send(pb::ClientEnvelope {
        body: Some(pb::client_envelope::Body::Lock(pb::LockRequest {
            object_name: "resource-a".into(),
            tag: 7,
            pid: 42,
            serial: -1,
            timeout: now() + 5,
            duration: Some(5),
            unlock_duration: Some(5),
            kind: pb::LockKind::Default as i32,
        })),
    })
    .await
    .unwrap();

    let reply = inbound.message().await.unwrap().unwrap();
    let locked = match reply.body {
        Some(pb::server_envelope::Body::Locked(l)) => l,
        other => panic!("expected Locked, got {other:?}"),
    };
    assert_eq!(locked.object_name, "resource-a");
    assert_eq!(locked.tag, 7);

    tx.send(pb::ClientEnvelope {
        body: Some(pb::client_envelope::Body::Unlock(pb::UnlockRequest {
            object_name: "resource-a".into(),
            tag: 7,
            pid: 42,
            serial: -1,
        })),
    })
    .await
    .unwrap();

    let reply = inbound.message().await.unwrap().unwrap();
    match reply.body {
        Some(pb::server_envelope::Body::Unlocked(u)) => {
            assert_eq!(u.object_name, "resource-a");
            assert!(!u.timed_out);
        }
        other => panic!("expected Unlocked, got {other:?}"),
    }
}

#[tokio::test]
async fn status_reports_ready_once_single_node_cluster_is_up() {
    let addr = spawn_test_server().await;
    let endpoint = format!("http://{addr}");
    let mut client = pb::client_gateway_client::ClientGatewayClient::connect(endpoint)
        .await
        .unwrap();

    let resp = client
        .status(pb::StatusRequest {})
        .await
        .unwrap()
        .into_inner();
    assert!(resp.ready);
}

#[tokio::test]
async fn peer_coordinator_lock_entering_round_trips() {
    let addr = spawn_test_server().await;
    let endpoint = format!("http://{addr}");
    let mut client = pb::peer_coordinator_client::PeerCoordinatorClient::connect(endpoint)
        .await
        .unwrap();

    let reply = client
        .lock_entering(pb::LockEnteringRequest {
            object_name: "resource-b".into(),
            entering_key: "peer/9".into(),
            tag: 3,
            source: "peer/9".into(),
            serial: -1,
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(reply.entering_key, "peer/9");
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
