//! tonic service implementations wrapping [`lockd_core::Engine`].
//!
//! Grounded on the teacher's `grpc.rs`: small proto<->domain conversion
//! helpers, an `engine_err`-style error mapper, and a spawned-task
//! streaming pattern for the one long-lived RPC (`Session`, standing in
//! for the teacher's `subscribe_events`).

use std::pin::Pin;
use std::sync::Arc;

use lockd_core::engine::Engine;
use lockd_core::error::LockdError;
use lockd_core::messages::{self, ClientMessage, LockKind, LockRequest, UnlockRequest};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::warn;

use crate::proto::lockd::v1 as pb;

/// Maps a closed [`LockdError`] taxonomy onto gRPC status codes — unlike
/// the teacher's single `Status::internal` catch-all over `anyhow::Error`,
/// this mapping is exhaustive per-variant since the taxonomy here is
/// closed (§7).
fn engine_err(err: LockdError) -> Status {
    match &err {
        LockdError::ProtocolValidation { .. } | LockdError::InvalidParameter { .. } => {
            Status::invalid_argument(err.to_string())
        }
        LockdError::Duplicate { .. } => Status::already_exists(err.to_string()),
        LockdError::Transmission { .. } => Status::unavailable(err.to_string()),
        LockdError::Configuration(_) | LockdError::InvariantViolation(_) => {
            Status::internal(err.to_string())
        }
        LockdError::NoLeaders | LockdError::UnknownTicket(_) => Status::failed_precondition(err.to_string()),
    }
}

fn proto_kind(kind: i32) -> LockKind {
    match pb::LockKind::try_from(kind).unwrap_or(pb::LockKind::Default) {
        pb::LockKind::Default => LockKind::Default,
        pb::LockKind::ReadOnly => LockKind::ReadOnly,
        pb::LockKind::ReadWritePriority => LockKind::ReadWritePriority,
    }
}

fn domain_reason(reason: messages::ReasonWire) -> i32 {
    match reason {
        messages::ReasonWire::Timedout => pb::FailureReason::Timedout as i32,
        messages::ReasonWire::Invalid => pb::FailureReason::Invalid as i32,
        messages::ReasonWire::Duplicate => pb::FailureReason::Duplicate as i32,
        messages::ReasonWire::Failed => pb::FailureReason::Failed as i32,
        messages::ReasonWire::TransmissionError => pb::FailureReason::TransmissionError as i32,
    }
}

fn client_message_to_envelope(msg: ClientMessage) -> Option<pb::ServerEnvelope> {
    use pb::server_envelope::Body;
    let body = match msg {
        ClientMessage::Locked(l) => Body::Locked(pb::Locked {
            object_name: l.object_name,
            tag: l.tag as u32,
            timeout_date: l.timeout_date,
            unlocked_date: l.unlocked_date,
        }),
        ClientMessage::LockFailed(f) => Body::LockFailed(pb::LockFailed {
            object_name: f.object_name,
            tag: f.tag as u32,
            key: f.key,
            error: domain_reason(f.error),
            description: f.description,
        }),
        ClientMessage::Unlocking(u) => Body::Unlocking(pb::Unlocking {
            object_name: u.object_name,
            tag: u.tag as u32,
        }),
        ClientMessage::Unlocked(u) => Body::Unlocked(pb::Unlocked {
            object_name: u.object_name,
            tag: u.tag as u32,
            timed_out: u.timed_out,
            unlocked_date: u.unlocked_date,
        }),
        ClientMessage::Readiness(r) => Body::Readiness(pb::Readiness {
            ready: matches!(r, messages::ReadinessWire::LockReady),
        }),
        ClientMessage::Alive { object_name, tag } => Body::Alive(pb::Alive {
            object_name,
            tag: tag as u32,
        }),
    };
    Some(pb::ServerEnvelope { body: Some(body) })
}

/// One gRPC-facing router per node: every `ClientMessage` the engine wants
/// to deliver to `home_node` is handed here, and re-broadcast to every
/// live `Session` stream that claimed that home node. A real deployment
/// with many concurrently connected clients would key this by client
/// connection id, not just home_node; single-client-per-node is this
/// crate's supported shape (§6.7 notes the general cross-node routing
/// problem as the `ClientRouter` trait's job, which this implements).
#[derive(Default)]
pub struct GrpcClientRouter {
    sessions: tokio::sync::Mutex<Vec<mpsc::Sender<pb::ServerEnvelope>>>,
}

impl GrpcClientRouter {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, tx: mpsc::Sender<pb::ServerEnvelope>) {
        self.sessions.lock().await.push(tx);
    }
}

#[async_trait::async_trait]
impl lockd_core::transport::ClientRouter for GrpcClientRouter {
    async fn deliver(&self, _home_node: &str, msg: ClientMessage) -> lockd_core::error::Result<()> {
        let Some(envelope) = client_message_to_envelope(msg) else {
            return Ok(());
        };
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|tx| tx.try_send(envelope.clone()).is_ok());
        Ok(())
    }
}

pub struct ClientGatewayService {
    pub engine: Arc<Engine>,
    pub router: Arc<GrpcClientRouter>,
    pub self_name: String,
}

type SessionStream = Pin<Box<dyn Stream<Item = Result<pb::ServerEnvelope, Status>> + Send>>;

#[tonic::async_trait]
impl pb::client_gateway_server::ClientGateway for ClientGatewayService {
    type SessionStream = SessionStream;

    async fn session(
        &self,
        request: Request<Streaming<pb::ClientEnvelope>>,
    ) -> Result<Response<Self::SessionStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(64);
        self.router.register(tx).await;

        let engine = self.engine.clone();
        let self_name = self.self_name.clone();
        tokio::spawn(async move {
            while let Some(result) = inbound.next().await {
                let envelope = match result {
                    Ok(e) => e,
                    Err(status) => {
                        warn!(error = %status, "client session stream error");
                        break;
                    }
                };
                let Some(body) = envelope.body else { continue };
                match body {
                    pb::client_envelope::Body::Lock(req) => {
                        let request = LockRequest {
                            object_name: req.object_name,
                            tag: req.tag as u16,
                            pid: req.pid,
                            serial: req.serial,
                            timeout: req.timeout,
                            duration: req.duration,
                            unlock_duration: req.unlock_duration,
                            kind: proto_kind(req.kind),
                        };
                        if let Err(err) = engine.start_lock(request, self_name.clone()).await {
                            warn!(error = %err, "start_lock failed");
                        }
                    }
                    pb::client_envelope::Body::Unlock(req) => {
                        let request = UnlockRequest {
                            object_name: req.object_name,
                            tag: req.tag as u16,
                            pid: req.pid,
                            serial: req.serial,
                        };
                        if let Err(err) = engine.unlock_request(&request, self_name.clone()).await {
                            warn!(error = %err, "unlock_request failed");
                        }
                    }
                }
            }
        });

        let out = ReceiverStream::new(rx).map(Ok);
        Ok(Response::new(Box::pin(out)))
    }

    async fn status(
        &self,
        _request: Request<pb::StatusRequest>,
    ) -> Result<Response<pb::StatusResponse>, Status> {
        Ok(Response::new(pb::StatusResponse {
            ready: self.engine.is_ready().await,
        }))
    }

    async fn list_tickets(
        &self,
        request: Request<pb::ListTicketsRequest>,
    ) -> Result<Response<pb::ListTicketsResponse>, Status> {
        let object_name = request.into_inner().object_name;
        let rendered = self
            .engine
            .render_tickets(&object_name)
            .await
            .map_err(engine_err)?;
        Ok(Response::new(pb::ListTicketsResponse { rendered }))
    }
}

pub struct PeerCoordinatorService {
    pub engine: Arc<Engine>,
}

#[tonic::async_trait]
impl pb::peer_coordinator_server::PeerCoordinator for PeerCoordinatorService {
    async fn lock_entering(
        &self,
        request: Request<pb::LockEnteringRequest>,
    ) -> Result<Response<pb::LockEnteredReply>, Status> {
        let req = request.into_inner();
        let reply = self
            .engine
            .on_lock_entering(messages::LockEnteringMsg {
                object_name: req.object_name,
                entering_key: req.entering_key,
                tag: req.tag as u16,
                source: req.source,
                serial: req.serial,
                home_node: req.home_node,
            })
            .await
            .map_err(engine_err)?;
        Ok(Response::new(pb::LockEnteredReply {
            object_name: reply.object_name,
            entering_key: reply.entering_key,
        }))
    }

    async fn get_max_ticket(
        &self,
        request: Request<pb::GetMaxTicketRequest>,
    ) -> Result<Response<pb::MaxTicketReply>, Status> {
        let req = request.into_inner();
        let reply = self
            .engine
            .on_get_max_ticket(messages::GetMaxTicketMsg {
                object_name: req.object_name,
            })
            .await
            .map_err(engine_err)?;
        Ok(Response::new(pb::MaxTicketReply {
            object_name: reply.object_name,
            max_ticket: reply.max_ticket,
        }))
    }

    async fn add_ticket(
        &self,
        request: Request<pb::AddTicketRequest>,
    ) -> Result<Response<pb::TicketAddedReply>, Status> {
        let req = request.into_inner();
        let reply = self
            .engine
            .on_add_ticket(messages::AddTicketMsg {
                object_name: req.object_name,
                entering_key: req.entering_key,
                ticket_key: req.ticket_key,
            })
            .await
            .map_err(engine_err)?;
        Ok(Response::new(pb::TicketAddedReply {
            object_name: reply.object_name,
            ticket_key: reply.ticket_key,
        }))
    }

    async fn lock_exiting(
        &self,
        request: Request<pb::LockExitingRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let req = request.into_inner();
        self.engine
            .on_lock_exiting(messages::LockExitingMsg {
                object_name: req.object_name,
                entering_key: req.entering_key,
            })
            .await
            .map_err(engine_err)?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn ticket_ready(
        &self,
        request: Request<pb::TicketReadyRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let req = request.into_inner();
        self.engine
            .on_ticket_ready(messages::TicketReadyMsg {
                object_name: req.object_name,
                ticket_key: req.ticket_key,
            })
            .await
            .map_err(engine_err)?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn activate_lock(
        &self,
        request: Request<pb::ActivateLockRequest>,
    ) -> Result<Response<pb::LockActivatedReply>, Status> {
        let req = request.into_inner();
        let reply = self
            .engine
            .on_activate_lock(messages::ActivateLockMsg {
                object_name: req.object_name,
            })
            .await
            .map_err(engine_err)?;
        Ok(Response::new(pb::LockActivatedReply {
            object_name: reply.object_name,
            first_ticket_key: reply.first_ticket_key,
        }))
    }

    async fn drop_ticket(
        &self,
        request: Request<pb::DropTicketRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let req = request.into_inner();
        self.engine
            .on_drop_ticket(messages::DropTicketMsg {
                object_name: req.object_name,
                ticket_key: req.ticket_key,
            })
            .await
            .map_err(engine_err)?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn lock_leaders(
        &self,
        request: Request<pb::LockLeadersRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let req = request.into_inner();
        self.engine
            .on_lock_leaders(messages::LockLeadersMsg {
                election_date: req.election_date,
                leader0: req.leader0,
                leader1: req.leader1,
                leader2: req.leader2,
            })
            .await;
        Ok(Response::new(pb::Empty {}))
    }

    async fn lock_started(
        &self,
        request: Request<pb::LockStartedRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let req = request.into_inner();
        if let Ok(parsed) = lockd_core::node::Node::parse_id(&req.node_id) {
            let mut node = lockd_core::node::Node::new(parsed.priority, parsed.ip, parsed.pid, parsed.name, 0);
            node.random = parsed.random;
            node.connected = true;
            self.engine.on_peer_seen(node).await;
        }
        Ok(Response::new(pb::Empty {}))
    }

    async fn lock_tickets(
        &self,
        request: Request<pb::LockTicketsRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let req = request.into_inner();
        self.engine
            .on_lock_tickets(messages::LockTicketsMsg { tickets: req.tickets })
            .await
            .map_err(engine_err)?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn forward_lock(
        &self,
        request: Request<pb::ForwardLockRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let req = request.into_inner();
        self.engine
            .on_forward_lock(messages::ForwardLockMsg {
                object_name: req.object_name,
                entering_key: req.entering_key,
                tag: req.tag as u16,
                serial: req.serial,
                timeout: req.timeout,
                duration: req.duration,
                unlock_duration: req.unlock_duration,
                home_node: req.home_node,
            })
            .await
            .map_err(engine_err)?;
        Ok(Response::new(pb::Empty {}))
    }
}
