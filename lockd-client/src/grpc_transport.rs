//! [`ClientTransport`] implementation over the generated gRPC stubs: one
//! bidirectional `Session` stream carries every LOCK/UNLOCK this process
//! issues and every reply, multiplexed by tag (§5, §6.1).

use std::sync::Arc;

use async_trait::async_trait;
use lockd_core::error::{LockdError, Result};
use lockd_core::messages::{self, ClientMessage, LockRequest, ReadinessWire, UnlockRequest};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tracing::warn;

use crate::proto::lockd::v1 as pb;
use crate::transport::{ClientTransport, Dispatcher};

pub struct GrpcClientTransport {
    outbound: mpsc::Sender<pb::ClientEnvelope>,
    status_client: tokio::sync::Mutex<pb::client_gateway_client::ClientGatewayClient<Channel>>,
}

impl GrpcClientTransport {
    /// Connect to `endpoint` and start the background task that drains
    /// inbound replies into `dispatcher`.
    pub async fn connect(endpoint: String, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let channel = Channel::from_shared(endpoint)
            .map_err(|e| LockdError::InvalidParameter { reason: e.to_string() })?
            .connect()
            .await
            .map_err(|e| LockdError::Transmission {
                command: "connect".into(),
                peer: e.to_string(),
            })?;

        let mut session_client = pb::client_gateway_client::ClientGatewayClient::new(channel.clone());
        let (tx, rx) = mpsc::channel(64);
        let outbound_stream = ReceiverStream::new(rx);
        let mut inbound = session_client
            .session(outbound_stream)
            .await
            .map_err(|status| LockdError::Transmission {
                command: "Session".into(),
                peer: status.to_string(),
            })?
            .into_inner();

        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(envelope)) => deliver(&dispatcher, envelope),
                    Ok(None) => break,
                    Err(status) => {
                        warn!(error = %status, "Session stream error, failing open guards");
                        dispatcher.broadcast_transmission_failure();
                        break;
                    }
                }
            }
        });

        Ok(Self {
            outbound: tx,
            status_client: tokio::sync::Mutex::new(pb::client_gateway_client::ClientGatewayClient::new(channel)),
        })
    }
}

fn deliver(dispatcher: &Dispatcher, envelope: pb::ServerEnvelope) {
    use pb::server_envelope::Body;
    let Some(body) = envelope.body else { return };
    match body {
        Body::Locked(l) => dispatcher.deliver(
            l.tag as u16,
            ClientMessage::Locked(messages::Locked {
                object_name: l.object_name,
                tag: l.tag as u16,
                timeout_date: l.timeout_date,
                unlocked_date: l.unlocked_date,
            }),
        ),
        Body::LockFailed(f) => dispatcher.deliver(
            f.tag as u16,
            ClientMessage::LockFailed(messages::LockFailed {
                object_name: f.object_name,
                tag: f.tag as u16,
                key: f.key,
                error: proto_reason(f.error),
                description: f.description,
            }),
        ),
        Body::Unlocking(u) => dispatcher.deliver(
            u.tag as u16,
            ClientMessage::Unlocking(messages::Unlocking {
                object_name: u.object_name,
                tag: u.tag as u16,
            }),
        ),
        Body::Unlocked(u) => dispatcher.deliver(
            u.tag as u16,
            ClientMessage::Unlocked(messages::Unlocked {
                object_name: u.object_name,
                tag: u.tag as u16,
                timed_out: u.timed_out,
                unlocked_date: u.unlocked_date,
            }),
        ),
        Body::Alive(a) => dispatcher.deliver(
            a.tag as u16,
            ClientMessage::Alive {
                object_name: a.object_name,
                tag: a.tag as u16,
            },
        ),
        // Readiness is broadcast process-wide, not addressed to one tag;
        // callers that care about it poll `Status` instead.
        Body::Readiness(_) => {}
    }
}

fn proto_reason(v: i32) -> messages::ReasonWire {
    match pb::FailureReason::try_from(v).unwrap_or(pb::FailureReason::Failed) {
        pb::FailureReason::Timedout => messages::ReasonWire::Timedout,
        pb::FailureReason::Invalid => messages::ReasonWire::Invalid,
        pb::FailureReason::Duplicate => messages::ReasonWire::Duplicate,
        pb::FailureReason::Failed => messages::ReasonWire::Failed,
        pb::FailureReason::TransmissionError => messages::ReasonWire::TransmissionError,
    }
}

fn domain_kind(kind: messages::LockKind) -> i32 {
    match kind {
        messages::LockKind::Default => pb::LockKind::Default as i32,
        messages::LockKind::ReadOnly => pb::LockKind::ReadOnly as i32,
        messages::LockKind::ReadWritePriority => pb::LockKind::ReadWritePriority as i32,
    }
}

#[async_trait]
impl ClientTransport for GrpcClientTransport {
    async fn send_lock(&self, req: LockRequest) -> Result<()> {
        let envelope = pb::ClientEnvelope {
            body: Some(pb::client_envelope::Body::Lock(pb::LockRequest {
                object_name: req.object_name,
                tag: req.tag as u32,
                pid: req.pid,
                serial: req.serial,
                timeout: req.timeout,
                duration: req.duration,
                unlock_duration: req.unlock_duration,
                kind: domain_kind(req.kind),
            })),
        };
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| LockdError::Transmission {
                command: "LOCK".into(),
                peer: "session".into(),
            })
    }

    async fn send_unlock(&self, req: UnlockRequest) -> Result<()> {
        let envelope = pb::ClientEnvelope {
            body: Some(pb::client_envelope::Body::Unlock(pb::UnlockRequest {
                object_name: req.object_name,
                tag: req.tag as u32,
                pid: req.pid,
                serial: req.serial,
            })),
        };
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| LockdError::Transmission {
                command: "UNLOCK".into(),
                peer: "session".into(),
            })
    }

    async fn send_status_probe(&self) -> Result<ReadinessWire> {
        let mut client = self.status_client.lock().await;
        let resp = client
            .status(pb::StatusRequest {})
            .await
            .map_err(|status| LockdError::Transmission {
                command: "Status".into(),
                peer: status.to_string(),
            })?
            .into_inner();
        Ok(if resp.ready {
            ReadinessWire::LockReady
        } else {
            ReadinessWire::NoLock
        })
    }
}

// Re-exported so `lockd-status` doesn't need its own channel plumbing for
// the one-shot status probe.
pub async fn probe_status(endpoint: String) -> Result<ReadinessWire> {
    let channel = Channel::from_shared(endpoint)
        .map_err(|e| LockdError::InvalidParameter { reason: e.to_string() })?
        .connect()
        .await
        .map_err(|e| LockdError::Transmission {
            command: "connect".into(),
            peer: e.to_string(),
        })?;
    let mut client = pb::client_gateway_client::ClientGatewayClient::new(channel);
    let resp = client
        .status(pb::StatusRequest {})
        .await
        .map_err(|status| LockdError::Transmission {
            command: "Status".into(),
            peer: status.to_string(),
        })?
        .into_inner();
    Ok(if resp.ready {
        ReadinessWire::LockReady
    } else {
        ReadinessWire::NoLock
    })
}

pub async fn list_tickets(endpoint: String, object_name: String) -> Result<String> {
    let channel = Channel::from_shared(endpoint)
        .map_err(|e| LockdError::InvalidParameter { reason: e.to_string() })?
        .connect()
        .await
        .map_err(|e| LockdError::Transmission {
            command: "connect".into(),
            peer: e.to_string(),
        })?;
    let mut client = pb::client_gateway_client::ClientGatewayClient::new(channel);
    let resp = client
        .list_tickets(pb::ListTicketsRequest { object_name })
        .await
        .map_err(|status| LockdError::Transmission {
            command: "ListTickets".into(),
            peer: status.to_string(),
        })?
        .into_inner();
    Ok(resp.rendered)
}
