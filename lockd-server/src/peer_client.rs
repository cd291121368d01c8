//! `PeerTransport` impl dialing peer `PeerCoordinator` endpoints.
//!
//! Grounded on the teacher's outbound gRPC client wrapper: one channel per
//! remote, dialed lazily and cached, with a `LockdError::Transmission` on
//! dial/call failure rather than a panic.

use std::collections::HashMap;

use async_trait::async_trait;
use lockd_core::error::{LockdError, Result};
use lockd_core::messages::*;
use lockd_core::transport::PeerTransport;
use tokio::sync::Mutex;
use tonic::transport::Channel;

use crate::config::PeerAddr;
use crate::proto::lockd::v1 as pb;
use crate::proto::lockd::v1::peer_coordinator_client::PeerCoordinatorClient;

/// Dials every configured peer by name. Channels are established lazily on
/// first use and cached — `tonic::transport::Channel` is itself cheaply
/// cloneable and reconnects transparently, so there is no separate
/// reconnect policy to manage here.
pub struct PeerClient {
    endpoints: HashMap<String, String>,
    clients: Mutex<HashMap<String, PeerCoordinatorClient<Channel>>>,
}

impl PeerClient {
    pub fn new(peers: &[PeerAddr]) -> Self {
        Self {
            endpoints: peers
                .iter()
                .map(|p| (p.name.clone(), p.endpoint.clone()))
                .collect(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client_for(&self, peer: &str) -> Result<PeerCoordinatorClient<Channel>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(peer) {
            return Ok(client.clone());
        }
        let endpoint = self
            .endpoints
            .get(peer)
            .ok_or_else(|| LockdError::Transmission {
                command: "dial".into(),
                peer: peer.to_string(),
            })?
            .clone();
        let channel = Channel::from_shared(endpoint)
            .map_err(|_| LockdError::Transmission {
                command: "dial".into(),
                peer: peer.to_string(),
            })?
            .connect()
            .await
            .map_err(|_| LockdError::Transmission {
                command: "dial".into(),
                peer: peer.to_string(),
            })?;
        let client = PeerCoordinatorClient::new(channel);
        clients.insert(peer.to_string(), client.clone());
        Ok(client)
    }

    fn xmit(command: &str, peer: &str) -> LockdError {
        LockdError::Transmission {
            command: command.to_string(),
            peer: peer.to_string(),
        }
    }
}

#[async_trait]
impl PeerTransport for PeerClient {
    async fn lock_entering(&self, peer: &str, req: LockEnteringMsg) -> Result<LockEnteredMsg> {
        let mut client = self.client_for(peer).await?;
        let reply = client
            .lock_entering(pb::LockEnteringRequest {
                object_name: req.object_name,
                entering_key: req.entering_key,
                tag: req.tag as u32,
                source: req.source,
                serial: req.serial,
                home_node: req.home_node,
            })
            .await
            .map_err(|_| Self::xmit("LOCK_ENTERING", peer))?
            .into_inner();
        Ok(LockEnteredMsg {
            object_name: reply.object_name,
            entering_key: reply.entering_key,
        })
    }

    async fn get_max_ticket(&self, peer: &str, req: GetMaxTicketMsg) -> Result<MaxTicketMsg> {
        let mut client = self.client_for(peer).await?;
        let reply = client
            .get_max_ticket(pb::GetMaxTicketRequest {
                object_name: req.object_name,
            })
            .await
            .map_err(|_| Self::xmit("GET_MAX_TICKET", peer))?
            .into_inner();
        Ok(MaxTicketMsg {
            object_name: reply.object_name,
            max_ticket: reply.max_ticket,
        })
    }

    async fn add_ticket(&self, peer: &str, req: AddTicketMsg) -> Result<TicketAddedMsg> {
        let mut client = self.client_for(peer).await?;
        let reply = client
            .add_ticket(pb::AddTicketRequest {
                object_name: req.object_name,
                entering_key: req.entering_key,
                ticket_key: req.ticket_key,
            })
            .await
            .map_err(|_| Self::xmit("ADD_TICKET", peer))?
            .into_inner();
        Ok(TicketAddedMsg {
            object_name: reply.object_name,
            ticket_key: reply.ticket_key,
        })
    }

    async fn lock_exiting(&self, peer: &str, req: LockExitingMsg) -> Result<()> {
        let mut client = self.client_for(peer).await?;
        client
            .lock_exiting(pb::LockExitingRequest {
                object_name: req.object_name,
                entering_key: req.entering_key,
            })
            .await
            .map_err(|_| Self::xmit("LOCK_EXITING", peer))?;
        Ok(())
    }

    async fn ticket_ready(&self, peer: &str, req: TicketReadyMsg) -> Result<()> {
        let mut client = self.client_for(peer).await?;
        client
            .ticket_ready(pb::TicketReadyRequest {
                object_name: req.object_name,
                ticket_key: req.ticket_key,
            })
            .await
            .map_err(|_| Self::xmit("TICKET_READY", peer))?;
        Ok(())
    }

    async fn activate_lock(&self, peer: &str, req: ActivateLockMsg) -> Result<LockActivatedMsg> {
        let mut client = self.client_for(peer).await?;
        let reply = client
            .activate_lock(pb::ActivateLockRequest {
                object_name: req.object_name,
            })
            .await
            .map_err(|_| Self::xmit("ACTIVATE_LOCK", peer))?
            .into_inner();
        Ok(LockActivatedMsg {
            object_name: reply.object_name,
            first_ticket_key: reply.first_ticket_key,
        })
    }

    async fn drop_ticket(&self, peer: &str, req: DropTicketMsg) -> Result<()> {
        let mut client = self.client_for(peer).await?;
        client
            .drop_ticket(pb::DropTicketRequest {
                object_name: req.object_name,
                ticket_key: req.ticket_key,
            })
            .await
            .map_err(|_| Self::xmit("DROP_TICKET", peer))?;
        Ok(())
    }

    async fn lock_tickets(&self, peer: &str, req: LockTicketsMsg) -> Result<()> {
        let mut client = self.client_for(peer).await?;
        client
            .lock_tickets(pb::LockTicketsRequest {
                tickets: req.tickets,
            })
            .await
            .map_err(|_| Self::xmit("LOCK_TICKETS", peer))?;
        Ok(())
    }

    async fn lock_leaders(&self, peer: &str, req: LockLeadersMsg) -> Result<()> {
        let mut client = self.client_for(peer).await?;
        client
            .lock_leaders(pb::LockLeadersRequest {
                election_date: req.election_date,
                leader0: req.leader0,
                leader1: req.leader1,
                leader2: req.leader2,
            })
            .await
            .map_err(|_| Self::xmit("LOCK_LEADERS", peer))?;
        Ok(())
    }

    async fn lock_started(&self, peer: &str, req: LockStartedMsg) -> Result<()> {
        let mut client = self.client_for(peer).await?;
        client
            .lock_started(pb::LockStartedRequest {
                node_id: req.node_id,
            })
            .await
            .map_err(|_| Self::xmit("LOCK_STARTED", peer))?;
        Ok(())
    }

    async fn forward_lock(&self, peer: &str, req: ForwardLockMsg) -> Result<()> {
        let mut client = self.client_for(peer).await?;
        client
            .forward_lock(pb::ForwardLockRequest {
                object_name: req.object_name,
                entering_key: req.entering_key,
                tag: req.tag as u32,
                serial: req.serial,
                timeout: req.timeout,
                duration: req.duration,
                unlock_duration: req.unlock_duration,
                home_node: req.home_node,
            })
            .await
            .map_err(|_| Self::xmit("FORWARD_LOCK", peer))?;
        Ok(())
    }
}
