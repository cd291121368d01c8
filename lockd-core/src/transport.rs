//! The transport seam (§6.7) — replaces the message-bus "communicator" the
//! original daemon sat on top of. Peer-to-peer protocol steps become unary
//! RPCs with a direct reply; client-bound messages are routed by name
//! since the leader servicing a ticket need not be the client's home node.

use async_trait::async_trait;

use crate::error::Result;
use crate::messages::*;

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn lock_entering(&self, peer: &str, req: LockEnteringMsg) -> Result<LockEnteredMsg>;
    async fn get_max_ticket(&self, peer: &str, req: GetMaxTicketMsg) -> Result<MaxTicketMsg>;
    async fn add_ticket(&self, peer: &str, req: AddTicketMsg) -> Result<TicketAddedMsg>;
    async fn lock_exiting(&self, peer: &str, req: LockExitingMsg) -> Result<()>;
    async fn ticket_ready(&self, peer: &str, req: TicketReadyMsg) -> Result<()>;
    async fn activate_lock(&self, peer: &str, req: ActivateLockMsg) -> Result<LockActivatedMsg>;
    async fn drop_ticket(&self, peer: &str, req: DropTicketMsg) -> Result<()>;
    async fn lock_tickets(&self, peer: &str, req: LockTicketsMsg) -> Result<()>;
    async fn lock_leaders(&self, peer: &str, req: LockLeadersMsg) -> Result<()>;
    async fn lock_started(&self, peer: &str, req: LockStartedMsg) -> Result<()>;
    /// Leader-loss reassignment (§4.4): hand an orphaned LOCK to the new
    /// owner instead of restarting it on this node.
    async fn forward_lock(&self, peer: &str, req: ForwardLockMsg) -> Result<()>;
}

#[async_trait]
pub trait ClientRouter: Send + Sync {
    /// Deliver a message to whichever node holds the live client stream
    /// for `home_node`.
    async fn deliver(&self, home_node: &str, msg: ClientMessage) -> Result<()>;
}

/// A single-node transport where "peer" always means "self": every call is
/// answered by a direct, synchronous hand-off rather than a network round
/// trip. Used by single-node tests and the one-leader fast path of §4.4
/// (when `leaders.len() == 1`, the owner never actually needs a peer).
pub struct NullPeerTransport;

#[async_trait]
impl PeerTransport for NullPeerTransport {
    async fn lock_entering(&self, peer: &str, _req: LockEnteringMsg) -> Result<LockEnteredMsg> {
        unreachable!("NullPeerTransport has no peers to contact: {peer}")
    }
    async fn get_max_ticket(&self, peer: &str, _req: GetMaxTicketMsg) -> Result<MaxTicketMsg> {
        unreachable!("NullPeerTransport has no peers to contact: {peer}")
    }
    async fn add_ticket(&self, peer: &str, _req: AddTicketMsg) -> Result<TicketAddedMsg> {
        unreachable!("NullPeerTransport has no peers to contact: {peer}")
    }
    async fn lock_exiting(&self, peer: &str, _req: LockExitingMsg) -> Result<()> {
        unreachable!("NullPeerTransport has no peers to contact: {peer}")
    }
    async fn ticket_ready(&self, peer: &str, _req: TicketReadyMsg) -> Result<()> {
        unreachable!("NullPeerTransport has no peers to contact: {peer}")
    }
    async fn activate_lock(&self, peer: &str, _req: ActivateLockMsg) -> Result<LockActivatedMsg> {
        unreachable!("NullPeerTransport has no peers to contact: {peer}")
    }
    async fn drop_ticket(&self, peer: &str, _req: DropTicketMsg) -> Result<()> {
        unreachable!("NullPeerTransport has no peers to contact: {peer}")
    }
    async fn lock_tickets(&self, peer: &str, _req: LockTicketsMsg) -> Result<()> {
        unreachable!("NullPeerTransport has no peers to contact: {peer}")
    }
    async fn lock_leaders(&self, peer: &str, _req: LockLeadersMsg) -> Result<()> {
        unreachable!("NullPeerTransport has no peers to contact: {peer}")
    }
    async fn lock_started(&self, peer: &str, _req: LockStartedMsg) -> Result<()> {
        unreachable!("NullPeerTransport has no peers to contact: {peer}")
    }
    async fn forward_lock(&self, peer: &str, _req: ForwardLockMsg) -> Result<()> {
        unreachable!("NullPeerTransport has no peers to contact: {peer}")
    }
}

/// Records every message handed to it instead of delivering it anywhere —
/// the client-side counterpart used in engine tests to assert what the
/// engine tried to send without standing up a real stream.
#[derive(Default)]
pub struct RecordingClientRouter {
    pub sent: tokio::sync::Mutex<Vec<(String, ClientMessage)>>,
}

#[async_trait]
impl ClientRouter for RecordingClientRouter {
    async fn deliver(&self, home_node: &str, msg: ClientMessage) -> Result<()> {
        self.sent
            .lock()
            .await
            .push((home_node.to_string(), msg));
        Ok(())
    }
}

/// Records LOCK_TICKETS and FORWARD_LOCK calls instead of dialing anywhere —
/// used by engine tests that exercise leader-loss reassignment (§4.4) and
/// need to see what the engine tried to broadcast.
#[derive(Default)]
pub struct RecordingPeerTransport {
    pub lock_tickets_calls: tokio::sync::Mutex<Vec<(String, LockTicketsMsg)>>,
    pub forward_lock_calls: tokio::sync::Mutex<Vec<(String, ForwardLockMsg)>>,
}

#[async_trait]
impl PeerTransport for RecordingPeerTransport {
    async fn lock_entering(&self, _peer: &str, req: LockEnteringMsg) -> Result<LockEnteredMsg> {
        Ok(LockEnteredMsg {
            object_name: req.object_name,
            entering_key: req.entering_key,
        })
    }
    async fn get_max_ticket(&self, _peer: &str, req: GetMaxTicketMsg) -> Result<MaxTicketMsg> {
        Ok(MaxTicketMsg {
            object_name: req.object_name,
            max_ticket: 0,
        })
    }
    async fn add_ticket(&self, _peer: &str, req: AddTicketMsg) -> Result<TicketAddedMsg> {
        Ok(TicketAddedMsg {
            object_name: req.object_name,
            ticket_key: req.ticket_key,
        })
    }
    async fn lock_exiting(&self, _peer: &str, _req: LockExitingMsg) -> Result<()> {
        Ok(())
    }
    async fn ticket_ready(&self, _peer: &str, _req: TicketReadyMsg) -> Result<()> {
        Ok(())
    }
    async fn activate_lock(&self, _peer: &str, req: ActivateLockMsg) -> Result<LockActivatedMsg> {
        Ok(LockActivatedMsg {
            object_name: req.object_name,
            first_ticket_key: None,
        })
    }
    async fn drop_ticket(&self, _peer: &str, _req: DropTicketMsg) -> Result<()> {
        Ok(())
    }
    async fn lock_tickets(&self, peer: &str, req: LockTicketsMsg) -> Result<()> {
        self.lock_tickets_calls.lock().await.push((peer.to_string(), req));
        Ok(())
    }
    async fn lock_leaders(&self, _peer: &str, _req: LockLeadersMsg) -> Result<()> {
        Ok(())
    }
    async fn lock_started(&self, _peer: &str, _req: LockStartedMsg) -> Result<()> {
        Ok(())
    }
    async fn forward_lock(&self, peer: &str, req: ForwardLockMsg) -> Result<()> {
        self.forward_lock_calls.lock().await.push((peer.to_string(), req));
        Ok(())
    }
}
