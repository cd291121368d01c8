//! The engine facade: orchestrates the replicated Bakery protocol (§4.4),
//! readiness (§4.1), the message cache (§4.7), and timer sweeps (§4.6).
//!
//! Grounded on the teacher's `Engine` — a facade over `Arc<dyn Store>` with
//! guarded async methods and a `tick_instance`-style sweep — generalized
//! from one BPMN process instance to many concurrently-tracked tickets.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::MessageCache;
use crate::elector::{self, LeaderSet};
use crate::error::{FailureReason, LockdError, Result};
use crate::messages::*;
use crate::node::{Node, NodeRegistry};
use crate::readiness::{self, ReadinessInputs, ReadinessTracker};
use crate::store::TicketStore;
use crate::ticket::{self, FailureState, Ticket};
use crate::timer;
use crate::transport::{ClientRouter, PeerTransport};

struct EngineState {
    self_node: Node,
    registry: NodeRegistry,
    leaders: Option<LeaderSet>,
    readiness: ReadinessTracker,
    cache: MessageCache,
    bus_connected: bool,
}

/// One coordinator node's engine. Cheaply cloneable (`Arc` internally), the
/// way the teacher's `Engine` is handed to the gRPC service layer.
pub struct Engine {
    store: Arc<dyn TicketStore>,
    peers: Arc<dyn PeerTransport>,
    router: Arc<dyn ClientRouter>,
    state: Mutex<EngineState>,
}

impl Engine {
    pub fn new(
        self_node: Node,
        total_nodes: usize,
        store: Arc<dyn TicketStore>,
        peers: Arc<dyn PeerTransport>,
        router: Arc<dyn ClientRouter>,
    ) -> Self {
        let mut registry = NodeRegistry::new(total_nodes);
        let mut me = self_node.clone();
        me.is_self = true;
        me.connected = true;
        registry.insert(me);
        Self {
            store,
            peers,
            router,
            state: Mutex::new(EngineState {
                self_node,
                registry,
                leaders: None,
                readiness: ReadinessTracker::new(),
                cache: MessageCache::new(),
                bus_connected: false,
            }),
        }
    }

    // ---- cluster membership & election (§4.1, §4.2) ----

    pub async fn on_bus_connected(&self) {
        let mut state = self.state.lock().await;
        state.bus_connected = true;
        info!("message bus connected");
        self.recompute_readiness_locked(&mut state).await;
    }

    pub async fn on_bus_disconnected(&self) {
        let mut state = self.state.lock().await;
        state.bus_connected = false;
        warn!("message bus disconnected");
        self.recompute_readiness_locked(&mut state).await;
    }

    pub async fn on_peer_seen(&self, node: Node) {
        let mut state = self.state.lock().await;
        state.registry.insert(node);
        self.maybe_elect_locked(&mut state, 0).await;
        self.recompute_readiness_locked(&mut state).await;
    }

    pub async fn on_peer_lost(&self, name: &str) {
        let mut state = self.state.lock().await;
        let was_leader = state
            .leaders
            .as_ref()
            .map(|l| l.contains(name))
            .unwrap_or(false);
        state.registry.remove(name);
        if was_leader {
            if let Some(leaders) = &mut state.leaders {
                leaders.leaders.retain(|n| n.name != name);
            }
            warn!(node = name, "leader lost, re-electing");
            self.maybe_elect_locked(&mut state, 0).await;
            self.synchronize_leaders(&mut state).await;
        }
        self.recompute_readiness_locked(&mut state).await;
    }

    async fn maybe_elect_locked(&self, state: &mut EngineState, election_date: u64) {
        if !state.registry.is_election_owner(&state.self_node.ip) {
            return;
        }
        let have_full_set = state
            .leaders
            .as_ref()
            .map(|l| l.leaders.len() == elector::MAX_LEADERS)
            .unwrap_or(false);
        if have_full_set {
            return;
        }
        let current: Vec<String> = state
            .leaders
            .as_ref()
            .map(|l| l.leaders.iter().map(|n| n.name.clone()).collect())
            .unwrap_or_default();
        match elector::elect(&state.registry, &current, election_date) {
            Ok(result) => {
                state.leaders = Some(result);
            }
            Err(err) => {
                warn!(error = %err, "election failed, staying leaderless");
            }
        }
    }

    /// Adopt an election result announced by the owning node (§4.2).
    pub async fn on_lock_leaders(&self, msg: LockLeadersMsg) {
        let mut state = self.state.lock().await;
        let self_name = state.self_node.name.clone();
        let mut names = vec![msg.leader0];
        names.extend(msg.leader1);
        names.extend(msg.leader2);
        let leaders = names
            .into_iter()
            .filter_map(|id| {
                crate::node::Node::parse_id(&id).ok().map(|p| {
                    let mut n = Node::new(p.priority, p.ip, p.pid, p.name, 0);
                    n.random = p.random;
                    n.is_self = n.name == self_name;
                    n.connected = true;
                    n
                })
            })
            .collect();
        state.leaders = Some(LeaderSet {
            leaders,
            election_date: msg.election_date,
        });
        self.recompute_readiness_locked(&mut state).await;
    }

    async fn recompute_readiness_locked(&self, state: &mut EngineState) {
        let inputs = ReadinessInputs::from_registry(
            &state.registry,
            state.leaders.as_ref(),
            state.bus_connected,
        );
        let ready = readiness::is_ready(inputs);
        if let Some(transitioned_to) = state.readiness.observe(ready) {
            info!(
                ready = transitioned_to,
                known = inputs.known_nodes,
                total = inputs.total_nodes,
                leaders = inputs.leader_count,
                "readiness transition"
            );
            let wire = if transitioned_to {
                ReadinessWire::LockReady
            } else {
                ReadinessWire::NoLock
            };
            let _ = self
                .router
                .deliver(&state.self_node.name, ClientMessage::Readiness(wire))
                .await;
            if transitioned_to {
                self.drain_cache(state).await;
            }
        }
    }

    async fn drain_cache(&self, state: &mut EngineState) {
        let pending = state.cache.drain_all();
        for cached in pending {
            if let Err(err) = self
                .start_lock(cached.request.clone(), cached.home_node.clone())
                .await
            {
                warn!(error = %err, "replay of cached lock request failed");
            }
        }
    }

    fn is_ready_now(&self, state: &EngineState) -> bool {
        let inputs = ReadinessInputs::from_registry(
            &state.registry,
            state.leaders.as_ref(),
            state.bus_connected,
        );
        readiness::is_ready(inputs)
    }

    // ---- owner-side protocol entry point (§4.4) ----

    /// Handle an inbound `LOCK` from a client, addressed to this node. If
    /// the engine isn't ready yet, the request is cached (§4.7) instead.
    pub async fn start_lock(&self, request: LockRequest, home_node: String) -> Result<()> {
        let mut state = self.state.lock().await;
        if !self.is_ready_now(&state) {
            debug!(object = %request.object_name, "engine not ready, caching request");
            state.cache.push(request, home_node);
            return Ok(());
        }
        let self_name = state.self_node.name.clone();
        drop(state);

        let mut ticket = Ticket::new(
            &request.object_name,
            request.tag,
            &self_name,
            "lockd",
            request.pid,
            &self_name,
            &home_node,
            5,
            request.duration.unwrap_or(5),
            request.unlock_duration.unwrap_or(5),
        );
        ticket.obtention_timeout = request.timeout;
        ticket.serial = request.serial;
        self.enter_ticket(ticket, home_node).await
    }

    /// Owner-side duplicate-lock guard (§4.4, §7), run before a ticket is
    /// ever admitted into ENTERING. A retry with the same serial as an
    /// already-tracked request is silently accepted; anything else
    /// addressed at an object+entering_key already in flight is rejected.
    async fn enter_ticket(&self, ticket: Ticket, home_node: String) -> Result<()> {
        if let Some(existing) = self
            .store
            .get_entering(&ticket.object_name, &ticket.entering_key)
            .await?
        {
            if existing.serial == ticket.serial {
                debug!(
                    object = %ticket.object_name,
                    entering_key = %ticket.entering_key,
                    "duplicate LOCK with matching serial, treating as a retry"
                );
                return Ok(());
            }
            return self.reject_duplicate(&ticket, home_node).await;
        }
        if self
            .store
            .tickets_for_object(&ticket.object_name)
            .await?
            .iter()
            .any(|t| t.entering_key == ticket.entering_key)
        {
            return self.reject_duplicate(&ticket, home_node).await;
        }
        self.run_entering(ticket, home_node).await
    }

    async fn reject_duplicate(&self, ticket: &Ticket, home_node: String) -> Result<()> {
        let err = LockdError::Duplicate {
            object_name: ticket.object_name.clone(),
            entering_key: ticket.entering_key.clone(),
        };
        warn!(error = %err, "rejecting duplicate LOCK");
        self.notify_lock_failed(
            &ticket.object_name,
            ticket.tag,
            &ticket.entering_key,
            err.failure_reason().unwrap(),
            home_node,
        )
        .await
    }

    async fn peer_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .leaders
            .as_ref()
            .map(|l| {
                l.leaders
                    .iter()
                    .filter(|n| !n.is_self)
                    .map(|n| n.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// §4.4 step 1: ENTERING. Tries each peer leader in turn and proceeds
    /// on the first acknowledgement — one ack plus the owner's own vote is
    /// already strict majority of at most 3 leaders, so there's no value
    /// in waiting for more.
    async fn run_entering(&self, mut ticket: Ticket, home_node: String) -> Result<()> {
        let peers = self.peer_names().await;
        let msg = LockEnteringMsg {
            object_name: ticket.object_name.clone(),
            entering_key: ticket.entering_key.clone(),
            tag: ticket.tag,
            source: ticket.entering_key.clone(),
            serial: ticket.serial,
            home_node: ticket.home_node.clone(),
        };
        let mut acked = peers.is_empty();
        for peer in &peers {
            match self.peers.lock_entering(peer, msg.clone()).await {
                Ok(_) => {
                    acked = true;
                    break;
                }
                Err(err) => warn!(%peer, error = %err, "LOCK_ENTERING failed, trying next peer"),
            }
        }
        if !acked {
            return self
                .fail_and_notify(ticket, FailureReason::TransmissionError, home_node)
                .await;
        }
        self.store.insert_entering(ticket.clone()).await?;
        self.run_numbering(ticket, home_node).await
    }

    /// §4.4 step 2: NUMBERING.
    async fn run_numbering(&self, mut ticket: Ticket, home_node: String) -> Result<()> {
        let peers = self.peer_names().await;
        let mut max_seen = self.store.last_ticket_number(&ticket.object_name).await?;
        for peer in &peers {
            if let Ok(reply) = self
                .peers
                .get_max_ticket(peer, GetMaxTicketMsg {
                    object_name: ticket.object_name.clone(),
                })
                .await
            {
                max_seen = max_seen.max(reply.max_ticket);
            }
        }
        let our_ticket = max_seen
            .checked_add(1)
            .ok_or_else(|| LockdError::InvariantViolation("ticket_number wrapped".into()))?;

        self.store
            .remove_entering(&ticket.object_name, &ticket.entering_key)
            .await?;
        ticket.assign_ticket_number(our_ticket);
        ticket.get_max_ticket = true;
        self.store.insert_ticket(ticket.clone()).await?;

        let add_msg = AddTicketMsg {
            object_name: ticket.object_name.clone(),
            entering_key: ticket.entering_key.clone(),
            ticket_key: ticket.ticket_key.clone().unwrap(),
        };
        for peer in &peers {
            let _ = self.peers.add_ticket(peer, add_msg.clone()).await;
        }
        ticket.added_ticket = true;
        self.store.replace_ticket(ticket.clone()).await?;
        self.run_exiting(ticket, home_node).await
    }

    /// §4.4 step 3 & 4: EXITING, then wait for `still_entering` to empty.
    async fn run_exiting(&self, mut ticket: Ticket, home_node: String) -> Result<()> {
        let peers = self.peer_names().await;
        let snapshot = self
            .store
            .entering_snapshot(&ticket.object_name)
            .await?
            .into_iter()
            .map(|t| t.entering_key)
            .filter(|k| *k != ticket.entering_key)
            .collect::<std::collections::BTreeSet<_>>();
        ticket.still_entering = snapshot;

        let exit_msg = LockExitingMsg {
            object_name: ticket.object_name.clone(),
            entering_key: ticket.entering_key.clone(),
        };
        for peer in &peers {
            let _ = self.peers.lock_exiting(peer, exit_msg.clone()).await;
        }
        self.store.replace_ticket(ticket.clone()).await?;
        self.maybe_ready(ticket, home_node).await
    }

    async fn maybe_ready(&self, mut ticket: Ticket, home_node: String) -> Result<()> {
        if !ticket.still_entering.is_empty() {
            return Ok(());
        }
        ticket.ticket_ready = true;
        self.store.replace_ticket(ticket.clone()).await?;
        let peers = self.peer_names().await;
        let ready_msg = TicketReadyMsg {
            object_name: ticket.object_name.clone(),
            ticket_key: ticket.ticket_key.clone().unwrap(),
        };
        for peer in &peers {
            let _ = self.peers.ticket_ready(peer, ready_msg.clone()).await;
        }
        self.activate_first_lock(&ticket.object_name, home_node).await
    }

    /// §4.4 step 5: activation. Re-run whenever the first ticket for an
    /// object might have changed.
    async fn activate_first_lock(&self, object_name: &str, home_node: String) -> Result<()> {
        let Some(first) = self.store.first_ticket(object_name).await? else {
            return Ok(());
        };
        if !first.ticket_ready {
            return Ok(());
        }
        let peers = self.peer_names().await;
        let mut consensus = true;
        for peer in &peers {
            match self
                .peers
                .activate_lock(peer, ActivateLockMsg {
                    object_name: object_name.to_string(),
                })
                .await
            {
                Ok(reply) if reply.first_ticket_key.as_deref() == first.ticket_key.as_deref() => {}
                _ => {
                    consensus = false;
                    break;
                }
            }
        }
        if !consensus {
            return Ok(());
        }

        let mut ticket = first;
        let now = now();
        ticket.locked = true;
        ticket.lock_timeout_date = Some(now + ticket.lock_duration);
        ticket.unlocked_timeout_date = Some(now + ticket.lock_duration + ticket.unlock_duration);
        self.store.replace_ticket(ticket.clone()).await?;

        let locked = Locked {
            object_name: ticket.object_name.clone(),
            tag: ticket.tag,
            timeout_date: ticket.lock_timeout_date.unwrap(),
            unlocked_date: ticket.unlocked_timeout_date.unwrap(),
        };
        self.router
            .deliver(&home_node, ClientMessage::Locked(locked))
            .await?;
        Ok(())
    }

    async fn fail_and_notify(
        &self,
        ticket: Ticket,
        reason: FailureReason,
        home_node: String,
    ) -> Result<()> {
        let key = ticket.ticket_key.clone().unwrap_or(ticket.entering_key.clone());
        self.notify_lock_failed(&ticket.object_name, ticket.tag, &key, reason, home_node)
            .await
    }

    async fn notify_lock_failed(
        &self,
        object_name: &str,
        tag: u16,
        key: &str,
        reason: FailureReason,
        home_node: String,
    ) -> Result<()> {
        let failed = LockFailed {
            object_name: object_name.to_string(),
            tag,
            key: key.to_string(),
            error: reason.into(),
            description: None,
        };
        self.router
            .deliver(&home_node, ClientMessage::LockFailed(failed))
            .await?;
        Ok(())
    }

    // ---- owner-side release (§4.4 steps 6-7) ----

    /// Resolve an inbound `UnlockRequest` (which only carries `pid`, not a
    /// ticket key) to the ticket this node's client owns, then release it.
    pub async fn unlock_request(
        &self,
        req: &UnlockRequest,
        home_node: String,
    ) -> Result<()> {
        let self_name = { self.state.lock().await.self_node.name.clone() };
        let key = ticket::entering_key(&self_name, req.pid);
        let found = self
            .store
            .tickets_for_object(&req.object_name)
            .await?
            .into_iter()
            .find(|t| t.entering_key == key);
        let Some(ticket) = found else {
            return Err(LockdError::UnknownTicket(key));
        };
        let ticket_key = ticket.ticket_key.clone().ok_or_else(|| {
            LockdError::InvariantViolation("locked ticket missing its ticket_key".into())
        })?;
        self.unlock(&req.object_name, &ticket_key, home_node).await
    }

    pub async fn unlock(&self, object_name: &str, ticket_key: &str, home_node: String) -> Result<()> {
        let Some(ticket) = self.store.get_ticket(object_name, ticket_key).await? else {
            return Err(LockdError::UnknownTicket(ticket_key.to_string()));
        };
        let peers = self.peer_names().await;
        let drop_msg = DropTicketMsg {
            object_name: object_name.to_string(),
            ticket_key: ticket_key.to_string(),
        };
        for peer in &peers {
            // Idempotent on the peer side: a duplicate/late DROP_TICKET is
            // harmless, so failures here are not retried (§9 open question 3).
            let _ = self.peers.drop_ticket(peer, drop_msg.clone()).await;
        }
        self.store.remove_ticket(object_name, ticket_key).await?;
        let unlocked = Unlocked {
            object_name: object_name.to_string(),
            tag: ticket.tag,
            timed_out: false,
            unlocked_date: now(),
        };
        self.router
            .deliver(&home_node, ClientMessage::Unlocked(unlocked))
            .await?;
        self.activate_first_lock(object_name, home_node).await
    }

    // ---- replica-side handlers (§4.4 "Replica rules") ----

    pub async fn on_lock_entering(&self, msg: LockEnteringMsg) -> Result<LockEnteredMsg> {
        let (server_name, pid) = msg
            .entering_key
            .rsplit_once('/')
            .map(|(server, pid)| (server.to_string(), pid.parse().unwrap_or(0)))
            .unwrap_or((msg.entering_key.clone(), 0));
        let mut ticket = Ticket::new(
            &msg.object_name,
            msg.tag,
            &server_name,
            "lockd",
            pid,
            &msg.source,
            &msg.home_node,
            5,
            5,
            5,
        );
        ticket.serial = msg.serial;
        self.store.insert_entering(ticket).await?;
        Ok(LockEnteredMsg {
            object_name: msg.object_name,
            entering_key: msg.entering_key,
        })
    }

    /// Owner-side entry point for a LOCK handed off by the previous owner
    /// after leader-loss reassignment (§4.4), as an alternative to
    /// `start_lock` for requests that never originated on this node.
    pub async fn on_forward_lock(&self, msg: ForwardLockMsg) -> Result<()> {
        let (server_name, pid) = msg
            .entering_key
            .rsplit_once('/')
            .map(|(server, pid)| (server.to_string(), pid.parse().unwrap_or(0)))
            .unwrap_or((msg.entering_key.clone(), 0));

        let mut state = self.state.lock().await;
        if !self.is_ready_now(&state) {
            debug!(object = %msg.object_name, "engine not ready, caching forwarded LOCK");
            let request = LockRequest {
                object_name: msg.object_name,
                tag: msg.tag,
                pid,
                serial: msg.serial,
                timeout: msg.timeout,
                duration: msg.duration,
                unlock_duration: msg.unlock_duration,
                kind: LockKind::Default,
            };
            state.cache.push(request, msg.home_node);
            return Ok(());
        }
        let self_name = state.self_node.name.clone();
        drop(state);

        let mut ticket = Ticket::new(
            &msg.object_name,
            msg.tag,
            &server_name,
            "lockd",
            pid,
            &self_name,
            &msg.home_node,
            5,
            msg.duration.unwrap_or(5),
            msg.unlock_duration.unwrap_or(5),
        );
        ticket.obtention_timeout = msg.timeout;
        ticket.serial = msg.serial;
        self.enter_ticket(ticket, msg.home_node).await
    }

    /// Apply a LOCK_TICKETS broadcast (§6.2, §4.4 leader-loss reassignment):
    /// upsert every serialized ticket into the numbered-ticket map,
    /// regardless of whether it was already tracked here.
    pub async fn on_lock_tickets(&self, msg: LockTicketsMsg) -> Result<()> {
        for line in msg.tickets {
            let ticket = Ticket::unserialize(&line).map_err(|err| {
                LockdError::InvariantViolation(format!("bad LOCK_TICKETS payload: {err}"))
            })?;
            self.store.replace_ticket(ticket).await?;
        }
        Ok(())
    }

    /// Resume an ENTERING ticket once its ALIVE probe (§4.4) gets a reply,
    /// restarting the Bakery protocol from scratch now that the client is
    /// confirmed to still be around.
    pub async fn on_alive_reply(&self, object_name: &str, tag: u16) -> Result<()> {
        let entering = self.store.all_entering().await?;
        let Some(mut ticket) = entering
            .into_iter()
            .find(|t| t.object_name == object_name && t.tag == tag && t.alive_timeout != 0)
        else {
            return Ok(());
        };
        self.store
            .remove_entering(&ticket.object_name, &ticket.entering_key)
            .await?;
        ticket.alive_timeout = 0;
        let home_node = ticket.home_node.clone();
        self.enter_ticket(ticket, home_node).await
    }

    pub async fn on_get_max_ticket(&self, msg: GetMaxTicketMsg) -> Result<MaxTicketMsg> {
        let max_ticket = self.store.last_ticket_number(&msg.object_name).await?;
        Ok(MaxTicketMsg {
            object_name: msg.object_name,
            max_ticket,
        })
    }

    pub async fn on_add_ticket(&self, msg: AddTicketMsg) -> Result<TicketAddedMsg> {
        if let Some(mut ticket) = self
            .store
            .remove_entering(&msg.object_name, &msg.entering_key)
            .await?
        {
            ticket.ticket_key = Some(msg.ticket_key.clone());
            ticket.ticket_number = ticket::ticket_key_number(&msg.ticket_key).unwrap_or(0);
            ticket.added_ticket = true;
            self.store.insert_ticket(ticket).await?;
        }
        Ok(TicketAddedMsg {
            object_name: msg.object_name,
            ticket_key: msg.ticket_key,
        })
    }

    pub async fn on_lock_exiting(&self, msg: LockExitingMsg) -> Result<()> {
        self.store
            .remove_entering(&msg.object_name, &msg.entering_key)
            .await?;
        for mut t in self.store.tickets_for_object(&msg.object_name).await? {
            if t.still_entering.remove(&msg.entering_key) {
                self.store.replace_ticket(t).await?;
            }
        }
        Ok(())
    }

    pub async fn on_ticket_ready(&self, msg: TicketReadyMsg) -> Result<()> {
        if let Some(mut t) = self.store.get_ticket(&msg.object_name, &msg.ticket_key).await? {
            t.ticket_ready = true;
            self.store.replace_ticket(t).await?;
        }
        Ok(())
    }

    pub async fn on_activate_lock(&self, msg: ActivateLockMsg) -> Result<LockActivatedMsg> {
        let first = self.store.first_ticket(&msg.object_name).await?;
        Ok(LockActivatedMsg {
            object_name: msg.object_name,
            first_ticket_key: first.and_then(|t| t.ticket_key),
        })
    }

    pub async fn on_drop_ticket(&self, msg: DropTicketMsg) -> Result<()> {
        self.store.remove_ticket(&msg.object_name, &msg.ticket_key).await?;
        Ok(())
    }

    // ---- leader-loss reassignment (§4.4 "synchronize_leaders") ----

    async fn synchronize_leaders(&self, state: &mut EngineState) {
        let Some(leaders) = state.leaders.clone() else {
            return;
        };
        if leaders.leaders.len() <= 1 {
            return;
        }
        let Some(new_owner) = leaders.first().cloned() else {
            return;
        };
        let self_is_new_owner = new_owner.is_self;
        let current_leader_names: std::collections::BTreeSet<_> =
            leaders.leaders.iter().map(|n| n.name.clone()).collect();
        let peer_names: Vec<String> = leaders
            .leaders
            .iter()
            .filter(|n| !n.is_self)
            .map(|n| n.name.clone())
            .collect();

        let orphaned_entering = match self.store.all_entering().await {
            Ok(t) => t,
            Err(err) => {
                warn!(error = %err, "failed to scan entering tickets during leader-loss reassignment");
                Vec::new()
            }
        };
        for ticket in orphaned_entering {
            if current_leader_names.contains(&ticket.owner) {
                continue;
            }
            if self
                .store
                .remove_entering(&ticket.object_name, &ticket.entering_key)
                .await
                .is_err()
            {
                continue;
            }
            if self_is_new_owner {
                self.reinject_orphaned(ticket, &new_owner.name).await;
            } else {
                self.forward_orphaned(&ticket, &new_owner.name).await;
            }
        }

        let orphaned_tickets = match self.store.all_tickets().await {
            Ok(t) => t,
            Err(err) => {
                warn!(error = %err, "failed to scan tickets during leader-loss reassignment");
                return;
            }
        };
        for ticket in orphaned_tickets {
            if current_leader_names.contains(&ticket.owner) {
                continue;
            }
            if ticket.locked {
                info!(
                    object = %ticket.object_name,
                    ticket_key = ?ticket.ticket_key,
                    "transferring locked ticket to new owner"
                );
                let mut t = ticket.clone();
                t.owner = new_owner.name.clone();
                if self.store.replace_ticket(t.clone()).await.is_err() {
                    continue;
                }
                let serialized = t.serialize();
                for peer in &peer_names {
                    let _ = self
                        .peers
                        .lock_tickets(peer, LockTicketsMsg {
                            tickets: vec![serialized.clone()],
                        })
                        .await;
                }
            } else {
                if self
                    .store
                    .remove_ticket(&ticket.object_name, ticket.ticket_key.as_deref().unwrap_or(""))
                    .await
                    .is_err()
                {
                    continue;
                }
                if self_is_new_owner {
                    self.reinject_orphaned(ticket, &new_owner.name).await;
                } else {
                    self.forward_orphaned(&ticket, &new_owner.name).await;
                }
            }
        }
    }

    /// Restart the Bakery protocol for an orphaned, not-yet-locked ticket on
    /// the new owner: reset it back to pre-ENTERING state, keep the
    /// original serial so a legitimate retry is still recognized, and hold
    /// it until an ALIVE probe to the client gets a reply (§4.4).
    async fn reinject_orphaned(&self, mut ticket: Ticket, new_owner_name: &str) {
        info!(
            object = %ticket.object_name,
            entering_key = %ticket.entering_key,
            "re-injecting orphaned not-yet-locked ticket"
        );
        ticket.owner = new_owner_name.to_string();
        ticket.ticket_key = None;
        ticket.ticket_number = ticket::NO_TICKET;
        ticket.added_ticket = false;
        ticket.added_ticket_quorum = false;
        ticket.ticket_ready = false;
        ticket.locked = false;
        ticket.still_entering.clear();

        let now_ts = now();
        ticket.alive_timeout = (now_ts + 5).min(now_ts + ticket.obtention_timeout);
        let home_node = ticket.home_node.clone();
        let object_name = ticket.object_name.clone();
        let tag = ticket.tag;
        if let Err(err) = self.store.insert_entering(ticket).await {
            warn!(error = %err, object = %object_name, "failed to persist re-injected ticket");
            return;
        }
        info!(object = %object_name, tag, "sending ALIVE probe before restarting protocol");
        let _ = self
            .router
            .deliver(&home_node, ClientMessage::Alive { object_name, tag })
            .await;
    }

    /// Hand an orphaned, not-yet-locked ticket to the new owner instead of
    /// restarting it here (§4.4 "forward to leaders[0]").
    async fn forward_orphaned(&self, ticket: &Ticket, new_owner_name: &str) {
        info!(
            object = %ticket.object_name,
            entering_key = %ticket.entering_key,
            new_owner = new_owner_name,
            "forwarding orphaned ticket to new owner"
        );
        let _ = self
            .peers
            .forward_lock(new_owner_name, ForwardLockMsg {
                object_name: ticket.object_name.clone(),
                entering_key: ticket.entering_key.clone(),
                tag: ticket.tag,
                serial: ticket.serial,
                timeout: ticket.obtention_timeout,
                duration: Some(ticket.lock_duration),
                unlock_duration: Some(ticket.unlock_duration),
                home_node: ticket.home_node.clone(),
            })
            .await;
    }

    // ---- status probes (§6.1 LOCK_STATUS, §6.6 LIST_TICKETS) ----

    pub async fn is_ready(&self) -> bool {
        let state = self.state.lock().await;
        self.is_ready_now(&state)
    }

    /// Render every numbered ticket for `object_name` in the §6.3 wire
    /// format, one per line — the status tool's `list-tickets` output.
    pub async fn render_tickets(&self, object_name: &str) -> Result<String> {
        let tickets = self.store.tickets_for_object(object_name).await?;
        Ok(tickets
            .iter()
            .map(Ticket::serialize)
            .collect::<Vec<_>>()
            .join("\n"))
    }

    // ---- timer wheel (§4.6) ----

    /// The next deadline this engine's timer wheel needs to fire at, across
    /// every tracked ticket (entering and numbered) and cached request, or
    /// `None` if nothing is waiting on a timer. The server's event loop
    /// re-arms its single `Sleep` against this after every `tick`.
    pub async fn next_deadline(&self, now: u64) -> Option<u64> {
        let mut tickets = self.store.all_tickets().await.unwrap_or_default();
        tickets.extend(self.store.all_entering().await.unwrap_or_default());
        let state = self.state.lock().await;
        timer::next_deadline(now, &tickets, &state.cache)
    }

    /// Sweep every tracked ticket and cached request for `now`. Must be
    /// called by the server's re-armed timer whenever the previously
    /// computed deadline elapses.
    pub async fn tick(&self, now: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let expired_cached = state.cache.expire(now);
        drop(state);
        for cached in expired_cached {
            let _ = self
                .notify_lock_failed(
                    &cached.request.object_name,
                    cached.request.tag,
                    "",
                    FailureReason::Timedout,
                    cached.home_node,
                )
                .await;
        }

        let all_tickets = self.store.all_tickets().await?;
        for ticket in timer::expired_tickets(now, &all_tickets) {
            let ticket = ticket.clone();
            if ticket.locked {
                self.expire_held_lock(ticket, now).await?;
            } else {
                self.expire_waiting_ticket(ticket).await?;
            }
        }

        let all_entering = self.store.all_entering().await?;
        for ticket in timer::expired_tickets(now, &all_entering) {
            self.expire_entering_ticket(ticket.clone()).await?;
        }
        Ok(())
    }

    async fn expire_waiting_ticket(&self, mut ticket: Ticket) -> Result<()> {
        ticket.mark_failed(FailureState::LockFailureLock);
        let key = ticket.ticket_key.clone().unwrap_or(ticket.entering_key.clone());
        self.store
            .remove_ticket(&ticket.object_name, ticket.ticket_key.as_deref().unwrap_or(""))
            .await?;
        self.notify_lock_failed(
            &ticket.object_name,
            ticket.tag,
            &key,
            FailureReason::Timedout,
            ticket.home_node.clone(),
        )
        .await
    }

    /// An ENTERING ticket (including one re-injected after leader-loss
    /// reassignment, waiting on an ALIVE reply) whose deadline elapsed
    /// without the protocol moving past ENTERING.
    async fn expire_entering_ticket(&self, ticket: Ticket) -> Result<()> {
        self.store
            .remove_entering(&ticket.object_name, &ticket.entering_key)
            .await?;
        self.notify_lock_failed(
            &ticket.object_name,
            ticket.tag,
            &ticket.entering_key,
            FailureReason::Timedout,
            ticket.home_node.clone(),
        )
        .await
    }

    async fn expire_held_lock(&self, mut ticket: Ticket, now: u64) -> Result<()> {
        if ticket.failure_state == FailureState::LockFailureUnlocking {
            // Already in the extended UNLOCKING grace period and that has
            // now also expired: force-release.
            self.store
                .remove_ticket(&ticket.object_name, ticket.ticket_key.as_deref().unwrap_or(""))
                .await?;
            return Ok(());
        }
        ticket.mark_failed(FailureState::LockFailureUnlocking);
        ticket.lock_timeout_date = Some(now + ticket.unlock_duration);
        self.store.replace_ticket(ticket).await?;
        Ok(())
    }
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::InMemoryTicketStore;
    use crate::transport::{NullPeerTransport, RecordingClientRouter, RecordingPeerTransport};

    fn test_engine() -> (Engine, Arc<RecordingClientRouter>) {
        let node = Node::new(1, "10.0.0.1", 100, "solo", 0);
        let router = Arc::new(RecordingClientRouter::default());
        let engine = Engine::new(
            node,
            1,
            Arc::new(InMemoryTicketStore::new()),
            Arc::new(NullPeerTransport),
            router.clone(),
        );
        (engine, router)
    }

    #[tokio::test]
    async fn single_node_cluster_becomes_ready_and_locks() {
        let (engine, router) = test_engine();
        engine.on_bus_connected().await;
        // Single node with no election yet: seed leadership on self.
        {
            let mut state = engine.state.lock().await;
            let self_node = state.self_node.clone();
            state.leaders = Some(LeaderSet {
                leaders: vec![self_node],
                election_date: 1,
            });
            engine.recompute_readiness_locked(&mut state).await;
        }

        let req = LockRequest {
            object_name: "resource-a".into(),
            tag: 1,
            pid: 42,
            serial: -1,
            timeout: now() + 5,
            duration: Some(5),
            unlock_duration: Some(5),
            kind: LockKind::Default,
        };
        engine.start_lock(req, "solo".into()).await.unwrap();

        let sent = router.sent.lock().await;
        assert!(
            sent.iter().any(|(_, m)| matches!(m, ClientMessage::Locked(_))),
            "expected a Locked message, got {sent:?}"
        );
    }

    #[tokio::test]
    async fn on_lock_leaders_marks_self_node_as_self() {
        let (engine, router) = test_engine();
        engine.on_bus_connected().await;
        let self_id = {
            let state = engine.state.lock().await;
            state.self_node.id()
        };
        engine
            .on_lock_leaders(LockLeadersMsg {
                election_date: 1,
                leader0: self_id,
                leader1: None,
                leader2: None,
            })
            .await;

        // A single-node cluster where the reconstructed leader isn't
        // recognized as self would try to dial itself as a peer and hit
        // NullPeerTransport's unreachable!().
        let req = LockRequest {
            object_name: "resource-a".into(),
            tag: 1,
            pid: 42,
            serial: -1,
            timeout: now() + 5,
            duration: Some(5),
            unlock_duration: Some(5),
            kind: LockKind::Default,
        };
        engine.start_lock(req, "solo".into()).await.unwrap();
        let sent = router.sent.lock().await;
        assert!(sent.iter().any(|(_, m)| matches!(m, ClientMessage::Locked(_))));
    }

    #[tokio::test]
    async fn not_ready_caches_the_request() {
        let (engine, router) = test_engine();
        let req = LockRequest {
            object_name: "resource-a".into(),
            tag: 1,
            pid: 42,
            serial: -1,
            timeout: now() + 5,
            duration: None,
            unlock_duration: None,
            kind: LockKind::Default,
        };
        engine.start_lock(req, "solo".into()).await.unwrap();
        let state = engine.state.lock().await;
        assert_eq!(state.cache.len(), 1);
        drop(state);
        assert!(router.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn replica_handlers_track_entering_and_max_ticket() {
        let (engine, _router) = test_engine();
        let entered = engine
            .on_lock_entering(LockEnteringMsg {
                object_name: "obj".into(),
                entering_key: "peer/1".into(),
                tag: 1,
                source: "peer/1".into(),
                serial: -1,
                home_node: "peer".into(),
            })
            .await
            .unwrap();
        assert_eq!(entered.entering_key, "peer/1");

        let max = engine
            .on_get_max_ticket(GetMaxTicketMsg {
                object_name: "obj".into(),
            })
            .await
            .unwrap();
        assert_eq!(max.max_ticket, 0);

        let added = engine
            .on_add_ticket(AddTicketMsg {
                object_name: "obj".into(),
                entering_key: "peer/1".into(),
                ticket_key: ticket::ticket_key(1, "peer/1"),
            })
            .await
            .unwrap();
        assert_eq!(added.ticket_key, ticket::ticket_key(1, "peer/1"));

        let activated = engine
            .on_activate_lock(ActivateLockMsg {
                object_name: "obj".into(),
            })
            .await
            .unwrap();
        assert_eq!(activated.first_ticket_key, Some(ticket::ticket_key(1, "peer/1")));
    }

    async fn ready_solo_engine() -> (Engine, Arc<RecordingClientRouter>) {
        let (engine, router) = test_engine();
        engine.on_bus_connected().await;
        let mut state = engine.state.lock().await;
        let self_node = state.self_node.clone();
        state.leaders = Some(LeaderSet {
            leaders: vec![self_node],
            election_date: 1,
        });
        engine.recompute_readiness_locked(&mut state).await;
        drop(state);
        (engine, router)
    }

    #[tokio::test]
    async fn duplicate_lock_same_serial_is_silently_accepted() {
        let (engine, router) = ready_solo_engine().await;

        let mut existing = Ticket::new("resource-a", 1, "solo", "lockd", 42, "solo", "solo", 5, 5, 5);
        existing.serial = 7;
        engine.store.insert_entering(existing).await.unwrap();

        let req = LockRequest {
            object_name: "resource-a".into(),
            tag: 1,
            pid: 42,
            serial: 7,
            timeout: now() + 5,
            duration: Some(5),
            unlock_duration: Some(5),
            kind: LockKind::Default,
        };
        engine.start_lock(req, "solo".into()).await.unwrap();

        let sent = router.sent.lock().await;
        assert!(
            !sent.iter().any(|(_, m)| matches!(m, ClientMessage::LockFailed(_))),
            "a same-serial retry must not be rejected, got {sent:?}"
        );
    }

    #[tokio::test]
    async fn duplicate_lock_different_serial_is_rejected() {
        let (engine, router) = ready_solo_engine().await;

        let mut existing = Ticket::new("resource-a", 1, "solo", "lockd", 42, "solo", "solo", 5, 5, 5);
        existing.serial = 7;
        engine.store.insert_entering(existing).await.unwrap();

        let req = LockRequest {
            object_name: "resource-a".into(),
            tag: 1,
            pid: 42,
            serial: 8,
            timeout: now() + 5,
            duration: Some(5),
            unlock_duration: Some(5),
            kind: LockKind::Default,
        };
        engine.start_lock(req, "solo".into()).await.unwrap();

        let sent = router.sent.lock().await;
        assert!(sent.iter().any(|(_, m)| matches!(
            m,
            ClientMessage::LockFailed(f) if f.error == ReasonWire::Duplicate
        )));
    }

    #[tokio::test]
    async fn duplicate_lock_against_numbered_ticket_is_rejected_regardless_of_serial() {
        let (engine, router) = ready_solo_engine().await;

        let mut numbered = Ticket::new("resource-a", 1, "solo", "lockd", 42, "solo", "solo", 5, 5, 5);
        numbered.serial = 7;
        numbered.assign_ticket_number(1);
        engine.store.insert_ticket(numbered).await.unwrap();

        let req = LockRequest {
            object_name: "resource-a".into(),
            tag: 1,
            pid: 42,
            serial: 7,
            timeout: now() + 5,
            duration: Some(5),
            unlock_duration: Some(5),
            kind: LockKind::Default,
        };
        engine.start_lock(req, "solo".into()).await.unwrap();

        let sent = router.sent.lock().await;
        assert!(sent.iter().any(|(_, m)| matches!(
            m,
            ClientMessage::LockFailed(f) if f.error == ReasonWire::Duplicate
        )));
    }

    fn two_leader_engine(self_is_new_owner: bool) -> (Engine, Arc<RecordingClientRouter>, Arc<RecordingPeerTransport>, LeaderSet) {
        let node = Node::new(1, "10.0.0.1", 100, "self", 0);
        let router = Arc::new(RecordingClientRouter::default());
        let peers = Arc::new(RecordingPeerTransport::default());
        let engine = Engine::new(
            node,
            2,
            Arc::new(InMemoryTicketStore::new()),
            peers.clone(),
            router.clone(),
        );
        let mut self_node = Node::new(1, "10.0.0.1", 100, "self", 0);
        self_node.is_self = true;
        let mut other_node = Node::new(1, "10.0.0.2", 100, "other", 0);
        other_node.is_self = false;
        let leaders = if self_is_new_owner {
            LeaderSet { leaders: vec![self_node, other_node], election_date: 1 }
        } else {
            LeaderSet { leaders: vec![other_node, self_node], election_date: 1 }
        };
        (engine, router, peers, leaders)
    }

    #[tokio::test]
    async fn synchronize_leaders_reinjects_orphaned_ticket_when_self_is_new_owner() {
        let (engine, router, _peers, leaders) = two_leader_engine(true);
        let mut orphaned = Ticket::new("resource-a", 1, "gone", "lockd", 42, "gone", "home-node", 5, 5, 5);
        orphaned.serial = 3;
        engine.store.insert_entering(orphaned).await.unwrap();

        let mut state = engine.state.lock().await;
        state.leaders = Some(leaders);
        engine.synchronize_leaders(&mut state).await;
        drop(state);

        let still_entering = engine.store.all_entering().await.unwrap();
        assert_eq!(still_entering.len(), 1, "ticket must be re-injected, not dropped");
        assert_eq!(still_entering[0].owner, "self");
        assert_ne!(still_entering[0].alive_timeout, 0);

        let sent = router.sent.lock().await;
        assert!(
            sent.iter().any(|(home, m)| home == "home-node" && matches!(m, ClientMessage::Alive { .. })),
            "expected an ALIVE probe to the ticket's home node, got {sent:?}"
        );
    }

    #[tokio::test]
    async fn synchronize_leaders_forwards_orphaned_ticket_when_self_is_not_new_owner() {
        let (engine, _router, peers, leaders) = two_leader_engine(false);
        let mut orphaned = Ticket::new("resource-a", 1, "gone", "lockd", 42, "gone", "home-node", 5, 5, 5);
        orphaned.serial = 3;
        engine.store.insert_entering(orphaned).await.unwrap();

        let mut state = engine.state.lock().await;
        state.leaders = Some(leaders);
        engine.synchronize_leaders(&mut state).await;
        drop(state);

        assert!(engine.store.all_entering().await.unwrap().is_empty());
        let forwarded = peers.forward_lock_calls.lock().await;
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].0, "other");
        assert_eq!(forwarded[0].1.object_name, "resource-a");
    }

    #[tokio::test]
    async fn synchronize_leaders_broadcasts_locked_tickets_to_every_peer() {
        let (engine, _router, peers, leaders) = two_leader_engine(true);
        let mut locked = Ticket::new("resource-a", 1, "gone", "lockd", 42, "gone", "home-node", 5, 5, 5);
        locked.assign_ticket_number(1);
        locked.locked = true;
        locked.lock_timeout_date = Some(now() + 60);
        engine.store.insert_ticket(locked).await.unwrap();

        let mut state = engine.state.lock().await;
        state.leaders = Some(leaders);
        engine.synchronize_leaders(&mut state).await;
        drop(state);

        let transferred = engine
            .store
            .tickets_for_object("resource-a")
            .await
            .unwrap();
        assert_eq!(transferred.len(), 1);
        assert_eq!(transferred[0].owner, "self");

        let broadcast = peers.lock_tickets_calls.lock().await;
        assert_eq!(broadcast.len(), 1);
        assert_eq!(broadcast[0].0, "other");
    }

    #[tokio::test]
    async fn on_lock_tickets_upserts_serialized_tickets() {
        let (engine, _router) = test_engine();
        let mut t = Ticket::new("resource-a", 1, "node-b", "lockd", 42, "node-b", "home-b", 5, 5, 5);
        t.assign_ticket_number(1);
        let line = t.serialize();

        engine
            .on_lock_tickets(LockTicketsMsg { tickets: vec![line] })
            .await
            .unwrap();

        let tickets = engine.store.tickets_for_object("resource-a").await.unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].ticket_key, t.ticket_key);
    }

    #[tokio::test]
    async fn on_alive_reply_restarts_a_reinjected_ticket() {
        let (engine, _router) = ready_solo_engine().await;
        let mut ticket = Ticket::new("resource-a", 1, "solo", "lockd", 42, "self", "solo", 5, 5, 5);
        ticket.serial = 3;
        ticket.alive_timeout = now() + 5;
        engine.store.insert_entering(ticket).await.unwrap();

        engine.on_alive_reply("resource-a", 1).await.unwrap();

        // Restarting the protocol runs it to completion on this single-node
        // cluster, ending with the entering ticket consumed by NUMBERING.
        assert!(engine.store.all_entering().await.unwrap().is_empty());
    }
}
