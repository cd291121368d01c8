//! The client-side half of the transport seam: sends LOCK/UNLOCK/status
//! probes and delivers inbound replies to whichever guard's `tag` they're
//! addressed to.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use lockd_core::error::Result;
use lockd_core::messages::{ClientMessage, LockRequest, ReadinessWire, UnlockRequest};
use tokio::sync::mpsc;
use tracing::warn;

#[async_trait]
pub trait ClientTransport: Send + Sync {
    async fn send_lock(&self, req: LockRequest) -> Result<()>;
    async fn send_unlock(&self, req: UnlockRequest) -> Result<()>;
    async fn send_status_probe(&self) -> Result<ReadinessWire>;
}

/// Allocates process-wide unique 16-bit tags, skipping 0, under one mutex
/// (§4.5, §9 "global singletons" — a narrow API with its own lock rather
/// than a bare static).
#[derive(Default)]
pub struct TagAllocator {
    next: Mutex<u16>,
}

impl TagAllocator {
    pub fn new() -> Self {
        Self { next: Mutex::new(0) }
    }

    pub fn allocate(&self) -> u16 {
        let mut next = self.next.lock().unwrap();
        loop {
            *next = next.wrapping_add(1);
            if *next != 0 {
                return *next;
            }
        }
    }
}

/// Routes inbound [`ClientMessage`]s to the guard whose `tag` they carry.
/// Registration returns a channel the guard awaits on; dropping the guard
/// (or calling [`Dispatcher::deregister`] explicitly) removes the entry —
/// the RAII scoped-release mechanism §5 calls for.
#[derive(Default)]
pub struct Dispatcher {
    routes: Mutex<HashMap<u16, mpsc::UnboundedSender<ClientMessage>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tag: u16) -> mpsc::UnboundedReceiver<ClientMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().unwrap().insert(tag, tx);
        rx
    }

    pub fn deregister(&self, tag: u16) {
        self.routes.lock().unwrap().remove(&tag);
    }

    pub fn deliver(&self, tag: u16, msg: ClientMessage) {
        let routes = self.routes.lock().unwrap();
        if let Some(tx) = routes.get(&tag) {
            let _ = tx.send(msg);
        }
    }

    /// §9 open question 1, decision recorded in DESIGN.md: a reported
    /// transmission failure is not narrowed to one tag — every open guard
    /// in the process is failed, matching the original's documented (if
    /// broad) contract.
    pub fn broadcast_transmission_failure(&self) {
        warn!("transmission failure reported: failing every open guard in this process");
        let routes = self.routes.lock().unwrap();
        for tx in routes.values() {
            let _ = tx.send(ClientMessage::LockFailed(lockd_core::messages::LockFailed {
                object_name: String::new(),
                tag: 0,
                key: String::new(),
                error: lockd_core::error::FailureReason::TransmissionError.into(),
                description: None,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_allocator_skips_zero() {
        let alloc = TagAllocator::new();
        assert_ne!(alloc.allocate(), 0);
    }

    #[tokio::test]
    async fn dispatcher_routes_by_tag() {
        let dispatcher = Dispatcher::new();
        let mut rx_a = dispatcher.register(1);
        let _rx_b = dispatcher.register(2);
        dispatcher.deliver(
            1,
            ClientMessage::Unlocked(lockd_core::messages::Unlocked {
                object_name: "o".into(),
                tag: 1,
                timed_out: false,
                unlocked_date: 0,
            }),
        );
        let msg = rx_a.recv().await.unwrap();
        assert!(matches!(msg, ClientMessage::Unlocked(_)));
    }

    #[tokio::test]
    async fn deregister_stops_delivery() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.register(1);
        dispatcher.deregister(1);
        dispatcher.deliver(
            1,
            ClientMessage::Unlocking(lockd_core::messages::Unlocking {
                object_name: "o".into(),
                tag: 1,
            }),
        );
        assert!(rx.try_recv().is_err());
    }
}
