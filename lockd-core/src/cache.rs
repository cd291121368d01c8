//! Message cache (§4.7): buffers `LOCK` requests that arrive before the
//! engine is ready, in FIFO order, until either readiness arrives (replay)
//! or the request's own obtention deadline passes (fail it).

use std::collections::VecDeque;

use crate::messages::LockRequest;

#[derive(Debug, Clone)]
pub struct CachedRequest {
    pub request: LockRequest,
    pub home_node: String,
}

#[derive(Debug, Default)]
pub struct MessageCache {
    queue: VecDeque<CachedRequest>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: LockRequest, home_node: String) {
        self.queue.push_back(CachedRequest { request, home_node });
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Drain every cached request in arrival order, for replay once the
    /// engine becomes ready.
    pub fn drain_all(&mut self) -> Vec<CachedRequest> {
        self.queue.drain(..).collect()
    }

    /// Remove and return every cached request whose obtention deadline has
    /// passed as of `now`; the rest stay cached.
    pub fn expire(&mut self, now: u64) -> Vec<CachedRequest> {
        let (expired, remaining): (VecDeque<_>, VecDeque<_>) =
            self.queue.drain(..).partition(|c| c.request.timeout <= now);
        self.queue = remaining;
        expired.into_iter().collect()
    }

    /// Earliest deadline among cached requests, for the timer wheel.
    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.iter().map(|c| c.request.timeout).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::LockKind;

    fn req(object: &str, timeout: u64) -> LockRequest {
        LockRequest {
            object_name: object.to_string(),
            tag: 1,
            pid: 1,
            serial: -1,
            timeout,
            duration: None,
            unlock_duration: None,
            kind: LockKind::Default,
        }
    }

    #[test]
    fn fifo_order_preserved_on_drain() {
        let mut cache = MessageCache::new();
        cache.push(req("a", 10), "node-a".into());
        cache.push(req("b", 20), "node-a".into());
        let drained = cache.drain_all();
        assert_eq!(drained[0].request.object_name, "a");
        assert_eq!(drained[1].request.object_name, "b");
        assert!(cache.is_empty());
    }

    #[test]
    fn expire_only_removes_past_deadline() {
        let mut cache = MessageCache::new();
        cache.push(req("a", 5), "node-a".into());
        cache.push(req("b", 50), "node-a".into());
        let expired = cache.expire(10);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].request.object_name, "a");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn next_deadline_is_the_minimum() {
        let mut cache = MessageCache::new();
        cache.push(req("a", 50), "node-a".into());
        cache.push(req("b", 5), "node-a".into());
        assert_eq!(cache.next_deadline(), Some(5));
    }
}
