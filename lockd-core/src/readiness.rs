//! Readiness controller (§4.1): a single boolean broadcast to local
//! clients as `LOCK_READY` / `NO_LOCK`.

use crate::elector::LeaderSet;
use crate::node::NodeRegistry;

/// Inputs the readiness computation needs, kept separate from
/// `NodeRegistry`/`LeaderSet` themselves so the rule is a pure function
/// and easy to exercise in isolation.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessInputs {
    pub bus_connected: bool,
    pub known_nodes: usize,
    pub total_nodes: usize,
    pub leader_count: usize,
    pub all_leaders_connected: bool,
}

impl ReadinessInputs {
    pub fn from_registry(registry: &NodeRegistry, leaders: Option<&LeaderSet>, bus_connected: bool) -> Self {
        let leader_count = leaders.map(|l| l.leaders.len()).unwrap_or(0);
        let all_leaders_connected = leaders
            .map(|l| {
                l.leaders
                    .iter()
                    .all(|leader| registry.get(&leader.name).map(|n| n.connected).unwrap_or(false))
            })
            .unwrap_or(false);
        Self {
            bus_connected,
            known_nodes: registry.known_count(),
            total_nodes: registry.total_nodes(),
            leader_count,
            all_leaders_connected,
        }
    }
}

/// §4.1's readiness predicate, verbatim.
pub fn is_ready(inputs: ReadinessInputs) -> bool {
    if !inputs.bus_connected {
        return false;
    }
    if inputs.leader_count == 0 {
        return false;
    }
    if inputs.total_nodes < 3 {
        if inputs.known_nodes != inputs.total_nodes {
            return false;
        }
    } else {
        let quorum = inputs.total_nodes / 2 + 1;
        if inputs.known_nodes < quorum || inputs.leader_count < 2 {
            return false;
        }
    }
    inputs.all_leaders_connected
}

/// Edge-triggered readiness tracker: only reports a transition the first
/// time the computed value changes, matching §4.1's "idempotent when the
/// value is unchanged".
#[derive(Debug, Default)]
pub struct ReadinessTracker {
    last: Option<bool>,
}

impl ReadinessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Some(new_value)` iff this call is a transition from the
    /// previously observed value (or the first observation ever).
    pub fn observe(&mut self, ready: bool) -> Option<bool> {
        if self.last == Some(ready) {
            None
        } else {
            self.last = Some(ready);
            Some(ready)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ReadinessInputs {
        ReadinessInputs {
            bus_connected: true,
            known_nodes: 1,
            total_nodes: 1,
            leader_count: 1,
            all_leaders_connected: true,
        }
    }

    #[test]
    fn single_node_cluster_is_ready_once_complete() {
        assert!(is_ready(base()));
    }

    #[test]
    fn small_cluster_requires_full_completeness() {
        let mut inputs = base();
        inputs.total_nodes = 2;
        inputs.known_nodes = 1;
        assert!(!is_ready(inputs));
        inputs.known_nodes = 2;
        assert!(is_ready(inputs));
    }

    #[test]
    fn large_cluster_requires_quorum_and_two_leaders() {
        let mut inputs = base();
        inputs.total_nodes = 5;
        inputs.known_nodes = 3;
        inputs.leader_count = 1;
        assert!(!is_ready(inputs), "needs leader_count >= 2");
        inputs.leader_count = 2;
        assert!(is_ready(inputs));
        inputs.known_nodes = 2;
        assert!(!is_ready(inputs), "below quorum");
    }

    #[test]
    fn disconnected_leader_blocks_readiness() {
        let mut inputs = base();
        inputs.all_leaders_connected = false;
        assert!(!is_ready(inputs));
    }

    #[test]
    fn tracker_only_reports_transitions() {
        let mut tracker = ReadinessTracker::new();
        assert_eq!(tracker.observe(true), Some(true));
        assert_eq!(tracker.observe(true), None);
        assert_eq!(tracker.observe(false), Some(false));
    }
}
