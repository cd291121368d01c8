//! Leader election (§4.2).
//!
//! Runs on every node, but only ever *acts* on the node holding the
//! smallest IP address — see [`NodeRegistry::is_election_owner`]. Other
//! nodes just adopt whatever `LOCK_LEADERS` announcement arrives.

use thiserror::Error;
use tracing::{error, info};

use crate::node::{Node, NodeRegistry, PRIORITY_NEVER_LEADER};

pub const MAX_LEADERS: usize = 3;

#[derive(Debug, Error)]
pub enum ElectionError {
    #[error(
        "too few eligible nodes: {eligible} candidates but {total} total nodes \
         (at least {needed} are priority-15 / never-leader)"
    )]
    NotEnoughCandidates {
        eligible: usize,
        total: usize,
        needed: usize,
    },
}

/// The result of a successful election: 1 to 3 ordered leaders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderSet {
    pub leaders: Vec<Node>,
    pub election_date: u64,
}

impl LeaderSet {
    pub fn contains(&self, name: &str) -> bool {
        self.leaders.iter().any(|n| n.name == name)
    }

    pub fn first(&self) -> Option<&Node> {
        self.leaders.first()
    }
}

/// Rank every eligible candidate and pick up to [`MAX_LEADERS`].
///
/// `current_leaders` lets incumbents keep their seats (§4.2: their priority
/// prefix is forced to `"00"` before sorting). Nodes with priority
/// [`PRIORITY_NEVER_LEADER`] are never candidates. If fewer than 3
/// candidates remain but the cluster itself has fewer than 3 total nodes,
/// the smaller election is accepted; otherwise it's a configuration error.
pub fn elect(
    registry: &NodeRegistry,
    current_leaders: &[String],
    election_date: u64,
) -> Result<LeaderSet, ElectionError> {
    let mut candidates: Vec<&Node> = registry
        .iter()
        .filter(|n| n.priority != PRIORITY_NEVER_LEADER)
        .collect();

    if candidates.len() < MAX_LEADERS && registry.total_nodes() >= MAX_LEADERS {
        error!(
            eligible = candidates.len(),
            total = registry.total_nodes(),
            "election aborted: not enough leader-eligible nodes"
        );
        return Err(ElectionError::NotEnoughCandidates {
            eligible: candidates.len(),
            total: registry.total_nodes(),
            needed: MAX_LEADERS,
        });
    }

    candidates.sort_by_key(|n| n.election_key(current_leaders.contains(&n.name)));
    let leaders: Vec<Node> = candidates
        .into_iter()
        .take(MAX_LEADERS)
        .cloned()
        .collect();

    info!(
        leaders = ?leaders.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(),
        election_date,
        "election completed"
    );

    Ok(LeaderSet {
        leaders,
        election_date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(priority: u8, ip: &str, name: &str) -> Node {
        let mut n = Node::new(priority, ip, 1, name, 0);
        n.random = 0;
        n
    }

    #[test]
    fn picks_three_lowest_ranked_candidates() {
        let mut reg = NodeRegistry::new(5);
        for (p, ip, name) in [
            (3, "10.0.0.1", "a"),
            (1, "10.0.0.2", "b"),
            (2, "10.0.0.3", "c"),
            (5, "10.0.0.4", "d"),
            (4, "10.0.0.5", "e"),
        ] {
            reg.insert(node(p, ip, name));
        }
        let result = elect(&reg, &[], 100).unwrap();
        let names: Vec<_> = result.leaders.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c", "a"]);
    }

    #[test]
    fn never_leader_nodes_are_excluded() {
        let mut reg = NodeRegistry::new(3);
        reg.insert(node(1, "10.0.0.1", "a"));
        reg.insert(node(PRIORITY_NEVER_LEADER, "10.0.0.2", "b"));
        reg.insert(node(2, "10.0.0.3", "c"));
        let result = elect(&reg, &[], 1).unwrap();
        assert!(!result.contains("b"));
        assert_eq!(result.leaders.len(), 2);
    }

    #[test]
    fn too_many_never_leader_nodes_in_large_cluster_is_an_error() {
        let mut reg = NodeRegistry::new(4);
        reg.insert(node(1, "10.0.0.1", "a"));
        reg.insert(node(PRIORITY_NEVER_LEADER, "10.0.0.2", "b"));
        reg.insert(node(PRIORITY_NEVER_LEADER, "10.0.0.3", "c"));
        reg.insert(node(PRIORITY_NEVER_LEADER, "10.0.0.4", "d"));
        let result = elect(&reg, &[], 1);
        assert!(matches!(
            result,
            Err(ElectionError::NotEnoughCandidates { .. })
        ));
    }

    #[test]
    fn small_cluster_under_three_nodes_is_accepted() {
        let mut reg = NodeRegistry::new(2);
        reg.insert(node(1, "10.0.0.1", "a"));
        reg.insert(node(2, "10.0.0.2", "b"));
        let result = elect(&reg, &[], 1).unwrap();
        assert_eq!(result.leaders.len(), 2);
    }

    #[test]
    fn incumbent_keeps_seat_despite_worse_priority() {
        let mut reg = NodeRegistry::new(3);
        reg.insert(node(10, "10.0.0.9", "incumbent"));
        reg.insert(node(1, "10.0.0.1", "challenger-1"));
        reg.insert(node(1, "10.0.0.2", "challenger-2"));
        let result = elect(&reg, &["incumbent".to_string()], 1).unwrap();
        assert_eq!(result.leaders[0].name, "incumbent");
    }
}
