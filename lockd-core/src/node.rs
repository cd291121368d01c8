//! Node identity (§3, §6.4) and the node registry (§4.1).

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// A priority of 15 means "never elected as a leader".
pub const PRIORITY_NEVER_LEADER: u8 = 15;
/// Priority 0 is reserved for a node that currently holds a leader seat;
/// it is never assigned by configuration.
pub const PRIORITY_LEADER: u8 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeIdError {
    #[error("node id must have exactly 5 `|`-separated fields, got {0}")]
    WrongFieldCount(usize),
    #[error("invalid priority field: {0}")]
    BadPriority(String),
    #[error("invalid random field: {0}")]
    BadRandom(String),
    #[error("invalid pid field: {0}")]
    BadPid(String),
    #[error("name must not be empty or contain `|`")]
    BadName,
}

/// One coordinator node, keyed by its identity string for total ordering.
///
/// Field order in the identity string matters: lexical comparison of the
/// formatted string must agree with (priority, random, ip, pid, name)
/// compared componentwise, which is why `priority` renders zero-padded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub priority: u8,
    pub random: u32,
    pub ip: String,
    pub pid: u32,
    pub name: String,
    pub start_time: u64,
    pub connected: bool,
    pub is_self: bool,
}

impl Node {
    pub fn new(
        priority: u8,
        ip: impl Into<String>,
        pid: u32,
        name: impl Into<String>,
        start_time: u64,
    ) -> Self {
        Self {
            priority,
            random: rand::random(),
            ip: ip.into(),
            pid,
            name: name.into(),
            start_time,
            connected: false,
            is_self: false,
        }
    }

    /// `<priority:2>|<random:uint32>|<ip>|<pid>|<name>` — the total-ordering
    /// identity string (§6.4). Priority is zero-padded to 2 digits so that
    /// lexical string order equals numeric order.
    pub fn id(&self) -> String {
        format!(
            "{:02}|{}|{}|{}|{}",
            self.priority, self.random, self.ip, self.pid, self.name
        )
    }

    /// Parse a node identity string back into its fields. Exactly 5 fields
    /// are required; a different count is a hard parse error rather than a
    /// best-effort reconstruction.
    pub fn parse_id(id: &str) -> Result<ParsedNodeId, NodeIdError> {
        let fields: Vec<&str> = id.split('|').collect();
        if fields.len() != 5 {
            return Err(NodeIdError::WrongFieldCount(fields.len()));
        }
        let priority: u8 = fields[0]
            .parse()
            .map_err(|_| NodeIdError::BadPriority(fields[0].to_string()))?;
        let random: u32 = fields[1]
            .parse()
            .map_err(|_| NodeIdError::BadRandom(fields[1].to_string()))?;
        let ip = fields[2].to_string();
        let pid: u32 = fields[3]
            .parse()
            .map_err(|_| NodeIdError::BadPid(fields[3].to_string()))?;
        let name = fields[4].to_string();
        if name.is_empty() || name.contains('|') {
            return Err(NodeIdError::BadName);
        }
        Ok(ParsedNodeId {
            priority,
            random,
            ip,
            pid,
            name,
        })
    }

    /// The sort key used by the elector (§4.2): the identity string itself,
    /// except that a node currently holding a leader seat has its priority
    /// prefix overridden to `"00"` so incumbents stay incumbents.
    pub fn election_key(&self, is_incumbent_leader: bool) -> String {
        if is_incumbent_leader {
            format!(
                "00|{}|{}|{}|{}",
                self.random, self.ip, self.pid, self.name
            )
        } else {
            self.id()
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedNodeId {
    pub priority: u8,
    pub random: u32,
    pub ip: String,
    pub pid: u32,
    pub name: String,
}

/// Tracks every coordinator peer known to this node. Entries are added on
/// `LOCK_STARTED` / election results and removed on bus disconnect.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<String, Node>,
    total_nodes: usize,
}

impl NodeRegistry {
    pub fn new(total_nodes: usize) -> Self {
        Self {
            nodes: BTreeMap::new(),
            total_nodes,
        }
    }

    pub fn insert(&mut self, node: Node) {
        self.nodes.insert(node.name.clone(), node);
    }

    pub fn remove(&mut self, name: &str) -> Option<Node> {
        self.nodes.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn known_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn total_nodes(&self) -> usize {
        self.total_nodes
    }

    pub fn set_total_nodes(&mut self, total: usize) {
        self.total_nodes = total;
    }

    /// Quorum per §4.1: `floor(N/2) + 1` over the configured total node
    /// count.
    pub fn quorum(&self) -> usize {
        self.total_nodes / 2 + 1
    }

    /// `true` iff this node has the smallest IP address among all known
    /// nodes (including itself) — the precondition for running an election
    /// (§4.2).
    pub fn is_election_owner(&self, self_ip: &str) -> bool {
        self.nodes.values().all(|n| n.ip.as_str() >= self_ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_round_trips() {
        let mut n = Node::new(3, "10.0.0.5", 4242, "node-a", 1_000);
        n.random = 123456;
        let id = n.id();
        let parsed = Node::parse_id(&id).unwrap();
        assert_eq!(parsed.priority, 3);
        assert_eq!(parsed.random, 123456);
        assert_eq!(parsed.ip, "10.0.0.5");
        assert_eq!(parsed.pid, 4242);
        assert_eq!(parsed.name, "node-a");
    }

    #[test]
    fn priority_zero_padding_preserves_numeric_order() {
        let mut a = Node::new(2, "10.0.0.1", 1, "a", 0);
        a.random = 0;
        let mut b = Node::new(10, "10.0.0.1", 1, "b", 0);
        b.random = 0;
        assert!(a.id() < b.id(), "priority 2 must sort before priority 10");
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        assert_eq!(
            Node::parse_id("01|2|3|4"),
            Err(NodeIdError::WrongFieldCount(4))
        );
    }

    #[test]
    fn empty_name_is_rejected() {
        assert_eq!(Node::parse_id("01|2|3|4|"), Err(NodeIdError::BadName));
    }

    #[test]
    fn incumbent_leader_sorts_first_regardless_of_priority() {
        let mut incumbent = Node::new(5, "10.0.0.9", 1, "incumbent", 0);
        incumbent.random = 999;
        let mut challenger = Node::new(1, "10.0.0.1", 1, "challenger", 0);
        challenger.random = 0;
        assert!(incumbent.election_key(true) < challenger.election_key(false));
    }

    #[test]
    fn quorum_is_majority_of_total() {
        let reg = NodeRegistry::new(5);
        assert_eq!(reg.quorum(), 3);
        let reg = NodeRegistry::new(4);
        assert_eq!(reg.quorum(), 3);
        let reg = NodeRegistry::new(1);
        assert_eq!(reg.quorum(), 1);
    }
}
