//! Wire message shapes (§6.1 client↔coordinator, §6.2 leader↔leader).
//!
//! These are transport-agnostic domain types; `lockd-server` converts them
//! to/from protobuf at the gRPC boundary, the way the teacher's service
//! layer converts `Value`/`CompiledProgram` to/from proto messages.

use serde::{Deserialize, Serialize};

use crate::error::FailureReason;

/// §6.5 lock-kind variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    Default,
    ReadOnly,
    ReadWritePriority,
}

// ---- client -> coordinator (§6.1) ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub object_name: String,
    pub tag: u16,
    pub pid: u32,
    pub serial: i32,
    /// Absolute obtention deadline (unix seconds).
    pub timeout: u64,
    pub duration: Option<u64>,
    pub unlock_duration: Option<u64>,
    pub kind: LockKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockRequest {
    pub object_name: String,
    pub tag: u16,
    pub pid: u32,
    pub serial: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockStatusProbe;

// ---- coordinator -> client (§6.1) ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Locked {
    pub object_name: String,
    pub tag: u16,
    pub timeout_date: u64,
    pub unlocked_date: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockFailed {
    pub object_name: String,
    pub tag: u16,
    pub key: String,
    pub error: ReasonWire,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonWire {
    Timedout,
    Invalid,
    Duplicate,
    Failed,
    TransmissionError,
}

impl From<FailureReason> for ReasonWire {
    fn from(r: FailureReason) -> Self {
        match r {
            FailureReason::Timedout => ReasonWire::Timedout,
            FailureReason::Invalid => ReasonWire::Invalid,
            FailureReason::Duplicate => ReasonWire::Duplicate,
            FailureReason::Failed => ReasonWire::Failed,
            FailureReason::TransmissionError => ReasonWire::TransmissionError,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unlocking {
    pub object_name: String,
    pub tag: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unlocked {
    pub object_name: String,
    pub tag: u16,
    pub timed_out: bool,
    pub unlocked_date: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ReadinessWire {
    LockReady,
    NoLock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransmissionStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransmissionReport {
    pub command: String,
    pub status: TransmissionStatus,
}

/// One outbound message addressed to a specific client guard by `tag`.
/// This is what `ClientRouter::deliver` (§6.7) carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    Locked(Locked),
    LockFailed(LockFailed),
    Unlocking(Unlocking),
    Unlocked(Unlocked),
    Readiness(ReadinessWire),
    Alive { object_name: String, tag: u16 },
}

// ---- leader <-> leader (§6.2) ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEnteringMsg {
    pub object_name: String,
    pub entering_key: String,
    pub tag: u16,
    pub source: String,
    pub serial: i32,
    /// Carried so a replica can take over as owner (§4.4 leader-loss
    /// reassignment) without losing where to route the eventual reply.
    pub home_node: String,
}

/// Leader-loss reassignment (§4.4): forward an orphaned, not-yet-locked
/// ticket to the new owner (`leaders[0]`) instead of restarting it locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardLockMsg {
    pub object_name: String,
    pub entering_key: String,
    pub tag: u16,
    pub serial: i32,
    /// Absolute obtention deadline (unix seconds), carried over unchanged.
    pub timeout: u64,
    pub duration: Option<u64>,
    pub unlock_duration: Option<u64>,
    pub home_node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEnteredMsg {
    pub object_name: String,
    pub entering_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetMaxTicketMsg {
    pub object_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxTicketMsg {
    pub object_name: String,
    pub max_ticket: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTicketMsg {
    pub object_name: String,
    pub entering_key: String,
    pub ticket_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketAddedMsg {
    pub object_name: String,
    pub ticket_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockExitingMsg {
    pub object_name: String,
    pub entering_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketReadyMsg {
    pub object_name: String,
    pub ticket_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateLockMsg {
    pub object_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockActivatedMsg {
    pub object_name: String,
    pub first_ticket_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropTicketMsg {
    pub object_name: String,
    pub ticket_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockLeadersMsg {
    pub election_date: u64,
    pub leader0: String,
    pub leader1: Option<String>,
    pub leader2: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockStartedMsg {
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockTicketsMsg {
    /// Pre-serialized tickets (§6.3), one per element.
    pub tickets: Vec<String>,
}
