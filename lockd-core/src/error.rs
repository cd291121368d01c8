//! The closed error taxonomy (§7).

use thiserror::Error;

/// Reason codes surfaced to clients on `LOCK_FAILED` / `UNLOCKING` (§6.1,
/// §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Timedout,
    Invalid,
    Duplicate,
    Failed,
    TransmissionError,
}

impl FailureReason {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            FailureReason::Timedout => "timedout",
            FailureReason::Invalid => "invalid",
            FailureReason::Duplicate => "duplicate",
            FailureReason::Failed => "failed",
            FailureReason::TransmissionError => "transmission_error",
        }
    }
}

/// Everything that can go wrong inside the engine (§7). Each variant
/// carries enough context to build the corresponding client-facing reply.
#[derive(Debug, Error)]
pub enum LockdError {
    #[error("election configuration error: {0}")]
    Configuration(#[from] crate::elector::ElectionError),

    #[error("protocol validation failed for `{command}`: {message}")]
    ProtocolValidation { command: String, message: String },

    #[error("invalid parameter: {reason}")]
    InvalidParameter { reason: String },

    #[error(
        "duplicate request for object `{object_name}` entering_key `{entering_key}`"
    )]
    Duplicate {
        object_name: String,
        entering_key: String,
    },

    #[error("transmission failure delivering `{command}` to `{peer}`")]
    Transmission { command: String, peer: String },

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("no known leaders for this cluster")]
    NoLeaders,

    #[error("unknown ticket key `{0}`")]
    UnknownTicket(String),
}

impl LockdError {
    /// The reason code to attach to a `LOCK_FAILED` reply for this error,
    /// if one applies (internal-only errors have no client-facing reason).
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            LockdError::ProtocolValidation { .. } | LockdError::InvalidParameter { .. } => {
                Some(FailureReason::Invalid)
            }
            LockdError::Duplicate { .. } => Some(FailureReason::Duplicate),
            LockdError::Transmission { .. } => Some(FailureReason::TransmissionError),
            LockdError::NoLeaders | LockdError::UnknownTicket(_) => Some(FailureReason::Failed),
            LockdError::Configuration(_) | LockdError::InvariantViolation(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LockdError>;
