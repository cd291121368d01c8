//! The ticket data model, its key formats, and its wire serialization
//! (§3, §6.3).

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

/// Sentinel for "no serial assigned yet".
pub const NO_SERIAL: i32 = -1;
/// Sentinel for "no ticket number assigned yet".
pub const NO_TICKET: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TicketState {
    Entering,
    Numbering,
    Exiting,
    Ready,
    Locked,
    Releasing,
    Dropped,
}

/// Terminal failure branches, reachable from any state (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureState {
    None,
    LockFailureLock,
    LockFailureUnlocking,
}

impl fmt::Display for FailureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureState::None => "none",
            FailureState::LockFailureLock => "lock",
            FailureState::LockFailureUnlocking => "unlocking",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for FailureState {
    type Err = TicketParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(FailureState::None),
            "lock" => Ok(FailureState::LockFailureLock),
            "unlocking" => Ok(FailureState::LockFailureUnlocking),
            other => Err(TicketParseError::BadField("lock_failed", other.to_string())),
        }
    }
}

/// `"<server_name>/<client_pid>"` — identifies a client request on the node
/// that received it (§3).
pub fn entering_key(server_name: &str, client_pid: u32) -> String {
    format!("{server_name}/{client_pid}")
}

/// `"<ticket_number:hex8>/<entering_key>"` — the Bakery total-ordering key.
/// Hex, zero-padded to 8 digits, so lexical order equals numeric order.
pub fn ticket_key(ticket_number: u32, entering_key: &str) -> String {
    format!("{ticket_number:08x}/{entering_key}")
}

/// Extract the numeric ticket number back out of a ticket key.
pub fn ticket_key_number(key: &str) -> Option<u32> {
    let (hex, _) = key.split_once('/')?;
    u32::from_str_radix(hex, 16).ok()
}

/// One lock request as tracked by a leader.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    pub object_name: String,
    pub tag: u16,
    pub server_name: String,
    pub service_name: String,
    pub client_pid: u32,

    pub entering_key: String,
    pub ticket_key: Option<String>,
    pub ticket_number: u32,

    pub owner: String,
    pub serial: i32,

    /// Node holding the client's live connection, for `ClientRouter::deliver`
    /// routing (§6.7). Not part of the §6.3 wire format — see
    /// `Ticket::serialize` for why that's safe.
    pub home_node: String,

    pub obtention_timeout: u64,
    pub lock_duration: u64,
    pub unlock_duration: u64,
    /// Not transferred on serialize/unserialize — see SPEC_FULL.md §9 for
    /// why that's safe.
    pub alive_timeout: u64,

    pub lock_timeout_date: Option<u64>,
    pub unlocked_timeout_date: Option<u64>,

    pub get_max_ticket: bool,
    pub added_ticket: bool,
    pub added_ticket_quorum: bool,
    pub ticket_ready: bool,
    pub locked: bool,

    /// Entering-keys this ticket is still waiting to see exit (§4.4 step 4).
    pub still_entering: BTreeSet<String>,

    pub failure_state: FailureState,
}

impl Ticket {
    pub fn new(
        object_name: impl Into<String>,
        tag: u16,
        server_name: impl Into<String>,
        service_name: impl Into<String>,
        client_pid: u32,
        owner: impl Into<String>,
        home_node: impl Into<String>,
        obtention_timeout: u64,
        lock_duration: u64,
        unlock_duration: u64,
    ) -> Self {
        let server_name = server_name.into();
        let entering_key = entering_key(&server_name, client_pid);
        Self {
            object_name: object_name.into(),
            tag,
            server_name,
            service_name: service_name.into(),
            client_pid,
            entering_key,
            ticket_key: None,
            ticket_number: NO_TICKET,
            owner: owner.into(),
            serial: NO_SERIAL,
            home_node: home_node.into(),
            obtention_timeout,
            lock_duration,
            unlock_duration,
            alive_timeout: 0,
            lock_timeout_date: None,
            unlocked_timeout_date: None,
            get_max_ticket: false,
            added_ticket: false,
            added_ticket_quorum: false,
            ticket_ready: false,
            locked: false,
            still_entering: BTreeSet::new(),
            failure_state: FailureState::None,
        }
    }

    /// Current logical state, derived from the ticket's flags (§4.4).
    pub fn state(&self) -> TicketState {
        if self.failure_state != FailureState::None && !self.locked {
            return TicketState::Dropped;
        }
        if self.locked {
            if self.failure_state == FailureState::LockFailureUnlocking {
                return TicketState::Releasing;
            }
            return TicketState::Locked;
        }
        if self.ticket_ready {
            return TicketState::Ready;
        }
        if self.added_ticket {
            return TicketState::Exiting;
        }
        if self.ticket_key.is_some() {
            return TicketState::Numbering;
        }
        TicketState::Entering
    }

    /// Assign the ticket number computed during NUMBERING and move the
    /// ticket key into place.
    pub fn assign_ticket_number(&mut self, number: u32) {
        self.ticket_number = number;
        self.ticket_key = Some(ticket_key(number, &self.entering_key));
    }

    pub fn mark_failed(&mut self, failure: FailureState) {
        self.failure_state = failure;
    }

    /// The next deadline this ticket needs the timer wheel to fire at
    /// (§4.6), or `None` if it isn't waiting on anything timed. A
    /// re-injected ticket waiting on an ALIVE probe reply uses
    /// `alive_timeout` in place of the ordinary obtention deadline.
    pub fn current_timeout_date(&self, now: u64) -> Option<u64> {
        match self.state() {
            TicketState::Locked => self.lock_timeout_date,
            TicketState::Releasing => self.unlocked_timeout_date,
            TicketState::Dropped => None,
            _ if self.alive_timeout != 0 => Some(self.alive_timeout),
            _ => Some(now + self.obtention_timeout),
        }
    }

    pub fn timed_out(&self, now: u64) -> bool {
        matches!(self.current_timeout_date(now), Some(d) if d <= now)
    }

    /// §6.3 wire format: one `key=value` pair per field, joined with `|`,
    /// with any literal `|` inside a value percent-encoded as `%7C`.
    /// `alive_timeout` is deliberately not transferred.
    pub fn serialize(&self) -> String {
        let mut fields = vec![
            ("object_name", self.object_name.clone()),
            ("tag", self.tag.to_string()),
            ("obtention_timeout", self.obtention_timeout.to_string()),
            ("lock_duration", self.lock_duration.to_string()),
            ("unlock_duration", self.unlock_duration.to_string()),
            ("server_name", self.server_name.clone()),
            ("service_name", self.service_name.clone()),
            ("owner", self.owner.clone()),
            ("serial", self.serial.to_string()),
            ("entering_key", self.entering_key.clone()),
            ("get_max_ticket", self.get_max_ticket.to_string()),
            ("our_ticket", self.ticket_number.to_string()),
            ("added_ticket", self.added_ticket.to_string()),
            (
                "ticket_key",
                self.ticket_key.clone().unwrap_or_default(),
            ),
            (
                "added_ticket_quorum",
                self.added_ticket_quorum.to_string(),
            ),
            ("ticket_ready", self.ticket_ready.to_string()),
            ("locked", self.locked.to_string()),
            (
                "lock_timeout_date",
                self.lock_timeout_date.unwrap_or(0).to_string(),
            ),
            ("lock_failed", self.failure_state.to_string()),
        ];
        for (_, v) in fields.iter_mut() {
            if v.contains('|') {
                *v = v.replace('|', "%7C");
            }
        }
        fields
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Inverse of [`Ticket::serialize`]. Unknown fields are ignored; a
    /// missing required field is a parse error. `alive_timeout` and
    /// `home_node` are left at their `Default`s since neither is
    /// transferred.
    pub fn unserialize(line: &str) -> Result<Ticket, TicketParseError> {
        let mut map = std::collections::HashMap::new();
        for part in line.split('|') {
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| TicketParseError::Malformed(part.to_string()))?;
            map.insert(k, v.replace("%7C", "|"));
        }
        let get = |k: &'static str| -> Result<String, TicketParseError> {
            map.get(k)
                .cloned()
                .ok_or(TicketParseError::MissingField(k))
        };
        let parse_u64 = |k: &'static str, v: &str| -> Result<u64, TicketParseError> {
            v.parse().map_err(|_| TicketParseError::BadField(k, v.to_string()))
        };
        let parse_bool = |k: &'static str, v: &str| -> Result<bool, TicketParseError> {
            v.parse().map_err(|_| TicketParseError::BadField(k, v.to_string()))
        };

        let object_name = get("object_name")?;
        let tag: u16 = get("tag")?
            .parse()
            .map_err(|_| TicketParseError::BadField("tag", map["tag"].clone()))?;
        let obtention_timeout = parse_u64("obtention_timeout", &get("obtention_timeout")?)?;
        let lock_duration = parse_u64("lock_duration", &get("lock_duration")?)?;
        let unlock_duration = parse_u64("unlock_duration", &get("unlock_duration")?)?;
        let server_name = get("server_name")?;
        let service_name = get("service_name")?;
        let owner = get("owner")?;
        let serial: i32 = get("serial")?
            .parse()
            .map_err(|_| TicketParseError::BadField("serial", map["serial"].clone()))?;
        let entering_key = get("entering_key")?;
        let get_max_ticket = parse_bool("get_max_ticket", &get("get_max_ticket")?)?;
        let our_ticket: u32 = get("our_ticket")?
            .parse()
            .map_err(|_| TicketParseError::BadField("our_ticket", map["our_ticket"].clone()))?;
        let added_ticket = parse_bool("added_ticket", &get("added_ticket")?)?;
        let ticket_key_raw = get("ticket_key")?;
        let added_ticket_quorum =
            parse_bool("added_ticket_quorum", &get("added_ticket_quorum")?)?;
        let ticket_ready = parse_bool("ticket_ready", &get("ticket_ready")?)?;
        let locked = parse_bool("locked", &get("locked")?)?;
        let lock_timeout_date = parse_u64("lock_timeout_date", &get("lock_timeout_date")?)?;
        let failure_state: FailureState = get("lock_failed")?.parse()?;

        Ok(Ticket {
            object_name,
            tag,
            server_name,
            service_name,
            client_pid: entering_key
                .rsplit_once('/')
                .and_then(|(_, pid)| pid.parse().ok())
                .unwrap_or(0),
            entering_key,
            ticket_key: if ticket_key_raw.is_empty() {
                None
            } else {
                Some(ticket_key_raw)
            },
            ticket_number: our_ticket,
            owner,
            serial,
            home_node: String::new(),
            obtention_timeout,
            lock_duration,
            unlock_duration,
            alive_timeout: 0,
            lock_timeout_date: if lock_timeout_date == 0 {
                None
            } else {
                Some(lock_timeout_date)
            },
            unlocked_timeout_date: None,
            get_max_ticket,
            added_ticket,
            added_ticket_quorum,
            ticket_ready,
            locked,
            still_entering: BTreeSet::new(),
            failure_state,
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TicketParseError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("malformed key=value pair: `{0}`")]
    Malformed(String),
    #[error("invalid value for field `{0}`: `{1}`")]
    BadField(&'static str, String),
}
