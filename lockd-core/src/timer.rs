//! Timer wheel (§4.6): one logical re-armed timer across every ticket's
//! current deadline and every cached request's obtention deadline.
//!
//! This module only computes *when* the next fire should be; the actual
//! `tokio::time::Sleep` re-arming happens in `lockd-server`, which owns the
//! event loop. Keeping the computation pure makes it trivially testable
//! without a runtime.

use crate::cache::MessageCache;
use crate::ticket::Ticket;

/// The smallest deadline across all in-flight tickets and cached requests,
/// or `None` if nothing is waiting on a timer at all.
pub fn next_deadline(now: u64, tickets: &[Ticket], cache: &MessageCache) -> Option<u64> {
    let ticket_min = tickets
        .iter()
        .filter_map(|t| t.current_timeout_date(now))
        .min();
    let cache_min = cache.next_deadline();
    match (ticket_min, cache_min) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Tickets whose current deadline has passed as of `now` — the set the
/// engine must call `lock_failed()` on and then erase, per §4.6.
pub fn expired_tickets<'a>(now: u64, tickets: &'a [Ticket]) -> Vec<&'a Ticket> {
    tickets.iter().filter(|t| t.timed_out(now)).collect()
}
