//! Persistence trait for ticket state (§3, §4.3).
//!
//! The engine operates exclusively through this trait, mirroring the
//! teacher's `ProcessStore` split: one production implementation today
//! (`InMemoryTicketStore`), with the seam kept open for a future durable
//! backend without touching call sites. There is deliberately no such
//! backend yet — see DESIGN.md for why persistence across a full cluster
//! restart is a non-goal.

use async_trait::async_trait;

use crate::error::Result;
use crate::ticket::Ticket;

#[async_trait]
pub trait TicketStore: Send + Sync {
    // ── Entering map ──

    async fn insert_entering(&self, ticket: Ticket) -> Result<()>;
    async fn get_entering(&self, object_name: &str, entering_key: &str) -> Result<Option<Ticket>>;
    async fn remove_entering(&self, object_name: &str, entering_key: &str) -> Result<Option<Ticket>>;
    async fn entering_snapshot(&self, object_name: &str) -> Result<Vec<Ticket>>;

    // ── Numbered ticket map ──

    async fn insert_ticket(&self, ticket: Ticket) -> Result<()>;
    async fn get_ticket(&self, object_name: &str, ticket_key: &str) -> Result<Option<Ticket>>;
    async fn remove_ticket(&self, object_name: &str, ticket_key: &str) -> Result<Option<Ticket>>;

    /// Largest `ticket_number` currently present for `object_name`, or 0.
    async fn last_ticket_number(&self, object_name: &str) -> Result<u32>;

    /// The lexicographically first (i.e. next-to-activate) ticket for
    /// `object_name`, if any.
    async fn first_ticket(&self, object_name: &str) -> Result<Option<Ticket>>;

    /// All numbered tickets for `object_name`, in key order.
    async fn tickets_for_object(&self, object_name: &str) -> Result<Vec<Ticket>>;

    /// Every numbered ticket across every object, for timer-wheel scans and
    /// leader-loss reassignment.
    async fn all_tickets(&self) -> Result<Vec<Ticket>>;
    async fn all_entering(&self) -> Result<Vec<Ticket>>;

    /// Overwrite a numbered ticket in place (upsert by `object_name` +
    /// `ticket_key`). Callers read-modify-write: fetch with
    /// [`TicketStore::get_ticket`], mutate the returned copy, then call
    /// this to persist it — kept as a plain overwrite rather than a
    /// generic in-place-mutation closure so the trait stays object-safe
    /// for `Arc<dyn TicketStore>`.
    async fn replace_ticket(&self, ticket: Ticket) -> Result<()>;
}
