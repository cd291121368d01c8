//! In-memory `TicketStore` (§4.3), the one production implementation.
//!
//! Grounded on the teacher's `MemoryStore`: a plain struct of maps behind
//! one `RwLock`, never behind per-field locks.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::store::TicketStore;
use crate::ticket::Ticket;

#[derive(Default)]
struct Inner {
    /// object_name -> entering_key -> ticket
    entering: BTreeMap<String, BTreeMap<String, Ticket>>,
    /// object_name -> ticket_key -> ticket
    tickets: BTreeMap<String, BTreeMap<String, Ticket>>,
}

#[derive(Default)]
pub struct InMemoryTicketStore {
    inner: RwLock<Inner>,
}

impl InMemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TicketStore for InMemoryTicketStore {
    async fn insert_entering(&self, ticket: Ticket) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .entering
            .entry(ticket.object_name.clone())
            .or_default()
            .insert(ticket.entering_key.clone(), ticket);
        Ok(())
    }

    async fn get_entering(&self, object_name: &str, entering_key: &str) -> Result<Option<Ticket>> {
        let inner = self.inner.read().await;
        Ok(inner
            .entering
            .get(object_name)
            .and_then(|m| m.get(entering_key))
            .cloned())
    }

    async fn remove_entering(&self, object_name: &str, entering_key: &str) -> Result<Option<Ticket>> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .entering
            .get_mut(object_name)
            .and_then(|m| m.remove(entering_key)))
    }

    async fn entering_snapshot(&self, object_name: &str) -> Result<Vec<Ticket>> {
        let inner = self.inner.read().await;
        Ok(inner
            .entering
            .get(object_name)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_ticket(&self, ticket: Ticket) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = ticket
            .ticket_key
            .clone()
            .expect("insert_ticket requires a numbered ticket");
        inner
            .tickets
            .entry(ticket.object_name.clone())
            .or_default()
            .insert(key, ticket);
        Ok(())
    }

    async fn get_ticket(&self, object_name: &str, ticket_key: &str) -> Result<Option<Ticket>> {
        let inner = self.inner.read().await;
        Ok(inner
            .tickets
            .get(object_name)
            .and_then(|m| m.get(ticket_key))
            .cloned())
    }

    async fn remove_ticket(&self, object_name: &str, ticket_key: &str) -> Result<Option<Ticket>> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .tickets
            .get_mut(object_name)
            .and_then(|m| m.remove(ticket_key)))
    }

    async fn last_ticket_number(&self, object_name: &str) -> Result<u32> {
        let inner = self.inner.read().await;
        Ok(inner
            .tickets
            .get(object_name)
            .and_then(|m| m.values().map(|t| t.ticket_number).max())
            .unwrap_or(0))
    }

    async fn first_ticket(&self, object_name: &str) -> Result<Option<Ticket>> {
        let inner = self.inner.read().await;
        Ok(inner
            .tickets
            .get(object_name)
            .and_then(|m| m.values().next())
            .cloned())
    }

    async fn tickets_for_object(&self, object_name: &str) -> Result<Vec<Ticket>> {
        let inner = self.inner.read().await;
        Ok(inner
            .tickets
            .get(object_name)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn all_tickets(&self) -> Result<Vec<Ticket>> {
        let inner = self.inner.read().await;
        Ok(inner
            .tickets
            .values()
            .flat_map(|m| m.values().cloned())
            .collect())
    }

    async fn all_entering(&self) -> Result<Vec<Ticket>> {
        let inner = self.inner.read().await;
        Ok(inner
            .entering
            .values()
            .flat_map(|m| m.values().cloned())
            .collect())
    }

    async fn replace_ticket(&self, ticket: Ticket) -> Result<()> {
        self.insert_ticket(ticket).await
    }
}
