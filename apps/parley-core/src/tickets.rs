use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// One-shot WebSocket handshake tickets mapping to an authenticated member.
#[derive(Clone)]
pub struct TicketStore {
    tickets: Arc<DashMap<String, (i64, Instant)>>,
    ttl: Duration,
}

impl TicketStore {
    pub fn new(ttl: Duration) -> Self { Self { tickets: Arc::new(DashMap::new()), ttl } }

    pub fn issue(&self, member_id: i64) -> String {
        self.purge_expired();
        let ticket = Uuid::new_v4().to_string();
        self.tickets.insert(ticket.clone(), (member_id, Instant::now() + self.ttl));
        ticket
    }

    /// Consumes the ticket; a second validation of the same ticket fails.
    pub fn redeem(&self, ticket: &str) -> Option<i64> {
        let (_, (member_id, expires)) = self.tickets.remove(ticket)?;
        (Instant::now() < expires).then_some(member_id)
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.tickets.retain(|_, (_, expires)| *expires > now);
    }

    pub fn len(&self) -> usize { self.tickets.len() }
    pub fn is_empty(&self) -> bool { self.tickets.is_empty() }
}
