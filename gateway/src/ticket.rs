//! Staged order tickets.
//!
//! A staged order ticket behaves like an order that hasn't been released to
//! the exchange yet: it's created with the same `ORDERS` poke (tagged
//! `ORDER_TAG`) and tracked by its client-assigned id until the upstream
//! confirms it, mirroring `create_staged_order_ticket`/`pending_tickets`.

use std::collections::HashMap;

use uuid::Uuid;

use crate::order::Order;
use crate::FieldMap;

#[derive(Debug, Default)]
pub struct TicketBook {
    tickets: HashMap<String, Order>,
    pending: HashMap<String, Order>,
}

/// `T-<uuid>`, matching the original's staged-ticket id format.
pub fn new_ticket_id() -> String { format!("T-{}", Uuid::new_v4()) }

impl TicketBook {
    pub fn new() -> Self { Self::default() }

    pub fn track_pending(&mut self, ticket_id: impl Into<String>) {
        let id = ticket_id.into();
        self.pending.entry(id.clone()).or_insert_with(|| Order::new(id));
    }

    /// Applies the upstream's confirmation row for a staged ticket, keyed by
    /// `CLIENT_ORDER_ID`.
    pub fn apply(&mut self, ticket_id: &str, data: FieldMap) -> Option<FieldMap> {
        let mut order = self.pending.remove(ticket_id)?;
        order.update(data);
        let rendered = order.render();
        self.tickets.insert(ticket_id.to_string(), order);
        Some(rendered)
    }

    pub fn get(&self, ticket_id: &str) -> Option<&Order> { self.tickets.get(ticket_id) }

    pub fn len(&self) -> usize { self.tickets.len() }

    pub fn is_empty(&self) -> bool { self.tickets.is_empty() }
}
