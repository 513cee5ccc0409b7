//! Downstream client registry and fan-out.
//!
//! Every connected trading client gets a line-oriented feed of the same
//! broadcast stream: quotes, trades, order status, account changes. A
//! `tokio::sync::broadcast` channel plays the role of `WriteAllClients`,
//! and `ClientRegistry` exists only so symbol/account subscriptions can be
//! torn down when a client disconnects.

use tokio::sync::broadcast;

use crate::ClientId;

const BROADCAST_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub enum DownstreamEvent {
    Accounts(Vec<String>),
    CurrentAccount(String),
    ConnectionStatusChanged(String),
    Quote { symbol: String, line: String },
    Trade { symbol: String, line: String },
    Time(String),
    OrderStatus { permid: String, line: String },
    Position { account: String, symbol: String, quantity: f64 },
    AccountData { account: String, json: String },
    Error { id: String, message: String },
}

impl DownstreamEvent {
    /// Renders the event to the prefixed wire line format clients expect.
    pub fn to_line(&self) -> String {
        match self {
            DownstreamEvent::Accounts(accounts) => {
                format!("accounts: {}", serde_json::to_string(accounts).unwrap_or_default())
            }
            DownstreamEvent::CurrentAccount(account) => format!("current-account: {account}"),
            DownstreamEvent::ConnectionStatusChanged(status) => format!("connection-status-changed: {status}"),
            DownstreamEvent::Quote { symbol, line } => format!("quote.{symbol}:{line}"),
            DownstreamEvent::Trade { symbol, line } => format!("trade.{symbol}:{line}"),
            DownstreamEvent::Time(ts) => format!("time: {ts}"),
            DownstreamEvent::OrderStatus { permid, line } => format!("order.{permid} {line}"),
            DownstreamEvent::Position { account, symbol, quantity } => {
                format!("position.{symbol}: {account} {quantity}")
            }
            DownstreamEvent::AccountData { account, json } => format!("account-data.{account}: {json}"),
            DownstreamEvent::Error { id, message } => format!("error: {id} {message}"),
        }
    }
}

/// Hub every downstream client subscribes to. Cloning the sender is cheap
/// and is how the engine hands out the feed to each accepted connection.
#[derive(Debug, Clone)]
pub struct DownstreamHub {
    tx: broadcast::Sender<DownstreamEvent>,
}

impl Default for DownstreamHub {
    fn default() -> Self { Self { tx: broadcast::channel(BROADCAST_CAPACITY).0 } }
}

impl DownstreamHub {
    pub fn new() -> Self { Self::default() }

    pub fn subscribe(&self) -> broadcast::Receiver<DownstreamEvent> { self.tx.subscribe() }

    /// Broadcasts one event. Errors only when there are no subscribers,
    /// which is routine (no clients connected yet) and not worth logging.
    pub fn publish(&self, event: DownstreamEvent) { let _ = self.tx.send(event); }
}

/// Tracks connected clients so per-client cleanup (symbol unsubscription on
/// close) has somewhere to look up what a client held.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    next_id: ClientId,
    open: std::collections::HashSet<ClientId>,
}

impl ClientRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn open_client(&mut self) -> ClientId {
        let id = self.next_id;
        self.next_id += 1;
        self.open.insert(id);
        id
    }

    pub fn close_client(&mut self, id: ClientId) { self.open.remove(&id); }

    pub fn is_open(&self, id: ClientId) -> bool { self.open.contains(&id) }

    pub fn len(&self) -> usize { self.open.len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_event_renders_prefixed_line() {
        let event = DownstreamEvent::Quote { symbol: "AAPL".into(), line: "10 5 10.1 3".into() };
        assert_eq!(event.to_line(), "quote.AAPL:10 5 10.1 3");
    }

    #[test]
    fn client_registry_assigns_increasing_ids() {
        let mut registry = ClientRegistry::new();
        let a = registry.open_client();
        let b = registry.open_client();
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        registry.close_client(a);
        assert!(!registry.is_open(a));
        assert!(registry.is_open(b));
    }

    #[tokio::test]
    async fn hub_delivers_to_subscriber() {
        let hub = DownstreamHub::new();
        let mut rx = hub.subscribe();
        hub.publish(DownstreamEvent::Time("12:00:00".into()));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.to_line(), "time: 12:00:00");
    }
}
