//! Pending-request bookkeeping.
//!
//! Every blocking-style request (add a symbol, submit an order, query
//! accounts...) registers a [`Callback`] so the dispatcher has somewhere to
//! route the eventual ack/response/status frame, and so a 1Hz sweep can time
//! out requests the upstream never answers. Mirrors the `API_Callback`
//! bookkeeping in the original client, generalized to a label-keyed registry.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{instrument, warn};

use crate::error::GatewayError;
use crate::Result;

/// Groups pending callbacks so metrics and timeouts can be tracked per kind
/// of request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackLabel {
    Default,
    Account,
    AddSymbol,
    Order,
    OrderStatus,
    Position,
    Timer,
}

impl CallbackLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            CallbackLabel::Default => "DEFAULT",
            CallbackLabel::Account => "ACCOUNT",
            CallbackLabel::AddSymbol => "ADDSYMBOL",
            CallbackLabel::Order => "ORDER",
            CallbackLabel::OrderStatus => "ORDERSTATUS",
            CallbackLabel::Position => "POSITION",
            CallbackLabel::Timer => "TIMER",
        }
    }
}

impl std::fmt::Display for CallbackLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single pending request. `complete` fires the waiting caller exactly
/// once; a callback left unresolved past its deadline is expired by the
/// sweep instead.
#[derive(Debug)]
pub struct Callback {
    pub id: u64,
    pub label: CallbackLabel,
    started: Instant,
    deadline: Instant,
    reply: Option<oneshot::Sender<Result<()>>>,
}

impl Callback {
    fn new(id: u64, label: CallbackLabel, timeout: Duration, reply: oneshot::Sender<Result<()>>) -> Self {
        let started = Instant::now();
        Self { id, label, started, deadline: started + timeout, reply: Some(reply) }
    }

    fn complete(&mut self, result: Result<()>) -> Duration {
        let elapsed = self.started.elapsed();
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
        elapsed
    }

    fn is_expired(&self, now: Instant) -> bool { now >= self.deadline }
}

#[derive(Debug, Default, Clone)]
pub struct LabelMetrics {
    pub count: u64,
    pub expired: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    total_ms: u64,
    samples: VecDeque<u64>,
}

const SAMPLE_CAP: usize = 1024;

impl LabelMetrics {
    fn record(&mut self, elapsed_ms: u64) {
        self.count += 1;
        self.total_ms += elapsed_ms;
        self.min_ms = if self.count == 1 { elapsed_ms } else { self.min_ms.min(elapsed_ms) };
        self.max_ms = self.max_ms.max(elapsed_ms);
        self.samples.push_back(elapsed_ms);
        if self.samples.len() > SAMPLE_CAP {
            self.samples.pop_front();
        }
    }

    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.total_ms as f64 / self.count as f64 }
    }
}

/// Owns every pending callback plus per-label timing metrics. Not `Clone`;
/// the engine holds a single instance and mutates it from its own task.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    next_id: u64,
    pending: HashMap<u64, Callback>,
    metrics: HashMap<CallbackLabel, LabelMetrics>,
    timeouts: HashMap<CallbackLabel, Duration>,
}

impl CallbackRegistry {
    pub fn new(timeouts: HashMap<CallbackLabel, u64>) -> Self {
        Self {
            timeouts: timeouts.into_iter().map(|(k, v)| (k, Duration::from_secs(v))).collect(),
            ..Default::default()
        }
    }

    /// Registers a new pending callback and returns its id plus the
    /// receiving half of the oneshot the caller should await.
    pub fn register(&mut self, label: CallbackLabel) -> (u64, oneshot::Receiver<Result<()>>) {
        let id = self.next_id;
        self.next_id += 1;
        let timeout = self.timeouts.get(&label).copied().unwrap_or(Duration::from_secs(5));
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, Callback::new(id, label, timeout, tx));
        (id, rx)
    }

    #[instrument(level = "debug", skip(self))]
    pub fn resolve(&mut self, id: u64, result: Result<()>) {
        let Some(mut callback) = self.pending.remove(&id) else { return };
        let elapsed_ms = callback.complete(result).as_millis() as u64;
        self.metrics.entry(callback.label).or_default().record(elapsed_ms);
    }

    /// Removes and fails every callback past its deadline. Called once a
    /// second from the engine's timer tick.
    pub fn sweep_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, cb)| cb.is_expired(now))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(mut callback) = self.pending.remove(&id) {
                let elapsed_ms = callback.started.elapsed().as_millis() as u64;
                warn!(label = %callback.label, elapsed_ms, "callback expired");
                callback.complete(Err(GatewayError::Timeout {
                    label: callback.label.to_string(),
                    elapsed_ms,
                }));
                let entry = self.metrics.entry(callback.label).or_default();
                entry.expired += 1;
            }
        }
    }

    pub fn metrics_for(&self, label: CallbackLabel) -> LabelMetrics {
        self.metrics.get(&label).cloned().unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize { self.pending.len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CallbackRegistry {
        CallbackRegistry::new(HashMap::from([(CallbackLabel::Order, 0)]))
    }

    #[tokio::test]
    async fn resolve_delivers_result_and_records_metrics() {
        let mut reg = registry();
        let (id, rx) = reg.register(CallbackLabel::Order);
        reg.resolve(id, Ok(()));
        assert!(rx.await.unwrap().is_ok());
        assert_eq!(reg.metrics_for(CallbackLabel::Order).count, 1);
        assert_eq!(reg.pending_count(), 0);
    }

    #[tokio::test]
    async fn sweep_expires_and_counts() {
        let mut reg = registry();
        let (_, rx) = reg.register(CallbackLabel::Order);
        tokio::time::sleep(Duration::from_millis(5)).await;
        reg.sweep_expired();
        assert!(rx.await.unwrap().is_err());
        assert_eq!(reg.metrics_for(CallbackLabel::Order).expired, 1);
    }
}
