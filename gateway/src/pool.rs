//! Channel lifecycle management.
//!
//! The original client opens one `RTX_Connection` per outstanding activity
//! and keeps a free list keyed by `service;topic` so a finished channel can
//! be handed straight to the next caller instead of paying a fresh `connect`
//! round trip. `ChannelPool` reproduces that: an active map keyed by channel
//! id, and an idle stack keyed by `(service, topic)`.

use std::collections::HashMap;

use uuid::Uuid;

use crate::channel::Channel;
use crate::ChannelId;

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
struct PoolKey(String, String);

pub struct ChannelPool {
    active: HashMap<ChannelId, Channel>,
    idle: HashMap<PoolKey, Vec<ChannelId>>,
}

impl Default for ChannelPool {
    fn default() -> Self { Self { active: HashMap::new(), idle: HashMap::new() } }
}

impl ChannelPool {
    pub fn new() -> Self { Self::default() }

    fn next_id() -> ChannelId { Uuid::new_v4().to_string() }

    /// Returns an idle channel for `(service, topic)` if one exists, ready
    /// to issue the next command immediately.
    pub fn checkout(&mut self, service: &str, topic: &str) -> Option<&mut Channel> {
        let key = PoolKey(service.to_string(), topic.to_string());
        let id = self.idle.get_mut(&key).and_then(Vec::pop)?;
        self.active.get_mut(&id)
    }

    /// Opens a brand-new channel, returning it plus the `connect` line that
    /// must be sent upstream.
    pub fn open(&mut self, service: impl Into<String>, topic: impl Into<String>) -> (&mut Channel, String) {
        let id = Self::next_id();
        let (channel, line) = Channel::new(id.clone(), service, topic);
        self.active.insert(id.clone(), channel);
        (self.active.get_mut(&id).expect("just inserted"), line)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Channel> { self.active.get_mut(id) }

    /// Returns a channel that has gone idle back to the free list for its
    /// `(service, topic)` pair, so the next caller can reuse it.
    pub fn release(&mut self, id: &str) {
        if let Some(channel) = self.active.get(id) {
            if channel.is_ready() {
                let key = PoolKey(channel.service.clone(), channel.topic.clone());
                self.idle.entry(key).or_default().push(id.to_string());
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Channel> {
        for ids in self.idle.values_mut() {
            ids.retain(|existing| existing != id);
        }
        self.active.remove(id)
    }

    pub fn len(&self) -> usize { self.active.len() }

    pub fn is_empty(&self) -> bool { self.active.is_empty() }

    pub fn ids(&self) -> impl Iterator<Item = &ChannelId> { self.active.keys() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_registers_active_channel() {
        let mut pool = ChannelPool::new();
        let (channel, line) = pool.open("LOGIN", "rtx");
        let id = channel.id.clone();
        assert!(line.starts_with("connect "));
        assert_eq!(pool.len(), 1);
        assert!(pool.get_mut(&id).is_some());
    }

    #[test]
    fn release_and_checkout_round_trip() {
        let mut pool = ChannelPool::new();
        let (channel, _) = pool.open("ORDERS", "rtx");
        let id = channel.id.clone();
        channel.receive("ack", &serde_json::json!("CONNECTION PENDING"));
        channel.receive("status", &serde_json::json!({"msg": "OnInitAck", "status": "1"}));
        pool.release(&id);
        let reused = pool.checkout("ORDERS", "rtx").unwrap();
        assert_eq!(reused.id, id);
    }
}
