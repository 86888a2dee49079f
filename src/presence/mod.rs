//! Cluster presence substrate: key-value state plus pub/sub messaging
//!
//! Everything the matchmaker shares across the cluster (node sets, room
//! counts, concurrency counters, IPC channels) goes through this interface.
//! Backends are interchangeable; the crate ships the deterministic
//! [`LocalPresence`], and remote backends implement the same trait against
//! the documented key layout.

pub mod local;

pub use local::LocalPresence;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// An ordered stream of messages for one channel subscription.
///
/// Created by [`Presence::subscribe`]; the handler is installed before the
/// call returns, so no message published afterwards is missed. Dropping the
/// subscription (or calling [`Presence::unsubscribe`]) ends the stream.
pub struct Subscription {
    channel: String,
    receiver: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, receiver: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            channel: channel.into(),
            receiver,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receive the next message on this channel. Returns `None` once the
    /// channel has been unsubscribed.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

/// The shared pub/sub + key-value substrate used for cluster state.
///
/// Guarantees required by the matchmaker:
/// - a subscriber that returns from `subscribe` has its stream installed;
/// - `publish` fan-out is best-effort and messages to channels without
///   subscribers are dropped;
/// - ordering within a single channel is preserved per subscriber.
#[async_trait]
pub trait Presence: Send + Sync {
    // set operations
    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    // hash operations
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hincrby(&self, key: &str, field: &str, by: i64) -> Result<i64>;
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    // counter operations
    async fn incr(&self, key: &str) -> Result<i64>;
    async fn decr(&self, key: &str) -> Result<i64>;
    async fn del(&self, key: &str) -> Result<()>;

    // pub/sub
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Drop every subscription this backend holds on `channel`.
    async fn unsubscribe(&self, channel: &str) -> Result<()>;
}
