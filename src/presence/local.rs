//! Process-local presence backend

use super::{Presence, Subscription};
use crate::error::Result;
use anyhow::bail;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone)]
enum Entry {
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
    Counter(i64),
}

impl Entry {
    fn type_name(&self) -> &'static str {
        match self {
            Entry::Set(_) => "set",
            Entry::Hash(_) => "hash",
            Entry::Counter(_) => "counter",
        }
    }
}

/// Deterministic in-memory presence backend.
///
/// Process-private by construction. A single instance can also be shared by
/// several matchmakers inside one process, which is how single-node mode and
/// the multi-node test harness run without an external store.
#[derive(Default)]
pub struct LocalPresence {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
}

impl LocalPresence {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, apply: impl FnOnce(&mut HashMap<String, Entry>) -> Result<T>) -> Result<T> {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => bail!("presence state lock poisoned"),
        };
        apply(&mut entries)
    }
}

#[async_trait]
impl Presence for LocalPresence {
    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.with_entries(|entries| {
            match entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::Set(HashSet::new()))
            {
                Entry::Set(members) => {
                    members.insert(member.to_string());
                    Ok(())
                }
                other => bail!("key \"{}\" holds a {}, not a set", key, other.type_name()),
            }
        })
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        self.with_entries(|entries| {
            if let Some(Entry::Set(members)) = entries.get_mut(key) {
                members.remove(member);
            }
            Ok(())
        })
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.with_entries(|entries| match entries.get(key) {
            Some(Entry::Set(members)) => {
                let mut members: Vec<String> = members.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(other) => bail!("key \"{}\" holds a {}, not a set", key, other.type_name()),
            None => Ok(Vec::new()),
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.with_entries(|entries| {
            match entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::Hash(HashMap::new()))
            {
                Entry::Hash(fields) => {
                    fields.insert(field.to_string(), value.to_string());
                    Ok(())
                }
                other => bail!("key \"{}\" holds a {}, not a hash", key, other.type_name()),
            }
        })
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.with_entries(|entries| match entries.get(key) {
            Some(Entry::Hash(fields)) => Ok(fields.get(field).cloned()),
            Some(other) => bail!("key \"{}\" holds a {}, not a hash", key, other.type_name()),
            None => Ok(None),
        })
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.with_entries(|entries| match entries.get(key) {
            Some(Entry::Hash(fields)) => Ok(fields.clone()),
            Some(other) => bail!("key \"{}\" holds a {}, not a hash", key, other.type_name()),
            None => Ok(HashMap::new()),
        })
    }

    async fn hincrby(&self, key: &str, field: &str, by: i64) -> Result<i64> {
        self.with_entries(|entries| {
            match entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::Hash(HashMap::new()))
            {
                Entry::Hash(fields) => {
                    let current = fields
                        .get(field)
                        .and_then(|value| value.parse::<i64>().ok())
                        .unwrap_or(0);
                    let next = current + by;
                    fields.insert(field.to_string(), next.to_string());
                    Ok(next)
                }
                other => bail!("key \"{}\" holds a {}, not a hash", key, other.type_name()),
            }
        })
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        self.with_entries(|entries| {
            if let Some(Entry::Hash(fields)) = entries.get_mut(key) {
                fields.remove(field);
            }
            Ok(())
        })
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.with_entries(|entries| {
            match entries
                .entry(key.to_string())
                .or_insert(Entry::Counter(0))
            {
                Entry::Counter(value) => {
                    *value += 1;
                    Ok(*value)
                }
                other => bail!("key \"{}\" holds a {}, not a counter", key, other.type_name()),
            }
        })
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        self.with_entries(|entries| {
            match entries
                .entry(key.to_string())
                .or_insert(Entry::Counter(0))
            {
                Entry::Counter(value) => {
                    *value -= 1;
                    Ok(*value)
                }
                other => bail!("key \"{}\" holds a {}, not a counter", key, other.type_name()),
            }
        })
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.with_entries(|entries| {
            entries.remove(key);
            Ok(())
        })
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut channels = match self.channels.lock() {
            Ok(channels) => channels,
            Err(_) => bail!("presence channel lock poisoned"),
        };
        let Some(senders) = channels.get_mut(channel) else {
            // no subscriber anywhere: the message is dropped
            trace!(channel, "publish with no subscribers");
            return Ok(());
        };
        senders.retain(|sender| sender.send(message.to_string()).is_ok());
        if senders.is_empty() {
            channels.remove(channel);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut channels = match self.channels.lock() {
            Ok(channels) => channels,
            Err(_) => bail!("presence channel lock poisoned"),
        };
        channels.entry(channel.to_string()).or_default().push(sender);
        Ok(Subscription::new(channel, receiver))
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let mut channels = match self.channels.lock() {
            Ok(channels) => channels,
            Err(_) => bail!("presence channel lock poisoned"),
        };
        channels.remove(channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_operations() {
        let presence = LocalPresence::new();
        presence.sadd("nodes", "a").await.unwrap();
        presence.sadd("nodes", "b").await.unwrap();
        presence.sadd("nodes", "a").await.unwrap();
        assert_eq!(presence.smembers("nodes").await.unwrap(), vec!["a", "b"]);

        presence.srem("nodes", "a").await.unwrap();
        assert_eq!(presence.smembers("nodes").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let presence = LocalPresence::new();
        presence.hset("roomcount", "p1", "3").await.unwrap();
        assert_eq!(
            presence.hget("roomcount", "p1").await.unwrap(),
            Some("3".to_string())
        );
        assert_eq!(presence.hget("roomcount", "p2").await.unwrap(), None);

        assert_eq!(presence.hincrby("roomcount", "p1", 1).await.unwrap(), 4);
        assert_eq!(presence.hincrby("roomcount", "p2", 1).await.unwrap(), 1);

        let all = presence.hgetall("roomcount").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["p1"], "4");

        presence.hdel("roomcount", "p1").await.unwrap();
        assert_eq!(presence.hget("roomcount", "p1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_counter_operations() {
        let presence = LocalPresence::new();
        assert_eq!(presence.incr("c:chat").await.unwrap(), 1);
        assert_eq!(presence.incr("c:chat").await.unwrap(), 2);
        assert_eq!(presence.decr("c:chat").await.unwrap(), 1);

        presence.del("c:chat").await.unwrap();
        assert_eq!(presence.incr("c:chat").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wrong_type_is_rejected() {
        let presence = LocalPresence::new();
        presence.incr("key").await.unwrap();
        assert!(presence.sadd("key", "member").await.is_err());
        assert!(presence.hget("key", "field").await.is_err());
    }

    #[tokio::test]
    async fn test_pubsub_preserves_order() {
        let presence = LocalPresence::new();
        let mut subscription = presence.subscribe("events").await.unwrap();

        presence.publish("events", "one").await.unwrap();
        presence.publish("events", "two").await.unwrap();
        presence.publish("events", "three").await.unwrap();

        assert_eq!(subscription.recv().await.unwrap(), "one");
        assert_eq!(subscription.recv().await.unwrap(), "two");
        assert_eq!(subscription.recv().await.unwrap(), "three");
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_is_dropped() {
        let presence = LocalPresence::new();
        presence.publish("nobody", "lost").await.unwrap();

        let mut subscription = presence.subscribe("nobody").await.unwrap();
        presence.publish("nobody", "seen").await.unwrap();
        assert_eq!(subscription.recv().await.unwrap(), "seen");
    }

    #[tokio::test]
    async fn test_fan_out_to_multiple_subscribers() {
        let presence = LocalPresence::new();
        let mut first = presence.subscribe("fan").await.unwrap();
        let mut second = presence.subscribe("fan").await.unwrap();

        presence.publish("fan", "hello").await.unwrap();
        assert_eq!(first.recv().await.unwrap(), "hello");
        assert_eq!(second.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_the_stream() {
        let presence = LocalPresence::new();
        let mut subscription = presence.subscribe("gone").await.unwrap();
        presence.unsubscribe("gone").await.unwrap();
        assert_eq!(subscription.recv().await, None);
    }
}
