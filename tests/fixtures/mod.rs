//! Test fixtures for integration testing
//!
//! A cluster fixture shares one presence substrate and one listing store
//! between several matchmakers, which is exactly how multi-node behavior is
//! exercised without an external backend.

use arena_room::driver::{LocalDriver, MatchmakerDriver};
use arena_room::matchmaker::{Matchmaker, MatchmakerSettings, RoomDefinition};
use arena_room::presence::{LocalPresence, Presence};
use arena_room::room::{Room, RoomLogic};
use arena_room::types::ClientOptions;
use arena_room::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A plain game room: honors a `maxClients` create option, otherwise
/// unbounded.
pub struct GameRoom;

#[async_trait]
impl RoomLogic for GameRoom {
    async fn on_create(&self, room: &Room, options: &ClientOptions) -> Result<()> {
        if let Some(max_clients) = options.get("maxClients").and_then(Value::as_u64) {
            room.set_max_clients(max_clients as u32);
        }
        Ok(())
    }
}

/// Definition used by most scenarios.
pub fn chat_definition() -> RoomDefinition {
    RoomDefinition::new(|| GameRoom)
}

/// A room whose dispose hook takes a while, for shutdown timing tests.
pub struct SlowDisposeRoom {
    delay: Duration,
}

#[async_trait]
impl RoomLogic for SlowDisposeRoom {
    async fn on_dispose(&self, _room: &Room) {
        tokio::time::sleep(self.delay).await;
    }
}

pub fn slow_dispose_definition(delay: Duration) -> RoomDefinition {
    RoomDefinition::new(move || SlowDisposeRoom { delay })
}

/// Settings tuned for tests: short IPC timeout, fast retries.
pub fn test_settings() -> MatchmakerSettings {
    MatchmakerSettings {
        remote_room_timeout: Duration::from_millis(200),
        retry_backoff: Duration::from_millis(5),
        ..MatchmakerSettings::default()
    }
}

/// A cluster of matchmakers sharing one substrate.
pub struct TestCluster {
    pub presence: Arc<dyn Presence>,
    pub driver: Arc<dyn MatchmakerDriver>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            presence: Arc::new(LocalPresence::new()),
            driver: Arc::new(LocalDriver::new()),
        }
    }

    /// Spin up one node. The caller decides whether it listens.
    pub fn node(&self, process_id: &str) -> Arc<Matchmaker> {
        Matchmaker::new(
            process_id.to_string(),
            Arc::clone(&self.presence),
            Arc::clone(&self.driver),
            test_settings(),
        )
    }
}

/// Build client options from JSON pairs.
pub fn options(pairs: &[(&str, Value)]) -> ClientOptions {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
