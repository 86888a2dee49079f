//! Main application state and service coordination
//!
//! `AppState` wires the matchmaker to its presence substrate and driver,
//! joins the cluster on start and leaves it cleanly on shutdown. Backends
//! default to the local in-memory implementations; embedders inject remote
//! ones through [`AppState::with_backends`].

use crate::config::AppConfig;
use crate::discovery;
use crate::driver::{LocalDriver, MatchmakerDriver};
use crate::matchmaker::Matchmaker;
use crate::metrics::MetricsCollector;
use crate::presence::{LocalPresence, Presence};
use crate::types::Node;
use crate::utils::generate_process_id;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Shutdown error: {message}")]
    Shutdown { message: String },
}

/// Main application state containing all service components
pub struct AppState {
    config: AppConfig,
    node: Node,
    presence: Arc<dyn Presence>,
    matchmaker: Arc<Matchmaker>,
    metrics: Arc<MetricsCollector>,
    is_running: AtomicBool,
}

impl AppState {
    /// Initialize the application with the local backends.
    pub fn new(config: AppConfig) -> Result<Self, ServiceError> {
        let presence: Arc<dyn Presence> = Arc::new(LocalPresence::new());
        let driver: Arc<dyn MatchmakerDriver> = Arc::new(LocalDriver::new());
        Self::with_backends(config, presence, driver)
    }

    /// Initialize the application around injected backends.
    pub fn with_backends(
        config: AppConfig,
        presence: Arc<dyn Presence>,
        driver: Arc<dyn MatchmakerDriver>,
    ) -> Result<Self, ServiceError> {
        crate::config::validate_config(&config).map_err(|error| ServiceError::Configuration {
            message: error.to_string(),
        })?;

        let process_id = generate_process_id();
        let node = Node::new(
            process_id.clone(),
            config.node.address.clone(),
            config.node.port,
        );

        let metrics = Arc::new(MetricsCollector::new().map_err(|error| {
            ServiceError::Initialization {
                message: format!("failed to create metrics collector: {}", error),
            }
        })?);

        let matchmaker = Matchmaker::with_metrics(
            process_id,
            Arc::clone(&presence),
            driver,
            config.matchmaker_settings(),
            Arc::clone(&metrics),
        );

        Ok(Self {
            config,
            node,
            presence,
            matchmaker,
            metrics,
            is_running: AtomicBool::new(false),
        })
    }

    /// Join the cluster: start serving the process inbox and advertise this
    /// node on the discovery channel.
    pub async fn start(&self) -> Result<(), ServiceError> {
        info!(
            service = %self.config.service.name,
            node = %self.node,
            "starting matchmaking service"
        );

        self.matchmaker
            .listen()
            .await
            .map_err(|error| ServiceError::Initialization {
                message: format!("matchmaker failed to listen: {}", error),
            })?;

        discovery::register_node(&self.presence, &self.node)
            .await
            .map_err(|error| ServiceError::Initialization {
                message: format!("node registration failed: {}", error),
            })?;

        self.is_running.store(true, Ordering::SeqCst);
        info!(service = %self.config.service.name, "matchmaking service started");
        Ok(())
    }

    /// Leave the cluster: withdraw the node, then dispose every local room.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.is_running.store(false, Ordering::SeqCst);

        if let Err(error) = discovery::unregister_node(&self.presence, &self.node).await {
            warn!("node unregistration failed: {}", error);
        }

        self.matchmaker
            .graceful_shutdown()
            .await
            .map_err(|error| ServiceError::Shutdown {
                message: error.to_string(),
            })?;

        let stats = self.matchmaker.stats();
        info!(
            rooms_created = stats.rooms_created,
            rooms_disposed = stats.rooms_disposed,
            seats_reserved = stats.seats_reserved,
            "final service statistics"
        );
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn matchmaker(&self) -> &Arc<Matchmaker> {
        &self.matchmaker
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::NODES_SET;

    #[tokio::test]
    async fn test_start_and_shutdown_cycle() {
        let state = AppState::new(AppConfig::default()).unwrap();
        assert!(!state.is_running());

        state.start().await.unwrap();
        assert!(state.is_running());
        let nodes = state.presence.smembers(NODES_SET).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].contains(":2567"));

        state.shutdown().await.unwrap();
        assert!(!state.is_running());
        assert!(state.presence.smembers(NODES_SET).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_is_not_repeatable() {
        let state = AppState::new(AppConfig::default()).unwrap();
        state.start().await.unwrap();
        state.shutdown().await.unwrap();
        assert!(state.shutdown().await.is_err());
    }
}
