//! Configuration management for the matchmaking core

pub mod app;

pub use app::{
    validate_config, AppConfig, MatchmakingSettings, NodeSettings, ServiceSettings,
};
