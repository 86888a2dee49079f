//! Metrics collection for the matchmaking core

pub mod collector;

pub use collector::{IpcMetrics, MetricsCollector, RoomMetrics};
