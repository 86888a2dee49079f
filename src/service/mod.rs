//! Service wiring for running the matchmaker as a process

pub mod app;

pub use app::{AppState, ServiceError};
