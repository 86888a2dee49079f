//! Metrics collection using Prometheus
//!
//! The registry is exposed programmatically; embedders decide how to
//! publish it.

use anyhow::Result;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Main metrics collector for the matchmaking core
#[derive(Clone)]
pub struct MetricsCollector {
    registry: Arc<Registry>,
    room_metrics: RoomMetrics,
    ipc_metrics: IpcMetrics,
}

/// Room lifecycle metrics
#[derive(Clone)]
pub struct RoomMetrics {
    /// Rooms currently owned by this process
    pub active_rooms: IntGauge,

    /// Total rooms created, by room type
    pub rooms_created_total: IntCounterVec,

    /// Total rooms disposed, by room type
    pub rooms_disposed_total: IntCounterVec,

    /// Seat reservations by outcome (accepted / rejected)
    pub seat_reservations_total: IntCounterVec,
}

/// IPC request metrics
#[derive(Clone)]
pub struct IpcMetrics {
    /// Outbound IPC requests by kind (create_room / room_call)
    pub requests_total: IntCounterVec,

    /// Requests that ran into the remote room timeout
    pub timeouts_total: IntCounter,
}

impl MetricsCollector {
    /// Create a collector with a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let room_metrics = RoomMetrics {
            active_rooms: IntGauge::with_opts(Opts::new(
                "arena_active_rooms",
                "Rooms currently owned by this process",
            ))?,
            rooms_created_total: IntCounterVec::new(
                Opts::new("arena_rooms_created_total", "Total rooms created"),
                &["room_name"],
            )?,
            rooms_disposed_total: IntCounterVec::new(
                Opts::new("arena_rooms_disposed_total", "Total rooms disposed"),
                &["room_name"],
            )?,
            seat_reservations_total: IntCounterVec::new(
                Opts::new(
                    "arena_seat_reservations_total",
                    "Seat reservations by outcome",
                ),
                &["outcome"],
            )?,
        };

        let ipc_metrics = IpcMetrics {
            requests_total: IntCounterVec::new(
                Opts::new("arena_ipc_requests_total", "Outbound IPC requests by kind"),
                &["kind"],
            )?,
            timeouts_total: IntCounter::with_opts(Opts::new(
                "arena_ipc_timeouts_total",
                "IPC requests that timed out",
            ))?,
        };

        registry.register(Box::new(room_metrics.active_rooms.clone()))?;
        registry.register(Box::new(room_metrics.rooms_created_total.clone()))?;
        registry.register(Box::new(room_metrics.rooms_disposed_total.clone()))?;
        registry.register(Box::new(room_metrics.seat_reservations_total.clone()))?;
        registry.register(Box::new(ipc_metrics.requests_total.clone()))?;
        registry.register(Box::new(ipc_metrics.timeouts_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            room_metrics,
            ipc_metrics,
        })
    }

    /// The underlying registry, for embedding into an exporter.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn rooms(&self) -> &RoomMetrics {
        &self.room_metrics
    }

    pub fn ipc(&self) -> &IpcMetrics {
        &self.ipc_metrics
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("metrics registry construction cannot fail on a fresh registry")
    }
}
