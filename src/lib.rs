//! Arena Room - distributed matchmaking and room-lifecycle core
//!
//! Multiple server processes cooperate through a shared presence substrate
//! to advertise alive nodes, distribute newly created rooms by load, match
//! clients into public rooms, reserve seats in rooms hosted anywhere in the
//! cluster, and clean up after ungraceful shutdowns.

pub mod config;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod ipc;
pub mod lobby;
pub mod matchmaker;
pub mod metrics;
pub mod presence;
pub mod room;
pub mod service;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use driver::{LocalDriver, MatchmakerDriver, RoomListing, RoomQuery, SortRule};
pub use error::{ErrorCode, IpcError, MatchmakeError, Result};
pub use matchmaker::{
    HandlerEvent, Matchmaker, MatchmakerSettings, MatchmakerStats, RegisteredHandler,
    RoomDefinition,
};
pub use presence::{LocalPresence, Presence, Subscription};
pub use room::{Room, RoomEvent, RoomLogic};
pub use types::{ClientOptions, Node, ProcessId, RoomId, SeatReservation, SessionId};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
