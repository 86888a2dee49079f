//! Error types for the matchmaking core
//!
//! Domain errors carry a fixed integer code so transports can serialize
//! `{code, error}` responses without inspecting message text.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Error codes surfaced to clients. The integer values are part of the wire
/// contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ErrorCode {
    MatchmakeNoHandler = 4210,
    MatchmakeInvalidCriteria = 4211,
    MatchmakeInvalidRoomId = 4212,
    MatchmakeUnhandled = 4213,
    MatchmakeExpired = 4214,
    MatchmakeSeatReservation = 4215,
}

impl ErrorCode {
    /// Numeric representation used in client-facing payloads.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Resolve the client-facing code for an arbitrary failure. Anything that
    /// is not a [`MatchmakeError`] reports as `MatchmakeUnhandled`.
    pub fn from_error(error: &anyhow::Error) -> ErrorCode {
        error
            .downcast_ref::<MatchmakeError>()
            .map(MatchmakeError::code)
            .unwrap_or(ErrorCode::MatchmakeUnhandled)
    }
}

/// User-surfaceable matchmaking errors
#[derive(Debug, thiserror::Error)]
pub enum MatchmakeError {
    #[error("no handler registered for \"{room_name}\"")]
    NoHandler { room_name: String },

    #[error("no rooms found with the provided criteria")]
    InvalidCriteria,

    #[error("room \"{room_id}\" not found")]
    InvalidRoomId { room_id: String },

    #[error("seat reservation expired for session \"{session_id}\"")]
    Expired { session_id: String },

    #[error("{message}")]
    Unhandled { message: String },

    #[error("{room_id} is already full.")]
    SeatReservation { room_id: String },
}

impl MatchmakeError {
    /// The fixed client-facing code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            MatchmakeError::NoHandler { .. } => ErrorCode::MatchmakeNoHandler,
            MatchmakeError::InvalidCriteria => ErrorCode::MatchmakeInvalidCriteria,
            MatchmakeError::InvalidRoomId { .. } => ErrorCode::MatchmakeInvalidRoomId,
            MatchmakeError::Expired { .. } => ErrorCode::MatchmakeExpired,
            MatchmakeError::Unhandled { .. } => ErrorCode::MatchmakeUnhandled,
            MatchmakeError::SeatReservation { .. } => ErrorCode::MatchmakeSeatReservation,
        }
    }

    /// Whether this failure means "someone took the last seat first". The
    /// join retry loops retry on this and nothing else.
    pub fn is_seat_reservation(&self) -> bool {
        matches!(self, MatchmakeError::SeatReservation { .. })
    }
}

/// Failures of the request/reply layer. Timeout is distinguishable by
/// downcast so callers can decide between fallback and propagation.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport failure: {message}")]
    Transport { message: String },

    #[error("{message}")]
    Remote { message: String },
}
