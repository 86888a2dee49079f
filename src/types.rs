//! Common types used throughout the matchmaking core

use crate::driver::RoomListing;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a process participating in the cluster
pub type ProcessId = String;

/// Unique identifier of a room
pub type RoomId = String;

/// Unique identifier of a client session
pub type SessionId = String;

/// Client-supplied options, opaque at the boundary. Handlers project typed
/// filter fields out of this map via their `filter_by` keys.
pub type ClientOptions = serde_json::Map<String, serde_json::Value>;

/// A process participating in the cluster, advertised on the discovery
/// channel so proxies can route to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub process_id: ProcessId,
    pub address: String,
    pub port: u16,
}

impl Node {
    pub fn new(process_id: impl Into<ProcessId>, address: impl Into<String>, port: u16) -> Self {
        Self {
            process_id: process_id.into(),
            address: address.into(),
            port,
        }
    }

    /// Externalized form `<processId>/<address>:<port>`. The IPv6 any-address
    /// is bracketed so the port separator stays unambiguous.
    pub fn external_address(&self) -> String {
        let address = if self.address == "::" {
            "[::]".to_string()
        } else {
            self.address.clone()
        };
        format!("{}/{}:{}", self.process_id, address, self.port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.external_address())
    }
}

/// A granted seat: the listing of the room that accepted the session, and
/// the session id the client must present on its subsequent connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatReservation {
    pub room: RoomListing,
    pub session_id: SessionId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_address_format() {
        let node = Node::new("proc-1", "10.0.0.4", 2567);
        assert_eq!(node.external_address(), "proc-1/10.0.0.4:2567");
        assert_eq!(node.to_string(), "proc-1/10.0.0.4:2567");
    }

    #[test]
    fn test_external_address_brackets_ipv6_any() {
        let node = Node::new("proc-2", "::", 2567);
        assert_eq!(node.external_address(), "proc-2/[::]:2567");
    }

    #[test]
    fn test_seat_reservation_serializes_camel_case() {
        let reservation = SeatReservation {
            room: RoomListing::new("r1", "chat", "proc-1"),
            session_id: "sess-1".to_string(),
        };
        let value = serde_json::to_value(&reservation).unwrap();
        assert_eq!(value["sessionId"], "sess-1");
        assert_eq!(value["room"]["roomId"], "r1");
    }
}
