//! Lobby channel notifications for room additions and removals
//!
//! Subscribers learn that a room appeared (fetch the full listing through a
//! `query` by room id) or went away. Unlisted rooms never reach the channel.

use crate::driver::RoomListing;
use crate::error::Result;
use crate::presence::{Presence, Subscription};
use crate::types::RoomId;
use std::sync::Arc;

/// Broadcast channel carrying room add/remove notifications.
pub const LOBBY_CHANNEL: &str = "$lobby";

/// One lobby notification, encoded on the wire as `<roomId>,<0|1>` where
/// `1` marks a removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyUpdate {
    pub room_id: RoomId,
    pub removed: bool,
}

impl LobbyUpdate {
    pub fn encode(&self) -> String {
        format!("{},{}", self.room_id, u8::from(self.removed))
    }

    pub fn decode(message: &str) -> Option<LobbyUpdate> {
        let (room_id, flag) = message.rsplit_once(',')?;
        let removed = match flag {
            "0" => false,
            "1" => true,
            _ => return None,
        };
        Some(LobbyUpdate {
            room_id: room_id.to_string(),
            removed,
        })
    }
}

/// Announce a listing change on the lobby channel.
pub async fn update_lobby(
    presence: &Arc<dyn Presence>,
    listing: &RoomListing,
    removed: bool,
) -> Result<()> {
    if listing.unlisted {
        return Ok(());
    }
    let update = LobbyUpdate {
        room_id: listing.room_id.clone(),
        removed,
    };
    presence.publish(LOBBY_CHANNEL, &update.encode()).await
}

/// Subscribe to lobby notifications. Decode each message with
/// [`LobbyUpdate::decode`].
pub async fn subscribe_lobby(presence: &Arc<dyn Presence>) -> Result<Subscription> {
    presence.subscribe(LOBBY_CHANNEL).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::LocalPresence;

    #[test]
    fn test_update_encoding() {
        let added = LobbyUpdate {
            room_id: "r1".to_string(),
            removed: false,
        };
        assert_eq!(added.encode(), "r1,0");

        let removed = LobbyUpdate {
            room_id: "r1".to_string(),
            removed: true,
        };
        assert_eq!(removed.encode(), "r1,1");

        assert_eq!(LobbyUpdate::decode("r1,1").unwrap(), removed);
        assert_eq!(LobbyUpdate::decode("r1,0").unwrap(), added);
        assert!(LobbyUpdate::decode("garbage").is_none());
        assert!(LobbyUpdate::decode("r1,2").is_none());
    }

    #[tokio::test]
    async fn test_unlisted_rooms_stay_off_the_lobby() {
        let presence: Arc<dyn Presence> = Arc::new(LocalPresence::new());
        let mut updates = subscribe_lobby(&presence).await.unwrap();

        let mut hidden = RoomListing::new("hidden", "chat", "p1");
        hidden.unlisted = true;
        update_lobby(&presence, &hidden, false).await.unwrap();

        let visible = RoomListing::new("visible", "chat", "p1");
        update_lobby(&presence, &visible, false).await.unwrap();

        // only the visible room's notification arrives
        assert_eq!(updates.recv().await.unwrap(), "visible,0");
    }
}
