//! Room shell consumed by the matchmaker
//!
//! The room's own game loop and client protocol live behind [`RoomLogic`].
//! The shell owns what the matchmaker relies on: seat bookkeeping, lock
//! state, the cluster listing, and lifecycle event emission. Events are
//! delivered over a typed channel consumed by a single matchmaker task, in
//! emission order.

use crate::driver::{MatchmakerDriver, RoomListing};
use crate::error::{MatchmakeError, Result};
use crate::presence::Presence;
use crate::types::{ClientOptions, RoomId, SessionId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Matchmaker-visible room lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoomInternalState {
    Creating = 0,
    Created = 1,
    Disposing = 2,
}

impl RoomInternalState {
    fn from_u8(value: u8) -> RoomInternalState {
        match value {
            0 => RoomInternalState::Creating,
            1 => RoomInternalState::Created,
            _ => RoomInternalState::Disposing,
        }
    }
}

/// Events emitted by a room. `Dispose` and `Disconnect` are emitted once,
/// in that order; `Disconnect` is the last event a room ever emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    Lock,
    Unlock,
    Join { session_id: SessionId },
    Leave { session_id: SessionId },
    Dispose,
    Disconnect,
}

/// Game-specific behavior plugged into the shell. Implementations keep their
/// own state behind interior mutability; the shell calls them through `&self`.
#[async_trait]
pub trait RoomLogic: Send + Sync {
    /// Called once right after the room has been placed, with the client
    /// options merged under the handler's defaults. Failing here aborts the
    /// room creation.
    async fn on_create(&self, room: &Room, options: &ClientOptions) -> Result<()> {
        let _ = (room, options);
        Ok(())
    }

    /// Called as the room is being disposed.
    async fn on_dispose(&self, room: &Room) {
        let _ = room;
    }
}

/// Factory producing one [`RoomLogic`] per created room.
pub type RoomFactory = Arc<dyn Fn() -> Box<dyn RoomLogic> + Send + Sync>;

/// A room owned by this process. Exactly one process owns each room; the
/// matchmaker routes `$<roomId>` invocations to this object while it holds
/// the subscription.
pub struct Room {
    room_id: RoomId,
    room_name: String,
    presence: Arc<dyn Presence>,
    driver: Arc<dyn MatchmakerDriver>,
    listing: RwLock<RoomListing>,
    logic: Box<dyn RoomLogic>,
    internal_state: AtomicU8,
    max_clients: AtomicU32,
    locked: AtomicBool,
    auto_locked: AtomicBool,
    clients: AtomicU32,
    reservations: Mutex<HashMap<SessionId, ClientOptions>>,
    events: mpsc::UnboundedSender<RoomEvent>,
    disposed: watch::Sender<bool>,
}

impl Room {
    /// Build a room shell around `logic`. Returns the shared handle and the
    /// event stream the matchmaker consumes.
    pub fn new(
        room_id: RoomId,
        room_name: String,
        presence: Arc<dyn Presence>,
        driver: Arc<dyn MatchmakerDriver>,
        listing: RoomListing,
        logic: Box<dyn RoomLogic>,
    ) -> (Arc<Room>, mpsc::UnboundedReceiver<RoomEvent>) {
        let (events, event_stream) = mpsc::unbounded_channel();
        let (disposed, _) = watch::channel(false);
        let room = Arc::new(Room {
            room_id,
            room_name,
            presence,
            driver,
            listing: RwLock::new(listing),
            logic,
            internal_state: AtomicU8::new(RoomInternalState::Creating as u8),
            max_clients: AtomicU32::new(u32::MAX),
            locked: AtomicBool::new(false),
            auto_locked: AtomicBool::new(false),
            clients: AtomicU32::new(0),
            reservations: Mutex::new(HashMap::new()),
            events,
            disposed,
        });
        (room, event_stream)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    pub fn presence(&self) -> &Arc<dyn Presence> {
        &self.presence
    }

    pub fn internal_state(&self) -> RoomInternalState {
        RoomInternalState::from_u8(self.internal_state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_internal_state(&self, state: RoomInternalState) {
        self.internal_state.store(state as u8, Ordering::SeqCst);
    }

    pub fn max_clients(&self) -> u32 {
        self.max_clients.load(Ordering::SeqCst)
    }

    /// Cap the number of clients. Usually called from `on_create`.
    pub fn set_max_clients(&self, max_clients: u32) {
        self.max_clients.store(max_clients, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn client_count(&self) -> u32 {
        self.clients.load(Ordering::SeqCst)
    }

    /// Snapshot of the cluster-visible listing.
    pub fn listing(&self) -> RoomListing {
        match self.listing.read() {
            Ok(listing) => listing.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Mark the listing private. Private rooms are never returned by
    /// availability queries, only by id.
    pub async fn set_private(&self, is_private: bool) {
        self.update_listing(|listing| listing.is_private = is_private);
        self.persist_listing().await;
    }

    /// Hide the room from the lobby channel entirely.
    pub fn set_unlisted(&self, unlisted: bool) {
        self.update_listing(|listing| listing.unlisted = unlisted);
    }

    fn update_listing(&self, apply: impl FnOnce(&mut RoomListing)) {
        match self.listing.write() {
            Ok(mut listing) => apply(&mut listing),
            Err(poisoned) => apply(&mut poisoned.into_inner()),
        }
    }

    /// Copy the live counters into the listing record.
    pub(crate) fn sync_listing(&self) {
        let max_clients = self.max_clients();
        let clients = self.client_count();
        let locked = self.is_locked();
        self.update_listing(|listing| {
            listing.max_clients = max_clients;
            listing.clients = clients;
            listing.locked = locked;
        });
    }

    /// Persist the current listing through the driver.
    pub(crate) async fn save_listing(&self) -> Result<()> {
        let snapshot = self.listing();
        self.driver.save(&snapshot).await
    }

    async fn persist_listing(&self) {
        if let Err(error) = self.save_listing().await {
            warn!(room_id = %self.room_id, "failed to persist listing: {}", error);
        }
    }

    /// Book a seat for `session_id`. Refused when the room is disposing,
    /// locked, or at capacity. Filling the last seat locks the room until a
    /// seat frees up again.
    pub async fn reserve_seat(&self, session_id: SessionId, options: ClientOptions) -> bool {
        if self.internal_state() == RoomInternalState::Disposing || self.is_locked() {
            return false;
        }
        let fills_room = {
            let Ok(mut reservations) = self.reservations.lock() else {
                return false;
            };
            let occupied = self.client_count() as u64 + reservations.len() as u64;
            if occupied >= u64::from(self.max_clients()) {
                return false;
            }
            reservations.insert(session_id, options);
            occupied + 1 >= u64::from(self.max_clients())
        };
        if fills_room {
            self.lock_automatically().await;
        }
        true
    }

    /// Whether `session_id` still holds a seat.
    pub fn has_reserved_seat(&self, session_id: &str) -> bool {
        self.reservations
            .lock()
            .map(|reservations| reservations.contains_key(session_id))
            .unwrap_or(false)
    }

    /// Complete a reservation when the client's connection arrives.
    pub async fn client_join(&self, session_id: &str) -> Result<()> {
        let reserved = self
            .reservations
            .lock()
            .map(|mut reservations| reservations.remove(session_id).is_some())
            .unwrap_or(false);
        if !reserved {
            return Err(MatchmakeError::Expired {
                session_id: session_id.to_string(),
            }
            .into());
        }
        let clients = self.clients.fetch_add(1, Ordering::SeqCst) + 1;
        self.update_listing(|listing| listing.clients = clients);
        self.persist_listing().await;
        self.emit(RoomEvent::Join {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// Release a client's seat. Undoes an automatic lock once capacity frees.
    pub async fn client_leave(&self, session_id: &str) {
        let previous = self
            .clients
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                Some(count.saturating_sub(1))
            })
            .unwrap_or(0);
        let clients = previous.saturating_sub(1);
        self.update_listing(|listing| listing.clients = clients);
        self.persist_listing().await;
        self.emit(RoomEvent::Leave {
            session_id: session_id.to_string(),
        });

        let occupied = clients as u64
            + self
                .reservations
                .lock()
                .map(|reservations| reservations.len() as u64)
                .unwrap_or(0);
        if occupied < u64::from(self.max_clients()) {
            self.unlock_automatically().await;
        }
    }

    /// Lock the room. The listing flag is persisted before the event is
    /// emitted, so availability queries and the IPC subscription can never
    /// disagree for long.
    pub async fn lock(&self) {
        self.auto_locked.store(false, Ordering::SeqCst);
        if self.locked.swap(true, Ordering::SeqCst) {
            return;
        }
        self.update_listing(|listing| listing.locked = true);
        self.persist_listing().await;
        self.emit(RoomEvent::Lock);
    }

    async fn lock_automatically(&self) {
        if self.locked.swap(true, Ordering::SeqCst) {
            return;
        }
        self.auto_locked.store(true, Ordering::SeqCst);
        self.update_listing(|listing| listing.locked = true);
        self.persist_listing().await;
        self.emit(RoomEvent::Lock);
    }

    /// Unlock the room, whether it was locked manually or automatically.
    pub async fn unlock(&self) {
        self.auto_locked.store(false, Ordering::SeqCst);
        if !self.locked.swap(false, Ordering::SeqCst) {
            return;
        }
        self.update_listing(|listing| listing.locked = false);
        self.persist_listing().await;
        self.emit(RoomEvent::Unlock);
    }

    async fn unlock_automatically(&self) {
        // manual locks are never undone by capacity changes
        if !self.auto_locked.swap(false, Ordering::SeqCst) {
            return;
        }
        if !self.locked.swap(false, Ordering::SeqCst) {
            return;
        }
        self.update_listing(|listing| listing.locked = false);
        self.persist_listing().await;
        self.emit(RoomEvent::Unlock);
    }

    /// Tear the room down. Emits `Dispose` then `Disconnect` exactly once.
    pub async fn dispose(&self) {
        let previous = self
            .internal_state
            .swap(RoomInternalState::Disposing as u8, Ordering::SeqCst);
        if previous == RoomInternalState::Disposing as u8 {
            return;
        }
        self.logic.on_dispose(self).await;
        self.emit(RoomEvent::Dispose);
        self.emit(RoomEvent::Disconnect);
    }

    /// Disconnect the room: client connections belong to the transport, so
    /// from the matchmaker's side this drives straight into disposal.
    pub async fn disconnect(&self) -> Result<()> {
        self.dispose().await;
        Ok(())
    }

    pub(crate) async fn invoke_on_create(&self, options: &ClientOptions) -> Result<()> {
        self.logic.on_create(self, options).await
    }

    pub(crate) fn mark_disposed(&self) {
        let _ = self.disposed.send(true);
    }

    /// Wait until the matchmaker has fully torn this room down.
    pub async fn wait_disposed(&self) {
        let mut watcher = self.disposed.subscribe();
        loop {
            if *watcher.borrow() {
                return;
            }
            if watcher.changed().await.is_err() {
                return;
            }
        }
    }

    fn emit(&self, event: RoomEvent) {
        if self.events.send(event.clone()).is_err() {
            debug!(room_id = %self.room_id, ?event, "event dropped, no consumer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::LocalDriver;
    use crate::presence::LocalPresence;

    struct NoopLogic;

    #[async_trait]
    impl RoomLogic for NoopLogic {}

    fn test_room() -> (Arc<Room>, mpsc::UnboundedReceiver<RoomEvent>) {
        let presence: Arc<dyn Presence> = Arc::new(LocalPresence::new());
        let driver: Arc<dyn MatchmakerDriver> = Arc::new(LocalDriver::new());
        let listing = RoomListing::new("r1", "chat", "p1");
        Room::new(
            "r1".to_string(),
            "chat".to_string(),
            presence,
            driver,
            listing,
            Box::new(NoopLogic),
        )
    }

    #[tokio::test]
    async fn test_reserve_and_consume_seat() {
        let (room, _events) = test_room();
        assert!(room.reserve_seat("s1".to_string(), ClientOptions::new()).await);
        assert!(room.has_reserved_seat("s1"));
        assert!(!room.has_reserved_seat("s2"));

        room.client_join("s1").await.unwrap();
        assert!(!room.has_reserved_seat("s1"));
        assert_eq!(room.client_count(), 1);
    }

    #[tokio::test]
    async fn test_join_without_reservation_is_expired() {
        let (room, _events) = test_room();
        let error = room.client_join("ghost").await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<MatchmakeError>(),
            Some(MatchmakeError::Expired { .. })
        ));
    }

    #[tokio::test]
    async fn test_capacity_auto_locks_and_leave_unlocks() {
        let (room, mut events) = test_room();
        room.set_max_clients(2);

        assert!(room.reserve_seat("s1".to_string(), ClientOptions::new()).await);
        assert!(!room.is_locked());
        assert!(room.reserve_seat("s2".to_string(), ClientOptions::new()).await);
        assert!(room.is_locked());
        assert_eq!(events.recv().await.unwrap(), RoomEvent::Lock);

        // full room refuses further seats
        assert!(!room.reserve_seat("s3".to_string(), ClientOptions::new()).await);

        room.client_join("s1").await.unwrap();
        room.client_join("s2").await.unwrap();
        room.client_leave("s1").await;
        assert!(!room.is_locked());
        assert_eq!(room.listing().locked, false);
    }

    #[tokio::test]
    async fn test_manual_lock_survives_leaves() {
        let (room, _events) = test_room();
        room.set_max_clients(4);
        assert!(room.reserve_seat("s1".to_string(), ClientOptions::new()).await);
        room.client_join("s1").await.unwrap();

        room.lock().await;
        room.client_leave("s1").await;
        assert!(room.is_locked());

        room.unlock().await;
        assert!(!room.is_locked());
    }

    #[tokio::test]
    async fn test_locked_room_refuses_reservations() {
        let (room, _events) = test_room();
        room.lock().await;
        assert!(!room.reserve_seat("s1".to_string(), ClientOptions::new()).await);
        assert!(room.listing().locked);
    }

    #[tokio::test]
    async fn test_dispose_emits_once_in_order() {
        let (room, mut events) = test_room();
        room.dispose().await;
        room.dispose().await;

        assert_eq!(events.recv().await.unwrap(), RoomEvent::Dispose);
        assert_eq!(events.recv().await.unwrap(), RoomEvent::Disconnect);
        drop(room);
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_lock_persists_listing_before_event() {
        let presence: Arc<dyn Presence> = Arc::new(LocalPresence::new());
        let driver = Arc::new(LocalDriver::new());
        let listing = RoomListing::new("r1", "chat", "p1");
        let (room, mut events) = Room::new(
            "r1".to_string(),
            "chat".to_string(),
            presence,
            Arc::clone(&driver) as Arc<dyn MatchmakerDriver>,
            listing,
            Box::new(NoopLogic),
        );
        room.save_listing().await.unwrap();

        room.lock().await;
        assert_eq!(events.recv().await.unwrap(), RoomEvent::Lock);
        let stored = driver
            .find_one(&crate::driver::RoomQuery::for_room("r1"))
            .await
            .unwrap()
            .unwrap();
        assert!(stored.locked);
    }
}
