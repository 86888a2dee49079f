//! The matchmaking core
//!
//! Owns the room-type registry and the per-process room table, places new
//! rooms on the least-loaded node, routes remote room calls over IPC, gates
//! bursts of simultaneous joiners, and drives the room state machine from
//! creation to disposal.

mod handler;

pub use handler::{HandlerEvent, RegisteredHandler, RoomDefinition};

use crate::driver::{MatchmakerDriver, RoomListing, RoomQuery};
use crate::error::{IpcError, MatchmakeError, Result};
use crate::ipc::{self, RoomCall};
use crate::lobby;
use crate::metrics::MetricsCollector;
use crate::presence::Presence;
use crate::room::{Room, RoomEvent, RoomInternalState};
use crate::types::{ClientOptions, ProcessId, RoomId, SeatReservation};
use crate::utils::{generate_room_id, generate_session_id, merge_options};
use anyhow::{anyhow, bail};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Cluster-wide hash of per-process room counts, used as a placement
/// heuristic only.
pub const ROOM_COUNT_KEY: &str = "roomcount";

fn concurrency_key(room_name: &str) -> String {
    format!("c:{}", room_name)
}

/// Tunables for the matchmaker. `remote_room_timeout` is the single RPC
/// timeout used across all IPC calls.
#[derive(Debug, Clone)]
pub struct MatchmakerSettings {
    /// Timeout applied to every IPC request.
    pub remote_room_timeout: Duration,
    /// Upper bound on seat-reservation retries in `join`/`join_or_create`.
    pub max_join_attempts: u32,
    /// Stagger step applied per queued joiner by the concurrency gate.
    pub gate_step: Duration,
    /// Linear backoff between seat-reservation retries.
    pub retry_backoff: Duration,
}

impl Default for MatchmakerSettings {
    fn default() -> Self {
        Self {
            remote_room_timeout: Duration::from_millis(2000),
            max_join_attempts: 5,
            gate_step: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(25),
        }
    }
}

/// Snapshot of matchmaker activity.
#[derive(Debug, Clone, Default)]
pub struct MatchmakerStats {
    /// Rooms currently owned by this process.
    pub local_rooms: usize,
    /// Registered room types.
    pub handlers: usize,
    /// Total rooms created locally.
    pub rooms_created: u64,
    /// Total rooms disposed locally.
    pub rooms_disposed: u64,
    /// Total seats reserved through this process.
    pub seats_reserved: u64,
}

/// Stable argmin over the cluster room counts. Ties break on process id
/// ordering so every node picks the same target.
pub(crate) fn least_loaded_process(counts: &HashMap<String, String>) -> Option<ProcessId> {
    counts
        .iter()
        .map(|(process_id, count)| (count.parse::<i64>().unwrap_or(0), process_id))
        .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)))
        .map(|(_, process_id)| process_id.clone())
}

fn is_seat_reservation_error(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<MatchmakeError>()
        .map(MatchmakeError::is_seat_reservation)
        .unwrap_or(false)
}

/// Execute a decoded room call against a locally owned room.
pub(crate) async fn execute_room_call(room: &Arc<Room>, call: RoomCall) -> Result<Value> {
    match call {
        RoomCall::ReserveSeat {
            session_id,
            options,
        } => Ok(Value::Bool(room.reserve_seat(session_id, options).await)),
        RoomCall::HasReservedSeat { session_id } => {
            Ok(Value::Bool(room.has_reserved_seat(&session_id)))
        }
        RoomCall::RoomId => Ok(Value::String(room.room_id().to_string())),
        RoomCall::Disconnect => {
            room.disconnect().await?;
            Ok(Value::Bool(true))
        }
    }
}

/// The per-process matchmaker.
///
/// Create with [`Matchmaker::new`], call [`Matchmaker::listen`] to join the
/// cluster, and [`Matchmaker::graceful_shutdown`] to leave it.
pub struct Matchmaker {
    process_id: ProcessId,
    presence: Arc<dyn Presence>,
    driver: Arc<dyn MatchmakerDriver>,
    settings: MatchmakerSettings,
    handlers: RwLock<HashMap<String, Arc<RegisteredHandler>>>,
    /// Routing table: rooms reachable on `$<roomId>`. Locked rooms are
    /// removed from here while keeping their entry in `owned_rooms`.
    rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
    /// Every live room this process owns, locked or not.
    owned_rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
    stats: RwLock<MatchmakerStats>,
    metrics: Arc<MetricsCollector>,
    is_shutting_down: AtomicBool,
    weak: Weak<Matchmaker>,
}

impl Matchmaker {
    pub fn new(
        process_id: ProcessId,
        presence: Arc<dyn Presence>,
        driver: Arc<dyn MatchmakerDriver>,
        settings: MatchmakerSettings,
    ) -> Arc<Self> {
        let metrics = Arc::new(MetricsCollector::new().unwrap_or_else(|_| {
            warn!("failed to create metrics collector, using default");
            MetricsCollector::default()
        }));
        Self::with_metrics(process_id, presence, driver, settings, metrics)
    }

    pub fn with_metrics(
        process_id: ProcessId,
        presence: Arc<dyn Presence>,
        driver: Arc<dyn MatchmakerDriver>,
        settings: MatchmakerSettings,
        metrics: Arc<MetricsCollector>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            process_id,
            presence,
            driver,
            settings,
            handlers: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            owned_rooms: RwLock::new(HashMap::new()),
            stats: RwLock::new(MatchmakerStats::default()),
            metrics,
            is_shutting_down: AtomicBool::new(false),
            weak: weak.clone(),
        })
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn presence(&self) -> &Arc<dyn Presence> {
        &self.presence
    }

    pub fn driver(&self) -> &Arc<dyn MatchmakerDriver> {
        &self.driver
    }

    pub fn settings(&self) -> &MatchmakerSettings {
        &self.settings
    }

    /// Join the cluster: initialize this process's room count and start
    /// serving create-room requests on the process inbox.
    pub async fn listen(&self) -> Result<()> {
        self.presence
            .hset(ROOM_COUNT_KEY, &self.process_id, "0")
            .await?;

        let weak = self.weak.clone();
        ipc::subscribe_ipc(
            Arc::clone(&self.presence),
            self.process_id.clone(),
            ipc::process_channel(&self.process_id),
            move |method, args| {
                let weak = weak.clone();
                async move {
                    let Some(matchmaker) = weak.upgrade() else {
                        return Err(anyhow!("matchmaker is shutting down"));
                    };
                    matchmaker.dispatch_process_call(method, args).await
                }
            },
        )
        .await?;

        info!(process_id = %self.process_id, "matchmaker listening");
        Ok(())
    }

    async fn dispatch_process_call(&self, method: Option<String>, args: Value) -> Result<Value> {
        if let Some(method) = method {
            bail!("unsupported process call \"{}\"", method);
        }
        // the inbox default method: create a room on behalf of a peer
        let room_name = args
            .get(0)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("malformed createRoom request"))?
            .to_string();
        let options = args
            .get(1)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let listing = self.handle_create_room(&room_name, &options).await?;
        Ok(serde_json::to_value(listing)?)
    }

    // ---------------------------------------------------------------------
    // registry
    // ---------------------------------------------------------------------

    /// Register a room type. Stale listings left behind by dead processes
    /// are reaped in the background.
    pub fn define(&self, name: &str, definition: RoomDefinition) -> Result<Arc<RegisteredHandler>> {
        let handler = Arc::new(RegisteredHandler::new(name.to_string(), definition));
        self.handlers_write()?
            .insert(name.to_string(), Arc::clone(&handler));
        info!(room_name = name, "room type defined");

        let weak = self.weak.clone();
        let room_name = name.to_string();
        tokio::spawn(async move {
            if let Some(matchmaker) = weak.upgrade() {
                if let Err(error) = matchmaker.cleanup_stale_rooms(&room_name).await {
                    warn!(room_name = %room_name, "stale room cleanup failed: {}", error);
                }
            }
        });

        Ok(handler)
    }

    /// Drop a room type registration. Rooms of that type keep running.
    pub fn remove_room_type(&self, name: &str) -> Result<()> {
        self.handlers_write()?.remove(name);
        Ok(())
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers_read()
            .map(|handlers| handlers.contains_key(name))
            .unwrap_or(false)
    }

    pub fn get_handler(&self, name: &str) -> Option<Arc<RegisteredHandler>> {
        self.handlers_read()
            .ok()
            .and_then(|handlers| handlers.get(name).cloned())
    }

    fn require_handler(&self, room_name: &str) -> Result<Arc<RegisteredHandler>> {
        self.handlers_read()?
            .get(room_name)
            .cloned()
            .ok_or_else(|| {
                MatchmakeError::NoHandler {
                    room_name: room_name.to_string(),
                }
                .into()
            })
    }

    // ---------------------------------------------------------------------
    // public matchmaking operations
    // ---------------------------------------------------------------------

    /// Join an available room, creating one when none matches. Retries only
    /// when another joiner takes the last seat first.
    pub async fn join_or_create(
        &self,
        room_name: &str,
        options: ClientOptions,
    ) -> Result<SeatReservation> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let listing = match self.find_one_room_available(room_name, &options).await? {
                Some(listing) => listing,
                None => self.create_room(room_name, &options).await?,
            };
            match self.reserve_seat_for(listing, &options).await {
                Ok(reservation) => return Ok(reservation),
                Err(error)
                    if attempt < self.settings.max_join_attempts
                        && is_seat_reservation_error(&error) =>
                {
                    debug!(room_name, attempt, "seat taken, retrying: {}", error);
                    sleep(self.settings.retry_backoff.saturating_mul(attempt)).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Create a new room unconditionally and reserve a seat in it.
    pub async fn create(&self, room_name: &str, options: ClientOptions) -> Result<SeatReservation> {
        let listing = self.create_room(room_name, &options).await?;
        self.reserve_seat_for(listing, &options).await
    }

    /// Join an existing room matching the criteria; fails when none exists.
    pub async fn join(&self, room_name: &str, options: ClientOptions) -> Result<SeatReservation> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let listing = self
                .find_one_room_available(room_name, &options)
                .await?
                .ok_or(MatchmakeError::InvalidCriteria)?;
            match self.reserve_seat_for(listing, &options).await {
                Ok(reservation) => return Ok(reservation),
                Err(error)
                    if attempt < self.settings.max_join_attempts
                        && is_seat_reservation_error(&error) =>
                {
                    debug!(room_name, attempt, "seat taken, retrying: {}", error);
                    sleep(self.settings.retry_backoff.saturating_mul(attempt)).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Join a specific room by id. With a `sessionId` option this is a
    /// reconnection: the previously reserved seat must still be held.
    pub async fn join_by_id(
        &self,
        room_id: &str,
        options: ClientOptions,
    ) -> Result<SeatReservation> {
        let listing = self
            .driver
            .find_one(&RoomQuery::for_room(room_id))
            .await?
            .ok_or_else(|| MatchmakeError::InvalidRoomId {
                room_id: room_id.to_string(),
            })?;

        if let Some(session_id) = options.get("sessionId").and_then(Value::as_str) {
            let held = self
                .remote_room_call(
                    room_id,
                    RoomCall::HasReservedSeat {
                        session_id: session_id.to_string(),
                    },
                )
                .await?;
            if held.as_bool().unwrap_or(false) {
                return Ok(SeatReservation {
                    room: listing,
                    session_id: session_id.to_string(),
                });
            }
            return Err(MatchmakeError::Expired {
                session_id: session_id.to_string(),
            }
            .into());
        }

        if listing.locked {
            return Err(MatchmakeError::InvalidRoomId {
                room_id: room_id.to_string(),
            }
            .into());
        }
        self.reserve_seat_for(listing, &options).await
    }

    /// Passthrough listing query.
    pub async fn query(&self, query: RoomQuery) -> Result<Vec<RoomListing>> {
        self.driver.find(&query).await
    }

    // ---------------------------------------------------------------------
    // room discovery and placement
    // ---------------------------------------------------------------------

    /// Find one unlocked public room of `room_name` matching the handler's
    /// filter projection of `options`. Runs under the concurrency gate so a
    /// burst of joiners observes each other's creations instead of all
    /// spawning separate rooms.
    pub async fn find_one_room_available(
        &self,
        room_name: &str,
        options: &ClientOptions,
    ) -> Result<Option<RoomListing>> {
        let handler = self.require_handler(room_name)?;
        let query = RoomQuery {
            conditions: {
                let mut conditions = handler.filter_options(options);
                conditions.insert("locked".to_string(), Value::Bool(false));
                conditions.insert("name".to_string(), Value::String(room_name.to_string()));
                conditions.insert("private".to_string(), Value::Bool(false));
                conditions
            },
            sort: handler.sort_rules().to_vec(),
        };
        self.await_room_available(room_name, async { self.driver.find_one(&query).await })
            .await
    }

    /// The concurrency gate: staggers near-simultaneous joiners of one room
    /// type and always releases the counter, success or failure.
    pub(crate) async fn await_room_available<T>(
        &self,
        room_name: &str,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let key = concurrency_key(room_name);
        let concurrency = self.presence.incr(&key).await? - 1;
        let delay = self.gate_delay(concurrency);
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let result = operation.await;
        if let Err(error) = self.presence.decr(&key).await {
            warn!(room_name, "failed to release concurrency gate: {}", error);
        }
        result
    }

    /// Stagger applied to the n-th simultaneous joiner, capped by the remote
    /// room timeout. The first joiner is never delayed.
    fn gate_delay(&self, concurrency: i64) -> Duration {
        if concurrency <= 0 {
            return Duration::ZERO;
        }
        self.settings
            .gate_step
            .saturating_mul(u32::try_from(concurrency).unwrap_or(u32::MAX))
            .min(self.settings.remote_room_timeout)
    }

    /// Create a room of `room_name`, on this node or on the least-loaded
    /// peer. A failing or slow peer never fails the client: creation falls
    /// back to this node.
    pub async fn create_room(
        &self,
        room_name: &str,
        options: &ClientOptions,
    ) -> Result<RoomListing> {
        let counts = self
            .presence
            .hgetall(ROOM_COUNT_KEY)
            .await
            .unwrap_or_default();
        let target =
            least_loaded_process(&counts).unwrap_or_else(|| self.process_id.clone());

        if target == self.process_id {
            return self.handle_create_room(room_name, options).await;
        }

        debug!(room_name, target = %target, "delegating room creation to least-loaded node");
        self.metrics
            .ipc()
            .requests_total
            .with_label_values(&["create_room"])
            .inc();
        let request = ipc::request_from_ipc(
            &self.presence,
            &ipc::process_channel(&target),
            None,
            json!([room_name, options]),
            self.settings.remote_room_timeout,
        )
        .await;

        match request {
            Ok(value) => Ok(serde_json::from_value(value)?),
            Err(error) => {
                if matches!(error.downcast_ref::<IpcError>(), Some(IpcError::Timeout(_))) {
                    self.metrics.ipc().timeouts_total.inc();
                }
                warn!(
                    room_name,
                    target = %target,
                    "remote room creation failed, creating locally: {}", error
                );
                self.handle_create_room(room_name, options).await
            }
        }
    }

    /// Create and own a room on this process.
    pub async fn handle_create_room(
        &self,
        room_name: &str,
        client_options: &ClientOptions,
    ) -> Result<RoomListing> {
        let handler = self.require_handler(room_name)?;

        let room_id = generate_room_id();
        let mut listing = RoomListing::new(
            room_id.clone(),
            room_name.to_string(),
            self.process_id.clone(),
        );
        listing.properties = handler.filter_options(client_options);

        let (room, events) = Room::new(
            room_id.clone(),
            room_name.to_string(),
            Arc::clone(&self.presence),
            Arc::clone(&self.driver),
            listing,
            handler.create_logic(),
        );

        let merged = merge_options(client_options, handler.options());
        if let Err(error) = room.invoke_on_create(&merged).await {
            return Err(MatchmakeError::Unhandled {
                message: error.to_string(),
            }
            .into());
        }
        self.presence
            .hincrby(ROOM_COUNT_KEY, &self.process_id, 1)
            .await?;

        room.set_internal_state(RoomInternalState::Created);
        room.sync_listing();

        self.spawn_room_event_consumer(Arc::clone(&room), events);
        self.owned_rooms_write()?
            .insert(room_id.clone(), Arc::clone(&room));
        self.create_room_references(&room, true).await?;

        room.save_listing().await?;
        let listing = room.listing();
        if let Err(error) = lobby::update_lobby(&self.presence, &listing, false).await {
            warn!(room_id = %room_id, "lobby notification failed: {}", error);
        }
        handler.emit(HandlerEvent::Create {
            room_id: room_id.clone(),
        });

        if let Ok(mut stats) = self.stats.write() {
            stats.rooms_created += 1;
        }
        self.metrics.rooms().active_rooms.inc();
        self.metrics
            .rooms()
            .rooms_created_total
            .with_label_values(&[room_name])
            .inc();

        info!(room_name, room_id = %room_id, "room created");
        Ok(listing)
    }

    // ---------------------------------------------------------------------
    // remote room calls and seat reservation
    // ---------------------------------------------------------------------

    /// Invoke `call` on the room, locally when this process owns it and has
    /// it routable, over IPC otherwise.
    pub async fn remote_room_call(&self, room_id: &str, call: RoomCall) -> Result<Value> {
        self.remote_room_call_with_timeout(room_id, call, self.settings.remote_room_timeout)
            .await
    }

    pub async fn remote_room_call_with_timeout(
        &self,
        room_id: &str,
        call: RoomCall,
        timeout: Duration,
    ) -> Result<Value> {
        let local = self.rooms_read()?.get(room_id).cloned();
        if let Some(room) = local {
            return execute_room_call(&room, call).await;
        }

        let method = call.method();
        let args = call.args();
        self.metrics
            .ipc()
            .requests_total
            .with_label_values(&["room_call"])
            .inc();
        match ipc::request_from_ipc(
            &self.presence,
            &ipc::room_channel(room_id),
            Some(method),
            args.clone(),
            timeout,
        )
        .await
        {
            Ok(value) => Ok(value),
            Err(error) => {
                if matches!(error.downcast_ref::<IpcError>(), Some(IpcError::Timeout(_))) {
                    self.metrics.ipc().timeouts_total.inc();
                    return Err(MatchmakeError::Unhandled {
                        message: format!(
                            "remote room ({}) timed out, requesting \"{} with args {}\" ({}ms exceeded)",
                            room_id,
                            method,
                            args,
                            timeout.as_millis()
                        ),
                    }
                    .into());
                }
                Err(error)
            }
        }
    }

    /// Reserve a seat in the room described by `listing`. Any failure of the
    /// underlying call counts as a refusal.
    pub async fn reserve_seat_for(
        &self,
        listing: RoomListing,
        options: &ClientOptions,
    ) -> Result<SeatReservation> {
        let session_id = generate_session_id();
        let call = RoomCall::ReserveSeat {
            session_id: session_id.clone(),
            options: options.clone(),
        };
        let accepted = match self.remote_room_call(&listing.room_id, call).await {
            Ok(value) => value.as_bool().unwrap_or(false),
            Err(error) => {
                debug!(room_id = %listing.room_id, "seat reservation call failed: {}", error);
                false
            }
        };

        if !accepted {
            self.metrics
                .rooms()
                .seat_reservations_total
                .with_label_values(&["rejected"])
                .inc();
            return Err(MatchmakeError::SeatReservation {
                room_id: listing.room_id.clone(),
            }
            .into());
        }

        if let Ok(mut stats) = self.stats.write() {
            stats.seats_reserved += 1;
        }
        self.metrics
            .rooms()
            .seat_reservations_total
            .with_label_values(&["accepted"])
            .inc();
        Ok(SeatReservation {
            room: listing,
            session_id,
        })
    }

    // ---------------------------------------------------------------------
    // room state machine wiring
    // ---------------------------------------------------------------------

    fn spawn_room_event_consumer(
        &self,
        room: Arc<Room>,
        mut events: mpsc::UnboundedReceiver<RoomEvent>,
    ) {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(matchmaker) = weak.upgrade() else {
                    break;
                };
                let last = event == RoomEvent::Disconnect;
                matchmaker.handle_room_event(&room, event).await;
                if last {
                    break;
                }
            }
        });
    }

    async fn handle_room_event(&self, room: &Arc<Room>, event: RoomEvent) {
        let room_id = room.room_id().to_string();
        let handler = self.get_handler(room.room_name());
        match event {
            RoomEvent::Lock => {
                if let Err(error) = self.clear_room_references(room).await {
                    warn!(room_id = %room_id, "failed to clear room references: {}", error);
                }
                if let Some(handler) = handler {
                    handler.emit(HandlerEvent::Lock { room_id });
                }
            }
            RoomEvent::Unlock => {
                if let Err(error) = self.create_room_references(room, false).await {
                    warn!(room_id = %room_id, "failed to reinstate room references: {}", error);
                }
                if let Some(handler) = handler {
                    handler.emit(HandlerEvent::Unlock { room_id });
                }
            }
            RoomEvent::Join { session_id } => {
                if let Some(handler) = handler {
                    handler.emit(HandlerEvent::Join {
                        room_id,
                        session_id,
                    });
                }
            }
            RoomEvent::Leave { session_id } => {
                if let Some(handler) = handler {
                    handler.emit(HandlerEvent::Leave {
                        room_id,
                        session_id,
                    });
                }
            }
            RoomEvent::Dispose => {
                self.dispose_room(room).await;
            }
            RoomEvent::Disconnect => {
                // the consumer loop ends after this event
            }
        }
    }

    /// Make the room reachable: routing table entry plus the `$<roomId>`
    /// subscription dispatching straight to the room object.
    async fn create_room_references(&self, room: &Arc<Room>, init: bool) -> Result<()> {
        self.rooms_write()?
            .insert(room.room_id().to_string(), Arc::clone(room));

        let target = Arc::clone(room);
        ipc::subscribe_ipc(
            Arc::clone(&self.presence),
            self.process_id.clone(),
            ipc::room_channel(room.room_id()),
            move |method, args| {
                let room = Arc::clone(&target);
                async move {
                    let method =
                        method.ok_or_else(|| anyhow!("room channel requires a method"))?;
                    let call = RoomCall::from_wire(&method, &args)?;
                    execute_room_call(&room, call).await
                }
            },
        )
        .await?;

        if !init {
            debug!(room_id = %room.room_id(), "room references reinstated");
        }
        Ok(())
    }

    async fn clear_room_references(&self, room: &Arc<Room>) -> Result<()> {
        self.clear_room_references_by_id(room.room_id()).await
    }

    async fn clear_room_references_by_id(&self, room_id: &str) -> Result<()> {
        self.rooms_write()?.remove(room_id);
        self.presence
            .unsubscribe(&ipc::room_channel(room_id))
            .await
    }

    async fn dispose_room(&self, room: &Arc<Room>) {
        let room_id = room.room_id().to_string();
        let room_name = room.room_name().to_string();

        // the roomcount row is already gone during graceful shutdown
        if !self.is_shutting_down.load(Ordering::SeqCst) {
            if let Err(error) = self
                .presence
                .hincrby(ROOM_COUNT_KEY, &self.process_id, -1)
                .await
            {
                warn!(room_id = %room_id, "failed to decrement room count: {}", error);
            }
        }

        let listing = room.listing();
        if let Err(error) = self.driver.remove(&room_id).await {
            warn!(room_id = %room_id, "failed to remove listing: {}", error);
        }
        if let Err(error) = lobby::update_lobby(&self.presence, &listing, true).await {
            warn!(room_id = %room_id, "lobby notification failed: {}", error);
        }

        if let Some(handler) = self.get_handler(&room_name) {
            handler.emit(HandlerEvent::Dispose {
                room_id: room_id.clone(),
            });
        }

        if let Err(error) = self.presence.del(&concurrency_key(&room_name)).await {
            warn!(room_name = %room_name, "failed to delete concurrency key: {}", error);
        }
        if let Err(error) = self.clear_room_references_by_id(&room_id).await {
            warn!(room_id = %room_id, "failed to clear room references: {}", error);
        }
        if let Ok(mut owned) = self.owned_rooms.write() {
            owned.remove(&room_id);
        }

        if let Ok(mut stats) = self.stats.write() {
            stats.rooms_disposed += 1;
        }
        self.metrics.rooms().active_rooms.dec();
        self.metrics
            .rooms()
            .rooms_disposed_total
            .with_label_values(&[room_name.as_str()])
            .inc();

        room.mark_disposed();
        info!(room_id = %room_id, room_name = %room_name, "room disposed");
    }

    // ---------------------------------------------------------------------
    // stale cleanup and shutdown
    // ---------------------------------------------------------------------

    /// Reap listings whose owning process died without disposing them. A
    /// cheap property-read probe decides liveness; any probe failure marks
    /// the listing stale.
    pub async fn cleanup_stale_rooms(&self, room_name: &str) -> Result<()> {
        let cached = self.driver.find(&RoomQuery::for_name(room_name)).await?;
        self.presence.del(&concurrency_key(room_name)).await?;

        for listing in cached {
            let probe = self
                .remote_room_call_with_timeout(
                    &listing.room_id,
                    RoomCall::RoomId,
                    self.settings.remote_room_timeout,
                )
                .await;
            if probe.is_ok() {
                continue;
            }
            info!(room_id = %listing.room_id, room_name, "removing stale room");
            if let Err(error) = self.driver.remove(&listing.room_id).await {
                warn!(room_id = %listing.room_id, "failed to remove stale listing: {}", error);
            }
            if let Err(error) = lobby::update_lobby(&self.presence, &listing, true).await {
                warn!(room_id = %listing.room_id, "lobby notification failed: {}", error);
            }
            if let Err(error) = self.clear_room_references_by_id(&listing.room_id).await {
                warn!(room_id = %listing.room_id, "failed to clear stale references: {}", error);
            }
        }
        Ok(())
    }

    /// Tear down every local room and leave the cluster. Idempotent: a
    /// second call fails immediately.
    pub async fn graceful_shutdown(&self) -> Result<()> {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            bail!("matchmaker is already shutting down");
        }
        info!(process_id = %self.process_id, "graceful shutdown started");

        self.presence
            .hdel(ROOM_COUNT_KEY, &self.process_id)
            .await?;
        self.presence
            .unsubscribe(&ipc::process_channel(&self.process_id))
            .await?;

        let rooms: Vec<Arc<Room>> = self.owned_rooms_read()?.values().cloned().collect();
        let room_count = rooms.len();

        // start every disconnect at once; each task confirms its own teardown
        let teardowns: Vec<_> = rooms
            .into_iter()
            .map(|room| {
                tokio::spawn(async move {
                    if let Err(error) = room.disconnect().await {
                        warn!(
                            room_id = %room.room_id(),
                            "room disconnect failed during shutdown: {}", error
                        );
                    }
                    room.wait_disposed().await;
                })
            })
            .collect();
        for teardown in teardowns {
            if let Err(error) = teardown.await {
                warn!("room teardown task failed during shutdown: {}", error);
            }
        }

        info!(
            process_id = %self.process_id,
            rooms = room_count,
            "graceful shutdown completed"
        );
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    // ---------------------------------------------------------------------
    // introspection
    // ---------------------------------------------------------------------

    /// The room if this process owns it and it is currently routable.
    pub fn local_room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms_read().ok()?.get(room_id).cloned()
    }

    /// The room if this process owns it, routable or locked.
    pub fn owned_room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.owned_rooms_read().ok()?.get(room_id).cloned()
    }

    pub fn stats(&self) -> MatchmakerStats {
        let mut stats = self
            .stats
            .read()
            .map(|stats| stats.clone())
            .unwrap_or_default();
        stats.local_rooms = self
            .owned_rooms_read()
            .map(|rooms| rooms.len())
            .unwrap_or(0);
        stats.handlers = self.handlers_read().map(|handlers| handlers.len()).unwrap_or(0);
        stats
    }

    // ---------------------------------------------------------------------
    // lock helpers
    // ---------------------------------------------------------------------

    fn handlers_read(
        &self,
    ) -> Result<RwLockReadGuard<'_, HashMap<String, Arc<RegisteredHandler>>>> {
        self.handlers
            .read()
            .map_err(|_| anyhow!("handler registry lock poisoned"))
    }

    fn handlers_write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<String, Arc<RegisteredHandler>>>> {
        self.handlers
            .write()
            .map_err(|_| anyhow!("handler registry lock poisoned"))
    }

    fn rooms_read(&self) -> Result<RwLockReadGuard<'_, HashMap<RoomId, Arc<Room>>>> {
        self.rooms
            .read()
            .map_err(|_| anyhow!("room table lock poisoned"))
    }

    fn rooms_write(&self) -> Result<RwLockWriteGuard<'_, HashMap<RoomId, Arc<Room>>>> {
        self.rooms
            .write()
            .map_err(|_| anyhow!("room table lock poisoned"))
    }

    fn owned_rooms_read(&self) -> Result<RwLockReadGuard<'_, HashMap<RoomId, Arc<Room>>>> {
        self.owned_rooms
            .read()
            .map_err(|_| anyhow!("room table lock poisoned"))
    }

    fn owned_rooms_write(&self) -> Result<RwLockWriteGuard<'_, HashMap<RoomId, Arc<Room>>>> {
        self.owned_rooms
            .write()
            .map_err(|_| anyhow!("room table lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::LocalDriver;
    use crate::presence::LocalPresence;
    use crate::room::RoomLogic;
    use async_trait::async_trait;

    struct NoopLogic;

    #[async_trait]
    impl RoomLogic for NoopLogic {}

    struct SealedLogic;

    #[async_trait]
    impl RoomLogic for SealedLogic {
        async fn on_create(&self, room: &Room, _options: &ClientOptions) -> Result<()> {
            // a room nobody can ever sit in
            room.set_max_clients(0);
            Ok(())
        }
    }

    fn matchmaker() -> Arc<Matchmaker> {
        let presence: Arc<dyn Presence> = Arc::new(LocalPresence::new());
        let driver: Arc<dyn MatchmakerDriver> = Arc::new(LocalDriver::new());
        let settings = MatchmakerSettings {
            remote_room_timeout: Duration::from_millis(150),
            retry_backoff: Duration::from_millis(1),
            ..MatchmakerSettings::default()
        };
        Matchmaker::new("p1".to_string(), presence, driver, settings)
    }

    #[test]
    fn test_least_loaded_process_picks_strict_minimum() {
        let mut counts = HashMap::new();
        counts.insert("a".to_string(), "3".to_string());
        counts.insert("b".to_string(), "1".to_string());
        counts.insert("c".to_string(), "2".to_string());
        assert_eq!(least_loaded_process(&counts), Some("b".to_string()));
    }

    #[test]
    fn test_least_loaded_process_breaks_ties_by_key_order() {
        let mut counts = HashMap::new();
        counts.insert("b".to_string(), "1".to_string());
        counts.insert("a".to_string(), "1".to_string());
        counts.insert("c".to_string(), "1".to_string());
        assert_eq!(least_loaded_process(&counts), Some("a".to_string()));
    }

    #[test]
    fn test_least_loaded_process_empty_map() {
        assert_eq!(least_loaded_process(&HashMap::new()), None);
    }

    #[tokio::test]
    async fn test_registry_management() {
        let matchmaker = matchmaker();
        assert!(!matchmaker.has_handler("chat"));

        matchmaker
            .define("chat", RoomDefinition::new(|| NoopLogic))
            .unwrap();
        assert!(matchmaker.has_handler("chat"));
        assert!(matchmaker.get_handler("chat").is_some());

        matchmaker.remove_room_type("chat").unwrap();
        assert!(!matchmaker.has_handler("chat"));

        // redefining behaves like a fresh define
        matchmaker
            .define("chat", RoomDefinition::new(|| NoopLogic))
            .unwrap();
        assert!(matchmaker.has_handler("chat"));
    }

    #[tokio::test]
    async fn test_create_without_handler_fails() {
        let matchmaker = matchmaker();
        let error = matchmaker
            .create("unknown", ClientOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<MatchmakeError>(),
            Some(MatchmakeError::NoHandler { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrency_gate_releases_counter() {
        let matchmaker = matchmaker();

        let value: Result<u32> = matchmaker
            .await_room_available("chat", async { Ok(42) })
            .await;
        assert_eq!(value.unwrap(), 42);

        let failure: Result<u32> = matchmaker
            .await_room_available("chat", async { Err(anyhow!("boom")) })
            .await;
        assert!(failure.is_err());

        // the counter is back to zero after success and failure alike
        assert_eq!(matchmaker.presence().incr("c:chat").await.unwrap(), 1);
    }

    #[test]
    fn test_gate_delay_boundaries() {
        let matchmaker = matchmaker();
        // first joiner is not delayed
        assert_eq!(matchmaker.gate_delay(0), Duration::ZERO);
        // the tenth joiner would wait 900ms, capped by the remote timeout
        assert_eq!(matchmaker.gate_delay(1), Duration::from_millis(100));
        assert_eq!(matchmaker.gate_delay(9), Duration::from_millis(150));

        let relaxed = Matchmaker::new(
            "p2".to_string(),
            Arc::new(LocalPresence::new()),
            Arc::new(LocalDriver::new()),
            MatchmakerSettings::default(),
        );
        assert_eq!(relaxed.gate_delay(9), Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_join_or_create_gives_up_after_bounded_retries() {
        let matchmaker = matchmaker();
        matchmaker
            .define("sealed", RoomDefinition::new(|| SealedLogic))
            .unwrap();

        let error = matchmaker
            .join_or_create("sealed", ClientOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<MatchmakeError>(),
            Some(MatchmakeError::SeatReservation { .. })
        ));
    }

    #[tokio::test]
    async fn test_handle_create_room_tracks_room_count() {
        let matchmaker = matchmaker();
        matchmaker
            .define("chat", RoomDefinition::new(|| NoopLogic))
            .unwrap();

        let listing = matchmaker
            .handle_create_room("chat", &ClientOptions::new())
            .await
            .unwrap();
        assert_eq!(listing.process_id, "p1");
        assert_eq!(
            matchmaker
                .presence()
                .hget(ROOM_COUNT_KEY, "p1")
                .await
                .unwrap(),
            Some("1".to_string())
        );
        assert!(matchmaker.local_room(&listing.room_id).is_some());
        assert_eq!(matchmaker.stats().local_rooms, 1);
    }
}
