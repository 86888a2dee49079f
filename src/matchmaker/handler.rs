//! Named room-type registrations
//!
//! Each process registers its own handlers; a handler couples a room logic
//! factory with default options, the keys projected into listings for
//! filtering, and the ordering applied to availability queries. Lifecycle
//! events are re-emitted per handler on a broadcast channel instead of a
//! string-keyed emitter.

use crate::driver::SortRule;
use crate::room::{RoomFactory, RoomLogic};
use crate::types::{ClientOptions, RoomId, SessionId};
use std::sync::Arc;
use tokio::sync::broadcast;

const HANDLER_EVENT_CAPACITY: usize = 64;

/// Lifecycle events observed for one room type.
#[derive(Debug, Clone)]
pub enum HandlerEvent {
    Create { room_id: RoomId },
    Join { room_id: RoomId, session_id: SessionId },
    Leave { room_id: RoomId, session_id: SessionId },
    Lock { room_id: RoomId },
    Unlock { room_id: RoomId },
    Dispose { room_id: RoomId },
}

/// Builder describing a room type before registration.
pub struct RoomDefinition {
    factory: RoomFactory,
    options: ClientOptions,
    filter_by: Vec<String>,
    sort_by: Vec<SortRule>,
}

impl RoomDefinition {
    pub fn new<F, L>(factory: F) -> Self
    where
        F: Fn() -> L + Send + Sync + 'static,
        L: RoomLogic + 'static,
    {
        Self {
            factory: Arc::new(move || Box::new(factory()) as Box<dyn RoomLogic>),
            options: ClientOptions::new(),
            filter_by: Vec::new(),
            sort_by: Vec::new(),
        }
    }

    /// Default options enforced over client-supplied ones at create time.
    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Option keys projected into the listing and matched on joins.
    pub fn filter_by<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter_by = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Append an ordering rule for availability queries.
    pub fn sort_by(mut self, rule: SortRule) -> Self {
        self.sort_by.push(rule);
        self
    }
}

/// A registered room type.
pub struct RegisteredHandler {
    name: String,
    factory: RoomFactory,
    options: ClientOptions,
    filter_by: Vec<String>,
    sort_by: Vec<SortRule>,
    events: broadcast::Sender<HandlerEvent>,
}

impl RegisteredHandler {
    pub(crate) fn new(name: String, definition: RoomDefinition) -> Self {
        let (events, _) = broadcast::channel(HANDLER_EVENT_CAPACITY);
        Self {
            name,
            factory: definition.factory,
            options: definition.options,
            filter_by: definition.filter_by,
            sort_by: definition.sort_by,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn sort_rules(&self) -> &[SortRule] {
        &self.sort_by
    }

    pub(crate) fn create_logic(&self) -> Box<dyn RoomLogic> {
        (self.factory)()
    }

    /// Project the declared filter keys out of `options`. Keys the client
    /// did not send are simply absent.
    pub fn filter_options(&self, options: &ClientOptions) -> ClientOptions {
        self.filter_by
            .iter()
            .filter_map(|key| options.get(key).map(|value| (key.clone(), value.clone())))
            .collect()
    }

    /// Subscribe to lifecycle events for this room type.
    pub fn subscribe(&self) -> broadcast::Receiver<HandlerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: HandlerEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }
}
