//! Cluster-visible room listing store
//!
//! The driver persists one [`RoomListing`] per room and answers the
//! matchmaker's availability queries. It is separate from the presence
//! substrate, though remote backends may be implemented atop the same store.

pub mod local;

pub use local::LocalDriver;

use crate::error::Result;
use crate::types::{ClientOptions, ProcessId, RoomId};
use crate::utils::current_timestamp;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;

fn unbounded_clients() -> u32 {
    u32::MAX
}

/// One cluster-visible room record. Owned by exactly one process, identified
/// by `processId`; mutated by the owner and persisted on every state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomListing {
    pub room_id: RoomId,
    pub name: String,
    pub process_id: ProcessId,
    #[serde(default)]
    pub locked: bool,
    #[serde(default, rename = "private")]
    pub is_private: bool,
    #[serde(default)]
    pub unlisted: bool,
    #[serde(default)]
    pub clients: u32,
    #[serde(default = "unbounded_clients")]
    pub max_clients: u32,
    #[serde(default = "crate::utils::current_timestamp")]
    pub created_at: DateTime<Utc>,
    /// Filter fields projected from the create options, queryable by name.
    #[serde(flatten)]
    pub properties: ClientOptions,
}

impl RoomListing {
    pub fn new(
        room_id: impl Into<RoomId>,
        name: impl Into<String>,
        process_id: impl Into<ProcessId>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            name: name.into(),
            process_id: process_id.into(),
            locked: false,
            is_private: false,
            unlisted: false,
            clients: 0,
            max_clients: unbounded_clients(),
            created_at: current_timestamp(),
            properties: ClientOptions::new(),
        }
    }

    /// Look up a queryable field by its wire name. Unknown names fall
    /// through to the projected filter properties.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "roomId" => Some(Value::String(self.room_id.clone())),
            "name" => Some(Value::String(self.name.clone())),
            "processId" => Some(Value::String(self.process_id.clone())),
            "locked" => Some(Value::Bool(self.locked)),
            "private" => Some(Value::Bool(self.is_private)),
            "unlisted" => Some(Value::Bool(self.unlisted)),
            "clients" => Some(json!(self.clients)),
            "maxClients" => Some(json!(self.max_clients)),
            "createdAt" => serde_json::to_value(self.created_at).ok(),
            other => self.properties.get(other).cloned(),
        }
    }

    /// Whether every condition matches this listing by equality.
    pub fn matches(&self, conditions: &ClientOptions) -> bool {
        conditions
            .iter()
            .all(|(key, expected)| self.field(key).as_ref() == Some(expected))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// One post-ordering rule applied to query results.
#[derive(Debug, Clone)]
pub struct SortRule {
    pub field: String,
    pub direction: SortDirection,
}

impl SortRule {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Descending,
        }
    }
}

/// A listing query: equality conditions plus optional post-ordering.
#[derive(Debug, Clone, Default)]
pub struct RoomQuery {
    pub conditions: ClientOptions,
    pub sort: Vec<SortRule>,
}

impl RoomQuery {
    pub fn with_condition(mut self, key: impl Into<String>, value: Value) -> Self {
        self.conditions.insert(key.into(), value);
        self
    }

    pub fn with_sort(mut self, rule: SortRule) -> Self {
        self.sort.push(rule);
        self
    }

    /// Query for a single room by id.
    pub fn for_room(room_id: &str) -> Self {
        Self::default().with_condition("roomId", Value::String(room_id.to_string()))
    }

    /// Query for every room of one type.
    pub fn for_name(name: &str) -> Self {
        Self::default().with_condition("name", Value::String(name.to_string()))
    }
}

/// Total order over JSON values used for post-ordering. Values of different
/// kinds order by kind; numbers compare as floats, strings lexically.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().unwrap_or(0.0);
            let b = b.as_f64().unwrap_or(0.0);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Order listings in place according to `rules`, most significant first.
pub fn sort_listings(listings: &mut [RoomListing], rules: &[SortRule]) {
    if rules.is_empty() {
        return;
    }
    listings.sort_by(|a, b| {
        for rule in rules {
            let left = a.field(&rule.field).unwrap_or(Value::Null);
            let right = b.field(&rule.field).unwrap_or(Value::Null);
            let ordering = match rule.direction {
                SortDirection::Ascending => compare_values(&left, &right),
                SortDirection::Descending => compare_values(&right, &left),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Store of cluster-visible room listings.
///
/// `find_one` is best-effort: an eventually consistent backend may race with
/// concurrent creates. The matchmaker's concurrency gate and the seat
/// reservation check are the correctness backstop, and duplicate rooms are
/// tolerated and later reaped.
#[async_trait]
pub trait MatchmakerDriver: Send + Sync {
    /// Insert or update a listing, keyed by room id.
    async fn save(&self, listing: &RoomListing) -> Result<()>;

    /// Delete the listing for `room_id`. Removing an unknown id is not an
    /// error.
    async fn remove(&self, room_id: &str) -> Result<()>;

    /// All listings matching the query, post-ordered by its sort rules.
    async fn find(&self, query: &RoomQuery) -> Result<Vec<RoomListing>>;

    /// The first listing matching the query, or `None`.
    async fn find_one(&self, query: &RoomQuery) -> Result<Option<RoomListing>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_lookup_covers_builtins_and_properties() {
        let mut listing = RoomListing::new("r1", "chat", "p1");
        listing
            .properties
            .insert("mode".to_string(), json!("ranked"));

        assert_eq!(listing.field("roomId"), Some(json!("r1")));
        assert_eq!(listing.field("name"), Some(json!("chat")));
        assert_eq!(listing.field("locked"), Some(json!(false)));
        assert_eq!(listing.field("mode"), Some(json!("ranked")));
        assert_eq!(listing.field("missing"), None);
    }

    #[test]
    fn test_matches_requires_every_condition() {
        let mut listing = RoomListing::new("r1", "chat", "p1");
        listing.properties.insert("mode".to_string(), json!("duo"));

        let query = RoomQuery::for_name("chat")
            .with_condition("locked", json!(false))
            .with_condition("mode", json!("duo"));
        assert!(listing.matches(&query.conditions));

        let query = RoomQuery::for_name("chat").with_condition("mode", json!("squad"));
        assert!(!listing.matches(&query.conditions));
    }

    #[test]
    fn test_listing_serializes_with_wire_names() {
        let mut listing = RoomListing::new("r1", "chat", "p1");
        listing.is_private = true;
        let value = serde_json::to_value(&listing).unwrap();
        assert_eq!(value["roomId"], "r1");
        assert_eq!(value["processId"], "p1");
        assert_eq!(value["private"], true);
        assert_eq!(value["maxClients"], u32::MAX);
    }

    #[test]
    fn test_sort_listings_by_clients_descending() {
        let mut listings: Vec<RoomListing> = (0..3)
            .map(|index| {
                let mut listing = RoomListing::new(format!("r{}", index), "chat", "p1");
                listing.clients = index;
                listing
            })
            .collect();

        sort_listings(&mut listings, &[SortRule::descending("clients")]);
        let clients: Vec<u32> = listings.iter().map(|listing| listing.clients).collect();
        assert_eq!(clients, vec![2, 1, 0]);
    }

    #[test]
    fn test_compare_values_mixed_kinds() {
        assert_eq!(
            compare_values(&json!(1), &json!(2)),
            std::cmp::Ordering::Less
        );
        assert_eq!(
            compare_values(&json!("a"), &json!("b")),
            std::cmp::Ordering::Less
        );
        // numbers order before strings regardless of content
        assert_eq!(
            compare_values(&json!(10), &json!("2")),
            std::cmp::Ordering::Less
        );
    }
}
