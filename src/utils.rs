//! Utility functions for the matchmaking core

use crate::types::ClientOptions;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Generate a new unique room ID
pub fn generate_room_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generate a new unique session ID
pub fn generate_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generate a new unique IPC request ID
pub fn generate_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generate a new unique process ID
pub fn generate_process_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Merge two option maps. Entries from `overrides` win over `base`, which is
/// how handler default options are enforced over client-supplied ones.
pub fn merge_options(base: &ClientOptions, overrides: &ClientOptions) -> ClientOptions {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generate_unique_ids() {
        assert_ne!(generate_room_id(), generate_room_id());
        assert_ne!(generate_session_id(), generate_session_id());
        assert_ne!(generate_request_id(), generate_request_id());
    }

    #[test]
    fn test_merge_options_overrides_win() {
        let mut base = ClientOptions::new();
        base.insert("mode".to_string(), json!("ranked"));
        base.insert("maxClients".to_string(), json!(16));

        let mut overrides = ClientOptions::new();
        overrides.insert("maxClients".to_string(), json!(4));

        let merged = merge_options(&base, &overrides);
        assert_eq!(merged["mode"], json!("ranked"));
        assert_eq!(merged["maxClients"], json!(4));
    }

    #[test]
    fn test_merge_options_empty_overrides() {
        let mut base = ClientOptions::new();
        base.insert("mode".to_string(), json!("casual"));

        let merged = merge_options(&base, &ClientOptions::new());
        assert_eq!(merged, base);
    }
}
