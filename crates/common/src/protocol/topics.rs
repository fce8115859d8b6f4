// Notification topic names.
//
// Subscribers filter by prefix, so `amendment/` matches every amendment.

use uuid::Uuid;

pub const EVENTS: &str = "events";
pub const DOCUMENT_PREFIX: &str = "document/";
pub const AMENDMENT_PREFIX: &str = "amendment/";

pub fn document(id: Uuid) -> String {
    format!("{DOCUMENT_PREFIX}{id}")
}

pub fn amendment(id: Uuid) -> String {
    format!("{AMENDMENT_PREFIX}{id}")
}

/// True when `topic` is selected by `filter`; an empty filter selects all.
pub fn matches(filter: &str, topic: &str) -> bool {
    topic.starts_with(filter)
}
