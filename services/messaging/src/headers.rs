//! Header names carried by every event on the wire.

pub const EVENT_ID: &str = "event_id";
pub const EVENT_TYPE: &str = "event_type";
pub const EVENT_VERSION: &str = "event_version";
pub const PRODUCER: &str = "producer";
pub const CONTENT_TYPE: &str = "content_type";

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const CURRENT_EVENT_VERSION: &str = "1";

/// Standard header set for one outgoing event.
pub fn event_headers(
    event_id: impl ToString,
    event_type: impl Into<String>,
    producer: impl Into<String>,
) -> Vec<(String, String)> {
    vec![
        (EVENT_ID.to_string(), event_id.to_string()),
        (EVENT_TYPE.to_string(), event_type.into()),
        (EVENT_VERSION.to_string(), CURRENT_EVENT_VERSION.to_string()),
        (PRODUCER.to_string(), producer.into()),
        (CONTENT_TYPE.to_string(), JSON_CONTENT_TYPE.to_string()),
    ]
}
