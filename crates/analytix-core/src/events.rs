//! Analytics events and the streaming wire protocol.
//!
//! Producers build [`AnalyticsEvent`]s and hand them to the event hub; the hub
//! delivers them to stream subscribers as [`StreamEnvelope`]s. Clients talk
//! back with [`ClientMessage`]s.
//!
//! ```text
//! server → client: {"topic":"portfolio:1","type":"valuation","payload":{..},"timestamp":"2024-03-01T09:15:00Z"}
//! client → server: {"action":"subscribe","topics":["portfolio:1"]}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::time::{Timestamp, now_utc};

/// Topic reserved for server-originated control envelopes.
pub const SYSTEM_TOPIC: &str = "system";

/// Maximum accepted topic length in bytes.
pub const MAX_TOPIC_LEN: usize = 128;

/// Validates a subscription or event topic.
///
/// Topics are 1..=128 characters of ASCII alphanumerics and `:_-.`.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(CoreError::invalid_topic("topic must not be empty"));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(CoreError::invalid_topic(format!(
            "topic exceeds {MAX_TOPIC_LEN} characters"
        )));
    }
    if let Some(c) = topic
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.')))
    {
        return Err(CoreError::invalid_topic(format!(
            "topic '{topic}' contains invalid character '{c}'"
        )));
    }
    Ok(())
}

/// An analytics event produced by service logic and fanned out by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    /// Subscription topic, e.g. `portfolio:42`
    pub topic: String,
    /// Event type, e.g. `valuation` or `trade`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque event body
    #[serde(default)]
    pub payload: serde_json::Value,
    /// When the event was produced
    #[serde(default = "now_utc")]
    pub timestamp: Timestamp,
}

impl AnalyticsEvent {
    /// Create a new event stamped with the current time.
    pub fn new(
        topic: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<Self> {
        let event = Self {
            topic: topic.into(),
            event_type: event_type.into(),
            payload,
            timestamp: now_utc(),
        };
        event.validate()?;
        Ok(event)
    }

    /// Check an event received from outside (e.g. an ingestion request).
    pub fn validate(&self) -> Result<()> {
        validate_topic(&self.topic)?;
        if self.topic == SYSTEM_TOPIC {
            return Err(CoreError::invalid_event(format!(
                "topic '{SYSTEM_TOPIC}' is reserved"
            )));
        }
        if self.event_type.trim().is_empty() {
            return Err(CoreError::invalid_event("event type must not be empty"));
        }
        Ok(())
    }

    /// Override the event timestamp.
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Envelope pushed to stream subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    pub topic: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: Timestamp,
}

impl StreamEnvelope {
    fn system(kind: &str, payload: serde_json::Value) -> Self {
        Self {
            topic: SYSTEM_TOPIC.to_string(),
            kind: kind.to_string(),
            payload,
            timestamp: now_utc(),
        }
    }

    /// Acknowledges a subscribe request with the full resulting topic set.
    pub fn subscribed(topics: &[String]) -> Self {
        Self::system("subscribed", serde_json::json!({ "topics": topics }))
    }

    /// Acknowledges an unsubscribe request with the remaining topic set.
    pub fn unsubscribed(topics: &[String]) -> Self {
        Self::system("unsubscribed", serde_json::json!({ "topics": topics }))
    }

    /// Reply to a client heartbeat.
    pub fn pong() -> Self {
        Self::system("pong", serde_json::Value::Null)
    }

    /// Reports events overwritten in the connection's queue.
    pub fn dropped(count: u64) -> Self {
        Self::system("dropped", serde_json::json!({ "count": count }))
    }

    /// Reports a protocol error to the client.
    pub fn error(message: impl Into<String>) -> Self {
        Self::system("error", serde_json::json!({ "message": message.into() }))
    }

    /// Sent right before the server closes the stream.
    pub fn closing(reason: impl Into<String>) -> Self {
        Self::system("closing", serde_json::json!({ "reason": reason.into() }))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<&AnalyticsEvent> for StreamEnvelope {
    fn from(event: &AnalyticsEvent) -> Self {
        Self {
            topic: event.topic.clone(),
            kind: event.event_type.clone(),
            payload: event.payload.clone(),
            timestamp: event.timestamp,
        }
    }
}

/// Messages a stream client may send after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
    Ping,
}

impl ClientMessage {
    /// Parse and validate a text frame.
    pub fn parse(text: &str) -> Result<Self> {
        let message: ClientMessage = serde_json::from_str(text)
            .map_err(|e| CoreError::invalid_message(e.to_string()))?;

        if let ClientMessage::Subscribe { topics } | ClientMessage::Unsubscribe { topics } =
            &message
        {
            if topics.is_empty() {
                return Err(CoreError::invalid_message("topics must not be empty"));
            }
            for topic in topics {
                validate_topic(topic)?;
                if topic == SYSTEM_TOPIC {
                    return Err(CoreError::invalid_topic(format!(
                        "topic '{SYSTEM_TOPIC}' is reserved"
                    )));
                }
            }
        }

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("portfolio:42").is_ok());
        assert!(validate_topic("dash.user_1-daily").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("has space").is_err());
        assert!(validate_topic("emoji🚀").is_err());
        assert!(validate_topic(&"a".repeat(MAX_TOPIC_LEN + 1)).is_err());
        assert!(validate_topic(&"a".repeat(MAX_TOPIC_LEN)).is_ok());
    }

    #[test]
    fn test_event_rejects_reserved_topic() {
        assert!(AnalyticsEvent::new(SYSTEM_TOPIC, "x", json!({})).is_err());
        assert!(AnalyticsEvent::new("portfolio:1", "  ", json!({})).is_err());
    }

    #[test]
    fn test_event_wire_shape() {
        let event = AnalyticsEvent::new("portfolio:1", "valuation", json!({"value": 10.5}))
            .unwrap()
            .with_timestamp(Timestamp::from_unix_millis(0).unwrap());
        let envelope = StreamEnvelope::from(&event);
        let value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "topic": "portfolio:1",
                "type": "valuation",
                "payload": {"value": 10.5},
                "timestamp": "1970-01-01T00:00:00Z"
            })
        );
    }

    #[test]
    fn test_event_deserialize_defaults_timestamp() {
        let event: AnalyticsEvent =
            serde_json::from_value(json!({"topic": "portfolio:1", "type": "trade"})).unwrap();
        assert_eq!(event.payload, serde_json::Value::Null);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_client_message_parse() {
        assert_eq!(
            ClientMessage::parse(r#"{"action":"subscribe","topics":["portfolio:1","portfolio:2"]}"#)
                .unwrap(),
            ClientMessage::Subscribe {
                topics: vec!["portfolio:1".into(), "portfolio:2".into()]
            }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"action":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
    }

    #[test]
    fn test_client_message_parse_rejects_bad_input() {
        assert!(ClientMessage::parse("not json").is_err());
        assert!(ClientMessage::parse(r#"{"action":"dance"}"#).is_err());
        assert!(ClientMessage::parse(r#"{"action":"subscribe","topics":[]}"#).is_err());
        assert!(ClientMessage::parse(r#"{"action":"subscribe","topics":["system"]}"#).is_err());
        assert!(ClientMessage::parse(r#"{"action":"unsubscribe","topics":["bad topic"]}"#).is_err());
    }

    #[test]
    fn test_system_envelopes() {
        let ack = StreamEnvelope::subscribed(&["a".to_string()]);
        assert_eq!(ack.topic, SYSTEM_TOPIC);
        assert_eq!(ack.kind, "subscribed");
        assert_eq!(ack.payload, json!({"topics": ["a"]}));
        assert_eq!(StreamEnvelope::dropped(5).payload, json!({"count": 5}));
    }
}
