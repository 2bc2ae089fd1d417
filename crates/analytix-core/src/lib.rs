pub mod error;
pub mod events;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    AnalyticsEvent, ClientMessage, MAX_TOPIC_LEN, SYSTEM_TOPIC, StreamEnvelope, validate_topic,
};
pub use time::{Timestamp, now_utc};
