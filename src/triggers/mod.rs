//! Entry points that turn external data changes into hub publishes.

mod http;
mod redis;

use crate::error::AppError;
use crate::topic::Topic;

pub use self::http::{publish, PublishRequest};
pub use self::redis::{ChangeMessage, RedisChangeFeed};

/// Resolve the topic of an external change. Changes always concern one
/// concrete collection, so the wildcard is rejected.
pub fn resolve_publish_topic(name: &str) -> Result<Topic, AppError> {
    let topic: Topic = name.parse()?;
    if topic.is_wildcard() {
        return Err(AppError::Validation(
            "changes must be published to a concrete topic, not 'all'".to_string(),
        ));
    }
    Ok(topic)
}
