//! Shared state channel: durable versioned store + best-effort pub/sub.
//!
//! Every component receives the channel as an injected dependency, so the
//! core logic can be driven in tests by an in-process [`crate::state::AppState`]
//! or remotely through the relay server.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::ChannelError;

pub type ChannelResult<T> = Result<T, ChannelError>;

/// A durable value together with its store-assigned version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Versioned {
    pub version: u64,
    pub value: Value,
}

impl Versioned {
    /// Deserialize the stored value, tolerating unknown extra fields
    pub fn decode<T: DeserializeOwned>(&self) -> ChannelResult<T> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

#[async_trait]
pub trait SharedStateChannel: Send + Sync {
    /// Read the current durable value for `key`
    async fn read(&self, key: &str) -> ChannelResult<Option<Versioned>>;

    /// Durable upsert; returns the new version
    async fn write(&self, key: &str, value: Value) -> ChannelResult<u64>;

    /// Write only if the stored version equals `expected` (`None` = key absent).
    /// Returns false when the precondition did not hold.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> ChannelResult<bool>;

    /// Notifications of durable writes to `key` (at-least-once, may repeat).
    /// Drop the receiver to unsubscribe.
    fn subscribe_key(&self, key: &str) -> broadcast::Receiver<Value>;

    /// Best-effort broadcast; delivery is not guaranteed
    async fn publish(&self, topic: &str, msg: Value);

    fn subscribe_topic(&self, topic: &str) -> broadcast::Receiver<Value>;
}

/// Serialize and publish, logging instead of failing on encode errors
pub async fn publish_json<T: Serialize>(channel: &dyn SharedStateChannel, topic: &str, msg: &T) {
    match serde_json::to_value(msg) {
        Ok(value) => channel.publish(topic, value).await,
        Err(e) => tracing::error!("Failed to encode message for {}: {}", topic, e),
    }
}

/// Read and decode a durable value
pub async fn read_json<T: DeserializeOwned>(
    channel: &dyn SharedStateChannel,
    key: &str,
) -> ChannelResult<Option<(u64, T)>> {
    match channel.read(key).await? {
        Some(v) => Ok(Some((v.version, v.decode()?))),
        None => Ok(None),
    }
}
