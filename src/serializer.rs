use crate::Message;
use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};

/// Converts [`Message`]s to and from the bytes that travel over the wire.
///
/// Implementations are expected to be stateless: the same serializer is shared between
/// publishing and every consumer spawned by a [`Client`](crate::Client).
pub trait Serializer: Send + Sync + 'static {
    /// The value of the `content-type` property attached to published messages.
    fn content_type(&self) -> &str;

    fn serialize<P: Serialize>(&self, message: &Message<P>) -> Result<Vec<u8>, anyhow::Error>;

    fn deserialize<P: DeserializeOwned>(&self, bytes: &[u8]) -> Result<Message<P>, anyhow::Error>;
}

/// The default [`Serializer`]: messages as JSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn serialize<P: Serialize>(&self, message: &Message<P>) -> Result<Vec<u8>, anyhow::Error> {
        serde_json::to_vec(message).context("Failed to serialize message as JSON")
    }

    fn deserialize<P: DeserializeOwned>(&self, bytes: &[u8]) -> Result<Message<P>, anyhow::Error> {
        serde_json::from_slice(bytes).context("Failed to deserialize message from JSON")
    }
}
