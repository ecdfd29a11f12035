use serde::{Deserialize, Serialize};

/// A message travelling through the broker.
///
/// The routing key is carried inside the envelope: [`Client::send`](crate::Client::send)
/// uses it to route the message, consumers get it back alongside the payload.
///
/// `P` defaults to [`serde_json::Value`], which accepts any JSON payload.
/// Use your own `Serialize`/`Deserialize` type to get a strongly-typed payload instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message<P = serde_json::Value> {
    routing_key: String,
    payload: P,
}

impl<P> Message<P> {
    pub fn new(routing_key: impl Into<String>, payload: P) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload,
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}
