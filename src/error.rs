/// Error returned by [`Client`](crate::Client) operations.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("Failed to establish a connection with the RabbitMq broker")]
    Connect(#[source] anyhow::Error),
    #[error("Failed to open a channel on the RabbitMq connection")]
    OpenChannel(#[source] lapin::Error),
    #[error("Failed to declare exchange `{exchange}`")]
    DeclareExchange {
        exchange: String,
        #[source]
        source: lapin::Error,
    },
    #[error("Failed to declare queue `{queue}`")]
    DeclareQueue {
        queue: String,
        #[source]
        source: lapin::Error,
    },
    #[error("Failed to bind queue `{queue}` to exchange `{exchange}` with routing key `{routing_key}`")]
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
        #[source]
        source: lapin::Error,
    },
    #[error("Failed to publish the message to the RabbitMq broker")]
    Publish(#[source] lapin::Error),
    #[error("Failed to start consuming messages from queue `{queue}`")]
    Consume {
        queue: String,
        #[source]
        source: lapin::Error,
    },
    #[error("Failed to close the {resource}")]
    Close {
        resource: &'static str,
        #[source]
        source: lapin::Error,
    },
    #[error("Failed to serialize the message")]
    Serialization(#[source] anyhow::Error),
    #[error("Connection does not exist")]
    MissingConnection,
    #[error("Channel does not exist")]
    MissingChannel,
    #[error("Invalid RabbitMq settings")]
    InvalidSettings(#[source] anyhow::Error),
}
