use crate::amqp::configuration::ClientSettings;
use crate::amqp::ConnectionFactory;
use crate::{ClientError, Handler, JsonSerializer, Message, Serializer};
use futures_util::{FutureExt, Stream, StreamExt};
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, ChannelState, Connection, ConnectionState, ExchangeKind,
};
use serde::{de::DeserializeOwned, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

// AMQP reply code 200 - see https://www.rabbitmq.com/amqp-0-9-1-reference.html#constants
const REPLY_SUCCESS: u16 = 200;
// Delivery mode: Non-persistent (1) or persistent (2).
const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// A RabbitMq client bound to a single exchange and a single queue.
///
/// `Client` owns one connection and one channel opened on top of it. Both are released
/// together by [`Client::close`] (or when construction fails half-way through).
///
/// There is no reconnection logic: if the broker drops the connection, every subsequent
/// operation fails and a new `Client` has to be built.
pub struct Client<S: Serializer = JsonSerializer> {
    connection: Option<Connection>,
    /// Always opened on `connection`, never outlives it.
    channel: Option<Channel>,
    /// The exchange messages are published to. Empty for the default exchange.
    exchange: String,
    /// The queue messages are consumed from.
    queue: String,
    serializer: Arc<S>,
}

impl Client<JsonSerializer> {
    /// Connect to the broker at `url` and set up the topology.
    ///
    /// A durable direct exchange named `exchange` and a durable queue named `queue` are
    /// declared; an empty name skips the corresponding declaration.
    ///
    /// If any step fails, whatever was opened so far is closed before returning the error.
    pub async fn connect(url: &str, exchange: &str, queue: &str) -> Result<Self, ClientError> {
        Self::connect_with_serializer(url, exchange, queue, JsonSerializer).await
    }

    /// Same as [`Client::connect`], driven by [`ClientSettings`].
    ///
    /// The queue is bound to the exchange with every routing key listed in `settings`.
    pub async fn connect_with_settings(settings: &ClientSettings) -> Result<Self, ClientError> {
        let factory = ConnectionFactory::new_from_config(&settings.connection)
            .map_err(ClientError::InvalidSettings)?;
        Self::establish(
            &factory,
            &settings.exchange,
            &settings.queue,
            JsonSerializer,
            &settings.routing_keys,
        )
        .await
    }
}

impl<S: Serializer> Client<S> {
    /// Same as [`Client::connect`], with a custom [`Serializer`].
    pub async fn connect_with_serializer(
        url: &str,
        exchange: &str,
        queue: &str,
        serializer: S,
    ) -> Result<Self, ClientError> {
        let factory = ConnectionFactory::new_from_uri(url).map_err(ClientError::InvalidSettings)?;
        Self::establish(&factory, exchange, queue, serializer, &[]).await
    }

    /// Same as [`Client::connect`], using a pre-configured [`ConnectionFactory`]
    /// (e.g. for TLS with a custom root certificate).
    pub async fn connect_with_factory(
        factory: &ConnectionFactory,
        exchange: &str,
        queue: &str,
        serializer: S,
    ) -> Result<Self, ClientError> {
        Self::establish(factory, exchange, queue, serializer, &[]).await
    }

    #[tracing::instrument(
        name = "servicebus_connect",
        skip(factory, serializer, routing_keys),
        fields(broker = %factory.broker())
    )]
    async fn establish(
        factory: &ConnectionFactory,
        exchange: &str,
        queue: &str,
        serializer: S,
        routing_keys: &[String],
    ) -> Result<Self, ClientError> {
        info!("Initializing RabbitMq connection");
        let connection = factory
            .new_connection()
            .await
            .map_err(ClientError::Connect)?;
        debug!("Connection to RabbitMq established");

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "Failed to open a channel");
                if let Err(e) = connection.close(REPLY_SUCCESS, "Bye").await {
                    warn!(error = %e, "Failed to close connection");
                }
                return Err(ClientError::OpenChannel(e));
            }
        };
        debug!("Channel opened");

        let mut client = Self {
            connection: Some(connection),
            channel: Some(channel),
            exchange: exchange.into(),
            queue: queue.into(),
            serializer: Arc::new(serializer),
        };

        if let Err(e) = client.setup_topology(routing_keys).await {
            warn!(error = %e, "RabbitMq setup failed, releasing channel and connection");
            if let Err(e) = client.close().await {
                warn!(error = %e, "Failed to release resources after a failed setup");
            }
            return Err(e);
        }

        info!("RabbitMq setup completed");
        Ok(client)
    }

    async fn setup_topology(&self, routing_keys: &[String]) -> Result<(), ClientError> {
        self.declare_exchange().await?;
        self.declare_queue().await?;
        for routing_key in routing_keys {
            self.bind(routing_key).await?;
        }
        Ok(())
    }

    async fn declare_exchange(&self) -> Result<(), ClientError> {
        if self.exchange.is_empty() {
            return Ok(());
        }
        debug!(exchange = %self.exchange, "Declaring exchange");
        self.channel()?
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| ClientError::DeclareExchange {
                exchange: self.exchange.clone(),
                source,
            })
    }

    async fn declare_queue(&self) -> Result<(), ClientError> {
        if self.queue.is_empty() {
            return Ok(());
        }
        debug!(queue = %self.queue, "Declaring queue");
        self.channel()?
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| ClientError::DeclareQueue {
                queue: self.queue.clone(),
                source,
            })?;
        Ok(())
    }

    /// Bind the queue to the exchange using `routing_key`.
    ///
    /// Binding twice with the same routing key is a no-op for the broker.
    #[tracing::instrument(skip(self), fields(queue = %self.queue, exchange = %self.exchange))]
    pub async fn bind(&self, routing_key: &str) -> Result<(), ClientError> {
        info!("Binding queue to exchange");
        self.channel()?
            .queue_bind(
                &self.queue,
                &self.exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|source| ClientError::Bind {
                queue: self.queue.clone(),
                exchange: self.exchange.clone(),
                routing_key: routing_key.into(),
                source,
            })
    }

    /// Publish `message` to the exchange, routed with the message's own routing key.
    ///
    /// Messages are published as non-persistent, non-mandatory. Nothing is retried:
    /// serialization and publishing failures are returned as they are.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(exchange = %self.exchange, routing_key = %message.routing_key())
    )]
    pub async fn send<P: Serialize>(&self, message: &Message<P>) -> Result<(), ClientError> {
        let channel = self.channel()?;
        let payload = self
            .serializer
            .serialize(message)
            .map_err(ClientError::Serialization)?;
        let properties = BasicProperties::default()
            .with_content_type(self.serializer.content_type().into())
            .with_delivery_mode(TRANSIENT_DELIVERY_MODE);

        channel
            .basic_publish(
                &self.exchange,
                message.routing_key(),
                BasicPublishOptions {
                    mandatory: false,
                    // The immediate flag was dropped in RabbitMQ 3.0
                    immediate: false,
                },
                &payload,
                properties,
            )
            .await
            .map_err(ClientError::Publish)?
            .await
            .map_err(ClientError::Publish)?;

        debug!("Message sent");
        Ok(())
    }

    /// Start consuming messages from the queue.
    ///
    /// A background task is spawned on the current tokio runtime: for each delivery it
    /// decodes the body and awaits `handler` before moving on to the next one, so messages
    /// are handled one at a time, in delivery order. Bodies that cannot be decoded are logged
    /// and dropped. A panicking handler is logged and the task moves on to the next delivery.
    /// `consume` returns as soon as the broker has registered the consumer; the task keeps
    /// running until the broker closes the delivery stream.
    ///
    /// # Auto-ack
    ///
    /// Deliveries are auto-acknowledged: the broker considers a message delivered before
    /// `handler` runs. If the handler fails (or the process dies), the message is lost.
    pub async fn consume<P, H>(&self, handler: H) -> Result<(), ClientError>
    where
        P: DeserializeOwned + Send + 'static,
        H: Handler<P>,
    {
        let channel = self.channel()?;
        let consumer_tag = Uuid::new_v4().to_string();
        let consumer = channel
            .basic_consume(
                &self.queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: true,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| ClientError::Consume {
                queue: self.queue.clone(),
                source,
            })?;

        let deliveries = consumer.map(|delivery| delivery.map(|delivery| delivery.data));
        let span = tracing::info_span!(
            "servicebus_consumer",
            queue = %self.queue,
            consumer_tag = %consumer_tag
        );
        tokio::spawn(
            dispatch::<S, P, H, _>(deliveries, Arc::clone(&self.serializer), handler)
                .instrument(span),
        );

        info!(queue = %self.queue, "Consumer started");
        Ok(())
    }

    /// Close the channel, then the connection.
    ///
    /// Both are attempted even if closing the channel fails; the first failure is returned.
    /// Once closed, every other operation fails with [`ClientError::MissingConnection`] and
    /// calling `close` again is a no-op.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        info!("Closing RabbitMq channel and connection");
        let channel_outcome = match self.channel.take() {
            Some(channel) => channel
                .close(REPLY_SUCCESS, "Bye")
                .await
                .map_err(|source| ClientError::Close {
                    resource: "channel",
                    source,
                }),
            None => Ok(()),
        };
        let connection_outcome = match self.connection.take() {
            Some(connection) => connection
                .close(REPLY_SUCCESS, "Bye")
                .await
                .map_err(|source| ClientError::Close {
                    resource: "connection",
                    source,
                }),
            None => Ok(()),
        };
        channel_outcome.and(connection_outcome)
    }

    /// `true` if both the connection and the channel are open.
    pub fn is_connected(&self) -> bool {
        match (&self.connection, &self.channel) {
            (Some(connection), Some(channel)) => {
                matches!(connection.status().state(), ConnectionState::Connected)
                    && matches!(channel.status().state(), ChannelState::Connected)
            }
            _ => false,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    fn channel(&self) -> Result<&Channel, ClientError> {
        if self.connection.is_none() {
            warn!("Connection does not exist");
            return Err(ClientError::MissingConnection);
        }
        self.channel.as_ref().ok_or_else(|| {
            warn!("Channel does not exist");
            ClientError::MissingChannel
        })
    }
}

/// Feed every decodable delivery body to `handler`, one at a time.
async fn dispatch<S, P, H, D>(deliveries: D, serializer: Arc<S>, handler: H)
where
    S: Serializer,
    P: DeserializeOwned + Send + 'static,
    H: Handler<P>,
    D: Stream<Item = Result<Vec<u8>, lapin::Error>>,
{
    tokio::pin!(deliveries);
    while let Some(delivery) = deliveries.next().await {
        let body = match delivery {
            Ok(body) => body,
            Err(e) => {
                error!("Consumer error: {}", e);
                break;
            }
        };
        debug!("Received a message");
        match serializer.deserialize::<P>(&body) {
            Ok(message) => {
                // A panic in one handler invocation must not tear the whole consumer down.
                if AssertUnwindSafe(handler.handle(message))
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    error!("Message handler panicked, moving on to the next message");
                }
            }
            Err(e) => warn!(error = ?e, "Failed to deserialize message, dropping it"),
        }
    }
    info!("Delivery stream closed, consumer exiting");
}
