use crate::helpers::{cleanup, get_amqp_url, get_one, get_raw_channel, random_name};
use serde::{Deserialize, Serialize};
use servicebus::amqp::options::BasicPublishOptions;
use servicebus::amqp::BasicProperties;
use servicebus::{Client, JsonSerializer, Message, Serializer};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderCreated {
    id: u64,
    customer: String,
}

#[tokio::test]
async fn the_published_body_is_the_serialized_message() {
    // Arrange
    let exchange = random_name();
    let queue = random_name();
    let mut client = Client::connect(&get_amqp_url(), &exchange, &queue)
        .await
        .unwrap();
    client.bind("created").await.unwrap();
    let message = Message::new(
        "created",
        OrderCreated {
            id: 42,
            customer: "ada".into(),
        },
    );
    let raw = get_raw_channel().await;

    // Act
    client.send(&message).await.unwrap();

    // Assert
    let delivery = get_one(&raw, &queue).await;
    assert_eq!(JsonSerializer.serialize(&message).unwrap(), delivery.data);
    assert_eq!(exchange, delivery.exchange.as_str());
    assert_eq!(
        Some("application/json"),
        delivery
            .properties
            .content_type()
            .as_ref()
            .map(|content_type| content_type.as_str())
    );
    assert_eq!(&Some(1), delivery.properties.delivery_mode());

    client.close().await.unwrap();
    cleanup(&raw, &exchange, &queue).await;
}

#[tokio::test]
async fn the_default_exchange_routes_by_queue_name() {
    let queue = random_name();
    let mut client = Client::connect(&get_amqp_url(), "", &queue).await.unwrap();
    let raw = get_raw_channel().await;

    let message = Message::new(queue.clone(), serde_json::json!("hello"));

    client.send(&message).await.unwrap();

    let delivery = get_one(&raw, &queue).await;
    assert_eq!(JsonSerializer.serialize(&message).unwrap(), delivery.data);

    client.close().await.unwrap();
    cleanup(&raw, "", &queue).await;
}

#[tokio::test]
async fn consumed_messages_reach_the_handler_in_order() {
    // Arrange
    let exchange = random_name();
    let queue = random_name();
    let mut client = Client::connect(&get_amqp_url(), &exchange, &queue)
        .await
        .unwrap();
    client.bind("created").await.unwrap();

    let (sender, mut receiver) = mpsc::unbounded_channel();
    client
        .consume(move |message: Message<OrderCreated>| {
            let sender = sender.clone();
            async move {
                let _ = sender.send(message);
            }
        })
        .await
        .unwrap();

    let messages: Vec<_> = (0..5)
        .map(|id| {
            Message::new(
                "created",
                OrderCreated {
                    id,
                    customer: format!("customer-{id}"),
                },
            )
        })
        .collect();

    // Act
    for message in &messages {
        client.send(message).await.unwrap();
    }

    // Assert
    for expected in &messages {
        let received = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("Timed out waiting for a message")
            .unwrap();
        assert_eq!(expected, &received);
    }

    client.close().await.unwrap();
    cleanup(&get_raw_channel().await, &exchange, &queue).await;
}

#[tokio::test]
async fn malformed_payloads_never_reach_the_handler() {
    // Arrange
    let queue = random_name();
    let mut client = Client::connect(&get_amqp_url(), "", &queue).await.unwrap();

    let (sender, mut receiver) = mpsc::unbounded_channel();
    client
        .consume(move |message: Message<OrderCreated>| {
            let sender = sender.clone();
            async move {
                let _ = sender.send(message);
            }
        })
        .await
        .unwrap();

    let raw = get_raw_channel().await;
    let valid = Message::new(
        queue.clone(),
        OrderCreated {
            id: 7,
            customer: "grace".into(),
        },
    );

    // Act
    raw.basic_publish(
        "",
        &queue,
        BasicPublishOptions::default(),
        b"definitely not json",
        BasicProperties::default(),
    )
    .await
    .unwrap();
    client.send(&valid).await.unwrap();

    // Assert
    let received = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("Timed out waiting for a message")
        .unwrap();
    assert_eq!(valid, received);
    assert!(
        tokio::time::timeout(Duration::from_millis(500), receiver.recv())
            .await
            .is_err(),
        "The handler was invoked more than once"
    );

    client.close().await.unwrap();
    cleanup(&raw, "", &queue).await;
}
