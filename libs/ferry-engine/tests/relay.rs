mod common;

use ferry_api::message::{OutgoingMessage, SubscribeOptions, SubscriptionMode};
use ferry_api::record::IncomingRecord;
use ferry_engine::loopback::BrokerCall;
use ferry_engine::relay::MessageQuery;
use ferry_engine::state::ConnectionState;
use ferry_engine::RelayError;

use common::{relay, wait_until};

fn topics(relay: &ferry_engine::Relay, query: &MessageQuery) -> Vec<String> {
    relay
        .get_messages(query)
        .unwrap()
        .messages
        .iter()
        .map(|r| r.topic.clone())
        .collect()
}

#[tokio::test]
async fn get_messages_filters_by_pattern_and_keeps_order() {
    let (relay, _broker) = relay(SubscriptionMode::Incremental);
    relay.connect().await.unwrap();
    relay.subscribe("#", SubscribeOptions::default()).await.unwrap();

    for topic in ["orders/1", "billing/1", "orders/2", "orders/3"] {
        relay.publish(OutgoingMessage::new(topic, "{}")).await.unwrap();
    }
    wait_until("four records", || relay.buffer().len() == 4).await;

    let query = MessageQuery {
        limit: Some(2),
        topic: Some("orders/#".into()),
        ..Default::default()
    };
    assert_eq!(topics(&relay, &query), ["orders/2", "orders/3"]);
}

#[tokio::test]
async fn non_positive_limit_falls_back_to_default() {
    let (relay, _broker) = relay(SubscriptionMode::Incremental);
    relay.connect().await.unwrap();
    relay.subscribe("t", SubscribeOptions::default()).await.unwrap();
    for i in 0..15 {
        relay.publish(OutgoingMessage::new("t", i.to_string())).await.unwrap();
    }
    wait_until("fifteen records", || relay.buffer().len() == 15).await;

    for limit in [None, Some(0), Some(-3)] {
        let query = MessageQuery { limit, ..Default::default() };
        assert_eq!(relay.get_messages(&query).unwrap().count, 10);
    }
}

#[tokio::test]
async fn get_messages_filters_by_key_and_partition() {
    let (relay, _broker) = relay(SubscriptionMode::RestartRequired);
    relay.connect().await.unwrap();
    relay.subscribe("orders", SubscribeOptions::default()).await.unwrap();

    for (key, partition) in [("a", 0), ("b", 1), ("a", 1)] {
        let mut message = OutgoingMessage::new("orders", "{}");
        message.key = Some(key.into());
        message.partition = Some(partition);
        relay.publish(message).await.unwrap();
    }
    wait_until("three records", || relay.buffer().len() == 3).await;

    let by_key = MessageQuery { key: Some("a".into()), ..Default::default() };
    assert_eq!(relay.get_messages(&by_key).unwrap().count, 2);

    let by_both = MessageQuery {
        key: Some("a".into()),
        partition: Some(1),
        ..Default::default()
    };
    let found = relay.get_messages(&by_both).unwrap();
    assert_eq!(found.count, 1);
    assert_eq!(found.messages[0].partition, Some(1));
}

#[tokio::test]
async fn invalid_query_pattern_is_rejected() {
    let (relay, _broker) = relay(SubscriptionMode::Incremental);
    let query = MessageQuery { topic: Some("a/#/b".into()), ..Default::default() };
    assert!(matches!(
        relay.get_messages(&query),
        Err(RelayError::InvalidPattern { .. })
    ));
}

#[tokio::test]
async fn subscribing_twice_is_a_reported_no_op() {
    let (relay, broker) = relay(SubscriptionMode::Incremental);
    relay.connect().await.unwrap();

    let first = relay.subscribe("a/b", SubscribeOptions::default()).await.unwrap();
    let second = relay.subscribe("a/b", SubscribeOptions::default()).await.unwrap();

    assert!(!first.already_present);
    assert!(second.already_present);
    assert_eq!(relay.status().subscribed_topics, ["a/b"]);
    let subscribes = broker
        .calls()
        .into_iter()
        .filter(|c| matches!(c, BrokerCall::Subscribe(_)))
        .count();
    assert_eq!(subscribes, 1);
}

#[tokio::test]
async fn subscribe_rejects_malformed_patterns() {
    let (relay, broker) = relay(SubscriptionMode::Incremental);
    relay.connect().await.unwrap();

    let err = relay.subscribe("a/#/b", SubscribeOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), "InvalidPattern");
    assert!(relay.status().subscribed_topics.is_empty());
    assert!(!broker.calls().iter().any(|c| matches!(c, BrokerCall::Subscribe(_))));
}

#[tokio::test]
async fn unsubscribe_reports_presence_and_stops_delivery() {
    let (relay, broker) = relay(SubscriptionMode::Incremental);
    relay.connect().await.unwrap();
    relay.subscribe("a", SubscribeOptions::default()).await.unwrap();

    assert!(relay.unsubscribe("a").await.unwrap().was_present);
    assert!(!relay.unsubscribe("a").await.unwrap().was_present);
    assert!(broker.subscribed().is_empty());

    relay.publish(OutgoingMessage::new("a", "late")).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(relay.buffer().is_empty());
}

#[tokio::test]
async fn publish_while_disconnected_is_a_publish_error() {
    let (relay, _broker) = relay(SubscriptionMode::Incremental);
    let err = relay.publish(OutgoingMessage::new("a", "x")).await.unwrap_err();
    assert_eq!(err.kind(), "PublishError");
}

#[tokio::test]
async fn publish_rejects_wildcard_topics_and_bad_qos() {
    let (relay, _broker) = relay(SubscriptionMode::Incremental);
    relay.connect().await.unwrap();

    let err = relay.publish(OutgoingMessage::new("a/+", "x")).await.unwrap_err();
    assert!(matches!(err, RelayError::Publish(_)));

    let mut message = OutgoingMessage::new("a", "x");
    message.qos = Some(3);
    assert!(matches!(relay.publish(message).await, Err(RelayError::Publish(_))));
}

#[tokio::test]
async fn malformed_record_is_dropped_without_stopping_ingestion() {
    let (relay, broker) = relay(SubscriptionMode::Incremental);
    relay.connect().await.unwrap();
    relay.subscribe("#", SubscribeOptions::default()).await.unwrap();

    assert!(broker.inject(IncomingRecord::new("", "no topic")).await);
    assert!(broker.inject(IncomingRecord::new("ok", "fine")).await);

    wait_until("good record stored", || relay.buffer().len() == 1).await;
    let status = relay.status();
    assert_eq!(status.dropped, 1);
    assert_eq!(status.total_received, 2);
    assert_eq!(status.state, ConnectionState::Running);
}

#[tokio::test]
async fn clear_messages_returns_cleared_count() {
    let (relay, _broker) = relay(SubscriptionMode::Incremental);
    relay.connect().await.unwrap();
    relay.subscribe("t", SubscribeOptions::default()).await.unwrap();
    relay.publish(OutgoingMessage::new("t", "1")).await.unwrap();
    relay.publish(OutgoingMessage::new("t", "2")).await.unwrap();
    wait_until("two records", || relay.buffer().len() == 2).await;

    assert_eq!(relay.clear_messages().cleared, 2);
    assert_eq!(relay.status().message_count, 0);
}

#[tokio::test]
async fn status_reports_connection_details() {
    let (relay, _broker) = relay(SubscriptionMode::RestartRequired);
    relay.connect().await.unwrap();

    let status = serde_json::to_value(relay.status()).unwrap();
    assert_eq!(status["transport"], "loopback");
    assert_eq!(status["mode"], "restart_required");
    assert_eq!(status["state"], "connected");
    assert_eq!(status["capacity"], 10_000);
    assert_eq!(status["connection"]["broker"], "loopback");
}

#[tokio::test]
async fn bootstrap_connects_and_subscribes() {
    let broker = std::sync::Arc::new(ferry_engine::loopback::LoopbackBroker::new(
        SubscriptionMode::RestartRequired,
    ));
    let relay = ferry_engine::Relay::bootstrap(
        common::fast_config(),
        broker.clone(),
        vec!["orders".into(), "payments".into()],
        SubscribeOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(relay.status().state, ConnectionState::Running);
    assert_eq!(broker.subscribed(), ["orders", "payments"]);
    assert_eq!(
        broker.calls(),
        [
            BrokerCall::Connect,
            BrokerCall::Subscribe(vec!["orders".into(), "payments".into()]),
            BrokerCall::Start,
        ]
    );
}
