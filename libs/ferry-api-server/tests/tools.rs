use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use ferry_api::message::SubscriptionMode;
use ferry_api_server::{DispatchError, dispatch, router, tools};
use ferry_engine::Relay;
use ferry_engine::config::RelayConfig;
use ferry_engine::loopback::LoopbackBroker;

async fn connected_relay(mode: SubscriptionMode) -> Relay {
    let relay = Relay::new(RelayConfig::default(), Arc::new(LoopbackBroker::new(mode))).unwrap();
    relay.connect().await.unwrap();
    relay
}

async fn wait_for_messages(relay: &Relay, n: usize) {
    for _ in 0..500 {
        if relay.buffer().len() >= n {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("expected {n} buffered messages");
}

#[test]
fn tool_names_carry_the_prefix() {
    let names = tools::tool_names("kafka");
    assert_eq!(names.len(), 7);
    assert!(names.contains(&"kafka_subscribe_batch".to_string()));
    assert!(names.iter().all(|n| n.starts_with("kafka_")));
}

#[test]
fn every_tool_has_its_own_schema() {
    let specs = tools::tool_specs("mqtt");
    assert_eq!(specs.len(), tools::TOOLS.len());

    let mut descriptions: Vec<&str> = specs.iter().map(|s| s.description).collect();
    descriptions.sort_unstable();
    descriptions.dedup();
    assert_eq!(descriptions.len(), specs.len());

    let clear = specs.iter().find(|s| s.name == "mqtt_clear_messages").unwrap();
    assert_eq!(clear.input_schema["properties"], json!({}));
    let unsubscribe = specs.iter().find(|s| s.name == "mqtt_unsubscribe").unwrap();
    assert_eq!(unsubscribe.input_schema["required"], json!(["topic"]));
}

#[tokio::test]
async fn subscribe_publish_and_read_back() {
    let relay = connected_relay(SubscriptionMode::Incremental).await;

    let sub = dispatch(&relay, "mqtt", "mqtt_subscribe", json!({ "topic": "sensors/+/temp", "qos": 1 }))
        .await
        .unwrap();
    assert!(sub.ok);
    assert_eq!(sub.result.unwrap()["already_present"], false);

    let published = dispatch(
        &relay,
        "mqtt",
        "mqtt_publish",
        json!({ "topic": "sensors/3/temp", "message": { "c": 21.5 } }),
    )
    .await
    .unwrap();
    assert!(published.ok);

    wait_for_messages(&relay, 1).await;
    let read = dispatch(&relay, "mqtt", "mqtt_get_messages", json!({ "topic": "sensors/#" }))
        .await
        .unwrap();
    let result = read.result.unwrap();
    assert_eq!(result["count"], 1);
    assert_eq!(result["messages"][0]["topic"], "sensors/3/temp");
    assert_eq!(result["messages"][0]["payload"], "{\"c\":21.5}");
}

#[tokio::test]
async fn engine_errors_come_back_as_payloads() {
    let relay = connected_relay(SubscriptionMode::Incremental).await;

    let response = dispatch(&relay, "mqtt", "mqtt_subscribe", json!({ "topic": "a/#/b" }))
        .await
        .unwrap();

    assert!(!response.ok);
    let error = response.error.unwrap();
    assert_eq!(error.kind, "InvalidPattern");
}

#[tokio::test]
async fn batch_reports_each_topic() {
    let relay = connected_relay(SubscriptionMode::RestartRequired).await;

    let response = dispatch(
        &relay,
        "kafka",
        "kafka_subscribe_batch",
        json!({ "topics": ["orders", "payments", "bad/#/x"], "fromBeginning": true }),
    )
    .await
    .unwrap();

    let result = response.result.unwrap();
    assert_eq!(result["total"], 3);
    assert_eq!(result["success"], 2);
    assert_eq!(result["failed"], 1);
    assert_eq!(result["results"][2]["success"], false);
}

#[tokio::test]
async fn unknown_tool_and_bad_arguments_are_dispatch_errors() {
    let relay = connected_relay(SubscriptionMode::Incremental).await;

    assert!(matches!(
        dispatch(&relay, "mqtt", "mqtt_explode", Value::Null).await,
        Err(DispatchError::UnknownTool(_))
    ));
    assert!(matches!(
        dispatch(&relay, "mqtt", "kafka_status", Value::Null).await,
        Err(DispatchError::UnknownTool(_))
    ));
    assert!(matches!(
        dispatch(&relay, "mqtt", "mqtt_subscribe", json!({ "topic": 5 })).await,
        Err(DispatchError::InvalidArguments { .. })
    ));
}

#[tokio::test]
async fn status_and_clear_take_no_arguments() {
    let relay = connected_relay(SubscriptionMode::Incremental).await;

    let status = dispatch(&relay, "mqtt", "mqtt_status", Value::Null).await.unwrap();
    assert_eq!(status.result.unwrap()["state"], "connected");

    let cleared = dispatch(&relay, "mqtt", "mqtt_clear_messages", json!({})).await.unwrap();
    assert_eq!(cleared.result.unwrap()["cleared"], 0);
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

async fn call(app: axum::Router, method: Method, uri: &str, body: Body) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn http_routes_map_dispatch_outcomes_to_status_codes() {
    let relay = connected_relay(SubscriptionMode::Incremental).await;
    let app = router(relay, "mqtt");

    let (status, tools) = call(app.clone(), Method::GET, "/api/tools", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tools.as_array().unwrap().len(), 7);

    let (status, body) = call(app.clone(), Method::POST, "/api/tools/mqtt_status", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let (status, body) = call(app.clone(), Method::POST, "/api/tools/nope", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "UnknownTool");

    let (status, body) = call(
        app.clone(),
        Method::POST,
        "/api/tools/mqtt_subscribe",
        Body::from("{\"qos\": 1}"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "InvalidArguments");

    let (status, body) = call(
        app.clone(),
        Method::POST,
        "/api/tools/mqtt_publish",
        Body::from("{\"topic\": \"a/+\", \"message\": \"x\"}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"]["kind"], "PublishError");

    let (status, body) = call(app, Method::GET, "/api/status", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["transport"], "loopback");
}
