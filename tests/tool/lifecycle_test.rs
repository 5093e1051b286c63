//! Connection lifecycle tests for ToolClient.

mod support;

use std::time::Duration;

use futures::future::join_all;
use headless_bi::tool::{CallError, ClientConfig, ConnectError, ConnectionState, ToolClient};
use serde_json::{json, Map, Value};
use support::{FakeConnector, Outcome};

fn client_for(connector: FakeConnector) -> ToolClient {
    ToolClient::new(connector, ClientConfig::default())
}

async fn wait_for_state(client: &ToolClient, wanted: ConnectionState) {
    while client.state() != wanted {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// connect
// ============================================================================

#[tokio::test]
async fn test_new_client_is_disconnected() {
    let client = client_for(FakeConnector::new(Outcome::Succeed));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(!client.is_ready());
    assert!(client.last_error().is_none());
}

#[tokio::test]
async fn test_call_before_connect_is_not_connected() {
    let connector = FakeConnector::new(Outcome::Succeed);
    let probe = connector.probe.clone();
    let client = client_for(connector);

    for verb in ["list_metrics", "query_metrics", "anything"] {
        let mut params = Map::new();
        params.insert("metrics".to_string(), json!(["total_revenue"]));
        let err = client.call(verb, params).await.unwrap_err();
        assert!(matches!(err, CallError::NotConnected));
    }
    assert!(matches!(
        client.list_metrics().await,
        Err(CallError::NotConnected)
    ));
    assert_eq!(probe.attempts(), 0);
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let connector = FakeConnector::new(Outcome::Succeed);
    let probe = connector.probe.clone();
    let client = client_for(connector);

    client.connect().await.unwrap();
    client.connect().await.unwrap();
    client.ensure_ready().await.unwrap();

    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(probe.attempts(), 1);
}

#[tokio::test]
async fn test_concurrent_connects_share_one_attempt() {
    let connector = FakeConnector::new(Outcome::Succeed).with_delay(Duration::from_millis(50));
    let probe = connector.probe.clone();
    let client = client_for(connector);

    let results = join_all((0..8).map(|_| client.connect())).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(probe.attempts(), 1);
    assert_eq!(client.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_concurrent_connects_share_one_failure() {
    let connector = FakeConnector::new(Outcome::Fail("dbt project not found".to_string()))
        .with_delay(Duration::from_millis(20));
    let probe = connector.probe.clone();
    let client = client_for(connector);

    let results = join_all((0..4).map(|_| client.ensure_ready())).await;

    let expected = ConnectError::Failed("dbt project not found".to_string());
    for result in results {
        assert_eq!(result.unwrap_err(), expected);
    }
    assert_eq!(probe.attempts(), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.last_error(), Some(expected));
}

#[tokio::test]
async fn test_failed_connect_can_be_retried() {
    let connector = FakeConnector::new(Outcome::Fail("boom".to_string()));
    let probe = connector.probe.clone();
    let client = client_for(connector);

    assert!(client.connect().await.is_err());
    assert!(client.connect().await.is_err());
    assert_eq!(probe.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_leaves_disconnected() {
    let connector = FakeConnector::new(Outcome::Hang);
    let probe = connector.probe.clone();
    let client = client_for(connector);

    let err = client.connect().await.unwrap_err();

    assert_eq!(err, ConnectError::Timeout(900));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.last_error(), Some(ConnectError::Timeout(900)));
    // The hung attempt was dropped, which is what kills a real child
    assert!(probe.was_cancelled());
}

#[tokio::test]
async fn test_custom_handshake_timeout() {
    let config = ClientConfig {
        handshake_timeout: Duration::from_millis(30),
        ..ClientConfig::default()
    };
    let client = ToolClient::new(FakeConnector::new(Outcome::Hang), config);

    assert!(matches!(
        client.connect().await,
        Err(ConnectError::Timeout(_))
    ));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_cancelled_connect_resets_state() {
    let connector = FakeConnector::new(Outcome::Hang);
    let probe = connector.probe.clone();
    let client = client_for(connector);

    let task = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    wait_for_state(&client, ConnectionState::Connecting).await;

    task.abort();
    let _ = task.await;

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(probe.was_cancelled());
}

// ============================================================================
// call
// ============================================================================

#[tokio::test]
async fn test_list_metrics_returns_named_records() {
    let client = client_for(FakeConnector::new(Outcome::Succeed));
    client.ensure_ready().await.unwrap();

    let metrics = client.list_metrics().await.unwrap();

    assert_eq!(metrics.len(), 2);
    assert!(metrics.iter().all(|m| m.get("name").is_some()));
    assert_eq!(metrics[0]["name"], "total_revenue");
}

#[tokio::test]
async fn test_call_forwards_params_unchanged() {
    let connector = FakeConnector::new(Outcome::Succeed);
    let probe = connector.probe.clone();
    let client = client_for(connector);
    client.connect().await.unwrap();

    let mut params = Map::new();
    params.insert("model_name".to_string(), json!("orders"));
    let response = client.call("get_model", params.clone()).await.unwrap();

    assert_eq!(response.records()[0]["arguments"], Value::Object(params.clone()));
    assert_eq!(probe.calls(), vec![("get_model".to_string(), params)]);
}

#[tokio::test]
async fn test_tool_error_is_verbatim_and_keeps_connection() {
    let client = client_for(FakeConnector::new(Outcome::Succeed));
    client.connect().await.unwrap();

    let err = client.call("boom", Map::new()).await.unwrap_err();

    match err {
        CallError::Failed { verb, message } => {
            assert_eq!(verb, "boom");
            assert_eq!(message, "Metric 'boom' does not exist");
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    assert_eq!(client.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_lost_connection_drops_to_disconnected() {
    let connector = FakeConnector::new(Outcome::Succeed);
    let probe = connector.probe.clone();
    let client = client_for(connector);
    client.connect().await.unwrap();

    let err = client.call("crash", Map::new()).await.unwrap_err();

    assert!(err.is_connection_lost());
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(probe.shutdowns(), 1);
    assert!(matches!(
        client.call("list_metrics", Map::new()).await,
        Err(CallError::NotConnected)
    ));
}

#[tokio::test]
async fn test_cancelled_call_tears_connection_down() {
    let connector = FakeConnector::new(Outcome::Succeed);
    let probe = connector.probe.clone();
    let client = client_for(connector);
    client.connect().await.unwrap();

    let timed_out =
        tokio::time::timeout(Duration::from_millis(20), client.call("slow", Map::new())).await;
    assert!(timed_out.is_err());
    assert_eq!(client.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(probe.shutdowns(), 1);
}

#[tokio::test]
async fn test_list_tools() {
    let client = client_for(FakeConnector::new(Outcome::Succeed));
    client.connect().await.unwrap();

    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools[0].name, "list_metrics");
}

// ============================================================================
// disconnect
// ============================================================================

#[tokio::test]
async fn test_disconnect_before_connect_and_twice() {
    let connector = FakeConnector::new(Outcome::Succeed);
    let probe = connector.probe.clone();
    let client = client_for(connector);

    client.disconnect().await;
    client.connect().await.unwrap();
    client.disconnect().await;
    client.disconnect().await;

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(probe.shutdowns(), 1);
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let connector = FakeConnector::new(Outcome::Succeed);
    let probe = connector.probe.clone();
    let client = client_for(connector);

    client.connect().await.unwrap();
    client.disconnect().await;
    assert!(matches!(
        client.call("list_metrics", Map::new()).await,
        Err(CallError::NotConnected)
    ));

    client.ensure_ready().await.unwrap();
    assert!(client.is_ready());
    assert_eq!(probe.attempts(), 2);
}

#[tokio::test]
async fn test_disconnect_during_connect_discards_session() {
    let connector = FakeConnector::new(Outcome::Succeed).with_delay(Duration::from_millis(50));
    let probe = connector.probe.clone();
    let client = client_for(connector);

    let task = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    wait_for_state(&client, ConnectionState::Connecting).await;

    client.disconnect().await;
    let result = task.await.unwrap();

    assert!(matches!(result, Err(ConnectError::Failed(_))));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(probe.shutdowns(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_after_disconnect_waits_for_superseded_attempt() {
    let connector = FakeConnector::new(Outcome::Succeed).with_delay(Duration::from_millis(200));
    let probe = connector.probe.clone();
    let client = client_for(connector);

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    wait_for_state(&client, ConnectionState::Connecting).await;
    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let second = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(probe.attempts(), 1);

    assert!(matches!(
        first.await.unwrap(),
        Err(ConnectError::Failed(msg)) if msg.contains("closed while connecting")
    ));
    second.await.unwrap().unwrap();

    assert!(client.is_ready());
    assert_eq!(probe.attempts(), 2);
    assert_eq!(probe.max_in_flight(), 1);
    assert_eq!(probe.shutdowns(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_superseded_attempt_does_not_block_connect() {
    let connector = FakeConnector::new(Outcome::Succeed).with_delay(Duration::from_millis(200));
    let probe = connector.probe.clone();
    let client = client_for(connector);

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    wait_for_state(&client, ConnectionState::Connecting).await;
    client.disconnect().await;

    first.abort();
    let _ = first.await;
    assert!(probe.was_cancelled());

    client.connect().await.unwrap();
    assert!(client.is_ready());
    assert_eq!(probe.attempts(), 2);
    assert_eq!(probe.max_in_flight(), 1);
}

#[tokio::test]
async fn test_clones_share_one_connection() {
    let connector = FakeConnector::new(Outcome::Succeed);
    let probe = connector.probe.clone();
    let client = client_for(connector);
    let other = client.clone();

    client.connect().await.unwrap();
    assert!(other.is_ready());
    other.disconnect().await;
    assert!(!client.is_ready());
    assert_eq!(probe.attempts(), 1);
}
