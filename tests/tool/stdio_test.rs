//! Protocol tests against an in-memory MCP server, plus real process spawning.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use headless_bi::config::ToolConfig;
use headless_bi::tool::{
    CallError, ClientConfig, ConnectError, ConnectionState, Connector, McpSession, RpcTransport,
    Session, StdioConnector, ToolClient,
};
use serde_json::{json, Map, Value};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

/// Minimal MCP server speaking over one end of a duplex pipe.
///
/// Records every method it receives. Before answering the first
/// `tools/call` it pings the client and sends a log notification.
async fn run_fake_server(io: DuplexStream, seen: Arc<Mutex<Vec<String>>>) {
    let (read, mut write) = tokio::io::split(io);
    let mut lines = BufReader::new(read).lines();
    let mut pinged = false;

    while let Ok(Some(line)) = lines.next_line().await {
        let message: Value = serde_json::from_str(&line).unwrap();
        let method = message["method"].as_str().map(str::to_string);
        let id = message["id"].clone();

        let Some(method) = method else {
            // Reply to our ping
            seen.lock().unwrap().push(format!("reply:{}", id));
            continue;
        };
        seen.lock().unwrap().push(method.clone());

        let result = match method.as_str() {
            "initialize" => json!({
                "protocolVersion": message["params"]["protocolVersion"],
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fake-dbt-mcp", "version": "0.0.1"}
            }),
            "notifications/initialized" => continue,
            "tools/list" => match message["params"]["cursor"].as_str() {
                None => json!({"tools": [{"name": "list_metrics"}], "nextCursor": "page-2"}),
                Some(_) => json!({"tools": [{"name": "query_metrics"}]}),
            },
            "tools/call" => {
                if !pinged {
                    pinged = true;
                    let ping = json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"});
                    let note = json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"level": "info"}});
                    write.write_all(format!("{}\n{}\n", ping, note).as_bytes()).await.unwrap();
                }
                let name = message["params"]["name"].as_str().unwrap_or_default();
                match name {
                    "list_metrics" => json!({
                        "content": [{"type": "text", "text": "[{\"name\": \"total_revenue\"}, {\"name\": \"order_count\"}]"}],
                        "isError": false
                    }),
                    "get_metrics_compiled_sql" => json!({
                        "content": [{"type": "text", "text": "SELECT SUM(amount) AS total_revenue FROM orders"}]
                    }),
                    "query_metrics" => json!({
                        "content": [{"type": "text", "text": "ignored"}],
                        "structuredContent": {"result": [{"total_revenue": 1200.5}]}
                    }),
                    "unknown_verb" => {
                        let reply = json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": {"code": -32602, "message": "Unknown tool: unknown_verb"}
                        });
                        write.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
                        continue;
                    }
                    "exit" => break,
                    other => json!({
                        "content": [{"type": "text", "text": format!("Error: no metric named '{}'", other)}],
                        "isError": true
                    }),
                }
            }
            _ => json!({}),
        };

        let reply = json!({"jsonrpc": "2.0", "id": id, "result": result});
        write.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
    }
}

/// Connector that wires a client to an in-memory server.
struct DuplexConnector {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self) -> Result<Box<dyn Session>, ConnectError> {
        let (client_io, server_io) = duplex(64 * 1024);
        tokio::spawn(run_fake_server(server_io, self.seen.clone()));

        let (read, write) = tokio::io::split(client_io);
        let session = McpSession::handshake(RpcTransport::new(read, write)).await?;
        Ok(Box::new(session))
    }
}

fn duplex_client() -> (ToolClient, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let client = ToolClient::new(
        DuplexConnector { seen: seen.clone() },
        ClientConfig::default(),
    );
    (client, seen)
}

#[tokio::test]
async fn test_handshake_sequence() {
    let (client, seen) = duplex_client();
    client.connect().await.unwrap();
    // A round trip guarantees the server has read everything sent before it
    client.list_metrics().await.unwrap();

    assert_eq!(
        seen.lock().unwrap()[..2],
        ["initialize".to_string(), "notifications/initialized".to_string()]
    );
    let info = client.server_info().unwrap();
    assert_eq!(info.name, "fake-dbt-mcp");
}

#[tokio::test]
async fn test_calls_over_the_wire() {
    let (client, seen) = duplex_client();
    client.connect().await.unwrap();

    let metrics = client.list_metrics().await.unwrap();
    assert_eq!(metrics.len(), 2);
    assert_eq!(metrics[1]["name"], "order_count");

    let query = headless_bi::tool::MetricQuery::new(["total_revenue"]);
    let rows = client.query_metrics(&query).await.unwrap().records();
    assert_eq!(rows, vec![json!({"total_revenue": 1200.5})]);

    let sql = client.compiled_sql(&query).await.unwrap();
    assert!(sql.starts_with("SELECT SUM(amount)"));

    // The server pinged us during the first call and got an answer
    assert!(seen.lock().unwrap().contains(&"reply:\"srv-1\"".to_string()));
}

#[tokio::test]
async fn test_is_error_result_becomes_call_failure() {
    let (client, _) = duplex_client();
    client.connect().await.unwrap();

    let err = client.call("mystery_metric", Map::new()).await.unwrap_err();
    match err {
        CallError::Failed { verb, message } => {
            assert_eq!(verb, "mystery_metric");
            assert_eq!(message, "Error: no metric named 'mystery_metric'");
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    assert!(client.is_ready());
}

#[tokio::test]
async fn test_rpc_error_becomes_call_failure() {
    let (client, _) = duplex_client();
    client.connect().await.unwrap();

    let err = client.call("unknown_verb", Map::new()).await.unwrap_err();
    assert!(matches!(&err, CallError::Failed { message, .. } if message.contains("Unknown tool")));
    assert!(client.is_ready());
}

#[tokio::test]
async fn test_tools_list_follows_cursor() {
    let (client, _) = duplex_client();
    client.connect().await.unwrap();

    let names: Vec<String> = client
        .list_tools()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, vec!["list_metrics", "query_metrics"]);
}

#[tokio::test]
async fn test_server_exit_drops_connection() {
    let (client, _) = duplex_client();
    client.connect().await.unwrap();

    let err = client.call("exit", Map::new()).await.unwrap_err();
    assert!(err.is_connection_lost());
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

// ============================================================================
// Real processes
// ============================================================================

fn process_config(command: &str, args: &[&str], dir: &std::path::Path) -> ToolConfig {
    let mut config = ToolConfig::dbt_mcp(dir)
        .with_command(command, args.iter().map(|a| a.to_string()).collect());
    config.prepare_manifest = false;
    config.shutdown_grace = Duration::from_millis(100);
    config
}

#[tokio::test]
async fn test_missing_executable_is_connect_failure() {
    let dir = tempfile::tempdir().unwrap();
    let client = ToolClient::stdio(
        process_config("/no/such/dbt-mcp-server", &[], dir.path()),
        ClientConfig::default(),
    );

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ConnectError::Failed(_)));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[cfg(unix)]
#[tokio::test]
async fn test_silent_process_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let config = ClientConfig {
        handshake_timeout: Duration::from_millis(200),
        ..ClientConfig::default()
    };
    let client = ToolClient::stdio(process_config("sleep", &["30"], dir.path()), config);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ConnectError::Timeout(_)));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[cfg(unix)]
#[tokio::test]
async fn test_process_that_exits_fails_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let connector = StdioConnector::new(process_config("true", &[], dir.path()));

    match connector.connect().await {
        Ok(_) => panic!("handshake with `true` should fail"),
        Err(err) => assert!(matches!(err, ConnectError::Failed(_))),
    }
}
