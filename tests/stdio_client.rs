//! End-to-end stdio transport tests against a canned /bin/sh MCP server.
//!
//! Request ids are deterministic (monotonic from 1 per transport), so the
//! fake server can reply with matching ids without parsing anything.

use mcplex::shared::StdioTransport;
use mcplex::{Client, McpTransport, ServerConfig};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A shell loop that answers initialize (id 1), tools/list (id 2), and
/// tools/call (id 3), and stays silent for notifications.
const ECHO_SERVER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-03-26","capabilities":{},"serverInfo":{"name":"x","version":"1"}}}'
      ;;
    *'"method":"tools/list"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"e","schema":{"type":"object"}}]}}'
      ;;
    *'"method":"tools/call"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"hi"}]}}'
      ;;
  esac
done
"#;

fn echo_server_config(name: &str) -> ServerConfig {
    serde_json::from_value(json!({
        "type": "stdio",
        "command": ["/bin/sh", "-c", ECHO_SERVER],
        "name": name,
    }))
    .unwrap()
}

#[tokio::test]
async fn stdio_happy_path() {
    let client = Client::new(vec![echo_server_config("local")]).unwrap();

    let tools = client.list_tools(true).await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");
    assert_eq!(tools[0].description.as_deref(), Some("e"));
    assert_eq!(tools[0].schema, json!({"type": "object"}));
    assert_eq!(tools[0].server.server_name, "local");

    let result = client
        .call_tool("echo", json!({"msg": "hi"}), None)
        .await
        .unwrap();
    assert_eq!(result, json!({"content": [{"type": "text", "text": "hi"}]}));

    let info = client.transport("local").unwrap().server_info().unwrap();
    assert_eq!(info.name, "x");
    assert_eq!(info.version, "1");

    client.cleanup().await;
    client.cleanup().await;
}

#[tokio::test]
async fn stdio_tool_cache_is_stable_until_cleared() {
    let client = Client::new(vec![echo_server_config("local")]).unwrap();

    let first = client.list_tools(true).await.unwrap();
    let second = client.list_tools(true).await.unwrap();
    let pairs = |tools: &[mcplex::Tool]| {
        tools
            .iter()
            .map(|t| (t.server.server_name.clone(), t.name.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(pairs(&first), pairs(&second));

    client.cleanup().await;
}

#[tokio::test]
async fn stdio_streaming_yields_single_final_result() {
    use futures::StreamExt;

    let client = Client::new(vec![echo_server_config("local")]).unwrap();
    let mut stream = client
        .call_tool_streaming("echo", json!({"msg": "hi"}), None)
        .await
        .unwrap();

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first["content"][0]["text"], "hi");
    assert!(stream.next().await.is_none());

    client.cleanup().await;
}

#[tokio::test]
async fn stdio_timeout_is_a_transport_error() {
    // A server that consumes requests but never answers.
    let transport = StdioTransport::new(
        vec![
            "/bin/sh".into(),
            "-c".into(),
            "while IFS= read -r line; do :; done".into(),
        ],
        HashMap::new(),
        Duration::from_millis(200),
        None,
    )
    .unwrap();

    let err = transport.connect().await.unwrap_err();
    assert!(
        err.to_string().contains("Timeout"),
        "expected timeout, got: {err}"
    );
    transport.cleanup().await.unwrap();
}

#[tokio::test]
async fn stdio_notifications_reach_listeners() {
    // Emits a list_changed notification right after the handshake.
    let script = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-03-26","capabilities":{},"serverInfo":{"name":"x","version":"1"}}}'
      ;;
    *'"method":"notifications/initialized"'*)
      printf '%s\n' '{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}'
      ;;
    *'"method":"tools/list"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[]}}'
      ;;
  esac
done
"#;
    let config: ServerConfig = serde_json::from_value(json!({
        "type": "stdio",
        "command": ["/bin/sh", "-c", script],
        "name": "noisy",
    }))
    .unwrap();
    let client = Client::new(vec![config]).unwrap();

    let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    client.on_notification(Arc::new(move |server, method, _params: Option<&Value>| {
        seen_clone
            .lock()
            .unwrap()
            .push((server.to_string(), method.to_string()));
    }));

    client.list_tools(true).await.unwrap();
    // The notification races the tools/list response; give the reader a beat.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let seen = seen.lock().unwrap().clone();
    assert!(
        seen.contains(&("noisy".to_string(), "notifications/tools/list_changed".to_string())),
        "listener did not observe the notification: {seen:?}"
    );

    client.cleanup().await;
}
