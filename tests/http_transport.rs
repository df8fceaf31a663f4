//! Plain HTTP transport tests: handshake, session-id echo, status mapping,
//! and retry-then-success against a sequencing server.

mod common;

use common::{read_http_request, write_empty_response, write_response};
use mcplex::shared::HttpTransport;
use mcplex::{Error, McpTransport, RetryPolicy};
use mockito::Matcher;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

fn init_result_body() -> String {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": {
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "serverInfo": {"name": "http-srv", "version": "0.1"},
        },
    })
    .to_string()
}

fn transport(base_url: &str, retry: RetryPolicy) -> HttpTransport {
    HttpTransport::new(
        base_url,
        "/rpc",
        Vec::new(),
        Duration::from_secs(5),
        retry,
        None,
        None,
    )
    .unwrap()
}

#[tokio::test]
async fn handshake_then_call_with_session_echo() {
    let mut server = mockito::Server::new_async().await;

    let init = server
        .mock("POST", "/rpc")
        .match_body(Matcher::PartialJson(json!({"method": "initialize"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_header("mcp-session-id", "sess-1")
        .with_body(init_result_body())
        .create_async()
        .await;

    // The session id from the initialize response must be echoed on every
    // subsequent request.
    let initialized = server
        .mock("POST", "/rpc")
        .match_body(Matcher::PartialJson(json!({"method": "notifications/initialized"})))
        .match_header("mcp-session-id", "sess-1")
        .with_status(202)
        .create_async()
        .await;

    let call = server
        .mock("POST", "/rpc")
        .match_body(Matcher::PartialJson(json!({
            "method": "tools/call",
            "params": {"name": "echo", "arguments": {"msg": "hi"}},
        })))
        .match_header("mcp-session-id", "sess-1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "result": {"content": [{"type": "text", "text": "hi"}]},
            })
            .to_string(),
        )
        .create_async()
        .await;

    let transport = transport(&server.url(), RetryPolicy::none());
    let result = transport
        .call_tool("echo", json!({"msg": "hi"}))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "hi");
    assert_eq!(transport.server_info().unwrap().name, "http-srv");

    init.assert_async().await;
    initialized.assert_async().await;
    call.assert_async().await;
}

#[tokio::test]
async fn http_401_maps_to_authorization_failed() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/rpc")
        .with_status(401)
        .create_async()
        .await;

    let transport = transport(&server.url(), RetryPolicy::none());
    match transport.rpc_request("tools/list", None).await {
        Err(Error::Connection(msg)) => assert!(msg.contains("Authorization failed: HTTP 401")),
        other => panic!("expected connection error, got {other:?}"),
    }
}

#[tokio::test]
async fn http_4xx_is_a_server_error_and_not_retried() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/rpc")
        .with_status(404)
        .expect(1)
        .create_async()
        .await;

    let transport = transport(&server.url(), RetryPolicy::new(3, 0));
    match transport.rpc_request("tools/list", None).await {
        Err(Error::Server { message, code }) => {
            assert_eq!(message, "Client error: HTTP 404");
            assert_eq!(code, Some(404));
        },
        other => panic!("expected server error, got {other:?}"),
    }
    // A 4xx must burn exactly one attempt.
    mock.assert_async().await;
}

#[tokio::test]
async fn jsonrpc_error_body_becomes_server_error() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/rpc")
        .match_body(Matcher::PartialJson(json!({"method": "initialize"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(init_result_body())
        .create_async()
        .await;
    server
        .mock("POST", "/rpc")
        .match_body(Matcher::PartialJson(json!({"method": "notifications/initialized"})))
        .with_status(202)
        .create_async()
        .await;
    server
        .mock("POST", "/rpc")
        .match_body(Matcher::PartialJson(json!({"method": "tools/call"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "error": {"code": -32602, "message": "missing arguments"},
            })
            .to_string(),
        )
        .create_async()
        .await;

    let transport = transport(&server.url(), RetryPolicy::none());
    match transport.call_tool("echo", json!({})).await {
        Err(Error::Server { message, code }) => {
            assert_eq!(message, "missing arguments");
            assert_eq!(code, Some(-32602));
        },
        other => panic!("expected server error, got {other:?}"),
    }
}

/// Sequencing server: the first two tools/call POSTs get HTTP 503, the
/// third succeeds. Everything is `Connection: close`, one request per
/// connection.
async fn spawn_flaky_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let call_count = Arc::new(AtomicUsize::new(0));
    let counter = call_count.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let counter = counter.clone();
            tokio::spawn(async move {
                let Some(request) = read_http_request(&mut stream).await else {
                    return;
                };
                if request.body.contains("\"method\":\"initialize\"") {
                    write_response(
                        &mut stream,
                        "200 OK",
                        "application/json",
                        &init_result_body(),
                    )
                    .await;
                } else if request.body.contains("\"method\":\"notifications/initialized\"") {
                    write_empty_response(&mut stream, "202 Accepted").await;
                } else if request.body.contains("\"method\":\"tools/call\"") {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt <= 2 {
                        write_empty_response(&mut stream, "503 Service Unavailable").await;
                    } else {
                        write_response(
                            &mut stream,
                            "200 OK",
                            "application/json",
                            &json!({
                                "jsonrpc": "2.0",
                                "id": 4,
                                "result": {"ok": true},
                            })
                            .to_string(),
                        )
                        .await;
                    }
                } else {
                    write_empty_response(&mut stream, "404 Not Found").await;
                }
            });
        }
    });

    (format!("http://{addr}"), call_count)
}

#[tokio::test]
async fn retry_succeeds_after_two_5xx_failures() {
    let (base_url, call_count) = spawn_flaky_server().await;

    // Zero backoff keeps the test fast; the sleep schedule itself is
    // covered by the retry unit tests.
    let transport = transport(&base_url, RetryPolicy::new(3, 0));
    let result = transport.call_tool("echo", json!({})).await.unwrap();
    assert_eq!(result, json!({"ok": true}));
    assert_eq!(call_count.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retries_exhausted_reports_final_failure() {
    let (base_url, call_count) = spawn_flaky_server().await;

    let transport = transport(&base_url, RetryPolicy::new(1, 0));
    match transport.call_tool("echo", json!({})).await {
        Err(Error::Server { message, .. }) => assert_eq!(message, "Server error: HTTP 503"),
        other => panic!("expected server error, got {other:?}"),
    }
    assert_eq!(call_count.load(Ordering::SeqCst), 2);
}
