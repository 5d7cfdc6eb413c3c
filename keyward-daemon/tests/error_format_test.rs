//! Test to verify JSON-RPC 2.0 error response format compliance.
//!
//! Error responses must:
//! - carry `"jsonrpc": "2.0"`
//! - carry an `error` object with an integer `code` and a string `message`
//! - echo the `id` from the request

mod common;

use serde_json::{Value, json};

use keyward_core::presets;

use common::{can_bind_unix_socket, send_raw_request, setup_test_server};

fn assert_error(response: &Value, id: Value, code: i64) {
    assert_eq!(response.get("jsonrpc"), Some(&json!("2.0")), "Must have 'jsonrpc': '2.0' field");
    assert_eq!(response.get("id"), Some(&id), "Must echo the request id");
    assert!(response.get("result").is_none(), "Errors carry no result");

    let error = response.get("error").expect("Must have 'error' field");
    assert!(error.get("message").and_then(Value::as_str).is_some(), "Error must have a message");
    assert_eq!(error.get("code").and_then(Value::as_i64), Some(code));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_jsonrpc_error_format_compliance() {
    if !can_bind_unix_socket() {
        eprintln!("Skipping test_jsonrpc_error_format_compliance: Unix sockets not permitted");
        return;
    }

    let (_temp_dir, socket_path, handle) = setup_test_server(vec![presets::pinboard()]).await;

    // Parse error (invalid JSON)
    let response = send_raw_request(&socket_path, "{invalid json}")
        .await
        .expect("Failed to get response");
    assert_error(&response, Value::Null, -32700);

    // Invalid request (missing method)
    let request = json!({ "jsonrpc": "2.0", "params": [], "id": 42 });
    let response = send_raw_request(&socket_path, &request.to_string())
        .await
        .expect("Failed to get response");
    assert_error(&response, json!(42), -32600);

    // Method not found
    let request = json!({ "jsonrpc": "2.0", "method": "get_token", "params": [], "id": 100 });
    let response = send_raw_request(&socket_path, &request.to_string())
        .await
        .expect("Failed to get response");
    assert_error(&response, json!(100), -32601);

    // Invalid params: a required param is missing
    let request = json!({ "jsonrpc": "2.0", "method": "test_connection", "params": [], "id": 200 });
    let response = send_raw_request(&socket_path, &request.to_string())
        .await
        .expect("Failed to get response");
    assert_error(&response, json!(200), -32602);

    // Invalid params: params is not an array
    let request = json!({ "jsonrpc": "2.0", "method": "prune", "params": { "max_age_secs": 5 }, "id": "p" });
    let response = send_raw_request(&socket_path, &request.to_string())
        .await
        .expect("Failed to get response");
    assert_error(&response, json!("p"), -32602);

    // Application error carries its kind
    let request = json!({ "jsonrpc": "2.0", "method": "list_connections", "params": ["nowhere"], "id": 300 });
    let response = send_raw_request(&socket_path, &request.to_string())
        .await
        .expect("Failed to get response");
    assert_error(&response, json!(300), -32602);
    assert_eq!(response["error"]["data"]["kind"], "unknown_service");

    handle.stop().await.expect("Failed to stop server");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_success_format() {
    if !can_bind_unix_socket() {
        eprintln!("Skipping test_success_format: Unix sockets not permitted");
        return;
    }

    let (_temp_dir, socket_path, handle) = setup_test_server(vec![presets::pinboard()]).await;

    let request = json!({ "jsonrpc": "2.0", "method": "create_nonce", "params": ["keyring-manage"], "id": 7 });
    let response = send_raw_request(&socket_path, &request.to_string())
        .await
        .expect("Failed to get response");

    assert_eq!(response["jsonrpc"], "2.0");
    assert_eq!(response["id"], 7);
    assert!(response.get("error").is_none());
    assert!(!response["result"]["nonce"].as_str().unwrap_or_default().is_empty());

    handle.stop().await.expect("Failed to stop server");
}
