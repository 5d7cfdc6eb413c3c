//! Shared fixtures for the daemon socket tests.

#![allow(dead_code)]

use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{Duration, sleep};

use keyward_core::{
    Callbacks, HmacNonces, HttpClientConfig, MemoryTokenStore, Orchestrator, ReqwestClient,
    ServiceConfig, ServiceRegistry,
};
use keyward_daemon::api::{ApiState, ServerHandle, start_server};

pub const CALLBACK: &str = "https://app.example.com/keyring";

/// API state over a memory store with the given services registered.
pub fn state(configs: Vec<ServiceConfig>) -> ApiState {
    let mut registry = ServiceRegistry::new();
    for config in configs {
        registry.register_config(config).unwrap();
    }
    let orchestrator = Orchestrator::new(
        registry,
        Arc::new(MemoryTokenStore::new()),
        Arc::new(ReqwestClient::new(&HttpClientConfig::default()).unwrap()),
        Arc::new(HmacNonces::new(b"daemon-test-key").unwrap()),
        Callbacks::new(CALLBACK).unwrap(),
    );
    ApiState::from_orchestrator(orchestrator)
}

/// Start a server in a fresh temp directory.
/// Returns the temp directory (which must be kept alive), socket path, and server handle.
pub async fn setup_test_server(configs: Vec<ServiceConfig>) -> (TempDir, PathBuf, ServerHandle) {
    let temp_dir = TempDir::new().unwrap();
    let socket_path = temp_dir.path().join("test.sock");

    let handle = start_server(&socket_path, state(configs)).await.unwrap();

    // Give the server time to start accepting connections
    sleep(Duration::from_millis(100)).await;

    (temp_dir, socket_path, handle)
}

/// Detect whether the sandbox allows binding Unix sockets. Skip tests if not.
pub fn can_bind_unix_socket() -> bool {
    let dir = match TempDir::new() {
        Ok(dir) => dir,
        Err(_) => return false,
    };
    let path = dir.path().join("permission-check.sock");
    let ok = std::os::unix::net::UnixListener::bind(&path).is_ok();
    let _ = fs::remove_file(&path);
    ok
}

/// Send one raw line over a fresh connection and read the response line.
pub async fn send_raw_request(
    socket_path: &Path,
    request: &str,
) -> Result<Value, Box<dyn std::error::Error>> {
    let mut stream = UnixStream::connect(socket_path).await?;
    stream.write_all(request.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;

    let (reader, _writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut response_str = String::new();
    reader.read_line(&mut response_str).await?;

    Ok(serde_json::from_str(&response_str)?)
}

/// Call `method` and decode its result; an RPC error becomes `Err` carrying
/// the error object.
pub async fn call<T: for<'de> Deserialize<'de>>(
    socket_path: &Path,
    method: &str,
    params: Value,
) -> Result<T, Value> {
    let request = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1,
    });
    let response = send_raw_request(socket_path, &request.to_string())
        .await
        .expect("socket round trip failed");

    if let Some(error) = response.get("error") {
        return Err(error.clone());
    }
    Ok(serde_json::from_value(response["result"].clone()).expect("unexpected result shape"))
}

/// Query parameters of a URL.
pub fn query(url: &str) -> BTreeMap<String, String> {
    url::Url::parse(url)
        .unwrap()
        .query_pairs()
        .into_owned()
        .collect()
}
