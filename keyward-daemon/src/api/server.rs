//! JSON-RPC server implementation with Unix socket support.

use super::handlers::{KeywardApiImpl, KeywardApiServer, internal_error};
use anyhow::{Context, Result};
use jsonrpsee::core::RpcResult;
use jsonrpsee::types::{ErrorCode, ErrorObject};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::handlers::ApiState;

/// Handle to a running RPC server
pub struct ServerHandle {
    shutdown: Arc<Mutex<Option<tokio::sync::mpsc::Sender<()>>>>,
    join_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

/// Start the JSON-RPC server on a Unix socket.
///
/// # Parameters
///
/// - `socket_path`: Path to the Unix socket file
/// - `state`: API state shared across handlers
///
/// # Returns
///
/// A handle to the running server that can be used to stop it.
pub async fn start_server(socket_path: &Path, state: ApiState) -> Result<ServerHandle> {
    // Remove existing socket if present
    if socket_path.exists() {
        warn!("Removing existing socket at {:?}", socket_path);
        std::fs::remove_file(socket_path)
            .with_context(|| format!("Failed to remove existing socket at {:?}", socket_path))?;
    }

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create socket directory {:?}", parent))?;
    }

    info!("Starting JSON-RPC server on {:?}", socket_path);

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind Unix socket at {:?}", socket_path))?;

    let server_api = Arc::new(KeywardApiImpl::new(state));

    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);

    let server_task: JoinHandle<()> = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = rx.recv() => {
                    debug!("Server shutdown signal received");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let api = server_api.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, api).await {
                                    warn!("Connection handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }
    });

    info!("JSON-RPC server started and listening");

    Ok(ServerHandle {
        shutdown: Arc::new(Mutex::new(Some(tx))),
        join_handle: Arc::new(Mutex::new(Some(server_task))),
    })
}

/// Handle a single connection: one JSON request per line, one response per
/// line.
async fn handle_connection(mut stream: UnixStream, api: Arc<KeywardApiImpl>) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;

        if n == 0 {
            break;
        }

        // Params may carry nonces and credentials; log the method only.
        let response = match serde_json::from_str::<Value>(&line) {
            Ok(request) => process_request(request, &api).await,
            Err(e) => {
                debug!("Unparseable request: {}", e);
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "error": {
                        "code": ErrorCode::ParseError.code(),
                        "message": format!("Parse error: {}", e)
                    },
                    "id": null
                })
            }
        };

        writer.write_all(response.to_string().as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    Ok(())
}

/// Process a JSON-RPC request.
pub async fn process_request(request: Value, api: &KeywardApiImpl) -> Value {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = request.get("method").and_then(|m| m.as_str()) else {
        return serde_json::json!({
            "jsonrpc": "2.0",
            "error": {
                "code": ErrorCode::InvalidRequest.code(),
                "message": "Invalid Request: missing method"
            },
            "id": id
        });
    };
    debug!("Received request: {}", method);

    let params = request.get("params").cloned().unwrap_or(Value::Array(vec![]));
    let result = call(method, params, api).await;

    match result {
        Ok(value) => serde_json::json!({
            "jsonrpc": "2.0",
            "result": value,
            "id": id
        }),
        Err(error) => {
            let mut body = serde_json::json!({
                "code": error.code(),
                "message": error.message()
            });
            if let Some(data) = error.data() {
                if let Ok(data) = serde_json::from_str::<Value>(data.get()) {
                    body["data"] = data;
                }
            }
            serde_json::json!({
                "jsonrpc": "2.0",
                "error": body,
                "id": id
            })
        }
    }
}

async fn call(method: &str, params: Value, api: &KeywardApiImpl) -> RpcResult<Value> {
    match method {
        "list_services" => respond(api.list_services().await),
        "request_url" => {
            let (service, owner) = positional(params, 2)?;
            respond(api.request_url(service, owner).await)
        }
        "create_nonce" => {
            let (action, owner) = positional(params, 2)?;
            respond(api.create_nonce(action, owner).await)
        }
        "dispatch" => {
            let (action, service, owner, params): (
                String,
                String,
                Option<String>,
                Option<BTreeMap<String, String>>,
            ) = positional(params, 4)?;
            respond(
                api.dispatch(action, service, owner, params.unwrap_or_default())
                    .await,
            )
        }
        "list_connections" => {
            let (service, owner) = positional(params, 2)?;
            respond(api.list_connections(service, owner).await)
        }
        "prune" => {
            let (max_age_secs,) = positional(params, 1)?;
            respond(api.prune(max_age_secs).await)
        }
        "test_connection" => {
            let (id,) = positional(params, 1)?;
            respond(api.test_connection(id).await)
        }
        _ => Err(ErrorObject::owned(
            ErrorCode::MethodNotFound.code(),
            "Method not found",
            None::<()>,
        )),
    }
}

/// Decode `arity` positional params into a tuple. Missing trailing params
/// are `null`, so they may only fill `Option` slots.
fn positional<T: DeserializeOwned>(params: Value, arity: usize) -> RpcResult<T> {
    let mut values = match params {
        Value::Array(values) => values,
        Value::Null => Vec::new(),
        _ => return Err(invalid_params("params must be an array")),
    };

    if values.len() > arity {
        return Err(invalid_params("too many params"));
    }
    values.resize(arity, Value::Null);

    serde_json::from_value(Value::Array(values)).map_err(|e| invalid_params(&e.to_string()))
}

fn respond<T: Serialize>(result: RpcResult<T>) -> RpcResult<Value> {
    result.and_then(|value| serde_json::to_value(value).map_err(internal_error))
}

fn invalid_params(message: &str) -> ErrorObject<'static> {
    ErrorObject::owned(
        ErrorCode::InvalidParams.code(),
        format!("Invalid params: {}", message),
        None::<()>,
    )
}

impl ServerHandle {
    /// Stop the server
    pub async fn stop(&self) -> Result<()> {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(()).await;
        }

        if let Some(handle) = self.join_handle.lock().await.take() {
            // If the task panicked, surface the error
            handle.await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_fills_missing_options() {
        let (service, owner): (String, Option<String>) =
            positional(serde_json::json!(["twitter"]), 2).unwrap();
        assert_eq!(service, "twitter");
        assert_eq!(owner, None);
    }

    #[test]
    fn test_positional_rejects_missing_required() {
        let err = positional::<(String,)>(serde_json::json!([]), 1).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParams.code());
    }

    #[test]
    fn test_positional_rejects_extra() {
        let err = positional::<(String,)>(serde_json::json!(["a", "b"]), 1).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParams.code());
    }
}
