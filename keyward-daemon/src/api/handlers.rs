//! JSON-RPC API handlers for the daemon.

use super::types::{
    ConnectionInfo, DispatchResponse, ListConnectionsResponse, ListServicesResponse,
    NonceResponse, PruneResponse, RequestUrlResponse, ServiceInfo, TestConnectionResponse,
};
use crate::config::DaemonConfig;
use anyhow::{Context, Result};
use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::{ErrorCode, ErrorObject};
use keyward_core::{
    Callbacks, FileTokenStore, HmacNonces, KeywardError, Orchestrator, OwnerId, ReqwestClient,
    Secret, SecretStore, ServiceConfig, ServiceId, ServiceRegistry, create_secret_store, presets,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Secret-store key of the nonce signing key.
pub const NONCE_KEY: &str = "keyward/nonce_key";

/// Error code for a provider refusing a handshake step.
pub const AUTHORIZATION_FAILED_CODE: i32 = -32001;

/// Error code for a service missing its application credentials.
pub const NOT_CONFIGURED_CODE: i32 = -32002;

/// Error code for a failed resource call.
pub const REQUEST_FAILED_CODE: i32 = -32003;

/// State shared across RPC handlers.
pub struct ApiState {
    /// Orchestrator every call goes through
    pub orchestrator: Arc<Orchestrator>,
    /// Age after which an unfinished handshake is pruned
    pub request_token_ttl: chrono::Duration,
}

impl ApiState {
    /// Build the orchestrator described by `config`.
    pub async fn new(config: &DaemonConfig) -> Result<Self> {
        let secrets: Arc<dyn SecretStore> = Arc::from(create_secret_store(config.prefer_keyring));

        let mut registry = ServiceRegistry::new();
        let mut configs = config.services.clone();
        if config.presets {
            configs.extend(presets::all());
        }
        for mut service in configs {
            service
                .load_credentials(secrets.as_ref())
                .await
                .with_context(|| format!("Failed to load credentials for {}", service.name))?;
            register(&mut registry, service)?;
        }
        info!("Registered {} services", registry.len());

        let nonce_key = nonce_key(secrets.as_ref()).await?;
        let nonces = HmacNonces::new(nonce_key.expose().as_bytes())?;

        if !secrets.is_persistent() {
            warn!(
                "Secret storage does not persist across restarts; stored connections \
                 will be dropped when the daemon stops"
            );
        }

        let tokens_path = config.tokens_path();
        let store = FileTokenStore::load_from_path(&tokens_path, secrets)
            .await
            .with_context(|| format!("Failed to open token store at {:?}", tokens_path))?;

        let http = ReqwestClient::new(&config.http)?;
        let callbacks = Callbacks::new(&config.callback_url)?;

        let orchestrator = Orchestrator::new(
            registry,
            Arc::new(store),
            Arc::new(http),
            Arc::new(nonces),
            callbacks,
        );

        Ok(Self::from_orchestrator(orchestrator)
            .with_request_token_ttl(config.request_token_ttl_secs))
    }

    /// Wrap an existing orchestrator (useful for tests).
    pub fn from_orchestrator(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            request_token_ttl: chrono::Duration::hours(1),
        }
    }

    /// Set the age after which unfinished handshakes are pruned.
    pub fn with_request_token_ttl(mut self, secs: u64) -> Self {
        self.request_token_ttl = chrono::Duration::seconds(secs.min(i64::MAX as u64) as i64);
        self
    }
}

fn register(registry: &mut ServiceRegistry, service: ServiceConfig) -> Result<()> {
    let name = service.name.clone();
    if !registry.register_config(service)? {
        debug!("Service {} already registered, keeping the first definition", name);
    }
    Ok(())
}

/// Read the nonce signing key, creating one on first start.
async fn nonce_key(secrets: &dyn SecretStore) -> Result<Secret> {
    if let Some(key) = secrets.get(NONCE_KEY).await? {
        return Ok(key);
    }
    info!("Generating nonce signing key");
    let key = HmacNonces::generate_key();
    secrets
        .set(NONCE_KEY, &key)
        .await
        .context("Failed to persist nonce signing key")?;
    Ok(key)
}

/// JSON-RPC API trait definition.
#[rpc(server)]
pub trait KeywardApi {
    /// List every registered service.
    #[method(name = "list_services")]
    async fn list_services(&self) -> RpcResult<ListServicesResponse>;

    /// Build the URL that starts a handshake with `service`.
    ///
    /// # Parameters
    ///
    /// - `service`: Service identifier (e.g., "twitter")
    /// - `owner`: Host user the connection will belong to
    #[method(name = "request_url")]
    async fn request_url(
        &self,
        service: String,
        owner: Option<String>,
    ) -> RpcResult<RequestUrlResponse>;

    /// Mint a nonce for an action such as `keyring-delete`.
    #[method(name = "create_nonce")]
    async fn create_nonce(&self, action: String, owner: Option<String>) -> RpcResult<NonceResponse>;

    /// Run one inbound action.
    ///
    /// # Parameters
    ///
    /// - `action`: One of `request`, `verify`, `created`, `delete`, `manage`
    /// - `service`: Service identifier
    /// - `owner`: Host user performing the action
    /// - `params`: Query and form parameters the host received
    ///
    /// # Returns
    ///
    /// The outcome, or the errors that stopped the action.
    #[method(name = "dispatch")]
    async fn dispatch(
        &self,
        action: String,
        service: String,
        owner: Option<String>,
        params: BTreeMap<String, String>,
    ) -> RpcResult<DispatchResponse>;

    /// List the connections of a service.
    #[method(name = "list_connections")]
    async fn list_connections(
        &self,
        service: String,
        owner: Option<String>,
    ) -> RpcResult<ListConnectionsResponse>;

    /// Delete unfinished handshakes older than `max_age_secs`, or the
    /// configured age when omitted.
    #[method(name = "prune")]
    async fn prune(&self, max_age_secs: Option<u64>) -> RpcResult<PruneResponse>;

    /// Probe a stored connection against its service's test endpoint.
    #[method(name = "test_connection")]
    async fn test_connection(&self, id: String) -> RpcResult<TestConnectionResponse>;
}

/// Implementation of the Keyward API.
pub struct KeywardApiImpl {
    state: ApiState,
}

impl KeywardApiImpl {
    /// Create a new API implementation with the given state.
    pub fn new(state: ApiState) -> Self {
        Self { state }
    }

    /// The state the handlers run against.
    pub fn state(&self) -> &ApiState {
        &self.state
    }
}

#[async_trait::async_trait]
impl KeywardApiServer for KeywardApiImpl {
    async fn list_services(&self) -> RpcResult<ListServicesResponse> {
        debug!("RPC: list_services");

        let services = self
            .state
            .orchestrator
            .registry()
            .list()
            .iter()
            .map(|s| ServiceInfo::from_service(s.as_ref()))
            .collect();

        Ok(ListServicesResponse { services })
    }

    async fn request_url(
        &self,
        service: String,
        owner: Option<String>,
    ) -> RpcResult<RequestUrlResponse> {
        info!("RPC: request_url({})", service);

        let service_id = ServiceId::new(&service);
        if !self.state.orchestrator.registry().contains(service_id.clone()) {
            return Err(rpc_error(&KeywardError::UnknownService { service }));
        }

        let owner = owner.map(OwnerId::new);
        Ok(RequestUrlResponse {
            url: self
                .state
                .orchestrator
                .request_url(&service_id, owner.as_ref()),
        })
    }

    async fn create_nonce(&self, action: String, owner: Option<String>) -> RpcResult<NonceResponse> {
        debug!("RPC: create_nonce({})", action);

        if action.is_empty() {
            return Err(ErrorObject::owned(
                ErrorCode::InvalidParams.code(),
                "Action must not be empty",
                None::<()>,
            ));
        }

        let owner = owner.map(OwnerId::new);
        Ok(NonceResponse {
            nonce: self.state.orchestrator.create_nonce(&action, owner.as_ref()),
        })
    }

    async fn dispatch(
        &self,
        action: String,
        service: String,
        owner: Option<String>,
        params: BTreeMap<String, String>,
    ) -> RpcResult<DispatchResponse> {
        info!("RPC: dispatch({} {})", action, service);

        let dispatch = self
            .state
            .orchestrator
            .dispatch_named(&action, service, owner.map(OwnerId::new), params)
            .await;

        Ok(dispatch.into())
    }

    async fn list_connections(
        &self,
        service: String,
        owner: Option<String>,
    ) -> RpcResult<ListConnectionsResponse> {
        debug!("RPC: list_connections({})", service);

        let owner = owner.map(OwnerId::new);
        let connections = self
            .state
            .orchestrator
            .connections(&ServiceId::new(&service), owner.as_ref())
            .await
            .map_err(|e| rpc_error(&e))?;

        Ok(ListConnectionsResponse {
            connections: connections.into_iter().map(ConnectionInfo::from).collect(),
        })
    }

    async fn prune(&self, max_age_secs: Option<u64>) -> RpcResult<PruneResponse> {
        let max_age = max_age_secs
            .map(|secs| chrono::Duration::seconds(secs.min(i64::MAX as u64) as i64))
            .unwrap_or(self.state.request_token_ttl);
        debug!("RPC: prune(older than {}s)", max_age.num_seconds());

        let pruned = self
            .state
            .orchestrator
            .prune_request_tokens(max_age)
            .await
            .map_err(|e| rpc_error(&e))?;

        Ok(PruneResponse { pruned })
    }

    async fn test_connection(&self, id: String) -> RpcResult<TestConnectionResponse> {
        info!("RPC: test_connection({})", id);

        let mut session = self
            .state
            .orchestrator
            .connection(id.as_str())
            .await
            .map_err(|e| rpc_error(&e))?;

        let result = session.test_connection().await;
        match result {
            Ok(()) => Ok(TestConnectionResponse {
                message: format!("Connection {} to {} is working", id, session.service().label()),
            }),
            Err(e) => {
                warn!("Connection {} failed its test: {}", id, e);
                Err(rpc_error(&e))
            }
        }
    }
}

/// Map a core error to a JSON-RPC error object carrying its kind.
pub fn rpc_error(err: &KeywardError) -> ErrorObject<'static> {
    let code = match err {
        KeywardError::InvalidNonce { .. }
        | KeywardError::UnknownService { .. }
        | KeywardError::UnsupportedAction { .. }
        | KeywardError::MissingToken { .. } => ErrorCode::InvalidParams.code(),
        KeywardError::Storage(keyward_core::StoreError::NotFound { .. }) => {
            ErrorCode::InvalidParams.code()
        }
        KeywardError::AuthorizationFailed { .. } => AUTHORIZATION_FAILED_CODE,
        KeywardError::NotConfigured { .. } => NOT_CONFIGURED_CODE,
        KeywardError::Request(_) => REQUEST_FAILED_CODE,
        _ => ErrorCode::InternalError.code(),
    };

    ErrorObject::owned(
        code,
        err.to_string(),
        Some(serde_json::json!({ "kind": err.kind() })),
    )
}

/// Wrap any displayable error as an internal error.
pub fn internal_error<E: std::fmt::Display>(err: E) -> ErrorObject<'static> {
    ErrorObject::owned(
        ErrorCode::InternalError.code(),
        format!("{}", err),
        None::<()>,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_core::{HttpError, StoreError};

    #[test]
    fn test_rpc_error_codes() {
        let err = rpc_error(&KeywardError::InvalidNonce {
            action: "keyring-delete".to_string(),
        });
        assert_eq!(err.code(), ErrorCode::InvalidParams.code());
        assert_eq!(err.message(), "invalid nonce for keyring-delete");

        let err = rpc_error(&KeywardError::NotConfigured {
            service: "twitter".to_string(),
        });
        assert_eq!(err.code(), NOT_CONFIGURED_CODE);

        let err = rpc_error(&KeywardError::from(HttpError::Timeout));
        assert_eq!(err.code(), REQUEST_FAILED_CODE);

        let err = rpc_error(&KeywardError::from(StoreError::NotFound {
            key: "7".to_string(),
        }));
        assert_eq!(err.code(), ErrorCode::InvalidParams.code());

        let err = rpc_error(&KeywardError::from(StoreError::UnscopedDelete));
        assert_eq!(err.code(), ErrorCode::InternalError.code());
    }

    #[test]
    fn test_rpc_error_carries_kind() {
        let err = rpc_error(&KeywardError::UnknownService {
            service: "nowhere".to_string(),
        });
        let data: serde_json::Value =
            serde_json::from_str(err.data().map(|d| d.get()).unwrap_or("null")).unwrap();
        assert_eq!(data["kind"], "unknown_service");
    }

    #[tokio::test]
    async fn test_nonce_key_is_generated_once() {
        let secrets = keyward_core::MemorySecretStore::new();
        let first = nonce_key(&secrets).await.unwrap();
        let second = nonce_key(&secrets).await.unwrap();
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }
}
