//! Service contract.
//!
//! A [`Service`] is one remote integration: immutable configuration plus an
//! engine (OAuth1, OAuth2 or HTTP Basic). Services are shared through `Arc`;
//! everything that changes per call lives in a [`Session`] (the bound token)
//! or a [`FlowContext`] (the collaborators a flow step talks to).
//!
//! # Handshake
//!
//! ```text
//! request_token(input) -> FlowStep::Redirect | FlowStep::Form
//! verify_token(input)  -> FlowStep::Verified { token, redirect }
//! ```
//!
//! # Resource calls
//!
//! ```rust,ignore
//! let mut session = orchestrator.connection(&id).await?;
//! let profile = session.request(ResourceRequest::get(url)).await?;
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::KeywardError;
use crate::http::{HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, RequestError};
use crate::model::{
    Action, OwnerId, ServiceId, TokenId, TokenKind, request_nonce_action, verify_nonce_action,
};
use crate::nonce::NonceGuard;
use crate::store::{Secret, SecretStore, StoreError, TokenSelector, TokenStore};
use crate::token::{FOR, Token, TokenMeta};

/// Well-known endpoint purposes.
pub mod endpoints {
    pub const AUTHORIZE: &str = "authorize";
    pub const REQUEST_TOKEN: &str = "request_token";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const REFRESH: &str = "refresh";
    pub const VERIFY: &str = "verify";
    pub const TEST: &str = "test";
}

/// A remote URL and the method used to call it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
}

impl Endpoint {
    /// A GET endpoint.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
        }
    }

    /// A POST endpoint.
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Post,
        }
    }
}

/// Protocol engine a service runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flow {
    #[serde(rename = "oauth1")]
    OAuth1,
    #[serde(rename = "oauth2")]
    OAuth2,
    Basic,
}

impl Flow {
    /// Name as written in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OAuth1 => "oauth1",
            Self::OAuth2 => "oauth2",
            Self::Basic => "basic",
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the bound token is attached to resource calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthStyle {
    /// `Authorization: <scheme> <token>`; OAuth1 builds its `OAuth` header.
    Header {
        #[serde(default = "default_scheme")]
        scheme: String,
    },

    /// Token (or OAuth1 parameters) in the query string or form body.
    Query {
        #[serde(default = "default_query_param")]
        param: String,
    },

    /// `Authorization: Basic <credential>`.
    Basic,
}

impl Default for AuthStyle {
    fn default() -> Self {
        Self::Header {
            scheme: default_scheme(),
        }
    }
}

fn default_scheme() -> String {
    "Bearer".to_string()
}

fn default_query_param() -> String {
    "access_token".to_string()
}

fn default_true() -> bool {
    true
}

fn default_scope_separator() -> String {
    " ".to_string()
}

fn default_refresh_grace() -> i64 {
    20
}

/// Static configuration of a service.
///
/// Deserialisable from a `[[services]]` TOML table:
///
/// ```toml
/// [[services]]
/// name = "google"
/// label = "Google"
/// flow = "oauth2"
/// scopes = ["openid", "email"]
/// authorize_params = { access_type = "offline", prompt = "consent" }
///
/// [services.endpoints.authorize]
/// url = "https://accounts.google.com/o/oauth2/v2/auth"
///
/// [services.endpoints.access_token]
/// url = "https://oauth2.googleapis.com/token"
/// method = "POST"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Stable identifier; also the name stored on every token.
    pub name: ServiceId,

    /// Human-readable name.
    #[serde(default)]
    pub label: String,

    /// Protocol engine.
    pub flow: Flow,

    /// Consumer key / client id.
    #[serde(default, skip_serializing)]
    pub key: Option<Secret>,

    /// Consumer secret / client secret.
    #[serde(default, skip_serializing)]
    pub secret: Option<Secret>,

    /// Provider-side application id, where one exists besides the key.
    #[serde(default)]
    pub app_id: Option<String>,

    /// Endpoints keyed by purpose.
    #[serde(default)]
    pub endpoints: BTreeMap<String, Endpoint>,

    /// How tokens are attached to resource calls.
    #[serde(default)]
    pub auth_style: AuthStyle,

    /// Whether resource calls need a bound token.
    #[serde(default = "default_true")]
    pub requires_token: bool,

    /// OAuth2 scopes requested at authorization.
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Separator joining scopes.
    #[serde(default = "default_scope_separator")]
    pub scope_separator: String,

    /// Extra query parameters for the authorize redirect.
    #[serde(default)]
    pub authorize_params: BTreeMap<String, String>,

    /// OAuth1 `realm` for the Authorization header.
    #[serde(default)]
    pub realm: Option<String>,

    /// Refresh tokens this many seconds before they expire.
    #[serde(default = "default_refresh_grace")]
    pub refresh_grace_secs: i64,
}

impl ServiceConfig {
    /// Create a configuration with defaults for everything but name and flow.
    pub fn new(name: impl Into<ServiceId>, flow: Flow) -> Self {
        Self {
            name: name.into(),
            label: String::new(),
            flow,
            key: None,
            secret: None,
            app_id: None,
            endpoints: BTreeMap::new(),
            auth_style: match flow {
                Flow::Basic => AuthStyle::Basic,
                _ => AuthStyle::default(),
            },
            requires_token: true,
            scopes: Vec::new(),
            scope_separator: default_scope_separator(),
            authorize_params: BTreeMap::new(),
            realm: None,
            refresh_grace_secs: default_refresh_grace(),
        }
    }

    /// Set the label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the application credentials.
    pub fn with_credentials(mut self, key: impl Into<String>, secret: impl Into<String>) -> Self {
        self.key = Some(Secret::new(key));
        self.secret = Some(Secret::new(secret));
        self
    }

    /// Add or replace an endpoint.
    pub fn with_endpoint(mut self, purpose: impl Into<String>, endpoint: Endpoint) -> Self {
        self.endpoints.insert(purpose.into(), endpoint);
        self
    }

    /// Set the auth style.
    pub fn with_auth_style(mut self, style: AuthStyle) -> Self {
        self.auth_style = style;
        self
    }

    /// Set the requested scopes.
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Add an extra authorize parameter.
    pub fn with_authorize_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.authorize_params.insert(key.into(), value.into());
        self
    }

    /// Set the OAuth1 realm.
    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    /// Set whether resource calls need a token.
    pub fn requires_token(mut self, requires: bool) -> Self {
        self.requires_token = requires;
        self
    }

    /// Look up an endpoint by purpose.
    pub fn endpoint(&self, purpose: &str) -> Option<&Endpoint> {
        self.endpoints.get(purpose)
    }

    /// Look up an endpoint that the engine cannot work without.
    pub fn required_endpoint(&self, purpose: &str) -> Result<&Endpoint, KeywardError> {
        self.endpoint(purpose).ok_or_else(|| KeywardError::Config {
            message: format!("{} has no {} endpoint", self.name, purpose),
        })
    }

    /// Label, falling back to the name.
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            self.name.as_str()
        } else {
            &self.label
        }
    }

    /// Consumer key as a plain string (empty when unset).
    pub fn key_str(&self) -> &str {
        self.key.as_ref().map(Secret::expose).unwrap_or_default()
    }

    /// Consumer secret as a plain string (empty when unset).
    pub fn secret_str(&self) -> &str {
        self.secret.as_ref().map(Secret::expose).unwrap_or_default()
    }

    /// Whether the application credentials the flow needs are present.
    ///
    /// HTTP Basic services need none.
    pub fn is_configured(&self) -> bool {
        match self.flow {
            Flow::Basic => true,
            Flow::OAuth1 | Flow::OAuth2 => {
                self.key.as_ref().is_some_and(|k| !k.is_empty())
                    && self.secret.as_ref().is_some_and(|s| !s.is_empty())
            }
        }
    }

    /// Secret-store key for an application credential.
    pub fn credential_key(service: &ServiceId, part: &str) -> String {
        format!("keyward/app/{}/{}", service, part)
    }

    /// Fill missing application credentials from a secret store.
    pub async fn load_credentials(&mut self, secrets: &dyn SecretStore) -> Result<(), StoreError> {
        if self.key.is_none() {
            self.key = secrets
                .get(&Self::credential_key(&self.name, "key"))
                .await?;
        }
        if self.secret.is_none() {
            self.secret = secrets
                .get(&Self::credential_key(&self.name, "secret"))
                .await?;
        }
        Ok(())
    }
}

/// Key/value view of an access-token exchange response.
///
/// Providers answer with JSON or with a form-encoded body; both are
/// flattened into `fields`. `body` keeps the JSON document when there is one.
#[derive(Clone, Default)]
pub struct RawTokenResponse {
    pub fields: BTreeMap<String, String>,
    pub body: serde_json::Value,
}

impl RawTokenResponse {
    /// Get a non-empty field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

impl fmt::Debug for RawTokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTokenResponse")
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Parse a token-exchange body as JSON, falling back to form encoding.
pub fn parse_token_response(body: &str) -> RawTokenResponse {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(body) {
        let fields = map
            .iter()
            .filter_map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((k.clone(), value))
            })
            .collect();
        return RawTokenResponse {
            fields,
            body: serde_json::Value::Object(map),
        };
    }

    RawTokenResponse {
        fields: url::form_urlencoded::parse(body.trim().as_bytes())
            .into_owned()
            .collect(),
        body: serde_json::Value::Null,
    }
}

/// Protocol fields never copied into token metadata by default.
const PROTOCOL_FIELDS: &[&str] = &[
    "access_token",
    "refresh_token",
    "id_token",
    "expires_in",
    "token_type",
    "scope",
    "oauth_token",
    "oauth_token_secret",
    "oauth_callback_confirmed",
];

/// Copy the non-protocol fields of an exchange response into metadata.
pub fn default_token_meta(raw: &RawTokenResponse) -> TokenMeta {
    raw.fields
        .iter()
        .filter(|(k, _)| !PROTOCOL_FIELDS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Default display label: a handle from metadata, else the service label.
pub fn default_display(config: &ServiceConfig, token: &Token) -> String {
    if let Some(handle) = token.get_meta("screen_name").or_else(|| token.get_meta("username")) {
        return format!("@{}", handle);
    }
    token
        .get_meta("name")
        .or_else(|| token.get_meta("user_id"))
        .unwrap_or_else(|| config.display_label())
        .to_string()
}

/// Per-provider extension points.
///
/// Each hook runs at one well-defined step of an engine; the defaults pass
/// parameters through unchanged.
#[async_trait]
pub trait ServiceHooks: Send + Sync {
    /// Adjust the OAuth1 request-token parameters.
    fn request_token_params(
        &self,
        _config: &ServiceConfig,
        params: Vec<(String, String)>,
    ) -> Vec<(String, String)> {
        params
    }

    /// Adjust the authorize redirect parameters.
    fn authorize_params(
        &self,
        _config: &ServiceConfig,
        params: Vec<(String, String)>,
    ) -> Vec<(String, String)> {
        params
    }

    /// Adjust the access-token exchange parameters.
    fn access_token_params(
        &self,
        _config: &ServiceConfig,
        params: Vec<(String, String)>,
    ) -> Vec<(String, String)> {
        params
    }

    /// Build metadata for a new access token.
    ///
    /// `session` is bound to the new token, so profile lookups can go
    /// through it.
    async fn build_token_meta(
        &self,
        _session: &mut Session<'_>,
        raw: &RawTokenResponse,
    ) -> Result<TokenMeta, KeywardError> {
        Ok(default_token_meta(raw))
    }

    /// Human-readable label for a connection.
    fn display(&self, config: &ServiceConfig, token: &Token) -> String {
        default_display(config, token)
    }
}

/// Hooks that change nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl ServiceHooks for DefaultHooks {}

/// Parameters of one inbound call from the host.
///
/// Known parameter names: `nonce`, `kr_nonce`, `state`, `code`, `error`,
/// `oauth_token`, `oauth_verifier`, `for`, `username`, `password`, `id`.
#[derive(Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub action: Action,
    pub service: ServiceId,
    pub owner: Option<OwnerId>,
    pub params: BTreeMap<String, String>,
}

impl InboundRequest {
    /// Create a request without parameters.
    pub fn new(action: Action, service: impl Into<ServiceId>) -> Self {
        Self {
            action,
            service: service.into(),
            owner: None,
            params: BTreeMap::new(),
        }
    }

    /// Set the owner.
    pub fn with_owner(mut self, owner: impl Into<Option<OwnerId>>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Add a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Add every query parameter of a callback URL.
    pub fn with_query(mut self, url: &str) -> Self {
        if let Ok(url) = url::Url::parse(url) {
            self.params.extend(url.query_pairs().into_owned());
        }
        self
    }

    /// Get a non-empty parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

// Parameters carry codes, verifiers and passwords.
impl fmt::Debug for InboundRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundRequest")
            .field("action", &self.action)
            .field("service", &self.service)
            .field("owner", &self.owner)
            .field("params", &self.params.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// What the host should do after a flow step.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowStep {
    /// Send the user agent to `location`.
    Redirect { location: String },

    /// Show a credentials form that posts to `submit_to`.
    Form { submit_to: String },

    /// The handshake completed; `redirect` points at the host's `created`
    /// action for the new connection.
    Verified { token: Box<Token>, redirect: String },
}

/// Result of checking a bound token before a resource call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The token is still fresh, or cannot be refreshed.
    NotNeeded,

    /// The token was refreshed and persisted.
    Refreshed,

    /// Refreshing failed; the call proceeds with the stale token.
    Failed(String),
}

/// Builds URLs back into the host for each action.
#[derive(Debug, Clone)]
pub struct Callbacks {
    base: url::Url,
}

impl Callbacks {
    /// Create from the host's callback base URL.
    pub fn new(base: &str) -> Result<Self, KeywardError> {
        let base = url::Url::parse(base).map_err(|e| KeywardError::Config {
            message: format!("invalid callback URL {}: {}", base, e),
        })?;
        Ok(Self { base })
    }

    /// URL for an action on a service, with extra query parameters.
    pub fn url_for(&self, action: Action, service: &ServiceId, extras: &[(&str, &str)]) -> String {
        let mut url = self.base.clone();
        url.query_pairs_mut()
            .append_pair("action", action.as_str())
            .append_pair("service", service.as_str())
            .extend_pairs(extras);
        url.into()
    }
}

/// Notifications about connection lifecycle.
#[async_trait]
pub trait ConnectionEvents: Send + Sync {
    /// A handshake completed and its access token was stored.
    async fn connection_verified(&self, _token: &Token, _input: &InboundRequest) {}

    /// A connection was deleted.
    async fn connection_deleted(&self, _service: &ServiceId, _id: &TokenId, _owner: Option<&OwnerId>) {
    }
}

/// [`ConnectionEvents`] that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEvents;

#[async_trait]
impl ConnectionEvents for LogEvents {
    async fn connection_verified(&self, token: &Token, _input: &InboundRequest) {
        if let Some(id) = &token.unique_id {
            tracing::info!("Connected {} as {}", token.service, id);
        }
    }

    async fn connection_deleted(&self, service: &ServiceId, id: &TokenId, _owner: Option<&OwnerId>) {
        tracing::info!("Deleted {} connection {}", service, id);
    }
}

/// Collaborators available to a flow step.
#[derive(Clone, Copy)]
pub struct FlowContext<'a> {
    pub store: &'a dyn TokenStore,
    pub http: &'a dyn HttpClient,
    pub nonces: &'a dyn NonceGuard,
    pub callbacks: &'a Callbacks,
    pub events: &'a dyn ConnectionEvents,
}

impl<'a> FlowContext<'a> {
    /// Check the per-service `nonce` parameter against `action`.
    pub fn check_nonce(&self, input: &InboundRequest, action: &str) -> Result<(), KeywardError> {
        match input.param("nonce") {
            Some(nonce) if self.nonces.verify(nonce, action, input.owner.as_ref()) => Ok(()),
            _ => Err(KeywardError::InvalidNonce {
                action: action.to_string(),
            }),
        }
    }

    /// Check the request-step nonce for a service.
    pub fn check_request_nonce(&self, input: &InboundRequest) -> Result<(), KeywardError> {
        self.check_nonce(input, &request_nonce_action(&input.service))
    }

    /// Check the verify-step nonce for a service.
    pub fn check_verify_nonce(&self, input: &InboundRequest) -> Result<(), KeywardError> {
        self.check_nonce(input, &verify_nonce_action(&input.service))
    }

    /// Host URL for the verify action, carrying fresh nonces for both layers.
    pub fn verify_callback(&self, input: &InboundRequest, extras: &[(&str, &str)]) -> String {
        let owner = input.owner.as_ref();
        let nonce = self.nonces.create(&verify_nonce_action(&input.service), owner);
        let kr_nonce = self.nonces.create(&Action::Verify.nonce_action(), owner);

        let mut params: Vec<(&str, &str)> = extras.to_vec();
        params.push(("nonce", &nonce));
        params.push(("kr_nonce", &kr_nonce));
        self.callbacks.url_for(Action::Verify, &input.service, &params)
    }

    /// Create and persist a request token for a new handshake.
    pub async fn start_handshake(&self, input: &InboundRequest) -> Result<Token, KeywardError> {
        let mut token = Token::request(input.service.clone()).with_owner(input.owner.clone());
        if let Some(feature) = input.param("for") {
            token.meta.insert(FOR, feature);
        }
        let id = self.store.insert(&token).await?;
        tracing::debug!("Started {} handshake {}", input.service, id);
        token.unique_id = Some(id);
        Ok(token)
    }

    /// Load the request token named by `state` and delete it.
    ///
    /// Request tokens are single use: a second callback with the same state
    /// fails.
    pub async fn take_request_token(
        &self,
        input: &InboundRequest,
        state: &str,
    ) -> Result<Token, KeywardError> {
        let selector = TokenSelector::by_id(state)
            .kind(TokenKind::Request)
            .service(input.service.clone())
            .owner(input.owner.clone());

        let token = self.store.get_token(&selector).await?.ok_or_else(|| {
            KeywardError::authorization(&input.service, "unknown or already used state")
        })?;
        self.store.delete(&selector).await?;
        tracing::debug!("Consumed {} request token {}", input.service, state);
        Ok(token)
    }

    /// Persist a verified access token, notify listeners and point the host
    /// at its `created` action.
    pub async fn verified(
        &self,
        mut token: Token,
        input: &InboundRequest,
    ) -> Result<FlowStep, KeywardError> {
        let id = self.store.insert(&token).await?;
        token.unique_id = Some(id.clone());

        self.events.connection_verified(&token, input).await;

        let kr_nonce = self
            .nonces
            .create(&Action::Created.nonce_action(), input.owner.as_ref());
        let redirect = self.callbacks.url_for(
            Action::Created,
            &input.service,
            &[("id", id.as_str()), ("kr_nonce", &kr_nonce)],
        );

        Ok(FlowStep::Verified {
            token: Box::new(token),
            redirect,
        })
    }
}

/// A remote integration.
#[async_trait]
pub trait Service: Send + Sync {
    /// Static configuration.
    fn config(&self) -> &ServiceConfig;

    /// Endpoint purposes the engine cannot work without.
    fn required_endpoints(&self) -> &'static [&'static str];

    /// Stable name.
    fn name(&self) -> &ServiceId {
        &self.config().name
    }

    /// Human-readable label.
    fn label(&self) -> &str {
        self.config().display_label()
    }

    /// Whether the application credentials are present.
    fn is_configured(&self) -> bool {
        self.config().is_configured()
    }

    /// Whether resource calls need a bound token.
    fn requires_token(&self) -> bool {
        self.config().requires_token
    }

    /// Begin a handshake.
    async fn request_token(
        &self,
        ctx: FlowContext<'_>,
        input: &InboundRequest,
    ) -> Result<FlowStep, KeywardError>;

    /// Complete a handshake and persist the access token.
    async fn verify_token(
        &self,
        ctx: FlowContext<'_>,
        input: &InboundRequest,
    ) -> Result<FlowStep, KeywardError>;

    /// Attach credentials for `token` to an outgoing resource call.
    fn authorize_request(
        &self,
        token: Option<&Token>,
        request: HttpRequest,
    ) -> Result<HttpRequest, KeywardError>;

    /// Bring a bound token up to date before a resource call.
    async fn prepare_token(
        &self,
        _ctx: FlowContext<'_>,
        _token: &mut Token,
    ) -> Result<RefreshOutcome, KeywardError> {
        Ok(RefreshOutcome::NotNeeded)
    }

    /// Human-readable label for a connection.
    fn get_display(&self, token: &Token) -> String {
        default_display(self.config(), token)
    }

    /// Metadata for a new access token, from the exchange response.
    async fn build_token_meta(
        &self,
        _session: &mut Session<'_>,
        raw: &RawTokenResponse,
    ) -> Result<TokenMeta, KeywardError> {
        Ok(default_token_meta(raw))
    }
}

/// A resource call, before credentials are attached.
#[derive(Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub method: HttpMethod,
    pub url: String,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl ResourceRequest {
    /// Create a request.
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            params: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// A GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    /// A POST request.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    /// A PUT request.
    pub fn put(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, url)
    }

    /// A request to a configured endpoint.
    pub fn to_endpoint(endpoint: &Endpoint) -> Self {
        Self::new(endpoint.method, endpoint.url.clone())
    }

    /// Add a parameter: query string for GET/DELETE, form body otherwise.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Lower into an [`HttpRequest`].
    pub fn into_http(self) -> Result<HttpRequest, KeywardError> {
        let mut url = url::Url::parse(&self.url).map_err(|e| HttpError::InvalidRequest {
            message: format!("invalid URL: {}", e),
        })?;

        let mut request = if self.method.has_body() {
            let mut request = HttpRequest::new(self.method, url.as_str());
            if !self.params.is_empty() {
                request = request.with_form(self.params);
            }
            request
        } else {
            if !self.params.is_empty() {
                url.query_pairs_mut().extend_pairs(&self.params);
            }
            HttpRequest::new(self.method, url.as_str())
        };

        for (name, value) in self.headers {
            request.set_header(name, value);
        }
        Ok(request)
    }
}

impl fmt::Debug for ResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRequest")
            .field("method", &self.method)
            .field("url", &self.url.split('?').next().unwrap_or_default())
            .field("params", &self.params.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .finish()
    }
}

/// A successful resource response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON, or the raw body as a JSON string.
    pub body: serde_json::Value,
}

impl ApiResponse {
    fn from_response(response: HttpResponse) -> Self {
        let body = serde_json::from_str(&response.body)
            .unwrap_or(serde_json::Value::String(response.body));
        Self {
            status: response.status,
            headers: response.headers,
            body,
        }
    }
}

/// One service bound to at most one token for the duration of a call.
pub struct Session<'a> {
    service: &'a dyn Service,
    ctx: FlowContext<'a>,
    token: Option<Token>,
    last_status: Option<u16>,
}

impl<'a> Session<'a> {
    /// Create an unbound session.
    pub fn new(service: &'a dyn Service, ctx: FlowContext<'a>) -> Self {
        Self {
            service,
            ctx,
            token: None,
            last_status: None,
        }
    }

    /// Bind a token.
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    /// The service this session calls.
    pub fn service(&self) -> &'a dyn Service {
        self.service
    }

    /// The bound token.
    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    /// Unbind and return the token.
    pub fn into_token(self) -> Option<Token> {
        self.token
    }

    /// Status of the last response, if any call was made.
    pub fn last_status(&self) -> Option<u16> {
        self.last_status
    }

    /// Perform a resource call with the bound token.
    pub async fn request(&mut self, request: ResourceRequest) -> Result<ApiResponse, KeywardError> {
        if self.token.is_none() && self.service.requires_token() {
            return Err(KeywardError::MissingToken {
                service: self.service.name().to_string(),
            });
        }

        if let Some(token) = self.token.as_mut() {
            let outcome = self.service.prepare_token(self.ctx, token).await?;
            if let RefreshOutcome::Failed(reason) = outcome {
                tracing::warn!(
                    "Proceeding with stale {} token after refresh failure: {}",
                    self.service.name(),
                    reason
                );
            }
        }

        let http = request.into_http()?;
        let http = self.service.authorize_request(self.token.as_ref(), http)?;
        let response = self.ctx.http.send(http).await.map_err(RequestError::from)?;
        self.last_status = Some(response.status);

        if !response.is_success() {
            tracing::debug!("{} call failed with {}", self.service.name(), response.status);
            return Err(RequestError::from_response(response).into());
        }
        Ok(ApiResponse::from_response(response))
    }

    /// Call the service's `test` endpoint.
    pub async fn test_connection(&mut self) -> Result<(), KeywardError> {
        let endpoint = self.service.config().required_endpoint(endpoints::TEST)?;
        self.request(ResourceRequest::to_endpoint(endpoint)).await?;
        Ok(())
    }
}

impl fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("service", self.service.name())
            .field("token", &self.token.as_ref().and_then(|t| t.unique_id.as_ref()))
            .finish()
    }
}
