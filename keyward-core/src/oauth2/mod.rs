//! OAuth 2.0 authorization-code engine with refresh.
//!
//! ```text
//! Unauthenticated -> PendingAuthorization -> CodeReceived -> AccessTokenObtained
//!                                                         \-> Failed
//! ```
//!
//! The request token's storage id is the `state` parameter. The exact
//! `redirect_uri` sent to the provider is kept in the request token's hidden
//! metadata so the code exchange can repeat it byte for byte.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use ::oauth2::basic::BasicClient;
use ::oauth2::{AuthUrl, ClientId, ClientSecret, CsrfToken, RedirectUrl, Scope, TokenUrl};
use std::sync::Arc;
use url::Url;

use crate::error::KeywardError;
use crate::http::{HttpError, HttpMethod, HttpRequest, HttpResponse, RequestBody};
use crate::model::Action;
use crate::service::{
    AuthStyle, DefaultHooks, Endpoint, FlowContext, FlowStep, InboundRequest, RawTokenResponse,
    RefreshOutcome, Service, ServiceConfig, ServiceHooks, Session, endpoints,
    parse_token_response,
};
use crate::store::TokenSelector;
use crate::token::{Credential, EXPIRES, FOR, REFRESH_TOKEN, Token, TokenMeta};

/// Hidden metadata key holding the `redirect_uri` of a pending handshake.
pub const REDIRECT_URI: &str = "_redirect_uri";

const REQUIRED_ENDPOINTS: &[&str] = &[endpoints::AUTHORIZE, endpoints::ACCESS_TOKEN];

/// A service speaking OAuth 2.0.
pub struct OAuth2Service {
    config: ServiceConfig,
    hooks: Arc<dyn ServiceHooks>,
}

impl OAuth2Service {
    /// Create a service with default hooks.
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a service with provider-specific hooks.
    pub fn with_hooks(config: ServiceConfig, hooks: Arc<dyn ServiceHooks>) -> Self {
        Self { config, hooks }
    }

    /// Build an `oauth2` client for the authorize redirect.
    fn client(&self, redirect_uri: &str) -> Result<BasicClient, KeywardError> {
        let authorize = self.config.required_endpoint(endpoints::AUTHORIZE)?;
        let auth_url = AuthUrl::new(authorize.url.clone()).map_err(|e| KeywardError::Config {
            message: format!("invalid auth URL for {}: {}", self.config.name, e),
        })?;
        let token_url = self
            .config
            .endpoint(endpoints::ACCESS_TOKEN)
            .and_then(|e| TokenUrl::new(e.url.clone()).ok());
        let redirect_url =
            RedirectUrl::new(redirect_uri.to_string()).map_err(|e| KeywardError::Config {
                message: format!("invalid redirect URL: {}", e),
            })?;

        let client = BasicClient::new(
            ClientId::new(self.config.key_str().to_string()),
            self.config
                .secret
                .as_ref()
                .map(|s| ClientSecret::new(s.expose().to_string())),
            auth_url,
            token_url,
        )
        .set_redirect_uri(redirect_url);

        Ok(client)
    }

    fn authorize_url(&self, state: &str, redirect_uri: &str) -> Result<String, KeywardError> {
        let client = self.client(redirect_uri)?;
        let mut request = client.authorize_url(|| CsrfToken::new(state.to_string()));

        if self.config.scope_separator == " " {
            for scope in &self.config.scopes {
                request = request.add_scope(Scope::new(scope.clone()));
            }
        } else if !self.config.scopes.is_empty() {
            request = request.add_extra_param(
                "scope",
                self.config.scopes.join(&self.config.scope_separator),
            );
        }

        let extras = self.hooks.authorize_params(
            &self.config,
            self.config
                .authorize_params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        for (key, value) in extras {
            request = request.add_extra_param(key, value);
        }

        let (url, _) = request.url();
        Ok(url.to_string())
    }

    fn client_params(&self) -> Vec<(String, String)> {
        vec![
            ("client_id".to_string(), self.config.key_str().to_string()),
            ("client_secret".to_string(), self.config.secret_str().to_string()),
        ]
    }

    /// Call a token endpoint with parameters in the query (GET) or form body.
    async fn call_token_endpoint(
        &self,
        ctx: FlowContext<'_>,
        endpoint: &Endpoint,
        method: HttpMethod,
        params: Vec<(String, String)>,
    ) -> Result<HttpResponse, HttpError> {
        let request = if method.has_body() {
            HttpRequest::new(method, endpoint.url.clone()).with_form(params)
        } else {
            let mut url = Url::parse(&endpoint.url).map_err(|e| HttpError::InvalidRequest {
                message: format!("invalid URL: {}", e),
            })?;
            url.query_pairs_mut().extend_pairs(&params);
            HttpRequest::new(method, url.as_str())
        };
        ctx.http
            .send(request.with_header("Accept", "application/json"))
            .await
    }

    /// Copy the standard token-response fields into a token.
    fn apply_token_fields(&self, token: &mut Token, raw: &RawTokenResponse) {
        token.meta.remove(EXPIRES);
        if let Some(expires_in) = raw.get("expires_in") {
            match expires_in.parse::<i64>() {
                Ok(seconds) => {
                    let expires = Utc::now() + Duration::seconds(seconds);
                    token.meta.insert(EXPIRES, expires.timestamp().to_string());
                }
                Err(_) => {
                    tracing::debug!("Ignoring non-numeric expires_in from {}", self.config.name)
                }
            }
        }
        if let Some(refresh) = raw.get("refresh_token") {
            token.meta.insert(REFRESH_TOKEN, refresh);
        }
        for field in ["token_type", "scope"] {
            if let Some(value) = raw.get(field) {
                token.meta.insert(field, value);
            }
        }
    }

    /// Drop the request token named by a failed callback, if there is one.
    async fn discard_request_token(
        &self,
        ctx: FlowContext<'_>,
        input: &InboundRequest,
    ) -> Result<(), KeywardError> {
        let Some(state) = input.param("state") else {
            return Ok(());
        };
        match ctx.take_request_token(input, state).await {
            Ok(_) | Err(KeywardError::AuthorizationFailed { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Service for OAuth2Service {
    fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn required_endpoints(&self) -> &'static [&'static str] {
        REQUIRED_ENDPOINTS
    }

    async fn request_token(
        &self,
        ctx: FlowContext<'_>,
        input: &InboundRequest,
    ) -> Result<FlowStep, KeywardError> {
        ctx.check_request_nonce(input)?;
        if !self.is_configured() {
            return Err(KeywardError::NotConfigured {
                service: self.config.name.to_string(),
            });
        }

        let mut token = ctx.start_handshake(input).await?;
        let Some(state) = token.unique_id.clone() else {
            return Err(KeywardError::authorization(&self.config.name, "request token has no id"));
        };

        let redirect_uri = ctx.verify_callback(input, &[]);
        let location = match self.authorize_url(state.as_str(), &redirect_uri) {
            Ok(location) => location,
            Err(e) => {
                ctx.store.delete(&TokenSelector::by_id(state)).await?;
                return Err(e);
            }
        };

        token.meta.insert(REDIRECT_URI, redirect_uri);
        ctx.store.update(&token).await?;

        tracing::debug!("Redirecting {} handshake {} to authorize", self.config.name, state);
        Ok(FlowStep::Redirect { location })
    }

    async fn verify_token(
        &self,
        ctx: FlowContext<'_>,
        input: &InboundRequest,
    ) -> Result<FlowStep, KeywardError> {
        ctx.check_verify_nonce(input)?;

        if let Some(error) = input.param("error") {
            self.discard_request_token(ctx, input).await?;
            let message = match input.param("error_description") {
                Some(description) => format!("{}: {}", error, description),
                None => error.to_string(),
            };
            return Err(KeywardError::authorization(&self.config.name, message));
        }

        let (Some(code), Some(state)) = (input.param("code"), input.param("state")) else {
            return Err(KeywardError::authorization(
                &self.config.name,
                "callback lacks code or state",
            ));
        };
        let request_token = ctx.take_request_token(input, state).await?;

        let redirect_uri = request_token
            .get_meta(REDIRECT_URI)
            .map(str::to_string)
            .unwrap_or_else(|| ctx.callbacks.url_for(Action::Verify, &self.config.name, &[]));

        let mut params = self.client_params();
        params.extend([
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("redirect_uri".to_string(), redirect_uri),
            ("code".to_string(), code.to_string()),
        ]);
        let params = self.hooks.access_token_params(&self.config, params);

        let endpoint = self.config.required_endpoint(endpoints::ACCESS_TOKEN)?;
        let response = self
            .call_token_endpoint(ctx, endpoint, endpoint.method, params)
            .await
            .map_err(|e| KeywardError::authorization(&self.config.name, e.to_string()))?;
        if !response.is_success() {
            return Err(KeywardError::authorization(
                &self.config.name,
                format!("access token endpoint returned {}", response.status),
            ));
        }

        let raw = parse_token_response(&response.body);
        let Some(access) = raw.get("access_token") else {
            return Err(KeywardError::authorization(
                &self.config.name,
                "token response lacks access_token",
            ));
        };

        let mut token = Token::access(self.config.name.clone(), Credential::bearer(access))
            .with_owner(input.owner.clone());
        self.apply_token_fields(&mut token, &raw);
        if let Some(feature) = request_token.get_meta(FOR) {
            token.meta.insert(FOR, feature);
        }

        let mut session = Session::new(self, ctx).with_token(token);
        let meta = self.build_token_meta(&mut session, &raw).await?;
        let Some(mut token) = session.into_token() else {
            return Err(KeywardError::authorization(
                &self.config.name,
                "token lost while building metadata",
            ));
        };
        token.merge_meta(meta)?;

        ctx.verified(token, input).await
    }

    fn authorize_request(
        &self,
        token: Option<&Token>,
        mut request: HttpRequest,
    ) -> Result<HttpRequest, KeywardError> {
        if request.method.has_body() && request.url.contains('?') {
            if let Ok(mut url) = Url::parse(&request.url) {
                let mut form: Vec<(String, String)> = url.query_pairs().into_owned().collect();
                form.extend(request.form().map(<[_]>::to_vec).unwrap_or_default());
                url.set_query(None);
                request.url = url.into();
                request.body = Some(RequestBody::Form(form));
            }
        }

        let Some(credential) = token.and_then(|t| t.credential.as_ref()) else {
            return Ok(request);
        };
        let value = credential.token().expose();

        match &self.config.auth_style {
            AuthStyle::Header { scheme } => {
                request.set_header("Authorization", format!("{} {}", scheme, value));
            }
            AuthStyle::Basic => {
                request.set_header("Authorization", format!("Basic {}", value));
            }
            AuthStyle::Query { param } => {
                if request.method.has_body() {
                    let mut form = request.form().map(<[_]>::to_vec).unwrap_or_default();
                    form.push((param.clone(), value.to_string()));
                    request.body = Some(RequestBody::Form(form));
                } else {
                    let mut url = Url::parse(&request.url).map_err(|e| KeywardError::Config {
                        message: format!("invalid URL for {}: {}", self.config.name, e),
                    })?;
                    url.query_pairs_mut().append_pair(param, value);
                    request.url = url.into();
                }
            }
        }
        Ok(request)
    }

    async fn prepare_token(
        &self,
        ctx: FlowContext<'_>,
        token: &mut Token,
    ) -> Result<RefreshOutcome, KeywardError> {
        if !token.is_expired(Duration::seconds(self.config.refresh_grace_secs)) {
            return Ok(RefreshOutcome::NotNeeded);
        }
        let Some(refresh_token) = token.refresh_token().map(str::to_string) else {
            tracing::debug!("{} token expiring without a refresh token", self.config.name);
            return Ok(RefreshOutcome::NotNeeded);
        };
        let Some(endpoint) = self
            .config
            .endpoint(endpoints::REFRESH)
            .or_else(|| self.config.endpoint(endpoints::ACCESS_TOKEN))
        else {
            return Ok(RefreshOutcome::Failed("no refresh endpoint configured".to_string()));
        };

        let mut params = self.client_params();
        params.extend([
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token),
        ]);

        let response = match self
            .call_token_endpoint(ctx, endpoint, HttpMethod::Post, params)
            .await
        {
            Ok(response) => response,
            Err(e) => return Ok(RefreshOutcome::Failed(e.to_string())),
        };
        if !response.is_success() {
            return Ok(RefreshOutcome::Failed(format!(
                "refresh endpoint returned {}",
                response.status
            )));
        }

        let raw = parse_token_response(&response.body);
        let Some(access) = raw.get("access_token") else {
            return Ok(RefreshOutcome::Failed(
                "refresh response lacks access_token".to_string(),
            ));
        };

        token.credential = Some(Credential::bearer(access));
        self.apply_token_fields(token, &raw);
        ctx.store.update(token).await?;

        if let Some(id) = &token.unique_id {
            tracing::info!("Refreshed {} token {}", self.config.name, id);
        }
        Ok(RefreshOutcome::Refreshed)
    }

    fn get_display(&self, token: &Token) -> String {
        self.hooks.display(&self.config, token)
    }

    async fn build_token_meta(
        &self,
        session: &mut Session<'_>,
        raw: &RawTokenResponse,
    ) -> Result<TokenMeta, KeywardError> {
        self.hooks.build_token_meta(session, raw).await
    }
}

impl std::fmt::Debug for OAuth2Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth2Service")
            .field("name", &self.config.name)
            .finish()
    }
}
