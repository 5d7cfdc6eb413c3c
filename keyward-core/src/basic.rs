//! HTTP Basic engine.
//!
//! There is no redirect: `request_token` asks the host to show a
//! username/password form, and `verify_token` checks the submitted pair
//! against the service's `verify` endpoint. The stored credential is the
//! encoded `user:password` pair.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::sync::Arc;

use crate::error::KeywardError;
use crate::http::HttpRequest;
use crate::service::{
    DefaultHooks, FlowContext, FlowStep, InboundRequest, RawTokenResponse, Service, ServiceConfig,
    ServiceHooks, Session, endpoints, parse_token_response,
};
use crate::token::{Credential, FOR, Token, TokenMeta};

const REQUIRED_ENDPOINTS: &[&str] = &[endpoints::VERIFY];

/// A service authenticated with HTTP Basic credentials.
pub struct HttpBasicService {
    config: ServiceConfig,
    hooks: Arc<dyn ServiceHooks>,
}

impl HttpBasicService {
    /// Create a service with default hooks.
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a service with provider-specific hooks.
    pub fn with_hooks(config: ServiceConfig, hooks: Arc<dyn ServiceHooks>) -> Self {
        Self { config, hooks }
    }
}

/// Encode a username and password for the `Authorization: Basic` header.
pub fn encode_credentials(username: &str, password: &str) -> String {
    STANDARD.encode(format!("{}:{}", username, password))
}

#[async_trait]
impl Service for HttpBasicService {
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

        let extras: Vec<(&str, &str)> = input.param("for").map(|f| ("for", f)).into_iter().collect();
        Ok(FlowStep::Form {
            submit_to: ctx.verify_callback(input, &extras),
        })
    }

    async fn verify_token(
        &self,
        ctx: FlowContext<'_>,
        input: &InboundRequest,
    ) -> Result<FlowStep, KeywardError> {
        ctx.check_verify_nonce(input)?;

        let (Some(username), Some(password)) = (input.param("username"), input.param("password"))
        else {
            return Err(KeywardError::authorization(
                &self.config.name,
                "username and password are required",
            ));
        };

        let credential = encode_credentials(username, password);
        let endpoint = self.config.required_endpoint(endpoints::VERIFY)?;
        let request = HttpRequest::new(endpoint.method, endpoint.url.clone())
            .with_header("Authorization", format!("Basic {}", credential));

        let response = ctx
            .http
            .send(request)
            .await
            .map_err(|e| KeywardError::authorization(&self.config.name, e.to_string()))?;
        if !response.is_success() {
            return Err(KeywardError::authorization(
                &self.config.name,
                response.status.to_string(),
            ));
        }

        let mut token = Token::access(self.config.name.clone(), Credential::bearer(credential))
            .with_owner(input.owner.clone())
            .with_meta("username", username);
        if let Some(feature) = input.param("for") {
            token.meta.insert(FOR, feature);
        }

        let raw = parse_token_response(&response.body);
        let mut session = Session::new(self, ctx).with_token(token);
        let meta = self.build_token_meta(&mut session, &raw).await?;
        let Some(mut token) = session.into_token() else {
            return Err(KeywardError::authorization(
                &self.config.name,
                "token lost while building metadata",
            ));
        };
        token.merge_meta(meta)?;

        tracing::debug!("Verified {} credentials for {}", self.config.name, username);
        ctx.verified(token, input).await
    }

    fn authorize_request(
        &self,
        token: Option<&Token>,
        mut request: HttpRequest,
    ) -> Result<HttpRequest, KeywardError> {
        if let Some(credential) = token.and_then(|t| t.credential.as_ref()) {
            request.set_header("Authorization", format!("Basic {}", credential.token().expose()));
        }
        Ok(request)
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

impl std::fmt::Debug for HttpBasicService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBasicService")
            .field("name", &self.config.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Endpoint, Flow};

    fn service() -> HttpBasicService {
        HttpBasicService::new(
            ServiceConfig::new("pinboard", Flow::Basic)
                .with_endpoint(endpoints::VERIFY, Endpoint::get("https://api.example.com/verify")),
        )
    }

    #[test]
    fn test_encode_credentials() {
        assert_eq!(encode_credentials("Aladdin", "open sesame"), "QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
    }

    #[test]
    fn test_authorize_request_sets_basic_header() {
        let token = Token::access("pinboard", Credential::bearer(encode_credentials("u", "p")));
        let request = service()
            .authorize_request(Some(&token), HttpRequest::get("https://api.example.com/posts"))
            .unwrap();
        assert_eq!(request.header("Authorization"), Some("Basic dTpw"));
    }

    #[test]
    fn test_display_uses_username() {
        let token = Token::access("pinboard", Credential::bearer("x")).with_meta("username", "u");
        assert_eq!(service().get_display(&token), "@u");
    }
}
