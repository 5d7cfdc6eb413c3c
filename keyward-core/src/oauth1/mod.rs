//! OAuth 1.0a engine.
//!
//! ```text
//! Unauthenticated -> RequestTokenObtained -> UserAuthorizing -> AccessTokenObtained
//!                                                            \-> Failed
//! ```
//!
//! OAuth1 callbacks have no `state` slot, so the request token id travels in
//! the callback URL's query string instead.

pub mod signature;

use async_trait::async_trait;
use std::sync::Arc;
use url::Url;

use crate::error::KeywardError;
use crate::http::{HttpRequest, RequestBody};
use crate::service::{
    DefaultHooks, Endpoint, FlowContext, FlowStep, InboundRequest, RawTokenResponse, Service,
    ServiceConfig, ServiceHooks, Session, endpoints, parse_token_response,
};
use crate::store::TokenSelector;
use crate::token::{Credential, FOR, Token, TokenMeta};

use self::signature::{Signer, authorization_header};

const REQUIRED_ENDPOINTS: &[&str] = &[
    endpoints::REQUEST_TOKEN,
    endpoints::AUTHORIZE,
    endpoints::ACCESS_TOKEN,
];

/// A service speaking OAuth 1.0a.
pub struct OAuth1Service {
    config: ServiceConfig,
    hooks: Arc<dyn ServiceHooks>,
}

impl OAuth1Service {
    /// Create a service with default hooks.
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a service with provider-specific hooks.
    pub fn with_hooks(config: ServiceConfig, hooks: Arc<dyn ServiceHooks>) -> Self {
        Self { config, hooks }
    }

    fn signer(&self) -> Signer<'_> {
        Signer::new(self.config.key_str(), self.config.secret_str())
    }

    fn header_auth(&self) -> bool {
        !matches!(self.config.auth_style, crate::service::AuthStyle::Query { .. })
    }

    /// Sign `request` and attach the protocol parameters per the auth style.
    fn sign_request(
        &self,
        signer: Signer<'_>,
        mut request: HttpRequest,
        extra: &[(String, String)],
    ) -> Result<HttpRequest, KeywardError> {
        let url = Url::parse(&request.url).map_err(|e| KeywardError::Config {
            message: format!("invalid URL for {}: {}", self.config.name, e),
        })?;
        let form = request.form().map(<[_]>::to_vec).unwrap_or_default();
        let oauth = signer.sign(request.method, &url, &form, extra)?;

        if self.header_auth() {
            request.set_header(
                "Authorization",
                authorization_header(&oauth, self.config.realm.as_deref()),
            );
        } else if request.method.has_body() {
            let mut form = form;
            form.extend(oauth);
            request.body = Some(RequestBody::Form(form));
        } else {
            let mut url = url;
            url.query_pairs_mut().extend_pairs(&oauth);
            request.url = url.into();
        }
        Ok(request)
    }

    /// Build a signed handshake call. Parameters that are not `oauth_*`
    /// travel in the query string (GET) or form body.
    fn handshake_request(
        &self,
        signer: Signer<'_>,
        endpoint: &Endpoint,
        params: Vec<(String, String)>,
    ) -> Result<HttpRequest, KeywardError> {
        let (oauth, plain): (Vec<_>, Vec<_>) =
            params.into_iter().partition(|(k, _)| k.starts_with("oauth_"));

        let request = if endpoint.method.has_body() {
            HttpRequest::new(endpoint.method, endpoint.url.clone()).with_form(plain)
        } else {
            let mut url = Url::parse(&endpoint.url).map_err(|e| KeywardError::Config {
                message: format!("invalid URL for {}: {}", self.config.name, e),
            })?;
            if !plain.is_empty() {
                url.query_pairs_mut().extend_pairs(&plain);
            }
            HttpRequest::new(endpoint.method, url.as_str())
        };

        self.sign_request(signer, request, &oauth)
    }

    async fn obtain_request_token(
        &self,
        ctx: FlowContext<'_>,
        callback: &str,
    ) -> Result<(String, String), KeywardError> {
        let endpoint = self.config.required_endpoint(endpoints::REQUEST_TOKEN)?;
        let params = self.hooks.request_token_params(
            &self.config,
            vec![("oauth_callback".to_string(), callback.to_string())],
        );
        let request = self.handshake_request(self.signer(), endpoint, params)?;

        let response = ctx
            .http
            .send(request)
            .await
            .map_err(|e| KeywardError::authorization(&self.config.name, e.to_string()))?;
        if response.status != 200 {
            return Err(KeywardError::authorization(
                &self.config.name,
                format!("request token endpoint returned {}", response.status),
            ));
        }

        let raw = parse_token_response(&response.body);
        match (raw.get("oauth_token"), raw.get("oauth_token_secret")) {
            (Some(token), Some(secret)) => Ok((token.to_string(), secret.to_string())),
            _ => Err(KeywardError::authorization(
                &self.config.name,
                "request token response lacks oauth_token",
            )),
        }
    }

    /// Obtain a provider request token for `token`, persist it, and return
    /// the authorize URL.
    async fn issue_request_token(
        &self,
        ctx: FlowContext<'_>,
        token: &mut Token,
        callback: &str,
    ) -> Result<String, KeywardError> {
        let (key, secret) = self.obtain_request_token(ctx, callback).await?;
        let location = self.authorize_url(&key, callback)?;
        token.credential = Some(Credential::pair(key, secret));
        ctx.store.update(token).await?;
        Ok(location)
    }

    fn authorize_url(&self, request_token: &str, callback: &str) -> Result<String, KeywardError> {
        let endpoint = self.config.required_endpoint(endpoints::AUTHORIZE)?;
        let mut url = Url::parse(&endpoint.url).map_err(|e| KeywardError::Config {
            message: format!("invalid authorize URL for {}: {}", self.config.name, e),
        })?;

        let mut params = vec![
            ("oauth_token".to_string(), request_token.to_string()),
            ("oauth_callback".to_string(), callback.to_string()),
        ];
        params.extend(
            self.config
                .authorize_params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        let params = self.hooks.authorize_params(&self.config, params);
        url.query_pairs_mut().extend_pairs(&params);
        Ok(url.into())
    }
}

#[async_trait]
impl Service for OAuth1Service {
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
        let Some(id) = token.unique_id.clone() else {
            return Err(KeywardError::authorization(&self.config.name, "request token has no id"));
        };
        let callback = ctx.verify_callback(input, &[("state", id.as_str())]);

        let location = match self.issue_request_token(ctx, &mut token, &callback).await {
            Ok(location) => location,
            Err(e) => {
                match ctx.store.delete(&TokenSelector::by_id(id.clone())).await {
                    Ok(_) => tracing::debug!(
                        "Pruned {} request token {} after failure",
                        self.config.name,
                        id
                    ),
                    Err(prune) => tracing::warn!(
                        "Failed to prune {} request token {}: {}",
                        self.config.name,
                        id,
                        prune
                    ),
                }
                return Err(e);
            }
        };

        tracing::debug!("Redirecting {} handshake {} to authorize", self.config.name, id);
        Ok(FlowStep::Redirect { location })
    }

    async fn verify_token(
        &self,
        ctx: FlowContext<'_>,
        input: &InboundRequest,
    ) -> Result<FlowStep, KeywardError> {
        ctx.check_verify_nonce(input)?;

        let state = input
            .param("state")
            .ok_or_else(|| KeywardError::authorization(&self.config.name, "callback lacks state"))?;
        let request_token = ctx.take_request_token(input, state).await?;

        let Some(Credential::Pair { key, secret }) = &request_token.credential else {
            return Err(KeywardError::authorization(
                &self.config.name,
                "request token was never issued",
            ));
        };
        if let Some(inbound) = input.param("oauth_token") {
            if inbound != key.expose() {
                return Err(KeywardError::authorization(
                    &self.config.name,
                    "oauth_token does not match the request token",
                ));
            }
        }

        let mut params = Vec::new();
        if let Some(verifier) = input.param("oauth_verifier") {
            params.push(("oauth_verifier".to_string(), verifier.to_string()));
        }
        let params = self.hooks.access_token_params(&self.config, params);

        let endpoint = self.config.required_endpoint(endpoints::ACCESS_TOKEN)?;
        let signer = self.signer().with_token(key.expose(), secret.expose());
        let request = self.handshake_request(signer, endpoint, params)?;

        let response = ctx
            .http
            .send(request)
            .await
            .map_err(|e| KeywardError::authorization(&self.config.name, e.to_string()))?;
        if !response.is_success() {
            return Err(KeywardError::authorization(
                &self.config.name,
                format!("access token endpoint returned {}", response.status),
            ));
        }

        let raw = parse_token_response(&response.body);
        let (Some(access), Some(access_secret)) =
            (raw.get("oauth_token"), raw.get("oauth_token_secret"))
        else {
            return Err(KeywardError::authorization(
                &self.config.name,
                "access token response lacks oauth_token",
            ));
        };

        let mut token = Token::access(
            self.config.name.clone(),
            Credential::pair(access, access_secret),
        )
        .with_owner(input.owner.clone());
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
        // A verifier left over from the callback must not be signed.
        if let Ok(mut url) = Url::parse(&request.url) {
            if url.query_pairs().any(|(k, _)| k == "oauth_verifier") {
                let kept: Vec<(String, String)> = url
                    .query_pairs()
                    .filter(|(k, _)| k != "oauth_verifier")
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                url.set_query(None);
                if !kept.is_empty() {
                    url.query_pairs_mut().extend_pairs(&kept);
                }
                request.url = url.into();
            }
        }

        let signer = match token.and_then(|t| t.credential.as_ref()) {
            Some(Credential::Pair { key, secret }) => {
                self.signer().with_token(key.expose(), secret.expose())
            }
            Some(Credential::Bearer { .. }) => {
                return Err(KeywardError::Config {
                    message: format!("{} token is not a key/secret pair", self.config.name),
                });
            }
            None => self.signer(),
        };

        self.sign_request(signer, request, &[])
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

impl std::fmt::Debug for OAuth1Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth1Service")
            .field("name", &self.config.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::AuthStyle;

    fn service(style: AuthStyle) -> OAuth1Service {
        OAuth1Service::new(
            ServiceConfig::new("twitter", crate::service::Flow::OAuth1)
                .with_credentials("ck", "cs")
                .with_auth_style(style)
                .with_realm("Twitter API")
                .with_endpoint(
                    endpoints::REQUEST_TOKEN,
                    Endpoint::post("https://api.example.com/oauth/request_token"),
                )
                .with_endpoint(
                    endpoints::AUTHORIZE,
                    Endpoint::get("https://api.example.com/oauth/authorize"),
                )
                .with_endpoint(
                    endpoints::ACCESS_TOKEN,
                    Endpoint::post("https://api.example.com/oauth/access_token"),
                ),
        )
    }

    fn bound() -> Token {
        Token::access("twitter", Credential::pair("at1", "as1"))
    }

    #[test]
    fn test_header_auth() {
        let request = service(AuthStyle::default())
            .authorize_request(Some(&bound()), HttpRequest::get("https://api.example.com/me"))
            .unwrap();

        let header = request.header("Authorization").unwrap();
        assert!(header.starts_with("OAuth realm=\"Twitter%20API\", "));
        assert!(header.contains("oauth_token=\"at1\""));
        assert!(header.contains("oauth_signature_method=\"HMAC-SHA1\""));
        assert_eq!(request.url, "https://api.example.com/me");
    }

    #[test]
    fn test_query_auth_get() {
        let request = service(AuthStyle::Query { param: String::new() })
            .authorize_request(Some(&bound()), HttpRequest::get("https://api.example.com/me?x=1"))
            .unwrap();

        assert!(request.header("Authorization").is_none());
        assert!(request.url.contains("x=1"));
        assert!(request.url.contains("oauth_signature="));
        assert!(request.url.contains("oauth_token=at1"));
    }

    #[test]
    fn test_query_auth_post_goes_to_body() {
        let request = service(AuthStyle::Query { param: String::new() })
            .authorize_request(
                Some(&bound()),
                HttpRequest::post("https://api.example.com/statuses")
                    .with_form(vec![("status".into(), "hi".into())]),
            )
            .unwrap();

        let form = request.form().unwrap();
        assert!(form.iter().any(|(k, _)| k == "status"));
        assert!(form.iter().any(|(k, _)| k == "oauth_signature"));
        assert!(!request.url.contains("oauth_"));
    }

    #[test]
    fn test_verifier_stripped_before_signing() {
        let request = service(AuthStyle::default())
            .authorize_request(
                Some(&bound()),
                HttpRequest::get("https://api.example.com/me?oauth_verifier=v1&page=2"),
            )
            .unwrap();
        assert_eq!(request.url, "https://api.example.com/me?page=2");
    }

    #[test]
    fn test_bearer_credential_rejected() {
        let token = Token::access("twitter", Credential::bearer("b"));
        let result = service(AuthStyle::default())
            .authorize_request(Some(&token), HttpRequest::get("https://api.example.com/me"));
        assert!(matches!(result, Err(KeywardError::Config { .. })));
    }

    #[test]
    fn test_authorize_url() {
        let url = service(AuthStyle::default())
            .authorize_url("rt1", "https://app.example.com/keyring?action=verify")
            .unwrap();
        assert!(url.starts_with("https://api.example.com/oauth/authorize?oauth_token=rt1&oauth_callback="));
    }
}
