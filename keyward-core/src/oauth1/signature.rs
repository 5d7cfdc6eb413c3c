//! OAuth 1.0a request signing (HMAC-SHA1).
//!
//! ```text
//! base string = METHOD & enc(normalized URL) & enc(sorted encoded params)
//! signing key = enc(consumer_secret) & enc(token_secret)
//! ```
//!
//! Parameters are the query string, the form body and the `oauth_*`
//! protocol parameters, each percent-encoded per RFC 3986 and then sorted by
//! encoded key, ties broken by encoded value.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use url::Url;

use crate::error::KeywardError;
use crate::http::HttpMethod;

type HmacSha1 = Hmac<Sha1>;

pub const SIGNATURE_METHOD: &str = "HMAC-SHA1";
pub const VERSION: &str = "1.0";

/// Percent-encode per RFC 3986 (unreserved characters stay as they are).
pub fn percent_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Scheme, host, non-default port and path, lower-casing scheme and host.
pub fn normalized_url(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let port = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
    format!("{}://{}{}{}", url.scheme(), host, port, url.path())
}

/// Encode, sort and join parameters into the normalized parameter string.
pub fn normalized_params(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (percent_encode(k), percent_encode(v)))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Build the signature base string.
pub fn base_string(method: HttpMethod, url: &Url, params: &[(String, String)]) -> String {
    format!(
        "{}&{}&{}",
        method.as_str(),
        percent_encode(&normalized_url(url)),
        percent_encode(&normalized_params(params))
    )
}

/// HMAC-SHA1 over the base string, base64-encoded.
pub fn sign_hmac_sha1(
    base: &str,
    consumer_secret: &str,
    token_secret: &str,
) -> Result<String, KeywardError> {
    let key = format!("{}&{}", percent_encode(consumer_secret), percent_encode(token_secret));
    let mac = HmacSha1::new_from_slice(key.as_bytes())
        .map_err(|e| KeywardError::Config {
            message: format!("invalid signing key: {}", e),
        })?
        .chain_update(base.as_bytes())
        .finalize();
    Ok(STANDARD.encode(mac.into_bytes()))
}

/// Build an `Authorization: OAuth ...` header value.
///
/// `realm` comes first when configured; it is never signed.
pub fn authorization_header(oauth_params: &[(String, String)], realm: Option<&str>) -> String {
    let mut parts = Vec::with_capacity(oauth_params.len() + 1);
    if let Some(realm) = realm {
        parts.push(format!("realm=\"{}\"", percent_encode(realm)));
    }
    parts.extend(
        oauth_params
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v))),
    );
    format!("OAuth {}", parts.join(", "))
}

/// Fresh per-request nonce.
pub fn generate_nonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Consumer and (optional) token credentials used to sign requests.
#[derive(Clone, Copy)]
pub struct Signer<'a> {
    consumer_key: &'a str,
    consumer_secret: &'a str,
    token: Option<&'a str>,
    token_secret: &'a str,
}

impl<'a> Signer<'a> {
    /// Sign with consumer credentials only (request-token phase).
    pub fn new(consumer_key: &'a str, consumer_secret: &'a str) -> Self {
        Self {
            consumer_key,
            consumer_secret,
            token: None,
            token_secret: "",
        }
    }

    /// Add a token and its secret.
    pub fn with_token(mut self, token: &'a str, token_secret: &'a str) -> Self {
        self.token = Some(token);
        self.token_secret = token_secret;
        self
    }

    /// Compute the `oauth_*` parameters, signature included, for a request.
    ///
    /// `form` is the urlencoded body (empty for GET). `extra` holds
    /// additional protocol parameters such as `oauth_callback` or
    /// `oauth_verifier`.
    pub fn sign_with(
        &self,
        method: HttpMethod,
        url: &Url,
        form: &[(String, String)],
        extra: &[(String, String)],
        nonce: &str,
        timestamp: i64,
    ) -> Result<Vec<(String, String)>, KeywardError> {
        let mut oauth: Vec<(String, String)> = vec![
            ("oauth_consumer_key".to_string(), self.consumer_key.to_string()),
            ("oauth_nonce".to_string(), nonce.to_string()),
            ("oauth_signature_method".to_string(), SIGNATURE_METHOD.to_string()),
            ("oauth_timestamp".to_string(), timestamp.to_string()),
            ("oauth_version".to_string(), VERSION.to_string()),
        ];
        if let Some(token) = self.token {
            oauth.push(("oauth_token".to_string(), token.to_string()));
        }
        oauth.extend(extra.iter().cloned());

        let mut params: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        params.extend(form.iter().cloned());
        params.extend(oauth.iter().cloned());

        let base = base_string(method, url, &params);
        let signature = sign_hmac_sha1(&base, self.consumer_secret, self.token_secret)?;

        oauth.push(("oauth_signature".to_string(), signature));
        oauth.sort();
        Ok(oauth)
    }

    /// Like [`sign_with`](Self::sign_with), with a fresh nonce and the
    /// current time.
    pub fn sign(
        &self,
        method: HttpMethod,
        url: &Url,
        form: &[(String, String)],
        extra: &[(String, String)],
    ) -> Result<Vec<(String, String)>, KeywardError> {
        self.sign_with(method, url, form, extra, &generate_nonce(), Utc::now().timestamp())
    }
}

impl std::fmt::Debug for Signer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("consumer_key", &self.consumer_key)
            .field("has_token", &self.token.is_some())
            .finish()
    }
}
