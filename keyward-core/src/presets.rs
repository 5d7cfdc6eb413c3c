//! Ready-made service configurations.
//!
//! Application credentials are left empty; supply them in configuration or
//! through the secret store (see [`ServiceConfig::load_credentials`]).

use crate::service::{Endpoint, Flow, ServiceConfig, endpoints};

/// Twitter, OAuth 1.0a with the `Authorization: OAuth` header.
pub fn twitter() -> ServiceConfig {
    ServiceConfig::new("twitter", Flow::OAuth1)
        .with_label("Twitter")
        .with_endpoint(
            endpoints::REQUEST_TOKEN,
            Endpoint::post("https://api.twitter.com/oauth/request_token"),
        )
        .with_endpoint(
            endpoints::AUTHORIZE,
            Endpoint::get("https://api.twitter.com/oauth/authorize"),
        )
        .with_endpoint(
            endpoints::ACCESS_TOKEN,
            Endpoint::post("https://api.twitter.com/oauth/access_token"),
        )
        .with_endpoint(
            endpoints::TEST,
            Endpoint::get("https://api.twitter.com/1.1/account/verify_credentials.json"),
        )
}

/// Google, OAuth 2.0 with offline access so a refresh token is issued.
pub fn google() -> ServiceConfig {
    ServiceConfig::new("google", Flow::OAuth2)
        .with_label("Google")
        .with_scopes(["openid", "email", "profile"])
        .with_authorize_param("access_type", "offline")
        .with_authorize_param("prompt", "consent")
        .with_endpoint(
            endpoints::AUTHORIZE,
            Endpoint::get("https://accounts.google.com/o/oauth2/v2/auth"),
        )
        .with_endpoint(
            endpoints::ACCESS_TOKEN,
            Endpoint::post("https://oauth2.googleapis.com/token"),
        )
        .with_endpoint(
            endpoints::REFRESH,
            Endpoint::post("https://oauth2.googleapis.com/token"),
        )
        .with_endpoint(
            endpoints::TEST,
            Endpoint::get("https://openidconnect.googleapis.com/v1/userinfo"),
        )
}

/// Pinboard, HTTP Basic against the API's update-time call.
pub fn pinboard() -> ServiceConfig {
    ServiceConfig::new("pinboard", Flow::Basic)
        .with_label("Pinboard")
        .with_endpoint(
            endpoints::VERIFY,
            Endpoint::get("https://api.pinboard.in/v1/posts/update"),
        )
        .with_endpoint(
            endpoints::TEST,
            Endpoint::get("https://api.pinboard.in/v1/posts/update"),
        )
}

/// Every preset.
pub fn all() -> Vec<ServiceConfig> {
    vec![twitter(), google(), pinboard()]
}
