//! Shared fixtures for the end-to-end handshake tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use keyward_core::{
    Action, Callbacks, HmacNonces, HttpClientConfig, InboundRequest, MemoryTokenStore,
    Orchestrator, OwnerId, ReqwestClient, ServiceConfig, ServiceId, ServiceRegistry,
    TokenKind, TokenSelector,
};
use url::Url;

/// Host URL every callback points back to.
pub const CALLBACK: &str = "https://app.example.com/keyring";

pub fn owner() -> OwnerId {
    OwnerId::new("alice")
}

/// An orchestrator over a memory store and a real HTTP client.
pub fn orchestrator(configs: Vec<ServiceConfig>) -> Orchestrator {
    let mut registry = ServiceRegistry::new();
    for config in configs {
        registry.register_config(config).unwrap();
    }
    with_registry(registry)
}

/// An orchestrator over a prepared registry.
pub fn with_registry(registry: ServiceRegistry) -> Orchestrator {
    Orchestrator::new(
        registry,
        Arc::new(MemoryTokenStore::new()),
        Arc::new(ReqwestClient::new(&HttpClientConfig::default()).unwrap()),
        Arc::new(HmacNonces::new(b"integration-test-key").unwrap()),
        Callbacks::new(CALLBACK).unwrap(),
    )
}

/// A `request` action carrying valid nonces for both layers.
pub fn request_input(orchestrator: &Orchestrator, service: &str) -> InboundRequest {
    from_callback(&orchestrator.request_url(&ServiceId::new(service), Some(&owner())))
}

/// Rebuild the inbound call a host would receive when the user agent lands
/// on `url`.
pub fn from_callback(url: &str) -> InboundRequest {
    let params = query(url);
    let action: Action = params["action"].parse().unwrap();
    InboundRequest::new(action, params["service"].as_str())
        .with_owner(owner())
        .with_query(url)
}

/// Query parameters of a URL.
pub fn query(url: &str) -> BTreeMap<String, String> {
    Url::parse(url).unwrap().query_pairs().into_owned().collect()
}

/// Form-encode a value the way it appears in a request body.
pub fn form_encoded(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

pub async fn count(orchestrator: &Orchestrator, kind: TokenKind) -> usize {
    orchestrator
        .store()
        .count(&TokenSelector::new().kind(kind))
        .await
        .unwrap()
}
