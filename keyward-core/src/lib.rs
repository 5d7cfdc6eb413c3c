//! # Keyward Core
//!
//! Token lifecycle library for connecting a host application to remote
//! services over OAuth 1.0a, OAuth 2.0 and HTTP Basic.
//!
//! This crate provides:
//! - The token model and the [`TokenStore`] contract, with in-memory and
//!   file-backed stores
//! - The [`Service`] contract and three engines: [`OAuth1Service`],
//!   [`OAuth2Service`] and [`HttpBasicService`]
//! - Correlation nonces guarding every inbound action
//! - The [`Orchestrator`], which dispatches `request`, `verify`, `created`,
//!   `delete` and `manage` actions
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use keyward_core::{Orchestrator, ResourceRequest};
//!
//! async fn profile(orchestrator: &Orchestrator, id: &str) -> Result<serde_json::Value, keyward_core::KeywardError> {
//!     let mut session = orchestrator.connection(id).await?;
//!     let response = session
//!         .request(ResourceRequest::get("https://api.example.com/me"))
//!         .await?;
//!     Ok(response.body)
//! }
//! ```

pub mod basic;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod model;
pub mod nonce;
pub mod oauth1;
pub mod oauth2;
pub mod presets;
pub mod registry;
pub mod service;
pub mod store;
pub mod token;

// Re-export commonly used types at crate root
pub use model::{Action, OwnerId, ParseError, ServiceId, TokenId, TokenKind};

pub use store::{
    FileTokenStore, MemorySecretStore, MemoryTokenStore, Secret, SecretStore, StoreError,
    TokenSelector, TokenStore, create_secret_store,
};

#[cfg(feature = "keyring-store")]
pub use store::KeyringStore;

pub use token::{Credential, Token, TokenError, TokenMeta};

pub use http::{
    HttpClient, HttpClientConfig, HttpError, HttpMethod, HttpRequest, HttpResponse, RequestError,
    ReqwestClient,
};

pub use nonce::{HmacNonces, NonceGuard};

pub use service::{
    ApiResponse, AuthStyle, Callbacks, ConnectionEvents, Endpoint, Flow, FlowContext, FlowStep,
    InboundRequest, LogEvents, RawTokenResponse, RefreshOutcome, ResourceRequest, Service,
    ServiceConfig, ServiceHooks, Session,
};

pub use basic::HttpBasicService;
pub use oauth1::OAuth1Service;
pub use self::oauth2::OAuth2Service;

pub use registry::ServiceRegistry;

pub use dispatch::{ConnectionSummary, Dispatch, DispatchOutcome, Orchestrator};

pub use error::KeywardError;
