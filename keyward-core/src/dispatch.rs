//! Orchestrator: the single entry point a host calls.
//!
//! The orchestrator owns the registry and the collaborators every flow needs
//! (token store, HTTP client, nonce guard, callback builder, event sink). It
//! validates the action-level nonce, finds the service, runs the step and
//! folds the result into a [`Dispatch`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::KeywardError;
use crate::http::HttpClient;
use crate::model::{Action, OwnerId, ServiceId, TokenId, TokenKind, request_nonce_action};
use crate::nonce::NonceGuard;
use crate::registry::ServiceRegistry;
use crate::service::{
    Callbacks, ConnectionEvents, FlowContext, FlowStep, InboundRequest, LogEvents, Service,
    Session,
};
use crate::store::{StoreError, TokenSelector, TokenStore};
use crate::token::Token;

/// What the host should do after a dispatched action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Send the user agent to `location`.
    Redirect { location: String },

    /// Show a credentials form posting to `submit_to`.
    Form { submit_to: String },

    /// A handshake completed; send the user agent to `redirect`.
    Verified { id: TokenId, redirect: String },

    /// A connection was created.
    Created { id: TokenId, display: String },

    /// A connection was deleted.
    Deleted { id: TokenId },

    /// The connections of a service.
    Manage { connections: Vec<ConnectionSummary> },
}

/// A stored connection as shown to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub id: TokenId,
    pub service: ServiceId,
    pub display: String,
    pub owner: Option<OwnerId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Visible metadata only.
    pub meta: BTreeMap<String, String>,
}

impl ConnectionSummary {
    fn new(service: &dyn Service, token: &Token) -> Option<Self> {
        Some(Self {
            id: token.unique_id.clone()?,
            service: token.service.clone(),
            display: service.get_display(token),
            owner: token.owner.clone(),
            created_at: token.created_at,
            expires_at: token.expires_at(),
            meta: token.meta(false),
        })
    }
}

/// Result of [`Orchestrator::dispatch`].
///
/// `errors` is terminal: when it is non-empty the action did not happen and
/// `outcome` is `None`. `messages` is advisory.
#[derive(Debug, Default)]
pub struct Dispatch {
    pub outcome: Option<DispatchOutcome>,
    pub errors: Vec<KeywardError>,
    pub messages: Vec<String>,
}

impl Dispatch {
    /// A dispatch that failed before reaching a service.
    pub fn failed(error: KeywardError) -> Self {
        Self {
            errors: vec![error],
            ..Self::default()
        }
    }

    /// Whether the action failed.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// The host-facing context object.
pub struct Orchestrator {
    registry: ServiceRegistry,
    store: Arc<dyn TokenStore>,
    http: Arc<dyn HttpClient>,
    nonces: Arc<dyn NonceGuard>,
    callbacks: Callbacks,
    events: Arc<dyn ConnectionEvents>,
}

impl Orchestrator {
    /// Create an orchestrator that reports lifecycle events to the log.
    pub fn new(
        registry: ServiceRegistry,
        store: Arc<dyn TokenStore>,
        http: Arc<dyn HttpClient>,
        nonces: Arc<dyn NonceGuard>,
        callbacks: Callbacks,
    ) -> Self {
        Self {
            registry,
            store,
            http,
            nonces,
            callbacks,
            events: Arc::new(LogEvents),
        }
    }

    /// Replace the lifecycle event sink.
    pub fn with_events(mut self, events: Arc<dyn ConnectionEvents>) -> Self {
        self.events = events;
        self
    }

    /// The service registry.
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// The token store.
    pub fn store(&self) -> &dyn TokenStore {
        self.store.as_ref()
    }

    /// Collaborators for a flow step.
    pub fn context(&self) -> FlowContext<'_> {
        FlowContext {
            store: self.store.as_ref(),
            http: self.http.as_ref(),
            nonces: self.nonces.as_ref(),
            callbacks: &self.callbacks,
            events: self.events.as_ref(),
        }
    }

    /// Create a nonce for an action string such as `keyring-delete`.
    pub fn create_nonce(&self, action: &str, owner: Option<&OwnerId>) -> String {
        self.nonces.create(action, owner)
    }

    /// URL that starts a handshake, carrying both nonces.
    pub fn request_url(&self, service: &ServiceId, owner: Option<&OwnerId>) -> String {
        let kr_nonce = self.create_nonce(&Action::Request.nonce_action(), owner);
        let nonce = self.create_nonce(&request_nonce_action(service), owner);
        self.callbacks.url_for(
            Action::Request,
            service,
            &[("nonce", &nonce), ("kr_nonce", &kr_nonce)],
        )
    }

    fn service(&self, name: &ServiceId) -> Result<&Arc<dyn Service>, KeywardError> {
        self.registry
            .get(name.clone())
            .ok_or_else(|| KeywardError::UnknownService {
                service: name.to_string(),
            })
    }

    /// Run one inbound action.
    pub async fn dispatch(&self, input: &InboundRequest) -> Dispatch {
        let mut dispatch = Dispatch::default();
        match self.run(input, &mut dispatch.messages).await {
            Ok(outcome) => dispatch.outcome = Some(outcome),
            Err(e) => {
                tracing::warn!("{} on {} failed: {}", input.action, input.service, e);
                dispatch.errors.push(e);
            }
        }
        dispatch
    }

    /// Run an action given by name, as received from a host.
    pub async fn dispatch_named(
        &self,
        action: &str,
        service: impl Into<ServiceId>,
        owner: Option<OwnerId>,
        params: BTreeMap<String, String>,
    ) -> Dispatch {
        match action.parse::<Action>() {
            Ok(action) => {
                let mut input = InboundRequest::new(action, service).with_owner(owner);
                input.params = params;
                self.dispatch(&input).await
            }
            Err(e) => Dispatch::failed(e.into()),
        }
    }

    async fn run(
        &self,
        input: &InboundRequest,
        messages: &mut Vec<String>,
    ) -> Result<DispatchOutcome, KeywardError> {
        let service = self.service(&input.service)?;

        let action = input.action.nonce_action();
        match input.param("kr_nonce") {
            Some(nonce) if self.nonces.verify(nonce, &action, input.owner.as_ref()) => {}
            _ => return Err(KeywardError::InvalidNonce { action }),
        }

        let ctx = self.context();
        match input.action {
            Action::Request => {
                let step = service.request_token(ctx, input).await?;
                Ok(outcome_for(step))
            }
            Action::Verify => {
                let step = service.verify_token(ctx, input).await?;
                if let FlowStep::Verified { token, .. } = &step {
                    messages.push(format!(
                        "Connected {} as {}",
                        service.label(),
                        service.get_display(token)
                    ));
                }
                Ok(outcome_for(step))
            }
            Action::Created => {
                let token = self.access_token(input).await?;
                let display = service.get_display(&token);
                let id = token.unique_id.unwrap_or_else(|| TokenId::new(""));
                messages.push(format!("{} connection {} is ready", service.label(), display));
                Ok(DispatchOutcome::Created { id, display })
            }
            Action::Delete => {
                let token = self.access_token(input).await?;
                let Some(id) = token.unique_id.clone() else {
                    return Err(StoreError::MissingId {
                        service: input.service.to_string(),
                    }
                    .into());
                };
                self.store.delete(&TokenSelector::by_id(id.clone())).await?;
                self.events
                    .connection_deleted(&input.service, &id, token.owner.as_ref())
                    .await;
                messages.push(format!(
                    "Removed {} connection {}",
                    service.label(),
                    service.get_display(&token)
                ));
                Ok(DispatchOutcome::Deleted { id })
            }
            Action::Manage => {
                if !service.is_configured() {
                    messages.push(format!("{} is not configured", service.label()));
                }
                let connections = self
                    .connections(&input.service, input.owner.as_ref())
                    .await?;
                Ok(DispatchOutcome::Manage { connections })
            }
        }
    }

    /// The access token named by the `id` parameter, scoped to the caller.
    async fn access_token(&self, input: &InboundRequest) -> Result<Token, KeywardError> {
        let Some(id) = input.param("id") else {
            return Err(KeywardError::MissingToken {
                service: input.service.to_string(),
            });
        };
        let selector = TokenSelector::by_id(id)
            .kind(TokenKind::Access)
            .service(input.service.clone())
            .owner(input.owner.clone());
        self.store
            .get_token(&selector)
            .await?
            .ok_or_else(|| KeywardError::MissingToken {
                service: input.service.to_string(),
            })
    }

    /// Bind a stored token to its service.
    pub fn session(&self, token: Token) -> Result<Session<'_>, KeywardError> {
        let service = self.service(&token.service)?;
        Ok(Session::new(service.as_ref(), self.context()).with_token(token))
    }

    /// An unbound session, for services that allow anonymous calls.
    pub fn anonymous(&self, service: &ServiceId) -> Result<Session<'_>, KeywardError> {
        let service = self.service(service)?;
        Ok(Session::new(service.as_ref(), self.context()))
    }

    /// Load an access token by id and bind it.
    pub async fn connection(&self, id: impl Into<TokenId>) -> Result<Session<'_>, KeywardError> {
        let id = id.into();
        let token = self
            .store
            .get_token(&TokenSelector::by_id(id.clone()).kind(TokenKind::Access))
            .await?
            .ok_or_else(|| StoreError::NotFound {
                key: id.to_string(),
            })?;
        self.session(token)
    }

    /// Access tokens of a service, optionally scoped to an owner.
    pub async fn connections(
        &self,
        service: &ServiceId,
        owner: Option<&OwnerId>,
    ) -> Result<Vec<ConnectionSummary>, KeywardError> {
        let handler = self.service(service)?;
        let selector = TokenSelector::new()
            .kind(TokenKind::Access)
            .service(service.clone())
            .owner(owner.cloned());
        let tokens = self.store.get_tokens(&selector).await?;
        Ok(tokens
            .iter()
            .filter_map(|t| ConnectionSummary::new(handler.as_ref(), t))
            .collect())
    }

    /// Delete request tokens older than `max_age`.
    ///
    /// Handshakes abandoned before their callback leave a request token
    /// behind. Returns the number of tokens deleted.
    pub async fn prune_request_tokens(&self, max_age: Duration) -> Result<usize, KeywardError> {
        let cutoff = Utc::now() - max_age;
        let stale = self
            .store
            .get_tokens(&TokenSelector::new().kind(TokenKind::Request))
            .await?
            .into_iter()
            .filter(|t| t.created_at < cutoff)
            .filter_map(|t| t.unique_id);

        let mut pruned = 0;
        for id in stale {
            let selector = TokenSelector::by_id(id.clone()).kind(TokenKind::Request);
            if self.store.delete(&selector).await? {
                pruned += 1;
            } else {
                tracing::warn!("Request token {} vanished before pruning", id);
            }
        }

        if pruned > 0 {
            tracing::info!("Pruned {} abandoned request tokens", pruned);
        }
        Ok(pruned)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

fn outcome_for(step: FlowStep) -> DispatchOutcome {
    match step {
        FlowStep::Redirect { location } => DispatchOutcome::Redirect { location },
        FlowStep::Form { submit_to } => DispatchOutcome::Form { submit_to },
        FlowStep::Verified { token, redirect } => DispatchOutcome::Verified {
            id: token.unique_id.unwrap_or_else(|| TokenId::new("")),
            redirect,
        },
    }
}
