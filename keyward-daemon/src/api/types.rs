//! API request/response types for the daemon JSON-RPC interface.

use keyward_core::{ConnectionSummary, Dispatch, DispatchOutcome, KeywardError, Service};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A registered service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Service identifier (e.g., "twitter", "google")
    pub name: String,
    /// Human-readable label
    pub label: String,
    /// Protocol engine: "oauth1", "oauth2" or "basic"
    pub flow: String,
    /// Whether application credentials are present
    pub configured: bool,
}

impl ServiceInfo {
    pub fn from_service(service: &dyn Service) -> Self {
        Self {
            name: service.name().to_string(),
            label: service.label().to_string(),
            flow: service.config().flow.to_string(),
            configured: service.is_configured(),
        }
    }
}

/// Response listing the registered services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListServicesResponse {
    pub services: Vec<ServiceInfo>,
}

/// Response carrying a URL that starts a handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestUrlResponse {
    pub url: String,
}

/// Response carrying a freshly minted nonce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceResponse {
    pub nonce: String,
}

/// A failure reported by a dispatched action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable kind (e.g., "invalid_nonce")
    pub kind: String,
    /// Human-readable description
    pub message: String,
}

impl From<&KeywardError> for ErrorInfo {
    fn from(error: &KeywardError) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result of a dispatched action.
///
/// A non-empty `errors` means the action did not happen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub outcome: Option<DispatchOutcome>,
    pub errors: Vec<ErrorInfo>,
    pub messages: Vec<String>,
}

impl From<Dispatch> for DispatchResponse {
    fn from(dispatch: Dispatch) -> Self {
        Self {
            errors: dispatch.errors.iter().map(ErrorInfo::from).collect(),
            outcome: dispatch.outcome,
            messages: dispatch.messages,
        }
    }
}

/// A stored connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub service: String,
    pub display: String,
    pub owner: Option<String>,
    /// Creation timestamp (RFC 3339)
    pub created_at: String,
    /// Expiry timestamp (RFC 3339), if the token expires
    pub expires_at: Option<String>,
    pub meta: BTreeMap<String, String>,
}

impl From<ConnectionSummary> for ConnectionInfo {
    fn from(summary: ConnectionSummary) -> Self {
        Self {
            id: summary.id.to_string(),
            service: summary.service.to_string(),
            display: summary.display,
            owner: summary.owner.map(|o| o.to_string()),
            created_at: summary.created_at.to_rfc3339(),
            expires_at: summary.expires_at.map(|dt| dt.to_rfc3339()),
            meta: summary.meta,
        }
    }
}

/// Response listing the connections of a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListConnectionsResponse {
    pub connections: Vec<ConnectionInfo>,
}

/// Response after pruning abandoned handshakes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneResponse {
    /// Number of request tokens deleted
    pub pruned: usize,
}

/// Response after probing a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConnectionResponse {
    pub message: String,
}
