//! Transport-provider and tenant-resolution ports.
//!
//! The wire-level client lives in the embedding application; the engine
//! only sees a synchronous accept/reject per send. Delivery confirmation
//! always arrives later through the webhook path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Synchronous outcome of handing a message to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendOutcome {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn accepted(provider_message_id: impl Into<String>) -> Self {
        Self {
            accepted: true,
            provider_message_id: Some(provider_message_id.into()),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            accepted: false,
            provider_message_id: None,
            error: Some(error.into()),
        }
    }
}

/// Transport client failure (the client itself errored rather than the
/// provider rejecting the send). Treated as transient by the engine.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport client failure: {0}")]
    Client(String),
}

/// Performs the actual network send.
#[async_trait]
pub trait TransportClient: Send + Sync {
    async fn send(
        &self,
        tenant_id: &str,
        phone: &str,
        body: &str,
    ) -> Result<SendOutcome, TransportError>;
}

/// Resolves which tenant owns an inbound destination number, for opt-out
/// attribution.
#[async_trait]
pub trait TenantResolver: Send + Sync {
    async fn tenant_for_destination(&self, to_phone: &str) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_constructors() {
        let ok = SendOutcome::accepted("SM1");
        assert!(ok.accepted);
        assert_eq!(ok.provider_message_id.as_deref(), Some("SM1"));
        let bad = SendOutcome::rejected("invalid number");
        assert!(!bad.accepted);
        assert_eq!(bad.error.as_deref(), Some("invalid number"));
    }
}
