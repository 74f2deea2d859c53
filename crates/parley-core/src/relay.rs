//! Relay capability: the transport and key directory the subsystem talks to.
//!
//! Injected into `E2eeContext` at construction. `HttpRelayClient` is the real
//! implementation; `harness::InMemoryRelay` is the in-process one used by tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use parley_crypto::EncryptedMessageEnvelope;

use crate::policy::ConversationEncryptionState;
use crate::types::{ConversationId, RelayMessage, SessionKeyEnvelope, UserId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay unreachable: {0}")]
    Network(String),

    #[error("relay call timed out")]
    Timeout,

    /// 403. For encryption toggles the server names the owner.
    #[error("forbidden by relay")]
    Forbidden { owner: Option<UserId> },

    /// 409 on key registration.
    #[error("public key already registered")]
    AlreadyRegistered,

    #[error("not authenticated with relay")]
    Unauthenticated,

    #[error("relay rejected request: status={status} body={body}")]
    Rejected { status: u16, body: String },

    #[error("bad response from relay: {0}")]
    BadResponse(String),
}

impl RelayError {
    /// True for failures a caller may queue and retry.
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::Network(_) | RelayError::Timeout => true,
            RelayError::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[async_trait]
pub trait Relay: Send + Sync {
    /// Publish this user's identity public key (Base64).
    async fn register_public_key(&self, public_key_b64: &str) -> Result<(), RelayError>;

    /// Look up another user's public key. `Ok(None)` when they have not registered one.
    async fn get_public_key(&self, user_id: &UserId) -> Result<Option<String>, RelayError>;

    /// Push a full wrapped-key batch for a conversation in one call.
    async fn distribute_session_key(
        &self,
        conversation_id: &ConversationId,
        envelopes: &[SessionKeyEnvelope],
    ) -> Result<(), RelayError>;

    /// The wrapped key addressed to the caller. `Ok(None)` when none exists yet.
    async fn get_session_key_envelope(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<String>, RelayError>;

    async fn send_encrypted_message(
        &self,
        conversation_id: &ConversationId,
        envelope: &EncryptedMessageEnvelope,
    ) -> Result<(), RelayError>;

    async fn get_encrypted_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<RelayMessage>, RelayError>;

    /// Ask the server to enable or disable encryption. The server is
    /// authoritative on ownership: a disable by anyone but the owner is
    /// `Forbidden { owner }`.
    async fn set_conversation_encryption(
        &self,
        conversation_id: &ConversationId,
        enabled: bool,
        requester: &UserId,
    ) -> Result<ConversationEncryptionState, RelayError>;
}

// ============================================================================
// TimeoutRelay
// ============================================================================

/// Bounds every call on the wrapped relay, turning a hang into `RelayError::Timeout`.
pub struct TimeoutRelay {
    inner: Arc<dyn Relay>,
    timeout: Duration,
}

impl TimeoutRelay {
    pub fn new(inner: Arc<dyn Relay>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, RelayError>>,
    ) -> Result<T, RelayError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res,
            Err(_) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "relay call timed out");
                Err(RelayError::Timeout)
            }
        }
    }
}

#[async_trait]
impl Relay for TimeoutRelay {
    async fn register_public_key(&self, public_key_b64: &str) -> Result<(), RelayError> {
        self.bounded(self.inner.register_public_key(public_key_b64)).await
    }

    async fn get_public_key(&self, user_id: &UserId) -> Result<Option<String>, RelayError> {
        self.bounded(self.inner.get_public_key(user_id)).await
    }

    async fn distribute_session_key(
        &self,
        conversation_id: &ConversationId,
        envelopes: &[SessionKeyEnvelope],
    ) -> Result<(), RelayError> {
        self.bounded(self.inner.distribute_session_key(conversation_id, envelopes))
            .await
    }

    async fn get_session_key_envelope(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<String>, RelayError> {
        self.bounded(self.inner.get_session_key_envelope(conversation_id))
            .await
    }

    async fn send_encrypted_message(
        &self,
        conversation_id: &ConversationId,
        envelope: &EncryptedMessageEnvelope,
    ) -> Result<(), RelayError> {
        self.bounded(self.inner.send_encrypted_message(conversation_id, envelope))
            .await
    }

    async fn get_encrypted_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<RelayMessage>, RelayError> {
        self.bounded(self.inner.get_encrypted_messages(conversation_id))
            .await
    }

    async fn set_conversation_encryption(
        &self,
        conversation_id: &ConversationId,
        enabled: bool,
        requester: &UserId,
    ) -> Result<ConversationEncryptionState, RelayError> {
        self.bounded(
            self.inner
                .set_conversation_encryption(conversation_id, enabled, requester),
        )
        .await
    }
}
