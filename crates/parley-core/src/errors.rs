//! Error taxonomy surfaced to callers of `E2eeContext`.
//!
//! Each layer keeps its own `thiserror` enum; everything converges here so
//! callers can decide per variant whether to block, warn, retry or show a
//! placeholder.

use thiserror::Error;

use crate::config::ConfigError;
use crate::identity_store::IdentityStoreError;
use crate::policy::PolicyError;
use crate::relay::RelayError;
use crate::session_keys::SessionKeyError;
use crate::store::StoreError;
use crate::types::{ConversationId, UserId};
use parley_crypto::{MessageError, VaultError};

/// How bad an error is for the subsystem as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Nothing can be encrypted until the cause is fixed.
    Fatal,
    /// Works for this session only; state may be lost on exit.
    Degraded,
    /// The user or caller can act and try again.
    Recoverable,
    /// Affects a single message; the conversation stays usable.
    PerMessage,
}

#[derive(Debug, Error)]
pub enum E2eeError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),

    /// Wrong recovery code, corrupted or mismatched backup.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    /// No session key could be obtained. Never falls back to plaintext.
    #[error("session key unavailable for conversation {0}")]
    KeyUnavailable(ConversationId),

    #[error("encryption is owned by {}; only they may disable it", owner_name(.owner))]
    Unauthorized { owner: Option<UserId> },

    #[error("relay failure: {0}")]
    Network(RelayError),

    #[error("E2EE is not initialized")]
    NotInitialized,

    #[error("configuration error: {0}")]
    Config(String),
}

fn owner_name(owner: &Option<UserId>) -> &str {
    owner.as_ref().map(|o| o.as_str()).unwrap_or("another participant")
}

impl E2eeError {
    pub fn severity(&self) -> Severity {
        match self {
            E2eeError::KeyGeneration(_) | E2eeError::NotInitialized | E2eeError::Config(_) => Severity::Fatal,
            E2eeError::Persistence(_) => Severity::Degraded,
            E2eeError::Authentication(_)
            | E2eeError::KeyUnavailable(_)
            | E2eeError::Unauthorized { .. }
            | E2eeError::Network(_) => Severity::Recoverable,
            E2eeError::Decryption(_) => Severity::PerMessage,
        }
    }

    /// True when retrying the same call later may succeed. The subsystem
    /// never retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            E2eeError::Network(e) => e.is_transient(),
            E2eeError::Persistence(_) | E2eeError::KeyUnavailable(_) => true,
            _ => false,
        }
    }
}

impl From<RelayError> for E2eeError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Forbidden { owner } => E2eeError::Unauthorized { owner },
            other => E2eeError::Network(other),
        }
    }
}

impl From<PolicyError> for E2eeError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::Unauthorized { owner } => E2eeError::Unauthorized { owner: Some(owner) },
            PolicyError::InvalidState(msg) => E2eeError::Network(RelayError::BadResponse(msg)),
        }
    }
}

impl From<VaultError> for E2eeError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::InvalidParams(msg) => E2eeError::Config(msg),
            VaultError::RngError | VaultError::EncryptionFailed => E2eeError::KeyGeneration(e.to_string()),
            other => E2eeError::Authentication(other.to_string()),
        }
    }
}

impl From<IdentityStoreError> for E2eeError {
    fn from(e: IdentityStoreError) -> Self {
        match e {
            IdentityStoreError::NotInitialized => E2eeError::NotInitialized,
            IdentityStoreError::Generation(msg) => E2eeError::KeyGeneration(msg),
            IdentityStoreError::Store(e) => E2eeError::Persistence(e),
            IdentityStoreError::Relay(e) => e.into(),
            IdentityStoreError::Vault(e) => e.into(),
            IdentityStoreError::RecoveryRequired
            | IdentityStoreError::NoBackup
            | IdentityStoreError::KeyMismatch
            | IdentityStoreError::InvalidRecoveryCode(_)
            | IdentityStoreError::InvalidKey(_) => E2eeError::Authentication(e.to_string()),
        }
    }
}

impl From<SessionKeyError> for E2eeError {
    fn from(e: SessionKeyError) -> Self {
        match e {
            SessionKeyError::KeyGeneration(e) => E2eeError::KeyGeneration(e.to_string()),
            SessionKeyError::Relay(e) => e.into(),
            SessionKeyError::Store(e) => E2eeError::Persistence(e),
            SessionKeyError::Unavailable(conv) => E2eeError::KeyUnavailable(conv),
            SessionKeyError::Wrap(e) | SessionKeyError::Unwrap(e) => E2eeError::Decryption(e.to_string()),
        }
    }
}

impl From<MessageError> for E2eeError {
    fn from(e: MessageError) -> Self {
        match e {
            MessageError::RngError | MessageError::EncryptionFailed => E2eeError::KeyGeneration(e.to_string()),
            other => E2eeError::Decryption(other.to_string()),
        }
    }
}

impl From<ConfigError> for E2eeError {
    fn from(e: ConfigError) -> Self {
        E2eeError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_maps_to_unauthorized_with_owner() {
        let e: E2eeError = RelayError::Forbidden {
            owner: Some(UserId::new("alice")),
        }
        .into();
        assert!(matches!(&e, E2eeError::Unauthorized { owner: Some(o) } if o.as_str() == "alice"));
        assert!(e.to_string().contains("alice"));
        assert_eq!(e.severity(), Severity::Recoverable);
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_policy_unauthorized_maps() {
        let e: E2eeError = PolicyError::Unauthorized { owner: UserId::new("alice") }.into();
        assert!(matches!(e, E2eeError::Unauthorized { owner: Some(_) }));
    }

    #[test]
    fn test_network_is_retryable() {
        let e: E2eeError = RelayError::Timeout.into();
        assert!(e.is_retryable());
        assert_eq!(e.severity(), Severity::Recoverable);
    }

    #[test]
    fn test_wrong_code_is_authentication() {
        let e: E2eeError = IdentityStoreError::Vault(VaultError::AuthenticationFailed).into();
        assert!(matches!(e, E2eeError::Authentication(_)));
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_severities() {
        assert_eq!(E2eeError::KeyGeneration("rng".into()).severity(), Severity::Fatal);
        assert_eq!(
            E2eeError::Persistence(StoreError::OperationFailed("disk full".into())).severity(),
            Severity::Degraded
        );
        assert_eq!(E2eeError::Decryption("tag".into()).severity(), Severity::PerMessage);
        assert_eq!(
            E2eeError::KeyUnavailable(ConversationId::new("dm1")).severity(),
            Severity::Recoverable
        );
    }

    #[test]
    fn test_message_errors_map_to_decryption() {
        let e: E2eeError = MessageError::AuthenticationFailed.into();
        assert!(matches!(e, E2eeError::Decryption(_)));
    }
}
