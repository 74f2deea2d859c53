//! Parley Core - the end-to-end encryption subsystem.
//!
//! This crate implements:
//! - Identity key lifecycle with recovery-code backup
//! - Per-conversation session key creation, distribution and caching
//! - The conversation encryption policy (who may enable/disable, last-write-wins sync)
//! - Local secret storage
//! - The relay capability and its HTTP client
//! - `E2eeContext`, the explicit object callers hold instead of global managers

#![forbid(unsafe_code)]

// Subsystem components
pub mod identity_store;
pub mod session_keys;
pub mod policy;
pub mod context;

// Infrastructure
pub mod store;
pub mod relay;
pub mod clock;
pub mod config;

// Supporting modules
pub mod errors;
pub mod types;
#[cfg(any(test, feature = "test-utils"))]
pub mod harness;

#[cfg(feature = "http-relay")]
pub mod http_relay;

#[cfg(test)]
mod proptests;

pub use config::{Config, ConfigError};
pub use context::{E2eeContext, Incoming, Outgoing, PlaceholderReason, ReceivedMessage};
pub use errors::{E2eeError, Severity};
pub use identity_store::{IdentityKeyStore, IdentityStoreError};
pub use policy::{ConversationEncryptionState, EncryptionPolicy, EncryptionStatus, PolicyError, DEFAULT_STATE};
pub use relay::{Relay, RelayError};
pub use session_keys::{SessionKeyError, SessionKeyManager};
pub use store::{FileStore, MemoryStore, SecretStore, StoreError};
pub use types::{ConversationId, UserId};
