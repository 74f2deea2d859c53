//! Identifiers and relay wire records.

use std::fmt;

use serde::{Deserialize, Serialize};

use parley_crypto::EncryptedMessageEnvelope;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Opaque conversation (channel / DM) identifier assigned by the chat server.
    ConversationId
);
string_id!(
    /// Opaque user identifier assigned by the chat server.
    UserId
);

/// A session key wrapped for one recipient. A distribution batch is a list of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKeyEnvelope {
    pub recipient_id: UserId,
    /// Base64 of the wrapped key.
    pub encrypted_key: String,
}

/// An encrypted message as stored and returned by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    pub sender_id: UserId,
    /// Unix milliseconds, assigned by the relay.
    pub sent_at: i64,
    pub envelope: EncryptedMessageEnvelope,
}

/// `encryption_state_changed` notification pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionStateEvent {
    pub conversation_id: ConversationId,
    pub enabled: bool,
    pub enabled_by: Option<UserId>,
    pub timestamp: i64,
}

/// Portable identity backup: everything another device needs, given the recovery code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyBackup {
    pub public_key: String,
    pub encrypted_private_key: String,
}
