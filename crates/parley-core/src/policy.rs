//! Conversation encryption policy.
//!
//! Per conversation: `Disabled` (initial) or `Enabled(owner)`.
//!
//! - Any participant may enable a disabled conversation and becomes its owner.
//! - Only the owner may disable. Anyone else gets `Unauthorized { owner }`.
//! - Enabling an enabled conversation is a no-op that keeps the owner;
//!   disabling a disabled one is a no-op.
//! - Remote updates merge last-write-wins on the timestamp. A tie keeps the
//!   local state so two devices never oscillate.
//!
//! Pure and synchronous; persistence and relay calls live in `E2eeContext`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{ConversationId, EncryptionStateEvent, UserId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("only {owner} may disable encryption for this conversation")]
    Unauthorized { owner: UserId },

    #[error("invalid encryption state: {0}")]
    InvalidState(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionStatus {
    Disabled,
    Enabled { owner: UserId },
}

/// Encryption state of one conversation.
///
/// Serialized as `{ enabled, enabledBy, timestamp }`; an enabled state
/// without an owner is rejected on the way in, and a disabled state never
/// carries one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StateRecord", into = "StateRecord")]
pub struct ConversationEncryptionState {
    pub status: EncryptionStatus,
    /// Unix milliseconds of the transition that produced this state.
    pub timestamp: i64,
}

/// State of every conversation never observed before.
pub const DEFAULT_STATE: ConversationEncryptionState = ConversationEncryptionState {
    status: EncryptionStatus::Disabled,
    timestamp: 0,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateRecord {
    enabled: bool,
    #[serde(default)]
    enabled_by: Option<UserId>,
    #[serde(default)]
    timestamp: i64,
}

impl TryFrom<StateRecord> for ConversationEncryptionState {
    type Error = PolicyError;

    fn try_from(r: StateRecord) -> Result<Self, Self::Error> {
        ConversationEncryptionState::from_parts(r.enabled, r.enabled_by, r.timestamp)
    }
}

impl From<ConversationEncryptionState> for StateRecord {
    fn from(s: ConversationEncryptionState) -> Self {
        let enabled = s.is_enabled();
        let timestamp = s.timestamp;
        let enabled_by = match s.status {
            EncryptionStatus::Enabled { owner } => Some(owner),
            EncryptionStatus::Disabled => None,
        };
        StateRecord {
            enabled,
            enabled_by,
            timestamp,
        }
    }
}

impl ConversationEncryptionState {
    pub fn enabled(owner: UserId, timestamp: i64) -> Self {
        Self {
            status: EncryptionStatus::Enabled { owner },
            timestamp,
        }
    }

    pub fn disabled(timestamp: i64) -> Self {
        Self {
            status: EncryptionStatus::Disabled,
            timestamp,
        }
    }

    /// Build from the wire triple. `enabled_by` is dropped for a disabled state.
    pub fn from_parts(
        enabled: bool,
        enabled_by: Option<UserId>,
        timestamp: i64,
    ) -> Result<Self, PolicyError> {
        match (enabled, enabled_by) {
            (true, Some(owner)) => Ok(Self::enabled(owner, timestamp)),
            (true, None) => Err(PolicyError::InvalidState(
                "enabled without enabledBy".into(),
            )),
            (false, _) => Ok(Self::disabled(timestamp)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.status, EncryptionStatus::Enabled { .. })
    }

    pub fn owner(&self) -> Option<&UserId> {
        match &self.status {
            EncryptionStatus::Enabled { owner } => Some(owner),
            EncryptionStatus::Disabled => None,
        }
    }
}

impl TryFrom<&EncryptionStateEvent> for ConversationEncryptionState {
    type Error = PolicyError;

    fn try_from(ev: &EncryptionStateEvent) -> Result<Self, Self::Error> {
        Self::from_parts(ev.enabled, ev.enabled_by.clone(), ev.timestamp)
    }
}

/// Answer to "may this user disable encryption here?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisablePermission {
    pub allowed: bool,
    pub owner: Option<UserId>,
}

/// What the UI needs to render an encryption toggle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleCapability {
    pub can_enable: bool,
    pub can_disable: bool,
    pub owner: Option<UserId>,
}

/// Result of a transition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: ConversationEncryptionState,
    /// False when the request was a no-op or a sync was ignored.
    pub changed: bool,
}

#[derive(Debug, Default, Clone)]
pub struct EncryptionPolicy {
    states: HashMap<ConversationId, ConversationEncryptionState>,
}

impl EncryptionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state, or `DEFAULT_STATE` for a conversation never seen.
    pub fn get_or_default(&self, conversation_id: &ConversationId) -> ConversationEncryptionState {
        self.states
            .get(conversation_id)
            .cloned()
            .unwrap_or(DEFAULT_STATE)
    }

    pub fn is_encrypted(&self, conversation_id: &ConversationId) -> bool {
        self.states
            .get(conversation_id)
            .map(|s| s.is_enabled())
            .unwrap_or(false)
    }

    /// Only a disabled conversation can be enabled; enabling again would be a no-op.
    pub fn can_enable(&self, conversation_id: &ConversationId, _user_id: &UserId) -> bool {
        !self.is_encrypted(conversation_id)
    }

    pub fn can_disable(&self, conversation_id: &ConversationId, user_id: &UserId) -> DisablePermission {
        let state = self.get_or_default(conversation_id);
        let owner = state.owner().cloned();
        DisablePermission {
            allowed: owner.as_ref() == Some(user_id),
            owner,
        }
    }

    pub fn can_toggle(&self, conversation_id: &ConversationId, user_id: &UserId) -> ToggleCapability {
        let disable = self.can_disable(conversation_id, user_id);
        ToggleCapability {
            can_enable: self.can_enable(conversation_id, user_id),
            can_disable: disable.allowed,
            owner: disable.owner,
        }
    }

    /// Local transitions always order after the state they replace.
    fn stamp(current: &ConversationEncryptionState, now: i64) -> i64 {
        now.max(current.timestamp.saturating_add(1))
    }

    /// `Disabled -> Enabled(user)`. Already enabled: no-op, owner kept.
    pub fn enable(&mut self, conversation_id: &ConversationId, user_id: &UserId, now: i64) -> Transition {
        let current = self.get_or_default(conversation_id);
        if current.is_enabled() {
            debug!(conversation_id = %conversation_id, "enable ignored: already enabled");
            return Transition {
                state: current,
                changed: false,
            };
        }

        let next = ConversationEncryptionState::enabled(user_id.clone(), Self::stamp(&current, now));
        info!(conversation_id = %conversation_id, owner = %user_id, "encryption enabled");
        self.states.insert(conversation_id.clone(), next.clone());
        Transition {
            state: next,
            changed: true,
        }
    }

    /// `Enabled(user) -> Disabled`, owner only. Already disabled: no-op.
    pub fn disable(
        &mut self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        now: i64,
    ) -> Result<Transition, PolicyError> {
        let current = self.get_or_default(conversation_id);
        match current.owner() {
            None => Ok(Transition {
                state: current,
                changed: false,
            }),
            Some(owner) if owner != user_id => Err(PolicyError::Unauthorized {
                owner: owner.clone(),
            }),
            Some(_) => {
                let next = ConversationEncryptionState::disabled(Self::stamp(&current, now));
                info!(conversation_id = %conversation_id, by = %user_id, "encryption disabled");
                self.states.insert(conversation_id.clone(), next.clone());
                Ok(Transition {
                    state: next,
                    changed: true,
                })
            }
        }
    }

    /// Last-write-wins merge of a state received from a peer or the server.
    pub fn sync(
        &mut self,
        conversation_id: &ConversationId,
        remote: ConversationEncryptionState,
    ) -> Transition {
        let current = self.get_or_default(conversation_id);
        if remote.timestamp <= current.timestamp {
            debug!(
                conversation_id = %conversation_id,
                local_ts = current.timestamp,
                remote_ts = remote.timestamp,
                "ignoring stale encryption state"
            );
            return Transition {
                state: current,
                changed: false,
            };
        }

        let changed = remote.status != current.status;
        self.states.insert(conversation_id.clone(), remote.clone());
        Transition {
            state: remote,
            changed,
        }
    }

    pub fn snapshot(&self) -> HashMap<ConversationId, ConversationEncryptionState> {
        self.states.clone()
    }

    pub fn restore(&mut self, states: HashMap<ConversationId, ConversationEncryptionState>) {
        self.states = states;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv() -> ConversationId {
        ConversationId::new("dm1")
    }
    fn alice() -> UserId {
        UserId::new("alice")
    }
    fn bob() -> UserId {
        UserId::new("bob")
    }

    #[test]
    fn test_default_state() {
        let p = EncryptionPolicy::new();
        assert_eq!(p.get_or_default(&conv()), DEFAULT_STATE);
        assert!(!p.is_encrypted(&conv()));
        assert!(p.can_enable(&conv(), &alice()));
        assert_eq!(
            p.can_disable(&conv(), &alice()),
            DisablePermission { allowed: false, owner: None }
        );
    }

    #[test]
    fn test_enable_records_owner_and_time() {
        let mut p = EncryptionPolicy::new();
        let t = p.enable(&conv(), &alice(), 1_000);
        assert!(t.changed);
        assert_eq!(t.state, ConversationEncryptionState::enabled(alice(), 1_000));
        assert!(p.is_encrypted(&conv()));
    }

    #[test]
    fn test_redundant_enable_keeps_owner() {
        let mut p = EncryptionPolicy::new();
        p.enable(&conv(), &alice(), 1_000);
        let t = p.enable(&conv(), &bob(), 2_000);
        assert!(!t.changed);
        assert_eq!(t.state.owner(), Some(&alice()));
        assert_eq!(t.state.timestamp, 1_000);
        assert!(!p.can_enable(&conv(), &bob()));
    }

    #[test]
    fn test_only_owner_disables() {
        let mut p = EncryptionPolicy::new();
        p.enable(&conv(), &alice(), 1_000);

        let err = p.disable(&conv(), &bob(), 1_500).unwrap_err();
        assert_eq!(err, PolicyError::Unauthorized { owner: alice() });
        assert!(p.is_encrypted(&conv()));

        let t = p.disable(&conv(), &alice(), 2_000).unwrap();
        assert!(t.changed);
        assert_eq!(t.state, ConversationEncryptionState::disabled(2_000));
        assert_eq!(t.state.owner(), None);
    }

    #[test]
    fn test_disable_when_disabled_is_noop() {
        let mut p = EncryptionPolicy::new();
        let t = p.disable(&conv(), &bob(), 1_000).unwrap();
        assert!(!t.changed);
        assert_eq!(t.state, DEFAULT_STATE);
    }

    #[test]
    fn test_local_stamp_is_monotonic() {
        let mut p = EncryptionPolicy::new();
        p.sync(&conv(), ConversationEncryptionState::disabled(5_000));
        // Local clock behind the last remote state.
        let t = p.enable(&conv(), &alice(), 10);
        assert_eq!(t.state.timestamp, 5_001);
    }

    #[test]
    fn test_can_toggle() {
        let mut p = EncryptionPolicy::new();
        p.enable(&conv(), &alice(), 1);
        assert_eq!(
            p.can_toggle(&conv(), &alice()),
            ToggleCapability { can_enable: false, can_disable: true, owner: Some(alice()) }
        );
        assert_eq!(
            p.can_toggle(&conv(), &bob()),
            ToggleCapability { can_enable: false, can_disable: false, owner: Some(alice()) }
        );
    }

    #[test]
    fn test_sync_last_write_wins() {
        let mut p = EncryptionPolicy::new();
        p.enable(&conv(), &alice(), 1_000);

        // Older: ignored.
        let t = p.sync(&conv(), ConversationEncryptionState::disabled(999));
        assert!(!t.changed);
        assert!(p.is_encrypted(&conv()));

        // Tie: local kept.
        let t = p.sync(&conv(), ConversationEncryptionState::enabled(bob(), 1_000));
        assert!(!t.changed);
        assert_eq!(p.get_or_default(&conv()).owner(), Some(&alice()));

        // Newer: adopted.
        let t = p.sync(&conv(), ConversationEncryptionState::disabled(1_001));
        assert!(t.changed);
        assert!(!p.is_encrypted(&conv()));
    }

    #[test]
    fn test_conversations_are_independent() {
        let mut p = EncryptionPolicy::new();
        p.enable(&conv(), &alice(), 1);
        assert!(!p.is_encrypted(&ConversationId::new("dm2")));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut p = EncryptionPolicy::new();
        p.enable(&conv(), &alice(), 7);
        let snap = p.snapshot();

        let mut q = EncryptionPolicy::new();
        q.restore(snap);
        assert_eq!(q.get_or_default(&conv()), ConversationEncryptionState::enabled(alice(), 7));
    }

    #[test]
    fn test_wire_form() {
        let s = ConversationEncryptionState::enabled(alice(), 42);
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v, serde_json::json!({"enabled": true, "enabledBy": "alice", "timestamp": 42}));

        let d: ConversationEncryptionState =
            serde_json::from_value(serde_json::json!({"enabled": false, "enabledBy": "bob", "timestamp": 3}))
                .unwrap();
        assert_eq!(d, ConversationEncryptionState::disabled(3));

        let bad = serde_json::from_value::<ConversationEncryptionState>(
            serde_json::json!({"enabled": true, "enabledBy": null, "timestamp": 3}),
        );
        assert!(bad.is_err());
    }
}
