//! In-process relay and clock for tests.
//!
//! `InMemoryRelay` plays the server: one shared instance, many clients bound
//! to a user id. It enforces the same rules the real relay does, including
//! owner-only disable, so integration tests exercise the authoritative path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use parley_crypto::{EncryptedMessageEnvelope, KdfParams};

use crate::clock::{Clock, SystemClock};
use crate::context::{ContextOptions, E2eeContext};
use crate::errors::E2eeError;
use crate::policy::{ConversationEncryptionState, EncryptionPolicy, PolicyError};
use crate::relay::{Relay, RelayError};
use crate::store::SecretStore;
use crate::types::{ConversationId, EncryptionStateEvent, RelayMessage, SessionKeyEnvelope, UserId};

// ============================================================================
// ManualClock
// ============================================================================

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(1_700_000_000_000)
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ============================================================================
// InMemoryRelay
// ============================================================================

#[derive(Default)]
struct ServerState {
    offline: bool,
    latency: Duration,
    public_keys: HashMap<UserId, String>,
    envelopes: HashMap<ConversationId, HashMap<UserId, String>>,
    distributions: HashMap<ConversationId, usize>,
    messages: HashMap<ConversationId, Vec<RelayMessage>>,
    encryption: EncryptionPolicy,
    events: Vec<EncryptionStateEvent>,
    last_sent_at: i64,
}

/// Shared relay server. Clones refer to the same server.
#[derive(Clone)]
pub struct InMemoryRelay {
    state: Arc<Mutex<ServerState>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Server whose timestamps come from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState::default())),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A connection authenticated as `user`.
    pub fn client(&self, user: &str) -> InMemoryRelayClient {
        InMemoryRelayClient {
            server: self.clone(),
            user: UserId::new(user),
        }
    }

    /// A context for `user` wired to this server, with cheap KDF parameters.
    pub fn context(
        &self,
        user: &str,
        store: Arc<dyn SecretStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<E2eeContext, E2eeError> {
        let options = ContextOptions {
            kdf: KdfParams::for_tests(),
            relay_timeout: Duration::from_secs(5),
            clock,
        };
        E2eeContext::new(UserId::new(user), Arc::new(self.client(user)), store, options)
    }

    /// Every call fails with `RelayError::Network` while set.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Delay applied before every call.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn public_key_of(&self, user: &str) -> Option<String> {
        self.lock().public_keys.get(&UserId::new(user)).cloned()
    }

    /// Recipients holding an envelope for the conversation.
    pub fn envelope_count(&self, conversation_id: &ConversationId) -> usize {
        self.lock()
            .envelopes
            .get(conversation_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Accepted distribution batches for the conversation.
    pub fn distribution_count(&self, conversation_id: &ConversationId) -> usize {
        self.lock()
            .distributions
            .get(conversation_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn message_count(&self, conversation_id: &ConversationId) -> usize {
        self.lock()
            .messages
            .get(conversation_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Authoritative encryption state.
    pub fn encryption_state(&self, conversation_id: &ConversationId) -> ConversationEncryptionState {
        self.lock().encryption.get_or_default(conversation_id)
    }

    /// `encryption_state_changed` pushes not yet delivered, oldest first.
    pub fn drain_events(&self) -> Vec<EncryptionStateEvent> {
        std::mem::take(&mut self.lock().events)
    }

    async fn enter(&self) -> Result<(), RelayError> {
        let latency = {
            let state = self.lock();
            if state.offline {
                return Err(RelayError::Network("connection refused".into()));
            }
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

/// One user's authenticated connection to an `InMemoryRelay`.
#[derive(Clone)]
pub struct InMemoryRelayClient {
    server: InMemoryRelay,
    user: UserId,
}

impl InMemoryRelayClient {
    pub fn user_id(&self) -> &UserId {
        &self.user
    }
}

#[async_trait]
impl Relay for InMemoryRelayClient {
    async fn register_public_key(&self, public_key_b64: &str) -> Result<(), RelayError> {
        self.server.enter().await?;
        let mut state = self.server.lock();
        if state.public_keys.get(&self.user).map(String::as_str) == Some(public_key_b64) {
            return Err(RelayError::AlreadyRegistered);
        }
        state
            .public_keys
            .insert(self.user.clone(), public_key_b64.to_string());
        Ok(())
    }

    async fn get_public_key(&self, user_id: &UserId) -> Result<Option<String>, RelayError> {
        self.server.enter().await?;
        Ok(self.server.lock().public_keys.get(user_id).cloned())
    }

    async fn distribute_session_key(
        &self,
        conversation_id: &ConversationId,
        envelopes: &[SessionKeyEnvelope],
    ) -> Result<(), RelayError> {
        self.server.enter().await?;
        if envelopes.is_empty() {
            return Err(RelayError::Rejected {
                status: 400,
                body: "empty envelope batch".into(),
            });
        }
        let mut state = self.server.lock();
        let stored = state.envelopes.entry(conversation_id.clone()).or_default();
        for env in envelopes {
            stored.insert(env.recipient_id.clone(), env.encrypted_key.clone());
        }
        *state.distributions.entry(conversation_id.clone()).or_default() += 1;
        Ok(())
    }

    async fn get_session_key_envelope(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<String>, RelayError> {
        self.server.enter().await?;
        Ok(self
            .server
            .lock()
            .envelopes
            .get(conversation_id)
            .and_then(|m| m.get(&self.user))
            .cloned())
    }

    async fn send_encrypted_message(
        &self,
        conversation_id: &ConversationId,
        envelope: &EncryptedMessageEnvelope,
    ) -> Result<(), RelayError> {
        self.server.enter().await?;
        let now = self.server.clock.now_millis();
        let mut state = self.server.lock();
        let sent_at = now.max(state.last_sent_at + 1);
        state.last_sent_at = sent_at;
        state
            .messages
            .entry(conversation_id.clone())
            .or_default()
            .push(RelayMessage {
                sender_id: self.user.clone(),
                sent_at,
                envelope: envelope.clone(),
            });
        Ok(())
    }

    async fn get_encrypted_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<RelayMessage>, RelayError> {
        self.server.enter().await?;
        Ok(self
            .server
            .lock()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_conversation_encryption(
        &self,
        conversation_id: &ConversationId,
        enabled: bool,
        requester: &UserId,
    ) -> Result<ConversationEncryptionState, RelayError> {
        self.server.enter().await?;
        if *requester != self.user {
            return Err(RelayError::Unauthenticated);
        }

        let now = self.server.clock.now_millis();
        let mut state = self.server.lock();
        let transition = if enabled {
            state.encryption.enable(conversation_id, requester, now)
        } else {
            state
                .encryption
                .disable(conversation_id, requester, now)
                .map_err(|e| match e {
                    PolicyError::Unauthorized { owner } => RelayError::Forbidden { owner: Some(owner) },
                    PolicyError::InvalidState(msg) => RelayError::Rejected { status: 400, body: msg },
                })?
        };

        if transition.changed {
            let next = &transition.state;
            state.events.push(EncryptionStateEvent {
                conversation_id: conversation_id.clone(),
                enabled: next.is_enabled(),
                enabled_by: next.owner().cloned(),
                timestamp: next.timestamp,
            });
        }
        Ok(transition.state)
    }
}

// ============================================================================
// Scenario
// ============================================================================

/// Two-party DM flow over a fresh relay: `alice` enables encryption, `bob`
/// receives the push and sends `text`, `alice` reads the conversation back.
pub async fn run_dm_flow(
    conversation_id: &ConversationId,
    text: &str,
) -> Result<Vec<crate::context::ReceivedMessage>, E2eeError> {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
    let server = InMemoryRelay::with_clock(clock.clone());
    let alice = server.context("alice", Arc::new(crate::store::MemoryStore::new()), clock.clone())?;
    let bob = server.context("bob", Arc::new(crate::store::MemoryStore::new()), clock)?;
    alice.init().await?;
    bob.init().await?;

    let members = [UserId::new("alice"), UserId::new("bob")];
    alice.enable_conversation(conversation_id, &members).await?;
    for event in server.drain_events() {
        bob.apply_remote_state(&event).await;
    }
    bob.send_message(conversation_id, text, &members).await?;
    alice.fetch_messages(conversation_id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv() -> ConversationId {
        ConversationId::new("dm1")
    }

    #[tokio::test]
    async fn server_enforces_owner_only_disable() {
        let server = InMemoryRelay::new();
        let alice = server.client("alice");
        let bob = server.client("bob");

        let state = alice
            .set_conversation_encryption(&conv(), true, &UserId::new("alice"))
            .await
            .unwrap();
        assert_eq!(state.owner(), Some(&UserId::new("alice")));

        let err = bob
            .set_conversation_encryption(&conv(), false, &UserId::new("bob"))
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Forbidden { owner: Some(UserId::new("alice")) });

        // Cannot act on behalf of someone else.
        let err = bob
            .set_conversation_encryption(&conv(), false, &UserId::new("alice"))
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Unauthenticated);

        let state = alice
            .set_conversation_encryption(&conv(), false, &UserId::new("alice"))
            .await
            .unwrap();
        assert!(!state.is_enabled());
        assert_eq!(server.drain_events().len(), 2);
        assert!(server.drain_events().is_empty());
    }

    #[tokio::test]
    async fn server_timestamps_follow_clock_and_stay_monotonic() {
        let clock = Arc::new(ManualClock::new(1_000));
        let server = InMemoryRelay::with_clock(clock.clone());
        let alice = server.client("alice");
        let me = UserId::new("alice");

        let on = alice.set_conversation_encryption(&conv(), true, &me).await.unwrap();
        assert_eq!(on.timestamp, 1_000);
        // Clock did not move; the next transition still orders after.
        let off = alice.set_conversation_encryption(&conv(), false, &me).await.unwrap();
        assert_eq!(off.timestamp, 1_001);
        clock.advance(500);
        let on = alice.set_conversation_encryption(&conv(), true, &me).await.unwrap();
        assert_eq!(on.timestamp, 1_500);
    }

    #[tokio::test]
    async fn register_same_key_conflicts_new_key_replaces() {
        let server = InMemoryRelay::new();
        let alice = server.client("alice");
        alice.register_public_key("AAAA").await.unwrap();
        assert_eq!(
            alice.register_public_key("AAAA").await.unwrap_err(),
            RelayError::AlreadyRegistered
        );
        alice.register_public_key("BBBB").await.unwrap();
        assert_eq!(server.public_key_of("alice").as_deref(), Some("BBBB"));
    }

    #[tokio::test]
    async fn envelopes_are_per_recipient_upserts() {
        let server = InMemoryRelay::new();
        let alice = server.client("alice");
        let bob = server.client("bob");
        let batch = |key: &str| {
            vec![
                SessionKeyEnvelope { recipient_id: "alice".into(), encrypted_key: format!("{key}-a") },
                SessionKeyEnvelope { recipient_id: "bob".into(), encrypted_key: format!("{key}-b") },
            ]
        };

        alice.distribute_session_key(&conv(), &batch("k1")).await.unwrap();
        alice.distribute_session_key(&conv(), &batch("k2")).await.unwrap();
        assert_eq!(server.envelope_count(&conv()), 2);
        assert_eq!(server.distribution_count(&conv()), 2);
        assert_eq!(
            bob.get_session_key_envelope(&conv()).await.unwrap().as_deref(),
            Some("k2-b")
        );
        assert!(server
            .client("carol")
            .get_session_key_envelope(&conv())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn offline_fails_every_call() {
        let server = InMemoryRelay::new();
        server.set_offline(true);
        let err = server
            .client("alice")
            .get_encrypted_messages(&conv())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Network(_)));
    }
}
