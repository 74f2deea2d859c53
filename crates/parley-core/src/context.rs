//! `E2eeContext`: the one object a chat client holds for end-to-end encryption.
//!
//! Owns the identity store, the session key manager and the conversation
//! policy for a single user. Collaborators (relay, secret store, clock) are
//! injected, so several contexts can live side by side in one process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use parley_crypto::message;
use parley_crypto::{EncryptedMessageEnvelope, IdentityKeyPair, KdfParams, PublicKey, RecoveryVault};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::errors::E2eeError;
use crate::identity_store::IdentityKeyStore;
use crate::policy::{ConversationEncryptionState, EncryptionPolicy, ToggleCapability};
use crate::relay::{Relay, TimeoutRelay};
use crate::session_keys::{SessionKeyError, SessionKeyManager};
use crate::store::{keys, SecretStore, StoreError};
use crate::types::{ConversationId, EncryptionStateEvent, KeyBackup, UserId};

/// Construction knobs for `E2eeContext`.
#[derive(Clone)]
pub struct ContextOptions {
    pub kdf: KdfParams,
    /// Bound applied to every relay call.
    pub relay_timeout: Duration,
    pub clock: Arc<dyn Clock>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            relay_timeout: Duration::from_secs(15),
            clock: Arc::new(SystemClock),
        }
    }
}

impl ContextOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            kdf: config.kdf.params(),
            relay_timeout: config.relay.timeout(),
            clock: Arc::new(SystemClock),
        }
    }
}

/// What to put on the wire for an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Conversation is not encrypted; deliver through the normal path.
    Plain(String),
    Encrypted(EncryptedMessageEnvelope),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderReason {
    /// No session key has reached this device yet.
    KeyUnavailable,
    /// Tampered, truncated or encrypted under a key we do not hold.
    DecryptionFailed,
}

/// An incoming message as it should be shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Plaintext(String),
    Placeholder(PlaceholderReason),
}

impl Incoming {
    pub fn text(&self) -> Option<&str> {
        match self {
            Incoming::Plaintext(t) => Some(t),
            Incoming::Placeholder(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub sender_id: UserId,
    pub sent_at: i64,
    pub content: Incoming,
}

pub struct E2eeContext {
    user_id: UserId,
    relay: Arc<dyn Relay>,
    store: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
    identity: IdentityKeyStore,
    session_keys: RwLock<Option<Arc<SessionKeyManager>>>,
    policy: RwLock<EncryptionPolicy>,
}

impl E2eeContext {
    pub fn new(
        user_id: UserId,
        relay: Arc<dyn Relay>,
        store: Arc<dyn SecretStore>,
        options: ContextOptions,
    ) -> Result<Self, E2eeError> {
        let vault = RecoveryVault::new(options.kdf)?;
        let relay: Arc<dyn Relay> = Arc::new(TimeoutRelay::new(relay, options.relay_timeout));
        let identity = IdentityKeyStore::new(store.clone(), relay.clone(), vault);
        Ok(Self {
            user_id,
            relay,
            store,
            clock: options.clock,
            identity,
            session_keys: RwLock::new(None),
            policy: RwLock::new(EncryptionPolicy::new()),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Load or create the identity, then the cached session keys and
    /// conversation states.
    ///
    /// When the identity exists but could not be persisted or registered, the
    /// context is still usable for this session and the error is returned so
    /// the caller can warn or retry; calling `init` again retries.
    pub async fn init(&self) -> Result<(), E2eeError> {
        let result = self.identity.initialize().await;
        let Some(pair) = self.identity.key_pair().await else {
            return match result {
                Err(e) => Err(e.into()),
                Ok(_) => Err(E2eeError::NotInitialized),
            };
        };

        if self.session_keys.read().await.is_none() {
            self.install_session_keys(pair).await;
            self.load_policy().await;
        }

        match result {
            Ok(_) => {
                info!(user_id = %self.user_id, "e2ee initialized");
                Ok(())
            }
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "e2ee initialized in degraded mode");
                Err(e.into())
            }
        }
    }

    async fn install_session_keys(&self, pair: Arc<IdentityKeyPair>) {
        let manager = Arc::new(SessionKeyManager::new(
            self.user_id.clone(),
            pair,
            self.relay.clone(),
            self.store.clone(),
        ));
        if let Err(e) = manager.load().await {
            warn!(error = %e, "session key cache unreadable; keys will be fetched again");
        }
        *self.session_keys.write().await = Some(manager);
    }

    async fn load_policy(&self) {
        let states = match self.store.get(keys::CONVERSATION_STATES).await {
            Ok(Some(json)) => json,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "cannot read conversation states");
                return;
            }
        };
        match serde_json::from_str::<HashMap<ConversationId, ConversationEncryptionState>>(&states) {
            Ok(states) => {
                debug!(count = states.len(), "conversation states loaded");
                self.policy.write().await.restore(states);
            }
            Err(e) => warn!(error = %e, "dropping unreadable conversation states"),
        }
    }

    /// Persist the policy. The relay holds the authoritative copy, so a
    /// failure only costs a resync.
    async fn persist_policy(&self) {
        let snapshot = self.policy.read().await.snapshot();
        let result = match serde_json::to_string(&snapshot) {
            Ok(json) => self.store.put(keys::CONVERSATION_STATES, &json).await,
            Err(e) => Err(StoreError::Serialization(e.to_string())),
        };
        if let Err(e) = result {
            warn!(error = %e, "conversation states kept in memory only");
        }
    }

    /// Drop every identity and session key. `init` afterwards creates a new
    /// identity with a new recovery code.
    pub async fn reset(&self) -> Result<(), E2eeError> {
        if let Some(manager) = self.session_keys.write().await.take() {
            manager.clear_all().await?;
        } else {
            self.store.delete(keys::SESSION_KEYS).await?;
        }
        self.identity.reset().await?;
        info!(user_id = %self.user_id, "e2ee reset");
        Ok(())
    }

    /// Unlock the backup stored on this device with a recovery code.
    pub async fn recover(&self, code: &str) -> Result<(), E2eeError> {
        let pair = self.identity.recover(code).await?;
        self.install_session_keys(pair).await;
        self.load_policy().await;
        Ok(())
    }

    /// Install an identity exported from another device.
    pub async fn import_backup(&self, backup: &KeyBackup, code: &str) -> Result<(), E2eeError> {
        let pair = self.identity.import_backup(backup, code).await?;
        self.install_session_keys(pair).await;
        self.load_policy().await;
        Ok(())
    }

    pub async fn export_backup(&self) -> Result<KeyBackup, E2eeError> {
        Ok(self.identity.export_backup().await?)
    }

    pub async fn recovery_code(&self) -> Option<String> {
        self.identity.recovery_code().await
    }

    pub async fn public_key(&self) -> Result<PublicKey, E2eeError> {
        Ok(self.identity.export_public_key().await?)
    }

    pub async fn is_initialized(&self) -> bool {
        self.session_keys.read().await.is_some()
    }

    /// Retry persisting session keys that only live in memory.
    pub async fn flush(&self) -> Result<(), E2eeError> {
        self.session_keys().await?.flush().await?;
        Ok(())
    }

    async fn session_keys(&self) -> Result<Arc<SessionKeyManager>, E2eeError> {
        self.session_keys
            .read()
            .await
            .clone()
            .ok_or(E2eeError::NotInitialized)
    }

    // ------------------------------------------------------------------------
    // Conversation policy
    // ------------------------------------------------------------------------

    pub async fn conversation_state(&self, conversation_id: &ConversationId) -> ConversationEncryptionState {
        self.policy.read().await.get_or_default(conversation_id)
    }

    pub async fn is_encrypted(&self, conversation_id: &ConversationId) -> bool {
        self.policy.read().await.is_encrypted(conversation_id)
    }

    pub async fn can_toggle(&self, conversation_id: &ConversationId) -> ToggleCapability {
        self.policy.read().await.can_toggle(conversation_id, &self.user_id)
    }

    /// Turn encryption on and make sure a session key is distributed to
    /// `members`. Enabling an enabled conversation keeps its owner.
    pub async fn enable_conversation(
        &self,
        conversation_id: &ConversationId,
        members: &[UserId],
    ) -> Result<ConversationEncryptionState, E2eeError> {
        let manager = self.session_keys().await?;

        let mut state = self.conversation_state(conversation_id).await;
        if !state.is_enabled() {
            let remote = self
                .relay
                .set_conversation_encryption(conversation_id, true, &self.user_id)
                .await?;
            state = {
                let mut policy = self.policy.write().await;
                let synced = policy.sync(conversation_id, remote);
                if synced.state.is_enabled() {
                    synced.state
                } else {
                    policy
                        .enable(conversation_id, &self.user_id, self.clock.now_millis())
                        .state
                }
            };
            self.persist_policy().await;
        }

        let key = manager
            .get_or_create(conversation_id, members)
            .await
            .map_err(|e| key_error(conversation_id, e))?;
        debug!(conversation_id = %conversation_id, key_fp = %key.fingerprint(), "conversation key ready");
        Ok(state)
    }

    /// Turn encryption off. Only the participant who enabled it may.
    pub async fn disable_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationEncryptionState, E2eeError> {
        let current = self.conversation_state(conversation_id).await;
        match current.owner() {
            None => return Ok(current),
            Some(owner) if *owner != self.user_id => {
                return Err(E2eeError::Unauthorized {
                    owner: Some(owner.clone()),
                })
            }
            Some(_) => {}
        }

        let remote = self
            .relay
            .set_conversation_encryption(conversation_id, false, &self.user_id)
            .await?;
        let state = {
            let mut policy = self.policy.write().await;
            let synced = policy.sync(conversation_id, remote);
            if synced.state.is_enabled() {
                policy
                    .disable(conversation_id, &self.user_id, self.clock.now_millis())?
                    .state
            } else {
                synced.state
            }
        };
        self.persist_policy().await;
        Ok(state)
    }

    /// Consume an `encryption_state_changed` push. Older states are ignored;
    /// malformed ones are logged and ignored.
    pub async fn apply_remote_state(&self, event: &EncryptionStateEvent) -> ConversationEncryptionState {
        let remote = match ConversationEncryptionState::try_from(event) {
            Ok(remote) => remote,
            Err(e) => {
                warn!(conversation_id = %event.conversation_id, error = %e, "ignoring malformed encryption state");
                return self.conversation_state(&event.conversation_id).await;
            }
        };
        let transition = self
            .policy
            .write()
            .await
            .sync(&event.conversation_id, remote);
        if transition.changed {
            info!(
                conversation_id = %event.conversation_id,
                enabled = transition.state.is_enabled(),
                "encryption state updated from relay"
            );
            self.persist_policy().await;
        }
        transition.state
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    /// Plaintext for unencrypted conversations, an envelope otherwise. Fails
    /// rather than falling back to plaintext when no key can be obtained.
    pub async fn encrypt_outgoing(
        &self,
        conversation_id: &ConversationId,
        plaintext: &str,
        members: &[UserId],
    ) -> Result<Outgoing, E2eeError> {
        if !self.is_encrypted(conversation_id).await {
            return Ok(Outgoing::Plain(plaintext.to_string()));
        }
        let key = self
            .session_keys()
            .await?
            .get_or_create(conversation_id, members)
            .await
            .map_err(|e| key_error(conversation_id, e))?;
        Ok(Outgoing::Encrypted(message::encrypt(plaintext, &key)?))
    }

    /// `encrypt_outgoing`, then hand an envelope to the relay. A `Plain`
    /// result is returned for the caller's normal delivery path.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        plaintext: &str,
        members: &[UserId],
    ) -> Result<Outgoing, E2eeError> {
        let outgoing = self
            .encrypt_outgoing(conversation_id, plaintext, members)
            .await?;
        if let Outgoing::Encrypted(envelope) = &outgoing {
            self.relay
                .send_encrypted_message(conversation_id, envelope)
                .await?;
            debug!(conversation_id = %conversation_id, "encrypted message sent");
        }
        Ok(outgoing)
    }

    /// Decrypt one envelope. Never fails: problems become a placeholder.
    pub async fn open_incoming(
        &self,
        conversation_id: &ConversationId,
        envelope: &EncryptedMessageEnvelope,
    ) -> Incoming {
        let Ok(manager) = self.session_keys().await else {
            return Incoming::Placeholder(PlaceholderReason::KeyUnavailable);
        };

        let cached = manager.keys_for(conversation_id).await;
        for key in &cached {
            if let Ok(text) = message::decrypt(envelope, key) {
                return Incoming::Plaintext(text);
            }
        }

        // Not cached yet, or the conversation key was replaced since.
        let fresh = match manager.fetch(conversation_id).await {
            Ok(Some(key)) if !cached.contains(&key) => key,
            Ok(Some(_)) => return Incoming::Placeholder(PlaceholderReason::DecryptionFailed),
            Ok(None) => return Self::unavailable(conversation_id, !cached.is_empty()),
            Err(e) => {
                debug!(conversation_id = %conversation_id, error = %e, "session key fetch failed");
                return Self::unavailable(conversation_id, !cached.is_empty());
            }
        };
        match message::decrypt(envelope, &fresh) {
            Ok(text) => Incoming::Plaintext(text),
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "message failed to decrypt");
                Incoming::Placeholder(PlaceholderReason::DecryptionFailed)
            }
        }
    }

    fn unavailable(conversation_id: &ConversationId, had_keys: bool) -> Incoming {
        if had_keys {
            warn!(conversation_id = %conversation_id, "message failed to decrypt");
            Incoming::Placeholder(PlaceholderReason::DecryptionFailed)
        } else {
            Incoming::Placeholder(PlaceholderReason::KeyUnavailable)
        }
    }

    /// Fetch a conversation's encrypted history and open each message.
    pub async fn fetch_messages(&self, conversation_id: &ConversationId) -> Result<Vec<ReceivedMessage>, E2eeError> {
        let messages = self.relay.get_encrypted_messages(conversation_id).await?;
        let mut out = Vec::with_capacity(messages.len());
        for msg in messages {
            let content = self.open_incoming(conversation_id, &msg.envelope).await;
            out.push(ReceivedMessage {
                sender_id: msg.sender_id,
                sent_at: msg.sent_at,
                content,
            });
        }
        Ok(out)
    }
}

/// A key that cannot be obtained is `KeyUnavailable` unless the relay
/// itself failed, which stays a retryable network error.
fn key_error(conversation_id: &ConversationId, e: SessionKeyError) -> E2eeError {
    match e {
        SessionKeyError::Relay(_) | SessionKeyError::KeyGeneration(_) | SessionKeyError::Store(_) => e.into(),
        SessionKeyError::Unavailable(_) | SessionKeyError::Wrap(_) | SessionKeyError::Unwrap(_) => {
            warn!(conversation_id = %conversation_id, error = %e, "no usable session key");
            E2eeError::KeyUnavailable(conversation_id.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{InMemoryRelay, ManualClock};
    use crate::relay::RelayError;
    use crate::store::MemoryStore;
    use parley_crypto::SessionKey;

    fn conv() -> ConversationId {
        ConversationId::new("dm1")
    }

    fn members() -> Vec<UserId> {
        vec![UserId::new("alice"), UserId::new("bob")]
    }

    fn empty_envelope() -> EncryptedMessageEnvelope {
        EncryptedMessageEnvelope {
            ciphertext: String::new(),
            iv: String::new(),
            auth_tag: String::new(),
        }
    }

    struct Device {
        ctx: E2eeContext,
        store: MemoryStore,
    }

    async fn device(server: &InMemoryRelay, clock: &Arc<ManualClock>, user: &str) -> Device {
        let store = MemoryStore::new();
        let ctx = server
            .context(user, Arc::new(store.clone()), clock.clone())
            .unwrap();
        ctx.init().await.unwrap();
        Device { ctx, store }
    }

    fn setup() -> (InMemoryRelay, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (InMemoryRelay::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_uninitialized_context() {
        let (server, clock) = setup();
        let ctx = server
            .context("alice", Arc::new(MemoryStore::new()), clock)
            .unwrap();
        assert!(!ctx.is_initialized().await);
        assert!(matches!(
            ctx.enable_conversation(&conv(), &members()).await,
            Err(E2eeError::NotInitialized)
        ));
        assert_eq!(
            ctx.open_incoming(&conv(), &empty_envelope()).await,
            Incoming::Placeholder(PlaceholderReason::KeyUnavailable)
        );
    }

    #[tokio::test]
    async fn test_plain_until_enabled() {
        let (server, clock) = setup();
        let alice = device(&server, &clock, "alice").await;
        let out = alice
            .ctx
            .send_message(&conv(), "hello", &members())
            .await
            .unwrap();
        assert_eq!(out, Outgoing::Plain("hello".into()));
        assert_eq!(server.message_count(&conv()), 0);
    }

    #[tokio::test]
    async fn test_enable_distributes_key_and_records_owner() {
        let (server, clock) = setup();
        let alice = device(&server, &clock, "alice").await;
        let _bob = device(&server, &clock, "bob").await;

        let state = alice.ctx.enable_conversation(&conv(), &members()).await.unwrap();
        assert_eq!(state.owner(), Some(&UserId::new("alice")));
        assert_eq!(server.encryption_state(&conv()), state);
        assert_eq!(server.envelope_count(&conv()), 2);
        assert!(alice.store.get(keys::CONVERSATION_STATES).await.unwrap().is_some());

        // Redundant enable: same owner, no second distribution.
        let again = alice.ctx.enable_conversation(&conv(), &members()).await.unwrap();
        assert_eq!(again, state);
        assert_eq!(server.distribution_count(&conv()), 1);
    }

    #[tokio::test]
    async fn test_non_owner_disable_rejected_locally_and_by_relay() {
        let (server, clock) = setup();
        let alice = device(&server, &clock, "alice").await;
        let bob = device(&server, &clock, "bob").await;
        alice.ctx.enable_conversation(&conv(), &members()).await.unwrap();

        // Bob has not seen the push yet: his local view is disabled, so his
        // disable is a no-op rather than a relay call.
        assert!(!bob.ctx.disable_conversation(&conv()).await.unwrap().is_enabled());

        for ev in server.drain_events() {
            bob.ctx.apply_remote_state(&ev).await;
        }
        let err = bob.ctx.disable_conversation(&conv()).await.unwrap_err();
        assert!(matches!(
            err,
            E2eeError::Unauthorized { owner: Some(ref o) } if o.as_str() == "alice"
        ));
        assert!(server.encryption_state(&conv()).is_enabled());
    }

    #[tokio::test]
    async fn test_concurrent_enable_keeps_first_owner() {
        let (server, clock) = setup();
        let alice = device(&server, &clock, "alice").await;
        let bob = device(&server, &clock, "bob").await;

        alice.ctx.enable_conversation(&conv(), &members()).await.unwrap();
        // Bob enables before seeing the push: the relay keeps alice as owner
        // and bob picks up the key she distributed.
        let state = bob.ctx.enable_conversation(&conv(), &members()).await.unwrap();
        assert_eq!(state.owner(), Some(&UserId::new("alice")));
        assert_eq!(server.distribution_count(&conv()), 1);
    }

    #[tokio::test]
    async fn test_relay_forbidden_maps_to_unauthorized() {
        let (server, clock) = setup();
        let alice = device(&server, &clock, "alice").await;
        let bob = device(&server, &clock, "bob").await;
        alice.ctx.enable_conversation(&conv(), &members()).await.unwrap();

        // A forged push convinces bob's device that he owns the conversation;
        // the relay still refuses and names the real owner.
        let forged = EncryptionStateEvent {
            conversation_id: conv(),
            enabled: true,
            enabled_by: Some(UserId::new("bob")),
            timestamp: i64::MAX / 2,
        };
        bob.ctx.apply_remote_state(&forged).await;
        let err = bob.ctx.disable_conversation(&conv()).await.unwrap_err();
        assert!(matches!(
            err,
            E2eeError::Unauthorized { owner: Some(ref o) } if o.as_str() == "alice"
        ));
        assert!(server.encryption_state(&conv()).is_enabled());
    }

    #[tokio::test]
    async fn test_stale_remote_state_ignored() {
        let (server, clock) = setup();
        let alice = device(&server, &clock, "alice").await;
        alice.ctx.enable_conversation(&conv(), &members()).await.unwrap();
        let current = alice.ctx.conversation_state(&conv()).await;

        let stale = EncryptionStateEvent {
            conversation_id: conv(),
            enabled: false,
            enabled_by: None,
            timestamp: current.timestamp - 1,
        };
        assert_eq!(alice.ctx.apply_remote_state(&stale).await, current);

        let malformed = EncryptionStateEvent {
            conversation_id: conv(),
            enabled: true,
            enabled_by: None,
            timestamp: current.timestamp + 10,
        };
        assert_eq!(alice.ctx.apply_remote_state(&malformed).await, current);

        let newer = EncryptionStateEvent {
            conversation_id: conv(),
            enabled: false,
            enabled_by: None,
            timestamp: current.timestamp + 10,
        };
        assert!(!alice.ctx.apply_remote_state(&newer).await.is_enabled());
    }

    #[tokio::test]
    async fn test_missing_key_never_falls_back_to_plaintext() {
        let (server, clock) = setup();
        let alice = device(&server, &clock, "alice").await;
        alice.ctx.enable_conversation(&conv(), &members()).await.unwrap();

        // Fresh device for the same user: encrypted state known, relay down.
        let store = MemoryStore::new();
        store
            .put(
                keys::CONVERSATION_STATES,
                &alice.store.get(keys::CONVERSATION_STATES).await.unwrap().unwrap(),
            )
            .await
            .unwrap();
        let other = server.context("carol", Arc::new(store), clock.clone()).unwrap();
        other.init().await.unwrap();
        assert!(other.is_encrypted(&conv()).await);

        server.set_offline(true);
        let err = other
            .encrypt_outgoing(&conv(), "secret", &members())
            .await
            .unwrap_err();
        assert!(matches!(err, E2eeError::Network(RelayError::Network(_))));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_tampered_message_becomes_placeholder() {
        let (server, clock) = setup();
        let alice = device(&server, &clock, "alice").await;
        let bob = device(&server, &clock, "bob").await;
        alice.ctx.enable_conversation(&conv(), &members()).await.unwrap();
        for ev in server.drain_events() {
            bob.ctx.apply_remote_state(&ev).await;
        }

        let Outgoing::Encrypted(mut env) = bob
            .ctx
            .encrypt_outgoing(&conv(), "hi", &members())
            .await
            .unwrap()
        else {
            panic!("expected an envelope");
        };
        assert_eq!(
            alice.ctx.open_incoming(&conv(), &env).await,
            Incoming::Plaintext("hi".into())
        );

        env.auth_tag = String::new();
        assert_eq!(
            alice.ctx.open_incoming(&conv(), &env).await,
            Incoming::Placeholder(PlaceholderReason::DecryptionFailed)
        );
    }

    #[tokio::test]
    async fn test_message_before_key_is_placeholder() {
        let (server, clock) = setup();
        let alice = device(&server, &clock, "alice").await;
        let key = SessionKey::generate().unwrap();
        let env = message::encrypt("early", &key).unwrap();
        assert_eq!(
            alice.ctx.open_incoming(&ConversationId::new("unknown"), &env).await,
            Incoming::Placeholder(PlaceholderReason::KeyUnavailable)
        );
    }

    #[tokio::test]
    async fn test_persistence_failure_is_degraded_and_flushable() {
        let (server, clock) = setup();
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let ctx = server
            .context("alice", Arc::new(store.clone()), clock.clone())
            .unwrap();

        let err = ctx.init().await.unwrap_err();
        assert!(matches!(err, E2eeError::Persistence(_)));
        assert_eq!(err.severity(), crate::errors::Severity::Degraded);
        assert!(ctx.is_initialized().await);

        // Keys still work in memory.
        ctx.enable_conversation(&conv(), &[UserId::new("alice")]).await.unwrap();
        assert!(matches!(
            ctx.encrypt_outgoing(&conv(), "x", &[]).await.unwrap(),
            Outgoing::Encrypted(_)
        ));

        store.set_fail_writes(false);
        ctx.init().await.unwrap();
        ctx.flush().await.unwrap();
        assert!(store.get(keys::SESSION_KEYS).await.unwrap().is_some());
        assert!(store.get(keys::IDENTITY_PUBLIC).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reset_discards_keys_and_init_rotates_identity() {
        let (server, clock) = setup();
        let alice = device(&server, &clock, "alice").await;
        alice.ctx.enable_conversation(&conv(), &[UserId::new("alice")]).await.unwrap();
        let old_pk = alice.ctx.public_key().await.unwrap();
        let old_code = alice.ctx.recovery_code().await.unwrap();

        alice.ctx.reset().await.unwrap();
        assert!(!alice.ctx.is_initialized().await);
        assert!(alice.store.get(keys::SESSION_KEYS).await.unwrap().is_none());
        assert!(alice.store.get(keys::IDENTITY_PRIVATE).await.unwrap().is_none());

        alice.ctx.init().await.unwrap();
        assert_ne!(alice.ctx.public_key().await.unwrap(), old_pk);
        assert_ne!(alice.ctx.recovery_code().await.unwrap(), old_code);
        assert_eq!(
            server.public_key_of("alice"),
            Some(alice.ctx.public_key().await.unwrap().to_base64())
        );

        // Old envelope is unusable; a new key is distributed.
        assert!(matches!(
            alice.ctx.encrypt_outgoing(&conv(), "again", &[]).await.unwrap(),
            Outgoing::Encrypted(_)
        ));
        assert_eq!(server.distribution_count(&conv()), 2);
    }

    #[tokio::test]
    async fn test_can_toggle_reflects_ownership() {
        let (server, clock) = setup();
        let alice = device(&server, &clock, "alice").await;
        let bob = device(&server, &clock, "bob").await;

        let cap = alice.ctx.can_toggle(&conv()).await;
        assert!(cap.can_enable);
        assert!(!cap.can_disable);

        alice.ctx.enable_conversation(&conv(), &members()).await.unwrap();
        for ev in server.drain_events() {
            bob.ctx.apply_remote_state(&ev).await;
        }
        let cap = alice.ctx.can_toggle(&conv()).await;
        assert!(!cap.can_enable && cap.can_disable);
        let cap = bob.ctx.can_toggle(&conv()).await;
        assert!(!cap.can_enable && !cap.can_disable);
        assert_eq!(cap.owner, Some(UserId::new("alice")));
    }

    #[tokio::test]
    async fn test_states_survive_restart() {
        let (server, clock) = setup();
        let alice = device(&server, &clock, "alice").await;
        alice.ctx.enable_conversation(&conv(), &[UserId::new("alice")]).await.unwrap();

        let restarted = server
            .context("alice", Arc::new(alice.store.clone()), clock.clone())
            .unwrap();
        restarted.init().await.unwrap();
        assert!(restarted.is_encrypted(&conv()).await);
        let Outgoing::Encrypted(env) = restarted
            .encrypt_outgoing(&conv(), "after restart", &[])
            .await
            .unwrap()
        else {
            panic!("expected an envelope");
        };
        assert_eq!(
            alice.ctx.open_incoming(&conv(), &env).await,
            Incoming::Plaintext("after restart".into())
        );
        assert_eq!(server.distribution_count(&conv()), 1);
    }
}
