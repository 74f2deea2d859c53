//! Session key manager.
//!
//! One symmetric key per conversation. Keys are created lazily by whichever
//! participant first needs one, wrapped individually for every participant
//! with a registered public key, and pushed to the relay as one batch.
//! Other participants fetch and unwrap their copy.
//!
//! A conversation's key can be replaced (a participant reset their identity
//! and distributed a new one). Superseded keys stay cached, newest first, so
//! history sent under them still opens.
//!
//! The cache is persisted as a JSON map of conversation to Base64 keys under
//! `store::keys::SESSION_KEYS`.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use parley_crypto::wrap::{unwrap_key, wrap_key_for};
use parley_crypto::{IdentityKeyPair, KeyMaterialError, PublicKey, SessionKey, WrapError, WrappedKey};

use crate::relay::{Relay, RelayError};
use crate::store::{keys, SecretStore, StoreError};
use crate::types::{ConversationId, SessionKeyEnvelope, UserId};

/// Keys kept per conversation, current one included.
pub const MAX_KEYS_PER_CONVERSATION: usize = 8;

// Older caches held a single key per conversation.
#[derive(Deserialize)]
#[serde(untagged)]
enum CachedKeys {
    Single(String),
    Ring(Vec<String>),
}

impl CachedKeys {
    fn into_vec(self) -> Vec<String> {
        match self {
            CachedKeys::Single(b64) => vec![b64],
            CachedKeys::Ring(keys) => keys,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionKeyError {
    #[error("failed to generate session key: {0}")]
    KeyGeneration(#[from] KeyMaterialError),

    #[error("failed to wrap session key: {0}")]
    Wrap(WrapError),

    /// The envelope addressed to us did not open.
    #[error("failed to unwrap session key: {0}")]
    Unwrap(WrapError),

    #[error("no session key available for conversation {0}")]
    Unavailable(ConversationId),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct SessionKeyManager {
    user_id: UserId,
    identity: Arc<IdentityKeyPair>,
    relay: Arc<dyn Relay>,
    store: Arc<dyn SecretStore>,
    // Current key first, then superseded ones.
    cache: RwLock<HashMap<ConversationId, Vec<SessionKey>>>,
    // Per-conversation creation locks.
    inflight: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
    // Set when the last persist failed; cleared by the next successful one.
    dirty: AtomicBool,
}

impl SessionKeyManager {
    pub fn new(
        user_id: UserId,
        identity: Arc<IdentityKeyPair>,
        relay: Arc<dyn Relay>,
        store: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            user_id,
            identity,
            relay,
            store,
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Load the persisted cache. Unparseable entries are dropped with a warning;
    /// they will be fetched again from the relay.
    pub async fn load(&self) -> Result<usize, SessionKeyError> {
        let Some(json) = self.store.get(keys::SESSION_KEYS).await? else {
            return Ok(0);
        };
        let raw: HashMap<ConversationId, CachedKeys> = serde_json::from_str(&json)
            .map_err(|e| StoreError::DataCorruption(format!("session key cache: {e}")))?;

        let mut cache = self.cache.write().await;
        for (conv, entry) in raw {
            let mut ring = Vec::new();
            for b64 in entry.into_vec() {
                match SessionKey::from_base64(&b64) {
                    Ok(key) => ring.push(key),
                    Err(e) => warn!(conversation_id = %conv, error = %e, "dropping unreadable cached session key"),
                }
            }
            ring.truncate(MAX_KEYS_PER_CONVERSATION);
            if !ring.is_empty() {
                cache.insert(conv, ring);
            }
        }
        debug!(count = cache.len(), "session key cache loaded");
        Ok(cache.len())
    }

    async fn persist(&self) -> Result<(), SessionKeyError> {
        let json = {
            let cache = self.cache.read().await;
            let raw: HashMap<&ConversationId, Vec<String>> = cache
                .iter()
                .map(|(conv, ring)| (conv, ring.iter().map(|k| k.to_base64().to_string()).collect()))
                .collect();
            serde_json::to_string(&raw).map_err(|e| StoreError::Serialization(e.to_string()))?
        };
        match self.store.put(keys::SESSION_KEYS, &json).await {
            Ok(()) => {
                self.dirty.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Make `key` the conversation's current key, keeping the one it
    /// replaces. A persistence failure leaves the key usable in memory; it is
    /// logged and retried by `flush`.
    async fn remember(&self, conversation_id: &ConversationId, key: SessionKey) {
        {
            let mut cache = self.cache.write().await;
            let ring = cache.entry(conversation_id.clone()).or_default();
            if ring.first() == Some(&key) {
                return;
            }
            ring.retain(|k| *k != key);
            ring.insert(0, key);
            ring.truncate(MAX_KEYS_PER_CONVERSATION);
        }
        if let Err(e) = self.persist().await {
            warn!(conversation_id = %conversation_id, error = %e, "session key cached in memory only");
        }
    }

    /// True when in-memory keys have not reached the store yet.
    pub fn has_unpersisted_changes(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Retry a failed persist.
    pub async fn flush(&self) -> Result<(), SessionKeyError> {
        if self.has_unpersisted_changes() {
            self.persist().await?;
        }
        Ok(())
    }

    /// Current key, local cache lookup only.
    pub async fn get(&self, conversation_id: &ConversationId) -> Option<SessionKey> {
        self.cache
            .read()
            .await
            .get(conversation_id)
            .and_then(|ring| ring.first())
            .cloned()
    }

    /// Every cached key for the conversation, current first.
    pub async fn keys_for(&self, conversation_id: &ConversationId) -> Vec<SessionKey> {
        self.cache
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Fetch the envelope addressed to us from the relay and unwrap it.
    ///
    /// `Ok(None)` when nobody has distributed a key to us yet.
    pub async fn fetch(&self, conversation_id: &ConversationId) -> Result<Option<SessionKey>, SessionKeyError> {
        let Some(b64) = self.relay.get_session_key_envelope(conversation_id).await? else {
            debug!(conversation_id = %conversation_id, "no session key envelope yet");
            return Ok(None);
        };

        let wrapped = WrappedKey::from_base64(&b64).map_err(SessionKeyError::Unwrap)?;
        let key = unwrap_key(&wrapped, &self.identity, conversation_id.as_str())
            .map_err(SessionKeyError::Unwrap)?;

        info!(
            conversation_id = %conversation_id,
            key_fp = %key.fingerprint(),
            "session key fetched"
        );
        self.remember(conversation_id, key.clone()).await;
        Ok(Some(key))
    }

    /// Generate a fresh key, wrap it for every participant (always including
    /// ourselves) and push the batch.
    ///
    /// Participants without a registered or parseable public key are left
    /// out. Returns `Ok(true)` when the relay accepted the batch, `Ok(false)`
    /// when it rejected it, and `Err` on network failure, including a failed
    /// key lookup, in which case nothing is distributed.
    pub async fn create_and_distribute(
        &self,
        conversation_id: &ConversationId,
        participant_ids: &[UserId],
    ) -> Result<bool, SessionKeyError> {
        Ok(self
            .create_inner(conversation_id, participant_ids)
            .await?
            .is_some())
    }

    async fn create_inner(
        &self,
        conversation_id: &ConversationId,
        participant_ids: &[UserId],
    ) -> Result<Option<SessionKey>, SessionKeyError> {
        let key = SessionKey::generate()?;

        let recipients: BTreeSet<&UserId> = participant_ids
            .iter()
            .filter(|id| **id != self.user_id)
            .collect();

        let mut envelopes = Vec::with_capacity(recipients.len() + 1);
        envelopes.push(self.envelope_for(&self.user_id, &self.identity.public_key(), &key, conversation_id)?);

        let mut omitted = Vec::new();
        for recipient in recipients {
            match self.lookup_public_key(recipient).await? {
                Some(pk) => match self.envelope_for(recipient, &pk, &key, conversation_id) {
                    Ok(env) => envelopes.push(env),
                    Err(e) => {
                        warn!(recipient = %recipient, error = %e, "cannot wrap for recipient; omitting");
                        omitted.push(recipient.as_str());
                    }
                },
                None => omitted.push(recipient.as_str()),
            }
        }

        match self
            .relay
            .distribute_session_key(conversation_id, &envelopes)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "relay rejected session key batch");
                return Ok(None);
            }
        }

        info!(
            conversation_id = %conversation_id,
            recipients = envelopes.len(),
            omitted = ?omitted,
            key_fp = %key.fingerprint(),
            "session key distributed"
        );
        self.remember(conversation_id, key.clone()).await;
        Ok(Some(key))
    }

    fn envelope_for(
        &self,
        recipient: &UserId,
        public_key: &PublicKey,
        key: &SessionKey,
        conversation_id: &ConversationId,
    ) -> Result<SessionKeyEnvelope, SessionKeyError> {
        let wrapped = wrap_key_for(public_key, key, conversation_id.as_str()).map_err(SessionKeyError::Wrap)?;
        Ok(SessionKeyEnvelope {
            recipient_id: recipient.clone(),
            encrypted_key: wrapped.to_base64(),
        })
    }

    /// `Ok(None)` for a recipient that cannot be wrapped for. Transient relay
    /// failures are returned so the caller can retry.
    async fn lookup_public_key(&self, user_id: &UserId) -> Result<Option<PublicKey>, SessionKeyError> {
        match self.relay.get_public_key(user_id).await {
            Ok(Some(b64)) => match PublicKey::from_base64(&b64) {
                Ok(pk) => Ok(Some(pk)),
                Err(e) => {
                    warn!(recipient = %user_id, error = %e, "relay returned an invalid public key");
                    Ok(None)
                }
            },
            Ok(None) => {
                debug!(recipient = %user_id, "recipient has no registered key");
                Ok(None)
            }
            Err(e) if e.is_transient() => Err(e.into()),
            Err(e) => {
                warn!(recipient = %user_id, error = %e, "public key lookup refused");
                Ok(None)
            }
        }
    }

    /// Cache, then relay, then create. Serialized per conversation so
    /// concurrent callers in this process create at most one key.
    pub async fn get_or_create(
        &self,
        conversation_id: &ConversationId,
        participant_ids: &[UserId],
    ) -> Result<SessionKey, SessionKeyError> {
        if let Some(key) = self.get(conversation_id).await {
            return Ok(key);
        }

        let lock = self
            .inflight
            .lock()
            .await
            .entry(conversation_id.clone())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.resolve_locked(conversation_id, participant_ids).await
        };

        let mut inflight = self.inflight.lock().await;
        if let Some(entry) = inflight.get(conversation_id) {
            // Map entry plus our clone: nobody else is waiting.
            if Arc::strong_count(entry) <= 2 {
                inflight.remove(conversation_id);
            }
        }
        result
    }

    async fn resolve_locked(
        &self,
        conversation_id: &ConversationId,
        participant_ids: &[UserId],
    ) -> Result<SessionKey, SessionKeyError> {
        // Another task may have finished while we waited.
        if let Some(key) = self.get(conversation_id).await {
            return Ok(key);
        }
        match self.fetch(conversation_id).await {
            Ok(Some(key)) => return Ok(key),
            Ok(None) => {}
            // Wrapped for a previous identity of ours.
            Err(SessionKeyError::Unwrap(e)) => {
                warn!(conversation_id = %conversation_id, error = %e, "distributed session key unusable; creating a new one");
            }
            Err(e) => return Err(e),
        }
        if let Some(key) = self.create_inner(conversation_id, participant_ids).await? {
            return Ok(key);
        }
        // Rejected batch: possibly another participant won the race.
        self.fetch(conversation_id)
            .await?
            .ok_or_else(|| SessionKeyError::Unavailable(conversation_id.clone()))
    }

    /// Drop our copy. Other participants and the relay are unaffected.
    pub async fn clear(&self, conversation_id: &ConversationId) -> Result<(), SessionKeyError> {
        if self.cache.write().await.remove(conversation_id).is_some() {
            self.persist().await?;
        }
        Ok(())
    }

    pub async fn clear_all(&self) -> Result<(), SessionKeyError> {
        self.cache.write().await.clear();
        self.store.delete(keys::SESSION_KEYS).await?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}
