//! Identity key store.
//!
//! Owns the device's identity key pair. At rest the private key only exists
//! as a recovery-vault blob; the recovery code that opens it is kept beside
//! it so this device can reopen it, and shown to the user so another device
//! can too.
//!
//! Persisted under `store::keys::{IDENTITY_PUBLIC, IDENTITY_PRIVATE, RECOVERY_CODE}`.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use parley_crypto::{
    EncryptedPrivateKeyBlob, IdentityError, IdentityKeyPair, PublicKey, RecoveryCode, RecoveryCodeError,
    RecoveryVault, VaultError,
};

use crate::relay::{Relay, RelayError};
use crate::store::{keys, SecretStore, StoreError};
use crate::types::KeyBackup;

#[derive(Debug, Error)]
pub enum IdentityStoreError {
    #[error("identity not initialized")]
    NotInitialized,

    #[error("key generation failed: {0}")]
    Generation(String),

    /// A backup exists locally but the recovery code that opens it does not.
    #[error("recovery code required to unlock the stored identity")]
    RecoveryRequired,

    #[error("no identity backup stored on this device")]
    NoBackup,

    #[error("backup private key does not match its public key")]
    KeyMismatch,

    #[error("invalid recovery code: {0}")]
    InvalidRecoveryCode(#[from] RecoveryCodeError),

    #[error("invalid key: {0}")]
    InvalidKey(#[from] IdentityError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

struct Loaded {
    pair: Arc<IdentityKeyPair>,
    code: RecoveryCode,
    blob: EncryptedPrivateKeyBlob,
    persisted: bool,
    registered: bool,
}

pub struct IdentityKeyStore {
    store: Arc<dyn SecretStore>,
    relay: Arc<dyn Relay>,
    vault: RecoveryVault,
    state: RwLock<Option<Loaded>>,
}

impl IdentityKeyStore {
    pub fn new(store: Arc<dyn SecretStore>, relay: Arc<dyn Relay>, vault: RecoveryVault) -> Self {
        Self {
            store,
            relay,
            vault,
            state: RwLock::new(None),
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Load the persisted identity, or create, persist and publish a new one.
    ///
    /// Idempotent. When a previous call left persistence or registration
    /// unfinished, this call retries it.
    ///
    /// # Returns
    /// * `Ok(pair)` when the identity is ready
    /// * `Err(Store(..))` when a freshly generated identity could not be
    ///   persisted; the pair is still usable for this session via `key_pair()`
    /// * `Err(RecoveryRequired)` when a backup exists but no code is stored
    pub async fn initialize(&self) -> Result<Arc<IdentityKeyPair>, IdentityStoreError> {
        let mut state = self.state.write().await;

        if state.is_none() {
            *state = Some(match self.load_persisted().await? {
                Some(loaded) => loaded,
                None => self.generate().await?,
            });
        }
        let Some(loaded) = state.as_mut() else {
            return Err(IdentityStoreError::NotInitialized);
        };

        // Register even when the local write failed: peers can still wrap
        // keys for this session.
        let persisted = if loaded.persisted {
            Ok(())
        } else {
            self.persist(loaded).await
        };
        loaded.persisted = persisted.is_ok();
        if !loaded.registered {
            self.register(&loaded.pair.public_key()).await?;
            loaded.registered = true;
        }
        persisted?;
        Ok(loaded.pair.clone())
    }

    async fn load_persisted(&self) -> Result<Option<Loaded>, IdentityStoreError> {
        let public = self.store.get(keys::IDENTITY_PUBLIC).await?;
        let blob = self.store.get(keys::IDENTITY_PRIVATE).await?;
        let (public, blob) = match (public, blob) {
            (Some(p), Some(b)) => (p, b),
            (None, None) => return Ok(None),
            _ => {
                return Err(StoreError::DataCorruption(
                    "identity public key and private key blob must be stored together".into(),
                )
                .into())
            }
        };
        let Some(code) = self.store.get(keys::RECOVERY_CODE).await? else {
            return Err(IdentityStoreError::RecoveryRequired);
        };

        let public = PublicKey::from_base64(&public)?;
        let blob = EncryptedPrivateKeyBlob::from_base64(&blob)?;
        let code = RecoveryCode::parse(&code)?;
        let pair = self.open(&public, &blob, &code).await?;

        info!(key_fp = %public.fingerprint(), "identity loaded");
        Ok(Some(Loaded {
            pair: Arc::new(pair),
            code,
            blob,
            persisted: true,
            // A stored key may never have reached the relay. Publish it once
            // per process; an existing registration answers 409.
            registered: false,
        }))
    }

    async fn generate(&self) -> Result<Loaded, IdentityStoreError> {
        let pair = IdentityKeyPair::generate().map_err(|e| IdentityStoreError::Generation(e.to_string()))?;
        let code = self
            .vault
            .generate_recovery_code()
            .map_err(|e| IdentityStoreError::Generation(e.to_string()))?;
        let blob = self.seal(&pair, &code).await?;

        info!(key_fp = %pair.public_key().fingerprint(), "identity generated");
        Ok(Loaded {
            pair: Arc::new(pair),
            code,
            blob,
            persisted: false,
            registered: false,
        })
    }

    /// Discard all identity material. Nothing stored is not an error.
    pub async fn reset(&self) -> Result<(), IdentityStoreError> {
        let mut state = self.state.write().await;
        *state = None;
        self.store.delete(keys::IDENTITY_PRIVATE).await?;
        self.store.delete(keys::RECOVERY_CODE).await?;
        self.store.delete(keys::IDENTITY_PUBLIC).await?;
        info!("identity reset");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------------

    /// Unlock the backup stored on this device with a user-supplied code.
    pub async fn recover(&self, code: &str) -> Result<Arc<IdentityKeyPair>, IdentityStoreError> {
        let code = RecoveryCode::parse(code)?;
        let (Some(public), Some(blob)) = (
            self.store.get(keys::IDENTITY_PUBLIC).await?,
            self.store.get(keys::IDENTITY_PRIVATE).await?,
        ) else {
            return Err(IdentityStoreError::NoBackup);
        };
        let public = PublicKey::from_base64(&public)?;
        let blob = EncryptedPrivateKeyBlob::from_base64(&blob)?;

        let pair = self.open(&public, &blob, &code).await?;
        self.install(pair, code, blob).await
    }

    /// Install a backup exported from another device.
    pub async fn import_backup(
        &self,
        backup: &KeyBackup,
        code: &str,
    ) -> Result<Arc<IdentityKeyPair>, IdentityStoreError> {
        let code = RecoveryCode::parse(code)?;
        let public = PublicKey::from_base64(&backup.public_key)?;
        let blob = EncryptedPrivateKeyBlob::from_base64(&backup.encrypted_private_key)?;

        let pair = self.open(&public, &blob, &code).await?;
        self.install(pair, code, blob).await
    }

    async fn install(
        &self,
        pair: IdentityKeyPair,
        code: RecoveryCode,
        blob: EncryptedPrivateKeyBlob,
    ) -> Result<Arc<IdentityKeyPair>, IdentityStoreError> {
        let mut state = self.state.write().await;
        let loaded = state.insert(Loaded {
            pair: Arc::new(pair),
            code,
            blob,
            persisted: false,
            registered: false,
        });
        info!(key_fp = %loaded.pair.public_key().fingerprint(), "identity recovered");

        self.persist(loaded).await?;
        loaded.persisted = true;
        self.register(&loaded.pair.public_key()).await?;
        loaded.registered = true;
        Ok(loaded.pair.clone())
    }

    pub async fn export_backup(&self) -> Result<KeyBackup, IdentityStoreError> {
        let state = self.state.read().await;
        let loaded = state.as_ref().ok_or(IdentityStoreError::NotInitialized)?;
        Ok(KeyBackup {
            public_key: loaded.pair.public_key().to_base64(),
            encrypted_private_key: loaded.blob.to_base64(),
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub async fn is_initialized(&self) -> bool {
        self.state.read().await.is_some()
    }

    pub async fn key_pair(&self) -> Option<Arc<IdentityKeyPair>> {
        self.state.read().await.as_ref().map(|l| l.pair.clone())
    }

    pub async fn recovery_code(&self) -> Option<String> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|l| l.code.as_str().to_string())
    }

    pub async fn export_public_key(&self) -> Result<PublicKey, IdentityStoreError> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|l| l.pair.public_key())
            .ok_or(IdentityStoreError::NotInitialized)
    }

    /// Canonical parse of a peer's Base64 public key.
    pub fn import_public_key(public_key_b64: &str) -> Result<PublicKey, IdentityStoreError> {
        Ok(PublicKey::from_base64(public_key_b64)?)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    async fn seal(
        &self,
        pair: &IdentityKeyPair,
        code: &RecoveryCode,
    ) -> Result<EncryptedPrivateKeyBlob, IdentityStoreError> {
        let vault = self.vault.clone();
        let private = pair.private_bytes();
        let code = code.clone();
        // Argon2 is CPU-bound; keep it off the async workers.
        let blob = tokio::task::spawn_blocking(move || vault.wrap(private.as_slice(), &code))
            .await
            .map_err(|e| VaultError::KdfFailed(e.to_string()))??;
        Ok(blob)
    }

    async fn open(
        &self,
        public: &PublicKey,
        blob: &EncryptedPrivateKeyBlob,
        code: &RecoveryCode,
    ) -> Result<IdentityKeyPair, IdentityStoreError> {
        let vault = self.vault.clone();
        let blob = blob.clone();
        let code = code.clone();
        let private = tokio::task::spawn_blocking(move || vault.unwrap(&blob, &code))
            .await
            .map_err(|e| VaultError::KdfFailed(e.to_string()))??;

        let pair = IdentityKeyPair::from_private_bytes(&private)?;
        if !pair.matches(public) {
            warn!(key_fp = %public.fingerprint(), "backup private key does not match public key");
            return Err(IdentityStoreError::KeyMismatch);
        }
        Ok(pair)
    }

    async fn persist(&self, loaded: &Loaded) -> Result<(), IdentityStoreError> {
        // Blob first: a public key without its blob would look like corruption.
        self.store
            .put(keys::IDENTITY_PRIVATE, &loaded.blob.to_base64())
            .await?;
        self.store
            .put(keys::RECOVERY_CODE, loaded.code.as_str())
            .await?;
        self.store
            .put(keys::IDENTITY_PUBLIC, &loaded.pair.public_key().to_base64())
            .await?;
        Ok(())
    }

    async fn register(&self, public: &PublicKey) -> Result<(), IdentityStoreError> {
        match self.relay.register_public_key(&public.to_base64()).await {
            Ok(()) => {
                info!(key_fp = %public.fingerprint(), "public key registered");
                Ok(())
            }
            Err(RelayError::AlreadyRegistered) => {
                info!(key_fp = %public.fingerprint(), "public key already registered");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
