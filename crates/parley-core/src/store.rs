//! Local secret storage.
//!
//! The subsystem persists a handful of string values (public key, vault blob,
//! recovery code, serialized caches) under fixed keys. `SecretStore` is the
//! seam; `MemoryStore` backs tests and `FileStore` keeps a single JSON
//! document on disk, rewritten atomically.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Keys under which the subsystem persists its state.
pub mod keys {
    pub const IDENTITY_PUBLIC: &str = "identity_public";
    /// Base64 vault blob holding the encrypted private key.
    pub const IDENTITY_PRIVATE: &str = "identity_private";
    pub const RECOVERY_CODE: &str = "recovery_code";
    /// JSON map conversation id -> session key Base64.
    pub const SESSION_KEYS: &str = "session_keys";
    /// JSON map conversation id -> encryption state.
    pub const CONVERSATION_STATES: &str = "conversation_states";
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::OperationFailed(e.to_string())
    }
}

// ============================================================================
// SecretStore Trait
// ============================================================================

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Read a value.
    ///
    /// # Returns
    /// * `Ok(Some(value))` if present
    /// * `Ok(None)` if absent
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, replacing any previous one.
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a value. Succeeds when the key is absent.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

// ============================================================================
// MemoryStore
// ============================================================================

/// In-memory store. Clones share the same underlying map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    values: Arc<RwLock<HashMap<String, String>>>,
    fail_writes: Arc<std::sync::atomic::AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put`/`delete` fail, to exercise degraded paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::OperationFailed("store is read-only".into()));
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.values.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.values.read().await.is_empty()
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        self.values.write().await.remove(key);
        Ok(())
    }
}

// ============================================================================
// FileStore
// ============================================================================

/// JSON-document store on disk.
///
/// Every write rewrites the whole document through a temp file and a rename,
/// then restricts the file to the owner on Unix.
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Default location: `<data dir>/secrets.json`.
    pub fn default_path() -> Option<PathBuf> {
        crate::config::Config::data_dir().map(|dir| dir.join("secrets.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<HashMap<String, String>, StoreError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        if contents.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&contents).map_err(|e| {
            StoreError::DataCorruption(format!("{}: {}", self.path.display(), e))
        })
    }

    async fn write_all(&self, values: &HashMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_string_pretty(values)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        // Write atomically using a temp file
        let temp_path = self.path.with_extension("tmp");
        {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::File::create(&temp_path).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                file.set_permissions(std::fs::Permissions::from_mode(0o600))
                    .await?;
            }
            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_all().await?.remove(key))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut values = self.read_all().await?;
        values.insert(key.to_string(), value.to_string());
        self.write_all(&values).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut values = self.read_all().await?;
        if values.remove(key).is_none() {
            return Ok(());
        }
        self.write_all(&values).await
    }
}
