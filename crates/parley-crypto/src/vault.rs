//! Recovery vault: the private key at rest, sealed under a recovery code.
//!
//! Argon2id stretches the recovery code into a 256-bit key with a fresh
//! random salt; AES-256-GCM with a fresh random IV seals the private key.
//! The Argon2 parameters travel inside the blob, so unwrapping never depends
//! on the currently configured cost.
//!
//! Storage form (Base64 of):
//!
//! ```text
//! version(1) || m_kib(4) || t(4) || p(4) || salt(16) || iv(12) || ciphertext+tag
//! ```
//!
//! The header bytes are the GCM associated data, so a blob whose parameters
//! were edited fails authentication like any other tampering.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroizing;

use crate::encoding::{b64_decode, b64_encode};
use crate::recovery_code::{RecoveryCode, RecoveryCodeError};

pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const BLOB_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 4 + 4 + 4;

// ---------------------------------------------------------------------------
// KdfParams
// ---------------------------------------------------------------------------

/// Argon2id cost parameters.
///
/// | Field | Default | Meaning |
/// |-------|---------|---------|
/// | `memory_kib` | 65 536 | Memory in KiB (64 MiB) |
/// | `iterations` | 3 | Passes |
/// | `parallelism` | 1 | Lanes |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 65_536,
            iterations: 3,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Upper bounds accepted when reading a blob. A hostile blob must not be
    /// able to make us allocate gigabytes or spin for minutes.
    pub const MAX_MEMORY_KIB: u32 = 1 << 21; // 2 GiB
    pub const MAX_ITERATIONS: u32 = 64;
    pub const MAX_PARALLELISM: u32 = 16;

    /// Cheap parameters for tests only.
    pub fn for_tests() -> Self {
        Self {
            memory_kib: 256,
            iterations: 1,
            parallelism: 1,
        }
    }

    pub fn validate(&self) -> Result<(), VaultError> {
        if self.parallelism == 0 || self.parallelism > Self::MAX_PARALLELISM {
            return Err(VaultError::InvalidParams(format!(
                "parallelism must be 1..={}, got {}",
                Self::MAX_PARALLELISM,
                self.parallelism
            )));
        }
        if self.iterations == 0 || self.iterations > Self::MAX_ITERATIONS {
            return Err(VaultError::InvalidParams(format!(
                "iterations must be 1..={}, got {}",
                Self::MAX_ITERATIONS,
                self.iterations
            )));
        }
        if self.memory_kib < 8 * self.parallelism || self.memory_kib > Self::MAX_MEMORY_KIB {
            return Err(VaultError::InvalidParams(format!(
                "memory_kib must be {}..={}, got {}",
                8 * self.parallelism,
                Self::MAX_MEMORY_KIB,
                self.memory_kib
            )));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("invalid KDF parameters: {0}")]
    InvalidParams(String),
    #[error("KDF failed: {0}")]
    KdfFailed(String),
    #[error("invalid base64 in vault blob")]
    InvalidEncoding,
    #[error("malformed vault blob: {0}")]
    Malformed(&'static str),
    #[error("unsupported vault blob version {0}")]
    UnsupportedVersion(u8),
    /// Wrong recovery code or a tampered blob. The two are indistinguishable.
    #[error("authentication failed: wrong recovery code or corrupted backup")]
    AuthenticationFailed,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("RNG failed")]
    RngError,
    #[error(transparent)]
    RecoveryCode(#[from] RecoveryCodeError),
}

// ---------------------------------------------------------------------------
// EncryptedPrivateKeyBlob
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedPrivateKeyBlob {
    pub params: KdfParams,
    pub salt: [u8; SALT_LEN],
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
}

impl EncryptedPrivateKeyBlob {
    fn header(&self) -> [u8; HEADER_LEN] {
        let mut h = [0u8; HEADER_LEN];
        h[0] = BLOB_VERSION;
        h[1..5].copy_from_slice(&self.params.memory_kib.to_be_bytes());
        h[5..9].copy_from_slice(&self.params.iterations.to_be_bytes());
        h[9..13].copy_from_slice(&self.params.parallelism.to_be_bytes());
        h
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + SALT_LEN + IV_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.header());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VaultError> {
        if bytes.is_empty() {
            return Err(VaultError::Malformed("empty"));
        }
        if bytes[0] != BLOB_VERSION {
            return Err(VaultError::UnsupportedVersion(bytes[0]));
        }
        if bytes.len() < HEADER_LEN + SALT_LEN + IV_LEN + TAG_LEN {
            return Err(VaultError::Malformed("too short"));
        }
        let u32_at = |i: usize| u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let params = KdfParams {
            memory_kib: u32_at(1),
            iterations: u32_at(5),
            parallelism: u32_at(9),
        };

        let rest = &bytes[HEADER_LEN..];
        let (salt, rest) = rest.split_at(SALT_LEN);
        let (iv, ct) = rest.split_at(IV_LEN);

        let mut blob = Self {
            params,
            salt: [0u8; SALT_LEN],
            iv: [0u8; IV_LEN],
            ciphertext: ct.to_vec(),
        };
        blob.salt.copy_from_slice(salt);
        blob.iv.copy_from_slice(iv);
        Ok(blob)
    }

    pub fn to_base64(&self) -> String {
        b64_encode(&self.to_bytes())
    }

    pub fn from_base64(s: &str) -> Result<Self, VaultError> {
        let bytes = b64_decode(s).map_err(|_| VaultError::InvalidEncoding)?;
        Self::from_bytes(&bytes)
    }
}

// ---------------------------------------------------------------------------
// RecoveryVault
// ---------------------------------------------------------------------------

/// Seals and opens private keys under recovery codes.
#[derive(Clone, Debug, Default)]
pub struct RecoveryVault {
    params: KdfParams,
}

impl RecoveryVault {
    pub fn new(params: KdfParams) -> Result<Self, VaultError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> KdfParams {
        self.params
    }

    pub fn generate_recovery_code(&self) -> Result<RecoveryCode, VaultError> {
        Ok(RecoveryCode::generate()?)
    }

    /// Seal `private_key` with fresh salt and IV.
    pub fn wrap(
        &self,
        private_key: &[u8],
        code: &RecoveryCode,
    ) -> Result<EncryptedPrivateKeyBlob, VaultError> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        getrandom::getrandom(&mut salt).map_err(|_| VaultError::RngError)?;
        getrandom::getrandom(&mut iv).map_err(|_| VaultError::RngError)?;

        let mut blob = EncryptedPrivateKeyBlob {
            params: self.params,
            salt,
            iv,
            ciphertext: Vec::new(),
        };
        let key = derive_key(code, &blob.salt, &blob.params)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice()).map_err(|_| VaultError::EncryptionFailed)?;
        let header = blob.header();
        blob.ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&blob.iv),
                Payload {
                    msg: private_key,
                    aad: &header,
                },
            )
            .map_err(|_| VaultError::EncryptionFailed)?;
        Ok(blob)
    }

    /// Open a blob. A wrong code and a tampered blob both yield
    /// `AuthenticationFailed`; no partial output is ever returned.
    pub fn unwrap(
        &self,
        blob: &EncryptedPrivateKeyBlob,
        code: &RecoveryCode,
    ) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        // Parameters come from the blob. Bound them before the KDF runs.
        blob.params.validate()?;
        let key = derive_key(code, &blob.salt, &blob.params)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice()).map_err(|_| VaultError::AuthenticationFailed)?;
        let header = blob.header();
        let pt = cipher
            .decrypt(
                Nonce::from_slice(&blob.iv),
                Payload {
                    msg: &blob.ciphertext,
                    aad: &header,
                },
            )
            .map_err(|_| VaultError::AuthenticationFailed)?;
        Ok(Zeroizing::new(pt))
    }
}

fn derive_key(
    code: &RecoveryCode,
    salt: &[u8; SALT_LEN],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; 32]>, VaultError> {
    let argon2_params = argon2::Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| VaultError::InvalidParams(e.to_string()))?;

    let argon2 = argon2::Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2_params,
    );

    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(code.as_str().as_bytes(), salt, output.as_mut_slice())
        .map_err(|e| VaultError::KdfFailed(e.to_string()))?;
    Ok(output)
}
