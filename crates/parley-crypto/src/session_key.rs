//! Per-conversation symmetric key.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::encoding::{b64_decode, b64_encode};
use crate::hash::fingerprint;
use crate::utils::constant_time_compare_array;

pub const SESSION_KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum KeyMaterialError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("invalid base64 in key")]
    InvalidEncoding,
    #[error("RNG failed")]
    RngError,
}

/// 256-bit conversation key. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        constant_time_compare_array(&self.0, &other.0)
    }
}

impl Eq for SessionKey {}

impl SessionKey {
    pub fn generate() -> Result<Self, KeyMaterialError> {
        let mut k = [0u8; SESSION_KEY_LEN];
        getrandom::getrandom(&mut k).map_err(|_| KeyMaterialError::RngError)?;
        Ok(Self(k))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyMaterialError> {
        let arr: [u8; SESSION_KEY_LEN] =
            bytes
                .try_into()
                .map_err(|_| KeyMaterialError::InvalidLength {
                    expected: SESSION_KEY_LEN,
                    got: bytes.len(),
                })?;
        Ok(Self(arr))
    }

    /// Parse the Base64 form used in the local session-key cache.
    pub fn from_base64(s: &str) -> Result<Self, KeyMaterialError> {
        let bytes = Zeroizing::new(b64_decode(s).map_err(|_| KeyMaterialError::InvalidEncoding)?);
        Self::from_bytes(&bytes)
    }

    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(b64_encode(&self.0))
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionKey").field(&self.fingerprint()).finish()
    }
}
