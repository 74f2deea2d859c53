//! Identity module for the per-installation key pair.
//!
//! One X25519 key pair per device. The public half is published to the relay
//! so peers can wrap session keys for us; the private half only ever leaves
//! this type as zeroizing bytes handed to the recovery vault.

use std::fmt;

use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::encoding::{b64_decode, b64_encode};
use crate::hash::fingerprint;
use crate::utils::constant_time_compare_array;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const PRIVATE_KEY_LEN: usize = 32;

/// Error type for identity operations.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid base64 in public key")]
    InvalidEncoding,
    #[error("RNG failed")]
    RngError,
}

/// Public half of an identity, in the canonical 32-byte form exchanged with
/// the relay and other participants.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    /// Import a public key from raw bytes. Anything other than exactly 32
    /// bytes is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let arr: [u8; PUBLIC_KEY_LEN] =
            bytes
                .try_into()
                .map_err(|_| IdentityError::InvalidKeyLength {
                    expected: PUBLIC_KEY_LEN,
                    got: bytes.len(),
                })?;
        Ok(Self(arr))
    }

    /// Import a public key from its Base64 transport form.
    pub fn from_base64(s: &str) -> Result<Self, IdentityError> {
        let bytes = b64_decode(s).map_err(|_| IdentityError::InvalidEncoding)?;
        Self::from_bytes(&bytes)
    }

    pub fn to_base64(&self) -> String {
        b64_encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_LEN] {
        self.0
    }

    /// Log-safe fingerprint.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }

    pub(crate) fn to_x25519(self) -> X25519PublicKey {
        X25519PublicKey::from(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.fingerprint()).finish()
    }
}

/// A device identity: X25519 static secret plus its public key.
///
/// `StaticSecret` zeroizes itself on drop, so dropping the pair wipes the
/// private scalar.
pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeyPair {
    /// Generate a new identity from the OS random source.
    ///
    /// Fails only if the OS RNG is unavailable.
    pub fn generate() -> Result<Self, IdentityError> {
        let mut seed = Zeroizing::new([0u8; PRIVATE_KEY_LEN]);
        getrandom::getrandom(&mut *seed).map_err(|_| IdentityError::RngError)?;
        Ok(Self::from_secret(StaticSecret::from(*seed)))
    }

    /// Rebuild an identity from 32 private key bytes (as recovered from a vault blob).
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let arr: Zeroizing<[u8; PRIVATE_KEY_LEN]> = Zeroizing::new(bytes.try_into().map_err(
            |_| IdentityError::InvalidKeyLength {
                expected: PRIVATE_KEY_LEN,
                got: bytes.len(),
            },
        )?);
        Ok(Self::from_secret(StaticSecret::from(*arr)))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(*X25519PublicKey::from(&secret).as_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Private key bytes for sealing into the recovery vault.
    pub fn private_bytes(&self) -> Zeroizing<[u8; PRIVATE_KEY_LEN]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// True when `public` is this pair's public key.
    pub fn matches(&self, public: &PublicKey) -> bool {
        constant_time_compare_array(self.public.as_bytes(), public.as_bytes())
    }

    /// X25519 agreement with a peer public key.
    ///
    /// Returns `None` when the peer key is a low-order point and the shared
    /// secret would be all zeros.
    pub(crate) fn agree(&self, peer: &PublicKey) -> Option<Zeroizing<[u8; 32]>> {
        let shared = self.secret.diffie_hellman(&peer.to_x25519());
        if !shared.was_contributory() {
            return None;
        }
        Some(Zeroizing::new(shared.to_bytes()))
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
