//! Session-key wrapping for a single recipient.
//!
//! Sealed box: a fresh ephemeral X25519 key agrees with the recipient's
//! identity key, HKDF-SHA256 expands the shared secret into an AEAD key and
//! nonce, and ChaCha20Poly1305 seals the 32-byte session key.
//!
//! Wire form: `ephemeral_pub(32) || ciphertext+tag(48)`, Base64 on the wire.
//!
//! The AAD binds the conversation id and the recipient key, so an envelope
//! replayed under another conversation or handed to another recipient fails
//! to open. There is no sender authentication: whoever can post to the relay
//! can wrap a key for us.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::encoding::{b64_decode, b64_encode};
use crate::identity::{IdentityKeyPair, PublicKey, PUBLIC_KEY_LEN};
use crate::session_key::{SessionKey, SESSION_KEY_LEN};
use crate::transcript::{tags, Transcript};

const WRAP_DOMAIN: &str = "parley_wrap_v1";
const TAG_LEN: usize = 16;

/// Total length of a wrapped session key.
pub const WRAPPED_KEY_LEN: usize = PUBLIC_KEY_LEN + SESSION_KEY_LEN + TAG_LEN;

#[derive(Debug, thiserror::Error)]
pub enum WrapError {
    #[error("invalid base64 in wrapped key")]
    InvalidEncoding,
    #[error("invalid wrapped key length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("recipient public key is not usable for key agreement")]
    InvalidPublicKey,
    #[error("RNG failed")]
    RngError,
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed")]
    DecryptFailed,
}

/// A session key sealed to one recipient.
#[derive(Clone, PartialEq, Eq)]
pub struct WrappedKey(Vec<u8>);

impl WrappedKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, WrapError> {
        if bytes.len() != WRAPPED_KEY_LEN {
            return Err(WrapError::InvalidLength {
                expected: WRAPPED_KEY_LEN,
                got: bytes.len(),
            });
        }
        Ok(Self(bytes))
    }

    pub fn from_base64(s: &str) -> Result<Self, WrapError> {
        let bytes = b64_decode(s).map_err(|_| WrapError::InvalidEncoding)?;
        Self::from_bytes(bytes)
    }

    pub fn to_base64(&self) -> String {
        b64_encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn split(&self) -> ([u8; PUBLIC_KEY_LEN], &[u8]) {
        let (eph, ct) = self.0.split_at(PUBLIC_KEY_LEN);
        let mut eph_pub = [0u8; PUBLIC_KEY_LEN];
        eph_pub.copy_from_slice(eph);
        (eph_pub, ct)
    }
}

impl std::fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WrappedKey({} bytes)", self.0.len())
    }
}

fn wrap_aad(conversation_id: &str, recipient: &PublicKey, eph_pub: &[u8; PUBLIC_KEY_LEN]) -> Vec<u8> {
    let mut t = Transcript::new(WRAP_DOMAIN);
    t.append_str(tags::CONVERSATION, conversation_id);
    t.append_bytes(tags::RECIPIENT_KEY, recipient.as_bytes());
    t.append_bytes(tags::EPHEMERAL_KEY, eph_pub);
    t.into_vec()
}

fn kdf_key_nonce(
    shared_secret: &[u8; 32],
    eph_pub: &[u8; PUBLIC_KEY_LEN],
    recipient: &PublicKey,
) -> Result<(Zeroizing<[u8; 32]>, [u8; 12]), WrapError> {
    // HKDF-SHA256(salt = eph_pub || recipient_pub, shared_secret)
    let mut salt = [0u8; 2 * PUBLIC_KEY_LEN];
    salt[..PUBLIC_KEY_LEN].copy_from_slice(eph_pub);
    salt[PUBLIC_KEY_LEN..].copy_from_slice(recipient.as_bytes());
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret);

    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(b"parley_wrap_v1_key", key.as_mut_slice())
        .map_err(|_| WrapError::EncryptFailed)?;

    let mut nonce = [0u8; 12];
    hk.expand(b"parley_wrap_v1_nonce", &mut nonce)
        .map_err(|_| WrapError::EncryptFailed)?;

    Ok((key, nonce))
}

/// Seal `key` so that only the holder of `recipient`'s private key can open it.
pub fn wrap_key_for(
    recipient: &PublicKey,
    key: &SessionKey,
    conversation_id: &str,
) -> Result<WrappedKey, WrapError> {
    let eph = IdentityKeyPair::generate().map_err(|_| WrapError::RngError)?;
    let eph_pub = eph.public_key().to_bytes();
    let shared = eph.agree(recipient).ok_or(WrapError::InvalidPublicKey)?;

    let (key32, nonce12) = kdf_key_nonce(&shared, &eph_pub, recipient)?;
    let aad = wrap_aad(conversation_id, recipient, &eph_pub);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key32.as_slice()));
    let ct = cipher
        .encrypt(
            Nonce::from_slice(&nonce12),
            Payload {
                msg: key.as_bytes(),
                aad: &aad,
            },
        )
        .map_err(|_| WrapError::EncryptFailed)?;

    let mut out = Vec::with_capacity(WRAPPED_KEY_LEN);
    out.extend_from_slice(&eph_pub);
    out.extend_from_slice(&ct);
    WrappedKey::from_bytes(out)
}

/// Open a wrapped key with our identity. Any mismatch (wrong recipient,
/// wrong conversation, tampering) is `DecryptFailed`.
pub fn unwrap_key(
    wrapped: &WrappedKey,
    identity: &IdentityKeyPair,
    conversation_id: &str,
) -> Result<SessionKey, WrapError> {
    let (eph_pub, ct) = wrapped.split();
    let recipient = identity.public_key();
    let shared = identity
        .agree(&PublicKey::from_bytes(&eph_pub).map_err(|_| WrapError::DecryptFailed)?)
        .ok_or(WrapError::DecryptFailed)?;

    let (key32, nonce12) = kdf_key_nonce(&shared, &eph_pub, &recipient)?;
    let aad = wrap_aad(conversation_id, &recipient, &eph_pub);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key32.as_slice()));
    let pt = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&nonce12), Payload { msg: ct, aad: &aad })
            .map_err(|_| WrapError::DecryptFailed)?,
    );

    SessionKey::from_bytes(&pt).map_err(|_| WrapError::DecryptFailed)
}
