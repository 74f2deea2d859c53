//! Message envelope encryption under a conversation's session key.
//!
//! ChaCha20Poly1305 with a fresh random 96-bit nonce per message. The AEAD
//! output is split into ciphertext and the trailing 16-byte tag so each can
//! travel as its own Base64 field.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use serde::{Deserialize, Serialize};

use crate::encoding::{b64_decode, b64_decode_array, b64_encode, DecodeArrayError};
use crate::session_key::SessionKey;
use crate::transcript::{tags, Transcript};

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

const MESSAGE_DOMAIN: &str = "parley_msg";
const MESSAGE_VERSION: u64 = 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid base64 in field: {0}")]
    InvalidEncoding(&'static str),
    #[error("invalid iv length: expected 12, got {0}")]
    InvalidIvLength(usize),
    #[error("invalid auth tag length: expected 16, got {0}")]
    InvalidTagLength(usize),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("plaintext is not valid UTF-8")]
    InvalidUtf8,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("RNG failed")]
    RngError,
}

/// One encrypted message as carried by the relay. Every field is Base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessageEnvelope {
    pub ciphertext: String,
    pub iv: String,
    #[serde(rename = "authTag", alias = "auth_tag")]
    pub auth_tag: String,
}

fn message_aad() -> Vec<u8> {
    let mut t = Transcript::new(MESSAGE_DOMAIN);
    t.append_u64(tags::VERSION, MESSAGE_VERSION);
    t.into_vec()
}

/// Encrypt a UTF-8 message.
pub fn encrypt(plaintext: &str, key: &SessionKey) -> Result<EncryptedMessageEnvelope, MessageError> {
    let mut iv = [0u8; IV_LEN];
    getrandom::getrandom(&mut iv).map_err(|_| MessageError::RngError)?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let aad = message_aad();
    let mut sealed = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext.as_bytes(),
                aad: &aad,
            },
        )
        .map_err(|_| MessageError::EncryptionFailed)?;

    let tag = sealed.split_off(sealed.len() - TAG_LEN);
    Ok(EncryptedMessageEnvelope {
        ciphertext: b64_encode(&sealed),
        iv: b64_encode(&iv),
        auth_tag: b64_encode(&tag),
    })
}

/// Verify and decrypt an envelope.
///
/// Field shape is checked before any cryptography runs; nothing is returned
/// unless the tag verifies.
pub fn decrypt(envelope: &EncryptedMessageEnvelope, key: &SessionKey) -> Result<String, MessageError> {
    if envelope.iv.is_empty() {
        return Err(MessageError::MissingField("iv"));
    }
    if envelope.auth_tag.is_empty() {
        return Err(MessageError::MissingField("auth_tag"));
    }

    let iv: [u8; IV_LEN] = b64_decode_array(&envelope.iv).map_err(|e| match e {
        DecodeArrayError::Encoding => MessageError::InvalidEncoding("iv"),
        DecodeArrayError::Length { got, .. } => MessageError::InvalidIvLength(got),
    })?;
    let tag: [u8; TAG_LEN] = b64_decode_array(&envelope.auth_tag).map_err(|e| match e {
        DecodeArrayError::Encoding => MessageError::InvalidEncoding("auth_tag"),
        DecodeArrayError::Length { got, .. } => MessageError::InvalidTagLength(got),
    })?;
    // An empty ciphertext is legitimate for an empty message.
    let mut sealed =
        b64_decode(&envelope.ciphertext).map_err(|_| MessageError::InvalidEncoding("ciphertext"))?;
    sealed.extend_from_slice(&tag);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let aad = message_aad();
    let pt = cipher
        .decrypt(Nonce::from_slice(&iv), Payload { msg: &sealed, aad: &aad })
        .map_err(|_| MessageError::AuthenticationFailed)?;

    String::from_utf8(pt).map_err(|_| MessageError::InvalidUtf8)
}
