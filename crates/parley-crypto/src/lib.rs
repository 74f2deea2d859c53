#![forbid(unsafe_code)]

pub mod hash;
pub mod transcript;
pub mod utils;
pub mod encoding;

pub mod identity;
pub mod session_key;
pub mod wrap;
pub mod message;

pub mod recovery_code;
pub mod vault;

pub use identity::{IdentityError, IdentityKeyPair, PublicKey};
pub use message::{EncryptedMessageEnvelope, MessageError};
pub use recovery_code::{RecoveryCode, RecoveryCodeError};
pub use session_key::{KeyMaterialError, SessionKey};
pub use vault::{EncryptedPrivateKeyBlob, KdfParams, RecoveryVault, VaultError};
pub use wrap::{WrapError, WrappedKey};

#[cfg(test)]
mod proptests;
