//! Base64 helpers shared by every wire type in this crate.
//!
//! All transported binary (public keys, wrapped keys, envelope fields, vault
//! blobs) uses the standard padded alphabet.

use base64::{engine::general_purpose::STANDARD, Engine as _};

pub fn b64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn b64_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(s.trim())
}

/// Decode into a fixed-size array, returning the decoded length on mismatch.
pub fn b64_decode_array<const N: usize>(s: &str) -> Result<[u8; N], DecodeArrayError> {
    let bytes = b64_decode(s).map_err(|_| DecodeArrayError::Encoding)?;
    let got = bytes.len();
    bytes
        .try_into()
        .map_err(|_| DecodeArrayError::Length { expected: N, got })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeArrayError {
    #[error("invalid base64")]
    Encoding,
    #[error("invalid length: expected {expected}, got {got}")]
    Length { expected: usize, got: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_array_checks_length() {
        let s = b64_encode(&[7u8; 12]);
        assert_eq!(b64_decode_array::<12>(&s).unwrap(), [7u8; 12]);
        assert_eq!(
            b64_decode_array::<16>(&s),
            Err(DecodeArrayError::Length { expected: 16, got: 12 })
        );
        assert_eq!(b64_decode_array::<12>("***"), Err(DecodeArrayError::Encoding));
    }

    #[test]
    fn decode_tolerates_surrounding_whitespace() {
        let s = format!("  {}\n", b64_encode(b"hi"));
        assert_eq!(b64_decode(&s).unwrap(), b"hi");
    }
}
