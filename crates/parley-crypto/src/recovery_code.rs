//! Human-transcribable recovery codes.
//!
//! Format: four hyphen-separated groups of six symbols from the Crockford
//! Base32 alphabet, e.g. `7QH2KD-0XMA9F-TR3B8N-VW5C1E`. 24 symbols at 5 bits
//! each give 120 bits from the OS CSPRNG.
//!
//! User input is normalized before use: case is folded, whitespace and
//! hyphens are dropped, and the confusable letters `I`/`L` read as `1` and
//! `O` as `0`. A code typed back in lower case with spaces therefore derives
//! the same vault key as the generated one.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::utils::constant_time_compare;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const GROUPS: usize = 4;
const GROUP_LEN: usize = 6;
pub const SYMBOLS: usize = GROUPS * GROUP_LEN;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecoveryCodeError {
    #[error("recovery code must have 24 symbols, got {0}")]
    InvalidLength(usize),
    #[error("invalid character in recovery code: {0:?}")]
    InvalidCharacter(char),
    #[error("RNG failed")]
    RngError,
}

/// A recovery code in canonical form (upper case, grouped with hyphens).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryCode(String);

impl PartialEq for RecoveryCode {
    fn eq(&self, other: &Self) -> bool {
        constant_time_compare(self.0.as_bytes(), other.0.as_bytes())
    }
}

impl Eq for RecoveryCode {}

impl RecoveryCode {
    pub fn generate() -> Result<Self, RecoveryCodeError> {
        let mut raw = [0u8; SYMBOLS];
        getrandom::getrandom(&mut raw).map_err(|_| RecoveryCodeError::RngError)?;
        // 256 is a multiple of 32, so masking keeps every symbol uniform.
        let symbols: Zeroizing<Vec<u8>> =
            Zeroizing::new(raw.iter().map(|b| ALPHABET[(b & 0x1f) as usize]).collect());
        raw.zeroize();
        Ok(Self(group(&symbols)))
    }

    /// Normalize and validate user input.
    pub fn parse(input: &str) -> Result<Self, RecoveryCodeError> {
        let symbols = normalize(input)?;
        Ok(Self(group(&symbols)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Canonical symbols of `input`, wiped on drop.
fn normalize(input: &str) -> Result<Zeroizing<Vec<u8>>, RecoveryCodeError> {
    let mut symbols = Zeroizing::new(Vec::with_capacity(SYMBOLS));
    for c in input.chars() {
        if c.is_whitespace() || c == '-' {
            continue;
        }
        let up = match c.to_ascii_uppercase() {
            'I' | 'L' => '1',
            'O' => '0',
            other => other,
        };
        if !up.is_ascii() || !ALPHABET.contains(&(up as u8)) {
            return Err(RecoveryCodeError::InvalidCharacter(c));
        }
        symbols.push(up as u8);
    }
    if symbols.len() != SYMBOLS {
        return Err(RecoveryCodeError::InvalidLength(symbols.len()));
    }
    Ok(symbols)
}

fn group(symbols: &[u8]) -> String {
    let mut out = String::with_capacity(SYMBOLS + GROUPS - 1);
    for (i, chunk) in symbols.chunks(GROUP_LEN).enumerate() {
        if i > 0 {
            out.push('-');
        }
        out.extend(chunk.iter().map(|&b| b as char));
    }
    out
}

impl fmt::Debug for RecoveryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecoveryCode(<redacted>)")
    }
}

impl std::str::FromStr for RecoveryCode {
    type Err = RecoveryCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_code_shape() {
        let code = RecoveryCode::generate().unwrap();
        let groups: Vec<&str> = code.as_str().split('-').collect();
        assert_eq!(groups.len(), GROUPS);
        for g in groups {
            assert_eq!(g.len(), GROUP_LEN);
            assert!(g.bytes().all(|b| ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn generated_codes_differ() {
        assert_ne!(RecoveryCode::generate().unwrap(), RecoveryCode::generate().unwrap());
    }

    #[test]
    fn parse_accepts_own_output() {
        let code = RecoveryCode::generate().unwrap();
        assert_eq!(RecoveryCode::parse(code.as_str()).unwrap(), code);
    }

    #[test]
    fn parse_normalizes_case_spacing_and_confusables() {
        let canonical = RecoveryCode::parse("7QH2KD-0XMA9F-TR3B8N-VW5C1E").unwrap();
        let typed = RecoveryCode::parse(" 7qh2kd oxma9f\ttr3b8n vw5cie ").unwrap();
        assert_eq!(typed, canonical);
        let with_l = RecoveryCode::parse("7QH2KD0XMA9FTR3B8NVW5CLE").unwrap();
        assert_eq!(with_l, canonical);
    }

    #[test]
    fn normalized_symbols_are_zeroizing() {
        let symbols: Zeroizing<Vec<u8>> = normalize("7qh2kd oxma9f tr3b8n vw5cie").unwrap();
        assert_eq!(&symbols[..], b"7QH2KD0XMA9FTR3B8NVW5C1E");
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!(
            RecoveryCode::parse("ABC"),
            Err(RecoveryCodeError::InvalidLength(3))
        );
        assert_eq!(
            RecoveryCode::parse("7QH2KD-0XMA9F-TR3B8N-VW5CUE"),
            Err(RecoveryCodeError::InvalidCharacter('U'))
        );
        assert!(matches!(
            RecoveryCode::parse("7QH2KD-0XMA9F-TR3B8N-VW5C1É"),
            Err(RecoveryCodeError::InvalidCharacter('É'))
        ));
    }

    #[test]
    fn debug_is_redacted() {
        let code = RecoveryCode::generate().unwrap();
        assert!(!format!("{:?}", code).contains(code.as_str()));
    }
}
