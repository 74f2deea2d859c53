#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::encoding::{b64_decode, b64_encode};
    use crate::identity::IdentityKeyPair;
    use crate::message::{decrypt, encrypt, EncryptedMessageEnvelope, MessageError};
    use crate::recovery_code::RecoveryCode;
    use crate::session_key::SessionKey;
    use crate::vault::{KdfParams, RecoveryVault};
    use crate::wrap::{unwrap_key, wrap_key_for};

    fn flip_bit(field: &str, bit: usize) -> String {
        let mut raw = b64_decode(field).unwrap();
        let idx = (bit / 8) % raw.len();
        raw[idx] ^= 1 << (bit % 8);
        b64_encode(&raw)
    }

    proptest! {
        // decrypt(encrypt(p, k), k) == p
        #[test]
        fn message_round_trip(key in any::<[u8; 32]>(), text in ".*") {
            let k = SessionKey::from_bytes(&key).unwrap();
            let env = encrypt(&text, &k).unwrap();
            prop_assert_eq!(decrypt(&env, &k).unwrap(), text);
        }

        // Any single-bit flip in any field is detected.
        #[test]
        fn message_tamper_detected(
            text in ".{1,64}",
            field in 0usize..3,
            bit in any::<usize>(),
        ) {
            let k = SessionKey::generate().unwrap();
            let env = encrypt(&text, &k).unwrap();
            let tampered = match field {
                0 => EncryptedMessageEnvelope { ciphertext: flip_bit(&env.ciphertext, bit), ..env.clone() },
                1 => EncryptedMessageEnvelope { iv: flip_bit(&env.iv, bit), ..env.clone() },
                _ => EncryptedMessageEnvelope { auth_tag: flip_bit(&env.auth_tag, bit), ..env.clone() },
            };
            prop_assert_eq!(decrypt(&tampered, &k), Err(MessageError::AuthenticationFailed));
        }

        #[test]
        fn wrap_round_trip(key in any::<[u8; 32]>(), conv in "[a-z0-9:_-]{1,32}") {
            let recipient = IdentityKeyPair::generate().unwrap();
            let k = SessionKey::from_bytes(&key).unwrap();
            let wrapped = wrap_key_for(&recipient.public_key(), &k, &conv).unwrap();
            prop_assert_eq!(unwrap_key(&wrapped, &recipient, &conv).unwrap(), k);
        }

        // Normalization is idempotent: canonical output parses to itself.
        #[test]
        fn recovery_code_normalization_idempotent(s in "[0-9A-HJKMNP-TV-Za-hjkmnp-tv-z]{24}") {
            let once = RecoveryCode::parse(&s).unwrap();
            let twice = RecoveryCode::parse(once.as_str()).unwrap();
            prop_assert_eq!(once.as_str(), twice.as_str());
            let lower = RecoveryCode::parse(&s.to_lowercase()).unwrap();
            prop_assert_eq!(lower, once);
        }
    }

    proptest! {
        // Argon2 is slow even at test cost; keep the case count small.
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn vault_round_trip(pk in any::<[u8; 32]>()) {
            let vault = RecoveryVault::new(KdfParams::for_tests()).unwrap();
            let code = RecoveryCode::generate().unwrap();
            let other = RecoveryCode::generate().unwrap();

            let blob = vault.wrap(&pk, &code).unwrap();
            let recovered = vault.unwrap(&blob, &code).unwrap();
            prop_assert_eq!(recovered.as_slice(), &pk[..]);
            prop_assert!(vault.unwrap(&blob, &other).is_err());
        }
    }
}
