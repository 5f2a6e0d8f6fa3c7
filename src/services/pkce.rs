// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! PKCE (RFC 7636) verifier and S256 challenge helpers.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};

use crate::crypto_utils::{constant_time_eq, random_url_token};

/// 48 random bytes encode to a 64-character verifier.
const VERIFIER_BYTES: usize = 48;

pub const MIN_VERIFIER_LEN: usize = 43;
pub const MAX_VERIFIER_LEN: usize = 128;

/// Fresh high-entropy code verifier.
pub fn generate_code_verifier() -> String {
    random_url_token(VERIFIER_BYTES)
}

/// RFC 7636 verifier shape: 43 to 128 unreserved characters.
pub fn is_valid_code_verifier(verifier: &str) -> bool {
    (MIN_VERIFIER_LEN..=MAX_VERIFIER_LEN).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

/// `base64url(sha256(verifier))`, no padding.
pub fn compute_code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// True iff `challenge` is the S256 challenge of `verifier`. Constant time
/// in the challenge contents.
pub fn verify_code_challenge(verifier: &str, challenge: &str) -> bool {
    constant_time_eq(&compute_code_challenge(verifier), challenge)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flip_bit(s: &str, byte: usize, bit: u8) -> Option<String> {
        let mut bytes = s.as_bytes().to_vec();
        bytes[byte] ^= 1 << bit;
        String::from_utf8(bytes).ok()
    }

    #[test]
    fn test_rfc7636_appendix_b_vector() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            compute_code_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
        assert!(verify_code_challenge(
            verifier,
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        ));
    }

    #[test]
    fn test_verifier_shape() {
        let verifier = generate_code_verifier();
        assert_eq!(verifier.len(), 64);
        assert!(verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_verifier_bounds() {
        assert!(is_valid_code_verifier(&generate_code_verifier()));
        assert!(is_valid_code_verifier(&"a".repeat(MIN_VERIFIER_LEN)));
        assert!(is_valid_code_verifier(&"a~.-_".repeat(25)));
        assert!(!is_valid_code_verifier(&"a".repeat(MIN_VERIFIER_LEN - 1)));
        assert!(!is_valid_code_verifier(&"a".repeat(MAX_VERIFIER_LEN + 1)));
        assert!(!is_valid_code_verifier(&format!("{}+", "a".repeat(50))));
        assert!(!is_valid_code_verifier(""));
    }

    #[test]
    fn test_generated_pairs_verify() {
        for _ in 0..100 {
            let verifier = generate_code_verifier();
            let challenge = compute_code_challenge(&verifier);
            assert_eq!(challenge.len(), 43);
            assert!(verify_code_challenge(&verifier, &challenge));
        }
    }

    #[test]
    fn test_single_bit_flips_fail() {
        let verifier = generate_code_verifier();
        let challenge = compute_code_challenge(&verifier);

        for byte in 0..verifier.len() {
            for bit in 0..8 {
                if let Some(mutated) = flip_bit(&verifier, byte, bit) {
                    assert!(!verify_code_challenge(&mutated, &challenge));
                }
            }
        }

        for byte in 0..challenge.len() {
            for bit in 0..8 {
                if let Some(mutated) = flip_bit(&challenge, byte, bit) {
                    assert!(!verify_code_challenge(&verifier, &mutated));
                }
            }
        }
    }

    #[test]
    fn test_empty_and_truncated_challenge() {
        let verifier = generate_code_verifier();
        let challenge = compute_code_challenge(&verifier);
        assert!(!verify_code_challenge(&verifier, ""));
        assert!(!verify_code_challenge(&verifier, &challenge[..42]));
    }
}
