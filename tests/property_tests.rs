//! Property-based tests for invariants using proptest
//!
//! These verify properties that must hold for all inputs:
//! - Comparator semantics (literal boundaries, epsilon equality)
//! - Token hash round trips
//! - Credential cipher round trips
//! - Envelope encode/decode of arbitrary request ids

use fleet_control::crypto;
use fleet_control::protocol::{Envelope, MessageKind};
use fleet_control::store::Comparator;
use proptest::prelude::*;

// Property: > and <= partition the plane (away from the boundary)
proptest! {
    #[test]
    fn prop_gt_and_le_are_complementary(
        actual in -1000.0f64..1000.0f64,
        threshold in -1000.0f64..1000.0f64,
    ) {
        prop_assert_ne!(
            Comparator::Gt.matches(actual, threshold),
            Comparator::Le.matches(actual, threshold)
        );
    }
}

// Property: equality tolerates noise strictly below the 0.01 epsilon
proptest! {
    #[test]
    fn prop_eq_accepts_sub_epsilon_noise(
        threshold in -1000.0f64..1000.0f64,
        noise in -0.009f64..0.009f64,
    ) {
        prop_assert!(Comparator::Eq.matches(threshold + noise, threshold));
    }
}

// Property: a value at least epsilon away never compares equal
proptest! {
    #[test]
    fn prop_eq_rejects_clear_differences(
        threshold in -1000.0f64..1000.0f64,
        offset in 0.011f64..100.0f64,
    ) {
        prop_assert!(!Comparator::Eq.matches(threshold + offset, threshold));
        prop_assert!(!Comparator::Eq.matches(threshold - offset, threshold));
    }
}

// Property: a hashed token always verifies against its own hash and a
// different token never does
proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn prop_token_hash_round_trip(token in "[a-zA-Z0-9]{8,40}") {
        let hash = crypto::hash_token(&token);
        prop_assert!(crypto::verify_token(&token, &hash));

        let other = format!("{token}x");
        prop_assert!(!crypto::verify_token(&other, &hash));
    }
}

// Property: the credential cipher round-trips arbitrary strings
proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn prop_cipher_round_trip(plaintext in ".{0,200}") {
        use base64::Engine;
        let key = base64::engine::general_purpose::STANDARD.encode([3u8; 32]);
        let cipher = crypto::CredentialCipher::from_base64(&key).unwrap();

        let stored = cipher.encrypt(&plaintext);
        prop_assert_eq!(cipher.decrypt(&stored).unwrap(), plaintext);
    }
}

// Property: request envelopes survive encode/decode with id and action
// intact, for any id the correlation engine could allocate
proptest! {
    #[test]
    fn prop_envelope_round_trip(id in 1i64..i64::MAX) {
        let envelope = Envelope::request(id, "get-services", None);
        let frame = serde_json::to_string(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_str(&frame).unwrap();

        prop_assert_eq!(decoded.kind, MessageKind::Request);
        prop_assert_eq!(decoded.id, id);
        prop_assert_eq!(decoded.action, "get-services");
        prop_assert!(decoded.payload.is_none());
    }
}
