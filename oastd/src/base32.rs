use data_encoding::BASE32_NOPAD;

/// Encodes `bytes` as lowercase base32 without padding.
///
/// Every externally visible identifier (test ID, canary, event ID) uses this
/// encoding so it survives DNS case folding and stays copy-pasteable into
/// URLs and domain labels.
pub fn to_base32(bytes: &[u8]) -> String {
    BASE32_NOPAD.encode(bytes).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn sixteen_bytes_encode_to_26_chars() {
        assert_eq!(to_base32(&[0u8; 16]).len(), 26);
        assert_eq!(to_base32(&[0xFF; 16]).len(), 26);
    }

    proptest! {
        #[test]
        fn output_is_lowercase_without_padding(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let encoded = to_base32(&bytes);
            prop_assert!(encoded.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
            prop_assert!(!encoded.contains('='));
        }

        #[test]
        fn round_trips_through_uppercase(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let encoded = to_base32(&bytes);
            let decoded = BASE32_NOPAD
                .decode(encoded.to_ascii_uppercase().as_bytes())
                .expect("re-uppercased output is valid base32");
            prop_assert_eq!(decoded, bytes);
        }
    }
}
