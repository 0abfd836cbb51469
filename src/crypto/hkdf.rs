//! HKDF and HMAC helpers (SHA-256).

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over the concatenation of `parts`.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Constant-time check of an HMAC-SHA256 tag.
pub fn hmac_sha256_verify(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(tag).is_ok()
}

/// HKDF-SHA256 key derivation.
pub struct Hkdf {
    prk: [u8; 32],
}

impl Hkdf {
    /// HKDF-Extract with the given salt (zero salt when absent).
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = salt.unwrap_or(&[0u8; 32]);
        Self {
            prk: hmac_sha256(salt, &[ikm]),
        }
    }

    /// HKDF-Expand to `length` bytes.
    pub fn expand(&self, info: &[u8], length: usize) -> Vec<u8> {
        let mut output = Vec::with_capacity(length);
        let mut t: Vec<u8> = Vec::new();
        let mut counter = 1u8;

        while output.len() < length {
            t = hmac_sha256(&self.prk, &[&t, info, &[counter]]).to_vec();
            let to_copy = (length - output.len()).min(t.len());
            output.extend_from_slice(&t[..to_copy]);
            counter += 1;
        }

        output
    }

    /// Extract and expand in one call.
    pub fn derive(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], length: usize) -> Vec<u8> {
        Self::new(salt, ikm).expand(info, length)
    }

    /// Derive two 32-byte keys.
    pub fn derive_pair(salt: &[u8], ikm: &[u8]) -> ([u8; 32], [u8; 32]) {
        let derived = Self::derive(Some(salt), ikm, b"", 64);
        let mut first = [0u8; 32];
        let mut second = [0u8; 32];
        first.copy_from_slice(&derived[..32]);
        second.copy_from_slice(&derived[32..]);
        (first, second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 5869 test case 1
    #[test]
    fn test_hkdf_rfc5869_case1() {
        let ikm = [0x0b; 22];
        let salt: Vec<u8> = (0x00..=0x0c).collect();
        let info: Vec<u8> = (0xf0..=0xf9).collect();

        let okm = Hkdf::derive(Some(&salt), &ikm, &info, 42);
        assert_eq!(
            hex::encode(okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn test_derive_pair_distinct() {
        let (a, b) = Hkdf::derive_pair(&[0xcd; 32], &[0xab; 32]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hmac_verify() {
        let tag = hmac_sha256(b"secret", &[b"a", b"b"]);
        assert!(hmac_sha256_verify(b"secret", &[b"ab"], &tag));
        assert!(!hmac_sha256_verify(b"other", &[b"ab"], &tag));
    }
}
