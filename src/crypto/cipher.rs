//! AES-GCM cipher for frame encryption.
//!
//! Each direction of a Noise transport owns one `Cipher`; the nonce is a
//! per-direction counter placed in the last 8 bytes.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use thiserror::Error;

/// AES-256-GCM cipher for encrypting/decrypting messages.
pub struct Cipher {
    key: [u8; 32],
    nonce_counter: u64,
}

impl Cipher {
    /// Create a new cipher with the given key.
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key,
            nonce_counter: 0,
        }
    }

    /// Encrypt data with associated data, advancing the nonce.
    pub fn encrypt(&mut self, plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = self.next_nonce();
        self.encrypt_with_nonce(plaintext, &nonce, ad)
    }

    /// Encrypt with a specific nonce.
    pub fn encrypt_with_nonce(
        &self,
        plaintext: &[u8],
        nonce: &[u8; 12],
        ad: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CipherError::InvalidKey)?;
        cipher
            .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad: ad })
            .map_err(|_| CipherError::EncryptionFailed)
    }

    /// Decrypt data with associated data, advancing the nonce.
    pub fn decrypt(&mut self, ciphertext: &[u8], ad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = self.next_nonce();
        self.decrypt_with_nonce(ciphertext, &nonce, ad)
    }

    /// Decrypt with a specific nonce.
    pub fn decrypt_with_nonce(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; 12],
        ad: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CipherError::InvalidKey)?;
        cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: ad })
            .map_err(|_| CipherError::DecryptionFailed)
    }

    fn next_nonce(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[4..12].copy_from_slice(&self.nonce_counter.to_be_bytes());
        self.nonce_counter += 1;
        nonce
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher")
            .field("nonce_counter", &self.nonce_counter)
            .finish_non_exhaustive()
    }
}

/// Cipher errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    #[error("invalid key")]
    InvalidKey,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("bad signature")]
    BadSignature,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let mut sender = Cipher::new([0xab; 32]);
        let mut receiver = Cipher::new([0xab; 32]);

        for msg in [&b"first"[..], &b"second"[..]] {
            let ciphertext = sender.encrypt(msg, b"ad").unwrap();
            assert_eq!(receiver.decrypt(&ciphertext, b"ad").unwrap(), msg);
        }
    }

    #[test]
    fn test_decrypt_wrong_ad_fails() {
        let mut sender = Cipher::new([0xab; 32]);
        let mut receiver = Cipher::new([0xab; 32]);

        let ciphertext = sender.encrypt(b"payload", b"correct ad").unwrap();
        assert_eq!(
            receiver.decrypt(&ciphertext, b"wrong ad"),
            Err(CipherError::DecryptionFailed)
        );
    }

    #[test]
    fn test_out_of_order_nonce_fails() {
        let mut sender = Cipher::new([0x11; 32]);
        let mut receiver = Cipher::new([0x11; 32]);

        let _skipped = sender.encrypt(b"one", &[]).unwrap();
        let second = sender.encrypt(b"two", &[]).unwrap();
        assert!(receiver.decrypt(&second, &[]).is_err());
    }
}
