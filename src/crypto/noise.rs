//! Noise handshake state for the WhatsApp server link.
//!
//! WhatsApp uses Noise_XX_25519_AESGCM_SHA256 with the connection header as
//! prologue. This type holds the symmetric state only; message layout lives in
//! the socket handshake.

use sha2::{Digest, Sha256};

use crate::crypto::{Cipher, CipherError, Hkdf, KeyPair};

/// Noise Protocol pattern identifier (exactly one hash length).
pub const NOISE_PROTOCOL_NAME: &[u8; 32] = b"Noise_XX_25519_AESGCM_SHA256\0\0\0\0";

/// Symmetric handshake state: running hash, chaining key and current cipher.
pub struct NoiseHandshake {
    hash: [u8; 32],
    chaining_key: [u8; 32],
    cipher: Option<Cipher>,
}

impl NoiseHandshake {
    /// Start a handshake for `pattern`, mixing `prologue` into the hash.
    pub fn new(pattern: &[u8], prologue: &[u8]) -> Self {
        let hash: [u8; 32] = if pattern.len() == 32 {
            let mut h = [0u8; 32];
            h.copy_from_slice(pattern);
            h
        } else {
            Sha256::digest(pattern).into()
        };
        let mut hs = Self {
            hash,
            chaining_key: hash,
            cipher: None,
        };
        hs.authenticate(prologue);
        hs
    }

    /// Mix public data into the running hash.
    pub fn authenticate(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.hash);
        hasher.update(data);
        self.hash = hasher.finalize().into();
    }

    /// Mix key material into the chaining key and rekey the cipher.
    pub fn mix_into_key(&mut self, input: &[u8]) {
        let (chaining_key, key) = Hkdf::derive_pair(&self.chaining_key, input);
        self.chaining_key = chaining_key;
        self.cipher = Some(Cipher::new(key));
    }

    /// DH between our private key and their public key, mixed into the key.
    pub fn mix_shared_secret(&mut self, ours: &KeyPair, theirs: &[u8; 32]) {
        let shared = ours.dh(theirs);
        self.mix_into_key(&shared);
    }

    /// Encrypt with the running hash as associated data, then authenticate the ciphertext.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let cipher = self.cipher.as_mut().ok_or(CipherError::InvalidKey)?;
        let ciphertext = cipher.encrypt(plaintext, &self.hash)?;
        self.authenticate(&ciphertext);
        Ok(ciphertext)
    }

    /// Decrypt with the running hash as associated data, then authenticate the ciphertext.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let cipher = self.cipher.as_mut().ok_or(CipherError::InvalidKey)?;
        let plaintext = cipher.decrypt(ciphertext, &self.hash)?;
        self.authenticate(ciphertext);
        Ok(plaintext)
    }

    /// Split into the two transport ciphers: (initiator-to-responder, responder-to-initiator).
    pub fn finish(self) -> (Cipher, Cipher) {
        let (first, second) = Hkdf::derive_pair(&self.chaining_key, &[]);
        (Cipher::new(first), Cipher::new(second))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROLOGUE: &[u8] = b"WA\x06\x03";

    #[test]
    fn test_initial_hash_is_prologue_mixed() {
        let a = NoiseHandshake::new(NOISE_PROTOCOL_NAME, PROLOGUE);
        let b = NoiseHandshake::new(NOISE_PROTOCOL_NAME, b"other");
        assert_ne!(a.hash, b.hash);
        assert_eq!(a.chaining_key, *NOISE_PROTOCOL_NAME);
    }

    #[test]
    fn test_encrypt_without_key_fails() {
        let mut hs = NoiseHandshake::new(NOISE_PROTOCOL_NAME, PROLOGUE);
        assert_eq!(hs.encrypt(b"x"), Err(CipherError::InvalidKey));
    }

    /// Runs both roles of the XX pattern and checks the transport keys agree.
    #[test]
    fn test_xx_both_sides_agree() {
        let client_static = KeyPair::generate();
        let client_eph = KeyPair::generate();
        let server_static = KeyPair::generate();
        let server_eph = KeyPair::generate();

        let mut client = NoiseHandshake::new(NOISE_PROTOCOL_NAME, PROLOGUE);
        let mut server = NoiseHandshake::new(NOISE_PROTOCOL_NAME, PROLOGUE);

        // -> e
        client.authenticate(&client_eph.public);
        server.authenticate(&client_eph.public);

        // <- e, ee, s, es
        server.authenticate(&server_eph.public);
        server.mix_shared_secret(&server_eph, &client_eph.public);
        let enc_static = server.encrypt(&server_static.public).unwrap();
        server.mix_shared_secret(&server_static, &client_eph.public);
        let enc_cert = server.encrypt(b"cert").unwrap();

        client.authenticate(&server_eph.public);
        client.mix_shared_secret(&client_eph, &server_eph.public);
        let remote_static: [u8; 32] = client.decrypt(&enc_static).unwrap().try_into().unwrap();
        assert_eq!(remote_static, server_static.public);
        client.mix_shared_secret(&client_eph, &remote_static);
        assert_eq!(client.decrypt(&enc_cert).unwrap(), b"cert");

        // -> s, se
        let enc_client_static = client.encrypt(&client_static.public).unwrap();
        client.mix_shared_secret(&client_static, &server_eph.public);
        let enc_payload = client.encrypt(b"payload").unwrap();

        let their_static: [u8; 32] = server.decrypt(&enc_client_static).unwrap().try_into().unwrap();
        server.mix_shared_secret(&server_eph, &their_static);
        assert_eq!(server.decrypt(&enc_payload).unwrap(), b"payload");

        let (mut client_write, mut client_read) = client.finish();
        let (mut server_read, mut server_write) = server.finish();

        let frame = client_write.encrypt(b"hello", &[]).unwrap();
        assert_eq!(server_read.decrypt(&frame, &[]).unwrap(), b"hello");
        let frame = server_write.encrypt(b"welcome", &[]).unwrap();
        assert_eq!(client_read.decrypt(&frame, &[]).unwrap(), b"welcome");
    }
}
