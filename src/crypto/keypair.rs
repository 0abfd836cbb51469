//! Key pair utilities for the companion device identity.
//!
//! Curve25519 pairs are used for the Noise static key and the signed pre-key;
//! the account-facing identity key is an Ed25519 signing pair.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use super::CipherError;

/// A Curve25519 key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    /// Public key (32 bytes)
    pub public: [u8; 32],
    /// Private key (32 bytes)
    pub private: [u8; 32],
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let mut private = [0u8; 32];
        OsRng.fill_bytes(&mut private);
        Self::from_private_key(private)
    }

    /// Create a key pair from an existing private key.
    pub fn from_private_key(private: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);

        Self {
            public: *public.as_bytes(),
            private,
        }
    }

    /// Perform X25519 Diffie-Hellman key agreement.
    pub fn dh(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(self.private);
        let shared = secret.diffie_hellman(&PublicKey::from(*their_public));
        *shared.as_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// Ed25519 identity key. Signs device identities during pairing.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(secret: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&secret),
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// Verify `signature` over `message` by the holder of `public`.
    pub fn verify(public: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CipherError> {
        let public: [u8; 32] = public.try_into().map_err(|_| CipherError::InvalidKey)?;
        let key = VerifyingKey::from_bytes(&public).map_err(|_| CipherError::InvalidKey)?;
        let signature = Signature::from_slice(signature).map_err(|_| CipherError::BadSignature)?;
        key.verify(message, &signature)
            .map_err(|_| CipherError::BadSignature)
    }
}

impl PartialEq for IdentityKeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.signing.to_bytes() == other.signing.to_bytes()
    }
}

impl Eq for IdentityKeyPair {}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &hex::encode(self.public()))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// A signed pre-key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreKey {
    /// The key pair
    pub key_pair: KeyPair,
    /// Key ID
    pub key_id: u32,
    /// Identity signature over `0x05 || public`
    pub signature: [u8; 64],
}

impl PreKey {
    /// Generate a pre-key signed by the given identity.
    pub fn new_signed(key_id: u32, identity: &IdentityKeyPair) -> Self {
        let key_pair = KeyPair::generate();
        let signature = identity.sign(&Self::signed_message(&key_pair.public));
        Self {
            key_pair,
            key_id,
            signature,
        }
    }

    fn signed_message(public: &[u8; 32]) -> [u8; 33] {
        let mut message = [0u8; 33];
        message[0] = 0x05; // DJB type
        message[1..].copy_from_slice(public);
        message
    }

    /// Check the pre-key signature against an identity public key.
    pub fn verify(&self, identity_public: &[u8; 32]) -> bool {
        IdentityKeyPair::verify(
            identity_public,
            &Self::signed_message(&self.key_pair.public),
            &self.signature,
        )
        .is_ok()
    }
}
