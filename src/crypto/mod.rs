//! Cryptographic primitives for the session engine.
//!
//! This module provides:
//! - Noise handshake state for the server link
//! - AES-GCM frame ciphers
//! - Device identity keys and pairing signatures

mod cipher;
mod hkdf;
mod keypair;
mod noise;

pub use cipher::{Cipher, CipherError};
pub use hkdf::{hmac_sha256, hmac_sha256_verify, Hkdf};
pub use keypair::{IdentityKeyPair, KeyPair, PreKey};
pub use noise::{NoiseHandshake, NOISE_PROTOCOL_NAME};
