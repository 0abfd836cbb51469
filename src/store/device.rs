//! Device identity and session credential records.
//!
//! [`DeviceIdentity`] is generated once per installation; [`SessionCredential`]
//! is what pairing produces and what every later login re-uses.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{IdentityKeyPair, KeyPair, PreKey};
use crate::store::StoreError;
use crate::types::JID;

/// Version of the persisted record layout.
pub const SCHEMA_VERSION: u32 = 1;

/// Long-lived key material of this companion device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Noise Protocol static key pair
    pub noise_key: KeyPair,
    /// Identity signing key
    pub identity_key: IdentityKeyPair,
    /// Signed pre-key
    pub signed_pre_key: PreKey,
    /// Advertisement secret, HMAC key for the pairing confirmation
    pub adv_secret_key: [u8; 32],
    /// Registration ID (14 bits)
    pub registration_id: u32,
}

impl DeviceIdentity {
    /// Generate a device identity with fresh keys.
    pub fn generate() -> Self {
        let identity_key = IdentityKeyPair::generate();
        let signed_pre_key = PreKey::new_signed(1, &identity_key);
        Self {
            noise_key: KeyPair::generate(),
            identity_key,
            signed_pre_key,
            adv_secret_key: rand::random(),
            registration_id: rand::random::<u32>() & 0x3FFF,
        }
    }
}

/// Result of a successful pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCredential {
    /// Device JID assigned by the server
    pub jid: JID,
    /// Linked ID (LID)
    pub lid: Option<JID>,
    /// Platform name of the primary device
    pub platform: String,
    /// Business name (if business account)
    pub business_name: Option<String>,
    /// Account-signed device identity, sent back to the server on login
    #[serde(with = "base64_bytes")]
    pub account: Vec<u8>,
    pub key_index: u32,
    pub paired_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// The persisted unit: identity plus optional credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "StoredRecord", try_from = "StoredRecord")]
pub struct SessionRecord {
    pub session_id: String,
    pub identity: DeviceIdentity,
    pub credential: Option<SessionCredential>,
}

impl SessionRecord {
    /// A fresh, unpaired record.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            identity: DeviceIdentity::generate(),
            credential: None,
        }
    }

    /// Check if device is registered (has a credential).
    pub fn is_paired(&self) -> bool {
        self.credential.is_some()
    }
}

/// On-disk shape of [`SessionRecord`]: private keys in base64, publics derived on load.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    session_id: String,
    noise_private: String,
    identity_private: String,
    signed_pre_key_id: u32,
    signed_pre_key_private: String,
    signed_pre_key_signature: String,
    adv_secret: String,
    registration_id: u32,
    credential: Option<SessionCredential>,
}

impl From<SessionRecord> for StoredRecord {
    fn from(record: SessionRecord) -> Self {
        let identity = record.identity;
        Self {
            session_id: record.session_id,
            noise_private: BASE64.encode(identity.noise_key.private),
            identity_private: BASE64.encode(identity.identity_key.secret_bytes()),
            signed_pre_key_id: identity.signed_pre_key.key_id,
            signed_pre_key_private: BASE64.encode(identity.signed_pre_key.key_pair.private),
            signed_pre_key_signature: BASE64.encode(identity.signed_pre_key.signature),
            adv_secret: BASE64.encode(identity.adv_secret_key),
            registration_id: identity.registration_id,
            credential: record.credential,
        }
    }
}

fn decode_fixed<const N: usize>(field: &str, value: &str) -> Result<[u8; N], StoreError> {
    let bytes = BASE64
        .decode(value)
        .map_err(|e| StoreError::Corruption(format!("{}: {}", field, e)))?;
    bytes.as_slice().try_into().map_err(|_| {
        StoreError::Corruption(format!("{}: expected {} bytes, found {}", field, N, bytes.len()))
    })
}

impl TryFrom<StoredRecord> for SessionRecord {
    type Error = StoreError;

    fn try_from(stored: StoredRecord) -> Result<Self, Self::Error> {
        let identity_key = IdentityKeyPair::from_bytes(decode_fixed("identityPrivate", &stored.identity_private)?);
        let signed_pre_key = PreKey {
            key_pair: KeyPair::from_private_key(decode_fixed(
                "signedPreKeyPrivate",
                &stored.signed_pre_key_private,
            )?),
            key_id: stored.signed_pre_key_id,
            signature: decode_fixed("signedPreKeySignature", &stored.signed_pre_key_signature)?,
        };
        if !signed_pre_key.verify(&identity_key.public()) {
            return Err(StoreError::Corruption(
                "signed pre-key signature does not match identity key".into(),
            ));
        }
        if stored.registration_id > 0x3FFF {
            return Err(StoreError::Corruption(format!(
                "registration id {} out of range",
                stored.registration_id
            )));
        }

        Ok(SessionRecord {
            session_id: stored.session_id,
            identity: DeviceIdentity {
                noise_key: KeyPair::from_private_key(decode_fixed("noisePrivate", &stored.noise_private)?),
                identity_key,
                signed_pre_key,
                adv_secret_key: decode_fixed("advSecret", &stored.adv_secret)?,
                registration_id: stored.registration_id,
            },
            credential: stored.credential,
        })
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        BASE64.decode(raw).map_err(serde::de::Error::custom)
    }
}
