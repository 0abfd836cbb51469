//! Pairing: linking this companion to an account by QR code or pairing code.

pub mod code;
mod engine;
mod qr;
mod verify;

pub use engine::HandshakeEngine;
pub use qr::{pair_device_refs, qr_payload, QrRotation};
pub use verify::{verify_pair_success, PairSuccess, ACCOUNT_SIGNATURE_PREFIX, DEVICE_SIGNATURE_PREFIX};

use crate::config::SessionConfig;
use crate::proto::{make_device_pairing_data, make_registration_payload};
use crate::socket::ConnectRequest;
use crate::store::DeviceIdentity;

/// Connect request that registers a new companion.
pub fn registration_request(config: &SessionConfig, identity: &DeviceIdentity) -> ConnectRequest {
    let pre_key = &identity.signed_pre_key;
    let pairing_data = make_device_pairing_data(
        identity.registration_id,
        &identity.identity_key.public(),
        pre_key.key_id,
        &pre_key.key_pair.public,
        &pre_key.signature,
    );
    ConnectRequest {
        endpoint: config.endpoint.clone(),
        origin: config.origin.clone(),
        noise_key: identity.noise_key.clone(),
        payload: make_registration_payload(pairing_data, config.push_name.as_deref()),
        timeout: config.connect_timeout(),
    }
}
