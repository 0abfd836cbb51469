//! QR code pairing.
//!
//! The server hands out a batch of refs in `<pair-device>`; each one becomes a
//! QR payload shown for a limited time before the next one replaces it.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::binary::Node;
use crate::error::{Error, Result};
use crate::store::DeviceIdentity;

/// QR payload for one ref: `ref,noisePub,identityPub,advSecret`.
pub fn qr_payload(pairing_ref: &str, identity: &DeviceIdentity) -> String {
    format!(
        "{},{},{},{}",
        pairing_ref,
        BASE64.encode(identity.noise_key.public),
        BASE64.encode(identity.identity_key.public()),
        BASE64.encode(identity.adv_secret_key)
    )
}

/// Refs carried by a `<pair-device>` stanza, in order.
pub fn pair_device_refs(pair_device: &Node) -> Result<Vec<String>> {
    let refs: Vec<String> = pair_device
        .get_children_by_tag("ref")
        .filter_map(|r| r.get_bytes())
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .collect();
    if refs.is_empty() {
        return Err(Error::Protocol("pair-device carried no refs".into()));
    }
    Ok(refs)
}

/// Rotation through the QR codes of one pairing attempt.
#[derive(Debug)]
pub struct QrRotation {
    codes: Vec<String>,
    current_index: usize,
    initial_timeout: Duration,
    rotation_timeout: Duration,
}

impl QrRotation {
    pub fn new(refs: &[String], identity: &DeviceIdentity, timeouts: (Duration, Duration)) -> Self {
        Self {
            codes: refs.iter().map(|r| qr_payload(r, identity)).collect(),
            current_index: 0,
            initial_timeout: timeouts.0,
            rotation_timeout: timeouts.1,
        }
    }

    /// Next code and how long it stays valid; `None` once the refs run out.
    pub fn next_code(&mut self) -> Option<(String, Duration)> {
        let code = self.codes.get(self.current_index)?.clone();
        let timeout = if self.current_index == 0 {
            self.initial_timeout
        } else {
            self.rotation_timeout
        };
        self.current_index += 1;
        Some((code, timeout))
    }

    /// Codes shown so far.
    pub fn shown(&self) -> usize {
        self.current_index
    }

    /// Codes not shown yet.
    pub fn remaining(&self) -> usize {
        self.codes.len() - self.current_index
    }
}
