//! Verification of the `<pair-success>` confirmation.
//!
//! The server relays the account-signed device identity. We check its HMAC
//! under our advertisement secret and the account signature over our identity
//! key, countersign it, and derive the session credential.

use chrono::Utc;
use log::info;
use prost::Message;

use crate::binary::Node;
use crate::crypto::{hmac_sha256_verify, IdentityKeyPair};
use crate::error::{Error, Result};
use crate::proto::{AdvDeviceIdentity, AdvSignedDeviceIdentity, AdvSignedDeviceIdentityHmac};
use crate::store::{DeviceIdentity, SessionCredential};
use crate::transport::iq_result;
use crate::types::servers;

/// Prefix of the message the account key signs.
pub const ACCOUNT_SIGNATURE_PREFIX: [u8; 2] = [6, 0];
/// Prefix of the message the device key signs.
pub const DEVICE_SIGNATURE_PREFIX: [u8; 2] = [6, 1];

/// Outcome of a verified pairing.
#[derive(Debug, Clone)]
pub struct PairSuccess {
    pub credential: SessionCredential,
    /// `<iq type="result">` carrying `<pair-device-sign>`.
    pub reply: Node,
}

fn failed(reason: impl Into<String>) -> Error {
    Error::HandshakeVerificationFailed(reason.into())
}

/// Verify `<iq><pair-success>…</pair-success></iq>` against our identity.
pub fn verify_pair_success(iq: &Node, identity: &DeviceIdentity) -> Result<PairSuccess> {
    let success = iq
        .get_child_by_tag("pair-success")
        .ok_or_else(|| Error::Protocol("iq without pair-success".into()))?;
    let container_bytes = success
        .get_child_by_tag("device-identity")
        .and_then(Node::get_bytes)
        .ok_or_else(|| failed("pair-success without device-identity"))?;

    let container = AdvSignedDeviceIdentityHmac::decode(container_bytes)
        .map_err(|e| failed(format!("decoding device identity container: {}", e)))?;
    let details = container.details.unwrap_or_default();
    let hmac = container.hmac.unwrap_or_default();
    if !hmac_sha256_verify(&identity.adv_secret_key, &[details.as_slice()], &hmac) {
        return Err(failed("device identity HMAC mismatch"));
    }

    let mut signed = AdvSignedDeviceIdentity::decode(details.as_slice())
        .map_err(|e| failed(format!("decoding signed device identity: {}", e)))?;
    let signed_details = signed.details.clone().unwrap_or_default();
    let account_key = signed.account_signature_key.clone().unwrap_or_default();
    let account_signature = signed.account_signature.clone().unwrap_or_default();
    let identity_public = identity.identity_key.public();

    let message = [&ACCOUNT_SIGNATURE_PREFIX[..], &signed_details[..], &identity_public[..]].concat();
    IdentityKeyPair::verify(&account_key, &message, &account_signature)
        .map_err(|e| failed(format!("account signature: {}", e)))?;

    let message = [
        &DEVICE_SIGNATURE_PREFIX[..],
        &signed_details[..],
        &identity_public[..],
        &account_key[..],
    ]
    .concat();
    signed.device_signature = Some(identity.identity_key.sign(&message).to_vec());

    let device = AdvDeviceIdentity::decode(signed_details.as_slice())
        .map_err(|e| failed(format!("decoding device identity: {}", e)))?;
    let key_index = device.key_index.unwrap_or_default();

    let jid = success
        .get_child_by_tag("device")
        .and_then(|d| d.get_attr_jid("jid"))
        .ok_or_else(|| Error::Protocol("pair-success without device jid".into()))?;
    let lid = success.get_child_by_tag("device").and_then(|d| d.get_attr_jid("lid"));
    let platform = success
        .get_child_by_tag("platform")
        .and_then(|p| p.get_attr_str("name"))
        .unwrap_or_default()
        .to_string();
    let business_name = success
        .get_child_by_tag("biz")
        .and_then(|b| b.get_attr_str("name"))
        .map(String::from);

    let account = signed.encode_to_vec();
    // The server already knows the account key; it is not sent back.
    signed.account_signature_key = None;
    let reply_identity = signed.encode_to_vec();

    let id = iq.get_attr_str("id").unwrap_or_default();
    let reply = iq_result(id, Some(servers::DEFAULT_USER)).children(vec![Node::new("pair-device-sign")
        .children(vec![Node::new("device-identity")
            .attr("key-index", key_index)
            .bytes(reply_identity)])]);

    info!("paired as {} (platform {:?}, key index {})", jid, platform, key_index);
    Ok(PairSuccess {
        credential: SessionCredential {
            jid,
            lid,
            platform,
            business_name,
            account,
            key_index,
            paired_at: Utc::now(),
            last_login_at: None,
        },
        reply,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::pair_success;

    #[test]
    fn test_valid_pair_success() {
        let identity = DeviceIdentity::generate();
        let account = IdentityKeyPair::generate();
        let node = pair_success("ps.1", &identity.adv_secret_key, &identity.identity_key.public(), &account, 7);

        let result = verify_pair_success(&node, &identity).unwrap();
        assert_eq!(result.credential.jid.device, 7);
        assert_eq!(result.credential.platform, "android");
        assert_eq!(result.credential.key_index, 3);

        let sign = result.reply.get_child_by_tag("pair-device-sign").unwrap();
        let device_identity = sign.get_child_by_tag("device-identity").unwrap();
        assert_eq!(device_identity.get_attr_str("key-index"), Some("3"));
        assert_eq!(result.reply.get_attr_str("id"), Some("ps.1"));

        let sent = AdvSignedDeviceIdentity::decode(device_identity.get_bytes().unwrap()).unwrap();
        assert!(sent.account_signature_key.is_none());
        let details = sent.details.unwrap();
        let message = [
            &DEVICE_SIGNATURE_PREFIX[..],
            &details[..],
            &identity.identity_key.public()[..],
            &account.public()[..],
        ]
        .concat();
        IdentityKeyPair::verify(&identity.identity_key.public(), &message, &sent.device_signature.unwrap()).unwrap();

        let stored = AdvSignedDeviceIdentity::decode(result.credential.account.as_slice()).unwrap();
        assert_eq!(stored.account_signature_key, Some(account.public().to_vec()));
    }

    #[test]
    fn test_wrong_adv_secret_rejected() {
        let identity = DeviceIdentity::generate();
        let account = IdentityKeyPair::generate();
        let node = pair_success("ps.1", &[9u8; 32], &identity.identity_key.public(), &account, 7);
        assert!(matches!(
            verify_pair_success(&node, &identity),
            Err(Error::HandshakeVerificationFailed(ref r)) if r.contains("HMAC")
        ));
    }

    #[test]
    fn test_signature_over_other_identity_rejected() {
        let identity = DeviceIdentity::generate();
        let other = IdentityKeyPair::generate();
        let account = IdentityKeyPair::generate();
        let node = pair_success("ps.1", &identity.adv_secret_key, &other.public(), &account, 7);
        assert!(matches!(
            verify_pair_success(&node, &identity),
            Err(Error::HandshakeVerificationFailed(ref r)) if r.contains("account signature")
        ));
    }
}
