//! Pairing-code flow helpers: code validation and generation, phone number
//! normalisation, and the code-keyed wrapping of ephemeral keys.
//!
//! Wrapped blobs are `salt(32) ‖ nonce(12) ‖ AES-256-GCM(payload)` where the
//! key is HKDF-SHA256 over the code with the salt.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::Rng;

use crate::binary::Node;
use crate::crypto::{Hkdf, KeyPair};
use crate::error::{Error, Result};
use crate::transport::iq;
use crate::types::{servers, JID};

/// Characters a generated code is drawn from (Crockford base32 without 0/O/I/U).
pub const CODE_ALPHABET: &[u8; 32] = b"123456789ABCDEFGHJKLMNPQRSTVWXYZ";

pub const CODE_LENGTH: usize = 8;

const KEY_BUNDLE_INFO: &[u8] = b"link_code_pairing_key_bundle_encryption_key";
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Check a caller-supplied code and return it without the separator.
///
/// Accepts `XXXXXXXX` or `XXXX-XXXX` over `[A-Z0-9]`. Lowercase is rejected
/// rather than folded.
pub fn validate(code: &str) -> Result<String> {
    let plain: String = match code.len() {
        8 => code.to_string(),
        9 if code.as_bytes()[4] == b'-' => format!("{}{}", &code[..4], &code[5..]),
        _ => {
            return Err(Error::InvalidPairingCode(format!(
                "expected 8 characters (optionally XXXX-XXXX), got {:?}",
                code
            )))
        }
    };
    if let Some(bad) = plain.chars().find(|c| !(c.is_ascii_uppercase() || c.is_ascii_digit())) {
        return Err(Error::InvalidPairingCode(format!("character {:?} is not in [A-Z0-9]", bad)));
    }
    Ok(plain)
}

/// Generate a random code.
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Display form, `XXXX-XXXX`.
pub fn format(code: &str) -> String {
    if code.len() == CODE_LENGTH && code.is_ascii() {
        format!("{}-{}", &code[..4], &code[4..])
    } else {
        code.to_string()
    }
}

/// Strip everything but digits; at least 8 and at most 15 must remain.
pub fn normalize_phone_number(phone: &str) -> Result<String> {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < 8 {
        return Err(Error::InvalidConfig(format!(
            "phone number {:?} is too short (need at least 8 digits with country code)",
            phone
        )));
    }
    if digits.len() > 15 {
        return Err(Error::InvalidConfig(format!("phone number {:?} has more than 15 digits", phone)));
    }
    Ok(digits)
}

fn code_key(code: &str, salt: &[u8]) -> Result<Aes256Gcm> {
    let key = Hkdf::derive(Some(salt), code.as_bytes(), KEY_BUNDLE_INFO, 32);
    Aes256Gcm::new_from_slice(&key).map_err(|_| Error::Protocol("invalid pairing key length".into()))
}

/// Encrypt `payload` under a key derived from `secret`.
pub fn wrap(secret: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let salt: [u8; SALT_LEN] = rand::random();
    let nonce: [u8; NONCE_LEN] = rand::random();
    let sealed = code_key(secret, &salt)?
        .encrypt(Nonce::from_slice(&nonce), payload)
        .map_err(|_| Error::Protocol("wrapping pairing key failed".into()))?;

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + sealed.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Reverse of [`wrap`]. Fails if `secret` differs from the one used to wrap.
pub fn unwrap(secret: &str, wrapped: &[u8]) -> Result<Vec<u8>> {
    if wrapped.len() < SALT_LEN + NONCE_LEN + 16 {
        return Err(Error::Protocol(format!("wrapped key too short: {} bytes", wrapped.len())));
    }
    let (salt, rest) = wrapped.split_at(SALT_LEN);
    let (nonce, sealed) = rest.split_at(NONCE_LEN);
    code_key(secret, salt)?
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| Error::PairingRejected("wrapped key does not open with this pairing code".into()))
}

/// `link_code_companion_reg` stage `companion_hello`.
pub fn companion_hello(
    id: &str,
    phone: &str,
    wrapped_ephemeral: Vec<u8>,
    noise_public: &[u8; 32],
    platform_display: &str,
) -> Node {
    iq(id, "set", "md").children(vec![Node::new("link_code_companion_reg")
        .attr("jid", JID::new(phone, servers::DEFAULT_USER))
        .attr("stage", "companion_hello")
        .attr("should_show_push_notification", "true")
        .children(vec![
            Node::new("link_code_pairing_wrapped_companion_ephemeral_pub").bytes(wrapped_ephemeral),
            Node::new("companion_server_auth_key_pub").bytes(noise_public.to_vec()),
            Node::new("companion_platform_id").bytes(b"1".to_vec()),
            Node::new("companion_platform_display").bytes(platform_display.as_bytes().to_vec()),
            Node::new("link_code_pairing_nonce").bytes(vec![0]),
        ])])
}

/// Answer the primary's hello with our identity and the adv secret, sealed to
/// the shared secret of both ephemeral keys.
pub fn companion_finish(
    id: &str,
    code: &str,
    ephemeral: &KeyPair,
    primary_hello: &Node,
    identity_public: &[u8; 32],
    adv_secret: &[u8; 32],
) -> Result<Node> {
    let reg = primary_hello
        .get_child_by_tag("link_code_companion_reg")
        .ok_or_else(|| Error::Protocol("primary_hello without link_code_companion_reg".into()))?;
    let child_bytes = |tag: &str| {
        reg.get_child_by_tag(tag)
            .and_then(Node::get_bytes)
            .ok_or_else(|| Error::Protocol(format!("primary_hello without {}", tag)))
    };
    let pairing_ref = child_bytes("link_code_pairing_ref")?.to_vec();
    let primary_identity = child_bytes("primary_identity_pub")?.to_vec();
    let primary_ephemeral = unwrap(code, child_bytes("link_code_pairing_wrapped_primary_ephemeral_pub")?)?;
    let primary_ephemeral: [u8; 32] = primary_ephemeral
        .as_slice()
        .try_into()
        .map_err(|_| Error::Protocol("primary ephemeral key is not 32 bytes".into()))?;

    let shared = ephemeral.dh(&primary_ephemeral);
    let mut bundle = Vec::with_capacity(96);
    bundle.extend_from_slice(identity_public);
    bundle.extend_from_slice(&primary_identity);
    bundle.extend_from_slice(adv_secret);
    let wrapped_bundle = wrap(&hex::encode(shared), &bundle)?;

    let mut finish = Node::new("link_code_companion_reg")
        .attr("stage", "companion_finish")
        .children(vec![
            Node::new("link_code_pairing_wrapped_key_bundle").bytes(wrapped_bundle),
            Node::new("companion_identity_public").bytes(identity_public.to_vec()),
            Node::new("link_code_pairing_ref").bytes(pairing_ref),
        ]);
    if let Some(jid) = reg.get_attr("jid") {
        finish.set_attr("jid", jid.clone());
    }
    Ok(iq(id, "set", "md").children(vec![finish]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_both_forms() {
        assert_eq!(validate("ABCD1234").unwrap(), "ABCD1234");
        assert_eq!(validate("ABCD-1234").unwrap(), "ABCD1234");
    }

    #[test]
    fn test_validate_rejects_malformed() {
        for bad in ["", "ABC", "ABCD12345", "abcd1234", "ABCD_1234", "AB-CD1234", "ABCD!234"] {
            assert!(
                matches!(validate(bad), Err(Error::InvalidPairingCode(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_generated_codes_validate() {
        for _ in 0..20 {
            let code = generate();
            assert_eq!(validate(&code).unwrap(), code);
            assert!(!code.contains('0') && !code.contains('O'));
        }
        assert_eq!(format("ABCD1234"), "ABCD-1234");
    }

    #[test]
    fn test_phone_normalisation() {
        assert_eq!(normalize_phone_number("+55 (11) 99999-0000").unwrap(), "5511999990000");
        assert!(matches!(normalize_phone_number("12-34"), Err(Error::InvalidConfig(_))));
        assert!(normalize_phone_number("1234567890123456").is_err());
    }

    #[test]
    fn test_wrap_needs_same_code() {
        let wrapped = wrap("ABCD1234", &[7u8; 32]).unwrap();
        assert_eq!(wrapped.len(), 32 + 12 + 32 + 16);
        assert_eq!(unwrap("ABCD1234", &wrapped).unwrap(), vec![7u8; 32]);
        assert!(matches!(unwrap("ABCD1235", &wrapped), Err(Error::PairingRejected(_))));
    }

    #[test]
    fn test_companion_finish_seals_bundle_to_shared_secret() {
        let companion = KeyPair::generate();
        let primary = KeyPair::generate();
        let hello = Node::new("notification").children(vec![Node::new("link_code_companion_reg")
            .attr("jid", "5511999990000@s.whatsapp.net")
            .attr("stage", "primary_hello")
            .children(vec![
                Node::new("link_code_pairing_ref").bytes(b"ref-1".to_vec()),
                Node::new("primary_identity_pub").bytes(vec![4u8; 32]),
                Node::new("link_code_pairing_wrapped_primary_ephemeral_pub")
                    .bytes(wrap("ABCD1234", &primary.public).unwrap()),
            ])]);

        let finish = companion_finish("f.1", "ABCD1234", &companion, &hello, &[1u8; 32], &[2u8; 32]).unwrap();
        let reg = finish.get_child_by_tag("link_code_companion_reg").unwrap();
        assert_eq!(reg.get_attr_str("stage"), Some("companion_finish"));

        let sealed = reg
            .get_child_by_tag("link_code_pairing_wrapped_key_bundle")
            .and_then(Node::get_bytes)
            .unwrap();
        let shared = primary.dh(&companion.public);
        let bundle = unwrap(&hex::encode(shared), sealed).unwrap();
        assert_eq!(&bundle[..32], &[1u8; 32]);
        assert_eq!(&bundle[32..64], &[4u8; 32]);
        assert_eq!(&bundle[64..], &[2u8; 32]);
    }
}
