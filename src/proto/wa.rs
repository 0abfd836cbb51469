//! WhatsApp protobuf message definitions.
//!
//! Only the messages the session engine exchanges: the Noise handshake
//! envelopes, the client payload sent inside the handshake, the server
//! certificate chain and the ADV device identity used while pairing.

use prost::Message;

/// Handshake message for Noise protocol.
#[derive(Clone, PartialEq, Message)]
pub struct HandshakeMessage {
    #[prost(message, optional, tag = "2")]
    pub client_hello: Option<ClientHello>,
    #[prost(message, optional, tag = "3")]
    pub server_hello: Option<ServerHello>,
    #[prost(message, optional, tag = "4")]
    pub client_finish: Option<ClientFinish>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ClientHello {
    #[prost(bytes, optional, tag = "1")]
    pub ephemeral: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ServerHello {
    #[prost(bytes, optional, tag = "1")]
    pub ephemeral: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub r#static: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "3")]
    pub payload: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ClientFinish {
    #[prost(bytes, optional, tag = "1")]
    pub r#static: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub payload: Option<Vec<u8>>,
}

/// Server certificate chain carried in the server hello payload.
#[derive(Clone, PartialEq, Message)]
pub struct CertChain {
    #[prost(message, optional, tag = "1")]
    pub leaf: Option<NoiseCertificate>,
    #[prost(message, optional, tag = "2")]
    pub intermediate: Option<NoiseCertificate>,
}

#[derive(Clone, PartialEq, Message)]
pub struct NoiseCertificate {
    #[prost(bytes, optional, tag = "1")]
    pub details: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub signature: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CertDetails {
    #[prost(uint32, optional, tag = "1")]
    pub serial: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub issuer_serial: Option<u32>,
    #[prost(bytes, optional, tag = "3")]
    pub key: Option<Vec<u8>>,
    #[prost(uint64, optional, tag = "4")]
    pub not_before: Option<u64>,
    #[prost(uint64, optional, tag = "5")]
    pub not_after: Option<u64>,
}

/// Client payload sent in the final handshake message.
#[derive(Clone, PartialEq, Message)]
pub struct ClientPayload {
    #[prost(uint64, optional, tag = "1")]
    pub username: Option<u64>,
    #[prost(bool, optional, tag = "3")]
    pub passive: Option<bool>,
    #[prost(message, optional, tag = "5")]
    pub user_agent: Option<UserAgent>,
    #[prost(message, optional, tag = "6")]
    pub web_info: Option<WebInfo>,
    #[prost(string, optional, tag = "7")]
    pub push_name: Option<String>,
    #[prost(int32, optional, tag = "9")]
    pub session_id: Option<i32>,
    #[prost(bool, optional, tag = "10")]
    pub short_connect: Option<bool>,
    #[prost(int32, optional, tag = "12")]
    pub connect_type: Option<i32>,
    #[prost(int32, optional, tag = "13")]
    pub connect_reason: Option<i32>,
    #[prost(uint32, optional, tag = "16")]
    pub connect_attempt_count: Option<u32>,
    #[prost(uint32, optional, tag = "18")]
    pub device: Option<u32>,
    #[prost(message, optional, tag = "19")]
    pub device_pairing_data: Option<DevicePairingData>,
    #[prost(bool, optional, tag = "33")]
    pub pull: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UserAgent {
    #[prost(int32, optional, tag = "1")]
    pub platform: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub app_version: Option<AppVersion>,
    #[prost(int32, optional, tag = "3")]
    pub release_channel: Option<i32>,
    #[prost(string, optional, tag = "4")]
    pub mcc: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub mnc: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub os_version: Option<String>,
    #[prost(string, optional, tag = "7")]
    pub manufacturer: Option<String>,
    #[prost(string, optional, tag = "8")]
    pub device: Option<String>,
    #[prost(string, optional, tag = "11")]
    pub locale_language_iso_639_1: Option<String>,
    #[prost(string, optional, tag = "12")]
    pub locale_country_iso_3166_1_alpha_2: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppVersion {
    #[prost(uint32, optional, tag = "1")]
    pub primary: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub secondary: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub tertiary: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WebInfo {
    #[prost(int32, optional, tag = "4")]
    pub web_sub_platform: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DevicePairingData {
    #[prost(bytes, optional, tag = "1")]
    pub e_regid: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub e_keytype: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "3")]
    pub e_ident: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "4")]
    pub e_skey_id: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "5")]
    pub e_skey_val: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "6")]
    pub e_skey_sig: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "7")]
    pub build_hash: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "8")]
    pub device_props: Option<Vec<u8>>,
}

/// Device identity wrapper with the companion HMAC (pair-success payload).
#[derive(Clone, PartialEq, Message)]
pub struct AdvSignedDeviceIdentityHmac {
    #[prost(bytes, optional, tag = "1")]
    pub details: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub hmac: Option<Vec<u8>>,
}

/// Device identity signed by the primary device's account key.
#[derive(Clone, PartialEq, Message)]
pub struct AdvSignedDeviceIdentity {
    #[prost(bytes, optional, tag = "1")]
    pub details: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub account_signature_key: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "3")]
    pub account_signature: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "4")]
    pub device_signature: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AdvDeviceIdentity {
    #[prost(uint32, optional, tag = "1")]
    pub raw_id: Option<u32>,
    #[prost(uint64, optional, tag = "2")]
    pub timestamp: Option<u64>,
    #[prost(uint32, optional, tag = "3")]
    pub key_index: Option<u32>,
}

// Platform constants
pub mod platform {
    pub const WEB: i32 = 14;
}

// Connect type constants
pub mod connect_type {
    pub const WIFI_UNKNOWN: i32 = 1;
}

// Connect reason constants
pub mod connect_reason {
    pub const USER_ACTIVATED: i32 = 1;
}

// Web sub-platform constants
pub mod web_sub_platform {
    pub const WEB_BROWSER: i32 = 0;
}

// Release channel constants
pub mod release_channel {
    pub const RELEASE: i32 = 0;
}

/// Web client version advertised in the user agent.
pub const WA_VERSION: [u32; 3] = [2, 3000, 1_012_170_356];

fn base_payload(push_name: Option<&str>) -> ClientPayload {
    ClientPayload {
        user_agent: Some(UserAgent {
            platform: Some(platform::WEB),
            app_version: Some(AppVersion {
                primary: Some(WA_VERSION[0]),
                secondary: Some(WA_VERSION[1]),
                tertiary: Some(WA_VERSION[2]),
            }),
            release_channel: Some(release_channel::RELEASE),
            mcc: Some("000".to_string()),
            mnc: Some("000".to_string()),
            os_version: Some("0.1".to_string()),
            manufacturer: Some(String::new()),
            device: Some("Desktop".to_string()),
            locale_language_iso_639_1: Some("en".to_string()),
            locale_country_iso_3166_1_alpha_2: Some("US".to_string()),
        }),
        web_info: Some(WebInfo {
            web_sub_platform: Some(web_sub_platform::WEB_BROWSER),
        }),
        push_name: push_name.map(String::from),
        session_id: Some(rand::random()),
        short_connect: Some(true),
        connect_type: Some(connect_type::WIFI_UNKNOWN),
        connect_reason: Some(connect_reason::USER_ACTIVATED),
        ..Default::default()
    }
}

/// Client payload for logging in with an existing credential.
pub fn make_login_payload(user: u64, device: u32, push_name: Option<&str>) -> ClientPayload {
    ClientPayload {
        username: Some(user),
        device: Some(device),
        passive: Some(true),
        pull: Some(true),
        ..base_payload(push_name)
    }
}

/// Client payload for registering a new companion (pairing).
pub fn make_registration_payload(
    pairing_data: DevicePairingData,
    push_name: Option<&str>,
) -> ClientPayload {
    ClientPayload {
        passive: Some(false),
        pull: Some(false),
        device_pairing_data: Some(pairing_data),
        ..base_payload(push_name)
    }
}

/// Create device pairing data for registration.
pub fn make_device_pairing_data(
    reg_id: u32,
    identity_key: &[u8; 32],
    signed_prekey_id: u32,
    signed_prekey: &[u8; 32],
    signed_prekey_sig: &[u8; 64],
) -> DevicePairingData {
    // Signed prekey ID is 3 bytes big-endian
    let e_skey_id = signed_prekey_id.to_be_bytes()[1..].to_vec();

    DevicePairingData {
        e_regid: Some(reg_id.to_be_bytes().to_vec()),
        e_keytype: Some(vec![5]),
        e_ident: Some(identity_key.to_vec()),
        e_skey_id: Some(e_skey_id),
        e_skey_val: Some(signed_prekey.to_vec()),
        e_skey_sig: Some(signed_prekey_sig.to_vec()),
        build_hash: None,
        device_props: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_payload_fields() {
        let payload = make_login_payload(5511999, 12, None);
        assert_eq!(payload.username, Some(5511999));
        assert_eq!(payload.device, Some(12));
        assert_eq!(payload.passive, Some(true));
        assert!(payload.device_pairing_data.is_none());
    }

    #[test]
    fn test_registration_payload_round_trips() {
        let data = make_device_pairing_data(0x1234, &[1; 32], 1, &[2; 32], &[3; 64]);
        assert_eq!(data.e_skey_id, Some(vec![0, 0, 1]));
        assert_eq!(data.e_regid, Some(vec![0, 0, 0x12, 0x34]));

        let payload = make_registration_payload(data, Some("desk"));
        let decoded = ClientPayload::decode(payload.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, payload);
    }
}
