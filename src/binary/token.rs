//! Token dictionary for the binary stanza encoding.
//!
//! Strings present in the dictionary are sent as a single byte. Only the
//! vocabulary the session engine itself speaks is listed; anything else is sent
//! as a length-prefixed literal.

use std::collections::HashMap;

/// Single-byte tokens. Index 0 is reserved for the empty list marker.
pub static SINGLE_BYTE_TOKENS: &[&str] = &[
    "",                                                 // 0
    "xmlstreamstart",                                   // 1
    "xmlstreamend",                                     // 2
    "s.whatsapp.net",                                   // 3
    "type",                                             // 4
    "participant",                                      // 5
    "from",                                             // 6
    "receipt",                                          // 7
    "id",                                               // 8
    "notification",                                     // 9
    "status",                                           // 10
    "jid",                                              // 11
    "to",                                               // 12
    "message",                                          // 13
    "presence",                                         // 14
    "call",                                             // 15
    "iq",                                               // 16
    "result",                                           // 17
    "error",                                            // 18
    "get",                                              // 19
    "set",                                              // 20
    "xmlns",                                            // 21
    "code",                                             // 22
    "text",                                             // 23
    "ping",                                             // 24
    "w:p",                                              // 25
    "urn:xmpp:ping",                                    // 26
    "success",                                          // 27
    "failure",                                          // 28
    "reason",                                           // 29
    "stream:error",                                     // 30
    "conflict",                                         // 31
    "device_removed",                                   // 32
    "replaced",                                         // 33
    "pair-device",                                      // 34
    "pair-success",                                     // 35
    "pair-device-sign",                                 // 36
    "ref",                                              // 37
    "device-identity",                                  // 38
    "key-index",                                        // 39
    "device",                                           // 40
    "platform",                                         // 41
    "name",                                             // 42
    "biz",                                              // 43
    "lid",                                              // 44
    "md",                                               // 45
    "link_code_companion_reg",                          // 46
    "link_code_pairing_ref",                            // 47
    "link_code_pairing_wrapped_companion_ephemeral_pub", // 48
    "companion_server_auth_key_pub",                    // 49
    "companion_platform_id",                            // 50
    "companion_platform_display",                       // 51
    "link_code_pairing_nonce",                          // 52
    "stage",                                            // 53
    "companion_hello",                                  // 54
    "primary_hello",                                    // 55
    "refused",                                          // 56
    "should_show_push_notification",                    // 57
    "true",                                             // 58
    "false",                                            // 59
    "t",                                                // 60
    "available",                                        // 61
    "unavailable",                                      // 62
    "last",                                             // 63
    "read",                                             // 64
    "played",                                           // 65
    "offer",                                            // 66
    "accept",                                           // 67
    "reject",                                           // 68
    "terminate",                                        // 69
    "call-id",                                          // 70
    "call-creator",                                     // 71
    "enc",                                              // 72
    "v",                                                // 73
    "ack",                                              // 74
    "class",                                            // 75
    "remove-companion-device",                          // 76
    "g.us",                                             // 77
    "broadcast",                                        // 78
    "props",                                            // 79
    "creation",                                         // 80
    "location",                                         // 81
];

lazy_static::lazy_static! {
    static ref TOKEN_INDEX: HashMap<&'static str, u8> = SINGLE_BYTE_TOKENS
        .iter()
        .enumerate()
        .skip(1)
        .map(|(i, token)| (*token, i as u8))
        .collect();
}

/// Get the token index for a string (reverse lookup)
pub fn get_token_index(s: &str) -> Option<u8> {
    TOKEN_INDEX.get(s).copied()
}

/// Get the string for a token index
pub fn get_token(index: u8) -> Option<&'static str> {
    if index == 0 {
        return None;
    }
    SINGLE_BYTE_TOKENS.get(index as usize).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_lookup() {
        assert_eq!(get_token(3), Some("s.whatsapp.net"));
        assert_eq!(get_token(16), Some("iq"));
        assert_eq!(get_token(0), None);
    }

    #[test]
    fn test_reverse_lookup() {
        assert_eq!(get_token_index("s.whatsapp.net"), Some(3));
        assert_eq!(get_token_index("pair-success"), Some(35));
        assert_eq!(get_token_index(""), None);
        assert_eq!(get_token_index("unknown_string_xyz"), None);
    }

    #[test]
    fn test_dictionary_fits_below_markers() {
        assert!(SINGLE_BYTE_TOKENS.len() < super::super::encoder::AD_JID as usize);
    }
}
