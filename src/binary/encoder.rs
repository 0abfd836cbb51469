//! Binary encoder for WhatsApp protocol.
//!
//! Encodes Node structures into WhatsApp's binary XML format.

use super::node::{AttrValue, Node, NodeContent};
use super::token::get_token_index;
use crate::types::JID;

pub const LIST_EMPTY: u8 = 0x00;
pub const AD_JID: u8 = 0xF7;
pub const LIST_8: u8 = 0xF8;
pub const LIST_16: u8 = 0xF9;
pub const JID_PAIR: u8 = 0xFA;
pub const BINARY_8: u8 = 0xFC;
pub const BINARY_20: u8 = 0xFD;
pub const BINARY_32: u8 = 0xFE;

/// Binary encoder for WhatsApp XML nodes
#[derive(Default)]
pub struct Encoder {
    data: Vec<u8>,
}

impl Encoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a node and return the binary data
    pub fn encode(node: &Node) -> Vec<u8> {
        let mut encoder = Self::new();
        encoder.write_node(node);
        encoder.data
    }

    fn write_byte(&mut self, b: u8) {
        self.data.push(b);
    }

    fn write_list_start(&mut self, size: usize) {
        if size == 0 {
            self.write_byte(LIST_EMPTY);
        } else if size < 256 {
            self.write_byte(LIST_8);
            self.write_byte(size as u8);
        } else {
            self.write_byte(LIST_16);
            self.data.extend_from_slice(&(size as u16).to_be_bytes());
        }
    }

    fn write_binary(&mut self, bytes: &[u8]) {
        let len = bytes.len();
        if len < 256 {
            self.write_byte(BINARY_8);
            self.write_byte(len as u8);
        } else if len < (1 << 20) {
            self.write_byte(BINARY_20);
            self.write_byte(((len >> 16) & 0x0F) as u8);
            self.write_byte(((len >> 8) & 0xFF) as u8);
            self.write_byte((len & 0xFF) as u8);
        } else {
            self.write_byte(BINARY_32);
            self.data.extend_from_slice(&(len as u32).to_be_bytes());
        }
        self.data.extend_from_slice(bytes);
    }

    /// Write a string, as a token when the dictionary has it
    fn write_string(&mut self, s: &str) {
        match get_token_index(s) {
            Some(token) => self.write_byte(token),
            None => self.write_binary(s.as_bytes()),
        }
    }

    fn write_jid(&mut self, jid: &JID) {
        if jid.is_ad() {
            self.write_byte(AD_JID);
            self.write_byte(jid.agent);
            self.write_byte(jid.device as u8);
            self.write_string(&jid.user);
        } else {
            self.write_byte(JID_PAIR);
            if jid.user.is_empty() {
                self.write_byte(LIST_EMPTY);
            } else {
                self.write_string(&jid.user);
            }
            self.write_string(&jid.server);
        }
    }

    fn write_attr_value(&mut self, value: &AttrValue) {
        match value {
            AttrValue::String(s) => self.write_string(s),
            AttrValue::JID(jid) => self.write_jid(jid),
        }
    }

    fn write_node(&mut self, node: &Node) {
        let has_content = !matches!(node.content, NodeContent::None);
        self.write_list_start(1 + node.attrs.len() * 2 + usize::from(has_content));

        self.write_string(&node.tag);

        // Sorted so the same node always encodes to the same bytes
        let mut attrs: Vec<_> = node.attrs.iter().collect();
        attrs.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in attrs {
            self.write_string(key);
            self.write_attr_value(value);
        }

        match &node.content {
            NodeContent::None => {}
            NodeContent::Bytes(bytes) => self.write_binary(bytes),
            NodeContent::Children(children) => {
                self.write_list_start(children.len());
                for child in children {
                    self.write_node(child);
                }
            }
        }
    }
}

/// Encode a node to its binary body (no frame flags byte)
pub fn encode(node: &Node) -> Vec<u8> {
    Encoder::encode(node)
}

/// Encode a node into a frame payload: a zero flags byte followed by the body.
pub fn marshal(node: &Node) -> Vec<u8> {
    let body = Encoder::encode(node);
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(0);
    out.extend_from_slice(&body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_tokenized_tag() {
        let data = encode(&Node::new("iq"));
        assert_eq!(data, vec![LIST_8, 1, 16]);
    }

    #[test]
    fn test_encode_literal_attr() {
        let node = Node::new("iq").attr("id", "AB");
        let data = encode(&node);
        assert_eq!(data, vec![LIST_8, 3, 16, 8, BINARY_8, 2, b'A', b'B']);
    }

    #[test]
    fn test_encode_server_jid() {
        let node = Node::new("iq").attr("to", crate::types::SERVER_JID.clone());
        let data = encode(&node);
        assert_eq!(&data[3..], &[12, JID_PAIR, LIST_EMPTY, 3]);
    }

    #[test]
    fn test_marshal_prefixes_flags() {
        let data = marshal(&Node::new("iq"));
        assert_eq!(data[0], 0);
        assert_eq!(&data[1..], &encode(&Node::new("iq"))[..]);
    }

    #[test]
    fn test_large_binary_uses_wide_length() {
        let node = Node::new("enc").bytes(vec![7u8; 300]);
        let data = encode(&node);
        assert_eq!(data[3], BINARY_20);
        assert_eq!(&data[4..7], &[0x00, 0x01, 0x2C]);
    }
}
