//! Binary decoder for WhatsApp protocol.
//!
//! Decodes WhatsApp's binary XML format into Node structures.

use std::io::Read;

use flate2::read::ZlibDecoder;
use thiserror::Error;

use super::encoder::{AD_JID, BINARY_20, BINARY_32, BINARY_8, JID_PAIR, LIST_16, LIST_8, LIST_EMPTY};
use super::node::{AttrValue, Attrs, Node, NodeContent};
use super::token::get_token;
use crate::types::JID;

/// Bit in the frame flags byte marking a zlib-compressed body.
pub const FLAG_COMPRESSED: u8 = 0x02;

/// Deepest node nesting accepted from the wire.
pub const MAX_DEPTH: usize = 64;

/// Largest body a compressed frame may inflate to.
const MAX_INFLATED_SIZE: u64 = 16 * 1024 * 1024;

/// Error type for decoding
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("unexpected end of data")]
    UnexpectedEof,
    #[error("{0} leftover bytes after decoding")]
    Leftover(usize),
    #[error("unknown token {0:#04x}")]
    UnknownToken(u8),
    #[error("invalid list size {0}")]
    InvalidListSize(usize),
    #[error("invalid utf8 in string")]
    InvalidUtf8,
    #[error("nodes nested deeper than {0} levels")]
    TooDeep(usize),
    #[error("cannot inflate compressed frame: {0}")]
    Inflate(String),
    #[error("empty frame")]
    Empty,
}

/// Binary decoder for WhatsApp XML nodes
pub struct Decoder<'a> {
    data: &'a [u8],
    index: usize,
    depth: usize,
}

impl<'a> Decoder<'a> {
    /// Create a new decoder
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, index: 0, depth: 0 }
    }

    /// Decode the data into a node
    pub fn decode(data: &[u8]) -> Result<Node, DecodeError> {
        let mut decoder = Decoder::new(data);
        let node = decoder.read_node()?;

        if decoder.index != decoder.data.len() {
            return Err(DecodeError::Leftover(decoder.data.len() - decoder.index));
        }

        Ok(node)
    }

    fn read_byte(&mut self) -> Result<u8, DecodeError> {
        let b = *self.data.get(self.index).ok_or(DecodeError::UnexpectedEof)?;
        self.index += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.index.checked_add(n).ok_or(DecodeError::UnexpectedEof)?;
        let bytes = self.data.get(self.index..end).ok_or(DecodeError::UnexpectedEof)?;
        self.index = end;
        Ok(bytes)
    }

    fn read_int(&mut self, n: usize) -> Result<usize, DecodeError> {
        let mut result = 0usize;
        for _ in 0..n {
            result = (result << 8) | self.read_byte()? as usize;
        }
        Ok(result)
    }

    fn read_list_size(&mut self, marker: u8) -> Result<usize, DecodeError> {
        match marker {
            LIST_EMPTY => Ok(0),
            LIST_8 => Ok(self.read_byte()? as usize),
            LIST_16 => self.read_int(2),
            other => Err(DecodeError::UnknownToken(other)),
        }
    }

    /// Length-prefixed raw bytes, if `marker` is one of the binary markers.
    fn read_binary(&mut self, marker: u8) -> Result<Option<&'a [u8]>, DecodeError> {
        let len = match marker {
            BINARY_8 => self.read_byte()? as usize,
            BINARY_20 => self.read_int(3)? & 0x000F_FFFF,
            BINARY_32 => self.read_int(4)?,
            _ => return Ok(None),
        };
        self.read_bytes(len).map(Some)
    }

    fn read_string(&mut self, marker: u8) -> Result<String, DecodeError> {
        if let Some(bytes) = self.read_binary(marker)? {
            return String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8);
        }
        get_token(marker)
            .map(str::to_string)
            .ok_or(DecodeError::UnknownToken(marker))
    }

    fn read_jid_pair(&mut self) -> Result<JID, DecodeError> {
        let user_marker = self.read_byte()?;
        let user = if user_marker == LIST_EMPTY {
            String::new()
        } else {
            self.read_string(user_marker)?
        };
        let server_marker = self.read_byte()?;
        let server = self.read_string(server_marker)?;
        Ok(JID::new(user, server))
    }

    fn read_ad_jid(&mut self) -> Result<JID, DecodeError> {
        let agent = self.read_byte()?;
        let device = self.read_byte()?;
        let user_marker = self.read_byte()?;
        let user = self.read_string(user_marker)?;
        let mut jid = JID::new_device(user, device as u16);
        jid.agent = agent;
        Ok(jid)
    }

    fn read_attr_value(&mut self) -> Result<AttrValue, DecodeError> {
        let marker = self.read_byte()?;
        match marker {
            JID_PAIR => self.read_jid_pair().map(AttrValue::JID),
            AD_JID => self.read_ad_jid().map(AttrValue::JID),
            _ => self.read_string(marker).map(AttrValue::String),
        }
    }

    fn read_content(&mut self) -> Result<NodeContent, DecodeError> {
        let marker = self.read_byte()?;
        match marker {
            LIST_EMPTY | LIST_8 | LIST_16 => {
                let count = self.read_list_size(marker)?;
                let mut children = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    children.push(self.read_node()?);
                }
                Ok(NodeContent::Children(children))
            }
            _ => {
                if let Some(bytes) = self.read_binary(marker)? {
                    return Ok(NodeContent::Bytes(bytes.to_vec()));
                }
                // A token as content decodes to its text bytes
                self.read_string(marker).map(|s| NodeContent::Bytes(s.into_bytes()))
            }
        }
    }

    fn read_node(&mut self) -> Result<Node, DecodeError> {
        if self.depth >= MAX_DEPTH {
            return Err(DecodeError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let node = self.read_node_body();
        self.depth -= 1;
        node
    }

    fn read_node_body(&mut self) -> Result<Node, DecodeError> {
        let marker = self.read_byte()?;
        let size = self.read_list_size(marker)?;
        if size == 0 {
            return Err(DecodeError::InvalidListSize(0));
        }

        let tag_marker = self.read_byte()?;
        let tag = self.read_string(tag_marker)?;

        let mut attrs = Attrs::new();
        for _ in 0..(size - 1) / 2 {
            let key_marker = self.read_byte()?;
            let key = self.read_string(key_marker)?;
            let value = self.read_attr_value()?;
            attrs.insert(key, value);
        }

        let content = if size % 2 == 0 {
            self.read_content()?
        } else {
            NodeContent::None
        };

        Ok(Node { tag, attrs, content })
    }
}

/// Decode a node body (no frame flags byte)
pub fn decode(data: &[u8]) -> Result<Node, DecodeError> {
    Decoder::decode(data)
}

/// Decode a frame payload: a flags byte followed by the node body.
pub fn unmarshal(data: &[u8]) -> Result<Node, DecodeError> {
    let (flags, body) = data.split_first().ok_or(DecodeError::Empty)?;
    if flags & FLAG_COMPRESSED != 0 {
        return Decoder::decode(&inflate(body)?);
    }
    Decoder::decode(body)
}

fn inflate(body: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut inflated = Vec::new();
    ZlibDecoder::new(body)
        .take(MAX_INFLATED_SIZE + 1)
        .read_to_end(&mut inflated)
        .map_err(|e| DecodeError::Inflate(e.to_string()))?;
    if inflated.len() as u64 > MAX_INFLATED_SIZE {
        return Err(DecodeError::Inflate(format!("body exceeds {} bytes", MAX_INFLATED_SIZE)));
    }
    Ok(inflated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::{encode, marshal};
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_decode_stanza_tree() {
        let node = Node::new("iq")
            .attr("id", "3A9F.12")
            .attr("type", "result")
            .attr("from", crate::types::SERVER_JID.clone())
            .children(vec![
                Node::new("pair-device").children(vec![
                    Node::new("ref").bytes(b"ref-one".to_vec()),
                    Node::new("ref").bytes(b"ref-two".to_vec()),
                ]),
                Node::new("device").attr("jid", JID::new_device("5511", 12)),
            ]);

        let decoded = unmarshal(&marshal(&node)).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let data = encode(&Node::new("iq").attr("id", "abcdef"));
        let err = decode(&data[..data.len() - 2]).unwrap_err();
        assert_eq!(err, DecodeError::UnexpectedEof);
    }

    #[test]
    fn test_decode_rejects_leftover() {
        let mut data = encode(&Node::new("iq"));
        data.push(0x01);
        assert_eq!(decode(&data).unwrap_err(), DecodeError::Leftover(1));
    }

    #[test]
    fn test_unmarshal_inflates_compressed() {
        let node = Node::new("iq")
            .attr("id", "77.2")
            .attr("type", "result")
            .children(vec![Node::new("ref").bytes(vec![0xAB; 300])]);
        let plain = marshal(&node);
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&plain[1..]).unwrap();
        let mut frame = vec![FLAG_COMPRESSED];
        frame.extend(encoder.finish().unwrap());
        assert!(frame.len() < plain.len());
        assert_eq!(unmarshal(&frame).unwrap(), node);

        let garbage = [FLAG_COMPRESSED, 0x78, 0x9C, 0xFF, 0xFF, 0x00];
        assert!(matches!(unmarshal(&garbage), Err(DecodeError::Inflate(_))));
    }

    #[test]
    fn test_nesting_depth_is_bounded() {
        let iq = encode(&Node::new("iq"))[2];
        let nested = |levels: usize| {
            let mut data = Vec::new();
            for _ in 1..levels {
                data.extend([LIST_8, 2, iq, LIST_8, 1]);
            }
            data.extend([LIST_8, 1, iq]);
            data
        };

        let root = decode(&nested(MAX_DEPTH)).unwrap();
        let mut node = &root;
        let mut levels = 1;
        while let Some(child) = node.get_children().first() {
            node = child;
            levels += 1;
        }
        assert_eq!(levels, MAX_DEPTH);

        assert_eq!(decode(&nested(MAX_DEPTH + 1)).unwrap_err(), DecodeError::TooDeep(MAX_DEPTH));
        assert_eq!(decode(&nested(200_000)).unwrap_err(), DecodeError::TooDeep(MAX_DEPTH));
    }

    #[test]
    fn test_unknown_token() {
        assert_eq!(decode(&[LIST_8, 1, 0xE0]).unwrap_err(), DecodeError::UnknownToken(0xE0));
    }

    #[test]
    fn test_token_content_becomes_bytes() {
        let node = decode(&[LIST_8, 2, 23, 58]).unwrap();
        assert_eq!(node.tag, "text");
        assert_eq!(node.get_bytes(), Some(&b"true"[..]));
    }
}
