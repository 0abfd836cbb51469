//! Binary XML encoding and decoding for WhatsApp protocol.
//!
//! WhatsApp uses a custom binary XML format for efficient stanza encoding.
//! This module provides encoding and decoding of Node structures.

mod decoder;
mod encoder;
mod node;
mod token;

pub use decoder::{decode, unmarshal, DecodeError, Decoder, FLAG_COMPRESSED, MAX_DEPTH};
pub use encoder::{encode, marshal, Encoder};
pub use node::*;
pub use token::{get_token, get_token_index, SINGLE_BYTE_TOKENS};
