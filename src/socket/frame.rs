//! Length-prefixed framing.
//!
//! Every frame is a 3-byte big-endian length followed by the payload. The
//! first frame a client writes on a socket is preceded by the connection header.

use crate::socket::SocketError;

/// WhatsApp connection header: 'W', 'A', magic value 6, dictionary version 3.
pub const WA_HEADER: [u8; 4] = [b'W', b'A', 6, 3];

/// Largest payload a 3-byte length can describe.
pub const MAX_FRAME_SIZE: usize = (1 << 24) - 1;

/// Encode one frame, optionally prefixed by `header`.
pub fn encode_frame(payload: &[u8], header: Option<&[u8]>) -> Result<Vec<u8>, SocketError> {
    let len = payload.len();
    if len > MAX_FRAME_SIZE {
        return Err(SocketError::FrameTooLarge(len));
    }
    let header = header.unwrap_or_default();
    let mut frame = Vec::with_capacity(header.len() + 3 + len);
    frame.extend_from_slice(header);
    frame.extend_from_slice(&(len as u32).to_be_bytes()[1..]);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Reassembles frames from arbitrarily split socket reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the socket.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame payload, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 3 {
            return None;
        }
        let len = (self.buf[0] as usize) << 16 | (self.buf[1] as usize) << 8 | self.buf[2] as usize;
        if self.buf.len() < 3 + len {
            return None;
        }
        let frame = self.buf[3..3 + len].to_vec();
        self.buf.drain(..3 + len);
        Some(frame)
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_frame_carries_header() {
        let frame = encode_frame(b"abc", Some(&WA_HEADER)).unwrap();
        assert_eq!(frame, vec![b'W', b'A', 6, 3, 0, 0, 3, b'a', b'b', b'c']);

        let frame = encode_frame(b"abc", None).unwrap();
        assert_eq!(frame, vec![0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            encode_frame(&payload, None),
            Err(SocketError::FrameTooLarge(n)) if n == MAX_FRAME_SIZE + 1
        ));
    }

    #[test]
    fn test_decoder_reassembles_split_and_coalesced_reads() {
        let mut wire = encode_frame(b"first", None).unwrap();
        wire.extend(encode_frame(b"second", None).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&wire[..2]);
        assert!(decoder.next_frame().is_none());
        decoder.push(&wire[2..10]);
        assert_eq!(decoder.next_frame().unwrap(), b"first");
        assert!(decoder.next_frame().is_none());
        decoder.push(&wire[10..]);
        assert_eq!(decoder.next_frame().unwrap(), b"second");
        assert_eq!(decoder.pending(), 0);
    }
}
