//! Socket layer: framing, the Noise handshake and the connector seam.
//!
//! A [`Connector`] turns a [`ConnectRequest`] into a [`Link`]: a pair of
//! halves that move plaintext frame payloads. Encryption and framing stay
//! below this seam, so the transport above only sees stanza bytes.

mod frame;
mod handshake;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::crypto::KeyPair;
use crate::proto::ClientPayload;

pub use frame::{encode_frame, FrameDecoder, MAX_FRAME_SIZE, WA_HEADER};
pub use handshake::{client_handshake, WebSocketConnector};

/// Socket errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SocketError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("timed out")]
    Timeout,
    #[error("noise handshake failed: {0}")]
    Noise(String),
    #[error("frame of {0} bytes exceeds the 3-byte length prefix")]
    FrameTooLarge(usize),
    #[error("frame decryption failed")]
    Decrypt,
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("connection closed: {0}")]
    Closed(String),
}

/// Everything a connector needs to open one authenticated link.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub endpoint: String,
    pub origin: String,
    /// Noise static key of this device
    pub noise_key: KeyPair,
    /// Login or registration payload sent in the final handshake message
    pub payload: ClientPayload,
    pub timeout: Duration,
}

/// Outbound half of a link.
#[async_trait]
pub trait FrameWriter: Send {
    /// Send one plaintext frame payload.
    async fn send_frame(&mut self, payload: Vec<u8>) -> Result<(), SocketError>;

    /// Close the socket. Errors are ignored.
    async fn close(&mut self);
}

/// Inbound half of a link.
#[async_trait]
pub trait FrameReader: Send {
    /// Next plaintext frame payload; `Ok(None)` once the peer closed.
    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, SocketError>;
}

/// An established, encrypted link.
pub struct Link {
    pub writer: Box<dyn FrameWriter>,
    pub reader: Box<dyn FrameReader>,
}

/// Opens links to the server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<Link, SocketError>;
}
