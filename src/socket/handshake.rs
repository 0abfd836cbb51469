//! WebSocket connector and the client side of the Noise handshake.
//!
//! Implements Noise_XX_25519_AESGCM_SHA256 for WhatsApp Web:
//! `-> e`, `<- e, ee, s, es`, `-> s, se` with the client payload in the
//! last message.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, info};
use prost::Message as ProstMessage;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::crypto::{Cipher, KeyPair, NoiseHandshake, NOISE_PROTOCOL_NAME};
use crate::proto::{CertChain, CertDetails, ClientFinish, ClientHello, ClientPayload, HandshakeMessage};
use crate::socket::{
    encode_frame, ConnectRequest, Connector, FrameDecoder, FrameReader, FrameWriter, Link, SocketError, WA_HEADER,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn to_key(bytes: &[u8], what: &str) -> Result<[u8; 32], SocketError> {
    bytes
        .try_into()
        .map_err(|_| SocketError::Noise(format!("invalid {} length: {} (expected 32)", what, bytes.len())))
}

async fn next_frame<S>(ws: &mut S, decoder: &mut FrameDecoder) -> Result<Vec<u8>, SocketError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        if let Some(frame) = decoder.next_frame() {
            return Ok(frame);
        }
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => decoder.push(&data),
            Some(Ok(Message::Close(frame))) => {
                let reason = frame.map(|f| format!("{}: {}", f.code, f.reason)).unwrap_or_default();
                return Err(SocketError::Closed(reason));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(SocketError::Receive(e.to_string())),
            None => return Err(SocketError::Closed("end of stream".into())),
        }
    }
}

/// The leaf certificate must vouch for the static key the server just proved.
fn check_certificate(cert: &[u8], server_static: &[u8; 32]) -> Result<(), SocketError> {
    let chain = CertChain::decode(cert).map_err(|e| SocketError::Noise(format!("certificate chain: {}", e)))?;
    let leaf = chain
        .leaf
        .and_then(|leaf| leaf.details)
        .ok_or_else(|| SocketError::Noise("certificate chain has no leaf".into()))?;
    let details =
        CertDetails::decode(leaf.as_slice()).map_err(|e| SocketError::Noise(format!("leaf certificate: {}", e)))?;
    if details.key.as_deref() != Some(&server_static[..]) {
        return Err(SocketError::Noise("leaf certificate key does not match server static key".into()));
    }
    Ok(())
}

/// Run the client handshake on an open WebSocket. Returns (write, read) ciphers.
pub async fn client_handshake<S>(
    ws: &mut S,
    decoder: &mut FrameDecoder,
    noise_key: &KeyPair,
    payload: &ClientPayload,
) -> Result<(Cipher, Cipher), SocketError>
where
    S: Sink<Message, Error = WsError> + Stream<Item = Result<Message, WsError>> + Unpin,
{
    let ephemeral = KeyPair::generate();
    let mut noise = NoiseHandshake::new(NOISE_PROTOCOL_NAME, &WA_HEADER);
    noise.authenticate(&ephemeral.public);

    // -> e
    let hello = HandshakeMessage {
        client_hello: Some(ClientHello {
            ephemeral: Some(ephemeral.public.to_vec()),
        }),
        ..Default::default()
    };
    let frame = encode_frame(&hello.encode_to_vec(), Some(&WA_HEADER))?;
    ws.send(Message::Binary(frame.into()))
        .await
        .map_err(|e| SocketError::Send(e.to_string()))?;

    // <- e, ee, s, es
    let response = next_frame(ws, decoder).await?;
    let server_hello = HandshakeMessage::decode(response.as_slice())
        .map_err(|e| SocketError::Noise(format!("decoding server hello: {}", e)))?
        .server_hello
        .ok_or_else(|| SocketError::Noise("missing server hello".into()))?;

    let server_ephemeral = to_key(
        server_hello.ephemeral.as_deref().unwrap_or_default(),
        "server ephemeral",
    )?;
    let static_ciphertext = server_hello
        .r#static
        .ok_or_else(|| SocketError::Noise("missing server static".into()))?;
    let cert_ciphertext = server_hello
        .payload
        .ok_or_else(|| SocketError::Noise("missing server payload".into()))?;

    noise.authenticate(&server_ephemeral);
    noise.mix_shared_secret(&ephemeral, &server_ephemeral);

    let server_static = noise
        .decrypt(&static_ciphertext)
        .map_err(|e| SocketError::Noise(format!("server static: {}", e)))?;
    let server_static = to_key(&server_static, "server static")?;
    noise.mix_shared_secret(&ephemeral, &server_static);

    let cert = noise
        .decrypt(&cert_ciphertext)
        .map_err(|e| SocketError::Noise(format!("server certificate: {}", e)))?;
    check_certificate(&cert, &server_static)?;

    // -> s, se
    let static_encrypted = noise
        .encrypt(&noise_key.public)
        .map_err(|e| SocketError::Noise(e.to_string()))?;
    noise.mix_shared_secret(noise_key, &server_ephemeral);
    let payload_encrypted = noise
        .encrypt(&payload.encode_to_vec())
        .map_err(|e| SocketError::Noise(e.to_string()))?;

    let finish = HandshakeMessage {
        client_finish: Some(ClientFinish {
            r#static: Some(static_encrypted),
            payload: Some(payload_encrypted),
        }),
        ..Default::default()
    };
    let frame = encode_frame(&finish.encode_to_vec(), None)?;
    ws.send(Message::Binary(frame.into()))
        .await
        .map_err(|e| SocketError::Send(e.to_string()))?;

    debug!("noise handshake complete");
    Ok(noise.finish())
}

/// Connector over a real WebSocket.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }

    async fn open(request: &ConnectRequest) -> Result<Link, SocketError> {
        let mut http = request
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| SocketError::Connect(e.to_string()))?;
        let origin = HeaderValue::from_str(&request.origin).map_err(|e| SocketError::Connect(e.to_string()))?;
        http.headers_mut().insert("Origin", origin);

        let (mut ws, _response) = connect_async(http)
            .await
            .map_err(|e| SocketError::Connect(e.to_string()))?;
        debug!("websocket open to {}", request.endpoint);

        let mut decoder = FrameDecoder::new();
        let (write_cipher, read_cipher) =
            client_handshake(&mut ws, &mut decoder, &request.noise_key, &request.payload).await?;

        let (sink, stream) = ws.split();
        Ok(Link {
            writer: Box::new(WsWriter {
                sink,
                cipher: write_cipher,
            }),
            reader: Box::new(WsReader {
                stream,
                cipher: read_cipher,
                decoder,
            }),
        })
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Link, SocketError> {
        info!("connecting to {}", request.endpoint);
        timeout(request.timeout, Self::open(&request))
            .await
            .map_err(|_| SocketError::Timeout)?
    }
}

struct WsWriter {
    sink: SplitSink<WsStream, Message>,
    cipher: Cipher,
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn send_frame(&mut self, payload: Vec<u8>) -> Result<(), SocketError> {
        let encrypted = self
            .cipher
            .encrypt(&payload, &[])
            .map_err(|e| SocketError::Send(e.to_string()))?;
        let frame = encode_frame(&encrypted, None)?;
        self.sink
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| SocketError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

struct WsReader {
    stream: SplitStream<WsStream>,
    cipher: Cipher,
    decoder: FrameDecoder,
}

#[async_trait]
impl FrameReader for WsReader {
    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, SocketError> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                let plain = self.cipher.decrypt(&frame, &[]).map_err(|_| SocketError::Decrypt)?;
                return Ok(Some(plain));
            }
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => self.decoder.push(&data),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(SocketError::Receive(e.to_string())),
            }
        }
    }
}
