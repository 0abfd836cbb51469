//! Test doubles: a scripted connector with in-process links, and builders
//! for the stanzas a primary device would send.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use prost::Message;
use tokio::sync::mpsc;

use crate::binary::{marshal, unmarshal, Node, FLAG_COMPRESSED};
use crate::crypto::{hmac_sha256, IdentityKeyPair};
use crate::pairing::ACCOUNT_SIGNATURE_PREFIX;
use crate::proto::{AdvDeviceIdentity, AdvSignedDeviceIdentity, AdvSignedDeviceIdentityHmac};
use crate::socket::{ConnectRequest, Connector, FrameReader, FrameWriter, Link, SocketError};
use crate::store::{SessionCredential, SessionRecord};
use crate::types::JID;

/// A record that already completed pairing.
pub fn paired_record(session_id: &str) -> SessionRecord {
    let mut record = SessionRecord::new(session_id);
    record.credential = Some(SessionCredential {
        jid: JID::new_device("5511999990000", 7),
        lid: None,
        platform: "android".into(),
        business_name: None,
        account: vec![1, 2, 3],
        key_index: 1,
        paired_at: Utc::now(),
        last_login_at: None,
    });
    record
}

enum Script {
    Accept,
    Fail(SocketError),
}

/// Connector that follows a script of accepts and failures.
///
/// Each accepted connect yields a [`ServerLink`] playing the server side.
/// Connects past the end of the script fail.
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Script>>,
    links_tx: mpsc::UnboundedSender<ServerLink>,
    links_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerLink>>,
    attempts: AtomicUsize,
    requests: Mutex<Vec<ConnectRequest>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        Self {
            script: Mutex::new(VecDeque::new()),
            links_tx,
            links_rx: tokio::sync::Mutex::new(links_rx),
            attempts: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn accept(&self) {
        self.script.lock().unwrap().push_back(Script::Accept);
    }

    pub fn fail(&self, err: SocketError) {
        self.script.lock().unwrap().push_back(Script::Fail(err));
    }

    /// Server side of the next accepted connect.
    pub async fn next_link(&self) -> ServerLink {
        self.links_rx.lock().await.recv().await.unwrap()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Link, SocketError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Script::Accept) => {
                let (to_server, from_client) = mpsc::unbounded_channel();
                let (to_client, from_server) = mpsc::unbounded_channel();
                let _ = self.links_tx.send(ServerLink {
                    inbound: from_client,
                    outbound: Some(to_client),
                });
                Ok(Link {
                    writer: Box::new(ChannelWriter { tx: Some(to_server) }),
                    reader: Box::new(ChannelReader { rx: from_server }),
                })
            }
            Some(Script::Fail(err)) => Err(err),
            None => Err(SocketError::Connect("no more scripted connections".into())),
        }
    }
}

struct ChannelWriter {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[async_trait]
impl FrameWriter for ChannelWriter {
    async fn send_frame(&mut self, payload: Vec<u8>) -> Result<(), SocketError> {
        match &self.tx {
            Some(tx) => tx.send(payload).map_err(|_| SocketError::Send("server gone".into())),
            None => Err(SocketError::Closed("writer closed".into())),
        }
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

struct ChannelReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameReader for ChannelReader {
    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, SocketError> {
        Ok(self.rx.recv().await)
    }
}

/// Server end of a scripted link.
pub struct ServerLink {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl ServerLink {
    /// Next stanza the client wrote; `None` once it closed.
    pub async fn recv(&mut self) -> Option<Node> {
        let frame = self.inbound.recv().await?;
        Some(unmarshal(&frame).unwrap())
    }

    pub fn send(&self, node: &Node) {
        if let Some(tx) = &self.outbound {
            let _ = tx.send(marshal(node));
        }
    }

    /// Send `node` as a zlib-compressed frame.
    pub fn send_compressed(&self, node: &Node) {
        if let Some(tx) = &self.outbound {
            let _ = tx.send(compressed_frame(node));
        }
    }

    /// Close from the server side; the client reads end of stream.
    pub fn close(&mut self) {
        self.outbound = None;
    }
}

/// Frame carrying `node` with the compressed flag and a zlib body.
pub fn compressed_frame(node: &Node) -> Vec<u8> {
    let plain = marshal(node);
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&plain[1..]).unwrap();
    let mut frame = vec![FLAG_COMPRESSED];
    frame.extend(encoder.finish().unwrap());
    frame
}

/// `<iq type="set"><pair-device>` with the given refs.
pub fn pair_device(id: &str, refs: &[&str]) -> Node {
    Node::new("iq")
        .attr("id", id)
        .attr("type", "set")
        .attr("from", "s.whatsapp.net")
        .attr("xmlns", "md")
        .children(vec![Node::new("pair-device").children(
            refs.iter()
                .map(|r| Node::new("ref").bytes(r.as_bytes().to_vec()))
                .collect(),
        )])
}

/// Split a QR payload into ref, noise key, identity key and adv secret.
pub fn parse_qr(code: &str) -> (String, [u8; 32], [u8; 32], [u8; 32]) {
    let parts: Vec<&str> = code.split(',').collect();
    assert_eq!(parts.len(), 4, "malformed QR payload {:?}", code);
    let key = |s: &str| -> [u8; 32] { BASE64.decode(s).unwrap().try_into().unwrap() };
    (parts[0].to_string(), key(parts[1]), key(parts[2]), key(parts[3]))
}

/// `<pair-success>` as the primary device would produce it after scanning
/// a code carrying `adv_secret` and `identity_public`.
pub fn pair_success(
    id: &str,
    adv_secret: &[u8; 32],
    identity_public: &[u8; 32],
    account: &IdentityKeyPair,
    device: u16,
) -> Node {
    let details = AdvDeviceIdentity {
        raw_id: Some(42),
        timestamp: Some(Utc::now().timestamp() as u64),
        key_index: Some(3),
    }
    .encode_to_vec();
    let message = [&ACCOUNT_SIGNATURE_PREFIX[..], &details[..], &identity_public[..]].concat();
    let signed = AdvSignedDeviceIdentity {
        details: Some(details),
        account_signature_key: Some(account.public().to_vec()),
        account_signature: Some(account.sign(&message).to_vec()),
        device_signature: None,
    }
    .encode_to_vec();
    let container = AdvSignedDeviceIdentityHmac {
        hmac: Some(hmac_sha256(adv_secret, &[signed.as_slice()]).to_vec()),
        details: Some(signed),
    }
    .encode_to_vec();

    Node::new("iq")
        .attr("id", id)
        .attr("type", "set")
        .attr("from", "s.whatsapp.net")
        .attr("xmlns", "md")
        .children(vec![Node::new("pair-success").children(vec![
            Node::new("device-identity").bytes(container),
            Node::new("device").attr("jid", JID::new_device("5511999990000", device)),
            Node::new("platform").attr("name", "android"),
        ])])
}
