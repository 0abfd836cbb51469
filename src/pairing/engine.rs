//! Handshake engine: drives QR or pairing-code linking on an unauthenticated
//! connection until the server confirms with `<pair-success>`.

use log::{debug, info};
use tokio::time::{sleep, timeout};

use crate::binary::Node;
use crate::config::{PairingMode, SessionConfig};
use crate::crypto::KeyPair;
use crate::dispatcher::EventDispatcher;
use crate::error::{Error, Result};
use crate::pairing::code;
use crate::pairing::qr::{pair_device_refs, QrRotation};
use crate::pairing::verify::verify_pair_success;
use crate::store::{DeviceIdentity, SessionCredential};
use crate::transport::{is_iq_error, is_server_ping, iq_result, pong, server_error, stream_end_error, Connection, RequestTracker};
use crate::types::{Event, PairingCodeEvent, QrEvent};

/// Inputs of the pairing-code flow, checked before any network call.
#[derive(Debug, Clone)]
struct CodeInputs {
    phone: String,
    code: String,
}

pub struct HandshakeEngine<'a> {
    config: &'a SessionConfig,
    identity: &'a DeviceIdentity,
    dispatcher: &'a EventDispatcher,
    code: Option<CodeInputs>,
}

/// Child `tag` of an `<iq type="set">`.
fn iq_set_child<'n>(node: &'n Node, tag: &str) -> Option<&'n Node> {
    if node.tag == "iq" && node.get_attr_str("type") == Some("set") {
        node.get_child_by_tag(tag)
    } else {
        None
    }
}

fn ack_iq(node: &Node) -> Node {
    let to = node.get_attr_jid("from").map(|jid| jid.to_string());
    iq_result(node.get_attr_str("id").unwrap_or_default(), to.as_deref())
}

fn ack_notification(node: &Node) -> Node {
    let mut ack = Node::new("ack")
        .attr("id", node.get_attr_str("id").unwrap_or_default())
        .attr("class", "notification");
    if let Some(kind) = node.get_attr_str("type") {
        ack.set_attr("type", kind);
    }
    if let Some(from) = node.get_attr("from") {
        ack.set_attr("to", from.clone());
    }
    ack
}

impl<'a> HandshakeEngine<'a> {
    /// Fails with `InvalidConfig`/`InvalidPairingCode` before anything is sent.
    pub fn new(config: &'a SessionConfig, identity: &'a DeviceIdentity, dispatcher: &'a EventDispatcher) -> Result<Self> {
        let code = match config.pairing_mode {
            PairingMode::Qr => None,
            PairingMode::Code => {
                let phone = code::normalize_phone_number(config.phone_number.as_deref().unwrap_or_default())?;
                let code = match &config.custom_pairing_code {
                    Some(custom) => code::validate(custom)?,
                    None => code::generate(),
                };
                Some(CodeInputs { phone, code })
            }
        };
        Ok(Self {
            config,
            identity,
            dispatcher,
            code,
        })
    }

    /// Pair over `conn`. The whole exchange is bounded by the handshake timeout.
    pub async fn run(&self, conn: &mut Connection, tracker: &RequestTracker) -> Result<SessionCredential> {
        let flow = async {
            match &self.code {
                None => self.qr_flow(conn).await,
                Some(inputs) => self.code_flow(conn, tracker, inputs).await,
            }
        };
        match timeout(self.config.handshake_timeout(), flow).await {
            Ok(result) => result,
            Err(_) => Err(Error::PairingTimeout),
        }
    }

    async fn qr_flow(&self, conn: &mut Connection) -> Result<SessionCredential> {
        let refs = self.wait_pair_device(conn).await?;
        let mut rotation = QrRotation::new(&refs, self.identity, self.config.qr_timeouts());

        while let Some((code, ttl)) = rotation.next_code() {
            info!(
                "QR code {} valid for {:?}, {} more to rotate through",
                rotation.shown(),
                ttl,
                rotation.remaining()
            );
            self.dispatcher.dispatch(&Event::Qr(QrEvent { code, timeout: ttl }));

            let expiry = sleep(ttl);
            tokio::pin!(expiry);
            loop {
                tokio::select! {
                    _ = &mut expiry => break,
                    node = conn.next_control() => {
                        if let Some(credential) = self.on_stanza(conn, node?).await? {
                            return Ok(credential);
                        }
                    }
                }
            }
        }
        info!("all {} QR codes expired", refs.len());
        Err(Error::PairingTimeout)
    }

    async fn code_flow(
        &self,
        conn: &mut Connection,
        tracker: &RequestTracker,
        inputs: &CodeInputs,
    ) -> Result<SessionCredential> {
        self.wait_pair_device(conn).await?;

        let ephemeral = KeyPair::generate();
        let wrapped = code::wrap(&inputs.code, &ephemeral.public)?;
        let id = tracker.next_id();
        let mut hello_reply = tracker.register(&id, true)?;
        tracker.start_write(&id);
        conn.send(&code::companion_hello(
            &id,
            &inputs.phone,
            wrapped,
            &self.identity.noise_key.public,
            &self.config.platform_display,
        ))
        .await?;
        tracker.finish_write(&id);

        self.dispatcher.dispatch(&Event::PairingCode(PairingCodeEvent {
            code: code::format(&inputs.code),
        }));

        let mut awaiting_reply = true;
        loop {
            tokio::select! {
                outcome = &mut hello_reply, if awaiting_reply => {
                    awaiting_reply = false;
                    match outcome {
                        Ok(Ok(Some(reply))) if is_iq_error(&reply) => {
                            return Err(Error::PairingRejected(server_error(&reply).to_string()));
                        }
                        Ok(Ok(_)) => debug!("companion_hello accepted"),
                        Ok(Err(e)) => return Err(e),
                        Err(_) => return Err(Error::Cancelled),
                    }
                }
                node = conn.next_control() => {
                    let node = node?;
                    if let Some(stage) = link_code_stage(&node) {
                        conn.send(&ack_notification(&node)).await?;
                        match stage.as_str() {
                            "refused" => {
                                return Err(Error::PairingRejected("primary device refused the pairing code".into()));
                            }
                            "primary_hello" => {
                                let finish_id = tracker.next_id();
                                drop(tracker.register(&finish_id, true)?);
                                tracker.start_write(&finish_id);
                                let finish = code::companion_finish(
                                    &finish_id,
                                    &inputs.code,
                                    &ephemeral,
                                    &node,
                                    &self.identity.identity_key.public(),
                                    &self.identity.adv_secret_key,
                                )?;
                                conn.send(&finish).await?;
                            }
                            other => debug!("ignoring link code stage {:?}", other),
                        }
                        continue;
                    }
                    if let Some(credential) = self.on_stanza(conn, node).await? {
                        return Ok(credential);
                    }
                }
            }
        }
    }

    /// Wait for `<pair-device>`, acknowledge it and return its refs.
    async fn wait_pair_device(&self, conn: &mut Connection) -> Result<Vec<String>> {
        loop {
            let node = conn.next_control().await?;
            if let Some(pair_device) = iq_set_child(&node, "pair-device") {
                conn.send(&ack_iq(&node)).await?;
                return pair_device_refs(pair_device);
            }
            self.on_other(conn, &node).await?;
        }
    }

    /// Handle a stanza while waiting for confirmation.
    async fn on_stanza(&self, conn: &mut Connection, node: Node) -> Result<Option<SessionCredential>> {
        if iq_set_child(&node, "pair-success").is_some() {
            let success = verify_pair_success(&node, self.identity)?;
            conn.send(&success.reply).await?;
            return Ok(Some(success.credential));
        }
        if iq_set_child(&node, "pair-device").is_some() {
            debug!("ignoring repeated pair-device");
            conn.send(&ack_iq(&node)).await?;
            return Ok(None);
        }
        self.on_other(conn, &node).await?;
        Ok(None)
    }

    async fn on_other(&self, conn: &mut Connection, node: &Node) -> Result<()> {
        if let Some(err) = stream_end_error(node) {
            return Err(err);
        }
        if is_server_ping(node) {
            return conn.send(&pong(node)).await;
        }
        debug!("ignoring {} during pairing", node.describe());
        Ok(())
    }
}

fn link_code_stage(node: &Node) -> Option<String> {
    if node.tag != "notification" || node.get_attr_str("type") != Some("link_code_companion_reg") {
        return None;
    }
    node.get_child_by_tag("link_code_companion_reg")
        .and_then(|reg| reg.get_attr_str("stage"))
        .map(String::from)
}
