//! One authenticated-or-not link: the write half plus the read loop task.
//!
//! The read loop decodes every inbound frame, resolves pending requests,
//! hands stanza events to the dispatcher and forwards everything else
//! (login results, stream errors, pairing stanzas, server pings) to whoever
//! owns the connection.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::binary::{marshal, unmarshal, Node};
use crate::dispatcher::EventDispatcher;
use crate::error::{Error, Result};
use crate::socket::{ConnectRequest, Connector, FrameReader, FrameWriter};
use crate::transport::keepalive::{is_server_ping, pong};
use crate::transport::request::{is_iq_reply, RequestTracker};
use crate::types::Event;

/// Shared pieces every link of a session routes into.
#[derive(Clone)]
pub struct Routing {
    pub tracker: Arc<RequestTracker>,
    pub dispatcher: Arc<EventDispatcher>,
}

pub struct Connection {
    writer: Box<dyn FrameWriter>,
    control: mpsc::UnboundedReceiver<Result<Node>>,
    last_inbound: watch::Receiver<Instant>,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Open a link through `connector` and start its read loop.
    pub async fn open(connector: &dyn Connector, request: ConnectRequest, routing: &Routing) -> Result<Self> {
        let link = connector.connect(request).await?;
        let (control_tx, control) = mpsc::unbounded_channel();
        let (activity, last_inbound) = watch::channel(Instant::now());
        let reader = tokio::spawn(read_loop(link.reader, routing.clone(), control_tx, activity));
        Ok(Self {
            writer: link.writer,
            control,
            last_inbound,
            reader,
        })
    }

    /// Encode and write one stanza.
    pub async fn send(&mut self, node: &Node) -> Result<()> {
        debug!("--> {}", node.describe());
        self.writer.send_frame(marshal(node)).await?;
        Ok(())
    }

    /// Next stanza the read loop did not handle itself. Fails once the link is gone.
    pub async fn next_control(&mut self) -> Result<Node> {
        match self.control.recv().await {
            Some(result) => result,
            None => Err(Error::TransportClosed("read loop stopped".into())),
        }
    }

    /// When the last frame arrived.
    pub fn last_inbound(&self) -> Instant {
        *self.last_inbound.borrow()
    }

    pub async fn close(mut self) {
        self.writer.close().await;
        self.reader.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut reader: Box<dyn FrameReader>,
    routing: Routing,
    control: mpsc::UnboundedSender<Result<Node>>,
    activity: watch::Sender<Instant>,
) {
    loop {
        let frame = match reader.recv_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                let _ = control.send(Err(Error::TransportClosed("closed by server".into())));
                return;
            }
            Err(e) => {
                let _ = control.send(Err(e.into()));
                return;
            }
        };
        activity.send_replace(Instant::now());

        let node = match unmarshal(&frame) {
            Ok(node) => node,
            Err(e) => {
                warn!("dropping undecodable frame ({} bytes): {}", frame.len(), e);
                continue;
            }
        };
        debug!("<-- {}", node.describe());

        if is_iq_reply(&node) {
            if let Some(id) = node.get_attr_str("id").map(String::from) {
                if !routing.tracker.complete(&id, node) {
                    debug!("discarding reply {} with no pending request", id);
                }
                continue;
            }
        }
        if !is_control(&node) {
            if let Some(event) = Event::from_stanza(&node) {
                routing.dispatcher.dispatch(&event);
                continue;
            }
        }
        if control.send(Ok(node)).is_err() {
            return;
        }
    }
}

fn is_control(node: &Node) -> bool {
    node.tag == "notification" && node.get_attr_str("type") == Some("link_code_companion_reg")
}

/// Map a stanza that ends the stream to the error it carries.
pub fn stream_end_error(node: &Node) -> Option<Error> {
    match node.tag.as_str() {
        "stream:error" => {
            let code = node.get_attr_str("code").unwrap_or_default();
            let conflict = node.get_child_by_tag("conflict").and_then(|c| c.get_attr_str("type"));
            Some(match (code, conflict) {
                ("401", _) => Error::CredentialRevoked("stream error 401".into()),
                (_, Some("device_removed")) => Error::CredentialRevoked("device removed".into()),
                ("515", _) => Error::TransportClosed("server requested a stream restart".into()),
                (_, Some(kind)) => Error::TransportClosed(format!("stream conflict: {}", kind)),
                (code, None) => Error::TransportClosed(format!("stream error {}", code)),
            })
        }
        "failure" => Some(match node.get_attr_str("reason") {
            Some("401") => Error::CredentialRevoked("login failure 401".into()),
            Some(reason) => Error::Protocol(format!("login failure {}", reason)),
            None => Error::Protocol("login failure".into()),
        }),
        "xmlstreamend" => Some(Error::TransportClosed("stream ended".into())),
        _ => None,
    }
}

/// Wait for `<success>` after a login handshake.
pub async fn authenticate(conn: &mut Connection, limit: Duration) -> Result<()> {
    let wait = async {
        loop {
            let node = conn.next_control().await?;
            if node.tag == "success" {
                return Ok(());
            }
            if let Some(err) = stream_end_error(&node) {
                return Err(err);
            }
            if is_server_ping(&node) {
                conn.send(&pong(&node)).await?;
                continue;
            }
            debug!("ignoring {} before login completed", node.describe());
        }
    };
    timeout(limit, wait)
        .await
        .map_err(|_| Error::TransportClosed("timed out waiting for login result".into()))?
}
