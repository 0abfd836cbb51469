//! Keepalive pings and inbound-silence detection.

use std::time::Duration;

use tokio::time::Instant;

use crate::binary::Node;
use crate::transport::request::{iq, iq_result};

/// Client ping: `<iq xmlns="w:p" type="get"><ping/></iq>`.
pub fn ping(id: &str) -> Node {
    iq(id, "get", "w:p").children(vec![Node::new("ping")])
}

/// Server-initiated ping that expects an `<iq type="result">`.
pub fn is_server_ping(node: &Node) -> bool {
    node.tag == "iq"
        && node.get_attr_str("type") == Some("get")
        && node.get_attr_str("xmlns") == Some("urn:xmpp:ping")
}

/// Reply to a server ping.
pub fn pong(ping: &Node) -> Node {
    let to = ping.get_attr_jid("from").map(|jid| jid.to_string());
    iq_result(ping.get_attr_str("id").unwrap_or_default(), to.as_deref())
}

/// Silence threshold on inbound traffic.
#[derive(Debug, Clone)]
pub struct Keepalive {
    interval: Duration,
    timeout: Duration,
}

impl Keepalive {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True once nothing has arrived for longer than the timeout.
    pub fn is_silent(&self, last_inbound: Instant, now: Instant) -> bool {
        now.saturating_duration_since(last_inbound) > self.timeout
    }
}
