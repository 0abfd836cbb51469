//! Event types delivered to registered handlers.
//!
//! Stanza events wrap the decoded node plus the attributes every consumer
//! reads; connection events report coordinator state transitions.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::binary::Node;
use crate::error::Error;
use crate::types::JID;

/// Lifecycle state of a session coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Pairing,
    Authenticating,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    /// States in which a connect attempt is already underway or established.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Pairing
                | ConnectionState::Authenticating
                | ConnectionState::Connected
                | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Pairing => "pairing",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Handler registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Message,
    Presence,
    Receipt,
    CallSignal,
    Notification,
    Connection,
    Qr,
    PairingCode,
}

fn timestamp_attr(node: &Node) -> Option<DateTime<Utc>> {
    node.get_attr_int("t")
        .and_then(|t| Utc.timestamp_opt(t, 0).single())
}

/// Incoming `<message>` stanza. Content stays encrypted; decryption is the consumer's job.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub id: String,
    pub from: JID,
    /// Sender inside a group chat
    pub participant: Option<JID>,
    pub timestamp: Option<DateTime<Utc>>,
    pub node: Node,
}

/// Incoming `<presence>` stanza.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEvent {
    pub from: JID,
    pub available: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub node: Node,
}

/// Incoming `<receipt>` stanza.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptEvent {
    pub id: String,
    pub from: JID,
    /// `None` for plain delivery receipts, otherwise `read`, `played`, ...
    pub receipt_type: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub node: Node,
}

/// Incoming `<call>` signalling stanza.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSignalEvent {
    pub from: JID,
    pub call_id: Option<String>,
    /// Tag of the first child: `offer`, `accept`, `reject`, `terminate`, ...
    pub kind: String,
    pub node: Node,
}

/// Incoming `<notification>` stanza.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub id: Option<String>,
    pub from: Option<JID>,
    pub notification_type: Option<String>,
    pub node: Node,
}

/// Connection state change.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    /// The error that caused the transition, if any
    pub error: Option<Error>,
}

/// QR code payload for pairing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrEvent {
    /// `ref,noisePub,identityPub,advSecret`, ready to be rendered
    pub code: String,
    /// How long the code is valid
    pub timeout: Duration,
}

/// Pairing code event (alternative to QR)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingCodeEvent {
    /// The pairing code to enter on the phone, `XXXX-XXXX`
    pub code: String,
}

/// Anything a handler can receive.
#[derive(Debug, Clone)]
pub enum Event {
    Message(MessageEvent),
    Presence(PresenceEvent),
    Receipt(ReceiptEvent),
    CallSignal(CallSignalEvent),
    Notification(NotificationEvent),
    Connection(ConnectionEvent),
    Qr(QrEvent),
    PairingCode(PairingCodeEvent),
}

impl Event {
    pub fn category(&self) -> EventCategory {
        match self {
            Event::Message(_) => EventCategory::Message,
            Event::Presence(_) => EventCategory::Presence,
            Event::Receipt(_) => EventCategory::Receipt,
            Event::CallSignal(_) => EventCategory::CallSignal,
            Event::Notification(_) => EventCategory::Notification,
            Event::Connection(_) => EventCategory::Connection,
            Event::Qr(_) => EventCategory::Qr,
            Event::PairingCode(_) => EventCategory::PairingCode,
        }
    }

    /// Build the event for an inbound stanza, or `None` if the tag is not an event.
    ///
    /// Stanzas missing the attributes their category requires are dropped here.
    pub fn from_stanza(node: &Node) -> Option<Event> {
        match node.tag.as_str() {
            "message" => Some(Event::Message(MessageEvent {
                id: node.get_attr_str("id")?.to_string(),
                from: node.get_attr_jid("from")?,
                participant: node.get_attr_jid("participant"),
                timestamp: timestamp_attr(node),
                node: node.clone(),
            })),
            "presence" => Some(Event::Presence(PresenceEvent {
                from: node.get_attr_jid("from")?,
                available: node.get_attr_str("type") != Some("unavailable"),
                last_seen: node
                    .get_attr_int("last")
                    .and_then(|t| Utc.timestamp_opt(t, 0).single()),
                node: node.clone(),
            })),
            "receipt" => Some(Event::Receipt(ReceiptEvent {
                id: node.get_attr_str("id")?.to_string(),
                from: node.get_attr_jid("from")?,
                receipt_type: node.get_attr_str("type").map(String::from),
                timestamp: timestamp_attr(node),
                node: node.clone(),
            })),
            "call" => {
                let signal = node.get_children().first()?;
                Some(Event::CallSignal(CallSignalEvent {
                    from: node.get_attr_jid("from")?,
                    call_id: signal.get_attr_str("call-id").map(String::from),
                    kind: signal.tag.clone(),
                    node: node.clone(),
                }))
            }
            "notification" => Some(Event::Notification(NotificationEvent {
                id: node.get_attr_str("id").map(String::from),
                from: node.get_attr_jid("from"),
                notification_type: node.get_attr_str("type").map(String::from),
                node: node.clone(),
            })),
            _ => None,
        }
    }
}
