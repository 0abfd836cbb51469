//! whatsmeow-session: connection and session-state engine for the WhatsApp
//! Web multi-device protocol.
//!
//! ## Modules
//!
//! - `store` - Device identity and credential persistence
//! - `pairing` - QR and pairing-code linking, pair-success verification
//! - `transport` - Request correlation, keepalive and reconnect supervision
//! - `socket` - Frame codec and the Noise-over-WebSocket connector
//! - `binary` - Binary XML stanza encoding/decoding
//! - `coordinator` - The session lifecycle state machine
//! - `dispatcher` - Event handler registry
//!
//! ```no_run
//! use whatsmeow_session::{EventCategory, Event, SessionConfig, SessionCoordinator};
//!
//! # async fn run() -> whatsmeow_session::Result<()> {
//! let coordinator = SessionCoordinator::new(SessionConfig::default().with_session_id("work"));
//! coordinator.on(EventCategory::Qr, |event| {
//!     if let Event::Qr(qr) = event {
//!         println!("scan: {}", qr.code);
//!     }
//!     Ok(())
//! });
//! coordinator.connect().await?;
//! # Ok(())
//! # }
//! ```

pub mod binary;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod pairing;
pub mod proto;
pub mod socket;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use binary::{marshal, unmarshal, Node};
pub use config::{PairingMode, SessionConfig};
pub use coordinator::SessionCoordinator;
pub use dispatcher::{EventDispatcher, HandlerError, HandlerId};
pub use error::{Error, Result};
pub use socket::{Connector, WebSocketConnector};
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore, SessionCredential, SessionRecord};
pub use transport::{RequestCanceller, RequestHandle};
pub use types::{ConnectionEvent, ConnectionState, Event, EventCategory, JID};
