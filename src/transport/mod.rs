//! Transport session: one encrypted link at a time, request correlation,
//! keepalive and reconnect.

mod backoff;
mod connection;
mod keepalive;
mod request;
mod session;

pub use backoff::Backoff;
pub use connection::{authenticate, stream_end_error, Connection, Routing};
pub use keepalive::{is_server_ping, ping, pong, Keepalive};
pub use request::{
    iq, iq_result, is_iq_error, is_iq_reply, server_error, RequestCanceller, RequestHandle, RequestTracker,
};
pub use session::{login_request, LinkContext, LinkEvent, TransportSession};
