//! Types module for WhatsApp protocol types.
//!
//! JIDs, connection states and the events handed to registered handlers.

mod events;
mod jid;

pub use events::*;
pub use jid::*;
