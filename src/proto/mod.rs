//! Protobuf messages used on the wire.

mod wa;

pub use wa::*;
