//! WhatsApp JID (Jabber ID) types.
//!
//! A linked companion is addressed by an AD-JID: the account's user part plus
//! a device number assigned by the primary phone at pairing time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Known JID servers on WhatsApp
pub mod servers {
    pub const DEFAULT_USER: &str = "s.whatsapp.net";
    pub const GROUP: &str = "g.us";
    pub const BROADCAST: &str = "broadcast";
    pub const HIDDEN_USER: &str = "lid";
}

/// JID represents a WhatsApp user or device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct JID {
    pub user: String,
    pub agent: u8,
    pub device: u16,
    pub server: String,
}

impl JID {
    /// Creates a new regular JID.
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
            ..Default::default()
        }
    }

    /// Creates a device JID on the default user server.
    pub fn new_device(user: impl Into<String>, device: u16) -> Self {
        Self {
            user: user.into(),
            device,
            server: servers::DEFAULT_USER.to_string(),
            ..Default::default()
        }
    }

    /// True when this address carries agent or device information.
    pub fn is_ad(&self) -> bool {
        self.agent > 0 || self.device > 0
    }

    /// Returns a version of the JID without agent and device.
    pub fn to_non_ad(&self) -> Self {
        Self::new(self.user.clone(), self.server.clone())
    }

    /// Returns true if the JID is empty (no server).
    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
    }
}

impl fmt::Display for JID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.agent > 0 {
            write!(f, "{}.{}:{}@{}", self.user, self.agent, self.device, self.server)
        } else if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else if !self.user.is_empty() {
            write!(f, "{}@{}", self.user, self.server)
        } else {
            write!(f, "{}", self.server)
        }
    }
}

/// Error type for JID parsing
#[derive(Debug, Clone, PartialEq, Error)]
#[error("failed to parse JID: {0}")]
pub struct ParseJIDError(pub String);

impl FromStr for JID {
    type Err = ParseJIDError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user_part, server) = match s.split_once('@') {
            None => return Ok(JID::new("", s)),
            Some(parts) => parts,
        };
        if server.contains('@') {
            return Err(ParseJIDError(format!("too many '@' in {:?}", s)));
        }

        let mut jid = JID::new(user_part, server);

        if let Some((user, ad)) = user_part.split_once('.') {
            jid.user = user.to_string();
            let (agent, device) = match ad.split_once(':') {
                Some((agent, device)) => (agent, Some(device)),
                None => (ad, None),
            };
            jid.agent = agent
                .parse()
                .map_err(|_| ParseJIDError(format!("bad agent in {:?}", s)))?;
            if let Some(device) = device {
                jid.device = device
                    .parse()
                    .map_err(|_| ParseJIDError(format!("bad device in {:?}", s)))?;
            }
        } else if let Some((user, device)) = user_part.split_once(':') {
            jid.user = user.to_string();
            jid.device = device
                .parse()
                .map_err(|_| ParseJIDError(format!("bad device in {:?}", s)))?;
        }

        Ok(jid)
    }
}

impl Serialize for JID {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JID {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// Common JIDs
lazy_static::lazy_static! {
    pub static ref SERVER_JID: JID = JID::new("", servers::DEFAULT_USER);
}
