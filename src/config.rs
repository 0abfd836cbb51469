use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pairing::code;

/// How a new companion links to the account.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PairingMode {
    #[default]
    Qr,
    Code,
}

/// WhatsApp WebSocket endpoints.
pub mod endpoints {
    pub const MAIN: &str = "wss://web.whatsapp.com/ws/chat";
    pub const ORIGIN: &str = "https://web.whatsapp.com";
}

/// Configuration for one session coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Directory holding `<session_id>.json` records and their lock files.
    pub session_directory: PathBuf,
    /// Identifier of the session inside the directory.
    pub session_id: String,
    pub pairing_mode: PairingMode,
    /// Phone number to link in code mode.
    pub phone_number: Option<String>,
    /// Caller-chosen pairing code (`XXXXXXXX` or `XXXX-XXXX`).
    pub custom_pairing_code: Option<String>,
    pub handshake_timeout_seconds: u64,
    /// Reconnect attempts before giving up.
    pub reconnect_retry_ceiling: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub keepalive_interval_seconds: u64,
    /// Inbound silence after which the link is considered dead.
    pub keepalive_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub qr_initial_timeout_seconds: u64,
    pub qr_rotation_timeout_seconds: u64,
    pub endpoint: String,
    pub origin: String,
    /// Name shown on the primary device's linked-devices list.
    pub push_name: Option<String>,
    /// Companion display string used in the pairing-code flow.
    pub platform_display: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_directory: PathBuf::from("./sessions"),
            session_id: "default".into(),
            pairing_mode: PairingMode::Qr,
            phone_number: None,
            custom_pairing_code: None,
            handshake_timeout_seconds: 300,
            reconnect_retry_ceiling: 5,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            keepalive_interval_seconds: 25,
            keepalive_timeout_seconds: 60,
            request_timeout_seconds: 30,
            connect_timeout_seconds: 20,
            qr_initial_timeout_seconds: 60,
            qr_rotation_timeout_seconds: 20,
            endpoint: endpoints::MAIN.into(),
            origin: endpoints::ORIGIN.into(),
            push_name: None,
            platform_display: "Chrome (Linux)".into(),
        }
    }
}

impl SessionConfig {
    /// Load a configuration from a JSON file. Missing keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Override the session directory.
    pub fn with_session_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.session_directory = dir.into();
        self
    }

    /// Override the session id.
    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = id.into();
        self
    }

    /// Switch to QR pairing.
    pub fn with_qr_pairing(mut self) -> Self {
        self.pairing_mode = PairingMode::Qr;
        self
    }

    /// Switch to pairing-code linking for `phone_number`.
    pub fn with_code_pairing(mut self, phone_number: impl Into<String>, custom_code: Option<String>) -> Self {
        self.pairing_mode = PairingMode::Code;
        self.phone_number = Some(phone_number.into());
        self.custom_pairing_code = custom_code;
        self
    }

    pub fn with_handshake_timeout(mut self, seconds: u64) -> Self {
        self.handshake_timeout_seconds = seconds;
        self
    }

    pub fn with_retry_ceiling(mut self, ceiling: u32) -> Self {
        self.reconnect_retry_ceiling = ceiling;
        self
    }

    pub fn with_keepalive(mut self, interval_seconds: u64, timeout_seconds: u64) -> Self {
        self.keepalive_interval_seconds = interval_seconds;
        self.keepalive_timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.reconnect_base_delay_ms = base_ms;
        self.reconnect_max_delay_ms = max_ms;
        self
    }

    pub fn with_push_name(mut self, name: impl Into<String>) -> Self {
        self.push_name = Some(name.into());
        self
    }

    /// Check field ranges and the pairing-code inputs. Performs no I/O.
    pub fn validate(&self) -> Result<()> {
        if self.session_id.is_empty()
            || self
                .session_id
                .chars()
                .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        {
            return Err(Error::InvalidConfig(format!(
                "session id {:?} must be non-empty and use [A-Za-z0-9_-]",
                self.session_id
            )));
        }
        if self.reconnect_retry_ceiling == 0 {
            return Err(Error::InvalidConfig("reconnectRetryCeiling must be at least 1".into()));
        }
        for (name, value) in [
            ("handshakeTimeoutSeconds", self.handshake_timeout_seconds),
            ("keepaliveIntervalSeconds", self.keepalive_interval_seconds),
            ("keepaliveTimeoutSeconds", self.keepalive_timeout_seconds),
            ("requestTimeoutSeconds", self.request_timeout_seconds),
            ("connectTimeoutSeconds", self.connect_timeout_seconds),
            ("qrInitialTimeoutSeconds", self.qr_initial_timeout_seconds),
            ("qrRotationTimeoutSeconds", self.qr_rotation_timeout_seconds),
            ("reconnectBaseDelayMs", self.reconnect_base_delay_ms),
        ] {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be greater than zero", name)));
            }
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(Error::InvalidConfig(
                "reconnectMaxDelayMs must not be below reconnectBaseDelayMs".into(),
            ));
        }

        if self.pairing_mode == PairingMode::Code {
            let phone = self.phone_number.as_deref().unwrap_or_default();
            code::normalize_phone_number(phone)?;
        }
        if let Some(custom) = &self.custom_pairing_code {
            code::validate(custom)?;
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_seconds)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_seconds)
    }

    pub fn qr_timeouts(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.qr_initial_timeout_seconds),
            Duration::from_secs(self.qr_rotation_timeout_seconds),
        )
    }

    /// Path of the session record.
    pub fn record_path(&self) -> PathBuf {
        self.session_directory.join(format!("{}.json", self.session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.session_directory, PathBuf::from("./sessions"));
        assert_eq!(config.pairing_mode, PairingMode::Qr);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(300));
        assert_eq!(config.reconnect_retry_ceiling, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_camel_case_json_with_defaults() {
        let json = r#"{
            "sessionDirectory": "/var/lib/wa",
            "pairingMode": "code",
            "phoneNumber": "+55 11 99999-0000",
            "customPairingCode": "ABCD-1234",
            "keepaliveIntervalSeconds": 10
        }"#;
        let config: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.pairing_mode, PairingMode::Code);
        assert_eq!(config.keepalive_interval_seconds, 10);
        assert_eq!(config.reconnect_retry_ceiling, 5);
        assert!(config.validate().is_ok());
        assert_eq!(config.record_path(), PathBuf::from("/var/lib/wa/default.json"));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"sessionId": "work", "reconnectRetryCeiling": 2}"#).unwrap();

        let config = SessionConfig::from_json_file(&path).unwrap();
        assert_eq!(config.session_id, "work");
        assert_eq!(config.reconnect_retry_ceiling, 2);

        let missing = SessionConfig::from_json_file(dir.path().join("absent.json"));
        assert!(matches!(missing, Err(Error::Io { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_ceiling = SessionConfig::default().with_retry_ceiling(0);
        assert!(matches!(zero_ceiling.validate(), Err(Error::InvalidConfig(_))));

        let bad_id = SessionConfig::default().with_session_id("../escape");
        assert!(matches!(bad_id.validate(), Err(Error::InvalidConfig(_))));

        let bad_code = SessionConfig::default().with_code_pairing("5511999990000", Some("AB!".into()));
        assert!(matches!(bad_code.validate(), Err(Error::InvalidPairingCode(_))));

        let short_phone = SessionConfig::default().with_code_pairing("123", None);
        assert!(matches!(short_phone.validate(), Err(Error::InvalidConfig(_))));
    }
}
