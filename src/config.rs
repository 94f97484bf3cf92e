//! Session options record.

use crate::error::{NadeError, Result};
use serde::{Deserialize, Serialize};

/// Host-tunable session options. Capabilities advertised in the handshake
/// derive from `encrypt`/`decrypt`, so the link only degrades to plaintext
/// when both sides agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NadeConfig {
    /// Send our frames encrypted (when the peer accepts them).
    pub encrypt: bool,
    /// Accept encrypted frames from the peer.
    pub decrypt: bool,
    /// Gate the optional 4-FSK audio modem.
    pub fsk_enabled: bool,
}

impl Default for NadeConfig {
    fn default() -> Self {
        Self { encrypt: true, decrypt: true, fsk_enabled: false }
    }
}

impl NadeConfig {
    /// Merge a JSON object like `{"encrypt":true,"fsk_enabled":false}` onto
    /// the current options; keys that are absent keep their current value.
    pub fn merge_json(&self, json: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|_| NadeError::BadArgument("config json"))?;
        let mut merged = *self;
        if let Some(flag) = value.get("encrypt").and_then(serde_json::Value::as_bool) {
            merged.encrypt = flag;
        }
        if let Some(flag) = value.get("decrypt").and_then(serde_json::Value::as_bool) {
            merged.decrypt = flag;
        }
        if let Some(flag) = value.get("fsk_enabled").and_then(serde_json::Value::as_bool) {
            merged.fsk_enabled = flag;
        }
        Ok(merged)
    }
}
