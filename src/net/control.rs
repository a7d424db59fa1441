//! Control messages - JSON lines exchanged before binary framing starts

use serde::{Deserialize, Serialize};

use crate::core::types::Result;

/// Handshake and metadata messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ControlMessage {
    /// First message from a joining peer
    Hello { token: String, observer_id: i64 },
    /// Descriptive metadata for an observer
    ObserverInfo {
        observer_id: i64,
        name: String,
        /// Opaque appearance blob
        appearance: String,
    },
    /// World generation parameters from the authority
    WorldParameters {
        seed: String,
        /// Opaque parameter blob
        parameters: String,
    },
    /// Handshake refused; the connection is closed after this
    Rejected { reason: String },
    /// Binary framing starts after this line
    Begin,
}

impl ControlMessage {
    /// Serialize as one newline-terminated line
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn parse(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Observer metadata as tracked by peers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObserverInfo {
    pub name: String,
    pub appearance: String,
}

/// World generation parameters received from the authority
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldParameters {
    pub seed: String,
    pub parameters: String,
}
