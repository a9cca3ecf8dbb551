use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Setting this variable is a directive, not a write: it switches the
/// project's persistence key to the named user and reloads the map.
pub const USERNAME_VARIABLE: &str = "\u{2601} _username";

/// Methods the dispatcher understands; anything else is logged as unknown.
pub const KNOWN_METHODS: [&str; 5] = ["handshake", "create", "set", "rename", "delete"];

/// Messages sent from client to relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Select the project this connection joins; first message on the wire
    Handshake { project_id: String },
    /// Create a variable (dispatched identically to `set`)
    Create { name: String, value: Value },
    /// Write a variable
    Set { name: String, value: Value },
    /// Move a value to a new name
    Rename { name: String, new_name: String },
    /// Remove a variable
    Delete { name: String },
}

/// Messages sent from relay to client. The protocol has no error message
/// type; every failure stays server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ServerMessage {
    Set { name: String, value: Value },
}

/// Encode a batch of notifications as newline-terminated JSON lines,
/// concatenated so one event costs one transport send.
pub fn encode_batch(messages: &[ServerMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        if let Ok(json) = serde_json::to_string(message) {
            out.push_str(&json);
            out.push('\n');
        }
    }
    out
}

/// Project ids may only contain ASCII word characters.
pub fn is_valid_project_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}
