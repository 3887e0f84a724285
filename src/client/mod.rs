//! Per-server MCP clients.
//!
//! [`core::CoreClient`] owns one transport and one MCP session;
//! [`managed::ManagedClient`] wraps it with health probing and reconnect
//! policy. Tools are addressed fleet-wide by qualified name
//! `"<server>:<tool>"`.

pub mod core;
pub mod managed;

use crate::oauth::OAuthError;
use crate::transport::{ToolDef, TransportError};
use sha2::{Digest, Sha256};

/// Failure surfaced by a client operation. Cloneable so concurrent callers
/// joined on one flight all receive it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    OAuth(#[from] OAuthError),
    #[error("not connected: {0}")]
    NotConnected(String),
    #[error("circuit breaker open after {failures} consecutive failures")]
    CircuitOpen { failures: u32 },
    #[error("{0}")]
    Other(String),
}

impl ClientError {
    /// Does this failure indicate the connection itself is gone?
    pub fn is_connection_failure(&self) -> bool {
        match self {
            ClientError::Transport(err) => err.is_broken(),
            ClientError::NotConnected(_) => true,
            _ => false,
        }
    }
}

/// Fleet-wide tool descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolMetadata {
    /// `"<server>:<tool>"`.
    pub qualified_name: String,
    pub server_name: String,
    pub tool_name: String,
    pub description: Option<String>,
    /// Tool input schema, serialized.
    pub params_json: String,
    /// Change-detection digest over `(server, tool, params)`.
    pub hash: String,
    pub status: ToolStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolStatus {
    #[default]
    Active,
}

/// Join server and tool into the fleet-wide name.
pub fn qualified_tool_name(server: &str, tool: &str) -> String {
    format!("{server}:{tool}")
}

/// Split a qualified name; `None` when the shape is wrong.
pub fn split_qualified_name(qualified: &str) -> Option<(&str, &str)> {
    let (server, tool) = qualified.split_once(':')?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

/// Convert one upstream tool definition into fleet metadata.
pub fn tool_metadata(server: &str, def: &ToolDef) -> ToolMetadata {
    let params_json = def.input_schema.to_string();
    let mut hasher = Sha256::new();
    hasher.update(server.as_bytes());
    hasher.update(def.name.as_bytes());
    hasher.update(params_json.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    ToolMetadata {
        qualified_name: qualified_tool_name(server, &def.name),
        server_name: server.to_string(),
        tool_name: def.name.clone(),
        description: def.description.clone(),
        params_json,
        hash,
        status: ToolStatus::Active,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(name: &str, schema: serde_json::Value) -> ToolDef {
        ToolDef {
            name: name.to_string(),
            description: Some(format!("tool {name}")),
            input_schema: schema,
        }
    }

    #[test]
    fn test_qualified_name_roundtrip() {
        let qualified = qualified_tool_name("holler", "echo");
        assert_eq!(qualified, "holler:echo");
        assert_eq!(split_qualified_name(&qualified), Some(("holler", "echo")));
    }

    #[test]
    fn test_split_rejects_malformed() {
        assert!(split_qualified_name("noColonTool").is_none());
        assert!(split_qualified_name(":tool").is_none());
        assert!(split_qualified_name("server:").is_none());
        assert!(split_qualified_name("").is_none());
    }

    #[test]
    fn test_split_keeps_colons_in_tool_name() {
        // Only the first colon separates; tools may contain more.
        assert_eq!(
            split_qualified_name("srv:ns:tool"),
            Some(("srv", "ns:tool"))
        );
    }

    #[test]
    fn test_metadata_hash_tracks_schema_changes() {
        let a = tool_metadata("s1", &def("echo", json!({"type": "object"})));
        let b = tool_metadata("s1", &def("echo", json!({"type": "object"})));
        assert_eq!(a.hash, b.hash);

        let changed = tool_metadata(
            "s1",
            &def("echo", json!({"type": "object", "required": ["message"]})),
        );
        assert_ne!(a.hash, changed.hash);

        let other_server = tool_metadata("s2", &def("echo", json!({"type": "object"})));
        assert_ne!(a.hash, other_server.hash);
    }

    #[test]
    fn test_connection_failure_classification() {
        assert!(ClientError::Transport(TransportError::Broken("gone".into()))
            .is_connection_failure());
        assert!(ClientError::NotConnected("never started".into()).is_connection_failure());
        assert!(!ClientError::Transport(TransportError::Unauthorized("401".into()))
            .is_connection_failure());
        assert!(!ClientError::Other("bad args".into()).is_connection_failure());
    }
}
