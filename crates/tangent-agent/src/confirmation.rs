//! The two-phase confirmation handshake for destructive tools.
//!
//! A gated tool does not run on first encounter. Instead the loop emits a
//! [`ConfirmationRequest`] with a deterministic id and records a
//! "pending confirmation" tool result so the model can summarize what it
//! asked for. The caller resumes a later run with matching
//! [`ConfirmationDecision`] entries on the run context; only then does the
//! tool execute (or get skipped, when declined).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Stand-in result recorded for a tool that is waiting for approval.
pub const PENDING_CONFIRMATION: &str = "pending confirmation";

/// Result recorded for a tool whose confirmation was declined.
pub const DECLINED_RESULT: &str = "Tool execution declined by user";

/// Serialize a value with object keys sorted lexicographically (recursively)
/// and no extra whitespace.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    // Key serialization cannot fail for a plain string.
                    let rendered = serde_json::to_string(key).unwrap_or_default();
                    format!("{}:{}", rendered, canonical_json(&map[key]))
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

/// Deterministic confirmation id: the first 16 hex characters of
/// `sha256(tool_name + ":" + canonical_json(arguments))`.
///
/// Stable across invocations and processes, and safe to hand to an untrusted
/// client.
pub fn confirmation_id(tool_name: &str, arguments: &Map<String, Value>) -> String {
    let canonical = canonical_json(&Value::Object(arguments.clone()));
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update(b":");
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

/// A request for the caller to approve or decline one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfirmationRequest {
    /// Deterministic id of the (tool, arguments) pair.
    pub confirmation_id: String,
    pub tool_name: String,
    pub tool_description: String,
    pub arguments: Map<String, Value>,
}

impl ConfirmationRequest {
    pub fn new(
        tool_name: impl Into<String>,
        tool_description: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        let tool_name = tool_name.into();
        let confirmation_id = confirmation_id(&tool_name, &arguments);
        Self {
            confirmation_id,
            tool_name,
            tool_description: tool_description.into(),
            arguments,
        }
    }
}

/// The caller's answer to a [`ConfirmationRequest`].
///
/// Decisions for unknown ids are accepted silently, so hook-driven gating can
/// reuse the same channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfirmationDecision {
    pub confirmation_id: String,
    pub confirmed: bool,
}

impl ConfirmationDecision {
    pub fn approve(confirmation_id: impl Into<String>) -> Self {
        Self {
            confirmation_id: confirmation_id.into(),
            confirmed: true,
        }
    }

    pub fn decline(confirmation_id: impl Into<String>) -> Self {
        Self {
            confirmation_id: confirmation_id.into(),
            confirmed: false,
        }
    }
}
