//! Message shapes for the agent protocol.
//!
//! Outbound requests carry a numeric id allocated by the client. Inbound
//! messages fall into three kinds, distinguished by which fields are present:
//!
//! | kind         | fields                    |
//! |--------------|---------------------------|
//! | response     | `id` + `result` / `error` |
//! | request      | `id` (non-null) + `method`|
//! | notification | `method` without `id`     |

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::errors::ProtocolError;

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Error object carried in a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Everything the client writes to the agent.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutgoingMessage {
    Request {
        id: u64,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Notification {
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Response {
        id: Value,
        result: Value,
    },
    ErrorResponse {
        id: Value,
        error: RpcError,
    },
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    Response {
        id: u64,
        outcome: Result<Value, RpcError>,
    },
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl IncomingMessage {
    /// Parse and classify one line.
    pub fn classify(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| ProtocolError::MalformedFrame(format!("{}: {}", e, truncate(line))))?;
        let obj = value
            .as_object()
            .ok_or_else(|| ProtocolError::MalformedFrame(format!("not an object: {}", truncate(line))))?;

        let id = obj.get("id").filter(|v| !v.is_null()).cloned();
        let params = obj.get("params").cloned();

        if let Some(method) = obj.get("method").and_then(Value::as_str) {
            return Ok(match id {
                Some(id) => IncomingMessage::Request {
                    id,
                    method: method.to_string(),
                    params,
                },
                None => IncomingMessage::Notification {
                    method: method.to_string(),
                    params,
                },
            });
        }

        let Some(id) = id else {
            return Err(ProtocolError::MalformedFrame(format!(
                "neither method nor id: {}",
                truncate(line)
            )));
        };
        let id = id.as_u64().ok_or_else(|| {
            ProtocolError::MalformedFrame(format!("non-numeric response id {}", id))
        })?;

        if let Some(err) = obj.get("error") {
            let err: RpcError = serde_json::from_value(err.clone())
                .map_err(|e| ProtocolError::MalformedFrame(format!("bad error object: {}", e)))?;
            return Ok(IncomingMessage::Response {
                id,
                outcome: Err(err),
            });
        }

        match obj.get("result") {
            Some(result) => Ok(IncomingMessage::Response {
                id,
                outcome: Ok(result.clone()),
            }),
            None => Err(ProtocolError::MalformedFrame(format!(
                "response {} has neither result nor error",
                id
            ))),
        }
    }
}

/// Canned reply for server requests that are approved without asking anyone.
/// `None` means the method is not auto-approved.
pub fn approval_response(method: &str) -> Option<Value> {
    match method {
        "item/fileChange/requestApproval" | "item/commandExecution/requestApproval" => {
            Some(json!({ "decision": "accept" }))
        }
        "applyPatchApproval" | "execCommandApproval" => Some(json!({ "decision": "approved" })),
        _ => None,
    }
}

fn truncate(s: &str) -> String {
    const MAX: usize = 200;
    if s.len() <= MAX {
        return s.to_string();
    }
    let mut end = MAX;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
