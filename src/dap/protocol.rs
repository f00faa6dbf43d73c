use crate::debugger::session::{Event, Request};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// DAP request envelope.
#[derive(Debug, Deserialize)]
pub struct DapRequest {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

impl From<DapRequest> for Request {
    fn from(request: DapRequest) -> Self {
        Request {
            seq: request.seq,
            command: request.command,
            arguments: request.arguments,
        }
    }
}

/// DAP response envelope.
///
/// A response may have no `body` field at all.
#[derive(Debug, Serialize)]
pub struct DapResponse {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl DapResponse {
    pub fn success(seq: i64, request: &Request, body: Option<Value>) -> Self {
        Self {
            seq,
            r#type: "response",
            request_seq: request.seq,
            success: true,
            command: request.command.clone(),
            message: None,
            body,
        }
    }

    /// Failed response, the error text goes both to `message` and to `body.error`.
    pub fn error(seq: i64, request: &Request, error: String) -> Self {
        let body = serde_json::json!({
            "error": { "id": 1, "format": error, "showUser": false },
        });
        Self {
            seq,
            r#type: "response",
            request_seq: request.seq,
            success: false,
            command: request.command.clone(),
            message: Some(error),
            body: Some(body),
        }
    }
}

/// DAP event envelope.
#[derive(Debug, Serialize)]
pub struct DapEvent {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl DapEvent {
    pub fn new(seq: i64, event: Event) -> Self {
        Self {
            seq,
            r#type: "event",
            event: event.event,
            body: event.body,
        }
    }
}
