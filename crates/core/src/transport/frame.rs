//! Newline-delimited JSON-RPC 2.0 frames, plus the tool methods spoken
//! on top of them.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2025-06-18";

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_PING: &str = "ping";
pub const METHOD_LIST_TOOLS: &str = "tools/list";
pub const METHOD_CALL_TOOL: &str = "tools/call";
pub const METHOD_CANCELLED: &str = "notifications/cancelled";

/// A request identifier. Tool calls use their call id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RequestId {
    #[inline]
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// A request, or a notification when `id` is absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: RequestId, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: Some(id),
            method: method.to_owned(),
            params,
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: None,
            method: method.to_owned(),
            params,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new<S: Into<String>>(code: i64, message: S) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Any frame that may arrive on a channel.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

impl Frame {
    /// Parses one line. Anything that isn't a JSON-RPC 2.0 object is a
    /// protocol violation.
    pub fn parse(line: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(line).map_err(|err| {
            Error::transport().with_reason(format!("malformed frame: {err}"))
        })?;
        let Some(object) = value.as_object() else {
            return Err(Error::transport()
                .with_reason("malformed frame: not a JSON object"));
        };
        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION)
        {
            return Err(Error::transport()
                .with_reason("malformed frame: missing `jsonrpc: \"2.0\"`"));
        }
        let frame = if object.contains_key("method") {
            serde_json::from_value(value).map(Frame::Request)
        } else {
            serde_json::from_value(value).map(Frame::Response)
        };
        frame.map_err(|err| {
            Error::transport().with_reason(format!("malformed frame: {err}"))
        })
    }

    /// Serializes the frame as a single line, without the terminator.
    pub fn to_line(&self) -> String {
        let encoded = match self {
            Frame::Request(req) => serde_json::to_string(req),
            Frame::Response(resp) => serde_json::to_string(resp),
        };
        // Both types only hold strings, numbers and JSON values, which
        // always serialize.
        encoded.unwrap_or_default()
    }
}

/// Tells the peer that an earlier request has been abandoned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CancelledParams {
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Request {
    /// Returns the request id named by a cancellation notification.
    pub fn cancelled_request(&self) -> Option<RequestId> {
        if self.id.is_some() || self.method != METHOD_CANCELLED {
            return None;
        }
        let params = self.params.clone()?;
        serde_json::from_value::<CancelledParams>(params)
            .ok()
            .map(|params| params.request_id)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(rename = "clientInfo", default)]
    pub client_info: Implementation,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(rename = "serverInfo", default)]
    pub server_info: Implementation,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ListToolsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<WireTool>,
    #[serde(
        rename = "nextCursor",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub next_cursor: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text { text: String },
    #[serde(other)]
    Unsupported,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
    #[serde(
        rename = "structuredContent",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub structured_content: Option<Value>,
}

impl CallToolResult {
    /// Joins every text item of the result.
    pub fn text(&self) -> String {
        let texts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|content| match content {
                Content::Text { text } => Some(text.as_str()),
                Content::Unsupported => None,
            })
            .collect();
        texts.join("\n")
    }

    /// Converts a successful result into a JSON value. Structured content
    /// wins; otherwise text that holds JSON is decoded, and anything else
    /// stays a string.
    pub fn into_value(self) -> Value {
        if let Some(structured) = self.structured_content {
            return structured;
        }
        let text = self.text();
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_frames() {
        let frame = Frame::parse(
            r#"{"jsonrpc":"2.0","id":"call_1","method":"tools/call","params":{"name":"echo"}}"#,
        )
        .unwrap();
        let Frame::Request(req) = frame else {
            panic!("expected a request");
        };
        assert_eq!(req.id, Some(RequestId::from("call_1")));
        assert_eq!(req.method, METHOD_CALL_TOOL);

        let frame =
            Frame::parse(r#"{"jsonrpc":"2.0","id":7,"result":{}}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Response(Response::success(
                Some(RequestId::Number(7)),
                json!({})
            ))
        );
    }

    #[test]
    fn test_reject_malformed() {
        assert!(Frame::parse("not json").is_err());
        assert!(Frame::parse("[1, 2]").is_err());
        assert!(Frame::parse(r#"{"id":1,"result":{}}"#).is_err());
    }

    #[test]
    fn test_call_result_value() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [
                { "type": "text", "text": "{\"temperature\": 21}" },
                { "type": "image", "data": "..." }
            ]
        }))
        .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.into_value(), json!({ "temperature": 21 }));

        let result: CallToolResult = serde_json::from_value(json!({
            "content": [{ "type": "text", "text": "sunny" }]
        }))
        .unwrap();
        assert_eq!(result.into_value(), json!("sunny"));
    }

    #[test]
    fn test_cancelled_request() {
        let Frame::Request(req) = Frame::parse(
            r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":"call_3","reason":"turn cancelled"}}"#,
        )
        .unwrap() else {
            panic!("expected a notification");
        };
        assert_eq!(req.cancelled_request(), Some(RequestId::from("call_3")));

        let ping = Request::new(RequestId::Number(1), METHOD_PING, None);
        assert_eq!(ping.cancelled_request(), None);
        let no_params = Request::notification(METHOD_CANCELLED, None);
        assert_eq!(no_params.cancelled_request(), None);
    }
}
