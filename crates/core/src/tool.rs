//! Tool descriptors, calls and the registry of connected tool servers.

mod hub;
mod registry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use wayfarer_model::ModelTool;

use crate::error::Error;
pub use hub::{ToolHub, ToolHubBuilder};
pub use registry::{Registry, RegistryBuilder};

/// Describes a tool advertised by a tool server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique name across all connected servers.
    pub name: String,
    /// What the tool does, shown to the model.
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameter_schema: Value,
}

impl ToolDescriptor {
    pub(crate) fn to_model_tool(&self) -> ModelTool {
        ModelTool {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameter_schema.clone(),
        }
    }
}

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a call id that is unique within this process.
pub fn next_call_id() -> String {
    let id = NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed);
    format!("call_{id}")
}

/// A request to run a tool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Correlates this request with its response.
    pub call_id: String,
    /// The tool to run.
    pub tool_name: String,
    /// Arguments, always a JSON object.
    pub arguments: Map<String, Value>,
}

impl ToolCallRequest {
    /// Creates a request with a fresh call id.
    #[inline]
    pub fn new<S: Into<String>>(tool_name: S, arguments: Map<String, Value>) -> Self {
        Self {
            call_id: next_call_id(),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// The outcome of a tool call.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCallResponse {
    /// The call id of the request this answers.
    pub call_id: String,
    /// The tool's result, or why there is none.
    pub result: Result<Value, Error>,
    /// Time between dispatch and response.
    pub latency: Duration,
}

impl ToolCallResponse {
    /// Renders the outcome as text for the model.
    pub fn observation(&self) -> String {
        match &self.result {
            Ok(Value::String(text)) => text.clone(),
            Ok(value) => value.to_string(),
            Err(err) => format!("error: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_call_ids_are_unique() {
        let a = ToolCallRequest::new("echo", Map::new());
        let b = ToolCallRequest::new("echo", Map::new());
        assert_ne!(a.call_id, b.call_id);
    }

    #[test]
    fn test_observation() {
        let mut resp = ToolCallResponse {
            call_id: "call_1".to_owned(),
            result: Ok(json!("sunny")),
            latency: Duration::ZERO,
        };
        assert_eq!(resp.observation(), "sunny");

        resp.result = Ok(json!({ "temperature": 21 }));
        assert_eq!(resp.observation(), "{\"temperature\":21}");

        resp.result = Err(Error::timeout().with_reason("no response"));
        assert_eq!(resp.observation(), "error: Timeout: no response");
    }
}
