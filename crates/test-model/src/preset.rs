use serde::{Deserialize, Serialize};
use serde_json::Value;
use wayfarer_model::ToolCallIntent;

/// The events in a preset response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PresetEvent {
    #[serde(rename = "message_delta")]
    MessageDelta(String),
    #[serde(rename = "tool_call")]
    ToolCall(ToolCallIntent),
}

impl PresetEvent {
    /// A tool call whose arguments are the given JSON value.
    pub fn tool_call(id: &str, name: &str, arguments: Value) -> Self {
        Self::ToolCall(ToolCallIntent::with_json(id, name, &arguments))
    }

    /// A tool call with raw, possibly malformed, argument text.
    pub fn raw_tool_call(id: &str, name: &str, arguments: &str) -> Self {
        Self::ToolCall(ToolCallIntent {
            id: id.to_owned(),
            name: name.to_owned(),
            arguments: arguments.to_owned(),
        })
    }
}

/// The preset response for one model request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresetResponse {
    /// Events in this response.
    pub events: Vec<PresetEvent>,
    /// If set, the request will fail in the first `failures` attempts.
    /// `Some(0)` means the request will fail infinitely.
    pub failures: Option<u64>,
}

impl PresetResponse {
    /// Creates a `PresetResponse` with the specified events.
    #[inline]
    pub fn with_events(events: impl Into<Vec<PresetEvent>>) -> Self {
        Self {
            events: events.into(),
            failures: None,
        }
    }

    /// A plain text answer.
    #[inline]
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self::with_events([PresetEvent::MessageDelta(text.into())])
    }

    /// A response made of a single tool call.
    #[inline]
    pub fn tool_call(id: &str, name: &str, arguments: Value) -> Self {
        Self::with_events([PresetEvent::tool_call(id, name, arguments)])
    }

    /// Sets failure times before a successful response. `0` means the
    /// response will always be a failure.
    #[inline]
    pub fn with_failures(mut self, failures: u64) -> Self {
        self.failures = Some(failures);
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_serialize_deserialize() {
        let response = PresetResponse::with_events([
            PresetEvent::MessageDelta("Let me check the sky.".to_string()),
            PresetEvent::tool_call(
                "1",
                "get_forecast",
                json!({ "q": "Rome", "days": 3 }),
            ),
        ])
        .with_failures(2);

        let serialized = serde_json::to_string(&response).unwrap();
        let deserialized: PresetResponse =
            serde_json::from_str(&serialized).unwrap();

        assert_eq!(response, deserialized);
    }
}
