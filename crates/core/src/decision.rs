//! Turning model output into a decision.

use serde_json::{Map, Value};
use wayfarer_model::ToolCallIntent;

use crate::error::{Error, ErrorKind};
use crate::model_client::ModelClientResponse;
use crate::tool::Registry;

/// What the model decided to do.
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// Answer the user with this text.
    FinalAnswer(String),
    /// Call these tools, in order.
    ToolInvocations(Vec<Invocation>),
}

/// A tool call the model asked for, with arguments decoded.
#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    /// The name of the tool. It may not be registered.
    pub tool_name: String,
    /// The decoded arguments.
    pub arguments: Map<String, Value>,
}

/// Decides what the model asked for.
///
/// Arguments must decode to a JSON object and, for registered tools,
/// satisfy the tool's schema; otherwise a parse error is returned.
/// Unknown tool names are not rejected here, they are answered with an
/// error observation when dispatched.
pub(crate) fn decide(
    response: &ModelClientResponse,
    registry: &Registry,
) -> Result<Decision, Error> {
    if response.tool_calls.is_empty() {
        return Ok(Decision::FinalAnswer(response.transcript.clone()));
    }
    response
        .tool_calls
        .iter()
        .map(|intent| parse_intent(intent, registry))
        .collect::<Result<Vec<_>, _>>()
        .map(Decision::ToolInvocations)
}

fn parse_intent(
    intent: &ToolCallIntent,
    registry: &Registry,
) -> Result<Invocation, Error> {
    let tool_name = intent.name.trim();
    if tool_name.is_empty() {
        return Err(Error::parse().with_reason("a tool call has no tool name"));
    }

    let raw = intent.arguments.trim();
    let arguments = if raw.is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str(raw).map_err(|err| {
            Error::parse().with_reason(format!(
                "arguments of `{tool_name}` are not valid JSON: {err}"
            ))
        })?
    };
    let Value::Object(arguments) = arguments else {
        return Err(Error::parse().with_reason(format!(
            "arguments of `{tool_name}` must be a JSON object"
        )));
    };

    if let Err(err) = registry.validate(tool_name, &Value::Object(arguments.clone())) {
        if err.kind() != ErrorKind::UnknownTool {
            return Err(err);
        }
    }

    Ok(Invocation {
        tool_name: tool_name.to_owned(),
        arguments,
    })
}

/// Renders the raw tool calls, used when the model's output can't be
/// parsed and has to be shown as is.
pub(crate) fn render_raw(response: &ModelClientResponse) -> String {
    if !response.transcript.trim().is_empty() {
        return response.transcript.clone();
    }
    response
        .tool_calls
        .iter()
        .map(|intent| format!("{}({})", intent.name, intent.arguments))
        .collect::<Vec<_>>()
        .join("\n")
}
