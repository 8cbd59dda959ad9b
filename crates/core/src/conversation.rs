//! Conversation-related types.

use std::fmt::{self, Display};

use rand::Rng;
use serde::{Deserialize, Serialize};
use wayfarer_model::{ModelMessage, ToolCallIntent, ToolCallResult};

/// Identifies a conversation, both in session state and in traces.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Generates a random identifier.
    pub fn generate() -> Self {
        let value: u64 = rand::thread_rng().r#gen();
        Self(format!("conv_{value:016x}"))
    }

    /// Returns the identifier as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    #[inline]
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ConversationId {
    #[inline]
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The author of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The person talking to the agent.
    User,
    /// The agent itself.
    Assistant,
    /// A tool observation.
    Tool,
}

/// A message in the conversation history.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    /// Who wrote the message.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// For tool messages, the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For assistant messages, the tool calls it issued.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallIntent>,
    /// For tool messages, whether the observation is an error.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl Message {
    /// Creates a user message.
    #[inline]
    pub fn user<S: Into<String>>(content: S) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
            tool_calls: vec![],
            is_error: false,
        }
    }

    /// Creates an assistant message, optionally issuing tool calls.
    #[inline]
    pub fn assistant<S: Into<String>>(
        content: S,
        tool_calls: Vec<ToolCallIntent>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls,
            is_error: false,
        }
    }

    /// Creates a tool observation answering `call_id`.
    #[inline]
    pub fn tool<I: Into<String>, S: Into<String>>(
        call_id: I,
        content: S,
        is_error: bool,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            tool_calls: vec![],
            is_error,
        }
    }

    pub(crate) fn to_model_message(&self) -> ModelMessage {
        match self.role {
            Role::User => ModelMessage::user(self.content.clone()),
            Role::Assistant => ModelMessage::Assistant {
                content: self.content.clone(),
                tool_calls: self.tool_calls.clone(),
            },
            Role::Tool => ModelMessage::Tool(ToolCallResult {
                id: self.tool_call_id.clone().unwrap_or_default(),
                content: self.content.clone(),
                is_error: self.is_error,
            }),
        }
    }
}

/// The ordered message history of one conversation.
#[derive(Clone, Debug)]
pub struct Conversation {
    id: ConversationId,
    messages: Vec<Message>,
}

impl Conversation {
    /// Creates an empty conversation.
    #[inline]
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            messages: vec![],
        }
    }

    /// Returns the identifier of this conversation.
    #[inline]
    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    /// Appends a message to the end of the history.
    #[inline]
    pub fn append_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Returns all messages, oldest first.
    #[inline]
    pub fn history(&self) -> &[Message] {
        &self.messages
    }

    /// Removes every message. The identifier is kept.
    #[inline]
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Returns `true` if the conversation has no messages.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
