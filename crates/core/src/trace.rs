//! Reasoning traces.
//!
//! Every user input, reasoning step, tool call, tool response and final
//! answer is recorded as a [`TraceStep`]. Steps of one conversation are
//! numbered without gaps, so an exported trace can be replayed or audited
//! step by step.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::ConversationId;

/// The kind of a trace step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    /// The user sent a message. Starts a new turn.
    UserInput,
    /// The model produced intermediate output or failed to.
    Reasoning,
    /// A tool call was dispatched.
    ToolCall,
    /// A tool call was answered, successfully or not.
    ToolResponse,
    /// The turn ended with an answer to the user.
    FinalAnswer,
}

/// A single recorded step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    /// The conversation this step belongs to.
    pub conversation_id: ConversationId,
    /// The turn number, starting at 1 with the first user input.
    pub turn: u64,
    /// The position of this step in the conversation, starting at 0.
    pub step_index: u64,
    /// What happened.
    pub kind: TraceKind,
    /// Kind-specific details.
    pub payload: Value,
    /// When the step was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Aggregate numbers over a conversation's trace.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceStats {
    /// Number of tool calls dispatched.
    pub tool_call_count: usize,
    /// Number of exchanges, i.e. turns started by a user input.
    pub conversation_count: usize,
    /// Average number of steps per exchange.
    pub average_steps: f64,
}

#[derive(Serialize)]
struct TraceDocument<'a> {
    conversation_id: &'a ConversationId,
    steps: &'a [TraceStep],
}

#[derive(Default)]
struct ConversationTrace {
    turn: u64,
    steps: Vec<TraceStep>,
}

/// Records trace steps of any number of conversations.
///
/// The recorder can be shared between agents; `record` is safe to call
/// from several threads at once and indices stay strictly increasing.
#[derive(Default)]
pub struct TraceRecorder {
    conversations: Mutex<HashMap<ConversationId, ConversationTrace>>,
}

impl TraceRecorder {
    /// Creates an empty recorder.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a step and returns it.
    pub fn record(
        &self,
        conversation_id: &ConversationId,
        kind: TraceKind,
        payload: Value,
    ) -> TraceStep {
        let mut conversations = self.conversations.lock();
        let trace = conversations.entry(conversation_id.clone()).or_default();
        if kind == TraceKind::UserInput {
            trace.turn += 1;
        }
        let step = TraceStep {
            conversation_id: conversation_id.clone(),
            turn: trace.turn,
            step_index: trace.steps.len() as u64,
            kind,
            payload,
            timestamp: Utc::now(),
        };
        trace.steps.push(step.clone());
        trace!(
            "recorded step {} ({:?}) in {conversation_id}",
            step.step_index,
            kind
        );
        step
    }

    /// Returns a copy of all steps of a conversation, in order.
    pub fn steps(&self, conversation_id: &ConversationId) -> Vec<TraceStep> {
        self.conversations
            .lock()
            .get(conversation_id)
            .map(|trace| trace.steps.clone())
            .unwrap_or_default()
    }

    /// Exports a conversation's trace as a JSON document.
    ///
    /// Exporting doesn't change the trace, so exporting twice without
    /// recording in between yields identical documents.
    pub fn export(
        &self,
        conversation_id: &ConversationId,
    ) -> serde_json::Result<String> {
        let conversations = self.conversations.lock();
        let steps = conversations
            .get(conversation_id)
            .map(|trace| trace.steps.as_slice())
            .unwrap_or_default();
        serde_json::to_string_pretty(&TraceDocument {
            conversation_id,
            steps,
        })
    }

    /// Computes statistics of a conversation's trace.
    pub fn stats(&self, conversation_id: &ConversationId) -> TraceStats {
        let conversations = self.conversations.lock();
        let Some(trace) = conversations.get(conversation_id) else {
            return TraceStats::default();
        };
        let tool_call_count = trace
            .steps
            .iter()
            .filter(|step| step.kind == TraceKind::ToolCall)
            .count();
        let conversation_count = trace
            .steps
            .iter()
            .filter(|step| step.kind == TraceKind::UserInput)
            .count();
        let average_steps = if conversation_count == 0 {
            0.0
        } else {
            trace.steps.len() as f64 / conversation_count as f64
        };
        TraceStats {
            tool_call_count,
            conversation_count,
            average_steps,
        }
    }

    /// Computes statistics over every recorded conversation. Here
    /// `conversation_count` counts conversations, and `average_steps` is
    /// the mean number of steps per conversation.
    pub fn totals(&self) -> TraceStats {
        let conversations = self.conversations.lock();
        let non_empty: Vec<_> = conversations
            .values()
            .filter(|trace| !trace.steps.is_empty())
            .collect();
        let tool_call_count = non_empty
            .iter()
            .flat_map(|trace| trace.steps.iter())
            .filter(|step| step.kind == TraceKind::ToolCall)
            .count();
        let total_steps: usize =
            non_empty.iter().map(|trace| trace.steps.len()).sum();
        let average_steps = if non_empty.is_empty() {
            0.0
        } else {
            total_steps as f64 / non_empty.len() as f64
        };
        TraceStats {
            tool_call_count,
            conversation_count: non_empty.len(),
            average_steps,
        }
    }

    /// Drops every step of a conversation. Numbering restarts at 0.
    pub fn clear(&self, conversation_id: &ConversationId) {
        self.conversations.lock().remove(conversation_id);
    }
}
