mod builder;
mod state;
#[cfg(test)]
mod tests;
mod turn;

use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::conversation::{ConversationId, Message};
use crate::error::Error;
use crate::tool::{ToolDescriptor, ToolHub};
use crate::trace::{TraceRecorder, TraceStats, TraceStep};
pub use builder::AgentBuilder;

/// Where the agent is in its reasoning loop.
///
/// ```text
/// AwaitingInput -> Reasoning -> (ToolCall -> AwaitingToolResult -> Reasoning)* -> Answering -> AwaitingInput
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AgentStage {
    /// Idle, waiting for the user.
    #[default]
    AwaitingInput,
    /// Waiting for the model.
    Reasoning,
    /// Dispatching tool calls.
    ToolCall,
    /// Waiting for tool servers to respond.
    AwaitingToolResult,
    /// Producing the final answer.
    Answering,
}

/// Conditions the user should be told about.
#[derive(Clone, Debug, PartialEq)]
pub enum Warning {
    /// A tool server was skipped at startup; its tools are unavailable.
    ToolServerSkipped(Error),
    /// A turn hit the iteration cap and was answered with what was
    /// gathered so far.
    Truncated {
        /// The cap that was hit.
        max_iterations: usize,
    },
}

impl Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::ToolServerSkipped(err) => {
                write!(f, "a tool server is unavailable: {}", err.reason())
            }
            Warning::Truncated { max_iterations } => write!(
                f,
                "stopped after {max_iterations} reasoning steps, the answer may be incomplete"
            ),
        }
    }
}

/// Limits of the reasoning loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnPolicy {
    /// Model requests allowed per turn before the answer is forced.
    pub max_iterations: usize,
    /// Corrective re-prompts after unparsable tool calls. One more
    /// failure ends the turn with the raw model output.
    pub parse_retries: usize,
    /// Corrective rounds after the model asked only for unknown tools.
    pub unknown_tool_retries: usize,
    /// How long transient model failures are retried.
    pub model_retry_window: Duration,
}

impl Default for TurnPolicy {
    fn default() -> Self {
        Self {
            max_iterations: 6,
            parse_retries: 1,
            unknown_tool_retries: 1,
            model_retry_window: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    on_idle: Option<Arc<dyn Fn() + Send + Sync>>,
    on_transcript: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    on_trace_step: Option<Arc<dyn Fn(&TraceStep) + Send + Sync>>,
    on_warning: Option<Arc<dyn Fn(&Warning) + Send + Sync>>,
}

#[derive(Debug)]
enum Command {
    UserInput(String),
    Cancel,
    Clear(oneshot::Sender<()>),
    History(oneshot::Sender<Vec<Message>>),
}

/// An agent instance, which maintains a conversation, a model client and
/// the tools it may call.
///
/// The agent runs on its own task. Methods on this handle return
/// immediately: inputs sent while a turn is running are queued and
/// handled in order once the agent is idle again. Dropping every handle
/// stops the agent after the queued inputs are processed.
#[derive(Clone)]
pub struct Agent {
    commands: mpsc::UnboundedSender<Command>,
    stage: watch::Receiver<AgentStage>,
    conversation_id: ConversationId,
    recorder: Arc<TraceRecorder>,
    tools: Arc<ToolHub>,
}

impl Agent {
    /// Enqueues a user message for processing.
    pub fn send_message<S: Into<String>>(&self, input: S) {
        self.send(Command::UserInput(input.into()));
    }

    /// Cancels the running turn, if any.
    ///
    /// Steps recorded so far are kept and the turn is closed with a
    /// cancelled final answer. Pending tool calls are abandoned.
    pub fn cancel(&self) {
        self.send(Command::Cancel);
    }

    /// Clears the conversation history and its trace, cancelling the
    /// running turn. Queued inputs are dropped.
    pub async fn clear(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Clear(tx));
        rx.await.ok();
    }

    /// Returns the committed conversation history.
    ///
    /// Messages of a running turn are committed when the turn ends.
    pub async fn history(&self) -> Vec<Message> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::History(tx));
        rx.await.unwrap_or_default()
    }

    /// Returns the recorded trace steps of this conversation.
    #[inline]
    pub fn trace(&self) -> Vec<TraceStep> {
        self.recorder.steps(&self.conversation_id)
    }

    /// Exports the trace of this conversation as JSON.
    #[inline]
    pub fn export_trace(&self) -> serde_json::Result<String> {
        self.recorder.export(&self.conversation_id)
    }

    /// Returns trace statistics of this conversation.
    #[inline]
    pub fn stats(&self) -> TraceStats {
        self.recorder.stats(&self.conversation_id)
    }

    /// Returns the current stage.
    #[inline]
    pub fn stage(&self) -> AgentStage {
        *self.stage.borrow()
    }

    /// Returns a receiver notified on every stage change.
    #[inline]
    pub fn watch_stage(&self) -> watch::Receiver<AgentStage> {
        self.stage.clone()
    }

    /// Returns the identifier of the conversation.
    #[inline]
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Returns the tools the model can currently use.
    #[inline]
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.descriptors()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            error!("agent task has stopped, dropping a command");
        }
    }
}
