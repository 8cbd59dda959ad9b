use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use wayfarer_model::ModelProvider;

use super::state::AgentState;
use super::turn::TurnEnv;
use super::{Agent, AgentStage, Callbacks, TurnPolicy, Warning};
use crate::conversation::{Conversation, ConversationId};
use crate::model_client::ModelClient;
use crate::tool::ToolHub;
use crate::trace::{TraceRecorder, TraceStep};

/// [`Agent`] builder.
pub struct AgentBuilder {
    model_client: ModelClient,
    tools: Option<Arc<ToolHub>>,
    recorder: Option<Arc<TraceRecorder>>,
    conversation_id: Option<ConversationId>,
    system_prompt: Option<String>,
    policy: TurnPolicy,
    callbacks: Callbacks,
}

impl AgentBuilder {
    /// Creates a new builder with the specified model provider.
    #[inline]
    pub fn with_model_provider<P: ModelProvider + 'static>(
        provider: P,
    ) -> Self {
        Self {
            model_client: ModelClient::new(provider),
            tools: None,
            recorder: None,
            conversation_id: None,
            system_prompt: None,
            policy: TurnPolicy::default(),
            callbacks: Callbacks::default(),
        }
    }

    /// Uses tools from the given hub.
    #[inline]
    pub fn with_tool_hub(mut self, tools: Arc<ToolHub>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Records traces into a shared recorder instead of a private one.
    #[inline]
    pub fn with_trace_recorder(mut self, recorder: Arc<TraceRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Sets the conversation id. A random one is generated otherwise.
    #[inline]
    pub fn with_conversation_id(mut self, id: ConversationId) -> Self {
        self.conversation_id = Some(id);
        self
    }

    /// Sets the system prompt sent before the conversation.
    #[inline]
    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Sets the limits of the reasoning loop.
    #[inline]
    pub fn with_policy(mut self, policy: TurnPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Attaches a callback to be invoked when the agent is idle.
    #[inline]
    pub fn on_idle(mut self, on_idle: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_idle = Some(Arc::new(on_idle));
        self
    }

    /// Attaches a callback receiving model text as it streams in.
    #[inline]
    pub fn on_transcript(
        mut self,
        on_transcript: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.on_transcript = Some(Arc::new(on_transcript));
        self
    }

    /// Attaches a callback invoked with every recorded trace step.
    #[inline]
    pub fn on_trace_step(
        mut self,
        on_trace_step: impl Fn(&TraceStep) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.on_trace_step = Some(Arc::new(on_trace_step));
        self
    }

    /// Attaches a callback for warnings meant for the user.
    #[inline]
    pub fn on_warning(
        mut self,
        on_warning: impl Fn(&Warning) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.on_warning = Some(Arc::new(on_warning));
        self
    }

    /// Builds the agent and starts its task.
    ///
    /// Tool servers the hub skipped are reported to the warning callback
    /// before this returns.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn build(self) -> Agent {
        let Self {
            model_client,
            tools,
            recorder,
            conversation_id,
            system_prompt,
            mut policy,
            callbacks,
        } = self;

        policy.max_iterations = policy.max_iterations.max(1);
        let tools = tools.unwrap_or_default();
        let recorder = recorder.unwrap_or_default();
        let conversation_id = conversation_id.unwrap_or_else(ConversationId::generate);
        let (stage_tx, stage_rx) = watch::channel(AgentStage::AwaitingInput);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let env = TurnEnv {
            model_client: model_client.with_retry_window(policy.model_retry_window),
            tools: Arc::clone(&tools),
            recorder: Arc::clone(&recorder),
            conversation_id: conversation_id.clone(),
            system_prompt,
            policy,
            stage: stage_tx,
            callbacks,
        };
        // Skipped servers are reported before `build` returns.
        env.report_registration_errors();
        let state = AgentState::new(env, Conversation::new(conversation_id.clone()));
        tokio::spawn(state.run(commands_rx));

        Agent {
            commands: commands_tx,
            stage: stage_rx,
            conversation_id,
            recorder,
            tools,
        }
    }
}
