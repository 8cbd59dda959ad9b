use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use wayfarer_core::conversation::{ConversationId, Message};
use wayfarer_core::tool::{ToolDescriptor, ToolHub};
use wayfarer_core::trace::{TraceStats, TraceStep};
use wayfarer_core::transport::ServerConfig;
use wayfarer_core::{Agent, AgentBuilder, AgentStage, TurnPolicy, Warning};
use wayfarer_model::ModelProvider;

use crate::config::Config;

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// A session builder.
///
/// See [`Session`].
pub struct SessionBuilder {
    agent_builder: AgentBuilder,
    servers: Vec<ServerConfig>,
    tool_timeout: Duration,
}

impl SessionBuilder {
    /// Creates a session builder with a specified model provider.
    pub fn with_model_provider<M: ModelProvider + 'static>(provider: M) -> Self {
        let agent_builder = AgentBuilder::with_model_provider(provider);
        Self {
            agent_builder,
            servers: vec![],
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Applies a configuration file: prompt, limits and tool servers.
    pub fn with_config(mut self, config: &Config) -> Self {
        if let Some(prompt) = &config.system_prompt {
            self = self.with_system_prompt(prompt.clone());
        }
        self.agent_builder = self.agent_builder.with_policy(config.turn_policy());
        self.servers.extend(config.servers.iter().cloned());
        self.tool_timeout = config.tool_timeout();
        self
    }

    /// Adds a tool server to launch.
    #[inline]
    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.servers.push(server);
        self
    }

    /// Sets the deadline of a single tool call.
    #[inline]
    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Sets the limits of the reasoning loop.
    #[inline]
    pub fn with_policy(mut self, policy: TurnPolicy) -> Self {
        self.agent_builder = self.agent_builder.with_policy(policy);
        self
    }

    /// Sets the system prompt for the agent.
    #[inline]
    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.agent_builder = self.agent_builder.with_system_prompt(prompt);
        self
    }

    /// Attaches a callback to be invoked when the agent is idle.
    #[inline]
    pub fn on_idle(mut self, on_idle: impl Fn() + Send + Sync + 'static) -> Self {
        self.agent_builder = self.agent_builder.on_idle(on_idle);
        self
    }

    /// Attaches a callback receiving model text as it streams in.
    #[inline]
    pub fn on_transcript(
        mut self,
        on_transcript: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        self.agent_builder = self.agent_builder.on_transcript(on_transcript);
        self
    }

    /// Attaches a callback invoked with every recorded trace step.
    #[inline]
    pub fn on_trace_step(
        mut self,
        on_trace_step: impl Fn(&TraceStep) + Send + Sync + 'static,
    ) -> Self {
        self.agent_builder = self.agent_builder.on_trace_step(on_trace_step);
        self
    }

    /// Attaches a callback for warnings meant for the user, such as tool
    /// servers that could not be started.
    #[inline]
    pub fn on_warning(
        mut self,
        on_warning: impl Fn(&Warning) + Send + Sync + 'static,
    ) -> Self {
        self.agent_builder = self.agent_builder.on_warning(on_warning);
        self
    }

    /// Launches the tool servers and builds a new session.
    ///
    /// Servers that fail to start or to register are skipped and reported
    /// through [`SessionBuilder::on_warning`].
    pub async fn build(self) -> Session {
        let hub = Arc::new(ToolHub::connect(&self.servers, self.tool_timeout).await);
        let agent = self.agent_builder.with_tool_hub(hub).build();
        Session { agent }
    }
}

/// A chat session, like a window that displays messages and has a input box.
///
/// The session holds a fully configured agent that you can use directly, and it
/// is basically a wrapper around [`Agent`].
pub struct Session {
    agent: Agent,
}

impl Session {
    /// Sends a message to the session.
    #[inline]
    pub fn send_message(&self, message: &str) {
        self.agent.send_message(message);
    }

    /// Stops the running turn.
    #[inline]
    pub fn cancel(&self) {
        self.agent.cancel();
    }

    /// Starts over with an empty conversation.
    #[inline]
    pub async fn clear(&self) {
        self.agent.clear().await;
    }

    /// Returns the messages exchanged so far.
    #[inline]
    pub async fn history(&self) -> Vec<Message> {
        self.agent.history().await
    }

    /// Writes the trace as JSON to `path`, or to
    /// `trace-<conversation id>.json` inside `path` if it is a directory.
    /// Returns the written file.
    pub async fn export_trace<P: AsRef<Path>>(&self, path: P) -> std::io::Result<PathBuf> {
        let mut path = path.as_ref().to_owned();
        if tokio::fs::metadata(&path)
            .await
            .is_ok_and(|metadata| metadata.is_dir())
        {
            path.push(format!("trace-{}.json", self.conversation_id()));
        }
        let document = self.agent.export_trace()?;
        tokio::fs::write(&path, document).await?;
        info!("exported trace to {}", path.display());
        Ok(path)
    }

    /// Returns statistics over the recorded trace.
    #[inline]
    pub fn stats(&self) -> TraceStats {
        self.agent.stats()
    }

    /// Returns the tools the model can use.
    #[inline]
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.agent.tools()
    }

    /// Returns where the agent is in its reasoning loop.
    #[inline]
    pub fn stage(&self) -> AgentStage {
        self.agent.stage()
    }

    /// Returns the identifier of the conversation.
    #[inline]
    pub fn conversation_id(&self) -> &ConversationId {
        self.agent.conversation_id()
    }

    /// Returns the underlying agent.
    #[inline]
    pub fn agent(&self) -> &Agent {
        &self.agent
    }
}
