use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinSet;
use wayfarer_model::{
    ModelMessage, ModelProviderError, ModelRequest, ModelTool, ToolCallIntent,
};

use super::{AgentStage, Callbacks, TurnPolicy, Warning};
use crate::conversation::{ConversationId, Message, Role};
use crate::decision::{self, Decision, Invocation};
use crate::error::{Error, ErrorKind};
use crate::model_client::{ModelClient, ModelClientResponse};
use crate::tool::{ToolCallRequest, ToolCallResponse, ToolHub};
use crate::trace::{TraceKind, TraceRecorder, TraceStep};

const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// Everything a turn needs, shared by all turns of an agent.
pub(super) struct TurnEnv {
    pub model_client: ModelClient,
    pub tools: Arc<ToolHub>,
    pub recorder: Arc<TraceRecorder>,
    pub conversation_id: ConversationId,
    pub system_prompt: Option<String>,
    pub policy: TurnPolicy,
    pub stage: watch::Sender<AgentStage>,
    pub callbacks: Callbacks,
}

/// Messages produced by a finished turn, to be committed to history.
pub(super) struct TurnOutcome {
    pub messages: Vec<Message>,
}

impl TurnEnv {
    pub fn record(&self, kind: TraceKind, payload: Value) -> TraceStep {
        let step = self.recorder.record(&self.conversation_id, kind, payload);
        if let Some(on_trace_step) = &self.callbacks.on_trace_step {
            on_trace_step(&step);
        }
        step
    }

    pub fn set_stage(&self, stage: AgentStage) {
        self.stage.send_replace(stage);
    }

    pub fn warn(&self, warning: Warning) {
        warn!("{warning}");
        if let Some(on_warning) = &self.callbacks.on_warning {
            on_warning(&warning);
        }
    }

    pub fn report_registration_errors(&self) {
        for err in self.tools.registration_errors() {
            self.warn(Warning::ToolServerSkipped(err.clone()));
        }
    }

    /// Runs one turn of the reasoning loop for `input`.
    ///
    /// The turn only reads `history`; the messages it produces are
    /// returned so the caller can commit them. Dropping the future
    /// cancels the turn, including its in-flight tool calls.
    pub async fn run_turn(&self, history: &[Message], input: String) -> TurnOutcome {
        self.set_stage(AgentStage::Reasoning);
        self.record(TraceKind::UserInput, json!({ "content": input }));
        let mut messages = vec![Message::user(input)];

        let tools: Vec<ModelTool> = self
            .tools
            .descriptors()
            .iter()
            .map(|descriptor| descriptor.to_model_tool())
            .collect();
        let mut parse_failures = 0;
        let mut unknown_tool_rounds = 0;
        let mut notice: Option<String> = None;

        for iteration in 1..=self.policy.max_iterations {
            self.set_stage(AgentStage::Reasoning);
            let request =
                self.build_request(history, &messages, notice.take().as_deref(), tools.clone());
            let response = match self.send(request).await {
                Ok(response) => response,
                Err(err) => return self.model_failed(messages, iteration, err),
            };

            let invocations = match decision::decide(&response, self.tools.registry()) {
                Ok(Decision::FinalAnswer(answer)) => {
                    return self.answer(messages, answer, false, None);
                }
                Ok(Decision::ToolInvocations(invocations)) => invocations,
                Err(err) => {
                    parse_failures += 1;
                    self.record(
                        TraceKind::Reasoning,
                        json!({
                            "iteration": iteration,
                            "content": response.transcript,
                            "tool_calls": response.tool_calls,
                            "error": err,
                        }),
                    );
                    if parse_failures > self.policy.parse_retries {
                        warn!("model output still unparsable, answering with it as is: {err}");
                        let answer = decision::render_raw(&response);
                        return self.answer(messages, answer, false, None);
                    }
                    debug!("asking the model to correct its tool call: {err}");
                    notice = Some(format!(
                        "Your previous reply contained an invalid tool call: {}. \
                         Reply again with valid tool calls whose arguments are a \
                         JSON object matching the tool's parameter schema, or \
                         answer the user directly.",
                        err.reason()
                    ));
                    continue;
                }
            };
            parse_failures = 0;

            let planned: Vec<Value> = invocations
                .iter()
                .map(|invocation| {
                    json!({
                        "tool_name": invocation.tool_name,
                        "arguments": invocation.arguments,
                    })
                })
                .collect();
            self.record(
                TraceKind::Reasoning,
                json!({
                    "iteration": iteration,
                    "content": response.transcript,
                    "tool_calls": planned,
                }),
            );

            let responses = self
                .run_tools(&mut messages, response.transcript, invocations)
                .await;
            let only_unknown = responses.iter().all(|response| {
                matches!(&response.result, Err(err) if err.kind() == ErrorKind::UnknownTool)
            });
            if only_unknown {
                unknown_tool_rounds += 1;
                if unknown_tool_rounds > self.policy.unknown_tool_retries {
                    warn!("model keeps asking for unknown tools, forcing an answer");
                    return self.force_answer(history, messages, false).await;
                }
            } else {
                unknown_tool_rounds = 0;
            }
        }

        self.force_answer(history, messages, true).await
    }

    async fn run_tools(
        &self,
        messages: &mut Vec<Message>,
        transcript: String,
        invocations: Vec<Invocation>,
    ) -> Vec<ToolCallResponse> {
        self.set_stage(AgentStage::ToolCall);
        let requests: Vec<ToolCallRequest> = invocations
            .into_iter()
            .map(|invocation| ToolCallRequest::new(invocation.tool_name, invocation.arguments))
            .collect();
        let intents = requests
            .iter()
            .map(|request| {
                ToolCallIntent::with_json(
                    request.call_id.clone(),
                    request.tool_name.clone(),
                    &Value::Object(request.arguments.clone()),
                )
            })
            .collect();
        messages.push(Message::assistant(transcript, intents));

        let mut calls = JoinSet::new();
        for (index, request) in requests.iter().enumerate() {
            self.record(
                TraceKind::ToolCall,
                json!({
                    "call_id": request.call_id,
                    "tool_name": request.tool_name,
                    "arguments": request.arguments,
                }),
            );
            let pending = self.tools.dispatch(request);
            calls.spawn(async move { (index, pending.await) });
        }

        self.set_stage(AgentStage::AwaitingToolResult);
        let mut finished: Vec<Option<ToolCallResponse>> = vec![None; requests.len()];
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((index, response)) => finished[index] = Some(response),
                Err(err) => error!("tool call task failed: {err}"),
            }
        }

        requests
            .iter()
            .zip(finished)
            .map(|(request, response)| {
                let response = response.unwrap_or_else(|| ToolCallResponse {
                    call_id: request.call_id.clone(),
                    result: Err(Error::tool_execution().with_reason("tool call was lost")),
                    latency: Duration::ZERO,
                });
                let mut payload = json!({
                    "call_id": response.call_id,
                    "tool_name": request.tool_name,
                    "latency_ms": response.latency.as_millis() as u64,
                });
                match &response.result {
                    Ok(value) => payload["result"] = value.clone(),
                    Err(err) => {
                        debug!("`{}` failed: {err}", request.tool_name);
                        payload["error"] = json!(err);
                    }
                }
                self.record(TraceKind::ToolResponse, payload);
                messages.push(Message::tool(
                    response.call_id.clone(),
                    response.observation(),
                    response.result.is_err(),
                ));
                response
            })
            .collect()
    }

    /// Ends the turn without tools, asking the model to answer from what
    /// it has gathered. Falls back to listing the observations.
    async fn force_answer(
        &self,
        history: &[Message],
        messages: Vec<Message>,
        truncated: bool,
    ) -> TurnOutcome {
        self.set_stage(AgentStage::Answering);
        if truncated {
            self.warn(Warning::Truncated {
                max_iterations: self.policy.max_iterations,
            });
        }
        let notice = if truncated {
            "You have used up the tool calls allowed for this request. Answer \
             the user now, using only the observations gathered so far."
        } else {
            "The tools you asked for do not exist. Answer the user now \
             without calling tools."
        };
        let request = self.build_request(history, &messages, Some(notice), vec![]);
        let answer = match self.send(request).await {
            Ok(response)
                if response.tool_calls.is_empty()
                    && !response.transcript.trim().is_empty() =>
            {
                response.transcript
            }
            Ok(_) => summarize_observations(&messages),
            Err(err) => {
                warn!("cannot get a final answer from the model: {err}");
                summarize_observations(&messages)
            }
        };
        self.answer(messages, answer, truncated, None)
    }

    fn model_failed(
        &self,
        messages: Vec<Message>,
        iteration: usize,
        err: Box<dyn ModelProviderError>,
    ) -> TurnOutcome {
        let error = Error::model().with_reason(err.to_string());
        self.record(
            TraceKind::Reasoning,
            json!({ "iteration": iteration, "error": error }),
        );
        let answer = format!("Sorry, the language model is unavailable right now: {err}");
        self.answer(messages, answer, false, Some(error))
    }

    fn answer(
        &self,
        mut messages: Vec<Message>,
        answer: String,
        truncated: bool,
        error: Option<Error>,
    ) -> TurnOutcome {
        self.set_stage(AgentStage::Answering);
        let mut payload = json!({
            "content": answer,
            "truncated": truncated,
            "cancelled": false,
        });
        if let Some(error) = error {
            payload["error"] = json!(error);
        }
        self.record(TraceKind::FinalAnswer, payload);
        messages.push(Message::assistant(answer, vec![]));
        TurnOutcome { messages }
    }

    fn build_request(
        &self,
        history: &[Message],
        messages: &[Message],
        notice: Option<&str>,
        tools: Vec<ModelTool>,
    ) -> ModelRequest {
        let mut model_messages = Vec::with_capacity(history.len() + messages.len() + 2);
        if let Some(prompt) = &self.system_prompt {
            model_messages.push(ModelMessage::system(prompt.clone()));
        }
        model_messages.extend(
            history
                .iter()
                .chain(messages)
                .map(Message::to_model_message),
        );
        if let Some(notice) = notice {
            model_messages.push(ModelMessage::system(notice));
        }
        ModelRequest {
            messages: model_messages,
            tools,
        }
    }

    async fn send(
        &self,
        request: ModelRequest,
    ) -> Result<ModelClientResponse, Box<dyn ModelProviderError>> {
        let on_transcript = self.callbacks.on_transcript.clone();
        self.model_client
            .send_request(request, move |delta| {
                if let Some(on_transcript) = &on_transcript {
                    on_transcript(&delta);
                }
            })
            .await
    }
}

fn summarize_observations(messages: &[Message]) -> String {
    let tool_names: HashMap<&str, &str> = messages
        .iter()
        .flat_map(|message| message.tool_calls.iter())
        .map(|intent| (intent.id.as_str(), intent.name.as_str()))
        .collect();
    let observations: Vec<String> = messages
        .iter()
        .filter(|message| message.role == Role::Tool)
        .map(|message| {
            let call_id = message.tool_call_id.as_deref().unwrap_or_default();
            let name = tool_names.get(call_id).copied().unwrap_or("tool");
            format!("- {name}: {}", preview(&message.content))
        })
        .collect();

    if observations.is_empty() {
        "I couldn't complete this request within the allowed number of steps.".to_owned()
    } else {
        format!(
            "I couldn't complete this request within the allowed number of steps. \
             Here is what I found so far:\n{}",
            observations.join("\n")
        )
    }
}

fn preview(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(OBSERVATION_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
