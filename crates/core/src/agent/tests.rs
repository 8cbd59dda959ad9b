use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::duplex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use wayfarer_model::ModelMessage;
use wayfarer_test_model::{PresetEvent, PresetResponse, TestModelProvider};

use super::*;
use crate::conversation::Role;
use crate::server::ToolServer;
use crate::server::tests::{weather_server, weather_server_named};
use crate::trace::TraceKind;
use crate::transport::Connection;

fn connect(server: ToolServer, name: &str, call_timeout: Duration) -> Arc<Connection> {
    let (client, server_io) = duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_io);
    tokio::spawn(server.serve(server_read, server_write));
    let (client_read, client_write) = tokio::io::split(client);
    Connection::from_io(name, client_read, client_write, call_timeout)
}

async fn weather_hub(call_timeout: Duration) -> Arc<ToolHub> {
    let mut builder = ToolHub::builder();
    builder
        .add_connection(connect(weather_server(), "weather", call_timeout))
        .await
        .unwrap();
    Arc::new(builder.build())
}

/// An agent without tools, returning a receiver notified when it is idle.
fn bare_agent(
    model: TestModelProvider,
    builder: impl FnOnce(AgentBuilder) -> AgentBuilder,
) -> (Agent, mpsc::UnboundedReceiver<()>) {
    let (idle_tx, idle) = mpsc::unbounded_channel();
    let agent = builder(AgentBuilder::with_model_provider(model))
        .on_idle(move || {
            idle_tx.send(()).ok();
        })
        .build();
    (agent, idle)
}

async fn wait_idle(idle: &mut mpsc::UnboundedReceiver<()>) {
    timeout(Duration::from_secs(10), idle.recv())
        .await
        .expect("agent did not become idle")
        .unwrap();
}

struct Harness {
    agent: Agent,
    model: TestModelProvider,
    idle: mpsc::UnboundedReceiver<()>,
    warnings: Arc<Mutex<Vec<Warning>>>,
}

impl Harness {
    async fn new(responses: Vec<PresetResponse>) -> Self {
        Self::with(responses, TurnPolicy::default(), Duration::from_secs(5)).await
    }

    async fn with(
        responses: Vec<PresetResponse>,
        policy: TurnPolicy,
        call_timeout: Duration,
    ) -> Self {
        let hub = weather_hub(call_timeout).await;
        Self::with_hub(responses, policy, hub)
    }

    fn with_hub(
        responses: Vec<PresetResponse>,
        policy: TurnPolicy,
        hub: Arc<ToolHub>,
    ) -> Self {
        let mut model = TestModelProvider::default();
        for response in responses {
            model.add_response(response);
        }
        let (idle_tx, idle) = mpsc::unbounded_channel();
        let warnings = Arc::new(Mutex::new(Vec::new()));
        let agent = AgentBuilder::with_model_provider(model.clone())
            .with_tool_hub(hub)
            .with_system_prompt("You are a helpful travel assistant.")
            .with_policy(policy)
            .on_idle(move || {
                idle_tx.send(()).ok();
            })
            .on_warning({
                let warnings = Arc::clone(&warnings);
                move |warning| warnings.lock().push(warning.clone())
            })
            .build();
        Self {
            agent,
            model,
            idle,
            warnings,
        }
    }

    async fn ask(&mut self, input: &str) -> String {
        self.agent.send_message(input);
        self.wait_idle().await;
        self.last_answer().await
    }

    async fn wait_idle(&mut self) {
        wait_idle(&mut self.idle).await;
    }

    async fn last_answer(&self) -> String {
        let history = self.agent.history().await;
        let last = history.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        last.content.clone()
    }

    fn kinds(&self) -> Vec<TraceKind> {
        self.agent.trace().iter().map(|step| step.kind).collect()
    }

    fn final_payload(&self) -> Value {
        let trace = self.agent.trace();
        let last = trace.last().unwrap();
        assert_eq!(last.kind, TraceKind::FinalAnswer);
        last.payload.clone()
    }
}

#[tokio::test]
async fn test_direct_answer() {
    let mut harness = Harness::new(vec![PresetResponse::text("Hello there!")]).await;

    let answer = harness.ask("Hi").await;
    assert_eq!(answer, "Hello there!");
    assert_eq!(harness.kinds(), [TraceKind::UserInput, TraceKind::FinalAnswer]);
    assert_eq!(harness.agent.stats().tool_call_count, 0);
    assert_eq!(harness.agent.stage(), AgentStage::AwaitingInput);

    let requests = harness.model.requests();
    let request = &requests[0];
    assert_eq!(
        request.messages[0],
        ModelMessage::system("You are a helpful travel assistant.")
    );
    assert_eq!(request.tools.len(), 3);
}

#[tokio::test]
async fn test_milan_chain() {
    let mut harness = Harness::new(vec![
        PresetResponse::tool_call("m1", "get_current_weather", json!({ "location": "Milan" })),
        PresetResponse::tool_call("m2", "suggest_activities", json!({ "forecast": "sunny" })),
        PresetResponse::text("It's sunny in Milan, walk along the Navigli canals."),
    ])
    .await;

    let answer = harness.ask("What should I do in Milan today?").await;
    assert_eq!(answer, "It's sunny in Milan, walk along the Navigli canals.");
    assert_eq!(
        harness.kinds(),
        [
            TraceKind::UserInput,
            TraceKind::Reasoning,
            TraceKind::ToolCall,
            TraceKind::ToolResponse,
            TraceKind::Reasoning,
            TraceKind::ToolCall,
            TraceKind::ToolResponse,
            TraceKind::FinalAnswer,
        ]
    );

    let trace = harness.agent.trace();
    for (index, step) in trace.iter().enumerate() {
        assert_eq!(step.step_index, index as u64);
        assert_eq!(step.turn, 1);
    }
    assert_eq!(trace[2].payload["tool_name"], "get_current_weather");
    assert_eq!(trace[3].payload["call_id"], trace[2].payload["call_id"]);
    assert_eq!(trace[3].payload["result"]["forecast"], "sunny");
    assert_eq!(trace[5].payload["tool_name"], "suggest_activities");
    assert_eq!(trace[6].payload["call_id"], trace[5].payload["call_id"]);
    assert_eq!(trace[6].payload["result"], "Walk along the Navigli canals.");
    assert_eq!(trace[7].payload["truncated"], false);

    let history = harness.agent.history().await;
    let roles: Vec<Role> = history.iter().map(|message| message.role).collect();
    assert_eq!(
        roles,
        [
            Role::User,
            Role::Assistant,
            Role::Tool,
            Role::Assistant,
            Role::Tool,
            Role::Assistant,
        ]
    );
    assert_eq!(
        history[2].tool_call_id.as_deref(),
        Some(history[1].tool_calls[0].id.as_str())
    );
    assert_eq!(history[4].content, "Walk along the Navigli canals.");

    // The model sees the observation of the first call before deciding on
    // the second one.
    let requests = harness.model.requests();
    assert!(requests[1].messages.iter().any(|message| matches!(
        message,
        ModelMessage::Tool(result) if result.content.contains("sunny")
    )));

    let stats = harness.agent.stats();
    assert_eq!(stats.tool_call_count, 2);
    assert_eq!(stats.conversation_count, 1);
    assert_eq!(stats.average_steps, 8.0);
}

#[tokio::test]
async fn test_parallel_tool_calls() {
    let mut harness = Harness::new(vec![
        PresetResponse::with_events([
            PresetEvent::tool_call("m1", "get_current_weather", json!({ "location": "Milan" })),
            PresetEvent::tool_call("m2", "get_current_weather", json!({ "location": "Rome" })),
        ]),
        PresetResponse::text("Milan is sunny, Rome is cloudy."),
    ])
    .await;

    harness.ask("Compare Milan and Rome.").await;
    let trace = harness.agent.trace();
    let calls: Vec<&Value> = trace
        .iter()
        .filter(|step| step.kind == TraceKind::ToolCall)
        .map(|step| &step.payload["call_id"])
        .collect();
    let responses: Vec<&Value> = trace
        .iter()
        .filter(|step| step.kind == TraceKind::ToolResponse)
        .map(|step| &step.payload["call_id"])
        .collect();
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0], calls[1]);
    assert_eq!(calls, responses);
    assert_eq!(trace[4].payload["result"]["location"], "Milan");
    assert_eq!(trace[5].payload["result"]["location"], "Rome");
}

#[tokio::test]
async fn test_unknown_tool_is_observed() {
    let mut harness = Harness::new(vec![
        PresetResponse::tool_call("m1", "get_horoscope", json!({ "sign": "leo" })),
        PresetResponse::text("I can't read horoscopes, sorry."),
    ])
    .await;

    let answer = harness.ask("What's my horoscope?").await;
    assert_eq!(answer, "I can't read horoscopes, sorry.");

    let trace = harness.agent.trace();
    let response = trace
        .iter()
        .find(|step| step.kind == TraceKind::ToolResponse)
        .unwrap();
    assert_eq!(response.payload["error"]["kind"], "unknown_tool");

    let history = harness.agent.history().await;
    let observation = history.iter().find(|message| message.role == Role::Tool).unwrap();
    assert!(observation.is_error);
    assert!(harness.warnings.lock().is_empty());
}

#[tokio::test]
async fn test_repeated_unknown_tools_force_an_answer() {
    let mut harness = Harness::new(vec![
        PresetResponse::tool_call("m1", "get_horoscope", json!({})),
        PresetResponse::tool_call("m2", "get_horoscope", json!({})),
        PresetResponse::text("Horoscopes are not available."),
    ])
    .await;

    let answer = harness.ask("What's my horoscope?").await;
    assert_eq!(answer, "Horoscopes are not available.");

    let requests = harness.model.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[2].tools.is_empty());
    assert_eq!(harness.final_payload()["truncated"], false);
}

#[tokio::test]
async fn test_malformed_tool_call_is_corrected() {
    let mut harness = Harness::new(vec![
        PresetResponse::with_events([PresetEvent::raw_tool_call(
            "m1",
            "get_current_weather",
            r#"{"location": "Mil"#,
        )]),
        PresetResponse::text("Milan is sunny."),
    ])
    .await;

    let answer = harness.ask("Weather in Milan?").await;
    assert_eq!(answer, "Milan is sunny.");
    assert_eq!(
        harness.kinds(),
        [TraceKind::UserInput, TraceKind::Reasoning, TraceKind::FinalAnswer]
    );
    assert_eq!(harness.agent.trace()[1].payload["error"]["kind"], "parse");

    let requests = harness.model.requests();
    let Some(ModelMessage::System { content }) = requests[1].messages.last() else {
        panic!("expected a correction notice");
    };
    assert!(content.contains("invalid tool call"));
}

#[tokio::test]
async fn test_persistent_malformed_output_becomes_the_answer() {
    let mut harness = Harness::new(vec![
        // Violates the schema: `location` is required.
        PresetResponse::tool_call("m1", "get_current_weather", json!({ "city": "Milan" })),
        PresetResponse::with_events([
            PresetEvent::MessageDelta("Let me check the weather.".to_owned()),
            PresetEvent::raw_tool_call("m2", "get_current_weather", "{oops"),
        ]),
    ])
    .await;

    let answer = harness.ask("Weather in Milan?").await;
    assert_eq!(answer, "Let me check the weather.");
    assert_eq!(harness.model.requests().len(), 2);
    assert_eq!(harness.agent.stats().tool_call_count, 0);
}

#[tokio::test]
async fn test_iteration_cap_truncates() {
    let policy = TurnPolicy {
        max_iterations: 2,
        ..Default::default()
    };
    let mut harness = Harness::with(
        vec![
            PresetResponse::tool_call("m1", "get_current_weather", json!({ "location": "Milan" })),
            PresetResponse::tool_call("m2", "get_current_weather", json!({ "location": "Rome" })),
            PresetResponse::text("Milan is sunny and Rome is cloudy."),
        ],
        policy,
        Duration::from_secs(5),
    )
    .await;

    let answer = harness.ask("Where is the weather better?").await;
    assert_eq!(answer, "Milan is sunny and Rome is cloudy.");
    assert_eq!(harness.final_payload()["truncated"], true);

    let requests = harness.model.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[2].tools.is_empty());
    assert_eq!(
        *harness.warnings.lock(),
        [Warning::Truncated { max_iterations: 2 }]
    );
}

#[tokio::test]
async fn test_truncation_falls_back_to_observations() {
    let policy = TurnPolicy {
        max_iterations: 1,
        ..Default::default()
    };
    // Nothing is scripted for the summary request, so it fails.
    let mut harness = Harness::with(
        vec![PresetResponse::tool_call(
            "m1",
            "get_current_weather",
            json!({ "location": "Milan" }),
        )],
        policy,
        Duration::from_secs(5),
    )
    .await;

    let answer = harness.ask("Weather in Milan?").await;
    assert!(answer.contains("- get_current_weather: "));
    assert!(answer.contains("sunny"));
    assert_eq!(harness.final_payload()["truncated"], true);
}

#[tokio::test]
async fn test_cancel_during_tool_call() {
    let mut harness = Harness::new(vec![
        PresetResponse::tool_call("m1", "nap", json!({ "seconds": 60 })),
        PresetResponse::text("Welcome back!"),
    ])
    .await;

    let mut stage = harness.agent.watch_stage();
    harness.agent.send_message("Take a long nap.");
    timeout(
        Duration::from_secs(5),
        stage.wait_for(|stage| *stage == AgentStage::AwaitingToolResult),
    )
    .await
    .unwrap()
    .unwrap();
    harness.agent.cancel();
    harness.wait_idle().await;

    assert_eq!(harness.agent.stage(), AgentStage::AwaitingInput);
    assert_eq!(
        harness.kinds(),
        [
            TraceKind::UserInput,
            TraceKind::Reasoning,
            TraceKind::ToolCall,
            TraceKind::FinalAnswer,
        ]
    );
    let payload = harness.final_payload();
    assert_eq!(payload["cancelled"], true);
    assert_eq!(payload["content"], Value::Null);

    let history = harness.agent.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, Role::User);

    let answer = harness.ask("Hello again").await;
    assert_eq!(answer, "Welcome back!");
    let trace = harness.agent.trace();
    assert_eq!(trace.last().unwrap().step_index, trace.len() as u64 - 1);
    assert_eq!(trace.last().unwrap().turn, 2);
}

#[tokio::test]
async fn test_cancelled_call_does_not_block_the_server() {
    let mut harness = Harness::with(
        vec![
            PresetResponse::tool_call("m1", "nap", json!({ "seconds": 60 })),
            PresetResponse::tool_call("m2", "get_current_weather", json!({ "location": "Milan" })),
            PresetResponse::text("It is sunny in Milan."),
        ],
        TurnPolicy::default(),
        Duration::from_secs(2),
    )
    .await;

    let mut stage = harness.agent.watch_stage();
    harness.agent.send_message("Take a long nap.");
    timeout(
        Duration::from_secs(5),
        stage.wait_for(|stage| *stage == AgentStage::AwaitingToolResult),
    )
    .await
    .unwrap()
    .unwrap();
    harness.agent.cancel();
    harness.wait_idle().await;

    let answer = harness.ask("What's the weather in Milan?").await;
    assert_eq!(answer, "It is sunny in Milan.");
    let response = harness
        .agent
        .trace()
        .into_iter()
        .rfind(|step| step.kind == TraceKind::ToolResponse)
        .unwrap();
    assert_eq!(response.turn, 2);
    assert_eq!(response.payload["tool_name"], "get_current_weather");
    assert!(response.payload.get("error").is_none(), "{}", response.payload);
}

#[tokio::test]
async fn test_broken_server_is_excluded() {
    let (client, server_io) = duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_io);
    let server_task = tokio::spawn(weather_server().serve(server_read, server_write));
    let (client_read, client_write) = tokio::io::split(client);
    let connection =
        Connection::from_io("weather", client_read, client_write, Duration::from_secs(30));
    let mut builder = ToolHub::builder();
    builder.add_connection(connection).await.unwrap();
    let hub = Arc::new(builder.build());

    let mut harness = Harness::with_hub(
        vec![
            PresetResponse::tool_call("m1", "nap", json!({ "seconds": 60 })),
            PresetResponse::text("The weather service went away."),
            PresetResponse::text("I have no tools right now."),
        ],
        TurnPolicy::default(),
        hub,
    );

    let mut stage = harness.agent.watch_stage();
    harness.agent.send_message("Take a long nap.");
    timeout(
        Duration::from_secs(5),
        stage.wait_for(|stage| *stage == AgentStage::AwaitingToolResult),
    )
    .await
    .unwrap()
    .unwrap();
    server_task.abort();
    harness.wait_idle().await;

    assert_eq!(harness.last_answer().await, "The weather service went away.");
    let response = harness
        .agent
        .trace()
        .into_iter()
        .find(|step| step.kind == TraceKind::ToolResponse)
        .unwrap();
    assert_eq!(response.payload["error"]["kind"], "transport");
    assert!(harness.agent.tools().is_empty());

    harness.ask("Anything else?").await;
    let requests = harness.model.requests();
    assert!(!requests[0].tools.is_empty());
    assert!(requests.last().unwrap().tools.is_empty());
}

#[tokio::test]
async fn test_tool_timeout_is_observed() {
    let mut harness = Harness::with(
        vec![
            PresetResponse::tool_call("m1", "nap", json!({ "seconds": 5 })),
            PresetResponse::text("The nap took too long."),
        ],
        TurnPolicy::default(),
        Duration::from_millis(100),
    )
    .await;

    let answer = harness.ask("Take a nap.").await;
    assert_eq!(answer, "The nap took too long.");
    let response = harness
        .agent
        .trace()
        .into_iter()
        .find(|step| step.kind == TraceKind::ToolResponse)
        .unwrap();
    assert_eq!(response.payload["error"]["kind"], "timeout");
}

#[tokio::test]
async fn test_clear() {
    let mut harness = Harness::new(vec![
        PresetResponse::text("Hello!"),
        PresetResponse::text("Hello again!"),
    ])
    .await;

    harness.ask("Hi").await;
    harness.agent.clear().await;
    assert!(harness.agent.history().await.is_empty());
    assert!(harness.agent.trace().is_empty());

    harness.ask("Hi").await;
    let trace = harness.agent.trace();
    assert_eq!(trace.len(), 2);
    assert_eq!(trace[0].step_index, 0);
    assert_eq!(trace[0].turn, 1);
    assert_eq!(harness.agent.history().await.len(), 2);
}

#[tokio::test]
async fn test_export_is_stable() {
    let mut harness = Harness::new(vec![PresetResponse::tool_call(
        "m1",
        "get_current_weather",
        json!({ "location": "Rome" }),
    )])
    .await;
    harness.model.add_response(PresetResponse::text("Rome is cloudy."));

    harness.ask("Weather in Rome?").await;
    let first = harness.agent.export_trace().unwrap();
    let second = harness.agent.export_trace().unwrap();
    assert_eq!(first, second);

    let document: Value = serde_json::from_str(&first).unwrap();
    assert_eq!(
        document["conversation_id"],
        harness.agent.conversation_id().as_str()
    );
    assert_eq!(document["steps"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn test_inputs_are_queued() {
    let mut model = TestModelProvider::default();
    model.set_delay(Duration::from_millis(20));
    model.add_response(PresetResponse::text("first"));
    model.add_response(PresetResponse::text("second"));
    let (agent, mut idle) = bare_agent(model, |builder| builder);

    agent.send_message("one");
    agent.send_message("two");
    wait_idle(&mut idle).await;

    let contents: Vec<String> = agent
        .history()
        .await
        .into_iter()
        .map(|message| message.content)
        .collect();
    assert_eq!(contents, ["one", "first", "two", "second"]);
    assert_eq!(agent.stats().conversation_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_model_is_retried() {
    let mut model = TestModelProvider::default();
    model.add_response(PresetResponse::text("Hello!").with_failures(2));
    let (agent, mut idle) = bare_agent(model.clone(), |builder| builder);

    agent.send_message("Hi");
    wait_idle(&mut idle).await;
    assert_eq!(agent.history().await[1].content, "Hello!");
    assert_eq!(model.requests().len(), 3);
    assert!(agent.trace().iter().all(|step| step.kind != TraceKind::Reasoning));
}

#[tokio::test]
async fn test_model_failure_ends_the_turn() {
    let mut harness = Harness::new(vec![PresetResponse::text("never").with_failures(0)]).await;

    let answer = harness.ask("Hi").await;
    assert!(answer.starts_with("Sorry"));
    assert_eq!(
        harness.kinds(),
        [TraceKind::UserInput, TraceKind::Reasoning, TraceKind::FinalAnswer]
    );
    assert_eq!(harness.final_payload()["error"]["kind"], "model");
}

#[tokio::test]
async fn test_skipped_server_is_reported() {
    let mut builder = ToolHub::builder();
    builder
        .add_connection(connect(weather_server(), "weather", Duration::from_secs(5)))
        .await
        .unwrap();
    builder
        .add_connection(connect(
            weather_server_named("weather-copy"),
            "weather-copy",
            Duration::from_secs(5),
        ))
        .await
        .unwrap_err();
    let hub = Arc::new(builder.build());

    let mut harness = Harness::with_hub(
        vec![PresetResponse::text("Hi!")],
        TurnPolicy::default(),
        hub,
    );
    // Known as soon as the agent is built.
    assert_eq!(harness.warnings.lock().len(), 1);
    harness.ask("Hello").await;

    let warnings = harness.warnings.lock();
    assert_eq!(warnings.len(), 1);
    assert!(matches!(
        &warnings[0],
        Warning::ToolServerSkipped(err) if err.kind() == crate::ErrorKind::Registration
    ));
}

#[tokio::test]
async fn test_trace_step_callback() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut model = TestModelProvider::default();
    model.add_response(PresetResponse::text("Hi!"));
    let (agent, mut idle) = bare_agent(model, |builder| {
        let seen = Arc::clone(&seen);
        builder.on_trace_step(move |step| seen.lock().push(step.clone()))
    });

    agent.send_message("Hello");
    wait_idle(&mut idle).await;
    assert_eq!(*seen.lock(), agent.trace());
}

#[tokio::test]
async fn test_shared_recorder() {
    let recorder = Arc::new(TraceRecorder::new());
    let mut agents = vec![];
    for id in ["trip-a", "trip-b"] {
        let mut model = TestModelProvider::default();
        model.add_response(PresetResponse::text("Hi!"));
        let recorder = Arc::clone(&recorder);
        agents.push(bare_agent(model, move |builder| {
            builder
                .with_trace_recorder(recorder)
                .with_conversation_id(id.into())
        }));
    }

    for (agent, idle) in &mut agents {
        agent.send_message("Hello");
        wait_idle(idle).await;
    }

    assert_eq!(agents[0].0.conversation_id().as_str(), "trip-a");
    assert_eq!(recorder.steps(&"trip-b".into()).len(), 2);
    let totals = recorder.totals();
    assert_eq!(totals.conversation_count, 2);
    assert!((totals.average_steps - 2.0).abs() < f64::EPSILON);
}
