//! The `wayfarer` terminal client.

#[macro_use]
extern crate tracing;

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::select;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::sleep;
use wayfarer::core::Warning;
use wayfarer::core::trace::{TraceKind, TraceStep};
use wayfarer::{Config, Session, SessionBuilder};
use wayfarer_openai_model::{OpenAIConfigBuilder, OpenAIProvider};

/// A travel assistant that answers with the help of tool servers.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the configuration file (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory `/export` writes traces to.
    #[arg(long, default_value = ".")]
    export_dir: PathBuf,

    /// API key of the model endpoint.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Base URL of an OpenAI-compatible endpoint.
    #[arg(long, env = "OPENAI_BASE_URL")]
    base_url: Option<String>,

    /// The model to use.
    #[arg(long, env = "OPENAI_MODEL")]
    model: Option<String>,
}

enum SessionEvent {
    Idle,
    Transcript(String),
    Step(TraceStep),
    Warning(Warning),
}

enum Flow {
    Continue,
    Quit,
}

const BAR_CHAR: &str = "▎";
const SPINNER_PREVIEW_CHARS: usize = 60;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => match Config::load(path).await {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{err}");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    let mut model_config = OpenAIConfigBuilder::with_api_key(args.api_key.clone());
    if let Some(base_url) = &args.base_url {
        model_config = model_config.with_base_url(base_url.clone());
    }
    if let Some(model) = &args.model {
        model_config = model_config.with_model(model.clone());
    }
    let model_provider = OpenAIProvider::new(model_config.build());

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let session = SessionBuilder::with_model_provider(model_provider)
        .with_system_prompt(include_str!("./system_prompt.md"))
        .with_config(&config)
        .on_idle({
            let event_tx = event_tx.clone();
            move || {
                event_tx.send(SessionEvent::Idle).ok();
            }
        })
        .on_transcript({
            let event_tx = event_tx.clone();
            move |delta| {
                event_tx.send(SessionEvent::Transcript(delta.to_owned())).ok();
            }
        })
        .on_trace_step({
            let event_tx = event_tx.clone();
            move |step| {
                event_tx.send(SessionEvent::Step(step.clone())).ok();
            }
        })
        .on_warning({
            let event_tx = event_tx.clone();
            move |warning| {
                event_tx.send(SessionEvent::Warning(warning.clone())).ok();
            }
        })
        .build()
        .await;
    drop(event_tx);

    println!(
        "{} tool(s) available. Type /tools, /stats, /export, /clear or /quit.",
        session.tools().len()
    );

    let progress_style = ProgressStyle::with_template("{spinner} {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");

    let mut input = io::BufReader::new(io::stdin()).lines();

    'outer: loop {
        // Warnings may arrive while no turn is running.
        while let Ok(event) = event_rx.try_recv() {
            if let SessionEvent::Warning(warning) = event {
                print_warning(&warning);
            }
        }

        print!("> ");
        std::io::stdout().flush().ok();

        let line = select! {
            line = read_line(&mut input) => line,
            _ = signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(command) = line.strip_prefix('/') {
            match run_command(&session, command, &args.export_dir).await {
                Flow::Continue => continue,
                Flow::Quit => break,
            }
        }
        session.send_message(line);

        let mut progress_bar = None;
        let mut streamed = String::new();

        loop {
            // Create a new progress bar if it has been finished.
            progress_bar
                .get_or_insert_with(|| {
                    let progress_bar = ProgressBar::new_spinner();
                    progress_bar.set_style(progress_style.clone());
                    progress_bar.set_message("🤔 Thinking...");
                    progress_bar
                })
                .inc(1);

            let sleep = sleep(Duration::from_millis(100));
            let event = select! {
                event = event_rx.recv() => {
                    let Some(event) = event else {
                        break 'outer;
                    };
                    event
                },
                _ = signal::ctrl_c() => {
                    session.cancel();
                    continue;
                },
                _ = sleep => {
                    continue;
                }
            };

            if let SessionEvent::Transcript(delta) = &event {
                streamed.push_str(delta);
                if let Some(progress_bar) = &progress_bar {
                    progress_bar.set_message(format!("🤔 {}", preview(&streamed)));
                }
                continue;
            }

            // Finish the progress bar before printing anything else.
            if let Some(progress_bar) = &progress_bar {
                progress_bar.finish_and_clear();
            }
            progress_bar = None;

            match event {
                SessionEvent::Step(step) => {
                    if step.kind == TraceKind::Reasoning {
                        streamed.clear();
                    }
                    print_step(&step);
                }
                SessionEvent::Warning(warning) => print_warning(&warning),
                SessionEvent::Idle => break,
                SessionEvent::Transcript(_) => {}
            }
        }
    }

    ExitCode::SUCCESS
}

async fn run_command(session: &Session, command: &str, export_dir: &Path) -> Flow {
    let (name, argument) = match command.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, Some(argument.trim())),
        None => (command, None),
    };
    match name {
        "quit" | "exit" => return Flow::Quit,
        "clear" => {
            session.clear().await;
            println!("Conversation cleared.");
        }
        "export" => {
            let target = argument
                .filter(|argument| !argument.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| export_dir.to_owned());
            match session.export_trace(&target).await {
                Ok(path) => println!("Trace written to {}", path.display()),
                Err(err) => eprintln!("cannot export trace: {err}"),
            }
        }
        "stats" => {
            let stats = session.stats();
            println!("tool calls:     {}", stats.tool_call_count);
            println!("exchanges:      {}", stats.conversation_count);
            println!("average steps:  {:.1}", stats.average_steps);
        }
        "tools" => {
            let tools = session.tools();
            if tools.is_empty() {
                println!("No tools available.");
            }
            for tool in tools {
                println!("{}  {}", tool.name.bright_white().bold(), tool.description);
            }
        }
        other => {
            println!(
                "Unknown command `/{other}`. Try /clear, /export [path], /stats, /tools or /quit."
            );
        }
    }
    Flow::Continue
}

fn print_step(step: &TraceStep) {
    let payload = &step.payload;
    match step.kind {
        TraceKind::ToolCall => {
            println!(
                "{}🔧 {} {}",
                BAR_CHAR.bright_yellow(),
                payload["tool_name"].as_str().unwrap_or_default().bright_white(),
                payload["arguments"].dimmed()
            );
        }
        TraceKind::ToolResponse => {
            let tool_name = payload["tool_name"].as_str().unwrap_or_default();
            if let Some(reason) = payload["error"]["reason"].as_str() {
                println!("{}✗ {tool_name}: {}", BAR_CHAR.bright_red(), reason.red());
            } else {
                println!(
                    "{}✓ {tool_name} {}",
                    BAR_CHAR.bright_green(),
                    format!("({} ms)", payload["latency_ms"]).dimmed()
                );
            }
        }
        TraceKind::FinalAnswer => {
            if payload["cancelled"].as_bool().unwrap_or_default() {
                println!("{}⏹  Cancelled.", BAR_CHAR.bright_black());
            } else if let Some(content) = payload["content"].as_str() {
                println!("{}🤖 {}", BAR_CHAR.bright_cyan(), content.bright_white());
            }
        }
        TraceKind::UserInput | TraceKind::Reasoning => {}
    }
}

fn print_warning(warning: &Warning) {
    println!("{}⚠️  {}", BAR_CHAR.bright_yellow(), warning.yellow());
}

fn preview(text: &str) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let count = flat.chars().count();
    if count <= SPINNER_PREVIEW_CHARS {
        return flat;
    }
    let tail: String = flat.chars().skip(count - SPINNER_PREVIEW_CHARS).collect();
    format!("…{tail}")
}

async fn read_line<R: AsyncBufRead + Unpin>(input: &mut Lines<R>) -> Option<String> {
    match input.next_line().await {
        Ok(line) => line,
        Err(err) => {
            error!("error reading input: {}", err);
            None
        }
    }
}
