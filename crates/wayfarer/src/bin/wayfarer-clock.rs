//! A tool server answering date and time questions over stdio.
//!
//! Add it to the configuration like any other server:
//!
//! ```toml
//! [[servers]]
//! name = "clock"
//! command = "wayfarer-clock"
//! ```

use std::process::ExitCode;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::{Value, json};
use wayfarer::core::Error;
use wayfarer::core::server::{Tool, ToolResult, ToolServer};

#[derive(Deserialize, JsonSchema)]
struct CurrentTimeParameters {
    #[schemars(description = "Offset from UTC in minutes, e.g. 120 for UTC+2.")]
    #[serde(default)]
    utc_offset_minutes: i32,
}

/// Tells the current date and time.
struct CurrentTimeTool {
    parameter_schema: Value,
}

impl Tool for CurrentTimeTool {
    type Input = CurrentTimeParameters;

    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Returns the current date, time and weekday at a given UTC offset."
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        std::future::ready(current_time(Utc::now(), input.utc_offset_minutes))
    }
}

#[derive(Deserialize, JsonSchema)]
struct DaysUntilParameters {
    #[schemars(description = "The date, formatted as YYYY-MM-DD.")]
    date: String,
}

/// Counts the days left until a date, for trip planning.
struct DaysUntilTool {
    parameter_schema: Value,
}

impl Tool for DaysUntilTool {
    type Input = DaysUntilParameters;

    fn name(&self) -> &str {
        "days_until"
    }

    fn description(&self) -> &str {
        "Returns how many days are left until a date. Past dates give a negative count."
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        std::future::ready(days_until(Utc::now().date_naive(), &input.date))
    }
}

fn current_time(now: DateTime<Utc>, utc_offset_minutes: i32) -> ToolResult {
    let offset = utc_offset_minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| {
            Error::tool_execution()
                .with_reason(format!("`{utc_offset_minutes}` minutes is not a valid offset"))
        })?;
    let local = now.with_timezone(&offset);
    Ok(json!({
        "datetime": local.to_rfc3339(),
        "weekday": local.format("%A").to_string(),
    }))
}

fn days_until(today: NaiveDate, date: &str) -> ToolResult {
    let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").map_err(|err| {
        Error::tool_execution().with_reason(format!("`{date}` is not a YYYY-MM-DD date: {err}"))
    })?;
    Ok(json!({ "days": (date - today).num_days() }))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Stdout carries frames.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let server = ToolServer::new("wayfarer-clock", env!("CARGO_PKG_VERSION"))
        .with_tool(CurrentTimeTool {
            parameter_schema: schema_for!(CurrentTimeParameters).to_value(),
        })
        .with_tool(DaysUntilTool {
            parameter_schema: schema_for!(DaysUntilParameters).to_value(),
        });
    match server.serve_stdio().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
