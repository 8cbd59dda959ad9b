#![cfg(feature = "cli")]

use std::time::Duration;

use serde_json::{Map, json};
use wayfarer::core::ErrorKind;
use wayfarer::core::tool::{ToolCallRequest, ToolHub};
use wayfarer::core::transport::ServerConfig;

fn clock_config() -> ServerConfig {
    ServerConfig::new("clock", env!("CARGO_BIN_EXE_wayfarer-clock"))
        .with_env("RUST_LOG", "trace")
}

#[tokio::test]
async fn test_clock_server_over_stdio() {
    let hub = ToolHub::connect(&[clock_config()], Duration::from_secs(10)).await;
    assert!(hub.registration_errors().is_empty());

    let names: Vec<_> = hub.descriptors().into_iter().map(|tool| tool.name).collect();
    assert_eq!(names, ["current_time", "days_until"]);

    let mut arguments = Map::new();
    arguments.insert("date".to_owned(), json!("1970-01-01"));
    let response = hub
        .invoke(&ToolCallRequest::new("days_until", arguments))
        .await;
    let days = response.result.unwrap()["days"].as_i64().unwrap();
    assert!(days < -20_000);

    let mut arguments = Map::new();
    arguments.insert("date".to_owned(), json!("someday"));
    let response = hub
        .invoke(&ToolCallRequest::new("days_until", arguments))
        .await;
    assert_eq!(response.result.unwrap_err().kind(), ErrorKind::ToolExecution);

    hub.shutdown();
}
