//! Hosting tools as a tool server.
//!
//! A [`ToolServer`] answers `initialize`, `tools/list` and `tools/call`
//! over the same newline-delimited JSON-RPC channel that
//! [`Connection`](crate::transport::Connection) speaks, so any binary can
//! expose its tools to an agent by calling [`ToolServer::serve_stdio`].

use std::collections::VecDeque;
use std::pin::{Pin, pin};

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines,
};
use tokio::select;

use crate::error::Error;
use crate::transport::frame::{
    CallToolParams, Frame, INVALID_PARAMS, Implementation,
    METHOD_CALL_TOOL, METHOD_INITIALIZE, METHOD_LIST_TOOLS, METHOD_NOT_FOUND,
    METHOD_PING, PARSE_ERROR, PROTOCOL_VERSION, Request, RequestId, Response,
    RpcError,
};

/// The result of a tool call.
pub type ToolResult = Result<Value, Error>;

/// A tool that can be served to agents.
///
/// Implementations of this trait should be stateless, and may not maintain
/// any internal state.
pub trait Tool: Send + Sync + 'static {
    /// The type of input that the tool accepts.
    type Input: DeserializeOwned;

    /// Returns the name of the tool.
    fn name(&self) -> &str;

    /// Returns the description of the tool.
    fn description(&self) -> &str;

    /// Returns the parameter schema of the tool.
    fn parameter_schema(&self) -> &Value;

    /// Executes the tool with the given input.
    ///
    /// This method must return a future that is fully independent of
    /// `self`.
    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static;
}

trait ToolObject: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameter_schema(&self) -> &Value;

    fn execute(
        &self,
        arguments: Value,
    ) -> Pin<Box<dyn Future<Output = ToolResult> + Send>>;
}

struct AnyTool<T: Tool>(T);

impl<T: Tool> ToolObject for AnyTool<T> {
    #[inline]
    fn name(&self) -> &str {
        self.0.name()
    }

    #[inline]
    fn description(&self) -> &str {
        self.0.description()
    }

    #[inline]
    fn parameter_schema(&self) -> &Value {
        self.0.parameter_schema()
    }

    #[inline]
    fn execute(
        &self,
        arguments: Value,
    ) -> Pin<Box<dyn Future<Output = ToolResult> + Send>> {
        let input: T::Input = match serde_json::from_value(arguments) {
            Ok(input) => input,
            Err(err) => {
                let reason = format!("invalid input: {err}");
                return Box::pin(std::future::ready(ToolResult::Err(
                    Error::tool_execution().with_reason(reason),
                )));
            }
        };
        Box::pin(self.0.execute(input))
    }
}

/// Serves a set of tools over a JSON-RPC channel.
///
/// Requests are handled one at a time, in the order they arrive.
pub struct ToolServer {
    info: Implementation,
    tools: Vec<Box<dyn ToolObject>>,
}

impl ToolServer {
    /// Creates a server without tools.
    pub fn new<N: Into<String>, V: Into<String>>(name: N, version: V) -> Self {
        Self {
            info: Implementation {
                name: name.into(),
                version: version.into(),
            },
            tools: vec![],
        }
    }

    /// Adds a tool. A tool with the same name replaces the previous one.
    pub fn with_tool<T: Tool>(mut self, tool: T) -> Self {
        if let Some(index) = self.tools.iter().position(|t| t.name() == tool.name()) {
            warn!("tool `{}` is defined twice, keeping the last one", tool.name());
            self.tools.remove(index);
        }
        self.tools.push(Box::new(AnyTool(tool)));
        self
    }

    /// Serves requests until the reader reaches its end.
    ///
    /// While a request runs, incoming frames are still read: a
    /// `notifications/cancelled` naming it drops the call without a
    /// response, and anything else waits its turn.
    pub async fn serve<R, W>(self, reader: R, mut writer: W) -> Result<(), Error>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        let mut queued = VecDeque::new();
        let mut eof = false;
        loop {
            let line = match queued.pop_front() {
                Some(line) => line,
                None if eof => break,
                None => match next_line(&mut lines).await? {
                    Some(line) => line,
                    None => break,
                },
            };
            if line.trim().is_empty() {
                continue;
            }

            let req = match Frame::parse(&line) {
                Ok(Frame::Request(req)) => req,
                Ok(Frame::Response(_)) => continue,
                Err(err) => {
                    let response =
                        Response::failure(None, RpcError::new(PARSE_ERROR, err.reason()));
                    write_response(&mut writer, response).await?;
                    continue;
                }
            };
            if let Some(id) = req.cancelled_request() {
                debug!("`{}` has nothing running for cancelled request {id}", self.info.name);
                continue;
            }

            let id = req.id.clone();
            let mut handling = pin!(self.handle(req));
            let response = loop {
                select! {
                    biased;
                    response = &mut handling => break response,
                    line = next_line(&mut lines), if !eof => {
                        let Some(line) = line? else {
                            eof = true;
                            continue;
                        };
                        match cancelled_id(&line) {
                            Some(target) if id.as_ref() == Some(&target) => {
                                debug!("`{}` dropped cancelled request {target}", self.info.name);
                                break None;
                            }
                            Some(target) => queued.retain(|queued| {
                                request_id(queued).as_ref() != Some(&target)
                            }),
                            None => queued.push_back(line),
                        }
                    }
                }
            };
            if let Some(response) = response {
                write_response(&mut writer, response).await?;
            }
        }
        debug!("`{}` reached end of input", self.info.name);
        Ok(())
    }

    /// Serves requests over this process's stdin and stdout.
    ///
    /// Stdout then belongs to the channel: diagnostics must go to stderr.
    pub async fn serve_stdio(self) -> Result<(), Error> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    async fn handle(&self, req: Request) -> Option<Response> {
        trace!("`{}` got `{}`", self.info.name, req.method);
        // Notifications never get a response.
        let id = Some(req.id?);
        let outcome = match req.method.as_str() {
            METHOD_INITIALIZE => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": self.info,
            })),
            METHOD_PING => Ok(json!({})),
            METHOD_LIST_TOOLS => Ok(self.list_tools()),
            METHOD_CALL_TOOL => self.call_tool(req.params).await,
            method => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("method `{method}` is not supported"),
            )),
        };
        Some(match outcome {
            Ok(result) => Response::success(id, result),
            Err(error) => Response::failure(id, error),
        })
    }

    fn list_tools(&self) -> Value {
        let tools: Vec<Value> = self
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "inputSchema": tool.parameter_schema(),
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<Value, RpcError> {
        let params: CallToolParams =
            serde_json::from_value(params.unwrap_or_default()).map_err(|err| {
                RpcError::new(INVALID_PARAMS, format!("invalid params: {err}"))
            })?;
        let Some(tool) = self.tools.iter().find(|tool| tool.name() == params.name)
        else {
            return Err(RpcError::new(
                INVALID_PARAMS,
                format!("unknown tool `{}`", params.name),
            ));
        };

        let result = match tool.execute(Value::Object(params.arguments)).await {
            Ok(Value::String(text)) => json!({
                "content": [{ "type": "text", "text": text }],
                "isError": false,
            }),
            Ok(value @ Value::Object(_)) => json!({
                "content": [{ "type": "text", "text": value.to_string() }],
                "structuredContent": value,
                "isError": false,
            }),
            Ok(value) => json!({
                "content": [{ "type": "text", "text": value.to_string() }],
                "isError": false,
            }),
            Err(err) => json!({
                "content": [{ "type": "text", "text": err.reason() }],
                "isError": true,
            }),
        };
        Ok(result)
    }
}

async fn next_line<R: AsyncRead + Unpin>(
    lines: &mut Lines<BufReader<R>>,
) -> Result<Option<String>, Error> {
    lines
        .next_line()
        .await
        .map_err(|err| Error::transport().with_reason(format!("read failed: {err}")))
}

fn cancelled_id(line: &str) -> Option<RequestId> {
    match Frame::parse(line) {
        Ok(Frame::Request(req)) => req.cancelled_request(),
        _ => None,
    }
}

fn request_id(line: &str) -> Option<RequestId> {
    match Frame::parse(line) {
        Ok(Frame::Request(req)) => req.id,
        _ => None,
    }
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: Response,
) -> Result<(), Error> {
    let mut line = Frame::Response(response).to_line();
    line.push('\n');
    let written = async {
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }
    .await;
    written.map_err(|err| Error::transport().with_reason(format!("write failed: {err}")))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use schemars::{JsonSchema, schema_for};
    use serde::Deserialize;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};

    use super::*;

    #[derive(Deserialize, JsonSchema)]
    struct WeatherParameters {
        #[schemars(description = "City to look up.")]
        location: String,
    }

    struct WeatherTool(Value);

    impl Tool for WeatherTool {
        type Input = WeatherParameters;

        fn name(&self) -> &str {
            "get_current_weather"
        }

        fn description(&self) -> &str {
            "Returns the current weather of a city."
        }

        fn parameter_schema(&self) -> &Value {
            &self.0
        }

        fn execute(
            &self,
            input: Self::Input,
        ) -> impl Future<Output = ToolResult> + Send + 'static {
            let result = match input.location.as_str() {
                "Milan" => Ok(json!({
                    "location": "Milan",
                    "forecast": "sunny",
                    "temperature": 24,
                })),
                "Rome" => Ok(json!({
                    "location": "Rome",
                    "forecast": "cloudy",
                    "temperature": 19,
                })),
                other => Err(Error::tool_execution()
                    .with_reason(format!("unknown location `{other}`"))),
            };
            std::future::ready(result)
        }
    }

    #[derive(Deserialize, JsonSchema)]
    struct ActivityParameters {
        forecast: String,
    }

    struct ActivityTool(Value);

    impl Tool for ActivityTool {
        type Input = ActivityParameters;

        fn name(&self) -> &str {
            "suggest_activities"
        }

        fn description(&self) -> &str {
            "Suggests something to do for a given forecast."
        }

        fn parameter_schema(&self) -> &Value {
            &self.0
        }

        fn execute(
            &self,
            input: Self::Input,
        ) -> impl Future<Output = ToolResult> + Send + 'static {
            let suggestion = match input.forecast.as_str() {
                "sunny" => "Walk along the Navigli canals.",
                _ => "Visit a museum.",
            };
            std::future::ready(Ok(Value::String(suggestion.to_owned())))
        }
    }

    #[derive(Deserialize, JsonSchema)]
    struct NapParameters {
        seconds: u64,
    }

    struct NapTool(Value);

    impl Tool for NapTool {
        type Input = NapParameters;

        fn name(&self) -> &str {
            "nap"
        }

        fn description(&self) -> &str {
            "Sleeps for a while."
        }

        fn parameter_schema(&self) -> &Value {
            &self.0
        }

        fn execute(
            &self,
            input: Self::Input,
        ) -> impl Future<Output = ToolResult> + Send + 'static {
            async move {
                tokio::time::sleep(Duration::from_secs(input.seconds)).await;
                Ok(Value::String("rested".to_owned()))
            }
        }
    }

    pub(crate) fn weather_server_named(name: &str) -> ToolServer {
        ToolServer::new(name, "1.0.0")
            .with_tool(WeatherTool(schema_for!(WeatherParameters).to_value()))
            .with_tool(ActivityTool(schema_for!(ActivityParameters).to_value()))
            .with_tool(NapTool(schema_for!(NapParameters).to_value()))
    }

    pub(crate) fn weather_server() -> ToolServer {
        weather_server_named("weather")
    }

    async fn exchange(requests: &[&str]) -> Vec<Value> {
        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let task = tokio::spawn(weather_server().serve(server_read, server_write));

        let (client_read, mut client_write) = tokio::io::split(client);
        for request in requests {
            client_write.write_all(request.as_bytes()).await.unwrap();
            client_write.write_all(b"\n").await.unwrap();
        }
        client_write.shutdown().await.unwrap();
        drop(client_write);

        let mut lines = BufReader::new(client_read).lines();
        let mut responses = vec![];
        while let Some(line) = lines.next_line().await.unwrap() {
            responses.push(serde_json::from_str(&line).unwrap());
        }
        task.await.unwrap().unwrap();
        responses
    }

    #[tokio::test]
    async fn test_initialize_and_list() {
        let responses = exchange(&[
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-06-18"}}"#,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
        ])
        .await;
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["result"]["serverInfo"]["name"], "weather");
        let tools = responses[1]["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 3);
        assert_eq!(tools[0]["name"], "get_current_weather");
        assert_eq!(tools[0]["inputSchema"]["type"], "object");
    }

    #[tokio::test]
    async fn test_call_tool() {
        let responses = exchange(&[
            r#"{"jsonrpc":"2.0","id":"a","method":"tools/call","params":{"name":"suggest_activities","arguments":{"forecast":"sunny"}}}"#,
            r#"{"jsonrpc":"2.0","id":"b","method":"tools/call","params":{"name":"get_current_weather","arguments":{"location":"Atlantis"}}}"#,
            r#"{"jsonrpc":"2.0","id":"c","method":"tools/call","params":{"name":"get_current_weather","arguments":{}}}"#,
            r#"{"jsonrpc":"2.0","id":"d","method":"tools/call","params":{"name":"get_horoscope","arguments":{}}}"#,
        ])
        .await;
        assert_eq!(responses.len(), 4);
        assert_eq!(responses[0]["id"], "a");
        assert_eq!(
            responses[0]["result"]["content"][0]["text"],
            "Walk along the Navigli canals."
        );
        assert_eq!(responses[1]["result"]["isError"], true);
        assert_eq!(responses[2]["result"]["isError"], true);
        assert_eq!(responses[3]["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_bad_lines_keep_server_alive() {
        let responses = exchange(&[
            "this is not json",
            r#"{"jsonrpc":"2.0","id":1,"method":"resources/list"}"#,
            r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
        ])
        .await;
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0]["error"]["code"], PARSE_ERROR);
        assert_eq!(responses[1]["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(responses[2]["result"], json!({}));
    }

    #[tokio::test]
    async fn test_cancelled_call_is_dropped() {
        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        tokio::spawn(weather_server().serve(server_read, server_write));

        let (client_read, mut client_write) = tokio::io::split(client);
        for request in [
            r#"{"jsonrpc":"2.0","id":"a","method":"tools/call","params":{"name":"nap","arguments":{"seconds":3600}}}"#,
            r#"{"jsonrpc":"2.0","id":"b","method":"tools/call","params":{"name":"nap","arguments":{"seconds":3600}}}"#,
            r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":"b"}}"#,
            r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":"a"}}"#,
            r#"{"jsonrpc":"2.0","id":"c","method":"ping"}"#,
        ] {
            client_write.write_all(request.as_bytes()).await.unwrap();
            client_write.write_all(b"\n").await.unwrap();
        }

        let mut lines = BufReader::new(client_read).lines();
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("server is still busy with a cancelled call")
            .unwrap()
            .unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["id"], "c");
        assert_eq!(response["result"], json!({}));
    }
}
