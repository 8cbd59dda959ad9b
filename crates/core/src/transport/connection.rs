use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::time::Instant;

use super::ServerConfig;
use super::channel::{Channel, PendingReply};
use super::frame::{
    CallToolResult, Implementation, InitializeParams, InitializeResult,
    ListToolsParams, ListToolsResult, METHOD_CALL_TOOL, METHOD_INITIALIZE,
    METHOD_INITIALIZED, METHOD_LIST_TOOLS, PROTOCOL_VERSION, RequestId,
};
use super::process;
use crate::error::{Error, ErrorKind};
use crate::tool::{ToolCallRequest, ToolCallResponse, ToolDescriptor};

const MAX_TOOL_PAGES: usize = 32;

/// The lifecycle of a connection.
///
/// ```text
/// Connecting --handshake ok--> Ready
/// Connecting --handshake failed--> Dead
/// Ready --transport error--> Dead
/// ```
///
/// `Dead` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// The channel is open but the handshake hasn't completed.
    Connecting,
    /// The server accepts tool calls.
    Ready,
    /// The server is gone. Its tools are unavailable.
    Dead,
}

/// A connection to one tool server.
pub struct Connection {
    name: String,
    channel: Channel,
    timeout: Duration,
    state: Mutex<ConnectionState>,
    child: Mutex<Option<Child>>,
    next_request_id: AtomicU64,
}

impl Connection {
    /// Wraps an already established byte stream, e.g. an in-memory pipe.
    pub fn from_io<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        timeout: Duration,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name = name.into();
        let channel = Channel::new(&name, reader, writer);
        Arc::new(Self {
            name,
            channel,
            timeout,
            state: Mutex::new(ConnectionState::Connecting),
            child: Mutex::new(None),
            next_request_id: AtomicU64::new(1),
        })
    }

    /// Launches a tool server process and connects to its stdio.
    ///
    /// `timeout` bounds every request sent on this connection.
    pub fn spawn(config: &ServerConfig, timeout: Duration) -> Result<Arc<Self>, Error> {
        let process = process::spawn(config)?;
        let connection =
            Self::from_io(config.name.clone(), process.stdout, process.stdin, timeout);
        *connection.child.lock() = Some(process.child);
        Ok(connection)
    }

    /// Returns the name of the server.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current state. A broken channel is reported as `Dead`
    /// even before anyone tried to use it.
    pub fn state(&self) -> ConnectionState {
        let mut state = self.state.lock();
        if *state != ConnectionState::Dead && self.channel.broken().is_some() {
            *state = ConnectionState::Dead;
        }
        *state
    }

    /// Performs the protocol handshake, moving the connection to `Ready`.
    pub async fn initialize(&self) -> Result<(), Error> {
        if self.state() != ConnectionState::Connecting {
            return Err(Error::registration()
                .with_reason(format!("`{}` is not connecting", self.name)));
        }
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            capabilities: json!({}),
            client_info: Implementation {
                name: "wayfarer".to_owned(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
            },
        };
        let outcome = async {
            let result = self
                .request(METHOD_INITIALIZE, serde_json::to_value(params).ok())
                .await?;
            let result: InitializeResult =
                serde_json::from_value(result).map_err(|err| {
                    Error::registration()
                        .with_reason(format!("malformed initialize result: {err}"))
                })?;
            self.channel.notify(METHOD_INITIALIZED, None)?;
            Ok::<_, Error>(result)
        }
        .await;

        match outcome {
            Ok(result) => {
                info!(
                    "connected to `{}` ({} {}, protocol {})",
                    self.name,
                    result.server_info.name,
                    result.server_info.version,
                    result.protocol_version
                );
                let mut state = self.state.lock();
                if *state == ConnectionState::Connecting {
                    *state = ConnectionState::Ready;
                }
                Ok(())
            }
            Err(err) => {
                self.shutdown();
                Err(err)
            }
        }
    }

    /// Lists every tool the server advertises, following pagination.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, Error> {
        let mut descriptors = vec![];
        let mut cursor = None;
        for _ in 0..MAX_TOOL_PAGES {
            let params = ListToolsParams { cursor };
            let result = self
                .request(METHOD_LIST_TOOLS, serde_json::to_value(params).ok())
                .await?;
            let page: ListToolsResult =
                serde_json::from_value(result).map_err(|err| {
                    Error::registration()
                        .with_reason(format!("malformed tools/list result: {err}"))
                })?;
            descriptors.extend(page.tools.into_iter().map(|tool| ToolDescriptor {
                name: tool.name,
                description: tool.description.unwrap_or_default(),
                parameter_schema: tool.input_schema,
            }));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(descriptors),
            }
        }
        Err(Error::registration()
            .with_reason(format!("`{}` returned too many tool pages", self.name)))
    }

    /// Submits a tool call and returns a future resolving to its response.
    ///
    /// The call is queued on the channel before this method returns, so
    /// calls dispatched one after another reach the server in that order
    /// even if their futures are polled concurrently.
    pub fn dispatch(
        self: &Arc<Self>,
        request: &ToolCallRequest,
    ) -> impl Future<Output = ToolCallResponse> + Send + use<> {
        let call_id = request.call_id.clone();
        let started = Instant::now();
        let submitted = if self.state() == ConnectionState::Ready {
            let params = json!({
                "name": request.tool_name,
                "arguments": request.arguments,
            });
            self.channel
                .submit(RequestId::String(call_id.clone()), METHOD_CALL_TOOL, Some(params))
        } else {
            Err(Error::transport()
                .with_reason(format!("tool server `{}` is not available", self.name)))
        };
        let connection = Arc::clone(self);

        async move {
            let result = match submitted {
                Ok(pending) => connection.wait_call(pending).await,
                Err(err) => Err(err),
            };
            ToolCallResponse {
                call_id,
                result,
                latency: started.elapsed(),
            }
        }
    }

    /// Calls a tool and waits for the response.
    #[inline]
    pub async fn invoke(self: &Arc<Self>, request: &ToolCallRequest) -> ToolCallResponse {
        self.dispatch(request).await
    }

    /// Stops the server. The connection becomes `Dead`.
    pub fn shutdown(&self) {
        *self.state.lock() = ConnectionState::Dead;
        self.channel
            .close(Error::transport().with_reason(format!("`{}` was shut down", self.name)));
        if let Some(child) = self.child.lock().as_mut() {
            child.start_kill().ok();
        }
    }

    async fn wait_call(&self, pending: PendingReply) -> Result<Value, Error> {
        let value = self.wait(pending).await?;
        let result: CallToolResult = serde_json::from_value(value).map_err(|err| {
            Error::tool_execution().with_reason(format!("malformed tool result: {err}"))
        })?;
        if result.is_error {
            return Err(Error::tool_execution().with_reason(result.text()));
        }
        Ok(result.into_value())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let id = RequestId::String(format!("{}-{id}", self.name));
        let pending = self.channel.submit(id, method, params)?;
        self.wait(pending).await
    }

    async fn wait(&self, pending: PendingReply) -> Result<Value, Error> {
        match tokio::time::timeout(self.timeout, pending.wait()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                if err.kind() == ErrorKind::Transport {
                    warn!("`{}` is now dead: {err}", self.name);
                    *self.state.lock() = ConnectionState::Dead;
                }
                Err(err)
            }
            Err(_) => Err(Error::timeout().with_reason(format!(
                "`{}` did not respond within {:?}",
                self.name, self.timeout
            ))),
        }
    }
}
