use std::future::ready;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use super::{Registry, RegistryBuilder, ToolCallRequest, ToolCallResponse, ToolDescriptor};
use crate::error::Error;
use crate::transport::{Connection, ConnectionState, ServerConfig};

/// A future resolving to a tool call response, independent of the hub.
pub type PendingCall = Pin<Box<dyn Future<Output = ToolCallResponse> + Send>>;

/// Owns the connections to all tool servers and routes calls to them.
#[derive(Default)]
pub struct ToolHub {
    registry: Registry,
    connections: Vec<Arc<Connection>>,
    registration_errors: Vec<Error>,
}

impl ToolHub {
    /// Creates a hub builder.
    #[inline]
    pub fn builder() -> ToolHubBuilder {
        ToolHubBuilder::default()
    }

    /// Launches and registers every configured server.
    ///
    /// A server that fails to start, to complete the handshake or to
    /// register is skipped; its error is kept in
    /// [`ToolHub::registration_errors`] and the rest keep working.
    pub async fn connect(configs: &[ServerConfig], timeout: Duration) -> Self {
        let mut builder = Self::builder();
        for config in configs {
            match Connection::spawn(config, timeout) {
                Ok(connection) => {
                    builder.add_connection(connection).await.ok();
                }
                Err(err) => {
                    warn!("cannot start `{}`: {err}", config.name);
                    builder.registration_errors.push(err);
                }
            }
        }
        builder.build()
    }

    /// Returns the tool registry.
    #[inline]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Returns the descriptors of all usable tools.
    #[inline]
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.registry.descriptors()
    }

    /// Returns why servers were skipped during startup.
    #[inline]
    pub fn registration_errors(&self) -> &[Error] {
        &self.registration_errors
    }

    /// Returns all connections, including dead ones.
    #[inline]
    pub fn connections(&self) -> &[Arc<Connection>] {
        &self.connections
    }

    /// Sends a tool call and returns a future of its response.
    ///
    /// The request is on its way when this returns; see
    /// [`Connection::dispatch`].
    pub fn dispatch(&self, request: &ToolCallRequest) -> PendingCall {
        match self.registry.connection(&request.tool_name) {
            Ok(connection) => Box::pin(connection.dispatch(request)),
            Err(err) => Box::pin(ready(ToolCallResponse {
                call_id: request.call_id.clone(),
                result: Err(err),
                latency: Duration::ZERO,
            })),
        }
    }

    /// Calls a tool and waits for the response.
    #[inline]
    pub async fn invoke(&self, request: &ToolCallRequest) -> ToolCallResponse {
        self.dispatch(request).await
    }

    /// Stops every server.
    pub fn shutdown(&self) {
        for connection in &self.connections {
            if connection.state() != ConnectionState::Dead {
                connection.shutdown();
            }
        }
    }
}

impl Drop for ToolHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// [`ToolHub`] builder.
#[derive(Default)]
pub struct ToolHubBuilder {
    registry: RegistryBuilder,
    connections: Vec<Arc<Connection>>,
    registration_errors: Vec<Error>,
}

impl ToolHubBuilder {
    /// Completes the handshake of `connection` if needed and registers
    /// its tools. On failure the connection is shut down, and the error
    /// is both returned and kept for [`ToolHub::registration_errors`].
    pub async fn add_connection(
        &mut self,
        connection: Arc<Connection>,
    ) -> Result<Vec<ToolDescriptor>, Error> {
        let outcome = async {
            if connection.state() == ConnectionState::Connecting {
                connection.initialize().await.map_err(|err| {
                    Error::registration().with_reason(format!(
                        "handshake with `{}` failed: {}",
                        connection.name(),
                        err.reason()
                    ))
                })?;
            }
            self.registry.register(&connection).await
        }
        .await;

        match outcome {
            Ok(descriptors) => {
                info!(
                    "`{}` provides {} tool(s)",
                    connection.name(),
                    descriptors.len()
                );
                self.connections.push(connection);
                Ok(descriptors)
            }
            Err(err) => {
                warn!("skipping `{}`: {err}", connection.name());
                connection.shutdown();
                self.registration_errors.push(err.clone());
                Err(err)
            }
        }
    }

    /// Builds the hub.
    #[inline]
    pub fn build(self) -> ToolHub {
        ToolHub {
            registry: self.registry.build(),
            connections: self.connections,
            registration_errors: self.registration_errors,
        }
    }
}
