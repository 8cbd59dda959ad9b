//! The TOML configuration file.
//!
//! ```toml
//! system_prompt = "You are a travel assistant."
//!
//! [policy]
//! max_iterations = 6
//! parse_retries = 1
//! tool_timeout_secs = 30
//!
//! [[servers]]
//! name = "weather"
//! command = "python"
//! args = ["weather_server.py"]
//! env = { WEATHERAPI_KEY = "..." }
//! ```

use std::fmt::{self, Display};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wayfarer_core::TurnPolicy;
use wayfarer_core::transport::ServerConfig;

/// The kind of a configuration error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The file could not be read.
    Io,
    /// The file is not a valid configuration.
    Invalid,
}

/// A configuration error.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    reason: String,
}

impl Error {
    /// Returns the error kind.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::Io => write!(f, "cannot read config: {}", self.reason),
            ErrorKind::Invalid => write!(f, "invalid config: {}", self.reason),
        }
    }
}

impl std::error::Error for Error {}

/// Limits of the reasoning loop and of tool calls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Model requests allowed per user message.
    pub max_iterations: usize,
    /// Corrective re-prompts after malformed tool calls.
    pub parse_retries: usize,
    /// Corrective rounds after the model asked only for unknown tools.
    pub unknown_tool_retries: usize,
    /// Deadline of a single tool call.
    pub tool_timeout_secs: u64,
    /// How long rate-limited model requests are retried.
    pub model_retry_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let policy = TurnPolicy::default();
        Self {
            max_iterations: policy.max_iterations,
            parse_retries: policy.parse_retries,
            unknown_tool_retries: policy.unknown_tool_retries,
            tool_timeout_secs: 30,
            model_retry_secs: policy.model_retry_window.as_secs(),
        }
    }
}

/// The whole configuration file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Overrides the built-in system prompt.
    pub system_prompt: Option<String>,
    /// Loop limits.
    pub policy: PolicyConfig,
    /// Tool servers to launch, in registration order.
    pub servers: Vec<ServerConfig>,
}

impl Config {
    /// Reads a configuration file.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|err| Error {
            kind: ErrorKind::Io,
            reason: format!("{}: {err}", path.display()),
        })?;
        content.parse()
    }

    /// Returns the loop limits as a [`TurnPolicy`].
    pub fn turn_policy(&self) -> TurnPolicy {
        TurnPolicy {
            max_iterations: self.policy.max_iterations,
            parse_retries: self.policy.parse_retries,
            unknown_tool_retries: self.policy.unknown_tool_retries,
            model_retry_window: Duration::from_secs(self.policy.model_retry_secs),
        }
    }

    /// Returns the deadline of a single tool call.
    #[inline]
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.policy.tool_timeout_secs)
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s).map_err(|err| Error {
            kind: ErrorKind::Invalid,
            reason: err.to_string(),
        })?;

        if config.policy.max_iterations == 0 {
            return Err(Error {
                kind: ErrorKind::Invalid,
                reason: "`policy.max_iterations` must be at least 1".to_owned(),
            });
        }
        if config.policy.tool_timeout_secs == 0 {
            return Err(Error {
                kind: ErrorKind::Invalid,
                reason: "`policy.tool_timeout_secs` must be at least 1".to_owned(),
            });
        }
        for (index, server) in config.servers.iter().enumerate() {
            if server.name.is_empty() || server.command.is_empty() {
                return Err(Error {
                    kind: ErrorKind::Invalid,
                    reason: format!("server #{} needs a `name` and a `command`", index + 1),
                });
            }
            if config.servers[..index].iter().any(|other| other.name == server.name) {
                return Err(Error {
                    kind: ErrorKind::Invalid,
                    reason: format!("server `{}` is defined twice", server.name),
                });
            }
        }

        Ok(config)
    }
}
