//! Framed JSON-RPC transport to tool servers.
//!
//! Each tool server runs as its own process and talks newline-delimited
//! JSON-RPC 2.0 over stdio. A [`Connection`] owns one such channel and
//! tracks whether the server is still usable.

mod channel;
mod connection;
pub(crate) mod frame;
mod process;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use connection::{Connection, ConnectionState};

/// How to launch a tool server.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// A name used in logs and warnings.
    pub name: String,
    /// The executable to run.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory of the process.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl ServerConfig {
    /// Creates a config running `command` without arguments.
    #[inline]
    pub fn new<N: Into<String>, C: Into<String>>(name: N, command: C) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Default::default()
        }
    }

    /// Appends an argument.
    #[inline]
    pub fn with_arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment variable.
    #[inline]
    pub fn with_env<K: Into<String>, V: Into<String>>(
        mut self,
        key: K,
        value: V,
    ) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}
