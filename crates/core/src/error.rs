//! The error taxonomy shared by the reasoning loop, the tool registry and
//! the transport. Every failure a turn can observe is one [`ErrorKind`].

use std::borrow::Cow;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// The kind of error that occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A tool server could not be registered: duplicate tool names,
    /// unusable schemas, or a failed handshake.
    Registration,
    /// The channel to a tool server broke: process exit, closed pipe or
    /// a frame that violates the wire protocol.
    Transport,
    /// A tool call received no response within its deadline.
    Timeout,
    /// A tool server reported that the call failed.
    ToolExecution,
    /// The model asked for a tool that isn't registered.
    UnknownTool,
    /// The model's output could not be turned into a valid tool call.
    Parse,
    /// The language model could not be reached or refused the request.
    Model,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Registration => write!(f, "Registration error"),
            ErrorKind::Transport => write!(f, "Transport error"),
            ErrorKind::Timeout => write!(f, "Timeout"),
            ErrorKind::ToolExecution => write!(f, "Tool execution error"),
            ErrorKind::UnknownTool => write!(f, "Unknown tool"),
            ErrorKind::Parse => write!(f, "Parse error"),
            ErrorKind::Model => write!(f, "Model error"),
        }
    }
}

/// An error raised anywhere between the reasoning loop and tool servers.
///
/// Errors are plain values: they are recorded in traces, shown to the
/// model as observations and compared in tests.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Error {
    kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<i64>,
}

impl Error {
    #[inline]
    fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            reason: None,
            code: None,
        }
    }

    /// Creates a new error with the `Registration` kind.
    #[inline]
    pub fn registration() -> Self {
        Self::new(ErrorKind::Registration)
    }

    /// Creates a new error with the `Transport` kind.
    #[inline]
    pub fn transport() -> Self {
        Self::new(ErrorKind::Transport)
    }

    /// Creates a new error with the `Timeout` kind.
    #[inline]
    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout)
    }

    /// Creates a new error with the `ToolExecution` kind.
    #[inline]
    pub fn tool_execution() -> Self {
        Self::new(ErrorKind::ToolExecution)
    }

    /// Creates a new error with the `UnknownTool` kind.
    #[inline]
    pub fn unknown_tool() -> Self {
        Self::new(ErrorKind::UnknownTool)
    }

    /// Creates a new error with the `Parse` kind.
    #[inline]
    pub fn parse() -> Self {
        Self::new(ErrorKind::Parse)
    }

    /// Creates a new error with the `Model` kind.
    #[inline]
    pub fn model() -> Self {
        Self::new(ErrorKind::Model)
    }

    /// Attaches a reason to the error.
    #[inline]
    pub fn with_reason<S: Into<String>>(self, reason: S) -> Self {
        Self {
            reason: Some(reason.into()),
            ..self
        }
    }

    /// Attaches a numeric code, usually the JSON-RPC error code reported
    /// by a tool server.
    #[inline]
    pub fn with_code(self, code: i64) -> Self {
        Self {
            code: Some(code),
            ..self
        }
    }

    /// Returns the kind of this error.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the numeric code, if any.
    #[inline]
    pub fn code(&self) -> Option<i64> {
        self.code
    }

    /// Returns the reason for the error.
    #[inline]
    pub fn reason(&self) -> Cow<'_, str> {
        match self.reason.as_deref() {
            Some(reason) => Cow::Borrowed(reason),
            None => Cow::Owned(format!("{}", self.kind)),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.reason, self.code) {
            (Some(reason), Some(code)) => {
                write!(f, "{}: {reason} (code {code})", self.kind)
            }
            (Some(reason), None) => write!(f, "{}: {reason}", self.kind),
            (None, Some(code)) => write!(f, "{} (code {code})", self.kind),
            (None, None) => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {}
