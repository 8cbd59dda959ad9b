//! A model provider for OpenAI-compatible APIs (OpenAI, Groq, local
//! gateways).
//!
//! Requests stream chat completions over server-sent events. Failures to
//! establish a stream are classified so that the caller can tell what is
//! worth retrying: rate limits and unreachable or failing endpoints are
//! transient, everything else is not.

#[macro_use]
extern crate tracing;

mod config;
mod io;
mod proto;
mod response;

use std::error::Error as StdError;
use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use mime::Mime;
use reqwest::{Client, Response, StatusCode, header};
use serde::Deserialize;
use wayfarer_model::{
    ErrorKind, ModelProvider, ModelProviderError, ModelRequest,
};

pub use config::{OpenAIConfig, OpenAIConfigBuilder};
use io::{Chunks, Sse};
use response::OpenAIResponse;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for [`OpenAIProvider`].
#[derive(Debug)]
pub struct Error {
    message: String,
    kind: ErrorKind,
}

impl Error {
    fn new(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    /// Returns the error message.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl StdError for Error {}

impl ModelProviderError for Error {
    #[inline]
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

/// OpenAI-compatible model provider.
#[derive(Clone, Debug)]
pub struct OpenAIProvider {
    client: Client,
    config: Arc<OpenAIConfig>,
}

impl OpenAIProvider {
    /// Creates a new `OpenAIProvider` with the given configuration.
    pub fn new(config: OpenAIConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|err| {
                warn!("cannot configure the HTTP client, using defaults: {err}");
                Client::new()
            });
        Self {
            client,
            config: Arc::new(config),
        }
    }

    #[inline]
    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url)
    }
}

impl ModelProvider for OpenAIProvider {
    type Error = Error;
    type Response = OpenAIResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        let openai_req = proto::create_request(req, &self.config);
        let resp_fut = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .header(header::ACCEPT, "text/event-stream")
            .json(&openai_req)
            .send();

        async move {
            let resp = resp_fut.await.map_err(|err| {
                let kind = if err.is_connect() || err.is_timeout() {
                    ErrorKind::Unavailable
                } else {
                    ErrorKind::Other
                };
                Error::new(format!("cannot reach the model: {err}"), kind)
            })?;
            let resp = check_status(resp).await?;

            let content_type = resp
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok());
            let is_event_stream = content_type
                .and_then(|v| v.parse().ok())
                .is_some_and(|m: Mime| {
                    m.type_() == mime::TEXT && m.subtype() == "event-stream"
                });
            if !is_event_stream {
                return Err(Error::new(
                    format!("unexpected content type: {content_type:?}"),
                    ErrorKind::Other,
                ));
            }

            debug!("streaming chat completion");
            let sse = Sse::new(Chunks::from_response(resp));
            Ok(OpenAIResponse::from_sse(sse))
        }
    }
}

async fn check_status(resp: Response) -> Result<Response, Error> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let (message, code) = match serde_json::from_str::<ApiErrorBody>(&body) {
        Ok(ApiErrorBody { error }) => (error.message, error.code),
        Err(_) => (body, None),
    };
    let kind = classify(status, code.as_deref());
    Err(Error::new(
        format!("model endpoint answered {status}: {}", message.trim()),
        kind,
    ))
}

fn classify(status: StatusCode, code: Option<&str>) -> ErrorKind {
    if matches!(code, Some("content_filter" | "content_policy_violation")) {
        return ErrorKind::Moderated;
    }
    match status {
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimitExceeded,
        StatusCode::REQUEST_TIMEOUT => ErrorKind::Unavailable,
        status if status.is_server_error() => ErrorKind::Unavailable,
        _ => ErrorKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, Some("rate_limit_exceeded")),
            ErrorKind::RateLimitExceeded
        );
        assert_eq!(classify(StatusCode::BAD_GATEWAY, None), ErrorKind::Unavailable);
        assert_eq!(classify(StatusCode::REQUEST_TIMEOUT, None), ErrorKind::Unavailable);
        assert_eq!(
            classify(StatusCode::BAD_REQUEST, Some("content_policy_violation")),
            ErrorKind::Moderated
        );
        assert_eq!(classify(StatusCode::UNAUTHORIZED, None), ErrorKind::Other);
        assert!(!classify(StatusCode::NOT_FOUND, None).is_transient());
    }

    #[test]
    fn test_endpoint() {
        let provider = OpenAIProvider::new(
            OpenAIConfigBuilder::with_api_key("key")
                .with_base_url("http://localhost:8080/v1/")
                .build(),
        );
        assert_eq!(provider.endpoint(), "http://localhost:8080/v1/chat/completions");
    }
}
