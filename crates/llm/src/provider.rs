use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use snafu::Snafu;
use tokio_util::sync::CancellationToken;

use super::wire::CompletionRequest;

pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";
pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub request_timeout_secs: Option<u64>,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().trim_end_matches('/').to_string(),
            request_timeout_secs: None,
        }
    }

    pub fn with_request_timeout_secs(mut self, seconds: u64) -> Self {
        self.request_timeout_secs = Some(seconds);
        self
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ByteStream = Pin<Box<dyn Stream<Item = ProviderResult<Bytes>> + Send>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("completion request failed on `{stage}`: {source}"))]
    Request {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("completion endpoint returned status {status}: {body_snippet}"))]
    Status {
        stage: &'static str,
        status: u16,
        body_snippet: String,
    },
    #[snafu(display("failed to read completion stream on `{stage}`: {source}"))]
    ReadBody {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("completion endpoint did not answer within {seconds}s"))]
    TimedOut { stage: &'static str, seconds: u64 },
    #[snafu(display("completion request cancelled before the stream opened"))]
    Cancelled { stage: &'static str },
}

/// Opens one streaming completion and hands back the raw response body.
///
/// Framing and event extraction happen in [`crate::normalize_stream`], so a transport
/// only owns connection setup, status handling and body bytes.
pub trait CompletionTransport: Send + Sync {
    fn id(&self) -> &str;
    fn open_stream<'a>(
        &'a self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, ProviderResult<ByteStream>>;
}
