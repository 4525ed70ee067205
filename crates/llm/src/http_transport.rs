use std::time::Duration;

use futures::StreamExt;
use reqwest::header::ACCEPT;
use snafu::{ResultExt, ensure};
use tokio_util::sync::CancellationToken;

use super::provider::{
    BoxFuture, BuildClientSnafu, ByteStream, CancelledSnafu, CompletionTransport,
    MissingApiKeySnafu, ProviderConfig, ProviderError, ProviderResult, ReadBodySnafu,
    RequestSnafu, StatusSnafu,
};
use super::wire::CompletionRequest;

pub const OPENROUTER_PROVIDER_ID: &str = "openrouter";
const STATUS_BODY_SNIPPET_CHARS: usize = 512;

/// OpenAI-compatible `/chat/completions` streaming client.
pub struct HttpTransport {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "http-transport-new",
                provider_id: config.provider_id.clone(),
            }
        );

        let client = reqwest::Client::builder()
            .build()
            .context(BuildClientSnafu {
                stage: "http-transport-build-client",
            })?;

        Ok(Self { config, client })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.endpoint)
    }

    async fn send_request(&self, request: &CompletionRequest) -> ProviderResult<ByteStream> {
        let pending = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.config.api_key)
            .header(ACCEPT, "text/event-stream")
            .json(request)
            .send();

        // The timeout bounds the wait for response headers, never the stream itself.
        let response = match self.config.request_timeout_secs {
            Some(seconds) => tokio::time::timeout(Duration::from_secs(seconds), pending)
                .await
                .map_err(|_| ProviderError::TimedOut {
                    stage: "http-transport-await-headers",
                    seconds,
                })?,
            None => pending.await,
        }
        .context(RequestSnafu {
            stage: "http-transport-send",
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                provider_id = %self.config.provider_id,
                model_id = %request.model,
                status = status.as_u16(),
                "completion endpoint rejected the request"
            );
            return StatusSnafu {
                stage: "http-transport-status",
                status: status.as_u16(),
                body_snippet: body_snippet(&body),
            }
            .fail();
        }

        let body = response.bytes_stream().map(|chunk| {
            chunk.context(ReadBodySnafu {
                stage: "http-transport-read-body",
            })
        });
        Ok(Box::pin(body))
    }
}

impl CompletionTransport for HttpTransport {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn open_stream<'a>(
        &'a self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, ProviderResult<ByteStream>> {
        Box::pin(async move {
            tracing::debug!(
                provider_id = %self.config.provider_id,
                model_id = %request.model,
                message_count = request.messages.len(),
                "opening completion stream"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => CancelledSnafu {
                    stage: "http-transport-open",
                }
                .fail(),
                opened = self.send_request(&request) => opened,
            }
        })
    }
}

fn body_snippet(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(STATUS_BODY_SNIPPET_CHARS) {
        Some((cut, _)) => body[..cut].to_string(),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::{StreamEvent, WireMessage, WirePart, WireRole, normalize_stream};

    fn transport(server: &MockServer) -> HttpTransport {
        HttpTransport::new(ProviderConfig::new(
            OPENROUTER_PROVIDER_ID,
            "test-key",
            format!("{}/", server.uri()),
        ))
        .expect("api key is present")
    }

    fn request() -> CompletionRequest {
        CompletionRequest::streaming(
            "test-model",
            vec![WireMessage::new(WireRole::User, vec![WirePart::text("hi")])],
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn streams_body_from_chat_completions_endpoint() {
        let server = MockServer::start().await;
        let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"hello\"}}]}\n\ndata: [DONE]\n\n";
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport(&server);
        let cancel = CancellationToken::new();
        let body = transport
            .open_stream(request(), cancel.clone())
            .await
            .expect("stream opens");
        let events = normalize_stream(body, cancel)
            .map(|event| event.expect("no stream error"))
            .collect::<Vec<_>>()
            .await;

        assert_eq!(
            events,
            vec![StreamEvent::Text("hello".to_string()), StreamEvent::Done]
        );

        let received = server.received_requests().await.expect("recording enabled");
        let payload: serde_json::Value =
            serde_json::from_slice(&received[0].body).expect("json request body");
        assert_eq!(payload["model"], "test-model");
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["messages"][0]["content"][0]["text"], "hi");
    }

    #[tokio::test]
    async fn non_success_status_keeps_truncated_body() {
        let server = MockServer::start().await;
        let body = "é".repeat(STATUS_BODY_SNIPPET_CHARS + 100);
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string(body))
            .mount(&server)
            .await;

        let transport = transport(&server);
        let result = transport
            .open_stream(request(), CancellationToken::new())
            .await;

        match result {
            Err(ProviderError::Status {
                status,
                body_snippet,
                ..
            }) => {
                assert_eq!(status, 429);
                assert_eq!(body_snippet.chars().count(), STATUS_BODY_SNIPPET_CHARS);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected a status error"),
        }
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_open() {
        let server = MockServer::start().await;
        let transport = transport(&server);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = transport.open_stream(request(), cancel).await;

        assert!(matches!(result, Err(ProviderError::Cancelled { .. })));
    }

    #[test]
    fn missing_api_key_is_rejected() {
        let result = HttpTransport::new(ProviderConfig::new(
            OPENROUTER_PROVIDER_ID,
            "  ",
            "http://localhost",
        ));

        assert!(matches!(result, Err(ProviderError::MissingApiKey { .. })));
    }
}
