use std::sync::Arc;

mod event;
mod http_transport;
mod normalizer;
mod provider;
mod wire;

pub use event::StreamEvent;
pub use http_transport::{HttpTransport, OPENROUTER_PROVIDER_ID};
pub use normalizer::{
    DONE_SENTINEL, EventNormalizer, NormalizeError, NormalizeResult, StreamEventStream,
    normalize_stream,
};
pub use provider::{
    BoxFuture, ByteStream, CompletionTransport, DEFAULT_ENDPOINT, DEFAULT_MODEL, ProviderConfig,
    ProviderError, ProviderResult,
};
pub use wire::{
    CompletionRequest, ImageUrl, ResponseModality, WireFile, WireMessage, WirePart, WireRole,
};

pub fn create_transport(mut config: ProviderConfig) -> ProviderResult<Arc<dyn CompletionTransport>> {
    if config.provider_id.is_empty() {
        config.provider_id = OPENROUTER_PROVIDER_ID.to_string();
    }
    if config.endpoint.is_empty() {
        config.endpoint = DEFAULT_ENDPOINT.to_string();
    }

    match config.provider_id.as_str() {
        OPENROUTER_PROVIDER_ID | "openai" | "openai-compatible" => {
            Ok(Arc::new(HttpTransport::new(config)?))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-transport",
            provider_id: config.provider_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_provider_id_falls_back_to_openrouter() {
        let transport = create_transport(ProviderConfig::new("", "key", ""))
            .expect("default provider is supported");

        assert_eq!(transport.id(), OPENROUTER_PROVIDER_ID);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let result = create_transport(ProviderConfig::new("carrier-pigeon", "key", ""));

        assert!(matches!(
            result,
            Err(ProviderError::UnsupportedProvider { ref provider_id, .. }) if provider_id == "carrier-pigeon"
        ));
    }
}
