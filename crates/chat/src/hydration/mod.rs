//! Resolves attachment references into inline data URIs.
//!
//! Every failure here is recoverable: it is logged, cached as
//! [`Hydrated::Unavailable`] and the attachment is omitted by the caller.

mod cache;

use std::sync::Arc;
use std::time::Duration;

use chatline_storage::{ContentHash, ContentStore, StorageError};
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;

use crate::media::{
    FALLBACK_MEDIA_TYPE, classify_media_type, data_uri_media_type, encode_data_uri, is_data_uri,
    is_remote_url,
};

pub use cache::{Hydrated, HydrationCache, ResolvedData};

pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_MAX_FETCH_BYTES: u64 = 20 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HydrationOptions {
    pub fetch_timeout_ms: u64,
    pub max_fetch_bytes: u64,
}

impl Default for HydrationOptions {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            max_fetch_bytes: DEFAULT_MAX_FETCH_BYTES,
        }
    }
}

pub type HydrationResult<T> = Result<T, HydrationError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HydrationError {
    #[snafu(display("failed to build hydration http client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("content {hash} is not in the local content store"))]
    ContentMissing {
        stage: &'static str,
        hash: ContentHash,
    },
    #[snafu(display("failed to read content {hash} on `{stage}`: {source}"))]
    ContentLookup {
        stage: &'static str,
        hash: ContentHash,
        source: StorageError,
    },
    #[snafu(display("failed to fetch {url} on `{stage}`: {source}"))]
    Fetch {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("fetching {url} returned status {status}"))]
    FetchStatus {
        stage: &'static str,
        url: String,
        status: u16,
    },
    #[snafu(display("fetching {url} exceeded {timeout_ms}ms"))]
    FetchTimedOut {
        stage: &'static str,
        url: String,
        timeout_ms: u64,
    },
    #[snafu(display("{url} is larger than the {limit} byte hydration cap"))]
    Oversize {
        stage: &'static str,
        url: String,
        limit: u64,
    },
}

/// Dereferences content hashes, remote URLs and data URIs through the shared cache.
pub struct Hydrator {
    cache: Arc<HydrationCache>,
    content: Arc<dyn ContentStore>,
    client: reqwest::Client,
    options: HydrationOptions,
}

impl Hydrator {
    pub fn new(
        cache: Arc<HydrationCache>,
        content: Arc<dyn ContentStore>,
        options: HydrationOptions,
    ) -> HydrationResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context(BuildClientSnafu {
                stage: "hydrator-build-client",
            })?;

        Ok(Self {
            cache,
            content,
            client,
            options,
        })
    }

    pub fn cache(&self) -> &Arc<HydrationCache> {
        &self.cache
    }

    /// Resolves `reference` or reports it unavailable.
    ///
    /// A data URI passes through untouched. Content hashes are re-encoded with the
    /// stored media type; http(s) URLs are downloaded under the configured timeout
    /// and size cap. Anything else is a local-only reference and never resolves.
    pub async fn hydrate(&self, reference: &str, cancel: &CancellationToken) -> Hydrated {
        let reference = reference.trim();

        if is_data_uri(reference) {
            return match data_uri_media_type(reference) {
                Some(media_type) => Hydrated::Resolved(ResolvedData {
                    media_type,
                    data_uri: Arc::from(reference),
                }),
                None => Hydrated::Unavailable,
            };
        }

        let source = if let Ok(hash) = ContentHash::parse(reference) {
            ReferenceSource::Stored(hash)
        } else if is_remote_url(reference) {
            ReferenceSource::Remote(reference.to_string())
        } else {
            tracing::debug!(reference, "local-only reference cannot be hydrated");
            return Hydrated::Unavailable;
        };

        let key = source.cache_key();
        let content = Arc::clone(&self.content);
        let client = self.client.clone();
        let options = self.options.clone();
        let resolution = self.cache.get_or_resolve(&key, move || async move {
            let result = match source {
                ReferenceSource::Stored(hash) => resolve_stored(content, hash).await,
                ReferenceSource::Remote(url) => resolve_remote(client, url, options).await,
            };
            settle(result)
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Hydrated::Unavailable,
            hydrated = resolution => hydrated,
        }
    }
}

enum ReferenceSource {
    Stored(ContentHash),
    Remote(String),
}

impl ReferenceSource {
    fn cache_key(&self) -> String {
        match self {
            Self::Stored(hash) => hash.to_string(),
            Self::Remote(url) => url.clone(),
        }
    }
}

fn settle(result: HydrationResult<ResolvedData>) -> Hydrated {
    match result {
        Ok(data) => Hydrated::Resolved(data),
        Err(error) => {
            tracing::warn!(error = %error, "attachment hydration failed; omitting attachment");
            Hydrated::Unavailable
        }
    }
}

async fn resolve_stored(
    content: Arc<dyn ContentStore>,
    hash: ContentHash,
) -> HydrationResult<ResolvedData> {
    let metadata = content
        .content_metadata(&hash)
        .await
        .context(ContentLookupSnafu {
            stage: "hydrate-content-metadata",
            hash: hash.clone(),
        })?;
    let Some(metadata) = metadata else {
        return ContentMissingSnafu {
            stage: "hydrate-content-metadata",
            hash,
        }
        .fail();
    };

    let blob = content
        .content_blob(&hash)
        .await
        .context(ContentLookupSnafu {
            stage: "hydrate-content-blob",
            hash: hash.clone(),
        })?;
    let Some(blob) = blob else {
        return ContentMissingSnafu {
            stage: "hydrate-content-blob",
            hash,
        }
        .fail();
    };

    Ok(ResolvedData {
        data_uri: Arc::from(encode_data_uri(&metadata.media_type, &blob)),
        media_type: metadata.media_type,
    })
}

async fn resolve_remote(
    client: reqwest::Client,
    url: String,
    options: HydrationOptions,
) -> HydrationResult<ResolvedData> {
    let timeout = Duration::from_millis(options.fetch_timeout_ms);
    match tokio::time::timeout(timeout, fetch_remote(&client, &url, options.max_fetch_bytes)).await
    {
        Ok(result) => result,
        Err(_) => FetchTimedOutSnafu {
            stage: "hydrate-remote-timeout",
            url,
            timeout_ms: options.fetch_timeout_ms,
        }
        .fail(),
    }
}

async fn fetch_remote(
    client: &reqwest::Client,
    url: &str,
    max_bytes: u64,
) -> HydrationResult<ResolvedData> {
    let response = client.get(url).send().await.context(FetchSnafu {
        stage: "hydrate-remote-send",
        url,
    })?;

    let status = response.status();
    if !status.is_success() {
        return FetchStatusSnafu {
            stage: "hydrate-remote-status",
            url,
            status: status.as_u16(),
        }
        .fail();
    }

    if let Some(length) = response.content_length()
        && length > max_bytes
    {
        return OversizeSnafu {
            stage: "hydrate-remote-content-length",
            url,
            limit: max_bytes,
        }
        .fail();
    }

    let media_type = response_media_type(&response, url);
    let mut body = response.bytes_stream();
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context(FetchSnafu {
            stage: "hydrate-remote-read",
            url,
        })?;
        if (bytes.len() + chunk.len()) as u64 > max_bytes {
            return OversizeSnafu {
                stage: "hydrate-remote-read",
                url,
                limit: max_bytes,
            }
            .fail();
        }
        bytes.extend_from_slice(&chunk);
    }

    tracing::debug!(url, size_bytes = bytes.len(), %media_type, "hydrated remote attachment");
    Ok(ResolvedData {
        data_uri: Arc::from(encode_data_uri(&media_type, &bytes)),
        media_type,
    })
}

// Generic octet-stream headers carry no information, so the URL guess wins there.
fn response_media_type(response: &reqwest::Response, url: &str) -> String {
    let declared = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty() && value != FALLBACK_MEDIA_TYPE);

    declared
        .or_else(|| classify_media_type(url).map(str::to_string))
        .unwrap_or_else(|| FALLBACK_MEDIA_TYPE.to_string())
}
