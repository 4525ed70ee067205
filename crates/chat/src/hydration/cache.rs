use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

/// Outcome of resolving one attachment reference. Failures are cached too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hydrated {
    Resolved(ResolvedData),
    Unavailable,
}

impl Hydrated {
    pub fn resolved(&self) -> Option<&ResolvedData> {
        match self {
            Self::Resolved(data) => Some(data),
            Self::Unavailable => None,
        }
    }
}

/// Transmittable form of an attachment: an inline data URI and its media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedData {
    pub media_type: String,
    pub data_uri: Arc<str>,
}

type SharedResolution = Shared<BoxFuture<'static, Hydrated>>;

#[derive(Default)]
struct CacheState {
    resolved: HashMap<String, Hydrated>,
    in_flight: HashMap<String, SharedResolution>,
}

/// Process-wide memo of hydrated references.
///
/// Concurrent requests for one key share a single resolution future; the first
/// settled value is stored and served from then on, for every later turn.
#[derive(Default)]
pub struct HydrationCache {
    state: Mutex<CacheState>,
    resolutions_started: AtomicU64,
}

impl HydrationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of underlying resolutions ever started.
    pub fn resolutions_started(&self) -> u64 {
        self.resolutions_started.load(Ordering::Relaxed)
    }

    pub fn cached(&self, key: &str) -> Option<Hydrated> {
        self.lock().resolved.get(key).cloned()
    }

    /// Returns the cached value for `key`, joining or starting its resolution.
    ///
    /// `resolve` runs at most once per key while a resolution is in flight. Dropping
    /// the returned future leaves the shared resolution available to other waiters.
    pub async fn get_or_resolve<F, Fut>(&self, key: &str, resolve: F) -> Hydrated
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Hydrated> + Send + 'static,
    {
        let resolution = {
            let mut state = self.lock();
            if let Some(value) = state.resolved.get(key) {
                tracing::trace!(key = %cache_key_label(key), "hydration cache hit");
                return value.clone();
            }

            if let Some(resolution) = state.in_flight.get(key).cloned() {
                tracing::trace!(key = %cache_key_label(key), "joining in-flight hydration");
                resolution
            } else {
                tracing::debug!(key = %cache_key_label(key), "hydration cache miss");
                self.resolutions_started.fetch_add(1, Ordering::Relaxed);
                let resolution = resolve().boxed().shared();
                state.in_flight.insert(key.to_string(), resolution.clone());
                resolution
            }
        };

        let value = resolution.await;

        let mut state = self.lock();
        state.in_flight.remove(key);
        state
            .resolved
            .entry(key.to_string())
            .or_insert(value)
            .clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Data URIs can be megabytes long; log a bounded prefix.
fn cache_key_label(key: &str) -> &str {
    let end = key
        .char_indices()
        .nth(64)
        .map(|(index, _)| index)
        .unwrap_or(key.len());
    &key[..end]
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    fn resolved(uri: &str) -> Hydrated {
        Hydrated::Resolved(ResolvedData {
            media_type: "image/png".to_string(),
            data_uri: Arc::from(uri),
        })
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_resolution() {
        let cache = Arc::new(HydrationCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let waiters = (0..8).map(|_| {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_resolve("hash-a", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        resolved("data:image/png;base64,AAAA")
                    })
                    .await
            })
        });
        let results = futures::future::join_all(waiters).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.resolutions_started(), 1);
        for result in results {
            assert_eq!(
                result.expect("waiter task completes"),
                resolved("data:image/png;base64,AAAA")
            );
        }
    }

    #[tokio::test]
    async fn failures_are_cached_and_not_retried() {
        let cache = HydrationCache::new();

        let first = cache
            .get_or_resolve("https://cdn.test/missing.png", || async { Hydrated::Unavailable })
            .await;
        let second = cache
            .get_or_resolve("https://cdn.test/missing.png", || async {
                resolved("data:image/png;base64,BBBB")
            })
            .await;

        assert_eq!(first, Hydrated::Unavailable);
        assert_eq!(second, Hydrated::Unavailable);
        assert_eq!(cache.resolutions_started(), 1);
    }

    #[tokio::test]
    async fn distinct_keys_resolve_independently() {
        let cache = HydrationCache::new();

        let (left, right) = tokio::join!(
            cache.get_or_resolve("left", || async { resolved("data:,left") }),
            cache.get_or_resolve("right", || async { resolved("data:,right") }),
        );

        assert_eq!(left, resolved("data:,left"));
        assert_eq!(right, resolved("data:,right"));
        assert_eq!(cache.resolutions_started(), 2);
        assert_eq!(cache.cached("left"), Some(resolved("data:,left")));
    }

    #[tokio::test]
    async fn dropped_waiter_does_not_lose_the_resolution() {
        let cache = Arc::new(HydrationCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&calls);
        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            cache.get_or_resolve("slow", move || async move {
                counted.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                resolved("data:,slow")
            }),
        )
        .await;
        assert!(abandoned.is_err());

        let value = cache
            .get_or_resolve("slow", || async { Hydrated::Unavailable })
            .await;

        assert_eq!(value, resolved("data:,slow"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
