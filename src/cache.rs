use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache as MokaCache;

use crate::api::models::{AlbumMeta, TrackCredits};
use crate::error::Flaw;

/// A keyed TTL cache with single-flight semantics: concurrent misses for the
/// same key invoke the loader exactly once and share its result. Backed by
/// `moka`, whose `get_with`/`try_get_with` already implement this contract.
#[derive(Clone)]
pub struct Cache<K, V>
where
    K: std::hash::Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: MokaCache<K, V>,
}

impl<K, V> Cache<K, V>
where
    K: std::hash::Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        Cache {
            inner: MokaCache::builder()
                .time_to_live(ttl)
                .max_capacity(max_capacity)
                .build(),
        }
    }

    /// Returns the cached value for `key`, invoking `loader` at most once
    /// across all concurrent callers on a miss. A failed load leaves the
    /// slot empty so the next call retries.
    pub async fn fetch<F, Fut>(&self, key: K, loader: F) -> Result<V, Flaw>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, Flaw>>,
    {
        self.inner
            .try_get_with(key, loader())
            .await
            .map_err(|e: Arc<Flaw>| match Arc::try_unwrap(e) {
                Ok(flaw) => flaw,
                Err(shared) => Flaw::structured(shared.to_string(), anyhow::anyhow!("{shared}")),
            })
    }

    pub async fn set(&self, key: K, value: V) {
        self.inner.insert(key, value).await;
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).await
    }
}

/// The four named cache instances the download/upload pipeline shares.
pub struct Caches {
    pub albums_meta: Cache<i64, Arc<AlbumMeta>>,
    pub downloaded_covers: Cache<String, Arc<Vec<u8>>>,
    pub track_credits: Cache<i64, Arc<TrackCredits>>,
    pub uploaded_covers: Cache<String, String>,
}

impl Caches {
    pub fn new() -> Self {
        Caches {
            albums_meta: Cache::new(Duration::from_secs(3600), 10_000),
            downloaded_covers: Cache::new(Duration::from_secs(3600), 2_000),
            track_credits: Cache::new(Duration::from_secs(3600), 20_000),
            uploaded_covers: Cache::new(Duration::from_secs(3600), 2_000),
        }
    }
}

impl Default for Caches {
    fn default() -> Self {
        Caches::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_misses_invoke_loader_once() {
        let cache: Cache<i64, Arc<String>> = Cache::new(Duration::from_secs(60), 100);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .fetch(1, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(Arc::new("value".to_string()))
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_does_not_populate_slot() {
        let cache: Cache<i64, Arc<String>> = Cache::new(Duration::from_secs(60), 100);
        let first = cache
            .fetch(1, || async move { Err(Flaw::TooManyRequests) })
            .await;
        assert!(first.is_err());

        let second = cache
            .fetch(1, || async move { Ok(Arc::new("value".to_string())) })
            .await
            .unwrap();
        assert_eq!(*second, "value");
    }
}
