//! The per-table query-result cache.
//!
//! A size- and age-bounded cache keyed by the canonicalized query shape plus bound values.  There is no write
//! tracking: invalidation is implicit in the identity of the key plus the entry's age.  Duplicate concurrent loads
//! for the same key are tolerated rather than deduplicated; whichever finishes last wins the slot.
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::*;
use lru::LruCache;

use crate::errors::{DatastoreError, Result};

/// Cache bounds.  Defaults to 1000 entries with a one-hour time-to-live.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub size: usize,
    pub max_age: Duration,
}

impl Default for CacheOptions {
    fn default() -> CacheOptions {
        CacheOptions {
            size: 1000,
            max_age: Duration::from_secs(60 * 60),
        }
    }
}

struct Entry<V> {
    value: V,
    created: Instant,
}

struct Inner<V> {
    entries: LruCache<String, Entry<V>>,
    closed: bool,
}

/// A closable LRU cache with lazy time-based expiry.
pub struct QueryCache<V> {
    max_age: Duration,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> QueryCache<V> {
    pub fn new(options: CacheOptions) -> QueryCache<V> {
        let size = NonZeroUsize::new(options.size).unwrap_or(NonZeroUsize::MIN);
        QueryCache {
            max_age: options.max_age,
            inner: Mutex::new(Inner {
                entries: LruCache::new(size),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the cached value for `key` if present and unexpired; otherwise run `loader`, store its result and
    /// return it.  Fails with `CacheClosed` once the cache has been closed.
    pub async fn dynamic_get<F, Fut>(&self, key: &str, loader: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(DatastoreError::CacheClosed);
            }
            if let Some(entry) = inner.entries.get(key) {
                if entry.created.elapsed() < self.max_age {
                    trace!("cache hit for {}", key);
                    return Ok(entry.value.clone());
                }
                inner.entries.pop(key);
            }
        }

        trace!("cache miss for {}", key);
        let value = loader().await?;

        let mut inner = self.lock();
        // A close can race the load; the loaded value is still good, it just doesn't get stored.
        if !inner.closed {
            inner.entries.put(
                key.to_string(),
                Entry {
                    value: value.clone(),
                    created: Instant::now(),
                },
            );
        }
        Ok(value)
    }

    /// Release all entries.  Subsequent `dynamic_get` calls fail with `CacheClosed`.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.entries.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting_loader(counter: &AtomicUsize, value: u32) -> impl Future<Output = Result<u32>> + '_ {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok(value) }
    }

    #[tokio::test]
    async fn second_get_skips_the_loader() {
        let cache = QueryCache::new(CacheOptions::default());
        let loads = AtomicUsize::new(0);

        let a = cache.dynamic_get("k", || counting_loader(&loads, 7)).await.unwrap();
        let b = cache.dynamic_get("k", || counting_loader(&loads, 8)).await.unwrap();
        assert_eq!((a, b), (7, 7));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entries_reload() {
        let cache = QueryCache::new(CacheOptions {
            size: 10,
            max_age: Duration::from_millis(0),
        });
        let loads = AtomicUsize::new(0);

        cache.dynamic_get("k", || counting_loader(&loads, 1)).await.unwrap();
        let second = cache.dynamic_get("k", || counting_loader(&loads, 2)).await.unwrap();
        assert_eq!(second, 2);
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn size_bound_evicts_least_recently_used() {
        let cache = QueryCache::new(CacheOptions {
            size: 1,
            max_age: Duration::from_secs(60),
        });
        let loads = AtomicUsize::new(0);

        cache.dynamic_get("a", || counting_loader(&loads, 1)).await.unwrap();
        cache.dynamic_get("b", || counting_loader(&loads, 2)).await.unwrap();
        assert_eq!(cache.len(), 1);

        // "a" was evicted, so this loads again.
        cache.dynamic_get("a", || counting_loader(&loads, 3)).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn closed_cache_rejects_gets() {
        let cache = QueryCache::new(CacheOptions::default());
        let loads = AtomicUsize::new(0);

        cache.dynamic_get("k", || counting_loader(&loads, 1)).await.unwrap();
        cache.close();

        let err = cache.dynamic_get("k", || counting_loader(&loads, 2)).await;
        assert!(matches!(err, Err(DatastoreError::CacheClosed)));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
