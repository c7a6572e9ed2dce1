use std::{sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use moka::{Expiry, future::Cache};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{FetchError, FetchRequest, HttpFetcher, metrics::metrics};

/// Per-step cache lifetime in minutes: `0` never caches, negative never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtl(i64);

impl CacheTtl {
    pub const NEVER: CacheTtl = CacheTtl(0);

    pub fn minutes(minutes: i64) -> Self {
        CacheTtl(minutes)
    }

    pub fn is_enabled(&self) -> bool {
        self.0 != 0
    }

    pub fn is_fresh(&self, age: Duration) -> bool {
        match self.lifetime() {
            Some(lifetime) => age < lifetime,
            None => self.0 < 0,
        }
    }

    fn lifetime(&self) -> Option<Duration> {
        (self.0 > 0).then(|| Duration::from_secs(self.0 as u64 * 60))
    }
}

/// Key shared by the cache and the in-flight map. Built from the *resolved*
/// url and body so different inputs never collide.
pub fn cache_key(instance_id: &str, target_suffix: &str, step_id: &str, req: &FetchRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(req.method.as_bytes());
    hasher.update(b"\n");
    hasher.update(req.url.as_bytes());
    hasher.update(b"\n");
    hasher.update(req.body.as_deref().unwrap_or_default().as_bytes());
    format!("{instance_id}{target_suffix}|{step_id}|{:x}", hasher.finalize())
}

#[derive(Clone, Debug)]
struct CachedResponse {
    instance_id: Arc<str>,
    body: Arc<str>,
    stored_at: Instant,
    ttl: CacheTtl,
}

/// Lets moka drop entries on its own once their step TTL has passed.
struct StepExpiry;

impl Expiry<String, CachedResponse> for StepExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedResponse,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        value.ttl.lifetime()
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedResponse,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl.lifetime()
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<str>, FetchError>>>;

/// Removes the in-flight marker when the fetch task ends, however it ends.
struct InFlightGuard {
    in_flight: Arc<DashMap<String, SharedFetch>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// TTL cache plus single-flight coalescing in front of an [`HttpFetcher`].
///
/// Every network call runs in its own task, so a caller that gives up waiting
/// never cancels a fetch other callers are still awaiting.
#[derive(Clone)]
pub struct ResponseCache {
    fetcher: Arc<dyn HttpFetcher>,
    entries: Cache<String, CachedResponse>,
    in_flight: Arc<DashMap<String, SharedFetch>>,
}

impl ResponseCache {
    pub fn new(fetcher: Arc<dyn HttpFetcher>) -> Arc<Self> {
        let entries = Cache::builder()
            .expire_after(StepExpiry)
            .support_invalidation_closures()
            .build();
        Arc::new(Self {
            fetcher,
            entries,
            in_flight: Arc::new(DashMap::new()),
        })
    }

    /// Serve `key` from cache, join an in-flight fetch, or start a new one.
    pub async fn get_or_fetch(
        &self,
        instance_id: &str,
        key: &str,
        ttl: CacheTtl,
        request: FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<Arc<str>, FetchError> {
        loop {
            if let Some(body) = self.cached(key, ttl).await {
                return Ok(body);
            }
            let Some(pending) = self.join_or_start(instance_id, key, ttl, &request) else {
                continue;
            };
            return tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(FetchError::Cancelled),
                result = pending => result,
            };
        }
    }

    async fn cached(&self, key: &str, ttl: CacheTtl) -> Option<Arc<str>> {
        if !ttl.is_enabled() {
            return None;
        }
        let entry = self.entries.get(key).await?;
        if ttl.is_fresh(entry.stored_at.elapsed()) {
            metrics().cache_hits.add(1, &[]);
            debug!(%key, "cache hit");
            return Some(entry.body);
        }
        self.entries.invalidate(key).await;
        None
    }

    /// `None` when a fetch for `key` completed and was cached after the
    /// caller's cache lookup; the caller should read the cache again.
    fn join_or_start(
        &self,
        instance_id: &str,
        key: &str,
        ttl: CacheTtl,
        request: &FetchRequest,
    ) -> Option<SharedFetch> {
        match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(pending) => {
                metrics().coalesced_waits.add(1, &[]);
                debug!(%key, "joining in-flight fetch");
                Some(pending.get().clone())
            }
            Entry::Vacant(_) if ttl.is_enabled() && self.entries.contains_key(key) => None,
            Entry::Vacant(slot) => {
                let this = self.clone();
                let request = request.clone();
                let instance_id: Arc<str> = Arc::from(instance_id);
                let key = key.to_string();
                let task = tokio::spawn(async move {
                    let _guard = InFlightGuard {
                        in_flight: this.in_flight.clone(),
                        key: key.clone(),
                    };
                    this.fetch_and_store(instance_id, key, ttl, request).await
                });
                let shared = async move {
                    task.await.unwrap_or_else(|e| {
                        Err(FetchError::Connection(format!("fetch task failed: {e}")))
                    })
                }
                .boxed()
                .shared();
                slot.insert(shared.clone());
                Some(shared)
            }
        }
    }

    async fn fetch_and_store(
        &self,
        instance_id: Arc<str>,
        key: String,
        ttl: CacheTtl,
        request: FetchRequest,
    ) -> Result<Arc<str>, FetchError> {
        let m = metrics();
        m.fetch_started.add(1, &[]);
        let started = Instant::now();

        let result = self.fetcher.fetch(&request).await.map(Arc::<str>::from);

        let elapsed = started.elapsed().as_secs_f64() * 1_000.0;
        m.fetch_latency_ms.record(elapsed, &[]);
        tracing::event!(
            target: "fetch",
            tracing::Level::INFO,
            url = %request.url,
            latency_ms = elapsed,
            status = if result.is_ok() { "ok" } else { "error" },
        );

        match &result {
            Ok(body) if ttl.is_enabled() => {
                self.entries
                    .insert(
                        key,
                        CachedResponse {
                            instance_id,
                            body: body.clone(),
                            stored_at: Instant::now(),
                            ttl,
                        },
                    )
                    .await;
            }
            Ok(_) => {}
            Err(e) => {
                m.fetch_failed.add(1, &[]);
                debug!(url = %request.url, error = %e, "fetch failed");
            }
        }
        result
    }

    /// Drop every cached response that belongs to `instance_id`.
    pub fn clear_instance(&self, instance_id: &str) {
        let id = instance_id.to_string();
        if let Err(e) = self
            .entries
            .invalidate_entries_if(move |_key, value| *value.instance_id == *id)
        {
            warn!(%instance_id, error = %e, "could not clear cached responses");
        }
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}
