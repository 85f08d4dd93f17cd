//! Resilient fetch layer: bounded retry plus a time-bound response cache.

use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde_json::Value;
use sync_core::{FetchRetryPolicy, Fingerprint, ResponseCache, SyncError};
use sync_platform::Clock;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::rest::{RestApi, RestRequest};

/// Process-wide response cache shared by fetchers and the sweeper.
pub type SharedCache = Arc<Mutex<ResponseCache>>;

pub fn shared_cache() -> SharedCache {
    Arc::new(Mutex::new(ResponseCache::new()))
}

fn lock(cache: &SharedCache) -> MutexGuard<'_, ResponseCache> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Re-invoke `operation` on transient failures (network, timeout, 5xx).
///
/// Permanent failures return immediately. The delay after the n-th failed
/// attempt is `base_delay * n`; the last failure propagates once the
/// attempt budget is spent.
pub async fn retry_with_policy<T, F, Fut>(
    policy: FetchRetryPolicy,
    mut operation: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut attempt: u32 = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "request succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.is_transient() => {
                debug!(code = %err.code, "request failed permanently");
                return Err(err);
            }
            Err(err) if attempt >= policy.max_attempts() => {
                warn!(attempts = attempt, error = %err, "retry budget exhausted");
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "request failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// [`retry_with_policy`] with an explicit budget.
pub async fn retry<T, F, Fut>(
    loader: F,
    max_attempts: u32,
    base_delay: Duration,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let base_delay_ms = u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX);
    retry_with_policy(FetchRetryPolicy::new(max_attempts, base_delay_ms), loader).await
}

/// Leaf dependency for every REST call made by the facades.
#[derive(Clone)]
pub struct ResilientFetcher {
    rest: Arc<dyn RestApi>,
    cache: SharedCache,
    clock: Arc<dyn Clock>,
    retry: FetchRetryPolicy,
    default_ttl: Duration,
}

impl ResilientFetcher {
    pub fn new(
        rest: Arc<dyn RestApi>,
        cache: SharedCache,
        clock: Arc<dyn Clock>,
        retry: FetchRetryPolicy,
        default_ttl: Duration,
    ) -> Self {
        Self {
            rest,
            cache,
            clock,
            retry,
            default_ttl,
        }
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    /// Cached value when present and unexpired; otherwise run `loader` and
    /// store its result. Concurrent misses may each run the loader.
    pub async fn cached_fetch<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
        loader: F,
    ) -> Result<Value, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, SyncError>>,
    {
        let cached = lock(&self.cache).get(fingerprint, self.clock.now_ms());
        if let Some(hit) = cached {
            debug!(fingerprint = %fingerprint, "cache hit");
            return Ok(hit);
        }

        let value = loader().await?;
        lock(&self.cache).insert(fingerprint, value.clone(), ttl, self.clock.now_ms());
        Ok(value)
    }

    /// Retried, cached GET.
    pub async fn get(&self, request: &RestRequest) -> Result<Value, SyncError> {
        self.cached_fetch(&request.fingerprint(), self.default_ttl, || {
            retry_with_policy(self.retry, || self.rest.execute(request))
        })
        .await
    }

    /// Retried GET that bypasses the cache.
    pub async fn get_fresh(&self, request: &RestRequest) -> Result<Value, SyncError> {
        retry_with_policy(self.retry, || self.rest.execute(request)).await
    }

    /// Retried mutation. Invalidates cached entries of the mutated resource.
    pub async fn mutate(&self, request: &RestRequest) -> Result<Value, SyncError> {
        let value = retry_with_policy(self.retry, || self.rest.execute(request)).await?;
        self.invalidate_resource(&request.path);
        Ok(value)
    }

    /// Single-attempt mutation for requests that are not idempotent.
    pub async fn mutate_once(&self, request: &RestRequest) -> Result<Value, SyncError> {
        let value = self.rest.execute(request).await?;
        self.invalidate_resource(&request.path);
        Ok(value)
    }

    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        lock(&self.cache).invalidate_prefix(prefix)
    }

    fn invalidate_resource(&self, path: &str) {
        let resource = resource_prefix(path);
        let removed = self.invalidate_prefix(&resource);
        if removed > 0 {
            debug!(resource = %resource, removed, "invalidated cached responses");
        }
    }
}

/// Top-level collection of a path: `conversations/5/messages/` -> `conversations/`.
fn resource_prefix(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((head, _)) => format!("{head}/"),
        None => trimmed.to_owned(),
    }
}

/// Background task purging expired cache entries.
pub struct CacheSweeper {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl CacheSweeper {
    pub fn start(cache: SharedCache, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let interval = interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_child.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = lock(&cache).sweep(clock.now_ms());
                        if removed > 0 {
                            debug!(removed, "swept expired cache entries");
                        }
                    }
                }
            }
        });

        Self { stop, task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;
    use sync_platform::ManualClock;

    use super::*;
    use crate::testing::{FakeRest, settle};

    const TTL: Duration = Duration::from_secs(30);

    fn fetcher(rest: &Arc<FakeRest>, clock: &ManualClock) -> ResilientFetcher {
        ResilientFetcher::new(
            rest.clone(),
            shared_cache(),
            Arc::new(clock.clone()),
            FetchRetryPolicy::new(3, 100),
            TTL,
        )
    }

    #[tokio::test]
    async fn loader_runs_once_within_ttl() {
        let rest = FakeRest::new();
        let clock = ManualClock::new(0);
        let fetcher = fetcher(&rest, &clock);
        let calls = AtomicU32::new(0);
        let fp = Fingerprint::endpoint_only("notifications/");

        for _ in 0..2 {
            let value = fetcher
                .cached_fetch(&fp, TTL, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!([1, 2]))
                })
                .await
                .expect("loader succeeds");
            assert_eq!(value, json!([1, 2]));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(30_000);
        fetcher
            .cached_fetch(&fp, TTL, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!([]))
            })
            .await
            .expect("loader succeeds after expiry");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_loads_are_not_cached() {
        let rest = FakeRest::new();
        let clock = ManualClock::new(0);
        let fetcher = fetcher(&rest, &clock);
        let fp = Fingerprint::endpoint_only("a/");

        let err = fetcher
            .cached_fetch(&fp, TTL, || async { Err(SyncError::http(404, "missing")) })
            .await
            .expect_err("loader error propagates");
        assert_eq!(err.status, Some(404));
        assert!(lock(fetcher.cache()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_linearly() {
        let rest = FakeRest::new();
        rest.respond("notifications/", Err(SyncError::http(500, "boom")));
        rest.respond("notifications/", Err(SyncError::http(500, "boom")));
        rest.respond("notifications/", Ok(json!([{ "id": 1 }])));
        let fetcher = fetcher(&rest, &ManualClock::new(0));

        let started = tokio::time::Instant::now();
        let value = fetcher
            .get(&RestRequest::get("notifications/"))
            .await
            .expect("third attempt succeeds");

        assert_eq!(value, json!([{ "id": 1 }]));
        assert_eq!(rest.calls_to("notifications/"), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_never_retried() {
        let rest = FakeRest::new();
        rest.respond("missing/", Err(SyncError::http(404, "not found")));
        let fetcher = fetcher(&rest, &ManualClock::new(0));

        let err = fetcher
            .get(&RestRequest::get("missing/"))
            .await
            .expect_err("404 surfaces immediately");
        assert_eq!(err.code, "http_404");
        assert_eq!(rest.calls_to("missing/"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn last_failure_propagates_after_budget() {
        let rest = FakeRest::new();
        for _ in 0..3 {
            rest.respond("flaky/", Err(SyncError::network("timeout", "timed out")));
        }
        let fetcher = fetcher(&rest, &ManualClock::new(0));

        let err = fetcher
            .get(&RestRequest::get("flaky/"))
            .await
            .expect_err("budget exhausted");
        assert_eq!(err.code, "timeout");
        assert_eq!(rest.calls_to("flaky/"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_helper_honours_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), SyncError> = retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::http(503, "unavailable"))
            },
            2,
            Duration::from_millis(10),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn mutations_invalidate_their_resource() {
        let rest = FakeRest::new();
        rest.always("conversations/", json!([]));
        rest.always("conversations/5/mark_as_read/", json!({}));
        rest.always("notifications/", json!([]));
        let fetcher = fetcher(&rest, &ManualClock::new(0));

        fetcher
            .get(&RestRequest::get("conversations/"))
            .await
            .expect("list loads");
        fetcher
            .get(&RestRequest::get("notifications/"))
            .await
            .expect("list loads");
        fetcher
            .mutate(&RestRequest::post("conversations/5/mark_as_read/", json!({})))
            .await
            .expect("mutation succeeds");

        assert_eq!(lock(fetcher.cache()).len(), 1);
        fetcher
            .get(&RestRequest::get("conversations/"))
            .await
            .expect("list reloads");
        assert_eq!(rest.calls_to("conversations/"), 2);
    }

    #[test]
    fn resource_prefix_is_the_first_segment() {
        assert_eq!(resource_prefix("conversations/5/messages/"), "conversations/");
        assert_eq!(resource_prefix("/notifications/7/"), "notifications/");
        assert_eq!(resource_prefix("ping"), "ping");
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_until_stopped() {
        let cache = shared_cache();
        let clock = ManualClock::new(0);
        lock(&cache).insert(
            &Fingerprint::endpoint_only("a/"),
            json!(1),
            Duration::from_secs(1),
            0,
        );

        let sweeper = CacheSweeper::start(cache.clone(), Arc::new(clock.clone()), Duration::from_secs(5));
        settle().await;
        assert!(sweeper.is_running());
        assert_eq!(lock(&cache).len(), 1);

        clock.advance(2_000);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(lock(&cache).is_empty());

        sweeper.stop().await;
    }
}
