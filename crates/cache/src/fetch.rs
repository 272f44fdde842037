//! Store-first retrieval with bounded retry and backoff.
//!
//! [`CachedFetcher`] answers every lookup from its [`ByteStore`] when it
//! can, and otherwise drives the injected [`Fetcher`] through up to
//! `max_attempts` tries with exponential backoff, jitter, and a
//! per-attempt stall deadline. Successful fetches return immediately;
//! the store write happens in a background task so the caller never waits
//! on cache persistence.

use std::sync::Arc;

use pixelmill_core::backoff::{delay_for_attempt, with_jitter, RetryPolicy};
use tokio_util::sync::CancellationToken;

use crate::store::ByteStore;

/// Retrieval function injected into the cache.
///
/// Failures are plain strings; the fetcher does not decide retry policy,
/// [`CachedFetcher`] does.
pub trait Fetcher: Send + Sync {
    fn fetch(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, String>> + Send;
}

struct FetcherInner<S, F> {
    store: S,
    fetcher: F,
    policy: RetryPolicy,
}

/// Store-first fetch pipeline.
///
/// The value itself is the ownership handle: clone it to share the
/// underlying store and fetcher, drop every clone to release them.
pub struct CachedFetcher<S, F> {
    inner: Arc<FetcherInner<S, F>>,
}

impl<S, F> Clone for CachedFetcher<S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, F> CachedFetcher<S, F>
where
    S: ByteStore + 'static,
    F: Fetcher + 'static,
{
    /// Wrap a store and fetcher with the default retry policy.
    pub fn new(store: S, fetcher: F) -> Self {
        Self::with_policy(store, fetcher, RetryPolicy::default())
    }

    pub fn with_policy(store: S, fetcher: F, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(FetcherInner {
                store,
                fetcher,
                policy,
            }),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Resolve `key` from the store, falling back to retried fetching.
    ///
    /// `cancel` is honoured between attempts, during backoff sleeps, and
    /// while a fetch is in flight.
    pub async fn get_or_fetch(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError> {
        match self.inner.store.get(key).await {
            Ok(Some(bytes)) => {
                tracing::debug!(key, size = bytes.len(), "Cache hit");
                return Ok(bytes);
            }
            Ok(None) => {}
            // A broken store read degrades to a plain fetch.
            Err(error) => tracing::warn!(key, error = %error, "Store read failed"),
        }

        let policy = &self.inner.policy;
        let attempts = policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = with_jitter(delay_for_attempt(attempt - 1, policy), policy);
                tracing::debug!(key, attempt, delay_ms = delay.as_millis() as u64, "Backing off");
                tokio::select! {
                    () = cancel.cancelled() => return Err(FetchError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }

            let outcome = tokio::select! {
                () = cancel.cancelled() => return Err(FetchError::Cancelled),
                result = tokio::time::timeout(policy.stall_timeout, self.inner.fetcher.fetch(key)) => result,
            };

            match outcome {
                Ok(Ok(bytes)) => {
                    tracing::debug!(key, attempt, size = bytes.len(), "Fetch succeeded");
                    self.store_in_background(key, bytes.clone());
                    return Ok(bytes);
                }
                Ok(Err(error)) => {
                    tracing::warn!(key, attempt, error = %error, "Fetch attempt failed");
                    last_error = error;
                }
                Err(_) => {
                    tracing::warn!(
                        key,
                        attempt,
                        stall_ms = policy.stall_timeout.as_millis() as u64,
                        "Fetch attempt stalled",
                    );
                    last_error = format!(
                        "stalled after {}ms",
                        policy.stall_timeout.as_millis()
                    );
                }
            }
        }

        Err(FetchError::Exhausted {
            attempts,
            last_error,
        })
    }

    /// Fire-and-forget store write; failures are logged, never surfaced.
    fn store_in_background(&self, key: &str, bytes: Vec<u8>) {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(error) = inner.store.put(&key, bytes).await {
                tracing::warn!(key = %key, error = %error, "Cache write failed");
            }
        });
    }
}

/// Errors surfaced by [`CachedFetcher::get_or_fetch`].
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The caller's cancellation token was signalled.
    #[error("Fetch cancelled")]
    Cancelled,

    /// Every attempt failed or stalled.
    #[error("All {attempts} fetch attempts failed: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use assert_matches::assert_matches;

    use super::*;
    use crate::memory::MemoryStore;

    /// Fails the first `failures` calls, then succeeds with `payload`.
    struct FlakyFetcher {
        calls: Arc<AtomicUsize>,
        failures: usize,
        payload: Vec<u8>,
    }

    impl Fetcher for FlakyFetcher {
        async fn fetch(&self, _key: &str) -> Result<Vec<u8>, String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(format!("connection reset (call {call})"))
            } else {
                Ok(self.payload.clone())
            }
        }
    }

    /// Never returns within any reasonable deadline.
    struct HangingFetcher;

    impl Fetcher for HangingFetcher {
        async fn fetch(&self, _key: &str) -> Result<Vec<u8>, String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(vec![])
        }
    }

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            max_jitter: Duration::ZERO,
            stall_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn store_hit_skips_the_fetcher() {
        let store = MemoryStore::new();
        store.put("model", vec![1, 2, 3]).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = CachedFetcher::with_policy(
            store,
            FlakyFetcher {
                calls: Arc::clone(&calls),
                failures: 0,
                payload: vec![9],
            },
            quick_policy(3),
        );

        let bytes = cache
            .get_or_fetch("model", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retries_until_the_fetch_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = CachedFetcher::with_policy(
            MemoryStore::new(),
            FlakyFetcher {
                calls: Arc::clone(&calls),
                failures: 2,
                payload: vec![42],
            },
            quick_policy(3),
        );

        let bytes = cache
            .get_or_fetch("model", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(bytes, vec![42]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempts_and_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = CachedFetcher::with_policy(
            MemoryStore::new(),
            FlakyFetcher {
                calls: Arc::clone(&calls),
                failures: usize::MAX,
                payload: vec![],
            },
            quick_policy(2),
        );

        let err = cache
            .get_or_fetch("model", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_matches!(
            err,
            FetchError::Exhausted { attempts: 2, last_error } if last_error.contains("connection reset")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stalled_attempts_count_as_failures() {
        let cache = CachedFetcher::with_policy(
            MemoryStore::new(),
            HangingFetcher,
            RetryPolicy {
                stall_timeout: Duration::from_millis(30),
                ..quick_policy(1)
            },
        );

        let err = cache
            .get_or_fetch("model", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_matches!(
            err,
            FetchError::Exhausted { attempts: 1, last_error } if last_error.contains("stalled")
        );
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_backoff_sleep() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = CachedFetcher::with_policy(
            MemoryStore::new(),
            FlakyFetcher {
                calls: Arc::clone(&calls),
                failures: usize::MAX,
                payload: vec![],
            },
            RetryPolicy {
                base_delay: Duration::from_secs(3600),
                ..quick_policy(3)
            },
        );
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let pending = {
            let cache = cache.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { cache.get_or_fetch("model", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        let outcome = pending.await.unwrap();
        assert_matches!(outcome, Err(FetchError::Cancelled));
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "cancellation should not wait out the backoff"
        );
    }

    #[tokio::test]
    async fn successful_fetch_lands_in_the_store() {
        let cache = CachedFetcher::with_policy(
            MemoryStore::new(),
            FlakyFetcher {
                calls: Arc::new(AtomicUsize::new(0)),
                failures: 0,
                payload: vec![5, 5],
            },
            quick_policy(1),
        );

        cache
            .get_or_fetch("model", &CancellationToken::new())
            .await
            .unwrap();

        // The write is fire-and-forget; give it a moment to land.
        let deadline = Instant::now() + Duration::from_millis(500);
        loop {
            if cache.store().contains("model").await.unwrap() {
                break;
            }
            assert!(Instant::now() < deadline, "cache write never landed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            cache.store().get("model").await.unwrap(),
            Some(vec![5, 5])
        );
    }
}
