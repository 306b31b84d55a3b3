//! In-flight refresh deduplication
//!
//! Concurrent refreshes of the same key share one underlying fetch. The first
//! caller registers the key and spawns the fetch; later callers only attach a
//! waiter. When the fetch finishes the key is removed *before* any waiter is
//! notified, so a woken waiter that immediately asks again starts a new fetch
//! instead of joining the finished one.

use crate::error::{GatewayError, GatewayResult};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Waiter<V> = oneshot::Sender<GatewayResult<V>>;

/// Counters for refresh deduplication
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshMetrics {
    /// Fetches actually issued
    pub fetches: u64,
    /// Callers that joined a fetch already in flight
    pub joined: u64,
    /// Fetches that ended in an error
    pub failures: u64,
}

/// Keyed in-flight refresh tokens
#[derive(Debug)]
pub struct RefreshCoordinator<K, V> {
    in_flight: Mutex<HashMap<K, Vec<Waiter<V>>>>,
    metrics: Mutex<RefreshMetrics>,
}

impl<K, V> Default for RefreshCoordinator<K, V> {
    fn default() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            metrics: Mutex::new(RefreshMetrics::default()),
        }
    }
}

impl<K, V> RefreshCoordinator<K, V>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fetch` for `key`, or join the fetch already running for it
    ///
    /// `fetch` is only invoked by the caller that creates the token. Every
    /// caller, leader included, receives a clone of the same outcome.
    pub async fn run<F, Fut>(self: &Arc<Self>, key: K, fetch: F) -> GatewayResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<V>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let leader = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.get_mut(&key) {
                Some(waiters) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    in_flight.insert(key.clone(), vec![tx]);
                    true
                }
            }
        };

        if leader {
            self.with_metrics(|m| m.fetches += 1);
            debug!("Starting refresh for {key}");

            let future = fetch();
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                let result = AssertUnwindSafe(future)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(GatewayError::unknown("refresh task panicked")));
                coordinator.complete(&key, result);
            });
        } else {
            self.with_metrics(|m| m.joined += 1);
            debug!("Joining in-flight refresh for {key}");
        }

        rx.await
            .unwrap_or_else(|_| Err(GatewayError::unknown("refresh ended without a result")))
    }

    /// Clear the token, then fan the outcome out to every waiter
    fn complete(&self, key: &K, result: GatewayResult<V>) {
        let waiters = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .unwrap_or_default();

        match &result {
            Ok(_) => info!("Refresh for {key} completed, {} waiters", waiters.len()),
            Err(e) => {
                self.with_metrics(|m| m.failures += 1);
                warn!("Refresh for {key} failed for {} waiters: {e}", waiters.len());
            }
        }

        for waiter in waiters {
            // A waiter that gave up simply isn't listening any more
            let _ = waiter.send(result.clone());
        }
    }

    /// Whether a fetch is currently running for `key`
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn metrics(&self) -> RefreshMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn with_metrics(&self, update: impl FnOnce(&mut RefreshMetrics)) {
        update(&mut self.metrics.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Coordinator = RefreshCoordinator<u32, u64>;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_fetch() {
        let coordinator = Arc::new(Coordinator::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .run(1, move || async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst) as u64;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(42 + n)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_in_flight(&1));

        let metrics = coordinator.metrics();
        assert_eq!(metrics.fetches, 1);
        assert_eq!(metrics.joined, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reaches_every_waiter() {
        let coordinator = Arc::new(Coordinator::new());

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .run(1, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(GatewayError::network("unreachable"))
                    })
                    .await
            })
        };
        while !coordinator.is_in_flight(&1) {
            tokio::task::yield_now().await;
        }
        let second = coordinator.run(1, || async { Ok(7) }).await;

        assert_eq!(second, Err(GatewayError::network("unreachable")));
        assert_eq!(first.await.unwrap(), Err(GatewayError::network("unreachable")));
        assert_eq!(coordinator.metrics().failures, 1);
    }

    #[tokio::test]
    async fn test_sequential_calls_fetch_again() {
        let coordinator = Arc::new(Coordinator::new());
        assert_eq!(coordinator.run(1, || async { Ok(1) }).await, Ok(1));
        assert_eq!(coordinator.run(1, || async { Ok(2) }).await, Ok(2));
        assert_eq!(coordinator.metrics().fetches, 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_share() {
        let coordinator = Arc::new(Coordinator::new());
        let (a, b) = tokio::join!(
            coordinator.run(1, || async { Ok(10) }),
            coordinator.run(2, || async { Ok(20) })
        );
        assert_eq!((a, b), (Ok(10), Ok(20)));
        assert_eq!(coordinator.metrics().fetches, 2);
    }

    #[tokio::test]
    async fn test_panicking_fetch_is_reported() {
        let coordinator = Arc::new(Coordinator::new());
        let result = coordinator
            .run(1, || async { panic!("boom") })
            .await;
        assert!(matches!(result, Err(GatewayError::Unknown(_))));
        assert!(!coordinator.is_in_flight(&1));
    }
}
