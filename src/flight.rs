//! Single-flight deduplication for expensive async calls.
//!
//! `connect` and `tools/list` both need the same guarantee: when several
//! callers race, exactly one performs the work and every caller observes
//! its result. Results must be `Clone` (in practice: `Result<T,
//! SomeCloneableError>`).
//!
//! The work runs on a detached task, not inside any caller's future: a
//! caller that gives up (timeout, cancellation) neither aborts the work nor
//! leaks the map entry; the task removes its own entry when it lands.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;

type FlightMap<K, V> = Arc<Mutex<HashMap<K, Shared<BoxFuture<'static, V>>>>>;

pub struct SingleFlight<K, V> {
    inflight: FlightMap<K, V>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `make()` under `key`, or join the call already in flight.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.inflight.lock().await;
            if let Some(existing) = inflight.get(&key) {
                existing.clone()
            } else {
                let work = make();
                let map = Arc::clone(&self.inflight);
                let task_key = key.clone();
                let handle = tokio::spawn(async move {
                    let value = work.await;
                    map.lock().await.remove(&task_key);
                    value
                });
                let shared = async move {
                    match handle.await {
                        Ok(value) => value,
                        Err(err) => panic!("single-flight task failed: {err}"),
                    }
                }
                .boxed()
                .shared();
                inflight.insert(key.clone(), shared.clone());
                shared
            }
        };

        shared.await
    }

    /// Whether a call is currently in flight under `key`.
    pub async fn in_flight(&self, key: &K) -> bool {
        self.inflight.lock().await.contains_key(key)
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let flight = Arc::new(SingleFlight::<&'static str, u64>::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = Arc::clone(&flight);
            let executions = Arc::clone(&executions);
            handles.push(tokio::spawn(async move {
                flight
                    .run("connect", move || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        42u64
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 42);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sequential_calls_execute_again() {
        let flight = SingleFlight::<&'static str, usize>::new();
        let executions = Arc::new(AtomicUsize::new(0));

        for expected in 1..=3 {
            let executions = Arc::clone(&executions);
            let got = flight
                .run("k", move || async move {
                    executions.fetch_add(1, Ordering::SeqCst) + 1
                })
                .await;
            assert_eq!(got, expected);
            // The detached task needs a beat to clear its entry.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_share() {
        let flight = SingleFlight::<String, &'static str>::new();
        let a = flight.run("a".into(), || async { "a" });
        let b = flight.run("b".into(), || async { "b" });
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a, "a");
        assert_eq!(b, "b");
    }

    #[tokio::test]
    async fn test_entry_cleared_after_completion() {
        let flight = SingleFlight::<&'static str, ()>::new();
        flight.run("k", || async {}).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!flight.in_flight(&"k").await);
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_wedge_the_key() {
        let flight = Arc::new(SingleFlight::<&'static str, usize>::new());
        let executions = Arc::new(AtomicUsize::new(0));

        // The only caller times out and drops its future mid-flight.
        let slow_executions = Arc::clone(&executions);
        let result = tokio::time::timeout(
            Duration::from_millis(10),
            flight.run("k", move || async move {
                slow_executions.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                1usize
            }),
        )
        .await;
        assert!(result.is_err());

        // The work still finishes and the entry clears itself.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!flight.in_flight(&"k").await);
        assert_eq!(executions.load(Ordering::SeqCst), 1);

        // A later caller starts a fresh flight.
        let fresh_executions = Arc::clone(&executions);
        let got = flight
            .run("k", move || async move {
                fresh_executions.fetch_add(1, Ordering::SeqCst);
                2usize
            })
            .await;
        assert_eq!(got, 2);
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }
}
