//! Per-key deduplication of in-flight computations.
//!
//! The first caller for a key spawns the computation onto the tokio runtime
//! and publishes its outcome on a `watch` channel. Every caller for the same
//! key, first or late, waits on a receiver for that channel, so all of them
//! observe one computation. The in-flight entry is removed when the
//! computation finishes, times out, or panics, after which the next caller
//! starts a new one.

use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::PredictionError;

type Outcome<T> = Result<T, PredictionError>;

#[derive(Debug)]
struct InFlight<T> {
    generation: u64,
    outcome: watch::Receiver<Option<Outcome<T>>>,
}

/// Removes the in-flight entry it was created for when dropped.
///
/// Lives inside the spawned task, so the entry is released on completion,
/// budget timeout, and panic alike. The generation check keeps a late drop
/// from removing a newer computation's entry.
struct Release<K: Eq + Hash, T> {
    in_flight: Arc<DashMap<K, InFlight<T>>>,
    key: K,
    generation: u64,
}

impl<K: Eq + Hash, T> Drop for Release<K, T> {
    fn drop(&mut self) {
        let generation = self.generation;
        self.in_flight
            .remove_if(&self.key, |_, entry| entry.generation == generation);
    }
}

/// Ensures at most one concurrent computation per key.
#[derive(Debug)]
pub struct RequestCoordinator<K, T>
where
    K: Eq + Hash,
{
    in_flight: Arc<DashMap<K, InFlight<T>>>,
    budget: Duration,
    next_generation: AtomicU64,
    started: AtomicU64,
}

impl<K, T> RequestCoordinator<K, T>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Create a coordinator whose computations are bounded by `budget`.
    #[must_use]
    pub fn new(budget: Duration) -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            budget,
            next_generation: AtomicU64::new(0),
            started: AtomicU64::new(0),
        }
    }

    /// The per-computation time budget.
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Number of computations currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether a computation for `key` is in flight.
    #[must_use]
    pub fn is_pending(&self, key: &K) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Total number of computations started since creation.
    #[must_use]
    pub fn computations_started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Run `compute` for `key` unless a computation is already in flight, in
    /// which case wait for that one instead.
    ///
    /// `compute` is only called by the caller that starts the computation.
    /// The returned future runs to completion on the runtime even if every
    /// waiter goes away.
    ///
    /// # Errors
    ///
    /// Returns the computation's own error, [`PredictionError::Timeout`] if
    /// it exceeded the budget, or [`PredictionError::ComputeAborted`] if it
    /// panicked.
    pub async fn dedup_compute<F, Fut>(&self, key: &K, compute: F) -> Outcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let outcome = self.join_or_start(key, compute);
        wait_for(key, outcome).await
    }

    /// Like [`dedup_compute`](Self::dedup_compute), but this caller stops
    /// waiting after `wait`. The computation itself keeps running for any
    /// other waiters and still populates whatever its future writes to.
    ///
    /// # Errors
    ///
    /// As [`dedup_compute`](Self::dedup_compute), plus
    /// [`PredictionError::Timeout`] when this caller's wait expires.
    pub async fn dedup_compute_within<F, Fut>(
        &self,
        key: &K,
        wait: Duration,
        compute: F,
    ) -> Outcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let outcome = self.join_or_start(key, compute);
        if let Ok(result) = tokio::time::timeout(wait, wait_for(key, outcome)).await {
            result
        } else {
            debug!("{}: caller gave up waiting after {:?}", key, wait);
            Err(PredictionError::Timeout {
                operation: format!("wait for {key}"),
                budget: wait,
            })
        }
    }

    fn open(&self) -> (watch::Sender<Option<Outcome<T>>>, InFlight<T>) {
        let (sender, outcome) = watch::channel(None);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        (sender, InFlight { generation, outcome })
    }

    fn join_or_start<F, Fut>(&self, key: &K, compute: F) -> watch::Receiver<Option<Outcome<T>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let (sender, receiver, generation) = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) if entry.get().outcome.borrow().is_none() => {
                trace!("{}: joining in-flight computation", key);
                return entry.get().outcome.clone();
            }
            Entry::Occupied(mut entry) => {
                // Published but not yet released: the outcome is already
                // final, so a new caller starts over.
                trace!("{}: replacing finished computation", key);
                let (sender, flight) = self.open();
                let (receiver, generation) = (flight.outcome.clone(), flight.generation);
                entry.insert(flight);
                (sender, receiver, generation)
            }
            Entry::Vacant(slot) => {
                let (sender, flight) = self.open();
                let (receiver, generation) = (flight.outcome.clone(), flight.generation);
                slot.insert(flight);
                (sender, receiver, generation)
            }
        };

        self.started.fetch_add(1, Ordering::Relaxed);
        debug!("{}: starting computation (generation {})", key, generation);

        let release = Release {
            in_flight: Arc::clone(&self.in_flight),
            key: key.clone(),
            generation,
        };
        let future = compute();
        let budget = self.budget;
        let label = key.to_string();

        tokio::spawn(async move {
            let _release = release;
            let outcome = if let Ok(outcome) = tokio::time::timeout(budget, future).await {
                outcome
            } else {
                warn!("{}: computation exceeded budget of {:?}", label, budget);
                Err(PredictionError::Timeout {
                    operation: format!("prediction for {label}"),
                    budget,
                })
            };
            // No receivers left is fine; the entry is released either way.
            let _ = sender.send(Some(outcome));
        });

        receiver
    }
}

async fn wait_for<K: Display, T: Clone>(
    key: &K,
    mut outcome: watch::Receiver<Option<Outcome<T>>>,
) -> Outcome<T> {
    loop {
        let current = outcome.borrow_and_update().clone();
        if let Some(result) = current {
            return result;
        }
        if outcome.changed().await.is_err() {
            // Sender gone. Either it published just before dropping, or the
            // task panicked.
            let last = outcome.borrow().clone();
            return last.unwrap_or_else(|| {
                Err(PredictionError::ComputeAborted {
                    key: key.to_string(),
                })
            });
        }
    }
}
