//! Bounded cache of computed predictions.
//!
//! Entries are versioned by the basis timestamp they were computed against.
//! An entry is [`Freshness::Fresh`] while that timestamp equals the latest
//! applied live observation for the flight, and [`Freshness::Stale`] as soon
//! as a newer observation lands. Stale entries are kept for fallback until
//! evicted.
//!
//! Recency is a logical clock rather than wall time: every insert and every
//! hit stamps the entry with the next tick.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::PredictionResult;
use crate::flight::FlightKey;
use crate::live_status::LiveStatusCache;

/// Whether a cached prediction still reflects the latest live status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Computed against the latest applied observation.
    Fresh,
    /// A newer observation has been applied since.
    Stale,
}

impl Freshness {
    /// Classify a basis timestamp against the current live timestamp.
    #[must_use]
    pub fn of(basis: Option<DateTime<Utc>>, live: Option<DateTime<Utc>>) -> Self {
        if basis == live {
            Self::Fresh
        } else {
            Self::Stale
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    result: PredictionResult,
    last_access: AtomicU64,
}

/// Concurrent prediction cache with stale-first LRU eviction.
#[derive(Debug)]
pub struct PredictionCache {
    entries: DashMap<FlightKey, CacheEntry>,
    capacity: usize,
    clock: AtomicU64,
    evictions: AtomicU64,
}

impl PredictionCache {
    /// Create a cache holding at most `capacity` predictions (minimum one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Maximum number of entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cached predictions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries evicted so far.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Look up a prediction and mark it as recently used.
    #[must_use]
    pub fn get(&self, key: &FlightKey) -> Option<PredictionResult> {
        self.entries.get(key).map(|entry| {
            entry.last_access.store(self.tick(), Ordering::Relaxed);
            entry.result.clone()
        })
    }

    /// Look up a prediction without touching its recency.
    #[must_use]
    pub fn peek(&self, key: &FlightKey) -> Option<PredictionResult> {
        self.entries.get(key).map(|entry| entry.result.clone())
    }

    /// Classify the cached prediction for `key` against the live cache.
    #[must_use]
    pub fn classify(&self, key: &FlightKey, live: &LiveStatusCache) -> Option<Freshness> {
        let basis = self.entries.get(key).map(|e| e.result.basis_timestamp)?;
        Some(Freshness::of(basis, live.observed_at(key)))
    }

    /// Store a prediction, replacing any previous one for the same flight,
    /// then evict down to capacity.
    ///
    /// Returns the keys evicted to make room.
    pub fn insert(&self, result: PredictionResult, live: &LiveStatusCache) -> Vec<FlightKey> {
        let entry = CacheEntry {
            result,
            last_access: AtomicU64::new(self.tick()),
        };
        let key = entry.result.key.clone();
        self.entries.insert(key.clone(), entry);
        self.evict_over_capacity(&key, live)
    }

    /// Drop the prediction for `key`, if any.
    pub fn remove(&self, key: &FlightKey) -> Option<PredictionResult> {
        self.entries.remove(key).map(|(_, entry)| entry.result)
    }

    fn evict_over_capacity(&self, keep: &FlightKey, live: &LiveStatusCache) -> Vec<FlightKey> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let Some(victim) = self.pick_victim(keep, live) else {
                break;
            };
            if self.entries.remove(&victim).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("{}: evicted cached prediction", victim);
                evicted.push(victim);
            }
        }
        evicted
    }

    /// Least recently used stale entry, else least recently used overall.
    /// The entry just inserted is never chosen.
    fn pick_victim(&self, keep: &FlightKey, live: &LiveStatusCache) -> Option<FlightKey> {
        let mut oldest_stale: Option<(u64, FlightKey)> = None;
        let mut oldest: Option<(u64, FlightKey)> = None;

        for entry in &self.entries {
            if entry.key() == keep {
                continue;
            }
            let tick = entry.last_access.load(Ordering::Relaxed);
            let stale = Freshness::of(entry.result.basis_timestamp, live.observed_at(entry.key()))
                == Freshness::Stale;

            if stale && oldest_stale.as_ref().map_or(true, |(t, _)| tick < *t) {
                oldest_stale = Some((tick, entry.key().clone()));
            }
            if oldest.as_ref().map_or(true, |(t, _)| tick < *t) {
                oldest = Some((tick, entry.key().clone()));
            }
        }

        oldest_stale.or(oldest).map(|(_, key)| key)
    }

    /// All cached predictions, least recently used first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PredictionResult> {
        let mut entries: Vec<(u64, PredictionResult)> = self
            .entries
            .iter()
            .map(|e| (e.last_access.load(Ordering::Relaxed), e.result.clone()))
            .collect();
        entries.sort_by_key(|(tick, _)| *tick);
        entries.into_iter().map(|(_, result)| result).collect()
    }

    /// Load predictions in order, oldest first, as if each had just been
    /// computed. Returns the number of entries held afterwards.
    pub fn restore(&self, results: Vec<PredictionResult>, live: &LiveStatusCache) -> usize {
        for mut result in results {
            result.stale = false;
            self.insert(result, live);
        }
        self.entries.len()
    }
}
