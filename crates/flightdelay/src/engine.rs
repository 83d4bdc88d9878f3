//! The delay probability engine.
//!
//! [`DelayEngine`] owns the flight registry, the live status cache, the
//! scoring adapter, the prediction cache and the request coordinator. Every
//! cached prediction moves through these states:
//!
//! ```text
//! Absent -> Pending -> Fresh -> Stale -> Pending -> Fresh
//!                        \         \
//!                         +---------+--> Evicted
//! ```
//!
//! Fresh and Stale are never stored flags. They are decided on each read by
//! comparing the entry's basis timestamp with the latest applied live
//! observation, so a poller writing straight into the live cache is enough
//! to invalidate predictions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{Freshness, PredictionCache};
use crate::config::EngineConfig;
use crate::coordinator::RequestCoordinator;
use crate::error::PredictionError;
use crate::flight::{FlightFeatures, FlightKey, RawFlightRecord};
use crate::live_status::{LiveStatus, LiveStatusCache};
use crate::normalizer::{FlightRegistry, Normalizer};
use crate::scoring::{delay_factors, ScoringAdapter};

/// Discrete confidence in a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    /// No live signal, or a weak or aged one.
    Low,
    /// Some live signal.
    Medium,
    /// Recent, confident live signal with mostly complete features.
    High,
}

impl ConfidenceBand {
    /// Parse a band name as produced by [`fmt::Display`].
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl fmt::Display for ConfidenceBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Risk level bucket for a delay probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Below 0.2.
    VeryLow,
    /// 0.2 to 0.4.
    Low,
    /// 0.4 to 0.6.
    Medium,
    /// 0.6 to 0.8.
    High,
    /// 0.8 and above.
    VeryHigh,
}

impl RiskLevel {
    /// Bucket a probability.
    #[must_use]
    pub fn from_probability(p: f64) -> Self {
        if p < 0.2 {
            Self::VeryLow
        } else if p < 0.4 {
            Self::Low
        } else if p < 0.6 {
            Self::Medium
        } else if p < 0.8 {
            Self::High
        } else {
            Self::VeryHigh
        }
    }

    /// Parse a level name as produced by [`fmt::Display`].
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "very_low" => Some(Self::VeryLow),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "very_high" => Some(Self::VeryHigh),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VeryLow => write!(f, "very_low"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::VeryHigh => write!(f, "very_high"),
        }
    }
}

/// A delay prediction for one flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    /// The flight predicted.
    pub key: FlightKey,
    /// Delay probability rounded to two decimals.
    pub probability: f64,
    /// Delay probability at full precision.
    pub raw_probability: f64,
    /// Effective live confidence times feature completeness, in `[0, 1]`,
    /// as of the read.
    pub confidence: f64,
    /// Confidence band.
    pub band: ConfidenceBand,
    /// Risk level bucket of `probability`.
    pub risk: RiskLevel,
    /// Human-readable delay factors.
    pub factors: Vec<String>,
    /// Name of the model that scored the flight.
    pub model: String,
    /// When the prediction was computed.
    pub computed_at: DateTime<Utc>,
    /// Timestamp of the live observation the prediction was computed
    /// against, `None` if there was none.
    pub basis_timestamp: Option<DateTime<Utc>>,
    /// Set when served although a newer live observation exists.
    #[serde(default)]
    pub stale: bool,
}

impl PredictionResult {
    fn into_stale(mut self) -> Self {
        self.stale = true;
        self
    }
}

/// Extra computations a caller starts when the one it waited on was
/// overtaken by a newer observation.
const MAX_RECOMPUTES: u32 = 1;

/// Round to two decimal places.
#[must_use]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Options for [`DelayEngine::get_prediction`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PredictionOptions {
    /// Serve a stale prediction instead of recomputing.
    pub allow_stale: bool,
    /// Stop waiting for a computation after this long. The computation
    /// itself continues for other callers.
    pub wait_timeout: Option<Duration>,
}

impl PredictionOptions {
    /// Options that accept a stale prediction.
    #[must_use]
    pub fn stale_ok() -> Self {
        Self {
            allow_stale: true,
            wait_timeout: None,
        }
    }
}

/// Lifecycle state of a flight's cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// No prediction cached and none in flight.
    Absent,
    /// A computation is in flight.
    Pending,
    /// Cached and computed against the latest live observation.
    Fresh,
    /// Cached, but a newer live observation has arrived.
    Stale,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Pending => write!(f, "pending"),
            Self::Fresh => write!(f, "fresh"),
            Self::Stale => write!(f, "stale"),
        }
    }
}

/// Counters describing engine activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Registered flights.
    pub registered_flights: usize,
    /// Flights with a live status.
    pub live_statuses: usize,
    /// Cached predictions.
    pub cached_predictions: usize,
    /// Cached predictions that are fresh.
    pub fresh_predictions: usize,
    /// Cached predictions that are stale.
    pub stale_predictions: usize,
    /// Computations currently in flight.
    pub in_flight: usize,
    /// Computations started.
    pub computations_started: u64,
    /// Requests answered from a fresh cache entry.
    pub cache_hits: u64,
    /// Requests that needed a computation.
    pub cache_misses: u64,
    /// Requests answered with a stale entry.
    pub stale_served: u64,
    /// Cache entries evicted.
    pub evictions: u64,
    /// Out-of-range model outputs clamped.
    pub scoring_anomalies: u64,
}

#[derive(Debug)]
struct EngineInner {
    config: EngineConfig,
    normalizer: Normalizer,
    registry: FlightRegistry,
    live: Arc<LiveStatusCache>,
    scoring: ScoringAdapter,
    cache: PredictionCache,
    coordinator: RequestCoordinator<FlightKey, PredictionResult>,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_served: AtomicU64,
}

/// Shared handle to the engine. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct DelayEngine {
    inner: Arc<EngineInner>,
}

impl DelayEngine {
    /// Create an engine around a scoring adapter.
    #[must_use]
    pub fn new(config: EngineConfig, scoring: ScoringAdapter) -> Self {
        info!(
            "Starting delay engine (model {}, freshness window {:?}, budget {:?})",
            scoring.model_name(),
            config.freshness_window(),
            config.compute_timeout()
        );
        let inner = EngineInner {
            live: Arc::new(LiveStatusCache::new(config.freshness_window())),
            cache: PredictionCache::new(config.max_cached_predictions),
            coordinator: RequestCoordinator::new(config.compute_timeout()),
            normalizer: Normalizer::new(),
            registry: FlightRegistry::new(),
            scoring,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_served: AtomicU64::new(0),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The live status cache, for pollers that write to it directly.
    #[must_use]
    pub fn live_status(&self) -> Arc<LiveStatusCache> {
        Arc::clone(&self.inner.live)
    }

    /// Normalize and register a flight.
    ///
    /// Registering a key again replaces its features and drops any cached
    /// prediction for it.
    ///
    /// # Errors
    ///
    /// Returns [`PredictionError::Validation`] if the record is incomplete or
    /// malformed.
    pub fn register_flight(&self, raw: &RawFlightRecord) -> Result<FlightKey, PredictionError> {
        let features = self.inner.normalizer.normalize(raw)?;
        let key = features.key.clone();
        if self.inner.registry.insert(features) {
            self.inner.cache.remove(&key);
            debug!("{}: features replaced", key);
        } else {
            debug!("{}: registered", key);
        }
        Ok(key)
    }

    /// Features of a registered flight.
    #[must_use]
    pub fn features(&self, key: &FlightKey) -> Option<Arc<FlightFeatures>> {
        self.inner.registry.resolve(key)
    }

    /// Keys of all registered flights.
    #[must_use]
    pub fn flights(&self) -> Vec<FlightKey> {
        self.inner.registry.keys()
    }

    /// Apply a live observation. Returns whether it was newer than the
    /// stored one.
    pub fn ingest(&self, key: &FlightKey, observation: LiveStatus) -> bool {
        let applied = self.inner.live.update(key, observation);
        if applied && self.inner.cache.classify(key, &self.inner.live) == Some(Freshness::Stale) {
            debug!("{}: cached prediction is now stale", key);
        }
        applied
    }

    /// Current lifecycle state of `key`'s cache entry.
    #[must_use]
    pub fn entry_state(&self, key: &FlightKey) -> EntryState {
        if self.inner.coordinator.is_pending(key) {
            return EntryState::Pending;
        }
        match self.inner.cache.classify(key, &self.inner.live) {
            Some(Freshness::Fresh) => EntryState::Fresh,
            Some(Freshness::Stale) => EntryState::Stale,
            None => EntryState::Absent,
        }
    }

    /// Delay prediction for `key` as of `as_of`.
    ///
    /// A fresh cached prediction is returned as is, apart from confidence
    /// and band, which are always aged to `as_of`. A stale one is returned,
    /// marked stale, if `options.allow_stale` is set. Otherwise the
    /// prediction is recomputed, sharing any computation already in flight
    /// for the same flight. A shared computation that finishes against an
    /// observation older than the latest one is retried once, then served
    /// marked stale. If recomputation times out or the model output is
    /// unusable, a cached prediction is served in its place when one exists.
    ///
    /// # Errors
    ///
    /// Returns [`PredictionError::FeatureUnavailable`] for an unregistered
    /// flight, [`PredictionError::Scoring`] for unusable model output, and
    /// [`PredictionError::Timeout`] when the computation budget or the
    /// caller's wait timeout is exceeded, in each case only if no cached
    /// prediction can be served instead.
    pub async fn get_prediction(
        &self,
        key: &FlightKey,
        as_of: DateTime<Utc>,
        options: PredictionOptions,
    ) -> Result<PredictionResult, PredictionError> {
        let inner = &self.inner;

        if let Some(cached) = inner.cache.get(key) {
            let live_at = inner.live.observed_at(key);
            match Freshness::of(cached.basis_timestamp, live_at) {
                Freshness::Fresh => {
                    inner.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("{}: cache hit", key);
                    return Ok(inner.present(cached, as_of));
                }
                Freshness::Stale if options.allow_stale => {
                    inner.stale_served.fetch_add(1, Ordering::Relaxed);
                    debug!("{}: serving stale prediction", key);
                    return Ok(inner.present(cached, as_of).into_stale());
                }
                Freshness::Stale => debug!("{}: stale, recomputing", key),
            }
        } else {
            debug!("{}: cache miss", key);
        }
        inner.misses.fetch_add(1, Ordering::Relaxed);

        let mut recomputed = 0;
        loop {
            let result = match self.coordinate(key, as_of, options).await {
                Ok(result) => result,
                Err(err)
                    if err.is_retryable() || matches!(err, PredictionError::Scoring { .. }) =>
                {
                    return inner
                        .fallback(key)
                        .map(|cached| inner.present(cached, as_of))
                        .ok_or(err);
                }
                Err(err) => return Err(err),
            };

            // A joined computation may have started before the latest
            // observation was applied.
            let live_at = inner.live.observed_at(key);
            if Freshness::of(result.basis_timestamp, live_at) == Freshness::Fresh {
                return Ok(inner.present(result, as_of));
            }
            if options.allow_stale || recomputed >= MAX_RECOMPUTES {
                inner.stale_served.fetch_add(1, Ordering::Relaxed);
                debug!("{}: computed against an older observation", key);
                return Ok(inner.present(result, as_of).into_stale());
            }
            recomputed += 1;
            debug!("{}: overtaken by a newer observation, recomputing", key);
        }
    }

    async fn coordinate(
        &self,
        key: &FlightKey,
        as_of: DateTime<Utc>,
        options: PredictionOptions,
    ) -> Result<PredictionResult, PredictionError> {
        let inner = &self.inner;
        let compute = {
            let inner = Arc::clone(inner);
            let key = key.clone();
            move || async move { inner.compute(&key, as_of).await }
        };
        match options.wait_timeout {
            Some(wait) => {
                inner
                    .coordinator
                    .dedup_compute_within(key, wait, compute)
                    .await
            }
            None => inner.coordinator.dedup_compute(key, compute).await,
        }
    }

    /// Counters describing engine activity.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        let (mut fresh, mut stale) = (0, 0);
        for result in inner.cache.snapshot() {
            match inner.cache.classify(&result.key, &inner.live) {
                Some(Freshness::Fresh) => fresh += 1,
                Some(Freshness::Stale) => stale += 1,
                None => {}
            }
        }
        EngineStats {
            registered_flights: inner.registry.len(),
            live_statuses: inner.live.len(),
            cached_predictions: inner.cache.len(),
            fresh_predictions: fresh,
            stale_predictions: stale,
            in_flight: inner.coordinator.in_flight(),
            computations_started: inner.coordinator.computations_started(),
            cache_hits: inner.hits.load(Ordering::Relaxed),
            cache_misses: inner.misses.load(Ordering::Relaxed),
            stale_served: inner.stale_served.load(Ordering::Relaxed),
            evictions: inner.cache.evictions(),
            scoring_anomalies: inner.scoring.anomaly_count(),
        }
    }

    /// Cached predictions, least recently used first, for persistence.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PredictionResult> {
        self.inner.cache.snapshot()
    }

    /// Load persisted predictions into the cache. Their freshness is
    /// decided against the live cache as it stands on each read.
    pub fn restore(&self, results: Vec<PredictionResult>) -> usize {
        let count = self.inner.cache.restore(results, &self.inner.live);
        info!("Restored {} cached predictions", count);
        count
    }
}

impl EngineInner {
    async fn compute(
        &self,
        key: &FlightKey,
        as_of: DateTime<Utc>,
    ) -> Result<PredictionResult, PredictionError> {
        let live = self.live.get(key);
        let basis = live.as_ref().map(|l| l.observed_at);

        // A computation that finished just before this one started may
        // already have produced the answer.
        if let Some(cached) = self.cache.peek(key) {
            if cached.basis_timestamp == basis {
                return Ok(cached);
            }
        }

        let features = self
            .registry
            .resolve(key)
            .ok_or_else(|| PredictionError::FeatureUnavailable {
                key: key.to_string(),
            })?;

        let raw = self.scoring.score(&features, live.as_ref()).await?;
        let (confidence, band) = self.confidence(&features, live.as_ref(), as_of);
        let probability = round2(raw);

        let result = PredictionResult {
            key: key.clone(),
            probability,
            raw_probability: raw,
            confidence,
            band,
            risk: RiskLevel::from_probability(probability),
            factors: delay_factors(&features, live.as_ref()),
            model: self.scoring.model_name().to_string(),
            computed_at: as_of,
            basis_timestamp: basis,
            stale: false,
        };
        debug!(
            "{}: computed p={:.2} ({}, {} confidence)",
            key, probability, result.risk, band
        );

        self.cache.insert(result.clone(), &self.live);
        Ok(result)
    }

    fn confidence(
        &self,
        features: &FlightFeatures,
        live: Option<&LiveStatus>,
        as_of: DateTime<Utc>,
    ) -> (f64, ConfidenceBand) {
        let Some(live) = live else {
            return (0.0, ConfidenceBand::Low);
        };
        let confidence = live.effective_confidence(as_of, self.config.freshness_window())
            * features.completeness();
        let band = if confidence >= self.config.high_confidence_threshold {
            ConfidenceBand::High
        } else if confidence >= self.config.medium_confidence_threshold {
            ConfidenceBand::Medium
        } else {
            ConfidenceBand::Low
        };
        (confidence, band)
    }

    /// Confidence and band as of the read, from the flight's current live
    /// status. A prediction made without live status stays at zero.
    fn present(&self, mut result: PredictionResult, as_of: DateTime<Utc>) -> PredictionResult {
        let Some(features) = self.registry.resolve(&result.key) else {
            return result;
        };
        let live = result
            .basis_timestamp
            .and_then(|_| self.live.get(&result.key));
        let (confidence, band) = self.confidence(&features, live.as_ref(), as_of);
        result.confidence = confidence;
        result.band = band;
        result
    }

    fn fallback(&self, key: &FlightKey) -> Option<PredictionResult> {
        let cached = self.cache.get(key)?;
        match Freshness::of(cached.basis_timestamp, self.live.observed_at(key)) {
            Freshness::Fresh => Some(cached),
            Freshness::Stale => {
                warn!("{}: recompute failed, serving stale prediction", key);
                self.stale_served.fetch_add(1, Ordering::Relaxed);
                Some(cached.into_stale())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live_status::FlightStatus;
    use crate::scoring::{FeatureVector, RuleBasedModel, ScoringModel};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn raw() -> RawFlightRecord {
        RawFlightRecord {
            flight: Some("CA1234".to_string()),
            origin: Some("PEK".to_string()),
            destination: Some("PVG".to_string()),
            departure_date: Some("2024-07-15".to_string()),
            departure_time: Some("18:30".to_string()),
            aircraft_type: Some("A321".to_string()),
            ..RawFlightRecord::default()
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 15, 9, minute, 0).unwrap()
    }

    fn engine() -> DelayEngine {
        DelayEngine::new(EngineConfig::default(), ScoringAdapter::default())
    }

    struct SlowModel {
        calls: Arc<AtomicUsize>,
        delay: Duration,
        output: f64,
    }

    #[async_trait]
    impl ScoringModel for SlowModel {
        fn name(&self) -> &str {
            "slow"
        }

        async fn predict(&self, _features: &FeatureVector) -> f64 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.output
        }
    }

    #[test]
    fn test_risk_level_buckets() {
        assert_eq!(RiskLevel::from_probability(0.0), RiskLevel::VeryLow);
        assert_eq!(RiskLevel::from_probability(0.19), RiskLevel::VeryLow);
        assert_eq!(RiskLevel::from_probability(0.2), RiskLevel::Low);
        assert_eq!(RiskLevel::from_probability(0.59), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_probability(0.6), RiskLevel::High);
        assert_eq!(RiskLevel::from_probability(1.0), RiskLevel::VeryHigh);
        for level in [RiskLevel::VeryLow, RiskLevel::High, RiskLevel::VeryHigh] {
            assert_eq!(RiskLevel::parse(&level.to_string()), Some(level));
        }
    }

    #[test]
    fn test_round2() {
        assert!((round2(0.126) - 0.13).abs() < f64::EPSILON);
        assert!((round2(1.0) - 1.0).abs() < f64::EPSILON);
        assert!(round2(0.004).abs() < f64::EPSILON);
    }

    #[test]
    fn test_register_flight() {
        let engine = engine();
        let key = engine.register_flight(&raw()).unwrap();
        assert_eq!(key.to_string(), "CA1234/2024-07-15/PEK-PVG");
        assert!(engine.features(&key).is_some());
        assert_eq!(engine.flights(), vec![key.clone()]);
        assert_eq!(engine.entry_state(&key), EntryState::Absent);
    }

    #[test]
    fn test_register_flight_rejects_invalid() {
        let engine = engine();
        let mut bad = raw();
        bad.origin = None;
        let err = engine.register_flight(&bad).unwrap_err();
        assert_eq!(err, PredictionError::missing("origin"));
    }

    #[tokio::test]
    async fn test_unknown_flight_is_feature_unavailable() {
        let engine = engine();
        let key = engine.register_flight(&raw()).unwrap();
        let mut other = key.clone();
        other.flight_number = "9999".to_string();

        let err = engine
            .get_prediction(&other, at(0), PredictionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PredictionError::FeatureUnavailable { .. }));
        assert!(!err.is_retryable());
        assert_eq!(engine.entry_state(&other), EntryState::Absent);
    }

    #[tokio::test]
    async fn test_prediction_without_live_status() {
        let engine = engine();
        let key = engine.register_flight(&raw()).unwrap();
        let result = engine
            .get_prediction(&key, at(0), PredictionOptions::default())
            .await
            .unwrap();

        assert_eq!(result.band, ConfidenceBand::Low);
        assert!(result.basis_timestamp.is_none());
        assert!((result.probability - round2(result.raw_probability)).abs() < f64::EPSILON);
        assert_eq!(result.model, "rules-v1");
        assert!(!result.stale);
        assert_eq!(engine.entry_state(&key), EntryState::Fresh);
    }

    #[tokio::test]
    async fn test_fresh_hit_is_identical() {
        let engine = engine();
        let key = engine.register_flight(&raw()).unwrap();
        let first = engine
            .get_prediction(&key, at(0), PredictionOptions::default())
            .await
            .unwrap();
        let second = engine
            .get_prediction(&key, at(5), PredictionOptions::default())
            .await
            .unwrap();
        assert_eq!(first, second);

        let stats = engine.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.computations_started, 1);
    }

    #[tokio::test]
    async fn test_live_update_makes_entry_stale() {
        let engine = engine();
        let key = engine.register_flight(&raw()).unwrap();
        let first = engine
            .get_prediction(&key, at(0), PredictionOptions::default())
            .await
            .unwrap();

        assert!(engine.ingest(
            &key,
            LiveStatus::new(FlightStatus::Boarding, Some(45), at(1), 0.9)
        ));
        assert_eq!(engine.entry_state(&key), EntryState::Stale);

        let stale = engine
            .get_prediction(&key, at(2), PredictionOptions::stale_ok())
            .await
            .unwrap();
        assert!(stale.stale);
        assert_eq!(stale.basis_timestamp, first.basis_timestamp);

        let fresh = engine
            .get_prediction(&key, at(2), PredictionOptions::default())
            .await
            .unwrap();
        assert!(!fresh.stale);
        assert_eq!(fresh.basis_timestamp, Some(at(1)));
        assert!(fresh.probability > first.probability);
        assert_eq!(fresh.band, ConfidenceBand::Medium);
        assert_eq!(engine.entry_state(&key), EntryState::Fresh);
        assert_eq!(engine.stats().stale_served, 1);
    }

    #[tokio::test]
    async fn test_aged_live_status_lowers_band() {
        let engine = engine();
        let key = engine.register_flight(&raw()).unwrap();
        engine.ingest(
            &key,
            LiveStatus::new(FlightStatus::Boarding, Some(45), at(0), 0.9),
        );
        // Three windows past freshness: 0.9 * 0.5^3 * completeness 0.8
        let late = Utc.with_ymd_and_hms(2024, 7, 15, 10, 0, 0).unwrap();
        let result = engine
            .get_prediction(&key, late, PredictionOptions::default())
            .await
            .unwrap();
        assert_eq!(result.band, ConfidenceBand::Low);
        assert!((result.confidence - 0.09).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cached_confidence_decays_on_read() {
        let engine = engine();
        let key = engine.register_flight(&raw()).unwrap();
        engine.ingest(
            &key,
            LiveStatus::new(FlightStatus::Boarding, Some(45), at(0), 1.0),
        );
        let first = engine
            .get_prediction(&key, at(1), PredictionOptions::default())
            .await
            .unwrap();
        assert_eq!(first.band, ConfidenceBand::High);

        let later = Utc.with_ymd_and_hms(2024, 7, 15, 15, 0, 0).unwrap();
        let aged = engine
            .get_prediction(&key, later, PredictionOptions::default())
            .await
            .unwrap();
        assert_eq!(aged.band, ConfidenceBand::Low);
        assert!(aged.confidence < 1e-3);
        assert_eq!(aged.probability.to_bits(), first.probability.to_bits());
        assert_eq!(aged.basis_timestamp, first.basis_timestamp);
        assert_eq!(aged.computed_at, first.computed_at);

        let stats = engine.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.computations_started, 1);
        // The cached copy keeps what was computed
        assert_eq!(engine.snapshot()[0].band, ConfidenceBand::High);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_joiner_recomputes_after_newer_observation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = SlowModel {
            calls: Arc::clone(&calls),
            delay: Duration::from_millis(300),
            output: 0.4,
        };
        let engine = DelayEngine::new(
            EngineConfig::default(),
            ScoringAdapter::new(Arc::new(model)),
        );
        let key = engine.register_flight(&raw()).unwrap();
        engine
            .get_prediction(&key, at(0), PredictionOptions::default())
            .await
            .unwrap();

        engine.ingest(
            &key,
            LiveStatus::new(FlightStatus::Boarding, Some(10), at(1), 0.9),
        );
        let early = {
            let engine = engine.clone();
            let key = key.clone();
            tokio::spawn(async move {
                engine
                    .get_prediction(&key, at(2), PredictionOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.entry_state(&key), EntryState::Pending);

        // Lands while the computation against at(1) is still running.
        engine.ingest(
            &key,
            LiveStatus::new(FlightStatus::Boarding, Some(40), at(3), 0.9),
        );
        let joined = engine
            .get_prediction(&key, at(4), PredictionOptions::default())
            .await
            .unwrap();
        assert!(!joined.stale);
        assert_eq!(joined.basis_timestamp, Some(at(3)));

        let early = early.await.unwrap().unwrap();
        assert!(!early.stale);
        assert_eq!(early.basis_timestamp, Some(at(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(engine.entry_state(&key), EntryState::Fresh);
    }

    #[tokio::test]
    async fn test_reregistering_drops_cached_prediction() {
        let engine = engine();
        let key = engine.register_flight(&raw()).unwrap();
        engine
            .get_prediction(&key, at(0), PredictionOptions::default())
            .await
            .unwrap();
        assert_eq!(engine.entry_state(&key), EntryState::Fresh);

        let mut updated = raw();
        updated.weather = Some("thunderstorm".to_string());
        engine.register_flight(&updated).unwrap();
        assert_eq!(engine.entry_state(&key), EntryState::Absent);
    }

    #[tokio::test]
    async fn test_wait_timeout_falls_back_to_stale_entry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = SlowModel {
            calls: Arc::clone(&calls),
            delay: Duration::from_millis(200),
            output: 0.4,
        };
        let engine = DelayEngine::new(
            EngineConfig::default(),
            ScoringAdapter::new(Arc::new(model)),
        );
        let key = engine.register_flight(&raw()).unwrap();
        let first = engine
            .get_prediction(&key, at(0), PredictionOptions::default())
            .await
            .unwrap();

        engine.ingest(
            &key,
            LiveStatus::new(FlightStatus::Boarding, Some(45), at(1), 0.9),
        );

        let options = PredictionOptions {
            allow_stale: false,
            wait_timeout: Some(Duration::from_millis(20)),
        };
        let served = engine.get_prediction(&key, at(2), options).await.unwrap();
        assert!(served.stale);
        assert_eq!(served.basis_timestamp, first.basis_timestamp);
        assert_eq!(engine.entry_state(&key), EntryState::Pending);

        // The abandoned computation still completes and refreshes the cache.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(engine.entry_state(&key), EntryState::Fresh);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_without_cache_is_error() {
        let config = EngineConfig {
            compute_timeout_ms: 20,
            ..EngineConfig::default()
        };
        let model = SlowModel {
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::from_secs(5),
            output: 0.4,
        };
        let engine = DelayEngine::new(config, ScoringAdapter::new(Arc::new(model)));
        let key = engine.register_flight(&raw()).unwrap();
        let err = engine
            .get_prediction(&key, at(0), PredictionOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(engine.stats().cached_predictions, 0);
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let engine = engine();
        let key = engine.register_flight(&raw()).unwrap();
        let result = engine
            .get_prediction(&key, at(0), PredictionOptions::default())
            .await
            .unwrap();

        let restored = DelayEngine::new(
            EngineConfig::default(),
            ScoringAdapter::new(Arc::new(RuleBasedModel)),
        );
        restored.register_flight(&raw()).unwrap();
        assert_eq!(restored.restore(engine.snapshot()), 1);
        assert_eq!(restored.entry_state(&key), EntryState::Fresh);
        let again = restored
            .get_prediction(&key, at(9), PredictionOptions::default())
            .await
            .unwrap();
        assert_eq!(again, result);
        assert_eq!(restored.stats().computations_started, 0);
    }
}
