//! Live status polling.
//!
//! A [`StatusSource`] fetches the latest observations for a set of flights
//! from wherever they come from. The [`Poller`] asks its source on a fixed
//! interval and pushes every observation through
//! [`DelayEngine::ingest`], which applies only those newer than what is
//! already known. Transport and cadence are the source's business; the
//! engine only relies on observation timestamps.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::engine::DelayEngine;
use crate::flight::FlightKey;
use crate::live_status::ObservationRecord;

/// Errors that can occur while polling a status source.
#[derive(Debug, Error)]
pub enum PollError {
    /// The source could not be reached or read.
    #[error("status source {source_name} unavailable: {message}")]
    Unavailable {
        /// Name of the source.
        source_name: String,
        /// What went wrong.
        message: String,
    },

    /// The source answered with data that could not be decoded.
    #[error("status source {source_name} returned malformed data: {message}")]
    Malformed {
        /// Name of the source.
        source_name: String,
        /// What could not be decoded.
        message: String,
    },
}

/// A provider of live flight status observations.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Short name of the source, for logs.
    fn name(&self) -> &str;

    /// Latest observations for any of `flights`. May return observations
    /// already seen; stale and duplicate ones are dropped on ingest.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read.
    async fn poll(&self, flights: &[FlightKey]) -> Result<Vec<ObservationRecord>, PollError>;
}

/// Reads observations from a JSON file, re-read on every poll.
///
/// The file holds an array of [`ObservationRecord`]s. Records for flights
/// not asked about are ignored.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    name: String,
}

impl FileSource {
    /// Create a source reading `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = format!("file:{}", path.display());
        Self { path, name }
    }
}

#[async_trait]
impl StatusSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&self, flights: &[FlightKey]) -> Result<Vec<ObservationRecord>, PollError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| PollError::Unavailable {
                source_name: self.name.clone(),
                message: e.to_string(),
            })?;
        let records: Vec<ObservationRecord> =
            serde_json::from_str(&content).map_err(|e| PollError::Malformed {
                source_name: self.name.clone(),
                message: e.to_string(),
            })?;
        Ok(records
            .into_iter()
            .filter(|r| flights.contains(&r.key))
            .collect())
    }
}

/// A handle to stop a running poller.
///
/// Cheap to clone; every clone shares the same signal.
#[derive(Debug, Clone, Default)]
pub struct PollerHandle {
    stop_signal: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl PollerHandle {
    /// Create a new handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the poller to stop after its current round.
    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    /// Check if the stop signal has been sent.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.stop_signal.load(Ordering::SeqCst)
    }
}

/// Outcome of one poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollRound {
    /// Observations returned by the source.
    pub received: usize,
    /// Observations that were newer than the stored ones.
    pub applied: Vec<ObservationRecord>,
}

/// Totals over a poller's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Rounds attempted.
    pub rounds: u64,
    /// Rounds that failed.
    pub errors: u64,
    /// Observations received.
    pub received: u64,
    /// Observations applied.
    pub applied: u64,
}

impl PollSummary {
    fn record(&mut self, round: &PollRound) {
        self.received += round.received as u64;
        self.applied += round.applied.len() as u64;
    }
}

/// Shortest interval between rounds.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Periodically feeds a [`StatusSource`] into a [`DelayEngine`].
pub struct Poller {
    engine: DelayEngine,
    source: Arc<dyn StatusSource>,
    interval: Duration,
    max_rounds: Option<u64>,
    handle: PollerHandle,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("source", &self.source.name())
            .field("interval", &self.interval)
            .field("max_rounds", &self.max_rounds)
            .finish_non_exhaustive()
    }
}

impl Poller {
    /// Create a poller for every flight registered with `engine`. An
    /// interval below [`MIN_INTERVAL`] is raised to it.
    #[must_use]
    pub fn new(engine: DelayEngine, source: Arc<dyn StatusSource>, interval: Duration) -> Self {
        Self {
            engine,
            source,
            interval: interval.max(MIN_INTERVAL),
            max_rounds: None,
            handle: PollerHandle::new(),
        }
    }

    /// Stop by itself after `rounds` polls.
    #[must_use]
    pub fn with_max_rounds(mut self, rounds: u64) -> Self {
        self.max_rounds = Some(rounds);
        self
    }

    /// A handle that stops this poller.
    #[must_use]
    pub fn handle(&self) -> PollerHandle {
        self.handle.clone()
    }

    /// Poll the source once and ingest what it returns.
    ///
    /// # Errors
    ///
    /// Returns the source's error; nothing is ingested in that case.
    pub async fn poll_once(&self) -> Result<PollRound, PollError> {
        let flights = self.engine.flights();
        if flights.is_empty() {
            return Ok(PollRound::default());
        }

        let records = self.source.poll(&flights).await?;
        let mut round = PollRound {
            received: records.len(),
            applied: Vec::new(),
        };
        for record in records {
            if self.engine.ingest(&record.key, record.status.clone()) {
                round.applied.push(record);
            }
        }
        debug!(
            "Polled {}: {} received, {} applied",
            self.source.name(),
            round.received,
            round.applied.len()
        );
        Ok(round)
    }

    fn rounds_done(&self, summary: &PollSummary) -> bool {
        self.max_rounds.is_some_and(|max| summary.rounds >= max)
    }

    /// Poll on the configured interval until stopped, calling `on_round`
    /// after every successful round.
    pub async fn run<F>(&self, mut on_round: F) -> PollSummary
    where
        F: FnMut(&PollRound),
    {
        info!(
            "Polling {} every {:?}",
            self.source.name(),
            self.interval
        );
        let mut summary = PollSummary::default();
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            if self.handle.should_stop() || self.rounds_done(&summary) {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                () = self.handle.wake.notified() => {}
            }
            if self.handle.should_stop() {
                break;
            }

            summary.rounds += 1;
            match self.poll_once().await {
                Ok(round) => {
                    summary.record(&round);
                    on_round(&round);
                }
                Err(e) => {
                    summary.errors += 1;
                    warn!("Poll failed: {}", e);
                }
            }

            if self.rounds_done(&summary) {
                break;
            }
        }

        info!(
            "Poller stopped after {} rounds ({} observations applied)",
            summary.rounds, summary.applied
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::flight::RawFlightRecord;
    use crate::live_status::{FlightStatus, LiveStatus};
    use crate::scoring::ScoringAdapter;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;

    /// Hands out one scripted batch per poll, then nothing.
    struct ScriptedSource {
        batches: Mutex<Vec<Result<Vec<ObservationRecord>, PollError>>>,
    }

    impl ScriptedSource {
        fn new(mut batches: Vec<Result<Vec<ObservationRecord>, PollError>>) -> Self {
            batches.reverse();
            Self {
                batches: Mutex::new(batches),
            }
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn poll(&self, _flights: &[FlightKey]) -> Result<Vec<ObservationRecord>, PollError> {
            self.batches.lock().unwrap().pop().unwrap_or(Ok(Vec::new()))
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 15, 9, minute, 0).unwrap()
    }

    fn engine_with_flight() -> (DelayEngine, FlightKey) {
        let engine = DelayEngine::new(EngineConfig::default(), ScoringAdapter::default());
        let key = engine
            .register_flight(&RawFlightRecord {
                flight: Some("MU5101".to_string()),
                origin: Some("PVG".to_string()),
                destination: Some("PEK".to_string()),
                departure_date: Some("2024-07-15".to_string()),
                departure_time: Some("08:00".to_string()),
                ..RawFlightRecord::default()
            })
            .unwrap();
        (engine, key)
    }

    fn record(key: &FlightKey, minute: u32, delay: i64) -> ObservationRecord {
        ObservationRecord {
            key: key.clone(),
            status: LiveStatus::new(FlightStatus::Boarding, Some(delay), at(minute), 0.9),
        }
    }

    #[test]
    fn test_handle_stop_is_shared() {
        let handle = PollerHandle::new();
        let clone = handle.clone();
        assert!(!clone.should_stop());
        handle.stop();
        assert!(clone.should_stop());
    }

    #[tokio::test]
    async fn test_poll_once_applies_only_newer() {
        let (engine, key) = engine_with_flight();
        let source = ScriptedSource::new(vec![
            Ok(vec![record(&key, 10, 45), record(&key, 5, 0)]),
            Ok(vec![record(&key, 10, 45)]),
        ]);
        let poller = Poller::new(engine.clone(), Arc::new(source), Duration::from_secs(60));

        let first = poller.poll_once().await.unwrap();
        assert_eq!(first.received, 2);
        assert_eq!(first.applied, vec![record(&key, 10, 45)]);

        let second = poller.poll_once().await.unwrap();
        assert_eq!(second.received, 1);
        assert!(second.applied.is_empty());

        assert_eq!(engine.live_status().observed_at(&key), Some(at(10)));
    }

    #[tokio::test]
    async fn test_run_stops_after_max_rounds_and_counts_errors() {
        let (engine, key) = engine_with_flight();
        let source = ScriptedSource::new(vec![
            Ok(vec![record(&key, 1, 5)]),
            Err(PollError::Unavailable {
                source_name: "scripted".to_string(),
                message: "connection refused".to_string(),
            }),
            Ok(vec![record(&key, 2, 20)]),
        ]);
        let poller = Poller::new(engine.clone(), Arc::new(source), Duration::from_millis(5))
            .with_max_rounds(3);

        let mut seen = 0;
        let summary = poller.run(|round| seen += round.applied.len()).await;
        assert_eq!(summary.rounds, 3);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.applied, 2);
        assert_eq!(seen, 2);
        assert_eq!(
            engine.live_status().get(&key).unwrap().delay_minutes,
            Some(20)
        );
    }

    #[tokio::test]
    async fn test_zero_max_rounds_never_polls() {
        let (engine, key) = engine_with_flight();
        let source = ScriptedSource::new(vec![Ok(vec![record(&key, 1, 5)])]);
        let poller = Poller::new(engine.clone(), Arc::new(source), Duration::from_millis(5))
            .with_max_rounds(0);

        let summary = poller.run(|_| {}).await;
        assert_eq!(summary, PollSummary::default());
        assert!(engine.live_status().get(&key).is_none());
    }

    #[tokio::test]
    async fn test_zero_interval_is_raised() {
        let (engine, key) = engine_with_flight();
        let source = ScriptedSource::new(vec![
            Ok(vec![record(&key, 1, 5)]),
            Ok(vec![record(&key, 2, 15)]),
        ]);
        let poller =
            Poller::new(engine.clone(), Arc::new(source), Duration::ZERO).with_max_rounds(2);

        let summary = tokio::time::timeout(Duration::from_secs(2), poller.run(|_| {}))
            .await
            .unwrap();
        assert_eq!(summary.rounds, 2);
        assert_eq!(summary.applied, 2);
        assert_eq!(engine.live_status().observed_at(&key), Some(at(2)));
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let (engine, _key) = engine_with_flight();
        let poller = Arc::new(Poller::new(
            engine,
            Arc::new(ScriptedSource::new(Vec::new())),
            Duration::from_secs(3600),
        ));
        let handle = poller.handle();

        let task = {
            let poller = Arc::clone(&poller);
            tokio::spawn(async move { poller.run(|_| {}).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop();

        let summary = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        // The interval's immediate first tick ran one round.
        assert_eq!(summary.rounds, 1);
    }

    #[tokio::test]
    async fn test_file_source() {
        let (_engine, key) = engine_with_flight();
        let mut other = key.clone();
        other.flight_number = "9999".to_string();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let records = vec![record(&key, 1, 5), record(&other, 1, 5)];
        std::fs::write(&path, serde_json::to_string(&records).unwrap()).unwrap();

        let source = FileSource::new(&path);
        let polled = source.poll(std::slice::from_ref(&key)).await.unwrap();
        assert_eq!(polled, vec![record(&key, 1, 5)]);

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            source.poll(&[key]).await,
            Err(PollError::Malformed { .. })
        ));

        let missing = FileSource::new(dir.path().join("absent.json"));
        assert!(matches!(
            missing.poll(&[]).await,
            Err(PollError::Unavailable { .. })
        ));
    }

    #[test]
    fn test_observation_record_json_shape() {
        let (_engine, key) = engine_with_flight();
        let json = serde_json::to_value(record(&key, 1, 5)).unwrap();
        assert_eq!(json["key"]["carrier"], "MU");
        assert_eq!(json["status"], "boarding");
        assert_eq!(json["delay_minutes"], 5);
    }
}
