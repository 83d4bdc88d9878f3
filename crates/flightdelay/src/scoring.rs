//! Scoring adapter around an opaque delay-probability model.
//!
//! The model is any [`ScoringModel`]: a pure function from a fixed-shape
//! [`FeatureVector`] to a probability. The [`ScoringAdapter`] is the only
//! caller of the model. It builds the vector, calls the model once (never
//! retrying) and validates the output. Non-finite output is a
//! [`PredictionError::Scoring`]; finite output outside `[0, 1]` is clamped and
//! reported as an anomaly.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::PredictionError;
use crate::flight::{AircraftClass, FlightFeatures, RouteTraffic, SeasonBucket, WeatherRisk};
use crate::live_status::{FlightStatus, LiveStatus};

/// Number of numeric features handed to models that want a flat vector.
pub const FEATURE_COUNT: usize = 13;

/// Model input: flight features plus the live signal, in a fixed shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    /// Hour of scheduled departure, 0-23.
    pub departure_hour: u32,
    /// Day of week of scheduled departure.
    pub day_of_week: Weekday,
    /// Travel season bucket.
    pub season: SeasonBucket,
    /// Aircraft family.
    pub aircraft: AircraftClass,
    /// Route distance in kilometres.
    pub distance_km: Option<f64>,
    /// Historical on-time rate for carrier and route.
    pub historical_on_time_rate: Option<f64>,
    /// Route congestion bucket.
    pub route_traffic: RouteTraffic,
    /// Weather risk at the origin.
    pub weather_risk: WeatherRisk,
    /// Fraction of optional features that are known.
    pub completeness: f64,
    /// Latest live status, if any.
    pub live_status: Option<FlightStatus>,
    /// Latest reported delay in minutes, if any.
    pub live_delay_minutes: Option<i64>,
    /// Raw source confidence of the live status, zero without one.
    pub live_confidence: f64,
}

impl FeatureVector {
    /// Assemble the vector for a flight and its latest live status.
    #[must_use]
    pub fn build(features: &FlightFeatures, live: Option<&LiveStatus>) -> Self {
        Self {
            departure_hour: features.scheduled_departure.hour(),
            day_of_week: features.day_of_week,
            season: features.season,
            aircraft: features.aircraft,
            distance_km: features.distance_km,
            historical_on_time_rate: features.historical_on_time_rate,
            route_traffic: features.route_traffic,
            weather_risk: features.weather_risk,
            completeness: features.completeness(),
            live_status: live.map(|l| l.status),
            live_delay_minutes: live.and_then(|l| l.delay_minutes),
            live_confidence: live.map_or(0.0, |l| l.confidence),
        }
    }

    /// Numeric encoding for models that consume a flat array.
    ///
    /// Unknown values encode as `-1` (categorical and rates) or `0`
    /// (distance, delay) with the delay presence flag at index 11.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_array(&self) -> [f64; FEATURE_COUNT] {
        [
            f64::from(self.departure_hour),
            f64::from(self.day_of_week.num_days_from_monday()),
            season_ordinal(self.season),
            aircraft_ordinal(self.aircraft),
            self.distance_km.unwrap_or(0.0),
            self.historical_on_time_rate.unwrap_or(-1.0),
            route_ordinal(self.route_traffic),
            weather_ordinal(self.weather_risk),
            self.completeness,
            self.live_status.map_or(-1.0, |s| f64::from(s.ordinal())),
            self.live_delay_minutes.unwrap_or(0) as f64,
            if self.live_delay_minutes.is_some() { 1.0 } else { 0.0 },
            self.live_confidence,
        ]
    }
}

fn season_ordinal(season: SeasonBucket) -> f64 {
    match season {
        SeasonBucket::Regular => 0.0,
        SeasonBucket::SpringFestival => 1.0,
        SeasonBucket::LabourDay => 2.0,
        SeasonBucket::Summer => 3.0,
        SeasonBucket::NationalDay => 4.0,
    }
}

fn aircraft_ordinal(aircraft: AircraftClass) -> f64 {
    match aircraft {
        AircraftClass::Unknown => -1.0,
        AircraftClass::Regional => 0.0,
        AircraftClass::NarrowBody => 1.0,
        AircraftClass::WideBody => 2.0,
    }
}

fn route_ordinal(route: RouteTraffic) -> f64 {
    match route {
        RouteTraffic::Unknown => -1.0,
        RouteTraffic::Regular => 0.0,
        RouteTraffic::TrunkReverse => 1.0,
        RouteTraffic::Trunk => 2.0,
    }
}

fn weather_ordinal(weather: WeatherRisk) -> f64 {
    match weather {
        WeatherRisk::Unknown => -1.0,
        WeatherRisk::Low => 0.0,
        WeatherRisk::Moderate => 1.0,
        WeatherRisk::High => 2.0,
        WeatherRisk::Severe => 3.0,
    }
}

/// An externally supplied delay-probability model.
///
/// Implementations must behave as pure functions of their input: no state
/// that changes the answer, no side effects. The call is async so that models
/// served out of process fit behind the same contract.
#[async_trait]
pub trait ScoringModel: Send + Sync {
    /// Short identifier of the model, reported with every prediction.
    fn name(&self) -> &str;

    /// Probability that the flight is delayed. Expected in `[0, 1]`.
    async fn predict(&self, features: &FeatureVector) -> f64;
}

/// Weighted rule model built from long-run delay statistics.
///
/// A historical prior (carrier/route history, time of day, weekday, season,
/// route congestion, weather) is blended with the live signal in proportion
/// to the live source's confidence.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedModel;

impl RuleBasedModel {
    const BASE: f64 = 0.15;
    const HISTORY_WEIGHT: f64 = 0.55;
    const TIME_WEIGHT: f64 = 0.20;
    const SEASON_WEIGHT: f64 = 0.15;
    const ROUTE_WEIGHT: f64 = 0.10;
    const DEFAULT_ON_TIME_RATE: f64 = 0.80;
    /// Delay in minutes at which a flight counts as delayed.
    const DELAY_THRESHOLD_MINUTES: f64 = 15.0;
    const DELAY_SPREAD_MINUTES: f64 = 5.0;

    /// The prior before any live signal, clamped to `[0.05, 0.95]`.
    #[must_use]
    pub fn prior(features: &FeatureVector) -> f64 {
        let on_time = features
            .historical_on_time_rate
            .unwrap_or(Self::DEFAULT_ON_TIME_RATE);

        let p = Self::BASE
            + (1.0 - on_time) * Self::HISTORY_WEIGHT
            + time_factor(features.departure_hour, features.day_of_week) * Self::TIME_WEIGHT
            + season_factor(features.season) * Self::SEASON_WEIGHT
            + route_factor(features.route_traffic) * Self::ROUTE_WEIGHT
            + weather_factor(features.weather_risk);

        p.clamp(0.05, 0.95)
    }

    /// Probability implied by the live signal alone, if it carries one.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn live_signal(features: &FeatureVector) -> Option<f64> {
        if features.live_status == Some(FlightStatus::Cancelled) {
            return Some(1.0);
        }
        features.live_delay_minutes.map(|delay| {
            let x = (delay as f64 - Self::DELAY_THRESHOLD_MINUTES) / Self::DELAY_SPREAD_MINUTES;
            1.0 / (1.0 + (-x).exp())
        })
    }
}

#[async_trait]
impl ScoringModel for RuleBasedModel {
    fn name(&self) -> &str {
        "rules-v1"
    }

    async fn predict(&self, features: &FeatureVector) -> f64 {
        let prior = Self::prior(features);
        match Self::live_signal(features) {
            Some(signal) => {
                let c = features.live_confidence;
                (1.0 - c) * prior + c * signal
            }
            None => prior,
        }
    }
}

fn time_factor(hour: u32, weekday: Weekday) -> f64 {
    let mut factor = match hour {
        7..=9 => 0.25,
        17..=19 => 0.20,
        0..=5 => -0.10,
        _ => 0.0,
    };
    if matches!(weekday, Weekday::Fri | Weekday::Sat | Weekday::Sun) {
        factor += 0.15;
    }
    factor
}

fn season_factor(season: SeasonBucket) -> f64 {
    match season {
        SeasonBucket::SpringFestival | SeasonBucket::LabourDay => 0.20,
        SeasonBucket::Summer => 0.15,
        SeasonBucket::NationalDay => 0.25,
        SeasonBucket::Regular => 0.0,
    }
}

fn route_factor(route: RouteTraffic) -> f64 {
    match route {
        RouteTraffic::Trunk => 0.15,
        RouteTraffic::TrunkReverse => 0.10,
        RouteTraffic::Regular | RouteTraffic::Unknown => 0.05,
    }
}

fn weather_factor(weather: WeatherRisk) -> f64 {
    match weather {
        WeatherRisk::Low | WeatherRisk::Unknown => 0.0,
        WeatherRisk::Moderate => 0.05,
        WeatherRisk::High => 0.15,
        WeatherRisk::Severe => 0.30,
    }
}

/// Human-readable reasons a flight is at risk of delay.
#[must_use]
pub fn delay_factors(features: &FlightFeatures, live: Option<&LiveStatus>) -> Vec<String> {
    let mut factors = Vec::new();

    if let Some(live) = live {
        match (live.status, live.delay_minutes) {
            (FlightStatus::Cancelled, _) => factors.push("flight reported cancelled".to_string()),
            (status, Some(delay)) if delay > 0 => {
                factors.push(format!("{status}, reported {delay} min late"));
            }
            _ => {}
        }
    }
    if let Some(rate) = features.historical_on_time_rate {
        if rate < 0.78 {
            factors.push(format!(
                "low historical on-time rate ({:.0}%)",
                rate * 100.0
            ));
        }
    }
    match features.scheduled_departure.hour() {
        7..=9 => factors.push("morning peak departure".to_string()),
        17..=19 => factors.push("evening peak departure".to_string()),
        _ => {}
    }
    match features.season {
        SeasonBucket::SpringFestival => factors.push("Spring Festival travel rush".to_string()),
        SeasonBucket::Summer => factors.push("summer travel peak".to_string()),
        SeasonBucket::NationalDay => factors.push("National Day golden week".to_string()),
        SeasonBucket::LabourDay => factors.push("Labour Day holiday".to_string()),
        SeasonBucket::Regular => {}
    }
    if matches!(
        features.day_of_week,
        Weekday::Fri | Weekday::Sat | Weekday::Sun
    ) {
        factors.push("weekend passenger volume".to_string());
    }
    if features.route_traffic == RouteTraffic::Trunk {
        factors.push("busy trunk route".to_string());
    }
    if matches!(features.weather_risk, WeatherRisk::High | WeatherRisk::Severe) {
        factors.push(format!("{:?} weather risk at origin", features.weather_risk).to_lowercase());
    }
    if factors.is_empty() {
        factors.push("normal operating conditions".to_string());
    }
    factors
}

/// Validating wrapper around a [`ScoringModel`].
#[derive(Clone)]
pub struct ScoringAdapter {
    model: Arc<dyn ScoringModel>,
    anomalies: Arc<AtomicU64>,
}

impl fmt::Debug for ScoringAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScoringAdapter")
            .field("model", &self.model.name())
            .field("anomalies", &self.anomaly_count())
            .finish()
    }
}

impl Default for ScoringAdapter {
    fn default() -> Self {
        Self::new(Arc::new(RuleBasedModel))
    }
}

impl ScoringAdapter {
    /// Wrap a model.
    #[must_use]
    pub fn new(model: Arc<dyn ScoringModel>) -> Self {
        Self {
            model,
            anomalies: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Name of the wrapped model.
    #[must_use]
    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Number of out-of-range outputs clamped so far.
    #[must_use]
    pub fn anomaly_count(&self) -> u64 {
        self.anomalies.load(Ordering::Relaxed)
    }

    /// Score a flight against its latest live status.
    ///
    /// # Errors
    ///
    /// Returns [`PredictionError::Scoring`] if the model output is NaN or
    /// infinite.
    pub async fn score(
        &self,
        features: &FlightFeatures,
        live: Option<&LiveStatus>,
    ) -> Result<f64, PredictionError> {
        let vector = FeatureVector::build(features, live);
        let raw = self.model.predict(&vector).await;
        trace!("{}: model {} returned {}", features.key, self.model.name(), raw);
        self.validate(&features.key.to_string(), raw)
    }

    fn validate(&self, key: &str, raw: f64) -> Result<f64, PredictionError> {
        if !raw.is_finite() {
            return Err(PredictionError::scoring(format!(
                "model {} returned non-finite probability {raw} for {key}",
                self.model.name()
            )));
        }
        if (0.0..=1.0).contains(&raw) {
            return Ok(raw);
        }

        let clamped = raw.clamp(0.0, 1.0);
        self.anomalies.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Scoring anomaly: model {} returned {} for {}, clamped to {}",
            self.model.name(),
            raw,
            key,
            clamped
        );
        Ok(clamped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::Normalizer;
    use crate::flight::RawFlightRecord;
    use chrono::{TimeZone, Utc};

    struct FixedModel(f64);

    #[async_trait]
    impl ScoringModel for FixedModel {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn predict(&self, _features: &FeatureVector) -> f64 {
            self.0
        }
    }

    fn features() -> FlightFeatures {
        let raw = RawFlightRecord {
            flight: Some("CA1234".to_string()),
            origin: Some("PEK".to_string()),
            destination: Some("PVG".to_string()),
            departure_date: Some("2024-07-15".to_string()),
            departure_time: Some("18:30".to_string()),
            aircraft_type: Some("A321".to_string()),
            ..RawFlightRecord::default()
        };
        Normalizer::new().normalize(&raw).unwrap()
    }

    fn live(status: FlightStatus, delay: Option<i64>, confidence: f64) -> LiveStatus {
        LiveStatus::new(
            status,
            delay,
            Utc.with_ymd_and_hms(2024, 7, 15, 9, 0, 0).unwrap(),
            confidence,
        )
    }

    #[test]
    fn test_feature_vector_shape() {
        let v = FeatureVector::build(&features(), None);
        let a = v.as_array();
        assert_eq!(a.len(), FEATURE_COUNT);
        assert!((a[0] - 18.0).abs() < f64::EPSILON);
        assert!((a[9] + 1.0).abs() < f64::EPSILON);
        assert!(a[11].abs() < f64::EPSILON);
        assert!(a[12].abs() < f64::EPSILON);

        let l = live(FlightStatus::Boarding, Some(45), 0.9);
        let a = FeatureVector::build(&features(), Some(&l)).as_array();
        assert!((a[9] - 1.0).abs() < f64::EPSILON);
        assert!((a[10] - 45.0).abs() < f64::EPSILON);
        assert!((a[11] - 1.0).abs() < f64::EPSILON);
        assert!((a[12] - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_prior_in_range() {
        let v = FeatureVector::build(&features(), None);
        let p = RuleBasedModel::prior(&v);
        assert!((0.05..=0.95).contains(&p));
    }

    #[test]
    fn test_prior_evening_summer_trunk() {
        // on-time 0.7925, evening peak on a Monday, summer, trunk route
        let v = FeatureVector::build(&features(), None);
        let expected = 0.15 + 0.2075 * 0.55 + 0.20 * 0.20 + 0.15 * 0.15 + 0.15 * 0.10;
        assert!((RuleBasedModel::prior(&v) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_live_signal() {
        let mut v = FeatureVector::build(&features(), None);
        assert!(RuleBasedModel::live_signal(&v).is_none());

        v.live_delay_minutes = Some(45);
        assert!(RuleBasedModel::live_signal(&v).unwrap() > 0.99);

        v.live_delay_minutes = Some(15);
        assert!((RuleBasedModel::live_signal(&v).unwrap() - 0.5).abs() < 1e-12);

        v.live_delay_minutes = Some(0);
        assert!(RuleBasedModel::live_signal(&v).unwrap() < 0.05);

        v.live_status = Some(FlightStatus::Cancelled);
        assert!((RuleBasedModel::live_signal(&v).unwrap() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_rule_model_blends_by_confidence() {
        let f = features();
        let prior = RuleBasedModel
            .predict(&FeatureVector::build(&f, None))
            .await;

        let late = live(FlightStatus::Boarding, Some(45), 0.9);
        let p_late = RuleBasedModel
            .predict(&FeatureVector::build(&f, Some(&late)))
            .await;
        assert!(p_late > prior);
        assert!(p_late > 0.9);

        let unsure = live(FlightStatus::Boarding, Some(45), 0.0);
        let p_unsure = RuleBasedModel
            .predict(&FeatureVector::build(&f, Some(&unsure)))
            .await;
        assert!((p_unsure - prior).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_adapter_passes_valid_output() {
        let adapter = ScoringAdapter::new(Arc::new(FixedModel(0.42)));
        let p = adapter.score(&features(), None).await.unwrap();
        assert!((p - 0.42).abs() < f64::EPSILON);
        assert_eq!(adapter.anomaly_count(), 0);
        assert_eq!(adapter.model_name(), "fixed");
    }

    #[tokio::test]
    async fn test_adapter_clamps_and_counts_anomaly() {
        crate::logging::init_test_logging();
        let adapter = ScoringAdapter::new(Arc::new(FixedModel(1.2)));
        let p = adapter.score(&features(), None).await.unwrap();
        assert!((p - 1.0).abs() < f64::EPSILON);
        assert_eq!(adapter.anomaly_count(), 1);

        let adapter = ScoringAdapter::new(Arc::new(FixedModel(-0.3)));
        let p = adapter.score(&features(), None).await.unwrap();
        assert!(p.abs() < f64::EPSILON);
        assert_eq!(adapter.anomaly_count(), 1);
    }

    #[tokio::test]
    async fn test_adapter_rejects_non_finite() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let adapter = ScoringAdapter::new(Arc::new(FixedModel(bad)));
            let err = adapter.score(&features(), None).await.unwrap_err();
            assert!(matches!(err, PredictionError::Scoring { .. }));
            assert_eq!(adapter.anomaly_count(), 0);
        }
    }

    #[test]
    fn test_delay_factors() {
        let f = features();
        let factors = delay_factors(&f, None);
        assert!(factors.iter().any(|s| s.contains("evening peak")));
        assert!(factors.iter().any(|s| s.contains("summer")));
        assert!(factors.iter().any(|s| s.contains("trunk")));

        let l = live(FlightStatus::Boarding, Some(45), 0.9);
        let factors = delay_factors(&f, Some(&l));
        assert_eq!(factors[0], "boarding, reported 45 min late");

        let l = live(FlightStatus::Cancelled, None, 0.9);
        assert_eq!(delay_factors(&f, Some(&l))[0], "flight reported cancelled");
    }

    #[test]
    fn test_delay_factors_default() {
        let raw = RawFlightRecord {
            flight: Some("MF8001".to_string()),
            origin: Some("XIY".to_string()),
            destination: Some("TAO".to_string()),
            departure_date: Some("2024-03-12".to_string()),
            departure_time: Some("11:00".to_string()),
            ..RawFlightRecord::default()
        };
        let f = Normalizer::new().normalize(&raw).unwrap();
        assert_eq!(delay_factors(&f, None), vec!["normal operating conditions"]);
    }
}
