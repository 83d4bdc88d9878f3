//! Flight record normalization.
//!
//! The [`Normalizer`] validates a [`RawFlightRecord`] and derives the
//! [`FlightFeatures`] the scoring model consumes. It is side-effect free and
//! deterministic: the same record always yields the same features.
//!
//! Unfamiliar aircraft, airports and weather conditions never fail
//! normalization; they land in the "unknown" bucket of the relevant feature.
//! Only a missing or malformed identity or departure time is rejected.
//!
//! The [`FlightRegistry`] keeps the features of every registered flight so the
//! engine can resolve a [`FlightKey`] back to its features at scoring time.

pub mod reference;

use std::sync::Arc;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use dashmap::DashMap;
use regex::Regex;
use tracing::debug;

use crate::error::PredictionError;
use crate::flight::{
    AircraftClass, FlightFeatures, FlightKey, RawFlightRecord, SeasonBucket, WeatherRisk,
};

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMATS: &[&str] = &["%H:%M", "%H:%M:%S"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%dT%H:%M:%S",
];

/// Validates raw flight records and derives their features.
#[derive(Debug)]
pub struct Normalizer {
    designator: Regex,
    carrier: Regex,
    flight_number: Regex,
    airport: Regex,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    /// Create a normalizer with the built-in identifier patterns.
    ///
    /// # Panics
    ///
    /// Panics if a built-in pattern fails to compile, which would be a bug.
    #[must_use]
    pub fn new() -> Self {
        Self {
            designator: Regex::new(r"^([A-Z0-9]{2})([0-9]{1,4}[A-Z]?)$")
                .expect("Invalid designator pattern"),
            carrier: Regex::new(r"^[A-Z0-9]{2}$").expect("Invalid carrier pattern"),
            flight_number: Regex::new(r"^[0-9]{1,4}[A-Z]?$")
                .expect("Invalid flight number pattern"),
            airport: Regex::new(r"^[A-Z]{3}$").expect("Invalid airport pattern"),
        }
    }

    /// Normalize a raw record into a feature snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`PredictionError::Validation`] naming the field when the
    /// flight identity or scheduled departure is missing or malformed.
    pub fn normalize(&self, raw: &RawFlightRecord) -> Result<FlightFeatures, PredictionError> {
        let (carrier, flight_number) = self.resolve_designator(raw)?;

        let origin = self.airport_code("origin", raw.origin.as_deref())?;
        let destination = self.airport_code("destination", raw.destination.as_deref())?;
        if origin == destination {
            return Err(PredictionError::invalid(
                "destination",
                "must differ from origin",
            ));
        }

        let date = raw
            .departure_date
            .as_deref()
            .map(|d| parse_date("departure_date", d))
            .transpose()?;
        let departure_time = required("departure_time", raw.departure_time.as_deref())?;
        let scheduled_departure = parse_schedule("departure_time", departure_time, date)?;

        if let Some(date) = date {
            if scheduled_departure.date() != date {
                return Err(PredictionError::invalid(
                    "departure_time",
                    format!("date does not match departure_date {date}"),
                ));
            }
        }

        let scheduled_arrival = raw
            .arrival_time
            .as_deref()
            .map(|t| parse_arrival(t, scheduled_departure))
            .transpose()?;

        let distance_km = match raw.distance_km {
            Some(km) if km.is_finite() && km > 0.0 => Some(km),
            Some(km) => {
                return Err(PredictionError::invalid(
                    "distance_km",
                    format!("must be a positive number, got {km}"),
                ))
            }
            None => reference::great_circle_km(&origin, &destination),
        };

        let key = FlightKey::new(
            carrier,
            flight_number,
            scheduled_departure.date(),
            origin,
            destination,
        );

        let features = FlightFeatures {
            aircraft: raw
                .aircraft_type
                .as_deref()
                .map_or(AircraftClass::Unknown, reference::aircraft_class),
            distance_km,
            day_of_week: scheduled_departure.weekday(),
            season: season_bucket(scheduled_departure.date()),
            historical_on_time_rate: reference::historical_on_time_rate(
                &key.carrier,
                &key.origin,
                &key.destination,
            ),
            route_traffic: reference::route_traffic(&key.origin, &key.destination),
            weather_risk: raw
                .weather
                .as_deref()
                .map_or(WeatherRisk::Unknown, reference::weather_risk),
            scheduled_departure,
            scheduled_arrival,
            key,
        };

        debug!(
            "Normalized {} (completeness {:.2})",
            features.key,
            features.completeness()
        );
        Ok(features)
    }

    /// Validate just a flight identity, for looking up flights already
    /// registered.
    ///
    /// # Errors
    ///
    /// Returns [`PredictionError::Validation`] for a malformed designator,
    /// date or airport code.
    pub fn key(
        &self,
        flight: &str,
        departure_date: &str,
        origin: &str,
        destination: &str,
    ) -> Result<FlightKey, PredictionError> {
        let raw = RawFlightRecord {
            flight: Some(flight.to_string()),
            ..RawFlightRecord::default()
        };
        let (carrier, flight_number) = self.resolve_designator(&raw)?;
        let date = parse_date("departure_date", departure_date)?;
        let origin = self.airport_code("origin", Some(origin))?;
        let destination = self.airport_code("destination", Some(destination))?;
        Ok(FlightKey::new(
            carrier,
            flight_number,
            date,
            origin,
            destination,
        ))
    }

    fn resolve_designator(
        &self,
        raw: &RawFlightRecord,
    ) -> Result<(String, String), PredictionError> {
        if let Some(flight) = raw.flight.as_deref() {
            let flight = canonical(flight);
            let caps = self.designator.captures(&flight).ok_or_else(|| {
                PredictionError::invalid("flight", format!("'{flight}' is not a flight designator"))
            })?;
            return Ok((caps[1].to_string(), caps[2].to_string()));
        }

        let carrier = canonical(required("carrier", raw.carrier.as_deref())?);
        if !self.carrier.is_match(&carrier) {
            return Err(PredictionError::invalid(
                "carrier",
                format!("'{carrier}' is not a 2-character IATA carrier code"),
            ));
        }

        let number = canonical(required("flight_number", raw.flight_number.as_deref())?);
        if !self.flight_number.is_match(&number) {
            return Err(PredictionError::invalid(
                "flight_number",
                format!("'{number}' is not a flight number"),
            ));
        }

        Ok((carrier, number))
    }

    fn airport_code(
        &self,
        field: &'static str,
        value: Option<&str>,
    ) -> Result<String, PredictionError> {
        let code = canonical(required(field, value)?);
        if self.airport.is_match(&code) {
            Ok(code)
        } else {
            Err(PredictionError::invalid(
                field,
                format!("'{code}' is not a 3-letter IATA airport code"),
            ))
        }
    }
}

/// Map a departure date onto its travel season bucket.
#[must_use]
pub fn season_bucket(date: NaiveDate) -> SeasonBucket {
    match (date.month(), date.day()) {
        (1 | 2, _) => SeasonBucket::SpringFestival,
        (5, 1..=5) => SeasonBucket::LabourDay,
        (7 | 8, _) => SeasonBucket::Summer,
        (10, 1..=7) => SeasonBucket::NationalDay,
        _ => SeasonBucket::Regular,
    }
}

fn canonical(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

fn required<'a>(field: &'static str, value: Option<&'a str>) -> Result<&'a str, PredictionError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(PredictionError::missing(field)),
    }
}

fn parse_date(field: &'static str, value: &str) -> Result<NaiveDate, PredictionError> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT)
        .map_err(|_| PredictionError::invalid(field, format!("'{value}' is not a YYYY-MM-DD date")))
}

fn parse_time(value: &str) -> Option<NaiveTime> {
    TIME_FORMATS
        .iter()
        .find_map(|f| NaiveTime::parse_from_str(value, f).ok())
}

fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(value, f).ok())
}

/// Parse a schedule that is either a full date-time or a time of day on `date`.
fn parse_schedule(
    field: &'static str,
    value: &str,
    date: Option<NaiveDate>,
) -> Result<NaiveDateTime, PredictionError> {
    let value = value.trim();
    if let Some(dt) = parse_datetime(value) {
        return Ok(dt);
    }
    let time = parse_time(value).ok_or_else(|| {
        PredictionError::invalid(field, format!("'{value}' is not HH:MM or YYYY-MM-DD HH:MM"))
    })?;
    let date = date.ok_or_else(|| PredictionError::missing("departure_date"))?;
    Ok(date.and_time(time))
}

/// Arrival given as a bare time earlier than departure is taken as overnight.
fn parse_arrival(value: &str, departure: NaiveDateTime) -> Result<NaiveDateTime, PredictionError> {
    let value = value.trim();
    if let Some(dt) = parse_datetime(value) {
        if dt < departure {
            return Err(PredictionError::invalid(
                "arrival_time",
                "must not be before the scheduled departure",
            ));
        }
        return Ok(dt);
    }
    let time = parse_time(value).ok_or_else(|| {
        PredictionError::invalid(
            "arrival_time",
            format!("'{value}' is not HH:MM or YYYY-MM-DD HH:MM"),
        )
    })?;
    let same_day = departure.date().and_time(time);
    if same_day < departure {
        Ok(same_day + Duration::days(1))
    } else {
        Ok(same_day)
    }
}

/// Features of every registered flight, keyed by [`FlightKey`].
#[derive(Debug, Default)]
pub struct FlightRegistry {
    flights: DashMap<FlightKey, Arc<FlightFeatures>>,
}

impl FlightRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store features, replacing any previous features for the same key.
    ///
    /// Returns `true` if the key was already registered.
    pub fn insert(&self, features: FlightFeatures) -> bool {
        self.flights
            .insert(features.key.clone(), Arc::new(features))
            .is_some()
    }

    /// Resolve a key to its features.
    #[must_use]
    pub fn resolve(&self, key: &FlightKey) -> Option<Arc<FlightFeatures>> {
        self.flights.get(key).map(|f| Arc::clone(f.value()))
    }

    /// Whether the key is registered.
    #[must_use]
    pub fn contains(&self, key: &FlightKey) -> bool {
        self.flights.contains_key(key)
    }

    /// Number of registered flights.
    #[must_use]
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    /// Whether no flights are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }

    /// Keys of all registered flights, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<FlightKey> {
        let mut keys: Vec<_> = self.flights.iter().map(|f| f.key().clone()).collect();
        keys.sort();
        keys
    }
}
