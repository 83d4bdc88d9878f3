//! Core flight types for flightdelay.
//!
//! [`FlightKey`] is the identity every component looks flights up by.
//! [`RawFlightRecord`] is what callers hand in; the normalizer turns it into an
//! immutable [`FlightFeatures`] snapshot.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, Weekday};
use serde::{Deserialize, Serialize};

/// Identity of one scheduled flight instance.
///
/// Two keys are equal iff carrier, flight number, departure date and both
/// airports match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlightKey {
    /// Two-character IATA carrier code, e.g. `CA`.
    pub carrier: String,
    /// Numeric flight number with optional suffix, e.g. `1234`.
    pub flight_number: String,
    /// Scheduled departure date, local to the origin airport.
    pub departure_date: NaiveDate,
    /// Three-letter IATA origin airport code.
    pub origin: String,
    /// Three-letter IATA destination airport code.
    pub destination: String,
}

impl FlightKey {
    /// Create a new key. Inputs are taken as-is; use the normalizer to
    /// validate untrusted input.
    #[must_use]
    pub fn new(
        carrier: impl Into<String>,
        flight_number: impl Into<String>,
        departure_date: NaiveDate,
        origin: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            carrier: carrier.into(),
            flight_number: flight_number.into(),
            departure_date,
            origin: origin.into(),
            destination: destination.into(),
        }
    }

    /// The flight designator, e.g. `CA1234`.
    #[must_use]
    pub fn designator(&self) -> String {
        format!("{}{}", self.carrier, self.flight_number)
    }

    /// Stable BLAKE3 fingerprint of the key, used as the storage identity.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        blake3::hash(self.to_string().as_bytes())
            .to_hex()
            .to_string()
    }
}

impl fmt::Display for FlightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}/{}/{}-{}",
            self.carrier, self.flight_number, self.departure_date, self.origin, self.destination
        )
    }
}

/// A flight record as supplied by callers, before validation.
///
/// Either `flight` (a designator such as `"CA1234"`) or `carrier` plus
/// `flight_number` must be present. `departure_time` accepts `HH:MM` or a full
/// `YYYY-MM-DD HH:MM`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawFlightRecord {
    /// Combined designator, e.g. `CA1234`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flight: Option<String>,
    /// Carrier code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
    /// Flight number without carrier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flight_number: Option<String>,
    /// Origin airport code.
    pub origin: Option<String>,
    /// Destination airport code.
    pub destination: Option<String>,
    /// Departure date, `YYYY-MM-DD`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub departure_date: Option<String>,
    /// Scheduled departure time.
    pub departure_time: Option<String>,
    /// Scheduled arrival time, same formats as `departure_time`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arrival_time: Option<String>,
    /// Aircraft type designator, e.g. `A320` or `B787`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aircraft_type: Option<String>,
    /// Route distance in kilometres.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    /// Forecast weather condition at the origin, e.g. `thunderstorm`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weather: Option<String>,
}

/// Broad aircraft family, used as a feature bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AircraftClass {
    /// Single-aisle jets (A320 family, 737).
    NarrowBody,
    /// Twin-aisle jets (A330, A350, 787, 777).
    WideBody,
    /// Regional jets and turboprops.
    Regional,
    /// Type missing or not recognised.
    Unknown,
}

/// Travel season bucket, following the mainland China peak periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeasonBucket {
    /// Spring Festival travel rush (January and February).
    SpringFestival,
    /// Labour Day holiday (May 1-5).
    LabourDay,
    /// Summer travel peak (July and August).
    Summer,
    /// National Day golden week (October 1-7).
    NationalDay,
    /// Everything else.
    Regular,
}

/// How congested a route is known to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTraffic {
    /// One of the busiest trunk routes, in its primary direction.
    Trunk,
    /// A trunk route flown in the return direction.
    TrunkReverse,
    /// A route between known airports that is not a trunk route.
    Regular,
    /// At least one endpoint is not a known airport.
    Unknown,
}

/// Weather risk category at the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherRisk {
    /// Clear or lightly clouded.
    Low,
    /// Light precipitation, haze.
    Moderate,
    /// Heavy rain, snow, fog, thunderstorms.
    High,
    /// Rainstorms, blizzards, sandstorms.
    Severe,
    /// Condition missing or not recognised.
    Unknown,
}

/// Immutable, derived feature snapshot for one flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightFeatures {
    /// The flight these features describe.
    pub key: FlightKey,
    /// Scheduled departure, local time.
    pub scheduled_departure: NaiveDateTime,
    /// Scheduled arrival, local time, if known.
    pub scheduled_arrival: Option<NaiveDateTime>,
    /// Aircraft family.
    pub aircraft: AircraftClass,
    /// Route distance in kilometres, if known.
    pub distance_km: Option<f64>,
    /// Day of week of the scheduled departure.
    pub day_of_week: Weekday,
    /// Travel season bucket.
    pub season: SeasonBucket,
    /// Historical on-time rate for carrier and route, if known.
    pub historical_on_time_rate: Option<f64>,
    /// Route congestion bucket.
    pub route_traffic: RouteTraffic,
    /// Weather risk at the origin.
    pub weather_risk: WeatherRisk,
}

impl FlightFeatures {
    /// Fraction of optional features that are known, in `[0, 1]`.
    #[must_use]
    pub fn completeness(&self) -> f64 {
        let known = [
            self.aircraft != AircraftClass::Unknown,
            self.distance_km.is_some(),
            self.historical_on_time_rate.is_some(),
            self.route_traffic != RouteTraffic::Unknown,
            self.weather_risk != WeatherRisk::Unknown,
        ];
        let count = known.iter().filter(|k| **k).count();
        // At most 5, exact in f64
        #[allow(clippy::cast_precision_loss)]
        let ratio = count as f64 / known.len() as f64;
        ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn key() -> FlightKey {
        FlightKey::new(
            "CA",
            "1234",
            NaiveDate::from_ymd_opt(2024, 7, 15).unwrap(),
            "PEK",
            "PVG",
        )
    }

    fn features() -> FlightFeatures {
        let key = key();
        FlightFeatures {
            scheduled_departure: key
                .departure_date
                .and_time(NaiveTime::from_hms_opt(18, 30, 0).unwrap()),
            key,
            scheduled_arrival: None,
            aircraft: AircraftClass::NarrowBody,
            distance_km: Some(1_080.0),
            day_of_week: Weekday::Mon,
            season: SeasonBucket::Summer,
            historical_on_time_rate: Some(0.79),
            route_traffic: RouteTraffic::Trunk,
            weather_risk: WeatherRisk::Unknown,
        }
    }

    #[test]
    fn test_key_display() {
        assert_eq!(key().to_string(), "CA1234/2024-07-15/PEK-PVG");
        assert_eq!(key().designator(), "CA1234");
    }

    #[test]
    fn test_key_equality_covers_all_fields() {
        let a = key();
        let mut b = key();
        assert_eq!(a, b);

        b.destination = "CAN".to_string();
        assert_ne!(a, b);

        let mut c = key();
        c.departure_date = NaiveDate::from_ymd_opt(2024, 7, 16).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_fingerprint_is_stable_and_distinct() {
        assert_eq!(key().fingerprint(), key().fingerprint());
        assert_eq!(key().fingerprint().len(), 64);

        let mut other = key();
        other.flight_number = "1235".to_string();
        assert_ne!(key().fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_completeness() {
        let mut f = features();
        assert!((f.completeness() - 0.8).abs() < 1e-12);

        f.weather_risk = WeatherRisk::Low;
        assert!((f.completeness() - 1.0).abs() < 1e-12);

        f.aircraft = AircraftClass::Unknown;
        f.distance_km = None;
        f.historical_on_time_rate = None;
        f.route_traffic = RouteTraffic::Unknown;
        f.weather_risk = WeatherRisk::Unknown;
        assert!(f.completeness().abs() < 1e-12);
    }

    #[test]
    fn test_raw_record_deserialize_designator() {
        let json = r#"{"flight": "CA1234", "origin": "PEK", "destination": "PVG",
                       "departure_date": "2024-07-15", "departure_time": "18:30"}"#;
        let raw: RawFlightRecord = serde_json::from_str(json).unwrap();
        assert_eq!(raw.flight.as_deref(), Some("CA1234"));
        assert!(raw.carrier.is_none());
        assert!(raw.aircraft_type.is_none());
    }

    #[test]
    fn test_enum_serialization() {
        assert_eq!(
            serde_json::to_string(&SeasonBucket::SpringFestival).unwrap(),
            "\"spring_festival\""
        );
        assert_eq!(
            serde_json::to_string(&RouteTraffic::TrunkReverse).unwrap(),
            "\"trunk_reverse\""
        );
    }
}
