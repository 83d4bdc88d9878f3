//! Built-in reference data for feature derivation.
//!
//! Historical delay rates are long-run statistics for the carriers and
//! airports the engine knows about. Anything missing from these tables lands
//! in an "unknown" feature bucket rather than failing normalization.

use crate::flight::{AircraftClass, RouteTraffic, WeatherRisk};

/// Historical delay statistics for one carrier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AirlineStats {
    /// IATA carrier code.
    pub code: &'static str,
    /// Carrier name.
    pub name: &'static str,
    /// Fraction of flights delayed.
    pub delay_rate: f64,
}

/// Historical delay statistics and location for one airport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AirportStats {
    /// IATA airport code.
    pub code: &'static str,
    /// Airport name.
    pub name: &'static str,
    /// Fraction of departures delayed.
    pub delay_rate: f64,
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
}

#[rustfmt::skip]
const AIRLINES: &[AirlineStats] = &[
    AirlineStats { code: "CA", name: "Air China", delay_rate: 0.18 },
    AirlineStats { code: "MU", name: "China Eastern", delay_rate: 0.22 },
    AirlineStats { code: "CZ", name: "China Southern", delay_rate: 0.20 },
    AirlineStats { code: "HU", name: "Hainan Airlines", delay_rate: 0.25 },
    AirlineStats { code: "ZH", name: "Shenzhen Airlines", delay_rate: 0.15 },
    AirlineStats { code: "MF", name: "Xiamen Airlines", delay_rate: 0.12 },
    AirlineStats { code: "HO", name: "Juneyao Air", delay_rate: 0.14 },
    AirlineStats { code: "9C", name: "Spring Airlines", delay_rate: 0.28 },
    AirlineStats { code: "KN", name: "China United Airlines", delay_rate: 0.20 },
    AirlineStats { code: "GS", name: "Tianjin Airlines", delay_rate: 0.23 },
];

#[rustfmt::skip]
const AIRPORTS: &[AirportStats] = &[
    AirportStats { code: "PEK", name: "Beijing Capital", delay_rate: 0.25, lat: 40.0801, lon: 116.5846 },
    AirportStats { code: "PVG", name: "Shanghai Pudong", delay_rate: 0.22, lat: 31.1443, lon: 121.8083 },
    AirportStats { code: "CAN", name: "Guangzhou Baiyun", delay_rate: 0.20, lat: 23.3924, lon: 113.2988 },
    AirportStats { code: "SZX", name: "Shenzhen Bao'an", delay_rate: 0.18, lat: 22.6393, lon: 113.8107 },
    AirportStats { code: "CTU", name: "Chengdu Tianfu", delay_rate: 0.15, lat: 30.3125, lon: 104.4443 },
    AirportStats { code: "CKG", name: "Chongqing Jiangbei", delay_rate: 0.17, lat: 29.7192, lon: 106.6417 },
    AirportStats { code: "XIY", name: "Xi'an Xianyang", delay_rate: 0.14, lat: 34.4471, lon: 108.7516 },
    AirportStats { code: "HGH", name: "Hangzhou Xiaoshan", delay_rate: 0.16, lat: 30.2295, lon: 120.4344 },
    AirportStats { code: "NKG", name: "Nanjing Lukou", delay_rate: 0.13, lat: 31.7420, lon: 118.8620 },
    AirportStats { code: "TAO", name: "Qingdao Jiaodong", delay_rate: 0.19, lat: 36.3614, lon: 120.0883 },
];

/// Busiest routes, in their primary direction.
const TRUNK_ROUTES: &[(&str, &str)] = &[
    ("PEK", "PVG"),
    ("PEK", "CAN"),
    ("PVG", "CAN"),
    ("PEK", "SZX"),
    ("PVG", "CTU"),
];

const WIDE_BODY_PREFIXES: &[&str] = &[
    "A330", "A332", "A333", "A339", "A350", "A359", "A35K", "A380", "A388", "B747", "B74",
    "B767", "B76", "B777", "B77", "B787", "B78",
];

const NARROW_BODY_PREFIXES: &[&str] = &[
    "A318", "A319", "A320", "A321", "A19N", "A20N", "A21N", "B737", "B73", "B38M", "B39M",
    "C919",
];

const REGIONAL_PREFIXES: &[&str] = &["ARJ21", "E190", "E195", "E19", "CRJ", "ATR", "DH8", "Q400"];

/// Weather condition impact factors, `0` (none) to `1` (airport effectively shut).
const WEATHER_IMPACT: &[(&str, f64)] = &[
    ("clear", 0.0),
    ("sunny", 0.0),
    ("cloudy", 0.05),
    ("overcast", 0.08),
    ("dust", 0.10),
    ("haze", 0.15),
    ("light_rain", 0.15),
    ("shower", 0.20),
    ("light_snow", 0.20),
    ("blowing_sand", 0.20),
    ("snow_shower", 0.25),
    ("moderate_rain", 0.30),
    ("fog", 0.35),
    ("thunderstorm", 0.40),
    ("moderate_snow", 0.40),
    ("heavy_rain", 0.50),
    ("sleet", 0.50),
    ("hail", 0.60),
    ("heavy_snow", 0.60),
    ("freezing_rain", 0.70),
    ("rainstorm", 0.80),
    ("blizzard", 0.85),
    ("sandstorm", 0.90),
    ("torrential_rain", 0.95),
];

const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Look up carrier statistics by IATA code.
#[must_use]
pub fn airline(code: &str) -> Option<&'static AirlineStats> {
    AIRLINES.iter().find(|a| a.code == code)
}

/// Look up airport statistics by IATA code.
#[must_use]
pub fn airport(code: &str) -> Option<&'static AirportStats> {
    AIRPORTS.iter().find(|a| a.code == code)
}

/// Classify a route by congestion.
#[must_use]
pub fn route_traffic(origin: &str, destination: &str) -> RouteTraffic {
    if airport(origin).is_none() || airport(destination).is_none() {
        return RouteTraffic::Unknown;
    }
    if TRUNK_ROUTES.contains(&(origin, destination)) {
        RouteTraffic::Trunk
    } else if TRUNK_ROUTES.contains(&(destination, origin)) {
        RouteTraffic::TrunkReverse
    } else {
        RouteTraffic::Regular
    }
}

/// Map an aircraft type designator onto a family.
#[must_use]
pub fn aircraft_class(aircraft_type: &str) -> AircraftClass {
    let code: String = aircraft_type
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect::<String>()
        .to_ascii_uppercase();

    let matches = |prefixes: &[&str]| prefixes.iter().any(|p| code.starts_with(p));

    if code.is_empty() {
        AircraftClass::Unknown
    } else if matches(WIDE_BODY_PREFIXES) {
        AircraftClass::WideBody
    } else if matches(NARROW_BODY_PREFIXES) {
        AircraftClass::NarrowBody
    } else if matches(REGIONAL_PREFIXES) {
        AircraftClass::Regional
    } else {
        AircraftClass::Unknown
    }
}

/// Impact factor for a named weather condition.
#[must_use]
pub fn weather_impact(condition: &str) -> Option<f64> {
    let name = condition.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    WEATHER_IMPACT
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, impact)| *impact)
}

/// Bucket a weather condition into a risk category.
#[must_use]
pub fn weather_risk(condition: &str) -> WeatherRisk {
    match weather_impact(condition) {
        None => WeatherRisk::Unknown,
        Some(i) if i < 0.1 => WeatherRisk::Low,
        Some(i) if i < 0.3 => WeatherRisk::Moderate,
        Some(i) if i < 0.6 => WeatherRisk::High,
        Some(_) => WeatherRisk::Severe,
    }
}

/// Great-circle distance between two known airports.
#[must_use]
pub fn great_circle_km(origin: &str, destination: &str) -> Option<f64> {
    let a = airport(origin)?;
    let b = airport(destination)?;

    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    Some(2.0 * EARTH_RADIUS_KM * h.sqrt().asin())
}

/// Long-run on-time rate for a carrier flying between two airports.
///
/// Unknown airports fall back to a 20% delay rate; an unknown carrier makes
/// the whole estimate unknown.
#[must_use]
pub fn historical_on_time_rate(carrier: &str, origin: &str, destination: &str) -> Option<f64> {
    const DEFAULT_AIRPORT_DELAY: f64 = 0.20;

    let airline = airline(carrier)?;
    let origin_delay = airport(origin).map_or(DEFAULT_AIRPORT_DELAY, |a| a.delay_rate);
    let dest_delay = airport(destination).map_or(DEFAULT_AIRPORT_DELAY, |a| a.delay_rate);
    let airport_delay = (origin_delay + dest_delay) / 2.0;

    Some(1.0 - (airline.delay_rate + airport_delay) / 2.0)
}
