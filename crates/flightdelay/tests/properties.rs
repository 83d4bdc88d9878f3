//! Property tests for live status ordering, prediction idempotence and
//! persistence.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;

use flightdelay::config::EngineConfig;
use flightdelay::live_status::LiveStatusCache;
use flightdelay::{
    DelayEngine, FlightKey, FlightStatus, LiveStatus, ObservationRecord, PredictionOptions,
    RawFlightRecord, ScoringAdapter, Storage,
};

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 10, 2, 6, 0, 0).unwrap()
}

fn at(offset_ms: i64) -> DateTime<Utc> {
    base() + chrono::Duration::milliseconds(offset_ms)
}

fn record(number: u16, hour: u32) -> RawFlightRecord {
    RawFlightRecord {
        flight: Some(format!("MU{number}")),
        origin: Some("SHA".to_string()),
        destination: Some("CTU".to_string()),
        departure_date: Some("2024-10-02".to_string()),
        departure_time: Some(format!("{hour:02}:15")),
        aircraft_type: Some("A330".to_string()),
        ..RawFlightRecord::default()
    }
}

fn engine() -> DelayEngine {
    DelayEngine::new(EngineConfig::default(), ScoringAdapter::default())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn status_strategy() -> impl Strategy<Value = FlightStatus> {
    prop::sample::select(FlightStatus::ALL.to_vec())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn live_status_never_regresses(offsets in prop::collection::vec(0i64..100_000, 1..40)) {
        let cache = LiveStatusCache::new(Duration::from_secs(900));
        let key = FlightKey::new(
            "MU",
            "5101",
            base().date_naive(),
            "SHA",
            "PEK",
        );

        let mut newest: Option<i64> = None;
        for offset in offsets {
            let applied = cache.update(
                &key,
                LiveStatus::new(FlightStatus::Boarding, Some(offset % 120), at(offset), 0.8),
            );
            let expected = newest.map_or(true, |n| offset > n);
            prop_assert_eq!(applied, expected);
            if expected {
                newest = Some(offset);
            }
            prop_assert_eq!(cache.observed_at(&key), newest.map(at));
        }
    }

    #[test]
    fn repeated_predictions_are_identical(
        hour in 0u32..24,
        status in status_strategy(),
        delay in prop::option::of(0i64..240),
        confidence in 0.0f64..=1.0,
        later_ms in 0i64..3_600_000,
    ) {
        let rt = runtime();
        let engine = engine();
        let key = engine.register_flight(&record(5101, hour)).unwrap();
        engine.ingest(&key, LiveStatus::new(status, delay, base(), confidence));

        let (first, second, third) = rt.block_on(async {
            let options = PredictionOptions::default();
            let first = engine.get_prediction(&key, base(), options).await.unwrap();
            let second = engine.get_prediction(&key, base(), options).await.unwrap();
            let third = engine.get_prediction(&key, at(later_ms), options).await.unwrap();
            (first, second, third)
        });

        prop_assert!((0.0..=1.0).contains(&first.probability));
        prop_assert_eq!(first.probability.to_bits(), second.probability.to_bits());
        prop_assert_eq!(&first, &second);

        // Later reads reuse the computation; only confidence ages.
        prop_assert_eq!(first.probability.to_bits(), third.probability.to_bits());
        prop_assert_eq!(first.basis_timestamp, third.basis_timestamp);
        prop_assert_eq!(first.computed_at, third.computed_at);
        prop_assert_eq!(&first.factors, &third.factors);
        prop_assert!(third.confidence <= first.confidence);
        prop_assert!(third.band <= first.band);
        prop_assert_eq!(engine.stats().computations_started, 1);
    }

    #[test]
    fn persisted_cache_keeps_classification(
        flights in prop::collection::vec((any::<bool>(), any::<bool>(), 0i64..1_000_000), 1..8),
    ) {
        let rt = runtime();
        let storage = Storage::open_in_memory().unwrap();
        let first = engine();
        let mut keys = Vec::new();

        rt.block_on(async {
            for (index, (observed, moved_on, offset)) in flights.iter().enumerate() {
                let number = 5101 + u16::try_from(index).unwrap();
                let raw = record(number, 8);
                let key = first.register_flight(&raw).unwrap();
                storage.save_flight(&key, &raw).unwrap();

                if *observed {
                    let status =
                        LiveStatus::new(FlightStatus::Scheduled, Some(5), at(*offset), 0.7);
                    first.ingest(&key, status.clone());
                    storage
                        .save_observation(&ObservationRecord {
                            key: key.clone(),
                            status,
                        })
                        .unwrap();
                }

                first
                    .get_prediction(&key, at(*offset), PredictionOptions::default())
                    .await
                    .unwrap();

                if *moved_on {
                    let status =
                        LiveStatus::new(FlightStatus::Boarding, Some(30), at(offset + 1), 0.9);
                    first.ingest(&key, status.clone());
                    storage
                        .save_observation(&ObservationRecord {
                            key: key.clone(),
                            status,
                        })
                        .unwrap();
                }
                keys.push(key);
            }
        });
        storage.save_predictions(&first.snapshot()).unwrap();

        let second = engine();
        let report = storage.restore_engine(&second).unwrap();
        prop_assert_eq!(report.flights, flights.len());
        prop_assert_eq!(report.predictions, flights.len());

        for key in &keys {
            prop_assert_eq!(second.entry_state(key), first.entry_state(key));
        }
        prop_assert_eq!(second.snapshot(), first.snapshot());
    }
}
