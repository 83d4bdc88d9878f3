//! `fltdelay` - CLI for flightdelay
//!
//! This binary provides the command-line interface for registering flights,
//! feeding live status into the engine and querying delay predictions.
//! Every invocation warm-starts the engine from the local database.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};

use flightdelay::cli::{
    Cli, Command, ConfigCommand, ExportCommand, ObserveCommand, OutcomeCommand, PredictCommand,
    PruneCommand, RegisterCommand, WatchCommand,
};
use flightdelay::engine::{EntryState, PredictionOptions, PredictionResult};
use flightdelay::live_status::{LiveStatus, ObservationRecord};
use flightdelay::normalizer::Normalizer;
use flightdelay::poller::{FileSource, Poller};
use flightdelay::storage::{Outcome, PredictionStats};
use flightdelay::{init_logging, Config, DelayEngine, RawFlightRecord, ScoringAdapter, Storage};

/// Served predictions listed by `status`.
const RECENT_PREDICTIONS: usize = 5;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Load configuration
    let config = Config::load_from(cli.config.clone())?;

    match cli.command {
        Command::Config(config_cmd) => handle_config(&config, config_cmd),
        command => run(&App::open(config)?, command).await,
    }
}

async fn run(app: &App, command: Command) -> Result<()> {
    match command {
        Command::Register(cmd) => handle_register(app, &cmd),
        Command::Observe(cmd) => handle_observe(app, &cmd),
        Command::Predict(cmd) => handle_predict(app, &cmd).await,
        Command::Outcome(cmd) => handle_outcome(app, &cmd),
        Command::Status(cmd) => handle_status(app, cmd.json),
        Command::Prune(cmd) => handle_prune(app, &cmd),
        Command::Watch(cmd) => handle_watch(app, &cmd).await,
        Command::Export(cmd) => handle_export(app, &cmd),
        Command::Config(cmd) => handle_config(&app.config, cmd),
    }
}

/// Engine and storage for one invocation.
#[derive(Debug)]
struct App {
    config: Config,
    engine: DelayEngine,
    storage: Storage,
    normalizer: Normalizer,
}

impl App {
    fn open(config: Config) -> Result<Self> {
        let storage = Storage::open(config.database_path())?;
        let engine = DelayEngine::new(config.engine.clone(), ScoringAdapter::default());
        let restored = storage.restore_engine(&engine)?;
        if restored.skipped_flights > 0 {
            warn!(
                "{} stored flights could not be registered",
                restored.skipped_flights
            );
        }
        Ok(Self {
            config,
            engine,
            storage,
            normalizer: Normalizer::new(),
        })
    }

    fn persist_predictions(&self) -> Result<()> {
        if self.config.storage.persist_predictions {
            self.storage.save_predictions(&self.engine.snapshot())?;
        }
        Ok(())
    }
}

fn handle_register(app: &App, cmd: &RegisterCommand) -> Result<()> {
    let content = fs::read_to_string(&cmd.file)
        .with_context(|| format!("Failed to read {}", cmd.file.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", cmd.file.display()))?;
    let records: Vec<RawFlightRecord> = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };

    let mut failed = 0;
    for (index, raw) in records.iter().enumerate() {
        match app.engine.register_flight(raw) {
            Ok(key) => {
                app.storage.save_flight(&key, raw)?;
                println!("Registered {key}");
            }
            Err(e) => {
                failed += 1;
                eprintln!("Record {}: {e}", index + 1);
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} records rejected", records.len());
    }
    Ok(())
}

fn handle_observe(app: &App, cmd: &ObserveCommand) -> Result<()> {
    let key = cmd.flight.key(&app.normalizer)?;
    if app.engine.features(&key).is_none() {
        warn!("{} is not registered; recording the observation anyway", key);
    }

    let record = ObservationRecord {
        key,
        status: LiveStatus::new(
            cmd.status.into(),
            cmd.delay,
            cmd.at.unwrap_or_else(Utc::now),
            cmd.confidence,
        ),
    };
    if app.engine.ingest(&record.key, record.status.clone()) {
        app.storage.save_observation(&record)?;
        println!(
            "{}: {} ({})",
            record.key,
            record.status.status,
            app.engine.entry_state(&record.key)
        );
    } else {
        println!(
            "{}: ignored, a newer observation is already recorded",
            record.key
        );
    }
    Ok(())
}

async fn handle_predict(app: &App, cmd: &PredictCommand) -> Result<()> {
    let key = cmd.flight.key(&app.normalizer)?;
    let options = PredictionOptions {
        allow_stale: cmd.allow_stale,
        wait_timeout: cmd.wait_ms.map(Duration::from_millis),
    };

    let now = Utc::now();
    let result = app.engine.get_prediction(&key, now, options).await?;
    app.persist_predictions()?;
    app.storage.log_prediction(&result, now)?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_prediction(&result);
    }
    Ok(())
}

fn print_prediction(result: &PredictionResult) {
    println!("{}", result.key);
    println!(
        "  Probability:  {:.2} ({} risk)",
        result.probability,
        result.risk.to_string().replace('_', " ")
    );
    println!("  Confidence:   {:.2} ({})", result.confidence, result.band);
    println!("  Model:        {}", result.model);
    println!("  Computed at:  {}", result.computed_at.to_rfc3339());
    match result.basis_timestamp {
        Some(ts) => println!("  Live status:  {}", ts.to_rfc3339()),
        None => println!("  Live status:  none"),
    }
    if result.stale {
        println!("  Stale:        a newer observation has arrived since");
    }
    println!("  Factors:");
    for factor in &result.factors {
        println!("    - {factor}");
    }
}

fn handle_outcome(app: &App, cmd: &OutcomeCommand) -> Result<()> {
    let key = cmd.flight.key(&app.normalizer)?;
    let predicted = app
        .engine
        .snapshot()
        .into_iter()
        .find(|r| r.key == key)
        .map(|r| r.probability);

    let mut outcome = Outcome::new(key, cmd.delay, cmd.cancelled);
    outcome.predicted_probability = predicted;
    let id = app.storage.record_outcome(&outcome)?;

    println!(
        "Recorded outcome #{id} for {}: {}",
        outcome.key,
        if outcome.delayed() { "delayed" } else { "on time" }
    );
    Ok(())
}

fn handle_status(app: &App, json: bool) -> Result<()> {
    let engine = app.engine.stats();
    let storage = app.storage.stats()?;
    let all_time = app.storage.prediction_stats(None)?;
    let midnight = Utc::now().date_naive().and_hms_opt(0, 0, 0).map(|t| t.and_utc());
    let today = app.storage.prediction_stats(midnight)?;
    let recent = app.storage.prediction_history(Some(RECENT_PREDICTIONS))?;

    if json {
        let status = serde_json::json!({
            "database_path": app.storage.path(),
            "schema_version": storage.schema_version,
            "engine": engine,
            "storage": {
                "flights": storage.flights,
                "observations": storage.observations,
                "predictions": storage.predictions,
                "outcomes": storage.outcomes,
                "logged_predictions": storage.logged_predictions,
                "oldest_observation": storage.oldest_observation,
                "newest_observation": storage.newest_observation,
                "db_size_bytes": storage.db_size_bytes,
            },
            "history": {
                "all_time": all_time,
                "today": today,
                "hit_rate": all_time.hit_rate(),
                "recent": recent,
            },
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("fltdelay status");
    println!("---------------");
    println!("Database:      {}", app.storage.path().display());
    println!("Size:          {} bytes", storage.db_size_bytes);
    println!("Flights:       {}", engine.registered_flights);
    println!("Live statuses: {}", engine.live_statuses);
    println!(
        "Predictions:   {} cached ({} fresh, {} stale)",
        engine.cached_predictions, engine.fresh_predictions, engine.stale_predictions
    );
    println!("Outcomes:      {}", storage.outcomes);
    if let (Some(oldest), Some(newest)) = (storage.oldest_observation, storage.newest_observation)
    {
        println!(
            "Observations:  {} ({} to {})",
            storage.observations,
            oldest.to_rfc3339(),
            newest.to_rfc3339()
        );
    }

    print_history("All time", &all_time);
    print_history("Today", &today);
    if let Some(rate) = all_time.hit_rate() {
        println!(
            "Hit rate:      {:.1}% of {} scored outcomes",
            rate * 100.0,
            all_time.scored_outcomes
        );
    }
    if !recent.is_empty() {
        println!();
        println!("Recent predictions:");
        for logged in &recent {
            println!(
                "  {}  {}  p={:.2} ({}){}",
                logged.served_at.format("%Y-%m-%d %H:%M"),
                logged.key,
                logged.probability,
                logged.band,
                if logged.stale { " stale" } else { "" }
            );
        }
    }

    let flights = app.engine.flights();
    if !flights.is_empty() {
        println!();
        for key in flights {
            let state = app.engine.entry_state(&key);
            if state == EntryState::Absent {
                println!("  {key}");
            } else {
                println!("  {key}  [{state}]");
            }
        }
    }
    Ok(())
}

fn print_history(label: &str, stats: &PredictionStats) {
    if stats.total == 0 {
        println!("{:<15}no predictions served", format!("{label}:"));
        return;
    }
    println!(
        "{:<15}{} served, {} delayed, {} on time, mean p={:.3}",
        format!("{label}:"),
        stats.total,
        stats.delayed,
        stats.on_time,
        stats.average_probability.unwrap_or_default()
    );
    let airlines: Vec<_> = stats
        .top_airlines
        .iter()
        .map(|t| format!("{} ({})", t.name, t.count))
        .collect();
    let routes: Vec<_> = stats
        .top_routes
        .iter()
        .map(|t| format!("{} ({})", t.name, t.count))
        .collect();
    println!("  Top airlines: {}", airlines.join(", "));
    println!("  Top routes:   {}", routes.join(", "));
}

fn handle_prune(app: &App, cmd: &PruneCommand) -> Result<()> {
    let max_age = match cmd.days {
        Some(0) => None,
        Some(days) => Some(Duration::from_secs(u64::from(days) * 24 * 60 * 60)),
        None => app.config.max_age(),
    };
    let Some(max_age) = max_age else {
        println!("Pruning disabled (max_age_days = 0)");
        return Ok(());
    };

    let report = app.storage.prune_older_than(max_age)?;
    println!(
        "Pruned {} flights, {} observations, {} predictions, {} history rows",
        report.flights, report.observations, report.predictions, report.history
    );
    Ok(())
}

async fn handle_watch(app: &App, cmd: &WatchCommand) -> Result<()> {
    let interval = cmd
        .interval
        .map_or_else(|| app.config.poll_interval(), Duration::from_secs);
    let source = Arc::new(FileSource::new(cmd.source.clone()));

    let mut poller = Poller::new(app.engine.clone(), source, interval);
    if let Some(rounds) = cmd.rounds {
        poller = poller.with_max_rounds(rounds);
    }

    let handle = poller.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping poller");
            handle.stop();
        }
    });

    let summary = poller
        .run(|round| {
            for record in &round.applied {
                if let Err(e) = app.storage.save_observation(record) {
                    warn!("{}: failed to store observation: {}", record.key, e);
                }
                println!(
                    "{}: {} ({})",
                    record.key,
                    record.status.status,
                    app.engine.entry_state(&record.key)
                );
            }
        })
        .await;
    app.persist_predictions()?;

    println!(
        "{} rounds, {} observations applied, {} failed rounds",
        summary.rounds, summary.applied, summary.errors
    );
    Ok(())
}

fn handle_export(app: &App, cmd: &ExportCommand) -> Result<()> {
    let (json, count, what) = if cmd.history {
        let history = app.storage.prediction_history(None)?;
        (serde_json::to_string_pretty(&history)?, history.len(), "predictions")
    } else {
        let outcomes = app.storage.outcomes()?;
        (serde_json::to_string_pretty(&outcomes)?, outcomes.len(), "outcomes")
    };
    match &cmd.output {
        Some(path) => {
            write_file(path, &json)?;
            println!("Exported {count} {what} to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Engine]");
                println!(
                    "  Freshness window:   {}s",
                    config.engine.freshness_window_secs
                );
                println!("  Compute timeout:    {}ms", config.engine.compute_timeout_ms);
                println!(
                    "  Max cached:         {}",
                    config.engine.max_cached_predictions
                );
                println!(
                    "  Confidence bands:   high >= {}, medium >= {}",
                    config.engine.high_confidence_threshold,
                    config.engine.medium_confidence_threshold
                );
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                println!("  Max age (days):     {}", config.storage.max_age_days);
                println!(
                    "  Persist cache:      {}",
                    config.storage.persist_predictions
                );
                println!();
                println!("[Poller]");
                println!("  Interval:           {}s", config.poller.interval_secs);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => bail!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}
