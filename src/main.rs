// src/main.rs
//
// rigwatch: zone compliance and event lifecycle engine for offshore
// platform CCTV. Consumes tracked-object streams (here: recorded JSONL
// exports), evaluates polygon zone containment with hysteresis and the
// compliance rule table, and maintains deduplicated safety events with
// persistence and alert fan-out.

mod aggregator;
mod config;
mod dispatcher;
mod errors;
mod membership;
mod pipeline;
mod replay;
mod rules;
mod store;
mod types;
mod zones;

use anyhow::{Context, Result};
use config::Config;
use dispatcher::AlertDispatcher;
use pipeline::metrics::EngineMetrics;
use pipeline::Engine;
use std::fs;
use std::sync::Arc;
use store::{spawn_store_writer, JsonlEventStore};
use tracing::info;
use tracing_subscriber::EnvFilter;
use types::ZoneRecord;
use zones::ZoneRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::load(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("🛢️  rigwatch starting (config: {})", config_path);

    let registry = Arc::new(ZoneRegistry::new());
    let zone_yaml = fs::read_to_string(&config.zones_file)
        .with_context(|| format!("reading zone definitions {}", config.zones_file))?;
    let zone_records: Vec<ZoneRecord> =
        serde_yaml::from_str(&zone_yaml).context("parsing zone definitions")?;
    let total = zone_records.len();
    let committed = registry.load(zone_records);
    info!(
        "🗺️  {}/{} zone definition(s) committed from {}",
        committed, total, config.zones_file
    );

    let metrics = Arc::new(EngineMetrics::new());

    let store = Box::new(JsonlEventStore::new(&config.store.output_dir)?);
    let (store_handle, store_join) =
        spawn_store_writer(store, config.store.clone(), metrics.clone());

    let (dispatcher, alert_workers) = AlertDispatcher::new(&config.alerting, metrics.clone())?;
    info!(
        "📣 Alerting on {} channel(s), min severity {}",
        config.alerting.channels.len(),
        config.alerting.min_severity.as_str()
    );

    let mut engine = Engine::new(
        config.clone(),
        registry,
        store_handle,
        Arc::new(dispatcher),
        metrics.clone(),
    );

    let updates = replay::load_updates(&config.replay.input_dir)?;
    for update in updates {
        engine.submit(update).await;
    }

    // Dropping the engine's handles lets the store writer and alert workers
    // drain to completion.
    engine.shutdown().await;
    store_join.await?;
    for worker in alert_workers {
        worker.await?;
    }

    let summary = metrics.summary();
    info!(
        "📊 Run summary:\n{}",
        serde_json::to_string_pretty(&summary)?
    );
    info!("✅ rigwatch finished");
    Ok(())
}
