//! Encore Sync - background process that drains the durable offline queue.
//!
//! Probes the remote health endpoint for connectivity and pushes queued
//! changes whenever the network is up, until interrupted.

use encore_client::{
    Config, EngineDeps, HttpFetcher, HttpRemote, ProbeObserver, SqliteStore, SyncEngine,
    TokioScheduler,
};
use encore_engine::{SystemClock, Topic};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "encore_client=debug,encore_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let remote_url = config.require_remote_url()?.to_string();

    tracing::info!(remote = %remote_url, database = %config.database_url, "Starting Encore Sync");

    let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
    let client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()?;
    let remote = Arc::new(HttpRemote::with_client(client.clone(), &remote_url));
    let (scheduler, triggers) = TokioScheduler::new();
    let clock = Arc::new(SystemClock);

    let probe = Arc::new(
        ProbeObserver::new(
            client.clone(),
            format!("{}{}", remote_url, config.probe_path),
            config.probe_interval,
            clock.clone(),
        )
        .with_min_throughput_bytes(config.probe_min_throughput_bytes),
    );

    let deps = EngineDeps::new(store, remote, Arc::new(scheduler))
        .with_clock(clock)
        .with_fetcher(Arc::new(HttpFetcher::new(client)));
    let engine = SyncEngine::new(config, deps)?;
    engine.init().await?;
    engine.spawn_driver(probe.as_ref(), triggers)?;
    let probing = Arc::clone(&probe).spawn();

    let (_, mut processed) = engine.subscribe(Topic::QueueItemProcessed);
    let reporter = tokio::spawn(async move {
        while let Some(event) = processed.recv().await {
            if let Ok(line) = serde_json::to_string(&event.payload) {
                tracing::info!(event = %line, "Item processed");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    probing.abort();
    engine.dispose().await;
    reporter.abort();

    let status = engine.get_offline_queue_status();
    tracing::info!(remaining = status.size, "Encore Sync stopped");
    Ok(())
}
