//! # Encore Client
//!
//! Async runtime of the Encore offline sync engine.
//!
//! Changes made while the remote side is unreachable are queued durably,
//! applied optimistically to a local entity cache, and pushed when the
//! network allows. Conflicts are resolved per item policy, every outcome is
//! audited, and lifecycle events are published on a typed bus.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use encore_client::{
//!     Config, EngineDeps, HttpRemote, ManualObserver, SqliteStore, SyncEngine, TokioScheduler,
//! };
//! use encore_engine::{ItemMetadata, OperationType, Priority};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
//! let remote = Arc::new(HttpRemote::new("https://api.example.com", config.request_timeout)?);
//! let (scheduler, triggers) = TokioScheduler::new();
//!
//! let engine = SyncEngine::new(config, EngineDeps::new(store, remote, Arc::new(scheduler)))?;
//! engine.init().await?;
//!
//! let observer = ManualObserver::default();
//! engine.spawn_driver(&observer, triggers)?;
//!
//! engine
//!     .enqueue_optimistic(
//!         "show:42",
//!         json!({"fee": 5000}),
//!         OperationType::Mutation,
//!         Priority::High,
//!         ItemMetadata::new("updateShow"),
//!     )
//!     .await?;
//!
//! observer.set_online(true);
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod observer;
pub mod remote;
pub mod scheduler;

pub use bus::{EventBus, EventReceiver, Publisher};
pub use cache::{
    CacheLayer, FetchError, FetchOutcome, FetchedResponse, Fetcher, HttpFetcher, ResponseSource,
};
pub use config::{Config, ConfigError};
pub use db::{DurableStore, MemoryStore, SqliteStore, StoreError};
pub use engine::{EngineDeps, PlatformSignal, QueueStatus, SyncEngine};
pub use error::{EngineError, Result};
pub use observer::{ManualObserver, NetworkObserver, ProbeObserver};
pub use remote::{HttpRemote, RemoteAck, RemoteApi, RemoteError, RemoteRequest};
pub use scheduler::{RetryScheduler, SyncTrigger, TokioScheduler, TriggerReceiver};
