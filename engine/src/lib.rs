//! # Encore Engine
//!
//! The deterministic core of Encore's offline-first sync.
//!
//! This crate holds the logic that decides what happens to a user's changes
//! while the network comes and goes: how pending mutations are ordered,
//! when they are retried, how a rejected change is undone, how a conflict
//! with the server is settled and which cache strategy a request runs
//! under. It performs no I/O; the `encore-client` crate drives it against a
//! durable store, a remote API and the platform's network signals.
//!
//! ## Design Principles
//!
//! - **No IO**: time comes from a [`Clock`], storage and network belong to the host
//! - **Deterministic**: the same inputs and clock always produce the same outputs
//! - **Testable**: every component is plain data plus methods
//!
//! ## Core Concepts
//!
//! ### Queue items
//!
//! Every pending change is a [`QueueItem`]. The [`OfflineQueue`] keeps items
//! ordered by [`Priority`] (highest first), then by enqueue time. Items that
//! touch the same entity are released strictly in enqueue order, and an item
//! waits until its dependencies have left the queue.
//!
//! ### Retries
//!
//! Transient failures are retried after [`BackoffPolicy::delay_for`], which
//! doubles from a base delay up to a cap. The retry cap depends on priority.
//!
//! ### Optimistic updates
//!
//! The [`OptimisticController`] writes a change into the [`LocalCache`]
//! before the server has seen it, and restores the exact prior value if the
//! change ultimately fails.
//!
//! ### Conflicts
//!
//! The [`ConflictResolver`] settles version conflicts by the item's
//! [`ConflictPolicy`]:
//! - [`ConflictPolicy::Overwrite`] - local wins
//! - [`ConflictPolicy::Merge`] - last write wins, or a field merge when
//!   [`FieldRules`] are registered
//! - [`ConflictPolicy::AskUser`] - deferred until the user decides
//!
//! ## Quick Start
//!
//! ```rust
//! use encore_engine::{
//!     ItemMetadata, LocalCache, NewItem, OfflineQueue, OperationType,
//!     OptimisticController, Priority, QueueItem,
//! };
//! use serde_json::json;
//!
//! let mut cache = LocalCache::new();
//! cache.insert("show:1", json!({"fee": 5000}));
//!
//! // 1. Build an item for an optimistic fee change
//! let request = NewItem::new(
//!     OperationType::Mutation,
//!     json!({"fee": 7500}),
//!     Priority::High,
//!     ItemMetadata::new("updateShow"),
//! )
//! .for_entity("show:1");
//! let item = QueueItem::from_request("item-1", 0, request, 1706745600000);
//!
//! // 2. Apply it locally and queue it
//! let mut optimistic = OptimisticController::new();
//! optimistic
//!     .apply(&mut cache, "show:1", json!({"fee": 7500}), "item-1", 1706745600000)
//!     .unwrap();
//! let mut queue = OfflineQueue::new();
//! queue.insert(item);
//! assert_eq!(cache.get("show:1"), Some(&json!({"fee": 7500})));
//!
//! // 3. The server rejected it: undo
//! queue.remove("item-1");
//! optimistic.rollback(&mut cache, "item-1");
//! assert_eq!(cache.get("show:1"), Some(&json!({"fee": 5000})));
//! ```

pub mod audit;
pub mod backoff;
pub mod clock;
pub mod conflict;
pub mod error;
pub mod event;
pub mod item;
pub mod network;
pub mod optimistic;
pub mod progress;
pub mod queue;
pub mod store;
pub mod strategy;
pub mod validate;

// Re-export main types at crate root
pub use audit::{AuditFilter, AuditLogEntry, AuditOutcome, AuditRecord, AuditTrail};
pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use conflict::{
    detect, ConflictInput, ConflictKind, ConflictRecord, ConflictResolver, Divergence, FieldRule,
    FieldRules, PendingConflict, PendingReason, RemoteVersion, Resolution, ResolutionStrategy,
    UserDecision, VersionedValue,
};
pub use error::Error;
pub use event::{EngineEvent, Event, FailureReason, ItemOutcome, RemovalReason, Topic};
pub use item::{ConflictPolicy, ItemMetadata, NewItem, OperationType, Priority, QueueItem};
pub use network::{
    classify, ConnectivitySample, EffectiveType, NetworkMonitor, NetworkQuality,
    NetworkQualityMetrics, QualityTransition,
};
pub use optimistic::{OptimisticController, OptimisticSnapshot};
pub use progress::{MetricsAccumulator, PerformanceMetrics, PerformanceSample, SyncProgress};
pub use queue::OfflineQueue;
pub use store::LocalCache;
pub use strategy::{
    effective_kind, CacheLookup, CacheStrategy, CachedResponse, ResponseCache, StrategyKind,
    StrategySelector,
};
pub use validate::{FieldDef, FieldType, OperationSchema, Validator};

/// Type aliases for clarity
pub type ItemId = String;
pub type EntityKey = String;
pub type Version = u64;
pub type Timestamp = u64;
