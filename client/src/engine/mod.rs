//! The sync engine context object.
//!
//! [`SyncEngine`] owns the offline queue, the local entity cache, optimistic
//! snapshots, the conflict resolver and the audit trail, and wires them to
//! the durable store, the remote API and the event bus. It is cheap to
//! clone; clones share one engine.
//!
//! All mutable engine state sits behind a single mutex that is never held
//! across an `.await`, so enqueues and status reads proceed while a sync
//! pass waits on the network.

mod lifecycle;
mod sync;

pub use lifecycle::PlatformSignal;

use crate::bus::{EventReceiver, Publisher};
use crate::cache::{CacheLayer, FetchError, FetchOutcome, Fetcher, HttpFetcher};
use crate::config::Config;
use crate::db::DurableStore;
use crate::error::{EngineError, Result};
use crate::remote::RemoteApi;
use crate::scheduler::{RetryScheduler, SyncTrigger};
use encore_engine::{
    AuditFilter, AuditLogEntry, AuditRecord, AuditTrail, CacheStrategy, Clock, ConflictRecord,
    ConflictResolver, EngineEvent, FieldRules, ItemId, ItemMetadata, LocalCache, NetworkMonitor,
    NetworkQuality, NewItem, OfflineQueue, OperationSchema, OperationType, OptimisticController,
    PendingConflict, PerformanceMetrics, PerformanceSample, Priority, QueueItem, RemovalReason,
    StrategySelector, SyncProgress, SystemClock, Timestamp, Topic, Validator,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Collaborators injected into the engine.
pub struct EngineDeps {
    pub store: Arc<dyn DurableStore>,
    pub remote: Arc<dyn RemoteApi>,
    pub scheduler: Arc<dyn RetryScheduler>,
    pub clock: Arc<dyn Clock>,
    pub fetcher: Arc<dyn Fetcher>,
    pub strategies: Vec<CacheStrategy>,
}

impl EngineDeps {
    /// Dependencies with the system clock, an HTTP fetcher and the default
    /// cache strategies.
    pub fn new(
        store: Arc<dyn DurableStore>,
        remote: Arc<dyn RemoteApi>,
        scheduler: Arc<dyn RetryScheduler>,
    ) -> Self {
        Self {
            store,
            remote,
            scheduler,
            clock: Arc::new(SystemClock),
            fetcher: Arc::new(HttpFetcher::default()),
            strategies: CacheStrategy::defaults(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_strategies(mut self, strategies: Vec<CacheStrategy>) -> Self {
        self.strategies = strategies;
        self
    }
}

/// Snapshot of the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub size: usize,
    /// Items in processing order
    pub items: Vec<QueueItem>,
    /// Items waiting for a conflict decision
    pub parked: usize,
}

pub(crate) struct EngineState {
    pub(crate) queue: OfflineQueue,
    pub(crate) cache: LocalCache,
    pub(crate) optimistic: OptimisticController,
    pub(crate) resolver: ConflictResolver,
    pub(crate) validator: Validator,
    pub(crate) audit: AuditTrail,
    pub(crate) monitor: NetworkMonitor,
    pub(crate) progress: SyncProgress,
    pub(crate) pending: BTreeMap<ItemId, PendingConflict>,
    pub(crate) records: Vec<ConflictRecord>,
    /// Items that failed terminally this session
    pub(crate) failed: HashSet<ItemId>,
    pub(crate) in_flight: Option<ItemId>,
    pub(crate) next_seq: u64,
}

impl EngineState {
    fn new() -> Self {
        Self {
            queue: OfflineQueue::new(),
            cache: LocalCache::new(),
            optimistic: OptimisticController::new(),
            resolver: ConflictResolver::new(),
            validator: Validator::new(),
            audit: AuditTrail::new(),
            monitor: NetworkMonitor::new(),
            progress: SyncProgress::idle(0, NetworkQuality::Offline),
            pending: BTreeMap::new(),
            records: Vec::new(),
            failed: HashSet::new(),
            in_flight: None,
            next_seq: 0,
        }
    }

    fn record_audit(&mut self, record: AuditRecord) -> AuditLogEntry {
        self.audit.record(record).clone()
    }
}

pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) store: Arc<dyn DurableStore>,
    pub(crate) remote: Arc<dyn RemoteApi>,
    pub(crate) scheduler: Arc<dyn RetryScheduler>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) publisher: Arc<Publisher>,
    pub(crate) cache: Arc<CacheLayer>,
    pub(crate) state: Mutex<EngineState>,
    pub(crate) syncing: AtomicBool,
    /// Set by a trigger coalesced into the running pass
    pub(crate) rerun: AtomicBool,
    pub(crate) ready: AtomicBool,
    pub(crate) disposed: AtomicBool,
    pub(crate) driver: Mutex<Option<lifecycle::Driver>>,
}

/// Offline-first mutation sync engine.
#[derive(Clone)]
pub struct SyncEngine {
    pub(crate) inner: Arc<Shared>,
}

impl SyncEngine {
    fn ensure_ready(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(EngineError::Disposed);
        }
        if !self.inner.ready.load(Ordering::SeqCst) {
            return Err(EngineError::NotReady);
        }
        Ok(())
    }

    fn now(&self) -> Timestamp {
        self.inner.clock.now_millis()
    }

    /// Queue an operation. Returns its id once the item is durable.
    pub async fn add_to_offline_queue(
        &self,
        operation_type: OperationType,
        payload: Value,
        priority: Priority,
        metadata: ItemMetadata,
    ) -> Result<ItemId> {
        self.enqueue(NewItem::new(operation_type, payload, priority, metadata))
            .await
    }

    /// Queue a fully specified request.
    pub async fn enqueue(&self, request: NewItem) -> Result<ItemId> {
        self.ensure_ready()?;
        let item = self.prepare(request)?;

        self.persist_new(&item).await?;

        let id = item.id.clone();
        let depth = {
            let mut state = self.inner.state.lock();
            state.queue.insert(item.clone());
            state.queue.len()
        };
        self.announce_added(item, depth);
        Ok(id)
    }

    /// Queue a change to `entity_key` and show `value` locally right away.
    ///
    /// If the change fails terminally, the entity is restored to exactly
    /// what it was before.
    pub async fn enqueue_optimistic(
        &self,
        entity_key: impl Into<String>,
        value: Value,
        operation_type: OperationType,
        priority: Priority,
        metadata: ItemMetadata,
    ) -> Result<ItemId> {
        self.ensure_ready()?;
        let entity_key: String = entity_key.into();
        if entity_key.is_empty() {
            return Err(encore_engine::Error::EmptyEntityKey.into());
        }
        let request =
            NewItem::new(operation_type, value.clone(), priority, metadata).for_entity(&entity_key);
        let item = self.prepare(request)?;

        self.persist_new(&item).await?;

        let now = self.now();
        let applied = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            match state
                .optimistic
                .apply(&mut state.cache, entity_key.as_str(), value, item.id.as_str(), now)
            {
                Ok(_) => {
                    state.queue.insert(item.clone());
                    Ok(state.queue.len())
                }
                Err(e) => Err(e),
            }
        };

        match applied {
            Ok(depth) => {
                tracing::debug!(
                    item_id = %item.id,
                    entity = %entity_key,
                    "Optimistic value applied"
                );
                let id = item.id.clone();
                self.announce_added(item, depth);
                Ok(id)
            }
            Err(e) => {
                if let Err(store_err) = self.inner.store.delete_item(&item.id).await {
                    tracing::error!(
                        item_id = %item.id,
                        error = %store_err,
                        "Failed to discard item"
                    );
                }
                Err(e.into())
            }
        }
    }

    /// Validate a request and give it identity.
    fn prepare(&self, request: NewItem) -> Result<QueueItem> {
        let now = self.now();
        let mut state = self.inner.state.lock();
        let failed = &state.failed;
        state
            .validator
            .validate(&request, |id| failed.contains(id))?;

        let seq = state.next_seq;
        state.next_seq += 1;
        let id = uuid::Uuid::new_v4().to_string();
        Ok(QueueItem::from_request(id, seq, request, now))
    }

    async fn persist_new(&self, item: &QueueItem) -> Result<()> {
        if let Err(e) = self.inner.store.put_item(item).await {
            tracing::error!(item_id = %item.id, error = %e, "Failed to persist queue item");
            crate::metrics::record_persistence_error("put_item");
            return Err(e.into());
        }
        Ok(())
    }

    fn announce_added(&self, item: QueueItem, depth: usize) {
        tracing::debug!(
            item_id = %item.id,
            operation = %item.metadata.operation_name,
            priority = ?item.priority,
            depth,
            "Item queued"
        );
        crate::metrics::record_enqueue(item.operation_type.as_str());
        self.inner.publisher.set_queue_depth(depth);
        self.inner.publisher.emit(EngineEvent::QueueItemAdded { item });
        self.inner
            .scheduler
            .schedule(SyncTrigger::Enqueued, self.inner.config.sync_debounce);
    }
}

impl SyncEngine {
    /// Run a sync pass now. Never fails; see [`SyncProgress`] and the event
    /// stream for what happened.
    pub async fn process_offline_queue(&self) -> SyncProgress {
        self.run_pass().await
    }

    pub fn get_performance_metrics(&self) -> PerformanceMetrics {
        self.inner.publisher.performance()
    }

    /// Persisted metric samples taken at or after `since`.
    pub async fn performance_history(&self, since: Timestamp) -> Result<Vec<PerformanceSample>> {
        self.ensure_ready()?;
        Ok(self.inner.store.metrics_since(since).await?)
    }

    pub fn get_offline_queue_status(&self) -> QueueStatus {
        let state = self.inner.state.lock();
        let items = state.queue.peek_ordered().to_vec();
        QueueStatus {
            size: items.len(),
            parked: items.iter().filter(|i| state.queue.is_parked(&i.id)).count(),
            items,
        }
    }

    /// Durable queue contents of one operation type, in processing order.
    pub async fn queued_by_type(&self, operation_type: OperationType) -> Result<Vec<QueueItem>> {
        self.ensure_ready()?;
        Ok(self.inner.store.load_items_by_type(operation_type).await?)
    }

    /// Drop every queued item and undo their optimistic writes. An item in
    /// flight is left to its pass.
    pub async fn clear_offline_queue(&self) -> Result<()> {
        self.ensure_ready()?;
        let ids: Vec<ItemId> = {
            let state = self.inner.state.lock();
            let in_flight = state.in_flight.as_ref();
            state
                .queue
                .peek_ordered()
                .iter()
                .filter(|i| Some(&i.id) != in_flight)
                .map(|i| i.id.clone())
                .collect()
        };

        // Only the captured ids: an enqueue may land while the delete runs.
        self.inner.store.delete_items(&ids).await?;

        let now = self.now();
        let (entries, depth) = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let cleared: HashSet<&str> = ids.iter().map(String::as_str).collect();
            let undone = state
                .optimistic
                .rollback_where(&mut state.cache, |id| cleared.contains(id));
            let mut entries = Vec::new();
            for snapshot in undone {
                let operation_name = state
                    .queue
                    .get(&snapshot.item_id)
                    .map(|i| i.metadata.operation_name.clone());
                let actor = state
                    .queue
                    .get(&snapshot.item_id)
                    .and_then(|i| i.metadata.actor_id.clone());
                entries.push(state.record_audit(AuditRecord {
                    entity_id: snapshot.entity_key.clone(),
                    item_id: Some(snapshot.item_id.clone()),
                    operation_name,
                    actor,
                    before: Some(snapshot.applied.clone()),
                    after: snapshot.prior.clone(),
                    outcome: encore_engine::AuditOutcome::RolledBack,
                    timestamp: now,
                }));
            }
            for id in &ids {
                state.queue.remove(id);
                state.pending.remove(id);
            }
            (entries, state.queue.len())
        };

        self.persist_audit(entries).await;
        self.inner.publisher.set_queue_depth(depth);
        crate::metrics::set_parked(self.parked_count());
        for id in ids.iter() {
            self.inner.publisher.emit(EngineEvent::QueueItemRemoved {
                item_id: id.clone(),
                reason: RemovalReason::Cleared,
            });
        }
        tracing::info!(cleared = ids.len(), "Offline queue cleared");
        Ok(())
    }

    /// Cancel one queued item and undo its optimistic write.
    pub async fn remove(&self, id: &str) -> Result<()> {
        self.ensure_ready()?;
        {
            let mut state = self.inner.state.lock();
            if state.in_flight.as_deref() == Some(id) {
                return Err(encore_engine::Error::ItemInFlight(id.to_string()).into());
            }
            if !state.queue.contains(id) {
                return Err(encore_engine::Error::ItemNotFound(id.to_string()).into());
            }
            // Parked items are never picked up, which keeps the item out of
            // any pass while the delete is awaited.
            if !state.pending.contains_key(id) {
                state.queue.park(id);
            }
        }

        if let Err(e) = self.inner.store.delete_item(id).await {
            let mut state = self.inner.state.lock();
            if !state.pending.contains_key(id) {
                state.queue.unpark(id);
            }
            return Err(e.into());
        }

        let now = self.now();
        let (entry, depth) = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let item = state.queue.remove(id);
            state.pending.remove(id);
            let snapshot = state.optimistic.rollback(&mut state.cache, id);
            let entry = match (item, snapshot) {
                (Some(item), Some(snapshot)) => Some(state.record_audit(AuditRecord {
                    entity_id: snapshot.entity_key,
                    item_id: Some(item.id),
                    operation_name: Some(item.metadata.operation_name),
                    actor: item.metadata.actor_id,
                    before: Some(snapshot.applied),
                    after: snapshot.prior,
                    outcome: encore_engine::AuditOutcome::RolledBack,
                    timestamp: now,
                })),
                _ => None,
            };
            (entry, state.queue.len())
        };

        self.persist_audit(entry.into_iter().collect()).await;
        self.inner.publisher.set_queue_depth(depth);
        crate::metrics::set_parked(self.parked_count());
        self.inner.publisher.emit(EngineEvent::QueueItemRemoved {
            item_id: id.to_string(),
            reason: RemovalReason::Cancelled,
        });
        tracing::info!(item_id = %id, "Queue item cancelled");
        Ok(())
    }

    /// Conflicts waiting for a user decision.
    pub fn pending_conflicts(&self) -> Vec<PendingConflict> {
        self.inner.state.lock().pending.values().cloned().collect()
    }

    /// Every conflict resolved so far, oldest first.
    pub fn conflict_records(&self) -> Vec<ConflictRecord> {
        self.inner.state.lock().records.clone()
    }

    pub fn audit_trail(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        self.inner
            .state
            .lock()
            .audit
            .query(filter)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn export_audit_json(&self) -> serde_json::Result<String> {
        self.inner.state.lock().audit.export_json()
    }

    pub fn export_audit_csv(&self) -> String {
        self.inner.state.lock().audit.export_csv()
    }

    /// Current local value of an entity, optimistic changes included.
    pub fn cached_entity(&self, key: &str) -> Option<Value> {
        self.inner.state.lock().cache.get(key).cloned()
    }

    /// Seed or refresh the local value of an entity from the server.
    pub fn put_entity(&self, key: impl Into<String>, value: Value) {
        self.inner.state.lock().cache.insert(key.into(), value);
    }

    /// Fetch a resource through the response cache.
    pub async fn fetch(&self, url: &str) -> std::result::Result<FetchOutcome, FetchError> {
        let (quality, save_data) = {
            let state = self.inner.state.lock();
            (state.monitor.quality(), state.monitor.save_data())
        };
        self.inner.cache.fetch(url, quality, save_data).await
    }

    pub fn subscribe(&self, topic: Topic) -> (String, EventReceiver) {
        self.inner.publisher.bus().subscribe(topic)
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        self.inner.publisher.bus().unsubscribe(id)
    }

    pub fn network_quality(&self) -> NetworkQuality {
        self.inner.state.lock().monitor.quality()
    }

    /// Live progress of the current or last pass.
    pub fn sync_progress(&self) -> SyncProgress {
        let state = self.inner.state.lock();
        if state.progress.in_progress {
            state.progress.clone()
        } else {
            SyncProgress {
                total_items: state.queue.len(),
                network_quality: state.monitor.quality(),
                ..state.progress.clone()
            }
        }
    }

    /// Merge conflicts of `operation_name` field by field.
    pub fn register_merge(&self, operation_name: impl Into<String>, rules: FieldRules) {
        self.inner
            .state
            .lock()
            .resolver
            .register_merge(operation_name, rules);
    }

    /// Check payloads of an operation against `schema` at enqueue time.
    pub fn register_schema(&self, schema: OperationSchema) {
        self.inner.state.lock().validator.register(schema);
    }

    pub fn strategy_selector(&self) -> &StrategySelector {
        self.inner.cache.selector()
    }

    fn parked_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub(crate) async fn persist_audit(&self, entries: Vec<AuditLogEntry>) {
        for entry in entries {
            if let Err(e) = self.inner.store.append_audit(&entry).await {
                tracing::error!(seq = entry.seq, error = %e, "Failed to persist audit entry");
                crate::metrics::record_persistence_error("append_audit");
            }
        }
    }
}
