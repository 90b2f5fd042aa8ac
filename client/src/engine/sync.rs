//! The sync pass.
//!
//! One pass at a time. A pass takes the ids due at its start and keeps
//! asking the queue for the next ready item among them, so an item
//! unblocked by an earlier commit in the same pass still runs in it.
//! Items are processed strictly one after another. A trigger that lands
//! while a pass runs is coalesced into one follow-up pass.

use super::SyncEngine;
use crate::remote::{RemoteAck, RemoteError, RemoteRequest};
use crate::scheduler::SyncTrigger;
use encore_engine::{
    AuditOutcome, AuditRecord, ConflictInput, ConflictRecord, EngineEvent, FailureReason,
    ItemOutcome, PerformanceSample, QueueItem, RemoteVersion, RemovalReason, Resolution,
    ResolutionStrategy, SyncProgress, UserDecision, VersionedValue,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Clears the in-progress flag however the pass ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    /// Run a pass, then another one for every trigger that arrived while it
    /// was running. Returns the progress of the first pass.
    pub(crate) async fn run_pass(&self) -> SyncProgress {
        let Some(progress) = self.pass_once().await else {
            return self.sync_progress();
        };
        while self.inner.rerun.swap(false, Ordering::SeqCst) {
            tracing::debug!("Sync requested during the last pass, running again");
            if self.pass_once().await.is_none() {
                break;
            }
        }
        progress
    }

    /// One pass over the items due now. `None` if another pass is running;
    /// that pass then runs again once it ends.
    async fn pass_once(&self) -> Option<SyncProgress> {
        if self.ensure_ready().is_err() {
            return Some(self.sync_progress());
        }
        if !self.network_quality().is_online() {
            tracing::debug!("Offline, sync pass skipped");
            return Some(self.sync_progress());
        }
        self.inner.rerun.store(true, Ordering::SeqCst);
        if self
            .inner
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("Sync pass already running, trigger coalesced");
            crate::metrics::record_coalesced_trigger();
            return None;
        }
        self.inner.rerun.store(false, Ordering::SeqCst);
        let _guard = PassGuard(&self.inner.syncing);
        let started = Instant::now();

        let now = self.now();
        let (mut eligible, mut progress) = {
            let mut state = self.inner.state.lock();
            let ids: HashSet<String> = state
                .queue
                .peek_ordered()
                .iter()
                .filter(|i| i.is_due(now) && !state.queue.is_parked(&i.id))
                .map(|i| i.id.clone())
                .collect();
            let progress = SyncProgress::started(ids.len(), state.monitor.quality());
            if !ids.is_empty() {
                state.progress = progress.clone();
            }
            (ids, progress)
        };
        if eligible.is_empty() {
            return Some(self.sync_progress());
        }

        tracing::info!(
            items = eligible.len(),
            quality = %progress.network_quality,
            "Sync pass started"
        );
        self.inner.publisher.emit(EngineEvent::SyncStarted {
            progress: progress.clone(),
        });

        let mut aborted = None;
        loop {
            let now = self.now();
            let next = {
                let mut state = self.inner.state.lock();
                if self.inner.disposed.load(Ordering::SeqCst) {
                    aborted = Some("Engine disposed".to_string());
                    None
                } else if !state.monitor.is_online() {
                    aborted = Some("Connectivity lost".to_string());
                    None
                } else {
                    let item = state
                        .queue
                        .next_ready(now, |i| eligible.contains(&i.id))
                        .cloned();
                    if let Some(item) = &item {
                        state.in_flight = Some(item.id.clone());
                        state.progress.current_operation = item.label();
                    }
                    item
                }
            };
            let Some(item) = next else { break };
            eligible.remove(&item.id);

            let item_id = item.id.clone();
            let operation_name = item.metadata.operation_name.clone();
            progress.current_operation = item.label();
            tracing::debug!(
                item_id = %item_id,
                operation = %operation_name,
                attempt = item.retry_count + 1,
                "Processing item"
            );

            let outcome = self.process_item(item).await;

            let average = self.inner.publisher.stats().average_response_ms();
            match &outcome {
                ItemOutcome::Committed => progress.completed_items += 1,
                ItemOutcome::Failed { .. } => progress.failed_items += 1,
                ItemOutcome::Retrying { .. } | ItemOutcome::Parked => {}
            }
            progress.update_estimate(average);
            {
                let mut state = self.inner.state.lock();
                state.in_flight = None;
                state.progress = progress.clone();
            }
            crate::metrics::record_item(&operation_name, outcome_label(&outcome));
            self.inner.publisher.emit(EngineEvent::QueueItemProcessed {
                item_id,
                operation_name,
                outcome,
                progress: progress.clone(),
            });
        }

        progress.finish();
        {
            let mut state = self.inner.state.lock();
            state.progress = progress.clone();
        }
        self.inner.publisher.stats().record_pass(&progress);

        let sample = PerformanceSample {
            timestamp: self.now(),
            metrics: self.inner.publisher.performance(),
        };
        if let Err(e) = self.inner.store.record_metrics(&sample).await {
            tracing::error!(error = %e, "Failed to persist performance sample");
            crate::metrics::record_persistence_error("record_metrics");
        }
        crate::metrics::record_pass(started.elapsed(), aborted.is_some());

        match aborted {
            Some(reason) => {
                tracing::warn!(
                    completed = progress.completed_items,
                    failed = progress.failed_items,
                    reason = %reason,
                    "Sync pass aborted"
                );
                self.inner.publisher.emit(EngineEvent::SyncFailed {
                    progress: progress.clone(),
                    reason,
                });
            }
            None => {
                tracing::info!(
                    completed = progress.completed_items,
                    failed = progress.failed_items,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Sync pass finished"
                );
                self.inner.publisher.emit(EngineEvent::SyncCompleted {
                    progress: progress.clone(),
                });
            }
        }
        Some(progress)
    }

    async fn process_item(&self, item: QueueItem) -> ItemOutcome {
        let failed_dependency = {
            let state = self.inner.state.lock();
            item.dependencies
                .iter()
                .find(|dep| state.failed.contains(*dep))
                .cloned()
        };
        if let Some(dependency) = failed_dependency {
            return self
                .fail(item, FailureReason::DependencyFailed { dependency })
                .await;
        }

        let request = RemoteRequest::from_item(&item);
        match self.attempt(&request).await {
            Ok(ack) => self.commit(&item, ack.value).await,
            Err(RemoteError::Conflict(remote)) => self.settle_conflict(item, remote).await,
            Err(RemoteError::Rejected { status, message }) => {
                self.fail(item, FailureReason::Rejected { status, message })
                    .await
            }
            Err(e) => self.retry(item, e.to_string()).await,
        }
    }

    /// One bounded remote call.
    async fn attempt(&self, request: &RemoteRequest) -> Result<RemoteAck, RemoteError> {
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.inner.config.request_timeout,
            self.inner.remote.apply(request),
        )
        .await
        .unwrap_or(Err(RemoteError::Timeout));

        let elapsed = started.elapsed();
        self.inner
            .publisher
            .stats()
            .record_response(elapsed.as_millis() as u64);
        crate::metrics::record_remote_latency(&request.operation_name, elapsed);
        result
    }

    async fn settle_conflict(&self, item: QueueItem, remote: RemoteVersion) -> ItemOutcome {
        let now = self.now();
        let resolution = {
            let state = self.inner.state.lock();
            let base = state
                .optimistic
                .get(&item.id)
                .and_then(|s| s.prior.clone());
            let input = ConflictInput {
                item_id: item.id.clone(),
                entity_id: item.entity_key.clone().unwrap_or_else(|| item.id.clone()),
                operation_name: item.metadata.operation_name.clone(),
                policy: item.metadata.conflict_resolution,
                local: VersionedValue::new(item.payload.clone(), item.enqueued_at),
                remote,
                base,
            };
            state.resolver.resolve(input, now)
        };

        let record = match resolution {
            Resolution::Deferred(conflict) => {
                let parked = {
                    let mut state = self.inner.state.lock();
                    state.queue.park(&item.id);
                    state.pending.insert(item.id.clone(), conflict.clone());
                    state.pending.len()
                };
                crate::metrics::set_parked(parked);
                tracing::info!(
                    item_id = %item.id,
                    reason = ?conflict.reason,
                    "Conflict waiting for user decision"
                );
                self.inner
                    .publisher
                    .emit(EngineEvent::ConflictPending { conflict });
                return ItemOutcome::Parked;
            }
            Resolution::Resolved(record) => record,
        };

        tracing::info!(item_id = %item.id, strategy = ?record.strategy, "Conflict resolved");
        crate::metrics::record_conflict(strategy_label(&record));
        let entry = {
            let mut state = self.inner.state.lock();
            state.records.push(record.clone());
            state.record_audit(AuditRecord {
                entity_id: record.entity_id.clone(),
                item_id: Some(item.id.clone()),
                operation_name: Some(item.metadata.operation_name.clone()),
                actor: item.metadata.actor_id.clone(),
                before: Some(record.local.value.clone()),
                after: Some(record.resolved_value.clone()),
                outcome: AuditOutcome::ConflictResolved,
                timestamp: now,
            })
        };
        self.persist_audit(vec![entry]).await;

        if record.accepts_remote() {
            return self.commit(&item, Some(record.resolved_value)).await;
        }

        let mut rebased = item;
        rebased.payload = record.resolved_value;
        rebased.base_version = record.remote.version;
        self.store_rebased(&rebased).await;

        match self.attempt(&RemoteRequest::from_item(&rebased)).await {
            Ok(ack) => {
                let accepted = ack.value.or_else(|| Some(rebased.payload.clone()));
                self.commit(&rebased, accepted).await
            }
            Err(RemoteError::Rejected { status, message }) => {
                self.fail(rebased, FailureReason::Rejected { status, message })
                    .await
            }
            Err(e) => self.retry(rebased, e.to_string()).await,
        }
    }

    /// Write a rebased item to memory and storage. The local cache shows
    /// the rebased payload from here on.
    pub(crate) async fn store_rebased(&self, item: &QueueItem) {
        {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            if let Some(queued) = state.queue.get_mut(&item.id) {
                queued.payload = item.payload.clone();
                queued.base_version = item.base_version;
            }
            state
                .optimistic
                .reapply(&mut state.cache, &item.id, item.payload.clone());
        }
        if let Err(e) = self.inner.store.put_item(item).await {
            tracing::error!(item_id = %item.id, error = %e, "Failed to persist rebased item");
            crate::metrics::record_persistence_error("put_item");
        }
    }

    /// Finish an item the server accepted.
    pub(crate) async fn commit(
        &self,
        item: &QueueItem,
        server_value: Option<Value>,
    ) -> ItemOutcome {
        // A failed delete leaves the item on disk; after a restart it is
        // pushed again under the same idempotency key.
        if let Err(e) = self.inner.store.delete_item(&item.id).await {
            tracing::error!(item_id = %item.id, error = %e, "Failed to delete committed item");
            crate::metrics::record_persistence_error("delete_item");
        }

        let now = self.now();
        let (entry, depth) = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let snapshot = state.optimistic.commit(&item.id);
            let entity_id = item.entity_key.clone().unwrap_or_else(|| item.id.clone());

            // Newer local changes to the entity stay visible.
            if let (Some(key), Some(value)) = (&item.entity_key, &server_value) {
                if state.optimistic.for_entity(key).is_empty() {
                    state.cache.insert(key.clone(), value.clone());
                }
            }

            state.queue.remove(&item.id);
            state.pending.remove(&item.id);
            let after = server_value
                .clone()
                .or_else(|| snapshot.as_ref().map(|s| s.applied.clone()))
                .or_else(|| Some(item.payload.clone()));
            let entry = state.record_audit(AuditRecord {
                entity_id,
                item_id: Some(item.id.clone()),
                operation_name: Some(item.metadata.operation_name.clone()),
                actor: item.metadata.actor_id.clone(),
                before: snapshot.and_then(|s| s.prior),
                after,
                outcome: AuditOutcome::Committed,
                timestamp: now,
            });
            (entry, state.queue.len())
        };

        self.persist_audit(vec![entry]).await;
        self.inner.publisher.set_queue_depth(depth);
        tracing::debug!(item_id = %item.id, "Item committed");
        self.inner.publisher.emit(EngineEvent::QueueItemRemoved {
            item_id: item.id.clone(),
            reason: RemovalReason::Committed,
        });
        ItemOutcome::Committed
    }

    /// Terminal failure: remove the item and undo its optimistic write.
    async fn fail(&self, item: QueueItem, reason: FailureReason) -> ItemOutcome {
        if let Err(e) = self.inner.store.delete_item(&item.id).await {
            tracing::error!(item_id = %item.id, error = %e, "Failed to delete failed item");
            crate::metrics::record_persistence_error("delete_item");
        }

        let now = self.now();
        let (entry, depth) = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let snapshot = state.optimistic.rollback(&mut state.cache, &item.id);
            state.queue.remove(&item.id);
            state.pending.remove(&item.id);
            state.failed.insert(item.id.clone());
            let entry = state.record_audit(AuditRecord {
                entity_id: item.entity_key.clone().unwrap_or_else(|| item.id.clone()),
                item_id: Some(item.id.clone()),
                operation_name: Some(item.metadata.operation_name.clone()),
                actor: item.metadata.actor_id.clone(),
                before: snapshot.as_ref().map(|s| s.applied.clone()),
                after: snapshot.and_then(|s| s.prior),
                outcome: AuditOutcome::RolledBack,
                timestamp: now,
            });
            (entry, state.queue.len())
        };

        self.persist_audit(vec![entry]).await;
        self.inner.publisher.set_queue_depth(depth);
        tracing::warn!(
            item_id = %item.id,
            reason = %reason,
            "Item failed, optimistic change rolled back"
        );
        self.inner.publisher.emit(EngineEvent::QueueItemRemoved {
            item_id: item.id.clone(),
            reason: RemovalReason::Failed,
        });
        ItemOutcome::Failed { reason }
    }

    /// Transient failure: schedule another attempt or give up.
    async fn retry(&self, mut item: QueueItem, error: String) -> ItemOutcome {
        let exhausted = item.is_last_attempt();
        item.retry_count += 1;
        if exhausted {
            return self
                .fail(item, FailureReason::RetriesExhausted { last_error: error })
                .await;
        }

        let backoff = self.inner.config.backoff;
        let delay_ms = backoff.delay(item.retry_count, item.use_backoff);
        let next_attempt_at =
            backoff.next_attempt_at(self.now(), item.retry_count, item.use_backoff);
        item.next_attempt_at = Some(next_attempt_at);

        if let Err(e) = self.inner.store.put_item(&item).await {
            tracing::error!(item_id = %item.id, error = %e, "Failed to persist retry state");
            crate::metrics::record_persistence_error("put_item");
        }
        {
            let mut state = self.inner.state.lock();
            if let Some(queued) = state.queue.get_mut(&item.id) {
                queued.retry_count = item.retry_count;
                queued.next_attempt_at = item.next_attempt_at;
                queued.payload = item.payload.clone();
                queued.base_version = item.base_version;
            }
        }

        tracing::warn!(
            item_id = %item.id,
            attempt = item.retry_count,
            delay_ms,
            error = %error,
            "Transient failure, retry scheduled"
        );
        self.inner.scheduler.schedule(
            SyncTrigger::Retry {
                item_id: item.id.clone(),
            },
            Duration::from_millis(delay_ms),
        );
        ItemOutcome::Retrying {
            retry_count: item.retry_count,
            next_attempt_at,
            delay_ms,
        }
    }
}

impl SyncEngine {
    /// Settle a parked conflict.
    ///
    /// Keeping the remote value commits the item at once. Any other decision
    /// rewrites the item payload, rebases it on the remote version and
    /// releases it to the next pass.
    pub async fn resolve_conflict(
        &self,
        item_id: &str,
        decision: UserDecision,
    ) -> crate::error::Result<ConflictRecord> {
        self.ensure_ready()?;
        let now = self.now();
        let (record, item) = {
            let state = self.inner.state.lock();
            let pending = state
                .pending
                .get(item_id)
                .cloned()
                .ok_or_else(|| encore_engine::Error::NoPendingConflict(item_id.to_string()))?;
            let item = state
                .queue
                .get(item_id)
                .cloned()
                .ok_or_else(|| encore_engine::Error::ItemNotFound(item_id.to_string()))?;
            (state.resolver.decide(pending, decision, now), item)
        };

        let mut rebased = item.clone();
        if !record.accepts_remote() {
            rebased.payload = record.resolved_value.clone();
            rebased.base_version = record.remote.version;
            self.inner.store.put_item(&rebased).await?;
        }

        let (entry, parked) = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            state.pending.remove(item_id);
            state.records.push(record.clone());
            if let Some(queued) = state.queue.get_mut(item_id) {
                queued.payload = rebased.payload.clone();
                queued.base_version = rebased.base_version;
            }
            if !record.accepts_remote() {
                state
                    .optimistic
                    .reapply(&mut state.cache, item_id, rebased.payload.clone());
            }
            state.queue.unpark(item_id);
            let entry = state.record_audit(AuditRecord {
                entity_id: record.entity_id.clone(),
                item_id: Some(item.id.clone()),
                operation_name: Some(item.metadata.operation_name.clone()),
                actor: item.metadata.actor_id.clone(),
                before: Some(record.local.value.clone()),
                after: Some(record.resolved_value.clone()),
                outcome: AuditOutcome::ConflictResolved,
                timestamp: now,
            });
            (entry, state.pending.len())
        };
        self.persist_audit(vec![entry]).await;
        crate::metrics::set_parked(parked);
        crate::metrics::record_conflict(strategy_label(&record));
        tracing::info!(item_id = %item_id, "Conflict decided by user");

        if record.accepts_remote() {
            self.commit(&item, Some(record.resolved_value.clone())).await;
        } else {
            self.inner.scheduler.schedule(
                SyncTrigger::ConflictResolved {
                    item_id: item_id.to_string(),
                },
                Duration::ZERO,
            );
        }
        Ok(record)
    }
}

fn outcome_label(outcome: &ItemOutcome) -> &'static str {
    match outcome {
        ItemOutcome::Committed => "committed",
        ItemOutcome::Retrying { .. } => "retrying",
        ItemOutcome::Failed { .. } => "failed",
        ItemOutcome::Parked => "parked",
    }
}

fn strategy_label(record: &ConflictRecord) -> &'static str {
    match record.strategy {
        ResolutionStrategy::Overwrite => "overwrite",
        ResolutionStrategy::LastWriteWins => "last_write_wins",
        ResolutionStrategy::FieldMerge => "field_merge",
        ResolutionStrategy::UserDecision => "user_decision",
    }
}
