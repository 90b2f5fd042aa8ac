//! Integration tests for the sync engine: ordering, retries, rollback,
//! conflicts and lifecycle.

mod common;

use common::*;
use encore_client::{EngineError, PlatformSignal, RemoteAck, RemoteError, SyncTrigger};
use encore_engine::{
    AuditFilter, AuditOutcome, ConflictPolicy, EngineEvent, FailureReason, FieldDef, FieldRules,
    FieldType, ItemMetadata, ItemOutcome, NetworkQuality, NewItem, OperationSchema,
    OperationType, Priority, RemovalReason, ResolutionStrategy, Topic, UserDecision,
    VersionedValue,
};
use serde_json::json;
use std::time::Duration;

fn meta(op: &str) -> ItemMetadata {
    ItemMetadata::new(op).with_actor("tour-manager-1")
}

fn conflict(
    value: serde_json::Value,
    timestamp: u64,
    version: u64,
) -> Result<RemoteAck, RemoteError> {
    Err(RemoteError::Conflict(
        VersionedValue::new(value, timestamp).at_version(version),
    ))
}

#[cfg(test)]
mod ordering_tests {
    use super::*;

    #[tokio::test]
    async fn test_critical_item_jumps_ahead_of_earlier_low_items() {
        let h = offline_harness().await;
        for i in 0..5 {
            h.engine
                .add_to_offline_queue(
                    OperationType::Mutation,
                    json!({"n": i}),
                    Priority::Low,
                    meta(&format!("low-{i}")),
                )
                .await
                .unwrap();
        }
        h.engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({}),
                Priority::Critical,
                meta("critical"),
            )
            .await
            .unwrap();

        // Coming online with a non-empty queue starts a pass.
        h.go_online().await;

        assert_eq!(
            h.remote.call_order(),
            vec!["critical", "low-0", "low-1", "low-2", "low-3", "low-4"]
        );
        assert_eq!(h.engine.get_offline_queue_status().size, 0);
        assert_eq!(h.store.item_count(), 0);
    }

    #[tokio::test]
    async fn test_same_entity_keeps_enqueue_order_over_priority() {
        let h = offline_harness().await;
        h.engine
            .enqueue(
                NewItem::new(
                    OperationType::Mutation,
                    json!({"fee": 1}),
                    Priority::Low,
                    meta("first"),
                )
                .for_entity("show:1"),
            )
            .await
            .unwrap();
        h.engine
            .enqueue(
                NewItem::new(
                    OperationType::Mutation,
                    json!({"fee": 2}),
                    Priority::Critical,
                    meta("second"),
                )
                .for_entity("show:1"),
            )
            .await
            .unwrap();

        h.go_online().await;
        assert_eq!(h.remote.call_order(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_dependency_unblocked_in_same_pass() {
        let h = offline_harness().await;
        let parent = h
            .engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({}),
                Priority::Low,
                meta("createShow"),
            )
            .await
            .unwrap();
        h.engine
            .enqueue(
                NewItem::new(
                    OperationType::Mutation,
                    json!({}),
                    Priority::Critical,
                    meta("addContract"),
                )
                .depends_on(&parent),
            )
            .await
            .unwrap();

        h.go_online().await;
        assert_eq!(h.remote.call_order(), vec!["createShow", "addContract"]);
        assert_eq!(h.engine.get_offline_queue_status().size, 0);
    }

    #[tokio::test]
    async fn test_failed_dependency_fails_dependents() {
        let h = offline_harness().await;
        h.remote.respond(
            "createShow",
            Err(RemoteError::Rejected { status: 422, message: "invalid venue".into() }),
        );
        let parent = h
            .engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({}),
                Priority::High,
                meta("createShow"),
            )
            .await
            .unwrap();
        let child = h
            .engine
            .enqueue(
                NewItem::new(
                    OperationType::Mutation,
                    json!({}),
                    Priority::High,
                    meta("addContract"),
                )
                .depends_on(&parent),
            )
            .await
            .unwrap();
        let (_, mut processed) = h.engine.subscribe(Topic::QueueItemProcessed);

        h.go_online().await;

        assert_eq!(h.remote.call_order(), vec!["createShow"]);
        let outcomes: Vec<(String, ItemOutcome)> = drain(&mut processed)
            .into_iter()
            .filter_map(|e| match e.payload {
                EngineEvent::QueueItemProcessed {
                    item_id, outcome, ..
                } => Some((item_id, outcome)),
                _ => None,
            })
            .collect();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(
            outcomes[1],
            (
                child,
                ItemOutcome::Failed {
                    reason: FailureReason::DependencyFailed { dependency: parent.clone() }
                }
            )
        );

        // New work may not depend on it either.
        let err = h
            .engine
            .enqueue(
                NewItem::new(OperationType::Mutation, json!({}), Priority::High, meta("addRider"))
                    .depends_on(&parent),
            )
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }
}

#[cfg(test)]
mod retry_tests {
    use super::*;

    #[tokio::test]
    async fn test_committed_items_are_never_reprocessed() {
        let h = online_harness().await;
        h.engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({"fee": 100}),
                Priority::High,
                meta("updateShow"),
            )
            .await
            .unwrap();

        let first = h.engine.process_offline_queue().await;
        assert_eq!(first.completed_items, 1);
        let second = h.engine.process_offline_queue().await;
        assert_eq!(second.completed_items, 1, "empty pass keeps the last progress");

        assert_eq!(h.remote.call_count(), 1);
        assert_eq!(h.store.item_count(), 0);
        let committed = h.engine.audit_trail(&AuditFilter::outcome(AuditOutcome::Committed));
        assert_eq!(committed.len(), 1);
    }

    #[tokio::test]
    async fn test_idempotency_key_is_stable_across_retries() {
        let h = online_harness().await;
        h.remote
            .respond("updateShow", Err(RemoteError::Transient("502".into())));
        let id = h
            .engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({}),
                Priority::Critical,
                meta("updateShow"),
            )
            .await
            .unwrap();

        h.engine.process_offline_queue().await;
        h.clock.advance(60_000);
        h.engine.process_offline_queue().await;

        let calls = h.remote.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.item_id == id));
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_backoff() {
        let h = online_harness().await;
        h.remote
            .respond("updateShow", Err(RemoteError::Transient("503".into())));
        let id = h
            .engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({}),
                Priority::Critical,
                meta("updateShow"),
            )
            .await
            .unwrap();

        h.engine.process_offline_queue().await;

        let status = h.engine.get_offline_queue_status();
        assert_eq!(status.size, 1);
        assert_eq!(status.items[0].retry_count, 1);
        assert_eq!(status.items[0].next_attempt_at, Some(START + 2_000));
        assert_eq!(h.store.item(&id).unwrap().retry_count, 1);
        assert_eq!(h.scheduler.retries(), vec![(id.clone(), Duration::from_millis(2_000))]);

        // Not due yet.
        h.engine.process_offline_queue().await;
        assert_eq!(h.remote.call_count(), 1);

        h.clock.advance(2_000);
        h.engine.process_offline_queue().await;
        assert_eq!(h.remote.call_count(), 2);
        assert_eq!(h.engine.get_offline_queue_status().size, 0);
    }

    #[tokio::test]
    async fn test_retry_due_during_a_pass_runs_right_after_it() {
        let h = online_harness().await;
        h.remote
            .respond("flaky", Err(RemoteError::Transient("503".into())));
        h.engine
            .add_to_offline_queue(OperationType::Mutation, json!({}), Priority::High, meta("flaky"))
            .await
            .unwrap();
        h.engine
            .add_to_offline_queue(OperationType::Mutation, json!({}), Priority::Low, meta("slow"))
            .await
            .unwrap();
        let gate = h.remote.hold();

        let engine = h.engine.clone();
        let pass = tokio::spawn(async move { engine.process_offline_queue().await });
        h.remote.entered.notified().await;
        gate.notify_one();
        h.remote.entered.notified().await;
        assert_eq!(h.scheduler.retries().len(), 1);

        // The retry comes due and its trigger lands while "slow" is in flight.
        h.clock.advance(5_000);
        let coalesced = h.engine.process_offline_queue().await;
        assert!(coalesced.in_progress);

        h.remote.release();
        let progress = pass.await.unwrap();

        assert_eq!(progress.completed_items, 1);
        assert_eq!(h.remote.call_order(), vec!["flaky", "slow", "flaky"]);
        assert_eq!(h.engine.get_offline_queue_status().size, 0);
    }

    #[tokio::test]
    async fn test_fixed_delay_without_backoff() {
        let h = online_harness().await;
        h.remote
            .respond_times("ping", 2, Err(RemoteError::Transient("reset".into())));
        let id = h
            .engine
            .enqueue(
                NewItem::new(OperationType::UserAction, json!({}), Priority::Critical, meta("ping"))
                    .without_backoff(),
            )
            .await
            .unwrap();

        h.engine.process_offline_queue().await;
        h.clock.advance(1_000);
        h.engine.process_offline_queue().await;

        let delays: Vec<Duration> = h.scheduler.retries().into_iter().map(|(_, d)| d).collect();
        assert_eq!(delays, vec![Duration::from_millis(1_000); 2]);
        assert_eq!(h.store.item(&id).unwrap().retry_count, 2);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let h = online_harness().await;
        h.remote.set_delay(Duration::from_millis(500));
        h.engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({}),
                Priority::Critical,
                meta("updateShow"),
            )
            .await
            .unwrap();
        let (_, mut processed) = h.engine.subscribe(Topic::QueueItemProcessed);

        h.engine.process_offline_queue().await;

        let events = drain(&mut processed);
        assert!(matches!(
            events[0].payload,
            EngineEvent::QueueItemProcessed {
                outcome: ItemOutcome::Retrying { retry_count: 1, .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_exhausted_retries_restore_exact_prior_value() {
        let h = online_harness().await;
        h.engine.put_entity("show:1", json!({"fee": 100, "venue": "Paradiso"}));
        h.remote
            .respond("updateShow", Err(RemoteError::Transient("503".into())));

        let id = h
            .engine
            .enqueue_optimistic(
                "show:1",
                json!({"fee": 5000, "venue": "Paradiso"}),
                OperationType::Mutation,
                Priority::Low,
                meta("updateShow"),
            )
            .await
            .unwrap();
        assert_eq!(
            h.engine.cached_entity("show:1"),
            Some(json!({"fee": 5000, "venue": "Paradiso"}))
        );

        let progress = h.engine.process_offline_queue().await;

        assert_eq!(progress.failed_items, 1);
        assert_eq!(
            h.engine.cached_entity("show:1"),
            Some(json!({"fee": 100, "venue": "Paradiso"}))
        );
        assert_eq!(h.store.item_count(), 0);

        let rolled_back = h.engine.audit_trail(&AuditFilter::outcome(AuditOutcome::RolledBack));
        assert_eq!(rolled_back.len(), 1);
        assert_eq!(rolled_back[0].item_id.as_deref(), Some(id.as_str()));
        assert_eq!(rolled_back[0].before, Some(json!({"fee": 5000, "venue": "Paradiso"})));
        assert_eq!(rolled_back[0].after, Some(json!({"fee": 100, "venue": "Paradiso"})));
        assert_eq!(rolled_back[0].actor.as_deref(), Some("tour-manager-1"));
    }

    #[tokio::test]
    async fn test_rollback_of_new_entity_removes_it() {
        let h = online_harness().await;
        h.remote.respond(
            "createShow",
            Err(RemoteError::Rejected { status: 400, message: "bad date".into() }),
        );
        h.engine
            .enqueue_optimistic(
                "show:9",
                json!({"date": "2026-13-01"}),
                OperationType::Mutation,
                Priority::High,
                meta("createShow"),
            )
            .await
            .unwrap();

        h.engine.process_offline_queue().await;
        assert_eq!(h.engine.cached_entity("show:9"), None);
    }

    #[tokio::test]
    async fn test_permanent_rejection_fails_without_retry() {
        let h = online_harness().await;
        h.remote.respond(
            "updateShow",
            Err(RemoteError::Rejected { status: 422, message: "fee must be positive".into() }),
        );
        let id = h
            .engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({"fee": -1}),
                Priority::Critical,
                meta("updateShow"),
            )
            .await
            .unwrap();
        let (_, mut removed) = h.engine.subscribe(Topic::QueueItemRemoved);

        h.engine.process_offline_queue().await;

        assert_eq!(h.remote.call_count(), 1);
        assert!(h.scheduler.retries().is_empty());
        let events = drain(&mut removed);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].payload,
            EngineEvent::QueueItemRemoved { item_id: id, reason: RemovalReason::Failed }
        );
    }
}

#[cfg(test)]
mod conflict_tests {
    use super::*;

    #[tokio::test]
    async fn test_newer_remote_wins_last_write() {
        let h = online_harness().await;
        h.engine.put_entity("show:1", json!({"fee": 100}));
        h.engine
            .enqueue_optimistic(
                "show:1",
                json!({"fee": 200}),
                OperationType::Mutation,
                Priority::High,
                meta("updateShow"),
            )
            .await
            .unwrap();
        h.remote
            .respond("updateShow", conflict(json!({"fee": 900}), START + 10, 7));

        h.engine.process_offline_queue().await;

        assert_eq!(h.remote.call_count(), 1);
        assert_eq!(h.engine.cached_entity("show:1"), Some(json!({"fee": 900})));
        let records = h.engine.conflict_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].strategy, ResolutionStrategy::LastWriteWins);
        assert_eq!(records[0].local.value, json!({"fee": 200}));
        assert_eq!(records[0].remote.value, json!({"fee": 900}));
        assert_eq!(h.engine.get_offline_queue_status().size, 0);
    }

    #[tokio::test]
    async fn test_newer_local_is_pushed_again_on_remote_version() {
        let h = online_harness().await;
        h.engine
            .enqueue_optimistic(
                "show:1",
                json!({"fee": 200}),
                OperationType::Mutation,
                Priority::High,
                meta("updateShow"),
            )
            .await
            .unwrap();
        h.remote
            .respond("updateShow", conflict(json!({"fee": 900}), START - 10, 7));

        h.engine.process_offline_queue().await;

        let calls = h.remote.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].base_version, None);
        assert_eq!(calls[1].base_version, Some(7));
        assert_eq!(calls[1].payload, json!({"fee": 200}));
        assert_eq!(h.engine.cached_entity("show:1"), Some(json!({"fee": 200})));
    }

    #[tokio::test]
    async fn test_field_merge_keeps_disjoint_changes() {
        let h = online_harness().await;
        h.engine.register_merge("updateShow", FieldRules::new());
        h.engine.put_entity("show:1", json!({"fee": 100, "venue": "Paradiso"}));
        h.engine
            .enqueue_optimistic(
                "show:1",
                json!({"fee": 250, "venue": "Paradiso"}),
                OperationType::Mutation,
                Priority::High,
                meta("updateShow").with_policy(ConflictPolicy::Merge),
            )
            .await
            .unwrap();
        h.remote.respond(
            "updateShow",
            conflict(json!({"fee": 100, "venue": "Melkweg"}), START + 5, 3),
        );

        h.engine.process_offline_queue().await;

        let merged = json!({"fee": 250, "venue": "Melkweg"});
        let calls = h.remote.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].payload, merged);
        assert_eq!(calls[1].base_version, Some(3));
        assert_eq!(h.engine.conflict_records()[0].strategy, ResolutionStrategy::FieldMerge);
        assert_eq!(h.engine.cached_entity("show:1"), Some(merged));
    }

    #[tokio::test]
    async fn test_ask_user_parks_until_decision() {
        let h = online_harness().await;
        let id = h
            .engine
            .enqueue_optimistic(
                "contract:4",
                json!({"status": "signed"}),
                OperationType::Mutation,
                Priority::Critical,
                meta("updateContract").with_policy(ConflictPolicy::AskUser),
            )
            .await
            .unwrap();
        h.remote.respond(
            "updateContract",
            conflict(json!({"status": "cancelled"}), START + 20, 4),
        );
        let (_, mut pending) = h.engine.subscribe(Topic::ConflictPending);

        h.engine.process_offline_queue().await;

        assert_eq!(drain(&mut pending).len(), 1);
        assert_eq!(h.engine.pending_conflicts().len(), 1);
        assert_eq!(h.engine.get_offline_queue_status().parked, 1);

        // Parked items are skipped.
        h.clock.advance(60_000);
        h.engine.process_offline_queue().await;
        assert_eq!(h.remote.call_count(), 1);

        let record = h
            .engine
            .resolve_conflict(&id, UserDecision::KeepLocal)
            .await
            .unwrap();
        assert_eq!(record.strategy, ResolutionStrategy::UserDecision);
        assert_eq!(record.resolved_value, json!({"status": "signed"}));
        assert!(h
            .scheduler
            .scheduled()
            .contains(&(SyncTrigger::ConflictResolved { item_id: id.clone() }, Duration::ZERO)));
        assert!(h.engine.pending_conflicts().is_empty());

        h.engine.process_offline_queue().await;
        let calls = h.remote.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].base_version, Some(4));
        assert_eq!(h.engine.get_offline_queue_status().size, 0);
    }

    #[tokio::test]
    async fn test_custom_decision_is_what_the_cache_shows() {
        let h = online_harness().await;
        h.engine.put_entity("contract:4", json!({"status": "draft"}));
        let id = h
            .engine
            .enqueue_optimistic(
                "contract:4",
                json!({"status": "signed"}),
                OperationType::Mutation,
                Priority::Critical,
                meta("updateContract").with_policy(ConflictPolicy::AskUser),
            )
            .await
            .unwrap();
        h.remote.respond(
            "updateContract",
            conflict(json!({"status": "cancelled"}), START + 20, 4),
        );
        h.engine.process_offline_queue().await;

        let decided = json!({"status": "on-hold"});
        let record = h
            .engine
            .resolve_conflict(&id, UserDecision::Custom(decided.clone()))
            .await
            .unwrap();
        assert_eq!(record.resolved_value, decided);
        assert_eq!(h.engine.cached_entity("contract:4"), Some(decided.clone()));

        // The server acknowledges without a body.
        h.engine.process_offline_queue().await;

        let calls = h.remote.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].payload, decided);
        assert_eq!(calls[1].base_version, Some(4));
        assert_eq!(h.engine.get_offline_queue_status().size, 0);
        assert_eq!(h.engine.cached_entity("contract:4"), Some(decided.clone()));

        let committed = h
            .engine
            .audit_trail(&AuditFilter::outcome(AuditOutcome::Committed));
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].before, Some(json!({"status": "draft"})));
        assert_eq!(committed[0].after, Some(decided));
    }

    #[tokio::test]
    async fn test_keep_remote_commits_immediately() {
        let h = online_harness().await;
        h.engine.put_entity("contract:4", json!({"status": "draft"}));
        let id = h
            .engine
            .enqueue_optimistic(
                "contract:4",
                json!({"status": "signed"}),
                OperationType::Mutation,
                Priority::Critical,
                meta("updateContract").with_policy(ConflictPolicy::AskUser),
            )
            .await
            .unwrap();
        h.remote.respond(
            "updateContract",
            conflict(json!({"status": "cancelled"}), START + 20, 4),
        );
        h.engine.process_offline_queue().await;

        h.engine
            .resolve_conflict(&id, UserDecision::KeepRemote)
            .await
            .unwrap();

        assert_eq!(h.remote.call_count(), 1);
        assert_eq!(h.engine.get_offline_queue_status().size, 0);
        assert_eq!(h.engine.cached_entity("contract:4"), Some(json!({"status": "cancelled"})));
    }

    #[tokio::test]
    async fn test_resolving_unknown_conflict_fails() {
        let h = online_harness().await;
        let err = h
            .engine
            .resolve_conflict("missing", UserDecision::KeepLocal)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(encore_engine::Error::NoPendingConflict(_))
        ));
    }
}

#[cfg(test)]
mod queue_management_tests {
    use super::*;
    use async_trait::async_trait;
    use encore_client::{DurableStore, EngineDeps, MemoryStore, StoreError, SyncEngine};
    use encore_engine::{
        AuditLogEntry, CachedResponse, ItemId, PerformanceSample, QueueItem, Timestamp,
    };
    use std::sync::Arc;
    use tokio::sync::Notify;

    /// Memory store whose batch deletes can be held open.
    struct GatedStore {
        inner: Arc<MemoryStore>,
        gate: parking_lot::Mutex<Option<Arc<Notify>>>,
        deleting: Notify,
    }

    impl GatedStore {
        fn new(inner: Arc<MemoryStore>) -> Self {
            Self {
                inner,
                gate: parking_lot::Mutex::new(None),
                deleting: Notify::new(),
            }
        }

        fn hold_batch_deletes(&self) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            *self.gate.lock() = Some(Arc::clone(&gate));
            gate
        }
    }

    #[async_trait]
    impl DurableStore for GatedStore {
        async fn put_item(&self, item: &QueueItem) -> Result<(), StoreError> {
            self.inner.put_item(item).await
        }

        async fn delete_item(&self, id: &str) -> Result<(), StoreError> {
            self.inner.delete_item(id).await
        }

        async fn delete_items(&self, ids: &[ItemId]) -> Result<(), StoreError> {
            self.deleting.notify_one();
            let gate = self.gate.lock().take();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            self.inner.delete_items(ids).await
        }

        async fn load_items(&self) -> Result<Vec<QueueItem>, StoreError> {
            self.inner.load_items().await
        }

        async fn load_items_by_type(
            &self,
            operation_type: OperationType,
        ) -> Result<Vec<QueueItem>, StoreError> {
            self.inner.load_items_by_type(operation_type).await
        }

        async fn put_cached(&self, response: &CachedResponse) -> Result<(), StoreError> {
            self.inner.put_cached(response).await
        }

        async fn delete_cached(&self, url: &str) -> Result<(), StoreError> {
            self.inner.delete_cached(url).await
        }

        async fn load_cached(&self) -> Result<Vec<CachedResponse>, StoreError> {
            self.inner.load_cached().await
        }

        async fn record_metrics(&self, sample: &PerformanceSample) -> Result<(), StoreError> {
            self.inner.record_metrics(sample).await
        }

        async fn metrics_since(
            &self,
            since: Timestamp,
        ) -> Result<Vec<PerformanceSample>, StoreError> {
            self.inner.metrics_since(since).await
        }

        async fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), StoreError> {
            self.inner.append_audit(entry).await
        }

        async fn load_audit(&self) -> Result<Vec<AuditLogEntry>, StoreError> {
            self.inner.load_audit().await
        }
    }

    #[tokio::test]
    async fn test_remove_rolls_back_and_reports_cancel() {
        let h = offline_harness().await;
        h.engine.put_entity("show:1", json!({"fee": 100}));
        let id = h
            .engine
            .enqueue_optimistic(
                "show:1",
                json!({"fee": 300}),
                OperationType::Mutation,
                Priority::High,
                meta("updateShow"),
            )
            .await
            .unwrap();
        let (_, mut removed) = h.engine.subscribe(Topic::QueueItemRemoved);

        h.engine.remove(&id).await.unwrap();

        assert_eq!(h.engine.cached_entity("show:1"), Some(json!({"fee": 100})));
        assert_eq!(h.store.item_count(), 0);
        assert_eq!(
            drain(&mut removed)[0].payload,
            EngineEvent::QueueItemRemoved { item_id: id.clone(), reason: RemovalReason::Cancelled }
        );

        let err = h.engine.remove(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(encore_engine::Error::ItemNotFound(_))));
    }

    #[tokio::test]
    async fn test_clear_undoes_every_optimistic_change() {
        let h = offline_harness().await;
        h.engine.put_entity("show:1", json!({"fee": 100}));
        h.engine
            .enqueue_optimistic(
                "show:1",
                json!({"fee": 200}),
                OperationType::Mutation,
                Priority::High,
                meta("updateShow"),
            )
            .await
            .unwrap();
        h.engine
            .enqueue_optimistic(
                "show:1",
                json!({"fee": 300}),
                OperationType::Mutation,
                Priority::High,
                meta("updateShow"),
            )
            .await
            .unwrap();
        h.engine
            .enqueue_optimistic(
                "show:2",
                json!({"fee": 50}),
                OperationType::Mutation,
                Priority::Low,
                meta("createShow"),
            )
            .await
            .unwrap();
        let (_, mut removed) = h.engine.subscribe(Topic::QueueItemRemoved);

        h.engine.clear_offline_queue().await.unwrap();

        assert_eq!(h.engine.get_offline_queue_status().size, 0);
        assert_eq!(h.store.item_count(), 0);
        assert_eq!(h.engine.cached_entity("show:1"), Some(json!({"fee": 100})));
        assert_eq!(h.engine.cached_entity("show:2"), None);
        assert_eq!(drain(&mut removed).len(), 3);
        assert_eq!(
            h.engine.audit_trail(&AuditFilter::outcome(AuditOutcome::RolledBack)).len(),
            3
        );
    }

    #[tokio::test]
    async fn test_clear_keeps_items_enqueued_while_it_runs() {
        let store = Arc::new(MemoryStore::new());
        let gated = Arc::new(GatedStore::new(store.clone()));
        let deps = EngineDeps::new(
            gated.clone(),
            Arc::new(MockRemote::default()),
            Arc::new(RecordingScheduler::default()),
        );
        let engine = SyncEngine::new(test_config(), deps).unwrap();
        engine.init().await.unwrap();
        let old = engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({}),
                Priority::High,
                meta("updateShow"),
            )
            .await
            .unwrap();

        let gate = gated.hold_batch_deletes();
        let clearing = engine.clone();
        let clear = tokio::spawn(async move { clearing.clear_offline_queue().await });
        gated.deleting.notified().await;

        let fresh = engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({}),
                Priority::Low,
                meta("createShow"),
            )
            .await
            .unwrap();
        gate.notify_one();
        clear.await.unwrap().unwrap();

        assert!(store.item(&old).is_none());
        assert!(store.item(&fresh).is_some());
        let status = engine.get_offline_queue_status();
        assert_eq!(status.size, 1);
        assert_eq!(status.items[0].id, fresh);
    }

    #[tokio::test]
    async fn test_in_flight_item_cannot_be_removed() {
        let h = online_harness().await;
        let id = h
            .engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({}),
                Priority::High,
                meta("updateShow"),
            )
            .await
            .unwrap();
        h.remote.hold();

        let engine = h.engine.clone();
        let pass = tokio::spawn(async move { engine.process_offline_queue().await });
        h.remote.entered.notified().await;

        let err = h.engine.remove(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(encore_engine::Error::ItemInFlight(_))));

        h.remote.release();
        let progress = pass.await.unwrap();
        assert_eq!(progress.completed_items, 1);
    }

    #[tokio::test]
    async fn test_queued_by_type_reads_durable_queue() {
        let h = offline_harness().await;
        h.engine
            .add_to_offline_queue(
                OperationType::FileUpload,
                json!({"file": "rider.pdf"}),
                Priority::Low,
                meta("uploadRider"),
            )
            .await
            .unwrap();
        h.engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({}),
                Priority::High,
                meta("updateShow"),
            )
            .await
            .unwrap();

        let uploads = h.engine.queued_by_type(OperationType::FileUpload).await.unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].metadata.operation_name, "uploadRider");
    }
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_requests_are_rejected_before_persisting() {
        let h = offline_harness().await;

        let err = h
            .engine
            .add_to_offline_queue(OperationType::Mutation, json!({}), Priority::High, meta("  "))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = h
            .engine
            .add_to_offline_queue(
                OperationType::Mutation,
                serde_json::Value::Null,
                Priority::High,
                meta("updateShow"),
            )
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = h
            .engine
            .enqueue_optimistic(
                "",
                json!({}),
                OperationType::Mutation,
                Priority::High,
                meta("updateShow"),
            )
            .await
            .unwrap_err();
        assert!(err.is_validation());

        h.engine.register_schema(OperationSchema::new(
            "updateShow",
            vec![
                FieldDef::required("id", FieldType::String),
                FieldDef::optional("fee", FieldType::Float),
            ],
        ));
        let err = h
            .engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({"fee": 10.5}),
                Priority::High,
                meta("updateShow"),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(encore_engine::Error::MissingRequiredField(_))
        ));

        assert_eq!(h.store.item_count(), 0);
        assert_eq!(h.engine.get_offline_queue_status().size, 0);
    }

    #[tokio::test]
    async fn test_store_failure_fails_enqueue() {
        let h = offline_harness().await;
        let (_, mut added) = h.engine.subscribe(Topic::QueueItemAdded);
        h.store.fail_writes(true);

        let err = h
            .engine
            .enqueue_optimistic(
                "show:1",
                json!({"fee": 1}),
                OperationType::Mutation,
                Priority::High,
                meta("updateShow"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Persistence(_)));
        assert_eq!(h.engine.get_offline_queue_status().size, 0);
        assert_eq!(h.engine.cached_entity("show:1"), None);
        assert!(drain(&mut added).is_empty());
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;
    use encore_client::{ManualObserver, MemoryStore, SyncEngine, TokioScheduler};
    use encore_engine::{CacheStrategy, ConnectivitySample};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_calls_before_init_are_not_ready() {
        let h = build(Arc::new(MemoryStore::new()), CacheStrategy::defaults());
        let err = h
            .engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({}),
                Priority::High,
                meta("updateShow"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotReady));
        assert!(!h.engine.is_ready());
    }

    #[tokio::test]
    async fn test_failed_init_leaves_engine_not_ready() {
        let store = Arc::new(MemoryStore::new());
        store.fail_reads(true);
        let h = build(store, CacheStrategy::defaults());

        assert!(matches!(h.engine.init().await, Err(EngineError::Persistence(_))));
        assert!(!h.engine.is_ready());
        assert!(matches!(
            h.engine.queued_by_type(OperationType::Mutation).await,
            Err(EngineError::NotReady)
        ));
    }

    #[tokio::test]
    async fn test_init_restores_queue_from_store() {
        let store = Arc::new(MemoryStore::new());
        let first = harness_with(store.clone(), CacheStrategy::defaults()).await;
        let id = first
            .engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({"fee": 1}),
                Priority::High,
                meta("updateShow"),
            )
            .await
            .unwrap();
        first.engine.dispose().await;

        let second = harness_with(store, CacheStrategy::defaults()).await;
        let status = second.engine.get_offline_queue_status();
        assert_eq!(status.size, 1);
        assert_eq!(status.items[0].id, id);

        second.go_online().await;
        assert_eq!(second.remote.calls()[0].item_id, id);
    }

    #[tokio::test]
    async fn test_disposed_engine_refuses_calls() {
        let h = online_harness().await;
        h.engine.dispose().await;
        h.engine.dispose().await;

        assert!(matches!(h.engine.init().await, Err(EngineError::Disposed)));
        let err = h
            .engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({}),
                Priority::High,
                meta("updateShow"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Disposed));
        let progress = h.engine.process_offline_queue().await;
        assert!(!progress.in_progress);
    }

    #[tokio::test]
    async fn test_offline_pass_is_skipped() {
        let h = offline_harness().await;
        h.engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({}),
                Priority::High,
                meta("updateShow"),
            )
            .await
            .unwrap();

        let progress = h.engine.process_offline_queue().await;

        assert_eq!(h.remote.call_count(), 0);
        assert!(!progress.in_progress);
        assert_eq!(progress.total_items, 1);
        assert_eq!(progress.network_quality, NetworkQuality::Offline);
    }

    #[tokio::test]
    async fn test_network_change_is_published() {
        let h = offline_harness().await;
        let (_, mut changes) = h.engine.subscribe(Topic::NetworkChange);

        h.go_online().await;
        h.go_online().await;
        h.go_offline().await;

        let events = drain(&mut changes);
        assert_eq!(events.len(), 2);
        match &events[0].payload {
            EngineEvent::NetworkChange { transition, .. } => {
                assert_eq!(transition.from, NetworkQuality::Offline);
                assert_eq!(transition.to, NetworkQuality::Good);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_visibility_and_background_signals_sync() {
        let h = online_harness().await;
        h.engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({}),
                Priority::High,
                meta("hidden"),
            )
            .await
            .unwrap();
        h.engine.handle_signal(PlatformSignal::Visibility { visible: false }).await;
        assert_eq!(h.remote.call_count(), 0);

        h.engine.handle_signal(PlatformSignal::Visibility { visible: true }).await;
        assert_eq!(h.remote.call_order(), vec!["hidden"]);

        h.engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({}),
                Priority::High,
                meta("background"),
            )
            .await
            .unwrap();
        let (_, mut background) = h.engine.subscribe(Topic::BackgroundSync);
        h.engine
            .handle_signal(PlatformSignal::BackgroundSync { tag: "outbox".into() })
            .await;
        assert_eq!(drain(&mut background).len(), 1);
        assert_eq!(h.remote.call_order(), vec!["hidden", "background"]);
    }

    #[tokio::test]
    async fn test_pass_events_and_metrics_sample() {
        let h = online_harness().await;
        h.engine
            .add_to_offline_queue(OperationType::Mutation, json!({}), Priority::High, meta("a"))
            .await
            .unwrap();
        h.engine
            .add_to_offline_queue(OperationType::Mutation, json!({}), Priority::Low, meta("b"))
            .await
            .unwrap();
        let (_, mut started) = h.engine.subscribe(Topic::SyncStarted);
        let (_, mut processed) = h.engine.subscribe(Topic::QueueItemProcessed);
        let (_, mut completed) = h.engine.subscribe(Topic::SyncCompleted);

        let progress = h.engine.process_offline_queue().await;

        assert_eq!(progress.total_items, 2);
        assert_eq!(progress.completed_items, 2);
        assert!(!progress.in_progress);

        let started = drain(&mut started);
        assert_eq!(started.len(), 1);
        assert!(matches!(
            &started[0].payload,
            EngineEvent::SyncStarted { progress } if progress.in_progress
        ));

        let processed = drain(&mut processed);
        assert_eq!(processed.len(), 2);
        match &processed[1].payload {
            EngineEvent::QueueItemProcessed { progress, .. } => {
                assert_eq!(progress.completed_items, 2)
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(drain(&mut completed).len(), 1);

        let history = h.engine.performance_history(START).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].metrics.offline_queue_size, 0);
        assert_eq!(h.engine.get_performance_metrics().offline_queue_size, 0);
    }

    #[tokio::test]
    async fn test_connectivity_lost_mid_pass_fails_sync() {
        let h = online_harness().await;
        h.engine
            .add_to_offline_queue(OperationType::Mutation, json!({}), Priority::High, meta("first"))
            .await
            .unwrap();
        h.engine
            .add_to_offline_queue(OperationType::Mutation, json!({}), Priority::Low, meta("second"))
            .await
            .unwrap();
        let (_, mut failed) = h.engine.subscribe(Topic::SyncFailed);
        h.remote.hold();

        let engine = h.engine.clone();
        let pass = tokio::spawn(async move { engine.process_offline_queue().await });
        h.remote.entered.notified().await;

        // A trigger during a pass is coalesced and sees live progress.
        let live = h.engine.process_offline_queue().await;
        assert!(live.in_progress);
        assert_eq!(live.total_items, 2);

        h.go_offline().await;
        h.remote.release();
        let progress = pass.await.unwrap();

        assert_eq!(progress.completed_items, 1);
        assert_eq!(h.remote.call_order(), vec!["first"]);
        assert_eq!(h.engine.get_offline_queue_status().size, 1);
        let events = drain(&mut failed);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0].payload,
            EngineEvent::SyncFailed { reason, .. } if reason == "Connectivity lost"
        ));
    }

    #[tokio::test]
    async fn test_driver_applies_connectivity_loss_during_a_pass() {
        let remote = Arc::new(MockRemote::default());
        let (scheduler, triggers) = TokioScheduler::new();
        let deps = encore_client::EngineDeps::new(
            Arc::new(MemoryStore::new()),
            remote.clone(),
            Arc::new(scheduler),
        );
        let engine = SyncEngine::new(test_config(), deps).unwrap();
        engine.init().await.unwrap();
        engine
            .add_to_offline_queue(OperationType::Mutation, json!({}), Priority::High, meta("first"))
            .await
            .unwrap();
        engine
            .add_to_offline_queue(OperationType::Mutation, json!({}), Priority::Low, meta("second"))
            .await
            .unwrap();
        let (_, mut failures) = engine.subscribe(Topic::SyncFailed);
        remote.hold();

        let observer = ManualObserver::new(ConnectivitySample::offline());
        engine.spawn_driver(&observer, triggers).unwrap();
        observer.set_online(true);
        remote.entered.notified().await;

        // "first" is still in flight when the link drops.
        observer.set_online(false);
        assert!(wait_until(|| engine.network_quality() == NetworkQuality::Offline).await);

        remote.release();
        let mut failed = Vec::new();
        assert!(
            wait_until(|| {
                failed.extend(drain(&mut failures));
                !failed.is_empty()
            })
            .await
        );
        assert!(matches!(
            &failed[0].payload,
            EngineEvent::SyncFailed { reason, .. } if reason == "Connectivity lost"
        ));
        assert_eq!(remote.call_order(), vec!["first"]);
        assert_eq!(engine.get_offline_queue_status().size, 1);

        engine.dispose().await;
    }

    #[tokio::test]
    async fn test_driver_syncs_after_enqueue() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MockRemote::default());
        let (scheduler, triggers) = TokioScheduler::new();
        let deps = encore_client::EngineDeps::new(store, remote.clone(), Arc::new(scheduler));
        let engine = SyncEngine::new(test_config(), deps).unwrap();
        engine.init().await.unwrap();

        let observer = ManualObserver::new(ConnectivitySample::offline());
        engine.spawn_driver(&observer, triggers).unwrap();
        observer.set_online(true);
        assert!(wait_until(|| engine.network_quality() == NetworkQuality::Good).await);

        engine
            .add_to_offline_queue(
                OperationType::Mutation,
                json!({}),
                Priority::High,
                meta("updateShow"),
            )
            .await
            .unwrap();

        assert!(wait_until(|| engine.get_offline_queue_status().size == 0).await);
        assert_eq!(remote.call_count(), 1);

        engine.dispose().await;
        assert!(!engine.is_ready());
    }
}
