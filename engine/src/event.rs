//! Lifecycle events.
//!
//! The runtime publishes one [`Event`] per observable transition. Each event
//! belongs to a [`Topic`] and carries a metrics snapshot taken at publish
//! time.

use crate::{
    ItemId, NetworkQualityMetrics, PendingConflict, PerformanceMetrics, QualityTransition,
    QueueItem, SyncProgress, Timestamp,
};
use serde::{Deserialize, Serialize};

/// Subscription topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Topic {
    QueueItemAdded,
    QueueItemRemoved,
    QueueItemProcessed,
    SyncStarted,
    SyncCompleted,
    SyncFailed,
    NetworkChange,
    CacheHit,
    CacheMiss,
    BackgroundSync,
    ConflictPending,
}

impl Topic {
    pub const ALL: [Topic; 11] = [
        Topic::QueueItemAdded,
        Topic::QueueItemRemoved,
        Topic::QueueItemProcessed,
        Topic::SyncStarted,
        Topic::SyncCompleted,
        Topic::SyncFailed,
        Topic::NetworkChange,
        Topic::CacheHit,
        Topic::CacheMiss,
        Topic::BackgroundSync,
        Topic::ConflictPending,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::QueueItemAdded => "QUEUE_ITEM_ADDED",
            Topic::QueueItemRemoved => "QUEUE_ITEM_REMOVED",
            Topic::QueueItemProcessed => "QUEUE_ITEM_PROCESSED",
            Topic::SyncStarted => "SYNC_STARTED",
            Topic::SyncCompleted => "SYNC_COMPLETED",
            Topic::SyncFailed => "SYNC_FAILED",
            Topic::NetworkChange => "NETWORK_CHANGE",
            Topic::CacheHit => "CACHE_HIT",
            Topic::CacheMiss => "CACHE_MISS",
            Topic::BackgroundSync => "BACKGROUND_SYNC",
            Topic::ConflictPending => "CONFLICT_PENDING",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an item left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemovalReason {
    Committed,
    Failed,
    Cancelled,
    Cleared,
}

/// Why an item failed terminally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum FailureReason {
    /// Transient failures used up every retry
    RetriesExhausted { last_error: String },
    /// The remote side refused the change
    Rejected { status: u16, message: String },
    /// An item this one depends on failed
    DependencyFailed { dependency: ItemId },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::RetriesExhausted { last_error } => {
                write!(f, "retries exhausted: {last_error}")
            }
            FailureReason::Rejected { status, message } => {
                write!(f, "rejected with status {status}: {message}")
            }
            FailureReason::DependencyFailed { dependency } => {
                write!(f, "dependency {dependency} failed")
            }
        }
    }
}

/// Result of one processing attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum ItemOutcome {
    Committed,
    Retrying {
        retry_count: u32,
        next_attempt_at: Timestamp,
        delay_ms: u64,
    },
    Failed { reason: FailureReason },
    /// Waiting for a user's conflict decision
    Parked,
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Committed)
    }
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    QueueItemAdded {
        item: QueueItem,
    },
    QueueItemRemoved {
        item_id: ItemId,
        reason: RemovalReason,
    },
    QueueItemProcessed {
        item_id: ItemId,
        operation_name: String,
        outcome: ItemOutcome,
        progress: SyncProgress,
    },
    SyncStarted {
        progress: SyncProgress,
    },
    SyncCompleted {
        progress: SyncProgress,
    },
    SyncFailed {
        progress: SyncProgress,
        reason: String,
    },
    NetworkChange {
        transition: QualityTransition,
        metrics: Option<NetworkQualityMetrics>,
    },
    CacheHit {
        url: String,
        strategy: String,
    },
    CacheMiss {
        url: String,
        strategy: Option<String>,
    },
    BackgroundSync {
        tag: String,
    },
    ConflictPending {
        conflict: PendingConflict,
    },
}

impl EngineEvent {
    pub fn topic(&self) -> Topic {
        match self {
            EngineEvent::QueueItemAdded { .. } => Topic::QueueItemAdded,
            EngineEvent::QueueItemRemoved { .. } => Topic::QueueItemRemoved,
            EngineEvent::QueueItemProcessed { .. } => Topic::QueueItemProcessed,
            EngineEvent::SyncStarted { .. } => Topic::SyncStarted,
            EngineEvent::SyncCompleted { .. } => Topic::SyncCompleted,
            EngineEvent::SyncFailed { .. } => Topic::SyncFailed,
            EngineEvent::NetworkChange { .. } => Topic::NetworkChange,
            EngineEvent::CacheHit { .. } => Topic::CacheHit,
            EngineEvent::CacheMiss { .. } => Topic::CacheMiss,
            EngineEvent::BackgroundSync { .. } => Topic::BackgroundSync,
            EngineEvent::ConflictPending { .. } => Topic::ConflictPending,
        }
    }
}

/// Published envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub topic: Topic,
    pub timestamp: Timestamp,
    pub payload: EngineEvent,
    pub metrics: PerformanceMetrics,
}

impl Event {
    pub fn new(payload: EngineEvent, timestamp: Timestamp, metrics: PerformanceMetrics) -> Self {
        Self {
            topic: payload.topic(),
            timestamp,
            payload,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topic_follows_payload() {
        let event = Event::new(
            EngineEvent::BackgroundSync {
                tag: "background-sync-queue".into(),
            },
            7,
            PerformanceMetrics::default(),
        );
        assert_eq!(event.topic, Topic::BackgroundSync);
        assert_eq!(event.topic.to_string(), "BACKGROUND_SYNC");
    }

    #[test]
    fn topic_names_match_serde() {
        for topic in Topic::ALL {
            let json = serde_json::to_value(topic).unwrap();
            assert_eq!(json, json!(topic.as_str()));
        }
    }

    #[test]
    fn payload_wire_format() {
        let payload = EngineEvent::QueueItemRemoved {
            item_id: "item-1".into(),
            reason: RemovalReason::Cancelled,
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"type": "QUEUE_ITEM_REMOVED", "itemId": "item-1", "reason": "CANCELLED"})
        );

        let outcome = ItemOutcome::Failed {
            reason: FailureReason::Rejected {
                status: 422,
                message: "bad fee".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({
                "status": "FAILED",
                "reason": {"kind": "REJECTED", "status": 422, "message": "bad fee"}
            })
        );
    }

    #[test]
    fn failure_reason_display() {
        let reason = FailureReason::DependencyFailed {
            dependency: "item-0".into(),
        };
        assert_eq!(reason.to_string(), "dependency item-0 failed");
    }
}
