//! Queue item types.
//!
//! Every change a user makes while the remote side may be unreachable is
//! expressed as a [`QueueItem`]. The engine never looks inside the payload;
//! it only cares about priority, timing, retries and the entity it touches.

use crate::{EntityKey, ItemId, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Kind of work an item represents. Selects the remote endpoint family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Mutation,
    Query,
    FileUpload,
    UserAction,
}

impl OperationType {
    /// Stable storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Mutation => "MUTATION",
            OperationType::Query => "QUERY",
            OperationType::FileUpload => "FILE_UPLOAD",
            OperationType::UserAction => "USER_ACTION",
        }
    }

    /// Parse the storage name back.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MUTATION" => Some(OperationType::Mutation),
            "QUERY" => Some(OperationType::Query),
            "FILE_UPLOAD" => Some(OperationType::FileUpload),
            "USER_ACTION" => Some(OperationType::UserAction),
            _ => None,
        }
    }

    /// Whether a `null` payload is meaningless for this kind.
    pub fn requires_payload(&self) -> bool {
        matches!(self, OperationType::Mutation | OperationType::UserAction)
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing priority. Ordered so that `Critical > High > Medium > Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Retry cap for items of this priority.
    pub fn max_retries(&self) -> u32 {
        match self {
            Priority::Critical => 5,
            Priority::High => 3,
            Priority::Medium => 2,
            Priority::Low => 1,
        }
    }

    /// Numeric weight used in storage indexes (higher is more urgent).
    pub fn weight(&self) -> i64 {
        match self {
            Priority::Critical => 4,
            Priority::High => 3,
            Priority::Medium => 2,
            Priority::Low => 1,
        }
    }

    /// Inverse of [`Priority::weight`].
    pub fn from_weight(weight: i64) -> Option<Self> {
        match weight {
            4 => Some(Priority::Critical),
            3 => Some(Priority::High),
            2 => Some(Priority::Medium),
            1 => Some(Priority::Low),
            _ => None,
        }
    }
}

/// How a version conflict on this item should be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictPolicy {
    #[default]
    Merge,
    Overwrite,
    AskUser,
}

/// Metadata supplied by the caller with every item.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMetadata {
    /// User who produced the change
    pub actor_id: Option<String>,
    /// Organization the change belongs to
    pub tenant_id: Option<String>,
    /// Remote operation to invoke, e.g. `updateShow`
    pub operation_name: String,
    /// Conflict policy for this change
    pub conflict_resolution: ConflictPolicy,
}

impl ItemMetadata {
    pub fn new(operation_name: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
            ..Default::default()
        }
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_resolution = policy;
        self
    }
}

/// A request to enqueue work, before the engine assigns identity and time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewItem {
    pub operation_type: OperationType,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub metadata: ItemMetadata,
    pub dependencies: Vec<ItemId>,
    pub entity_key: Option<EntityKey>,
    pub use_backoff: bool,
}

impl NewItem {
    pub fn new(
        operation_type: OperationType,
        payload: serde_json::Value,
        priority: Priority,
        metadata: ItemMetadata,
    ) -> Self {
        Self {
            operation_type,
            payload,
            priority,
            metadata,
            dependencies: Vec::new(),
            entity_key: None,
            use_backoff: true,
        }
    }

    pub fn depends_on(mut self, id: impl Into<ItemId>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn for_entity(mut self, key: impl Into<EntityKey>) -> Self {
        self.entity_key = Some(key.into());
        self
    }

    pub fn without_backoff(mut self) -> Self {
        self.use_backoff = false;
        self
    }
}

/// A single pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Unique id, generated at enqueue time
    pub id: ItemId,
    /// Insertion sequence, breaks ties between equal timestamps
    pub seq: u64,
    pub operation_type: OperationType,
    /// Opaque to the engine
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub enqueued_at: Timestamp,
    pub retry_count: u32,
    pub max_retries: u32,
    pub use_backoff: bool,
    /// Items that must complete first
    #[serde(default)]
    pub dependencies: Vec<ItemId>,
    pub metadata: ItemMetadata,
    /// Logical entity the item mutates
    #[serde(default)]
    pub entity_key: Option<EntityKey>,
    /// Earliest time of the next attempt, set by retry scheduling
    #[serde(default)]
    pub next_attempt_at: Option<Timestamp>,
    /// Remote version the payload was rebased onto after a conflict
    #[serde(default)]
    pub base_version: Option<u64>,
}

impl QueueItem {
    /// Build an item from a request. `max_retries` follows the priority.
    pub fn from_request(id: impl Into<ItemId>, seq: u64, request: NewItem, now: Timestamp) -> Self {
        Self {
            id: id.into(),
            seq,
            operation_type: request.operation_type,
            payload: request.payload,
            priority: request.priority,
            enqueued_at: now,
            retry_count: 0,
            max_retries: request.priority.max_retries(),
            use_backoff: request.use_backoff,
            dependencies: request.dependencies,
            metadata: request.metadata,
            entity_key: request.entity_key,
            next_attempt_at: None,
            base_version: None,
        }
    }

    /// Whether the item may be attempted at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Whether another failure would make the item terminal.
    pub fn is_last_attempt(&self) -> bool {
        self.retry_count + 1 >= self.max_retries
    }

    /// Human readable label used in progress reports.
    pub fn label(&self) -> String {
        format!(
            "Processing {}: {}",
            self.operation_type, self.metadata.operation_name
        )
    }

    /// Ordering key: priority descending, then `enqueued_at`, then `seq`.
    pub fn queue_order(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.enqueued_at.cmp(&other.enqueued_at))
            .then_with(|| self.seq.cmp(&other.seq))
    }

    /// Whether `self` was enqueued before `other`, regardless of priority.
    pub fn enqueued_before(&self, other: &Self) -> bool {
        (self.enqueued_at, self.seq) < (other.enqueued_at, other.seq)
    }
}
