//! Append-only audit trail.
//!
//! Every terminal outcome of a queue item and every conflict resolution is
//! recorded here with the value before and after the change. Entries are
//! numbered with a strictly increasing sequence and are never updated or
//! removed.

use crate::{EntityKey, ItemId, Timestamp};
use serde::{Deserialize, Serialize};

/// Result recorded for an audited change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Committed,
    RolledBack,
    ConflictResolved,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Committed => "COMMITTED",
            AuditOutcome::RolledBack => "ROLLED_BACK",
            AuditOutcome::ConflictResolved => "CONFLICT_RESOLVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "COMMITTED" => Some(AuditOutcome::Committed),
            "ROLLED_BACK" => Some(AuditOutcome::RolledBack),
            "CONFLICT_RESOLVED" => Some(AuditOutcome::ConflictResolved),
            _ => None,
        }
    }
}

/// An entry before the trail assigns its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub entity_id: EntityKey,
    pub item_id: Option<ItemId>,
    pub operation_name: Option<String>,
    pub actor: Option<String>,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub outcome: AuditOutcome,
    pub timestamp: Timestamp,
}

/// One immutable audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub seq: u64,
    pub entity_id: EntityKey,
    #[serde(default)]
    pub item_id: Option<ItemId>,
    #[serde(default)]
    pub operation_name: Option<String>,
    pub actor: Option<String>,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub outcome: AuditOutcome,
    pub timestamp: Timestamp,
}

/// Filter for [`AuditTrail::query`]. Empty fields match everything; the
/// time window is inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditFilter {
    pub entity_id: Option<EntityKey>,
    pub outcome: Option<AuditOutcome>,
    pub actor: Option<String>,
    pub after: Option<Timestamp>,
    pub before: Option<Timestamp>,
}

impl AuditFilter {
    pub fn entity(entity_id: impl Into<EntityKey>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            ..Default::default()
        }
    }

    pub fn outcome(outcome: AuditOutcome) -> Self {
        Self {
            outcome: Some(outcome),
            ..Default::default()
        }
    }

    fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.entity_id.as_ref().map_or(true, |e| *e == entry.entity_id)
            && self.outcome.map_or(true, |o| o == entry.outcome)
            && self
                .actor
                .as_ref()
                .map_or(true, |a| entry.actor.as_ref() == Some(a))
            && self.after.map_or(true, |t| entry.timestamp >= t)
            && self.before.map_or(true, |t| entry.timestamp <= t)
    }
}

/// In-memory audit trail.
#[derive(Debug, Clone, Default)]
pub struct AuditTrail {
    entries: Vec<AuditLogEntry>,
    next_seq: u64,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries. The sequence continues after the
    /// highest one seen.
    pub fn restore(entries: impl IntoIterator<Item = AuditLogEntry>) -> Self {
        let mut entries: Vec<_> = entries.into_iter().collect();
        entries.sort_by_key(|e| e.seq);
        let next_seq = entries.last().map_or(0, |e| e.seq + 1);
        Self { entries, next_seq }
    }

    /// Append an entry, assigning the next sequence number.
    pub fn record(&mut self, record: AuditRecord) -> &AuditLogEntry {
        let entry = AuditLogEntry {
            seq: self.next_seq,
            entity_id: record.entity_id,
            item_id: record.item_id,
            operation_name: record.operation_name,
            actor: record.actor,
            before: record.before,
            after: record.after,
            outcome: record.outcome,
            timestamp: record.timestamp,
        };
        self.next_seq += 1;
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    /// All entries in sequence order.
    pub fn entries(&self) -> &[AuditLogEntry] {
        &self.entries
    }

    pub fn query(&self, filter: &AuditFilter) -> Vec<&AuditLogEntry> {
        self.entries.iter().filter(|e| filter.matches(e)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pretty printed JSON array of every entry.
    pub fn export_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.entries)
    }

    /// CSV export with one quoted row per entry. Timestamps are epoch
    /// milliseconds.
    pub fn export_csv(&self) -> String {
        let mut out = String::from("Seq,Timestamp,Outcome,Entity ID,Item ID,Operation,Actor");
        for entry in &self.entries {
            let cells = [
                entry.seq.to_string(),
                entry.timestamp.to_string(),
                entry.outcome.as_str().to_string(),
                entry.entity_id.clone(),
                entry.item_id.clone().unwrap_or_default(),
                entry.operation_name.clone().unwrap_or_default(),
                entry.actor.clone().unwrap_or_default(),
            ];
            out.push('\n');
            let row: Vec<String> = cells
                .iter()
                .map(|cell| format!("\"{}\"", cell.replace('"', "\"\"")))
                .collect();
            out.push_str(&row.join(","));
        }
        out
    }
}
