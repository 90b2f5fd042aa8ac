//! Conflict detection and resolution.
//!
//! A conflict arises when the remote side rejects a pushed change because
//! the entity moved on since the change was made. The resolver settles it
//! according to the item's [`ConflictPolicy`]:
//!
//! - `Overwrite`: the local value wins.
//! - `Merge`: whole-value last-write-wins, unless [`FieldRules`] are
//!   registered for the operation, in which case the two values are merged
//!   field by field against the pre-mutation base.
//! - `AskUser`: nothing is decided; a [`PendingConflict`] is returned and
//!   settled later with [`ConflictResolver::decide`].
//!
//! Every decided conflict yields exactly one [`ConflictRecord`].

use crate::{ConflictPolicy, EntityKey, ItemId, Timestamp, Version};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A value together with when (and optionally at which version) it was
/// written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedValue {
    pub value: Value,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

impl VersionedValue {
    pub fn new(value: Value, timestamp: Timestamp) -> Self {
        Self {
            value,
            timestamp,
            version: None,
        }
    }

    pub fn at_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }
}

/// The server's current state of an entity, as reported with a conflict.
pub type RemoteVersion = VersionedValue;

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    Overwrite,
    LastWriteWins,
    FieldMerge,
    UserDecision,
}

/// Immutable record of one resolved conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub entity_id: EntityKey,
    pub item_id: ItemId,
    pub local: VersionedValue,
    pub remote: RemoteVersion,
    pub strategy: ResolutionStrategy,
    pub resolved_value: Value,
    pub resolved_at: Timestamp,
}

impl ConflictRecord {
    /// Whether the resolution simply accepted the server value.
    pub fn accepts_remote(&self) -> bool {
        self.resolved_value == self.remote.value
    }
}

/// Rule for a field both sides changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldRule {
    PreferLocal,
    PreferRemote,
    /// The side with the later timestamp; ties go to remote
    PreferNewer,
    /// Numeric maximum, e.g. fees
    Max,
    /// Numeric minimum
    Min,
}

/// What to do with a field both sides changed when no rule names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Divergence {
    /// Escalate to the user, whatever the item's policy
    #[default]
    AskUser,
    PreferNewer,
}

/// Field-level merge configuration for one operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldRules {
    pub rules: BTreeMap<String, FieldRule>,
    pub on_divergence: Divergence,
}

impl FieldRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, field: impl Into<String>, rule: FieldRule) -> Self {
        self.rules.insert(field.into(), rule);
        self
    }

    pub fn on_divergence(mut self, divergence: Divergence) -> Self {
        self.on_divergence = divergence;
        self
    }
}

/// Everything the resolver needs to know about one conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictInput {
    pub item_id: ItemId,
    pub entity_id: EntityKey,
    pub operation_name: String,
    pub policy: ConflictPolicy,
    pub local: VersionedValue,
    pub remote: RemoteVersion,
    /// Entity value before the local change, when known
    pub base: Option<Value>,
}

/// Why a conflict is waiting for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PendingReason {
    /// The item's policy asks the user
    Policy,
    /// A field merge found fields changed on both sides
    Divergence,
}

/// A conflict awaiting a [`UserDecision`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingConflict {
    pub item_id: ItemId,
    pub entity_id: EntityKey,
    pub local: VersionedValue,
    pub remote: RemoteVersion,
    pub reason: PendingReason,
    /// Fields changed on both sides, for divergence
    #[serde(default)]
    pub fields: Vec<String>,
}

/// A user's answer to a pending conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum UserDecision {
    KeepLocal,
    KeepRemote,
    Custom(Value),
}

/// Outcome of [`ConflictResolver::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(ConflictRecord),
    Deferred(PendingConflict),
}

/// Kind of conflict found by [`detect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    VersionMismatch,
    TimestampMismatch,
}

/// Compare two copies of an entity. Versions are checked before timestamps;
/// identical versions and timestamps are not a conflict.
pub fn detect(local: &VersionedValue, remote: &RemoteVersion) -> Option<ConflictKind> {
    if local.version != remote.version {
        Some(ConflictKind::VersionMismatch)
    } else if local.timestamp != remote.timestamp {
        Some(ConflictKind::TimestampMismatch)
    } else {
        None
    }
}

/// Settles conflicts. Holds the per-operation field merge registry.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    merges: HashMap<String, FieldRules>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge conflicts of `operation_name` field by field.
    pub fn register_merge(&mut self, operation_name: impl Into<String>, rules: FieldRules) {
        self.merges.insert(operation_name.into(), rules);
    }

    /// Field rules registered for an operation.
    pub fn merge_rules(&self, operation_name: &str) -> Option<&FieldRules> {
        self.merges.get(operation_name)
    }

    /// Resolve a conflict, or defer it to the user.
    pub fn resolve(&self, input: ConflictInput, now: Timestamp) -> Resolution {
        match input.policy {
            ConflictPolicy::Overwrite => {
                let value = input.local.value.clone();
                Resolution::Resolved(record(input, ResolutionStrategy::Overwrite, value, now))
            }
            ConflictPolicy::AskUser => {
                Resolution::Deferred(pending(input, PendingReason::Policy, Vec::new()))
            }
            ConflictPolicy::Merge => match self.merges.get(&input.operation_name) {
                Some(rules) => match field_merge(&input, rules) {
                    Ok(Some(value)) => Resolution::Resolved(record(
                        input,
                        ResolutionStrategy::FieldMerge,
                        value,
                        now,
                    )),
                    Ok(None) => last_write_wins(input, now),
                    Err(fields) => {
                        Resolution::Deferred(pending(input, PendingReason::Divergence, fields))
                    }
                },
                None => last_write_wins(input, now),
            },
        }
    }

    /// Settle a pending conflict with the user's decision.
    pub fn decide(
        &self,
        conflict: PendingConflict,
        decision: UserDecision,
        now: Timestamp,
    ) -> ConflictRecord {
        let resolved_value = match decision {
            UserDecision::KeepLocal => conflict.local.value.clone(),
            UserDecision::KeepRemote => conflict.remote.value.clone(),
            UserDecision::Custom(value) => value,
        };
        ConflictRecord {
            entity_id: conflict.entity_id,
            item_id: conflict.item_id,
            local: conflict.local,
            remote: conflict.remote,
            strategy: ResolutionStrategy::UserDecision,
            resolved_value,
            resolved_at: now,
        }
    }
}

fn record(
    input: ConflictInput,
    strategy: ResolutionStrategy,
    resolved_value: Value,
    now: Timestamp,
) -> ConflictRecord {
    ConflictRecord {
        entity_id: input.entity_id,
        item_id: input.item_id,
        local: input.local,
        remote: input.remote,
        strategy,
        resolved_value,
        resolved_at: now,
    }
}

fn pending(input: ConflictInput, reason: PendingReason, fields: Vec<String>) -> PendingConflict {
    PendingConflict {
        item_id: input.item_id,
        entity_id: input.entity_id,
        local: input.local,
        remote: input.remote,
        reason,
        fields,
    }
}

fn local_is_newer(input: &ConflictInput) -> bool {
    input.local.timestamp > input.remote.timestamp
}

fn last_write_wins(input: ConflictInput, now: Timestamp) -> Resolution {
    let value = if local_is_newer(&input) {
        input.local.value.clone()
    } else {
        input.remote.value.clone()
    };
    Resolution::Resolved(record(input, ResolutionStrategy::LastWriteWins, value, now))
}

/// Three-way merge of two JSON objects.
///
/// Returns `Ok(None)` when either side is not an object, and `Err(fields)`
/// listing the diverged fields when the rules say to ask the user.
fn field_merge(input: &ConflictInput, rules: &FieldRules) -> Result<Option<Value>, Vec<String>> {
    let (Some(local), Some(remote)) =
        (input.local.value.as_object(), input.remote.value.as_object())
    else {
        return Ok(None);
    };
    let base = input.base.as_ref().and_then(Value::as_object);
    let local_newer = local_is_newer(input);

    let keys: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
    let mut merged = Map::new();
    let mut diverged = Vec::new();

    for key in keys {
        let l = local.get(key);
        let r = remote.get(key);

        let chosen = if l == r {
            l
        } else if let Some(base) = base {
            let b = base.get(key);
            match (l != b, r != b) {
                (true, false) => l,
                (false, true) => r,
                _ => match rules.rules.get(key.as_str()) {
                    Some(rule) => apply_rule(*rule, l, r, local_newer),
                    None => match rules.on_divergence {
                        Divergence::PreferNewer => newer(l, r, local_newer),
                        Divergence::AskUser => {
                            diverged.push(key.clone());
                            continue;
                        }
                    },
                },
            }
        } else {
            match (l, r) {
                (Some(_), None) => l,
                (None, Some(_)) => r,
                _ => match rules.rules.get(key.as_str()) {
                    Some(rule) => apply_rule(*rule, l, r, local_newer),
                    None => newer(l, r, local_newer),
                },
            }
        };

        if let Some(value) = chosen {
            merged.insert(key.clone(), value.clone());
        }
    }

    if diverged.is_empty() {
        Ok(Some(Value::Object(merged)))
    } else {
        Err(diverged)
    }
}

fn newer<'a>(l: Option<&'a Value>, r: Option<&'a Value>, local_newer: bool) -> Option<&'a Value> {
    if local_newer {
        l
    } else {
        r
    }
}

fn apply_rule<'a>(
    rule: FieldRule,
    l: Option<&'a Value>,
    r: Option<&'a Value>,
    local_newer: bool,
) -> Option<&'a Value> {
    match rule {
        FieldRule::PreferLocal => l,
        FieldRule::PreferRemote => r,
        FieldRule::PreferNewer => newer(l, r, local_newer),
        FieldRule::Max | FieldRule::Min => {
            let (Some(lv), Some(rv)) = (l, r) else {
                return l.or(r);
            };
            match (lv.as_f64(), rv.as_f64()) {
                (Some(a), Some(b)) => {
                    let take_local = if rule == FieldRule::Max { a > b } else { a < b };
                    if take_local {
                        l
                    } else {
                        r
                    }
                }
                _ => newer(l, r, local_newer),
            }
        }
    }
}
