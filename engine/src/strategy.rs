//! Response cache strategies.
//!
//! A [`StrategySelector`] maps request URLs to a [`CacheStrategy`] by
//! regular expression. The strategy's nominal [`StrategyKind`] is adjusted
//! to the current network quality with [`effective_kind`], and cached bodies
//! live in a [`ResponseCache`] with per-strategy TTL and size limits.

use crate::{error::Result, Error, NetworkQuality, Timestamp};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Default NetworkFirst timeout.
pub const DEFAULT_NETWORK_TIMEOUT_MS: u64 = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyKind {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
    NetworkOnly,
    CacheOnly,
}

/// A named caching rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStrategy {
    pub name: String,
    /// Regular expression matched against the request URL
    pub pattern: String,
    pub kind: StrategyKind,
    pub ttl_ms: u64,
    #[serde(default)]
    pub max_entries: Option<usize>,
    /// Lower is consulted first
    pub priority: u32,
    #[serde(default)]
    pub network_timeout_ms: Option<u64>,
}

impl CacheStrategy {
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        kind: StrategyKind,
        ttl_ms: u64,
        priority: u32,
    ) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            kind,
            ttl_ms,
            max_entries: None,
            priority,
            network_timeout_ms: None,
        }
    }

    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    pub fn network_timeout(mut self, ms: u64) -> Self {
        self.network_timeout_ms = Some(ms);
        self
    }

    /// Timeout for the network leg of NetworkFirst.
    pub fn timeout_ms(&self) -> u64 {
        self.network_timeout_ms.unwrap_or(DEFAULT_NETWORK_TIMEOUT_MS)
    }

    /// The strategies the application ships with.
    pub fn defaults() -> Vec<CacheStrategy> {
        vec![
            CacheStrategy::new(
                "AppShell",
                r"\.(html|js|css|woff2?)$",
                StrategyKind::CacheFirst,
                7 * DAY_MS,
                1,
            ),
            CacheStrategy::new(
                "APIResponses",
                r"/api/",
                StrategyKind::NetworkFirst,
                5 * MINUTE_MS,
                2,
            )
            .network_timeout(DEFAULT_NETWORK_TIMEOUT_MS),
            CacheStrategy::new(
                "UserData",
                r"/(shows|contracts|contacts|travel)/",
                StrategyKind::StaleWhileRevalidate,
                DAY_MS,
                3,
            ),
        ]
    }
}

/// The kind to actually execute under the current conditions.
///
/// Offline, anything that may read the cache reads only the cache. On a
/// poor link or with data saving on, NetworkFirst serves from cache and
/// refreshes in the background.
pub fn effective_kind(
    kind: StrategyKind,
    quality: NetworkQuality,
    save_data: bool,
) -> StrategyKind {
    match (kind, quality) {
        (
            StrategyKind::CacheFirst
            | StrategyKind::NetworkFirst
            | StrategyKind::StaleWhileRevalidate,
            NetworkQuality::Offline,
        ) => StrategyKind::CacheOnly,
        (StrategyKind::NetworkFirst, NetworkQuality::Poor) => StrategyKind::StaleWhileRevalidate,
        (StrategyKind::NetworkFirst, _) if save_data => StrategyKind::StaleWhileRevalidate,
        (kind, _) => kind,
    }
}

/// Compiled strategy table.
#[derive(Debug, Clone)]
pub struct StrategySelector {
    compiled: Vec<(Regex, CacheStrategy)>,
}

impl StrategySelector {
    /// Compile every pattern. Fails on the first invalid one.
    pub fn new(strategies: Vec<CacheStrategy>) -> Result<Self> {
        let mut compiled = strategies
            .into_iter()
            .map(|s| {
                Regex::new(&s.pattern)
                    .map(|re| (re, s.clone()))
                    .map_err(|e| Error::InvalidPattern {
                        pattern: s.pattern.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        // Stable: equal priorities keep declaration order
        compiled.sort_by_key(|(_, s)| s.priority);
        Ok(Self { compiled })
    }

    /// Selector over [`CacheStrategy::defaults`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(CacheStrategy::defaults())
    }

    /// First strategy whose pattern matches `url`.
    pub fn select(&self, url: &str) -> Option<&CacheStrategy> {
        self.compiled
            .iter()
            .find(|(re, _)| re.is_match(url))
            .map(|(_, s)| s)
    }

    pub fn get(&self, name: &str) -> Option<&CacheStrategy> {
        self.compiled.iter().map(|(_, s)| s).find(|s| s.name == name)
    }

    /// Strategies in consultation order.
    pub fn strategies(&self) -> impl Iterator<Item = &CacheStrategy> {
        self.compiled.iter().map(|(_, s)| s)
    }
}

/// A cached response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResponse {
    pub url: String,
    /// Name of the strategy that stored it
    pub strategy: String,
    pub stored_at: Timestamp,
    pub body: Vec<u8>,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl CachedResponse {
    pub fn is_expired(&self, ttl_ms: u64, now: Timestamp) -> bool {
        now.saturating_sub(self.stored_at) > ttl_ms
    }
}

/// Result of [`ResponseCache::lookup`].
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(CachedResponse),
    /// Found but older than the TTL; it has been evicted
    Expired(CachedResponse),
    Miss,
}

/// Cached responses grouped by strategy.
#[derive(Debug, Clone, Default)]
pub struct ResponseCache {
    entries: HashMap<String, BTreeMap<String, CachedResponse>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries.
    pub fn restore(entries: impl IntoIterator<Item = CachedResponse>) -> Self {
        let mut cache = Self::new();
        for entry in entries {
            cache
                .entries
                .entry(entry.strategy.clone())
                .or_default()
                .insert(entry.url.clone(), entry);
        }
        cache
    }

    /// Look up `url` under `strategy`, evicting it if expired.
    pub fn lookup(&mut self, strategy: &CacheStrategy, url: &str, now: Timestamp) -> CacheLookup {
        let Some(bucket) = self.entries.get_mut(&strategy.name) else {
            return CacheLookup::Miss;
        };
        let expired = match bucket.get(url) {
            Some(entry) => entry.is_expired(strategy.ttl_ms, now),
            None => return CacheLookup::Miss,
        };
        let found = if expired {
            bucket.remove(url).map(CacheLookup::Expired)
        } else {
            bucket.get(url).cloned().map(CacheLookup::Hit)
        };
        found.unwrap_or(CacheLookup::Miss)
    }

    /// Store a response. Returns entries evicted to respect `max_entries`,
    /// oldest first.
    pub fn put(
        &mut self,
        strategy: &CacheStrategy,
        response: CachedResponse,
    ) -> Vec<CachedResponse> {
        let bucket = self.entries.entry(strategy.name.clone()).or_default();
        bucket.insert(response.url.clone(), response);

        let mut evicted = Vec::new();
        if let Some(max) = strategy.max_entries {
            while bucket.len() > max {
                let oldest = bucket
                    .values()
                    .min_by_key(|e| e.stored_at)
                    .map(|e| e.url.clone());
                match oldest.and_then(|url| bucket.remove(&url)) {
                    Some(entry) => evicted.push(entry),
                    None => break,
                }
            }
        }
        evicted
    }

    pub fn remove(&mut self, strategy: &str, url: &str) -> Option<CachedResponse> {
        self.entries.get_mut(strategy)?.remove(url)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
