//! Network-aware response cache.
//!
//! [`CacheLayer`] runs the strategy contracts against a [`Fetcher`]:
//!
//! - `CacheFirst`: serve from cache, fetch and populate on a miss.
//! - `NetworkFirst`: fetch within the strategy timeout, fall back to cache.
//! - `StaleWhileRevalidate`: serve from cache at once and refresh on a
//!   spawned task; fetch on a miss.
//! - `NetworkOnly` and `CacheOnly` do what they say.
//!
//! The kind actually executed depends on network quality, see
//! [`effective_kind`]. Network fills and evictions are persisted so the
//! cache survives restarts.

use crate::bus::Publisher;
use crate::db::DurableStore;
use async_trait::async_trait;
use encore_engine::{
    effective_kind, CacheLookup, CacheStrategy, CachedResponse, Clock, EngineEvent,
    NetworkQuality, ResponseCache, StrategyKind, StrategySelector,
};
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Body and type of a fetched resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

/// Fetch failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server returned status {0}")]
    Status(u16),

    #[error("Fetch timed out")]
    Timeout,

    #[error("{0} is not cached")]
    NotCached(String),
}

/// Network leg of the cache.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError>;
}

/// [`Fetcher`] over HTTP GET.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(FetchedResponse {
            body: body.to_vec(),
            content_type,
        })
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
}

/// Result of [`CacheLayer::fetch`].
#[derive(Debug)]
pub struct FetchOutcome {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub source: ResponseSource,
    /// Strategy that matched the URL, if any
    pub strategy: Option<String>,
    /// Kind executed after network adjustment
    pub kind: Option<StrategyKind>,
    /// Background refresh started by stale-while-revalidate
    pub revalidation: Option<JoinHandle<()>>,
}

impl FetchOutcome {
    fn cached(entry: CachedResponse, kind: StrategyKind) -> Self {
        Self {
            body: entry.body,
            content_type: entry.content_type,
            source: ResponseSource::Cache,
            strategy: Some(entry.strategy),
            kind: Some(kind),
            revalidation: None,
        }
    }

    fn network(
        response: FetchedResponse,
        strategy: Option<&CacheStrategy>,
        kind: Option<StrategyKind>,
    ) -> Self {
        Self {
            body: response.body,
            content_type: response.content_type,
            source: ResponseSource::Network,
            strategy: strategy.map(|s| s.name.clone()),
            kind,
            revalidation: None,
        }
    }
}

/// Strategy executor shared by the engine and revalidation tasks.
pub struct CacheLayer {
    selector: StrategySelector,
    responses: Mutex<ResponseCache>,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn DurableStore>,
    publisher: Arc<Publisher>,
    clock: Arc<dyn Clock>,
}

impl CacheLayer {
    pub fn new(
        selector: StrategySelector,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn DurableStore>,
        publisher: Arc<Publisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            selector,
            responses: Mutex::new(ResponseCache::new()),
            fetcher,
            store,
            publisher,
            clock,
        }
    }

    /// Replace the in-memory cache with persisted entries.
    pub fn restore(&self, entries: Vec<CachedResponse>) {
        let count = entries.len();
        *self.responses.lock() = ResponseCache::restore(entries);
        tracing::debug!(entries = count, "Response cache restored");
    }

    pub fn selector(&self) -> &StrategySelector {
        &self.selector
    }

    pub fn len(&self) -> usize {
        self.responses.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve `url` under the current network conditions.
    pub async fn fetch(
        self: &Arc<Self>,
        url: &str,
        quality: NetworkQuality,
        save_data: bool,
    ) -> Result<FetchOutcome, FetchError> {
        let Some(strategy) = self.selector.select(url).cloned() else {
            self.record_miss(url, None);
            let response = self.fetch_network(url).await?;
            return Ok(FetchOutcome::network(response, None, None));
        };

        let kind = effective_kind(strategy.kind, quality, save_data);
        tracing::debug!(url, strategy = %strategy.name, ?kind, %quality, "Fetching");

        match kind {
            StrategyKind::CacheFirst => {
                if let Some(entry) = self.lookup(&strategy, url).await {
                    return Ok(FetchOutcome::cached(entry, kind));
                }
                let response = self.fetch_network(url).await?;
                self.fill(&strategy, url, &response).await;
                Ok(FetchOutcome::network(response, Some(&strategy), Some(kind)))
            }
            StrategyKind::NetworkFirst => {
                let budget = Duration::from_millis(strategy.timeout_ms());
                let network = match tokio::time::timeout(budget, self.fetch_network(url)).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout),
                };
                match network {
                    Ok(response) => {
                        self.fill(&strategy, url, &response).await;
                        Ok(FetchOutcome::network(response, Some(&strategy), Some(kind)))
                    }
                    Err(e) => {
                        tracing::debug!(
                            url,
                            error = %e,
                            "Network leg failed, falling back to cache"
                        );
                        match self.lookup(&strategy, url).await {
                            Some(entry) => Ok(FetchOutcome::cached(entry, kind)),
                            None => Err(e),
                        }
                    }
                }
            }
            StrategyKind::StaleWhileRevalidate => {
                if let Some(entry) = self.lookup(&strategy, url).await {
                    let mut outcome = FetchOutcome::cached(entry, kind);
                    outcome.revalidation = Some(self.spawn_revalidation(strategy, url.to_string()));
                    return Ok(outcome);
                }
                let response = self.fetch_network(url).await?;
                self.fill(&strategy, url, &response).await;
                Ok(FetchOutcome::network(response, Some(&strategy), Some(kind)))
            }
            StrategyKind::NetworkOnly => {
                let response = self.fetch_network(url).await?;
                Ok(FetchOutcome::network(response, Some(&strategy), Some(kind)))
            }
            StrategyKind::CacheOnly => match self.lookup(&strategy, url).await {
                Some(entry) => Ok(FetchOutcome::cached(entry, kind)),
                None => Err(FetchError::NotCached(url.to_string())),
            },
        }
    }

    /// Cache lookup with hit/miss accounting. Expired entries are evicted.
    async fn lookup(&self, strategy: &CacheStrategy, url: &str) -> Option<CachedResponse> {
        let now = self.clock.now_millis();
        let found = self.responses.lock().lookup(strategy, url, now);
        match found {
            CacheLookup::Hit(entry) => {
                self.publisher.stats().record_hit(entry.body.len() as u64);
                crate::metrics::record_cache_lookup(&strategy.name, true);
                crate::metrics::record_bandwidth_saved(entry.body.len());
                self.publisher.emit(EngineEvent::CacheHit {
                    url: url.to_string(),
                    strategy: strategy.name.clone(),
                });
                Some(entry)
            }
            CacheLookup::Expired(entry) => {
                tracing::debug!(
                    url,
                    age_ms = now.saturating_sub(entry.stored_at),
                    "Cached entry expired"
                );
                self.forget(&entry.url).await;
                self.record_miss(url, Some(&strategy.name));
                None
            }
            CacheLookup::Miss => {
                self.record_miss(url, Some(&strategy.name));
                None
            }
        }
    }

    fn record_miss(&self, url: &str, strategy: Option<&str>) {
        self.publisher.stats().record_miss();
        crate::metrics::record_cache_lookup(strategy.unwrap_or("none"), false);
        self.publisher.emit(EngineEvent::CacheMiss {
            url: url.to_string(),
            strategy: strategy.map(str::to_string),
        });
    }

    async fn fetch_network(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let started = Instant::now();
        let result = self.fetcher.fetch(url).await;
        self.publisher
            .stats()
            .record_response(started.elapsed().as_millis() as u64);
        result
    }

    /// Store a network response and persist the change.
    async fn fill(&self, strategy: &CacheStrategy, url: &str, response: &FetchedResponse) {
        let entry = CachedResponse {
            url: url.to_string(),
            strategy: strategy.name.clone(),
            stored_at: self.clock.now_millis(),
            body: response.body.clone(),
            content_type: response.content_type.clone(),
        };
        let evicted = self.responses.lock().put(strategy, entry.clone());

        if let Err(e) = self.store.put_cached(&entry).await {
            tracing::warn!(url, error = %e, "Failed to persist cached response");
            crate::metrics::record_persistence_error("put_cached");
        }
        for old in evicted {
            tracing::debug!(url = %old.url, strategy = %strategy.name, "Evicted cached response");
            self.forget(&old.url).await;
        }
    }

    async fn forget(&self, url: &str) {
        if let Err(e) = self.store.delete_cached(url).await {
            tracing::warn!(url, error = %e, "Failed to delete cached response");
            crate::metrics::record_persistence_error("delete_cached");
        }
    }

    fn spawn_revalidation(
        self: &Arc<Self>,
        strategy: CacheStrategy,
        url: String,
    ) -> JoinHandle<()> {
        let layer = Arc::clone(self);
        tokio::spawn(async move {
            match layer.fetch_network(&url).await {
                Ok(response) => layer.fill(&strategy, &url, &response).await,
                Err(e) => tracing::debug!(url = %url, error = %e, "Revalidation failed"),
            }
        })
    }
}
