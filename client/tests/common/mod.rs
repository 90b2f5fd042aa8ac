//! Shared fixtures for the client integration tests.
//!
//! Everything runs in memory: a scripted remote, a scheduler that only
//! records, a manual clock and a scripted fetcher.

#![allow(dead_code)]

use async_trait::async_trait;
use encore_client::{
    Config, EngineDeps, FetchError, FetchedResponse, Fetcher, MemoryStore, PlatformSignal,
    RemoteAck, RemoteApi, RemoteError, RemoteRequest, RetryScheduler, SyncEngine, SyncTrigger,
};
use encore_engine::{BackoffPolicy, CacheStrategy, ConnectivitySample, Event, ManualClock};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub const START: u64 = 1_700_000_000_000;

/// Remote with per-operation scripted answers. Unscripted calls succeed
/// without a body.
#[derive(Default)]
pub struct MockRemote {
    script: Mutex<HashMap<String, VecDeque<Result<RemoteAck, RemoteError>>>>,
    calls: Mutex<Vec<RemoteRequest>>,
    delay: Mutex<Option<Duration>>,
    gate: Mutex<Option<Arc<Notify>>>,
    pub entered: Notify,
}

impl MockRemote {
    pub fn respond(&self, operation_name: &str, response: Result<RemoteAck, RemoteError>) {
        self.script
            .lock()
            .entry(operation_name.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn respond_times(
        &self,
        operation_name: &str,
        times: usize,
        response: Result<RemoteAck, RemoteError>,
    ) {
        for _ in 0..times {
            self.respond(operation_name, response.clone());
        }
    }

    pub fn calls(&self) -> Vec<RemoteRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Operation names in call order.
    pub fn call_order(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|c| c.operation_name.clone())
            .collect()
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Block every call until the returned gate is notified once per call.
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn release(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.notify_one();
        }
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn apply(&self, request: &RemoteRequest) -> Result<RemoteAck, RemoteError> {
        self.calls.lock().push(request.clone());
        self.entered.notify_one();

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.script
            .lock()
            .get_mut(&request.operation_name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(RemoteAck::default()))
    }
}

/// Scheduler that records what it was asked to schedule.
#[derive(Default)]
pub struct RecordingScheduler {
    scheduled: Mutex<Vec<(SyncTrigger, Duration)>>,
}

impl RecordingScheduler {
    pub fn scheduled(&self) -> Vec<(SyncTrigger, Duration)> {
        self.scheduled.lock().clone()
    }

    pub fn retries(&self) -> Vec<(String, Duration)> {
        self.scheduled
            .lock()
            .iter()
            .filter_map(|(trigger, delay)| match trigger {
                SyncTrigger::Retry { item_id } => Some((item_id.clone(), *delay)),
                _ => None,
            })
            .collect()
    }
}

impl RetryScheduler for RecordingScheduler {
    fn schedule(&self, trigger: SyncTrigger, delay: Duration) {
        self.scheduled.lock().push((trigger, delay));
    }
}

/// Fetcher serving fixed bodies per URL and counting requests.
#[derive(Default)]
pub struct MockFetcher {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    counts: Mutex<HashMap<String, usize>>,
    failing: Mutex<bool>,
}

impl MockFetcher {
    pub fn serve(&self, url: &str, body: &str) {
        self.bodies
            .lock()
            .insert(url.to_string(), body.as_bytes().to_vec());
    }

    pub fn fail(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn count(&self, url: &str) -> usize {
        self.counts.lock().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        *self.counts.lock().entry(url.to_string()).or_default() += 1;
        if *self.failing.lock() {
            return Err(FetchError::Network("connection refused".into()));
        }
        match self.bodies.lock().get(url) {
            Some(body) => Ok(FetchedResponse {
                body: body.clone(),
                content_type: Some("application/json".into()),
            }),
            None => Err(FetchError::Status(404)),
        }
    }
}

pub struct Harness {
    pub engine: SyncEngine,
    pub store: Arc<MemoryStore>,
    pub remote: Arc<MockRemote>,
    pub scheduler: Arc<RecordingScheduler>,
    pub clock: Arc<ManualClock>,
    pub fetcher: Arc<MockFetcher>,
}

impl Harness {
    pub async fn go_online(&self) {
        self.engine
            .handle_signal(PlatformSignal::Connectivity(ConnectivitySample::online()))
            .await;
    }

    pub async fn go_offline(&self) {
        self.engine
            .handle_signal(PlatformSignal::Connectivity(ConnectivitySample::offline()))
            .await;
    }
}

pub fn test_config() -> Config {
    Config {
        database_url: "sqlite::memory:".to_string(),
        request_timeout: Duration::from_millis(200),
        backoff: BackoffPolicy::new(1_000, 60_000),
        sync_debounce: Duration::from_millis(100),
        ..Config::default()
    }
}

/// Engine over `store`, not yet initialized.
pub fn build(store: Arc<MemoryStore>, strategies: Vec<CacheStrategy>) -> Harness {
    let remote = Arc::new(MockRemote::default());
    let scheduler = Arc::new(RecordingScheduler::default());
    let clock = Arc::new(ManualClock::new(START));
    let fetcher = Arc::new(MockFetcher::default());

    let deps = EngineDeps::new(store.clone(), remote.clone(), scheduler.clone())
        .with_clock(clock.clone())
        .with_fetcher(fetcher.clone())
        .with_strategies(strategies);
    let engine = SyncEngine::new(test_config(), deps).expect("engine builds");

    Harness {
        engine,
        store,
        remote,
        scheduler,
        clock,
        fetcher,
    }
}

/// Engine over `store`, initialized and still offline.
pub async fn harness_with(store: Arc<MemoryStore>, strategies: Vec<CacheStrategy>) -> Harness {
    let h = build(store, strategies);
    h.engine.init().await.expect("engine initializes");
    h
}

pub async fn offline_harness() -> Harness {
    harness_with(Arc::new(MemoryStore::new()), CacheStrategy::defaults()).await
}

pub async fn online_harness() -> Harness {
    let h = offline_harness().await;
    h.go_online().await;
    h
}

/// Everything currently buffered on a receiver.
pub fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
