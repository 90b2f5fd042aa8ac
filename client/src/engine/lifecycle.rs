//! Engine lifecycle: construction, startup, the background driver and
//! shutdown.

use super::{EngineDeps, EngineState, Shared, SyncEngine};
use crate::bus::Publisher;
use crate::cache::CacheLayer;
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::observer::NetworkObserver;
use crate::scheduler::{SyncTrigger, TriggerReceiver};
use encore_engine::{
    AuditTrail, ConnectivitySample, EngineEvent, OfflineQueue, QualityTransition,
    StrategySelector, SyncProgress,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

/// Signals forwarded from the host platform.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformSignal {
    Connectivity(ConnectivitySample),
    /// The app came to the foreground or went to the background
    Visibility { visible: bool },
    /// The platform granted background execution under `tag`
    BackgroundSync { tag: String },
}

pub(crate) struct Driver {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncEngine {
    /// Build an engine. Nothing is loaded until [`SyncEngine::init`].
    pub fn new(config: Config, deps: EngineDeps) -> Result<Self> {
        let selector = StrategySelector::new(deps.strategies)?;
        let publisher = Arc::new(Publisher::new(Arc::clone(&deps.clock)));
        let cache = Arc::new(CacheLayer::new(
            selector,
            deps.fetcher,
            Arc::clone(&deps.store),
            Arc::clone(&publisher),
            Arc::clone(&deps.clock),
        ));

        Ok(Self {
            inner: Arc::new(Shared {
                config,
                store: deps.store,
                remote: deps.remote,
                scheduler: deps.scheduler,
                clock: deps.clock,
                publisher,
                cache,
                state: Mutex::new(EngineState::new()),
                syncing: AtomicBool::new(false),
                rerun: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                driver: Mutex::new(None),
            }),
        })
    }

    /// Load the queue, the audit trail and cached responses from the store.
    ///
    /// A store failure is returned and leaves the engine unusable; public
    /// calls keep answering [`EngineError::NotReady`].
    pub async fn init(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(EngineError::Disposed);
        }

        let loaded = async {
            let items = self.inner.store.load_items().await?;
            let audit = self.inner.store.load_audit().await?;
            let cached = self.inner.store.load_cached().await?;
            Ok::<_, crate::db::StoreError>((items, audit, cached))
        }
        .await;

        let (items, audit, cached) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load durable state");
                crate::metrics::record_persistence_error("init");
                return Err(e.into());
            }
        };

        let restored = items.len();
        let audit_len = audit.len();
        let cached_len = cached.len();
        let depth = {
            let mut state = self.inner.state.lock();
            state.next_seq = items.iter().map(|i| i.seq + 1).max().unwrap_or(0);
            state.queue = OfflineQueue::restore(items);
            state.audit = AuditTrail::restore(audit);
            state.progress = SyncProgress::idle(state.queue.len(), state.monitor.quality());
            state.queue.len()
        };
        self.inner.cache.restore(cached);
        self.inner.publisher.set_queue_depth(depth);
        self.inner.ready.store(true, Ordering::SeqCst);

        tracing::info!(
            queued = restored,
            audit_entries = audit_len,
            cached_responses = cached_len,
            "Sync engine initialized"
        );
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst) && !self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Start the background driver.
    ///
    /// The driver applies connectivity samples from `observer` and runs a
    /// pass for every scheduler trigger until [`SyncEngine::dispose`].
    /// Passes run on their own tasks, so samples keep being applied while
    /// one is in progress and a loss of connectivity aborts it.
    pub fn spawn_driver(
        &self,
        observer: &dyn NetworkObserver,
        mut triggers: TriggerReceiver,
    ) -> Result<()> {
        self.ensure_ready()?;
        let mut samples = observer.subscribe();
        let (shutdown, mut stop) = watch::channel(false);
        let engine = self.clone();

        let handle = tokio::spawn(async move {
            let mut passes = JoinSet::new();
            let initial = samples.borrow_and_update().clone();
            if engine.apply_connectivity(initial) {
                passes.spawn(pass(engine.clone()));
            }

            let mut observing = true;
            loop {
                tokio::select! {
                    changed = samples.changed(), if observing => {
                        match changed {
                            Ok(()) => {
                                let sample = samples.borrow_and_update().clone();
                                if engine.apply_connectivity(sample) {
                                    passes.spawn(pass(engine.clone()));
                                }
                            }
                            Err(_) => {
                                tracing::warn!("Network observer closed");
                                observing = false;
                            }
                        }
                    }
                    Some(trigger) = triggers.recv() => {
                        let mut coalesced = 0usize;
                        while triggers.try_recv().is_ok() {
                            coalesced += 1;
                        }
                        log_trigger(&trigger, coalesced);
                        passes.spawn(pass(engine.clone()));
                    }
                    Some(joined) = passes.join_next(), if !passes.is_empty() => {
                        if let Err(e) = joined {
                            tracing::error!(error = %e, "Sync pass task failed");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }

            // Passes notice the disposed flag after their current item.
            while let Some(joined) = passes.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Sync pass task failed");
                }
            }
            tracing::debug!("Sync driver stopped");
        });

        let previous = self.inner.driver.lock().replace(Driver { shutdown, handle });
        if let Some(previous) = previous {
            let _ = previous.shutdown.send(true);
            previous.handle.abort();
        }
        tracing::info!("Sync driver started");
        Ok(())
    }

    /// Stop the driver and refuse further calls.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.ready.store(false, Ordering::SeqCst);

        let driver = self.inner.driver.lock().take();
        if let Some(driver) = driver {
            let _ = driver.shutdown.send(true);
            if let Err(e) = driver.handle.await {
                tracing::warn!(error = %e, "Sync driver ended abnormally");
            }
        }
        tracing::info!("Sync engine disposed");
    }

    /// React to a platform signal. Returns the progress after any pass the
    /// signal started.
    pub async fn handle_signal(&self, signal: PlatformSignal) -> SyncProgress {
        match signal {
            PlatformSignal::Connectivity(sample) => {
                if self.apply_connectivity(sample) {
                    return self.run_pass().await;
                }
                self.sync_progress()
            }
            PlatformSignal::Visibility { visible } => {
                let (online, queued) = {
                    let state = self.inner.state.lock();
                    (state.monitor.is_online(), state.queue.len())
                };
                if visible && online && queued > 0 {
                    tracing::debug!(queued, "App visible, syncing");
                    return self.run_pass().await;
                }
                self.sync_progress()
            }
            PlatformSignal::BackgroundSync { tag } => {
                tracing::debug!(tag = %tag, "Background sync requested");
                self.inner
                    .publisher
                    .emit(EngineEvent::BackgroundSync { tag });
                self.run_pass().await
            }
        }
    }

    /// Apply a connectivity sample. Returns whether the engine came online
    /// with queued work.
    fn apply_connectivity(&self, sample: ConnectivitySample) -> bool {
        let Some(transition) = self.observe(sample) else {
            return false;
        };
        transition.came_online() && !self.inner.state.lock().queue.is_empty()
    }

    /// Apply a connectivity sample; publish the transition if quality changed.
    fn observe(&self, sample: ConnectivitySample) -> Option<QualityTransition> {
        let (transition, metrics) = {
            let mut state = self.inner.state.lock();
            let transition = state.monitor.observe(sample)?;
            (transition, state.monitor.metrics().cloned())
        };

        crate::metrics::set_network_quality(transition.to);
        if transition.went_offline() {
            tracing::warn!(from = %transition.from, "Network went offline, queue kept");
        } else {
            tracing::info!(from = %transition.from, to = %transition.to, "Network quality changed");
        }
        self.inner
            .publisher
            .emit(EngineEvent::NetworkChange { transition, metrics });
        Some(transition)
    }
}

async fn pass(engine: SyncEngine) {
    engine.run_pass().await;
}

fn log_trigger(trigger: &SyncTrigger, coalesced: usize) {
    match trigger {
        SyncTrigger::Retry { item_id } => {
            tracing::debug!(item_id = %item_id, coalesced, "Retry due")
        }
        SyncTrigger::Enqueued => tracing::debug!(coalesced, "Sync requested after enqueue"),
        SyncTrigger::ConflictResolved { item_id } => {
            tracing::debug!(item_id = %item_id, coalesced, "Sync requested after conflict decision")
        }
    }
}
