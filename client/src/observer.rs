//! Connectivity observers.
//!
//! An observer publishes [`ConnectivitySample`]s through a
//! `tokio::sync::watch` channel; the engine driver turns them into network
//! quality transitions. Only the latest sample matters, so a slow consumer
//! skips intermediate ones.

use encore_engine::{Clock, ConnectivitySample, EffectiveType, NetworkQualityMetrics};
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Source of connectivity samples.
pub trait NetworkObserver: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<ConnectivitySample>;
}

/// Observer fed by the host, e.g. from platform online/offline callbacks.
#[derive(Debug)]
pub struct ManualObserver {
    tx: watch::Sender<ConnectivitySample>,
}

impl ManualObserver {
    pub fn new(initial: ConnectivitySample) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn push(&self, sample: ConnectivitySample) {
        self.tx.send_replace(sample);
    }

    pub fn set_online(&self, online: bool) {
        let sample = if online {
            ConnectivitySample::online()
        } else {
            ConnectivitySample::offline()
        };
        self.push(sample);
    }
}

impl Default for ManualObserver {
    fn default() -> Self {
        Self::new(ConnectivitySample::offline())
    }
}

impl NetworkObserver for ManualObserver {
    fn subscribe(&self) -> watch::Receiver<ConnectivitySample> {
        self.tx.subscribe()
    }
}

/// Observer that probes a health endpoint periodically.
///
/// A probe answering with any status counts as online. RTT maps onto an
/// effective connection type. Downlink is the throughput of the probe body
/// when the body is at least `min_throughput_bytes` long; for smaller
/// bodies it is the nominal downlink of the effective type, so RTT alone
/// drives the quality.
pub struct ProbeObserver {
    client: Client,
    url: String,
    interval: Duration,
    min_throughput_bytes: usize,
    clock: Arc<dyn Clock>,
    tx: watch::Sender<ConnectivitySample>,
}

impl ProbeObserver {
    pub fn new(
        client: Client,
        url: impl Into<String>,
        interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (tx, _rx) = watch::channel(ConnectivitySample::offline());
        Self {
            client,
            url: url.into(),
            interval,
            min_throughput_bytes: 64 * 1024,
            clock,
            tx,
        }
    }

    pub fn with_min_throughput_bytes(mut self, bytes: usize) -> Self {
        self.min_throughput_bytes = bytes;
        self
    }

    /// Run one probe and publish its sample.
    pub async fn probe(&self) -> ConnectivitySample {
        let started = Instant::now();
        let sample = match self.client.get(&self.url).send().await {
            Ok(response) => {
                let bytes = response.bytes().await.map(|b| b.len()).unwrap_or(0);
                let elapsed = started.elapsed();
                let rtt = elapsed.as_millis() as u64;
                let effective_type = EffectiveType::from_rtt(rtt);
                let downlink = if bytes < self.min_throughput_bytes || elapsed.is_zero() {
                    effective_type.nominal_downlink()
                } else {
                    (bytes as f64 * 8.0) / elapsed.as_secs_f64() / 1_000_000.0
                };
                ConnectivitySample::with_metrics(NetworkQualityMetrics {
                    downlink,
                    effective_type,
                    rtt,
                    save_data: false,
                    timestamp: self.clock.now_millis(),
                })
            }
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "Connectivity probe failed");
                ConnectivitySample::offline()
            }
        };
        self.tx.send_replace(sample.clone());
        sample
    }

    /// Probe forever on a background task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.probe().await;
            }
        })
    }
}

impl NetworkObserver for ProbeObserver {
    fn subscribe(&self) -> watch::Receiver<ConnectivitySample> {
        self.tx.subscribe()
    }
}
