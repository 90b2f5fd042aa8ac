//! Retry and sync trigger scheduling.

use encore_engine::ItemId;
use std::time::Duration;
use tokio::sync::mpsc;

/// Why the driver should run a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTrigger {
    /// A retry delay elapsed
    Retry { item_id: ItemId },
    /// New work was enqueued
    Enqueued,
    /// A parked conflict was decided
    ConflictResolved { item_id: ItemId },
}

/// Delivers [`SyncTrigger`]s after a delay.
pub trait RetryScheduler: Send + Sync {
    fn schedule(&self, trigger: SyncTrigger, delay: Duration);
}

/// Receiving end consumed by the engine driver.
pub type TriggerReceiver = mpsc::UnboundedReceiver<SyncTrigger>;

/// Scheduler backed by tokio timers.
///
/// Every scheduled trigger sleeps on its own task and then lands on one
/// channel. Triggers scheduled outside a runtime are dropped.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<SyncTrigger>,
}

impl TokioScheduler {
    pub fn new() -> (Self, TriggerReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RetryScheduler for TokioScheduler {
    fn schedule(&self, trigger: SyncTrigger, delay: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(?trigger, "No runtime to schedule sync trigger on");
            return;
        };
        let tx = self.tx.clone();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(trigger);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn trigger_arrives_after_delay() {
        let (scheduler, mut rx) = TokioScheduler::new();
        scheduler.schedule(
            SyncTrigger::Retry {
                item_id: "item-1".into(),
            },
            Duration::from_millis(2_000),
        );

        tokio::time::sleep(Duration::from_millis(1_999)).await;
        assert!(rx.try_recv().is_err());

        let trigger = rx.recv().await.unwrap();
        assert_eq!(
            trigger,
            SyncTrigger::Retry {
                item_id: "item-1".into()
            }
        );
    }
}
