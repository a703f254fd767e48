//! Background eviction of expired messages.

use crate::statistics::{StatEvent, StatisticsCollector};
use crate::store::BoundedStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

pub struct Sweeper {
    store: Arc<BoundedStore>,
    grace_period: Duration,
    interval: Duration,
    stats: Option<Arc<StatisticsCollector>>,
}

/// Handle to a running sweeper task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            log::error!("Sweeper task ended abnormally: {e}");
        }
    }
}

impl Sweeper {
    pub fn new(store: Arc<BoundedStore>, grace_period: Duration, interval: Duration) -> Self {
        Self {
            store,
            grace_period,
            interval,
            stats: None,
        }
    }

    pub fn with_statistics(mut self, stats: Arc<StatisticsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Evict every message with `age > ttl + grace` as of `now`.
    ///
    /// Only the number of evicted messages is logged.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let grace = chrono::Duration::from_std(self.grace_period)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000));
        let removed = self.store.evict_expired(now, grace);

        if removed > 0 {
            log::info!("Sweeper evicted {removed} expired messages");
            if let Some(stats) = &self.stats {
                stats.record_event(StatEvent::Evicted { count: removed });
            }
        } else {
            log::debug!("Sweeper found nothing to evict");
        }

        removed
    }

    /// Run `sweep` every interval until the returned handle is shut down.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            log::debug!("Sweeper shutting down");
                            break;
                        }
                    }
                }
            }
        });

        SweeperHandle { shutdown, handle }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{test_inbound, EphemeralMessage};

    fn stored_with_age(store: &BoundedStore, id: &str, ttl: u64, age_secs: i64) {
        let mut inbound = test_inbound(id, "body");
        inbound.ttl_seconds = Some(ttl);
        let created = Utc::now() - chrono::Duration::seconds(age_secs);
        store
            .store(EphemeralMessage::from_inbound_at(inbound, ttl, created))
            .unwrap();
    }

    #[test]
    fn test_sweep_empty_store() {
        let store = Arc::new(BoundedStore::new(4));
        let sweeper = Sweeper::new(store, Duration::from_secs(60), Duration::from_secs(60));
        assert_eq!(sweeper.sweep(), 0);
    }

    #[test]
    fn test_present_iff_within_ttl_plus_grace() {
        let store = Arc::new(BoundedStore::new(8));
        // ttl 60 + grace 120 = 180
        stored_with_age(&store, "young", 60, 30);
        stored_with_age(&store, "expired-in-grace", 60, 150);
        stored_with_age(&store, "past-grace", 60, 200);
        stored_with_age(&store, "long-ttl", 600, 400);

        let sweeper = Sweeper::new(
            Arc::clone(&store),
            Duration::from_secs(120),
            Duration::from_secs(60),
        );
        let now = Utc::now();
        assert_eq!(sweeper.sweep_at(now), 1);

        for message in store.list_all() {
            let limit = chrono::Duration::seconds(message.ttl_seconds() as i64 + 120);
            assert!(message.age(now) <= limit);
        }
        assert!(store.get("past-grace").is_none());
        assert!(store.get("expired-in-grace").is_some());
    }

    #[test]
    fn test_sweep_records_eviction_count() {
        let store = Arc::new(BoundedStore::new(4));
        stored_with_age(&store, "old", 1, 500);
        let stats = Arc::new(StatisticsCollector::new());
        let sweeper = Sweeper::new(Arc::clone(&store), Duration::ZERO, Duration::from_secs(60))
            .with_statistics(Arc::clone(&stats));

        sweeper.sweep();
        assert_eq!(stats.snapshot().evicted, 1);
    }

    #[tokio::test]
    async fn test_spawned_sweeper_evicts_and_shuts_down() {
        let store = Arc::new(BoundedStore::new(4));
        stored_with_age(&store, "old", 1, 500);

        let handle = Sweeper::new(
            Arc::clone(&store),
            Duration::ZERO,
            Duration::from_millis(20),
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.is_empty());
        handle.shutdown().await;
    }
}
