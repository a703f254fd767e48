use crate::decision::ProtectionAction;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::interval;

/// Aggregate counters. Nothing in here identifies a message or a person.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalStats {
    pub total_messages: u64,
    pub forwarded_clean: u64,
    pub forwarded_with_context: u64,
    pub redacted: u64,
    pub summarized: u64,
    pub blocked: u64,
    pub capacity_rejections: u64,
    pub delivery_failures: u64,
    pub dry_run_deliveries: u64,
    pub oracle_fallbacks: u64,
    pub escalations: u64,
    pub evicted: u64,
    pub total_processing_time_ms: u64,
    pub score_sum: f64,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl GlobalStats {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            total_messages: 0,
            forwarded_clean: 0,
            forwarded_with_context: 0,
            redacted: 0,
            summarized: 0,
            blocked: 0,
            capacity_rejections: 0,
            delivery_failures: 0,
            dry_run_deliveries: 0,
            oracle_fallbacks: 0,
            escalations: 0,
            evicted: 0,
            total_processing_time_ms: 0,
            score_sum: 0.0,
            start_time: now,
            last_updated: now,
        }
    }

    pub fn average_score(&self) -> f64 {
        if self.total_messages == 0 {
            0.0
        } else {
            self.score_sum / self.total_messages as f64
        }
    }

    pub fn average_processing_time_ms(&self) -> f64 {
        if self.total_messages == 0 {
            0.0
        } else {
            self.total_processing_time_ms as f64 / self.total_messages as f64
        }
    }
}

#[derive(Debug, Clone)]
pub enum StatEvent {
    MessageProcessed {
        action: ProtectionAction,
        score: f64,
        processing_time_ms: u64,
        used_fallback: bool,
        escalation: bool,
    },
    CapacityRejected,
    DeliveryFailed,
    DryRunDelivery,
    Evicted {
        count: usize,
    },
}

pub struct StatisticsCollector {
    stats: Mutex<GlobalStats>,
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(GlobalStats::new()),
        }
    }

    pub fn record_event(&self, event: StatEvent) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.last_updated = Utc::now();

        match event {
            StatEvent::MessageProcessed {
                action,
                score,
                processing_time_ms,
                used_fallback,
                escalation,
            } => {
                stats.total_messages += 1;
                stats.score_sum += score;
                stats.total_processing_time_ms += processing_time_ms;
                if used_fallback {
                    stats.oracle_fallbacks += 1;
                }
                if escalation {
                    stats.escalations += 1;
                }
                match action {
                    ProtectionAction::ForwardClean => stats.forwarded_clean += 1,
                    ProtectionAction::ForwardWithContext => stats.forwarded_with_context += 1,
                    ProtectionAction::RedactHarmful => stats.redacted += 1,
                    ProtectionAction::SummarizeOnly => stats.summarized += 1,
                    ProtectionAction::BlockEntirely => stats.blocked += 1,
                }
            }
            StatEvent::CapacityRejected => stats.capacity_rejections += 1,
            StatEvent::DeliveryFailed => stats.delivery_failures += 1,
            StatEvent::DryRunDelivery => stats.dry_run_deliveries += 1,
            StatEvent::Evicted { count } => stats.evicted += count as u64,
        }
    }

    pub fn snapshot(&self) -> GlobalStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset(&self) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = GlobalStats::new();
    }

    pub fn log_summary(&self) {
        let stats = self.snapshot();
        log::info!(
            "Stats: processed={} clean={} context={} redacted={} summarized={} blocked={} \
             rejected_full={} delivery_failures={} fallbacks={} escalations={} evicted={} avg_score={:.2}",
            stats.total_messages,
            stats.forwarded_clean,
            stats.forwarded_with_context,
            stats.redacted,
            stats.summarized,
            stats.blocked,
            stats.capacity_rejections,
            stats.delivery_failures,
            stats.oracle_fallbacks,
            stats.escalations,
            stats.evicted,
            stats.average_score()
        );
    }

    /// Log an aggregate summary every `period` until the task is aborted.
    pub fn spawn_reporter(
        self: std::sync::Arc<Self>,
        period: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.log_summary();
            }
        })
    }
}
