//! End-to-end processing of one inbound message.
//!
//! store → analyze → decide → deliver → remove. The store entry is owned by
//! a guard so it disappears even when the processing future is dropped.

use crate::analysis::{AnalysisMethod, AnalysisResult, MultiPhaseAnalyzer};
use crate::config::Config;
use crate::decision::{GraduatedDecisionMaker, ProtectionDecision};
use crate::delivery::{DeliveryManager, DeliveryOutcome};
use crate::message::{EphemeralMessage, InboundMessage};
use crate::sessions::SessionRegistry;
use crate::statistics::{StatEvent, StatisticsCollector};
use crate::store::{BoundedStore, StoreError};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinSet;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("message not accepted: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingReport {
    pub message_id: String,
    pub analysis: AnalysisResult,
    pub decision: ProtectionDecision,
    pub outcome: DeliveryOutcome,
}

impl ProcessingReport {
    /// Log-safe outcome: action, score and delivery only.
    pub fn summary_line(&self) -> String {
        format!(
            "{} (score {:.2}, delivered={})",
            self.decision.action, self.decision.score, self.outcome.delivered
        )
    }
}

/// Removes a message from the store when dropped.
struct StoreEntryGuard<'a> {
    store: &'a BoundedStore,
    id: String,
}

impl Drop for StoreEntryGuard<'_> {
    fn drop(&mut self) {
        self.store.remove(&self.id);
    }
}

pub struct ProtectionPipeline {
    store: Arc<BoundedStore>,
    analyzer: MultiPhaseAnalyzer,
    decision_maker: GraduatedDecisionMaker,
    delivery: DeliveryManager,
    sessions: Arc<SessionRegistry>,
    stats: Arc<StatisticsCollector>,
    default_ttl_seconds: u64,
}

impl ProtectionPipeline {
    pub fn new(
        store: Arc<BoundedStore>,
        analyzer: MultiPhaseAnalyzer,
        decision_maker: GraduatedDecisionMaker,
        delivery: DeliveryManager,
        stats: Arc<StatisticsCollector>,
        default_ttl_seconds: u64,
    ) -> Self {
        Self {
            store,
            analyzer,
            decision_maker,
            delivery,
            sessions: Arc::new(SessionRegistry::new()),
            stats,
            default_ttl_seconds,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let analyzer = MultiPhaseAnalyzer::from_config(config.analysis.clone())?;
        let delivery = DeliveryManager::from_config(config.delivery.clone())?;
        Ok(Self::new(
            Arc::new(BoundedStore::new(config.store.capacity)),
            analyzer,
            GraduatedDecisionMaker::from_overrides(&config.thresholds),
            delivery,
            Arc::new(StatisticsCollector::new()),
            config.store.default_ttl_seconds,
        ))
    }

    pub fn store(&self) -> &Arc<BoundedStore> {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn statistics(&self) -> &Arc<StatisticsCollector> {
        &self.stats
    }

    pub fn delivery(&self) -> &DeliveryManager {
        &self.delivery
    }

    pub fn decision_maker(&self) -> &GraduatedDecisionMaker {
        &self.decision_maker
    }

    pub async fn process(
        &self,
        inbound: InboundMessage,
    ) -> Result<ProcessingReport, PipelineError> {
        let start = Instant::now();
        let message = EphemeralMessage::from_inbound(inbound, self.default_ttl_seconds);

        let message = match self.store.store(message) {
            Ok(message) => message,
            Err(e) => {
                if matches!(e, StoreError::CapacityExceeded { .. }) {
                    self.stats.record_event(StatEvent::CapacityRejected);
                }
                log::warn!("Inbound message rejected: {e}");
                return Err(e.into());
            }
        };
        let _guard = StoreEntryGuard {
            store: &self.store,
            id: message.id().to_string(),
        };

        let session = self
            .sessions
            .open(&self.analyzer, message.sender(), message.real_user());
        let analysis = self.analyzer.analyze_message(&message, &session).await;
        let decision = self.decision_maker.make_decision(&analysis, &message);
        let outcome = self.delivery.deliver(&decision, &message).await;

        if outcome.dry_run && decision.action.is_delivered() {
            self.stats.record_event(StatEvent::DryRunDelivery);
        }
        if !outcome.success {
            self.stats.record_event(StatEvent::DeliveryFailed);
        }
        let processing_time_ms = start.elapsed().as_millis() as u64;
        self.stats.record_event(StatEvent::MessageProcessed {
            action: decision.action,
            score: decision.score,
            processing_time_ms,
            used_fallback: analysis.method != AnalysisMethod::Oracle,
            escalation: analysis.escalation_detected,
        });

        log::debug!(
            "Processed message in {}ms: {} (delivered={})",
            processing_time_ms,
            decision.action,
            outcome.delivered
        );

        Ok(ProcessingReport {
            message_id: message.id().to_string(),
            analysis,
            decision,
            outcome,
        })
    }
}

/// Counts from one run of [`serve_lines`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeSummary {
    pub accepted: u64,
    pub malformed: u64,
    /// Messages still in flight when the drain deadline passed.
    pub abandoned: usize,
}

/// Feed one JSON message per line through `pipeline` until `input` ends or
/// `shutdown` resolves. Messages already in flight then get up to
/// `drain_timeout` to finish before they are aborted.
pub async fn serve_lines<R, S>(
    pipeline: Arc<ProtectionPipeline>,
    input: R,
    shutdown: S,
    drain_timeout: Duration,
) -> std::io::Result<ServeSummary>
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
{
    let mut summary = ServeSummary::default();
    let mut in_flight = JoinSet::new();
    let mut lines = input.lines();
    let mut read_error = None;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        log::info!("Input closed");
                        break;
                    }
                    Err(e) => {
                        log::error!("Reading input failed: {e}");
                        read_error = Some(e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let inbound: InboundMessage = match serde_json::from_str(&line) {
                    Ok(inbound) => inbound,
                    Err(e) => {
                        // Only the position: the line itself may hold content.
                        log::warn!("Skipping malformed message at line {}, column {}", e.line(), e.column());
                        summary.malformed += 1;
                        continue;
                    }
                };
                summary.accepted += 1;
                let pipeline = pipeline.clone();
                in_flight.spawn(async move {
                    match pipeline.process(inbound).await {
                        Ok(report) => log::info!("Message processed: {}", report.summary_line()),
                        Err(e) => log::warn!("{e}"),
                    }
                });
            }
            Some(finished) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = finished {
                    log::error!("Message task failed: {e}");
                }
            }
            _ = &mut shutdown => {
                log::info!("Received shutdown signal, cleaning up...");
                break;
            }
        }
    }

    summary.abandoned = drain(&mut in_flight, drain_timeout).await;
    match read_error {
        Some(e) => Err(e),
        None => Ok(summary),
    }
}

/// Wait for in-flight tasks, aborting whatever is left at the deadline.
async fn drain(in_flight: &mut JoinSet<()>, timeout: Duration) -> usize {
    if in_flight.is_empty() {
        return 0;
    }
    log::info!("Waiting up to {:?} for {} in-flight message(s)", timeout, in_flight.len());

    let finished = tokio::time::timeout(timeout, async {
        while let Some(result) = in_flight.join_next().await {
            if let Err(e) = result {
                log::error!("Message task failed: {e}");
            }
        }
    })
    .await;

    if finished.is_ok() {
        return 0;
    }
    let abandoned = in_flight.len();
    log::warn!("Aborting {} message(s) still in flight after {:?}", abandoned, timeout);
    in_flight.shutdown().await;
    abandoned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisConfig;
    use crate::decision::{ProtectionAction, Thresholds};
    use crate::delivery::sender::{SendError, Sender};
    use crate::delivery::DeliveryConfig;
    use crate::message::test_inbound;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct HangingSender;

    #[async_trait]
    impl Sender for HangingSender {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn send(
            &self,
            _recipient: &str,
            _subject: &str,
            _content: &str,
            _headers: &BTreeMap<String, String>,
        ) -> Result<(), SendError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    /// Accepts every message after a fixed delay.
    struct SlowSender {
        delay: Duration,
        accepted: AtomicU32,
    }

    #[async_trait]
    impl Sender for SlowSender {
        fn name(&self) -> &str {
            "slow"
        }

        async fn send(
            &self,
            _recipient: &str,
            _subject: &str,
            _content: &str,
            _headers: &BTreeMap<String, String>,
        ) -> Result<(), SendError> {
            tokio::time::sleep(self.delay).await;
            self.accepted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn live(sender: Arc<dyn Sender>) -> DeliveryManager {
        DeliveryManager::new(
            DeliveryConfig {
                dry_run: false,
                max_retries: 0,
                attempt_timeout_ms: 60_000,
                ..Default::default()
            },
            Some(sender),
        )
    }

    const INPUT: &str = concat!(
        r#"{"id":"s1","sender":"a@example.com","real_user":"b@example.com","subject":"Pickup","body":"Pickup is at 5pm on Saturday."}"#,
        "\n",
        "not json\n",
        "\n",
        r#"{"id":"s2","sender":"a@example.com","real_user":"b@example.com","subject":"Lunch","body":"Thanks for packing lunch."}"#,
        "\n",
    );

    fn pipeline(capacity: usize, delivery: DeliveryManager) -> ProtectionPipeline {
        ProtectionPipeline::new(
            Arc::new(BoundedStore::new(capacity)),
            MultiPhaseAnalyzer::new(AnalysisConfig::default()),
            GraduatedDecisionMaker::new(Thresholds::default()),
            delivery,
            Arc::new(StatisticsCollector::new()),
            3600,
        )
    }

    fn dry_run() -> DeliveryManager {
        DeliveryManager::new(
            DeliveryConfig {
                dry_run: true,
                ..Default::default()
            },
            None,
        )
    }

    #[tokio::test]
    async fn test_benign_message_end_to_end() {
        let pipeline = pipeline(4, dry_run());
        let report = pipeline
            .process(test_inbound(
                "m1",
                "Pickup is at 5pm on Saturday. Thanks for handling lunch!",
            ))
            .await
            .unwrap();

        assert_eq!(report.message_id, "m1");
        assert_eq!(report.decision.action, ProtectionAction::ForwardClean);
        let line = report.summary_line();
        assert!(line.starts_with("FORWARD_CLEAN (score "));
        assert!(line.ends_with("delivered=false)"));
        assert!(!line.contains("m1"));
        assert!(report.outcome.success && report.outcome.dry_run);
        assert!(pipeline.store().is_empty());
        assert_eq!(pipeline.delivery().dry_run_deliveries(), 1);

        let stats = pipeline.statistics().snapshot();
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.forwarded_clean, 1);
        assert_eq!(stats.dry_run_deliveries, 1);
    }

    #[tokio::test]
    async fn test_hostile_message_is_summarized_or_blocked() {
        let pipeline = pipeline(4, dry_run());
        let report = pipeline
            .process(test_inbound(
                "m2",
                "You are pathetic and worthless. You never listen, it's all your fault. \
                 You'll regret this. Everyone agrees you're a terrible parent.",
            ))
            .await
            .unwrap();

        assert!(report.decision.action >= ProtectionAction::SummarizeOnly);
        assert!(!report.analysis.safe);
        assert!(pipeline.store().is_empty());
    }

    #[tokio::test]
    async fn test_escalation_carries_across_messages() {
        let pipeline = pipeline(4, dry_run());
        let messages = [
            "Can we talk about the schedule for Saturday?",
            "You never listen. Whatever.",
            "You are pathetic. You never listen, it's all your fault. You'll regret this.",
        ];

        let mut last = None;
        for (i, body) in messages.iter().enumerate() {
            let report = pipeline
                .process(test_inbound(&format!("c{i}"), body))
                .await
                .unwrap();
            last = Some(report);
        }

        let last = last.unwrap();
        assert!(last.analysis.escalation_detected);
        assert_eq!(pipeline.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_rejection_is_counted() {
        let pipeline = pipeline(1, dry_run());
        let inbound = test_inbound("held", "hello");
        pipeline
            .store()
            .store(EphemeralMessage::from_inbound(inbound, 60))
            .unwrap();

        let result = pipeline.process(test_inbound("m3", "hello")).await;

        assert!(matches!(
            result,
            Err(PipelineError::Store(StoreError::CapacityExceeded { .. }))
        ));
        assert_eq!(pipeline.statistics().snapshot().capacity_rejections, 1);
        assert_eq!(pipeline.store().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_processing_leaves_store_empty() {
        let delivery = DeliveryManager::new(
            DeliveryConfig {
                dry_run: false,
                attempt_timeout_ms: 60_000,
                ..Default::default()
            },
            Some(Arc::new(HangingSender)),
        );
        let pipeline = pipeline(4, delivery);

        let result = tokio::time::timeout(
            Duration::from_millis(100),
            pipeline.process(test_inbound("m4", "See you Friday.")),
        )
        .await;

        assert!(result.is_err());
        assert!(pipeline.store().is_empty());
    }

    #[tokio::test]
    async fn test_serve_lines_drains_in_flight_messages_at_end_of_input() {
        let sender = Arc::new(SlowSender {
            delay: Duration::from_millis(200),
            accepted: AtomicU32::new(0),
        });
        let pipeline = Arc::new(pipeline(4, live(sender.clone())));

        let summary = serve_lines(
            pipeline.clone(),
            INPUT.as_bytes(),
            std::future::pending(),
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert_eq!(summary.accepted, 2);
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.abandoned, 0);
        assert_eq!(sender.accepted.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.statistics().snapshot().total_messages, 2);
        assert!(pipeline.store().is_empty());
    }

    #[tokio::test]
    async fn test_serve_lines_drains_after_shutdown_signal() {
        let sender = Arc::new(SlowSender {
            delay: Duration::from_millis(200),
            accepted: AtomicU32::new(0),
        });
        let pipeline = Arc::new(pipeline(4, live(sender.clone())));

        // The writer stays open, so only the shutdown signal ends the loop.
        let (mut writer, reader) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut writer, INPUT.as_bytes())
            .await
            .unwrap();
        let shutdown = tokio::time::sleep(Duration::from_millis(50));

        let summary = serve_lines(
            pipeline.clone(),
            tokio::io::BufReader::new(reader),
            shutdown,
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert_eq!(summary.accepted, 2);
        assert_eq!(summary.abandoned, 0);
        assert_eq!(sender.accepted.load(Ordering::SeqCst), 2);
        drop(writer);
    }

    #[tokio::test]
    async fn test_serve_lines_aborts_after_drain_timeout() {
        let pipeline = Arc::new(pipeline(4, live(Arc::new(HangingSender))));

        let summary = serve_lines(
            pipeline.clone(),
            INPUT.as_bytes(),
            std::future::pending(),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        assert_eq!(summary.accepted, 2);
        assert_eq!(summary.abandoned, 2);
        assert!(pipeline.store().is_empty());
    }
}
