//! Delivery of protected messages.
//!
//! The [`DeliveryManager`] only moves bytes: it never revisits the
//! protection decision it is handed. Failures end up in the
//! [`DeliveryOutcome`] rather than being returned as errors.

pub mod api;
pub mod sender;
pub mod smtp;

use crate::decision::{ProtectionAction, ProtectionDecision};
use crate::message::EphemeralMessage;
use crate::privacy::scrub_addresses;
use api::{ApiSender, ApiSenderConfig};
use sender::Sender;
use serde::{Deserialize, Serialize};
use smtp::{SmtpSender, SmtpSenderConfig};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const HEADER_ACTION: &str = "X-Fence-Action";
pub const HEADER_SCORE: &str = "X-Fence-Score";
pub const HEADER_REASON: &str = "X-Fence-Reason";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    Api,
    Smtp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub sender: SenderKind,
    pub max_retries: u32,
    pub dry_run: bool,
    pub attempt_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub api: Option<ApiSenderConfig>,
    pub smtp: Option<SmtpSenderConfig>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            sender: SenderKind::Smtp,
            max_retries: 3,
            dry_run: false,
            attempt_timeout_ms: 10_000,
            retry_backoff_ms: 500,
            api: None,
            smtp: Some(SmtpSenderConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryOutcome {
    pub success: bool,
    /// True only when a sender accepted the message.
    pub delivered: bool,
    pub dry_run: bool,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub error: Option<String>,
    pub action: ProtectionAction,
    pub score: f64,
}

/// Build the sender selected in `config`.
pub fn build_sender(config: &DeliveryConfig) -> anyhow::Result<Arc<dyn Sender>> {
    let timeout = Duration::from_millis(config.attempt_timeout_ms);
    match config.sender {
        SenderKind::Api => {
            let api = config
                .api
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("delivery.api must be set when sender is 'api'"))?;
            Ok(Arc::new(ApiSender::from_config(api, timeout)?))
        }
        SenderKind::Smtp => {
            let smtp = config
                .smtp
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("delivery.smtp must be set when sender is 'smtp'"))?;
            Ok(Arc::new(SmtpSender::from_config(smtp, timeout)?))
        }
    }
}

pub struct DeliveryManager {
    config: DeliveryConfig,
    sender: Option<Arc<dyn Sender>>,
    dry_run_count: AtomicU64,
}

impl DeliveryManager {
    pub fn new(config: DeliveryConfig, sender: Option<Arc<dyn Sender>>) -> Self {
        Self {
            config,
            sender,
            dry_run_count: AtomicU64::new(0),
        }
    }

    /// Build the configured sender. In dry-run mode a sender that cannot
    /// be built is tolerated since it will never be used.
    pub fn from_config(config: DeliveryConfig) -> anyhow::Result<Self> {
        let sender = match build_sender(&config) {
            Ok(sender) => Some(sender),
            Err(e) if config.dry_run => {
                log::warn!("No usable sender ({e}); dry-run deliveries only");
                None
            }
            Err(e) => return Err(e),
        };
        Ok(Self::new(config, sender))
    }

    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// Longest a single `deliver` call can take: every attempt timing out
    /// plus the linear backoff between them.
    pub fn worst_case_duration(&self) -> Duration {
        let retries = u64::from(self.config.max_retries);
        let attempts = retries.saturating_add(1);
        let sending = self.config.attempt_timeout_ms.saturating_mul(attempts);
        let backoff = self
            .config
            .retry_backoff_ms
            .saturating_mul(retries.saturating_mul(retries.saturating_add(1)) / 2);
        Duration::from_millis(sending.saturating_add(backoff))
    }

    /// Number of deliveries simulated so far.
    pub fn dry_run_deliveries(&self) -> u64 {
        self.dry_run_count.load(Ordering::Relaxed)
    }

    pub async fn deliver(
        &self,
        decision: &ProtectionDecision,
        message: &EphemeralMessage,
    ) -> DeliveryOutcome {
        let start = Instant::now();
        let outcome = |success, delivered, attempts, error| DeliveryOutcome {
            success,
            delivered,
            dry_run: self.config.dry_run,
            attempts,
            elapsed_ms: start.elapsed().as_millis() as u64,
            error,
            action: decision.action,
            score: decision.score,
        };

        if !decision.action.is_delivered() {
            log::debug!("Message blocked, nothing to deliver");
            return outcome(true, false, 0, None);
        }

        if self.config.dry_run {
            let count = self.dry_run_count.fetch_add(1, Ordering::Relaxed) + 1;
            log::debug!("Dry-run delivery #{count} ({})", decision.action);
            return outcome(true, false, 1, None);
        }

        let Some(sender) = &self.sender else {
            log::error!("Delivery failed: no sender configured");
            return outcome(false, false, 0, Some("no sender configured".to_string()));
        };

        let headers = protection_headers(decision);
        let total_attempts = self.config.max_retries.saturating_add(1);
        let timeout = Duration::from_millis(self.config.attempt_timeout_ms);
        let mut last_error = None;

        for attempt in 1..=total_attempts {
            let send = sender.send(
                message.real_user(),
                &decision.content.subject,
                &decision.content.body,
                &headers,
            );

            let error = match tokio::time::timeout(timeout, send).await {
                Ok(Ok(())) => {
                    log::info!(
                        "Delivered {} message via {} on attempt {}/{}",
                        decision.action,
                        sender.name(),
                        attempt,
                        total_attempts
                    );
                    return outcome(true, true, attempt, None);
                }
                Ok(Err(e)) => scrub_addresses(&e.to_string()),
                Err(_) => format!("attempt timed out after {}ms", timeout.as_millis()),
            };

            log::warn!(
                "Delivery attempt {}/{} via {} failed: {}",
                attempt,
                total_attempts,
                sender.name(),
                error
            );
            last_error = Some(error);

            if attempt < total_attempts && self.config.retry_backoff_ms > 0 {
                let backoff = self.config.retry_backoff_ms.saturating_mul(u64::from(attempt));
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }

        log::error!("Delivery gave up after {} attempts", total_attempts);
        outcome(false, false, total_attempts, last_error)
    }
}

pub fn protection_headers(decision: &ProtectionDecision) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert(HEADER_ACTION.to_string(), decision.action.to_string());
    headers.insert(HEADER_SCORE.to_string(), format!("{:.2}", decision.score));
    headers.insert(
        HEADER_REASON.to_string(),
        sender::sanitize_header_value(&decision.reasoning),
    );
    headers
}

#[cfg(test)]
mod tests {
    use super::sender::SendError;
    use super::*;
    use crate::decision::TransformedContent;
    use crate::message::test_inbound;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    /// Fails the first `failures` calls, then succeeds.
    struct FlakySender {
        failures: u32,
        calls: AtomicU32,
        seen: Mutex<Vec<(String, String, BTreeMap<String, String>)>>,
    }

    impl FlakySender {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Sender for FlakySender {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn send(
            &self,
            recipient: &str,
            _subject: &str,
            content: &str,
            headers: &BTreeMap<String, String>,
        ) -> Result<(), SendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen.lock().unwrap().push((
                recipient.to_string(),
                content.to_string(),
                headers.clone(),
            ));
            if call <= self.failures {
                Err(SendError::Rejected(format!("550 mailbox {recipient} unavailable")))
            } else {
                Ok(())
            }
        }
    }

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
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    fn config(max_retries: u32, dry_run: bool) -> DeliveryConfig {
        DeliveryConfig {
            max_retries,
            dry_run,
            attempt_timeout_ms: 50,
            retry_backoff_ms: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_worst_case_duration() {
        let manager = DeliveryManager::new(
            DeliveryConfig {
                max_retries: 2,
                attempt_timeout_ms: 1_000,
                retry_backoff_ms: 100,
                ..Default::default()
            },
            None,
        );
        // 3 attempts plus 100ms and 200ms of backoff.
        assert_eq!(manager.worst_case_duration(), Duration::from_millis(3_300));

        let extreme = DeliveryManager::new(
            DeliveryConfig {
                max_retries: u32::MAX,
                attempt_timeout_ms: u64::MAX,
                retry_backoff_ms: u64::MAX,
                ..Default::default()
            },
            None,
        );
        assert_eq!(extreme.worst_case_duration(), Duration::from_millis(u64::MAX));
    }

    fn decision(action: ProtectionAction) -> ProtectionDecision {
        ProtectionDecision {
            action,
            score: 0.42,
            content: TransformedContent {
                subject: "About the weekend".to_string(),
                body: "transformed body".to_string(),
                html_body: None,
            },
            reasoning: "FORWARD_WITH_CONTEXT: score 0.42".to_string(),
        }
    }

    fn message() -> EphemeralMessage {
        EphemeralMessage::from_inbound(test_inbound("m1", "original body"), 60)
    }

    #[tokio::test]
    async fn test_dry_run_counts_without_sending() {
        let sender = Arc::new(FlakySender::new(0));
        let manager = DeliveryManager::new(config(3, true), Some(sender.clone()));

        let outcome = manager
            .deliver(&decision(ProtectionAction::ForwardClean), &message())
            .await;
        manager
            .deliver(&decision(ProtectionAction::RedactHarmful), &message())
            .await;

        assert!(outcome.success);
        assert!(outcome.dry_run);
        assert!(!outcome.delivered);
        assert_eq!(manager.dry_run_deliveries(), 2);
        assert_eq!(sender.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sends_transformed_content_to_real_user() {
        let sender = Arc::new(FlakySender::new(0));
        let manager = DeliveryManager::new(config(3, false), Some(sender.clone()));

        let outcome = manager
            .deliver(&decision(ProtectionAction::ForwardWithContext), &message())
            .await;

        assert!(outcome.success && outcome.delivered);
        assert_eq!(outcome.attempts, 1);
        let seen = sender.seen.lock().unwrap();
        assert_eq!(seen[0].0, "parent@example.com");
        assert_eq!(seen[0].1, "transformed body");
        assert_eq!(seen[0].2[HEADER_ACTION], "FORWARD_WITH_CONTEXT");
        assert_eq!(seen[0].2[HEADER_SCORE], "0.42");
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let sender = Arc::new(FlakySender::new(2));
        let manager = DeliveryManager::new(config(3, false), Some(sender.clone()));

        let outcome = manager
            .deliver(&decision(ProtectionAction::ForwardClean), &message())
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let sender = Arc::new(FlakySender::new(u32::MAX));
        let manager = DeliveryManager::new(config(2, false), Some(sender.clone()));
        let decision = decision(ProtectionAction::ForwardClean);

        let outcome = manager.deliver(&decision, &message()).await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(sender.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.action, ProtectionAction::ForwardClean);
        let error = outcome.error.unwrap();
        assert!(error.contains("550"));
        assert!(!error.contains("parent@example.com"));
        assert_eq!(decision.action, ProtectionAction::ForwardClean);
    }

    #[tokio::test]
    async fn test_hung_sender_times_out() {
        let manager = DeliveryManager::new(config(1, false), Some(Arc::new(HangingSender)));
        let started = Instant::now();

        let outcome = manager
            .deliver(&decision(ProtectionAction::ForwardClean), &message())
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.error.unwrap().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_blocked_message_is_not_sent() {
        let sender = Arc::new(FlakySender::new(0));
        let manager = DeliveryManager::new(config(3, false), Some(sender.clone()));

        let outcome = manager
            .deliver(&decision(ProtectionAction::BlockEntirely), &message())
            .await;

        assert!(outcome.success);
        assert!(!outcome.delivered);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(sender.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_live_without_sender_reports_failure() {
        let manager = DeliveryManager::new(config(3, false), None);
        let outcome = manager
            .deliver(&decision(ProtectionAction::ForwardClean), &message())
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn test_build_sender_requires_section() {
        let config = DeliveryConfig {
            sender: SenderKind::Api,
            api: None,
            ..Default::default()
        };
        assert!(build_sender(&config).is_err());
        assert!(DeliveryManager::from_config(DeliveryConfig {
            dry_run: true,
            ..config
        })
        .is_ok());
    }
}
