use crate::analysis::AnalysisConfig;
use crate::decision::ThresholdOverrides;
use crate::delivery::{DeliveryConfig, SenderKind};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub sweeper: SweeperConfig,
    pub sessions: SessionConfig,
    pub analysis: AnalysisConfig,
    pub thresholds: ThresholdOverrides,
    pub delivery: DeliveryConfig,
    pub statistics: StatisticsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub capacity: usize,
    pub default_ttl_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval_seconds: u64,
    pub grace_period_seconds: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            grace_period_seconds: 120,
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions unused for this long are closed.
    pub idle_timeout_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    pub enabled: bool,
    pub report_interval_seconds: u64,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            report_interval_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// env_logger filter used when RUST_LOG is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {path}"))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse configuration file {path}"))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write configuration file {path}"))?;
        Ok(())
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.store.capacity == 0 {
            anyhow::bail!("store.capacity must be at least 1");
        }
        if self.sweeper.interval_seconds == 0 {
            anyhow::bail!("sweeper.interval_seconds must be at least 1");
        }
        if self.delivery.attempt_timeout_ms == 0 {
            anyhow::bail!("delivery.attempt_timeout_ms must be at least 1");
        }

        let analysis = &self.analysis;
        for (name, value) in [
            ("analysis.safety_cutoff", analysis.safety_cutoff),
            ("analysis.escalation_min_step", analysis.escalation_min_step),
            ("analysis.disagreement_threshold", analysis.disagreement_threshold),
            ("analysis.manner_weight", analysis.manner_weight),
            ("analysis.fact_damping", analysis.fact_damping),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{name} must be between 0.0 and 1.0, got {value}");
            }
        }
        if analysis.escalation_min_run < 2 {
            anyhow::bail!("analysis.escalation_min_run must be at least 2");
        }

        let overrides = &self.thresholds;
        for (name, value) in [
            ("thresholds.forward_with_context", overrides.forward_with_context),
            ("thresholds.redact_harmful", overrides.redact_harmful),
            ("thresholds.summarize_only", overrides.summarize_only),
            ("thresholds.block_entirely", overrides.block_entirely),
        ] {
            if let Some(value) = value {
                if !(0.0..=1.0).contains(&value) {
                    anyhow::bail!("{name} must be between 0.0 and 1.0, got {value}");
                }
            }
        }

        if !self.delivery.dry_run {
            match self.delivery.sender {
                SenderKind::Api if self.delivery.api.is_none() => {
                    anyhow::bail!("delivery.api is required when delivery.sender is 'api'")
                }
                SenderKind::Smtp if self.delivery.smtp.is_none() => {
                    anyhow::bail!("delivery.smtp is required when delivery.sender is 'smtp'")
                }
                _ => {}
            }
        }

        Ok(())
    }
}
