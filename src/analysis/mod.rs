//! Multi-phase content analysis.
//!
//! Every message runs through four phases in a fixed order (facts, manner,
//! patterns, implicit). Each phase asks the configured [`ScoringOracle`]
//! first and falls back to a local heuristic when the oracle is missing,
//! slow or failing. Phases work on a snapshot of the session's
//! [`SharedAnalysisContext`]; the analyzer commits one update at the end.

pub mod context;
pub mod facts;
pub mod implicit;
pub mod manner;
pub mod matcher;
pub mod oracle;
pub mod patterns;

use crate::message::EphemeralMessage;
use async_trait::async_trait;
use context::{AnalysisSession, ContextUpdate, SharedAnalysisContext};
use facts::{FactExtractionPhase, FactSpan};
use implicit::ImplicitMessagePhase;
use manner::{MannerPhase, Tone};
use oracle::{OracleConfig, ScoringOracle};
use patterns::PatternPhase;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Scores below this are considered safe.
    pub safety_cutoff: f64,
    pub history_limit: usize,
    pub escalation_min_run: usize,
    pub escalation_min_step: f64,
    /// Oracle and static severities further apart than this are flagged.
    pub disagreement_threshold: f64,
    pub manner_weight: f64,
    pub fact_damping: f64,
    pub oracle_timeout_ms: u64,
    pub oracle: Option<OracleConfig>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            safety_cutoff: 0.3,
            history_limit: 20,
            escalation_min_run: 3,
            escalation_min_step: 0.05,
            disagreement_threshold: 0.3,
            manner_weight: 0.4,
            fact_damping: 0.2,
            oracle_timeout_ms: 3000,
            oracle: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    FactExtraction,
    Manner,
    Patterns,
    Implicit,
}

impl PhaseKind {
    pub fn label(&self) -> &'static str {
        match self {
            PhaseKind::FactExtraction => "fact extraction",
            PhaseKind::Manner => "manner analysis",
            PhaseKind::Patterns => "pattern analysis",
            PhaseKind::Implicit => "implicit-message analysis",
        }
    }
}

/// Which source produced a phase or a whole result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMethod {
    Oracle,
    Fallback,
    /// Some phases used the oracle, others fell back.
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 0.7 => ThreatLevel::Critical,
            s if s >= 0.5 => ThreatLevel::High,
            s if s >= 0.3 => ThreatLevel::Medium,
            s if s >= 0.1 => ThreatLevel::Low,
            _ => ThreatLevel::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    PersonalAttack,
    GuiltInduction,
    Gaslighting,
    SocialPressure,
    ControlTactic,
    // Four Horsemen
    Criticism,
    Contempt,
    Defensiveness,
    Stonewalling,
    // Implicit messages
    ImplicitThreat,
    PowerAssertion,
    EmotionalManipulation,
}

impl PatternCategory {
    pub fn label(&self) -> &'static str {
        match self {
            PatternCategory::PersonalAttack => "personal attack",
            PatternCategory::GuiltInduction => "guilt induction",
            PatternCategory::Gaslighting => "gaslighting",
            PatternCategory::SocialPressure => "social pressure",
            PatternCategory::ControlTactic => "control tactic",
            PatternCategory::Criticism => "criticism",
            PatternCategory::Contempt => "contempt",
            PatternCategory::Defensiveness => "defensiveness",
            PatternCategory::Stonewalling => "stonewalling",
            PatternCategory::ImplicitThreat => "implicit threat",
            PatternCategory::PowerAssertion => "power assertion",
            PatternCategory::EmotionalManipulation => "emotional manipulation",
        }
    }

    pub fn is_horseman(&self) -> bool {
        matches!(
            self,
            PatternCategory::Criticism
                | PatternCategory::Contempt
                | PatternCategory::Defensiveness
                | PatternCategory::Stonewalling
        )
    }
}

impl fmt::Display for PatternCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternHit {
    pub category: PatternCategory,
    pub confidence: f64,
    pub severity: f64,
    /// Matched phrases. These are message content and stay in memory.
    #[serde(default)]
    pub indicators: Vec<String>,
}

impl PatternHit {
    pub fn weight(&self) -> f64 {
        clamp_unit(self.severity * self.confidence)
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum PhaseDetail {
    Facts {
        facts: Vec<FactSpan>,
        fact_ratio: f64,
    },
    Manner {
        tone: Tone,
    },
    Patterns {
        static_severity: f64,
        oracle_severity: Option<f64>,
        disagreement: bool,
    },
    Implicit {
        signals: Vec<PatternCategory>,
    },
}

/// Output of one phase for one message.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord {
    pub phase: PhaseKind,
    pub method: AnalysisMethod,
    pub score: f64,
    pub hits: Vec<PatternHit>,
    pub detail: PhaseDetail,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseSummary {
    pub phase: PhaseKind,
    pub score: f64,
    pub method: AnalysisMethod,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub safe: bool,
    pub threat_level: ThreatLevel,
    pub toxicity_score: f64,
    pub hits: Vec<PatternHit>,
    pub reasoning: String,
    pub processing_time_ms: u64,
    pub method: AnalysisMethod,
    pub phases: Vec<PhaseSummary>,
    pub facts: Vec<FactSpan>,
    pub fact_ratio: f64,
    pub tone: Tone,
    pub escalation_detected: bool,
    pub disagreement: bool,
}

impl AnalysisResult {
    pub fn categories(&self) -> Vec<PatternCategory> {
        self.hits.iter().map(|h| h.category).collect()
    }

    pub fn phase_score(&self, phase: PhaseKind) -> f64 {
        self.phases
            .iter()
            .find(|p| p.phase == phase)
            .map(|p| p.score)
            .unwrap_or(0.0)
    }
}

/// Everything a phase may look at.
pub struct PhaseInput<'a> {
    pub content: &'a str,
    pub sender: &'a str,
    pub context: &'a SharedAnalysisContext,
    pub oracle: Option<&'a dyn ScoringOracle>,
    pub oracle_timeout: Duration,
}

#[async_trait]
pub trait AnalysisPhase: Send + Sync {
    fn kind(&self) -> PhaseKind;
    async fn run(&self, input: &PhaseInput<'_>) -> PhaseRecord;
}

pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Combine independent signals: `1 - Π(1 - s)`.
pub fn noisy_or<I: IntoIterator<Item = f64>>(signals: I) -> f64 {
    let remainder = signals
        .into_iter()
        .fold(1.0, |acc, s| acc * (1.0 - clamp_unit(s)));
    clamp_unit(1.0 - remainder)
}

/// Keep one hit per category, with the strongest severity and confidence
/// and the union of indicators.
pub fn merge_hits<I: IntoIterator<Item = PatternHit>>(hits: I) -> Vec<PatternHit> {
    let mut merged: BTreeMap<PatternCategory, PatternHit> = BTreeMap::new();
    for hit in hits {
        match merged.get_mut(&hit.category) {
            Some(existing) => {
                existing.severity = existing.severity.max(hit.severity);
                existing.confidence = existing.confidence.max(hit.confidence);
                for indicator in hit.indicators {
                    if !existing.indicators.contains(&indicator) {
                        existing.indicators.push(indicator);
                    }
                }
            }
            None => {
                merged.insert(hit.category, hit);
            }
        }
    }
    merged.into_values().collect()
}

pub struct MultiPhaseAnalyzer {
    phases: Vec<Box<dyn AnalysisPhase>>,
    oracle: Option<Arc<dyn ScoringOracle>>,
    config: AnalysisConfig,
}

impl Default for MultiPhaseAnalyzer {
    fn default() -> Self {
        Self::new(AnalysisConfig::default())
    }
}

impl MultiPhaseAnalyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        let phases: Vec<Box<dyn AnalysisPhase>> = vec![
            Box::new(FactExtractionPhase::new()),
            Box::new(MannerPhase::new()),
            Box::new(PatternPhase::new(config.disagreement_threshold)),
            Box::new(ImplicitMessagePhase::new()),
        ];

        Self {
            phases,
            oracle: None,
            config,
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn ScoringOracle>) -> Self {
        log::info!("Analysis oracle configured: {}", oracle.name());
        self.oracle = Some(oracle);
        self
    }

    /// Build the analyzer together with the oracle named in `config`.
    pub fn from_config(config: AnalysisConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_millis(config.oracle_timeout_ms);
        let oracle = oracle::build_oracle(config.oracle.as_ref(), timeout)?;
        let analyzer = Self::new(config);
        Ok(match oracle {
            Some(oracle) => analyzer.with_oracle(oracle),
            None => analyzer,
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn has_oracle(&self) -> bool {
        self.oracle.is_some()
    }

    /// Open a session using this analyzer's history and escalation settings.
    pub fn open_session(&self, key: impl Into<String>) -> AnalysisSession {
        AnalysisSession::open(key, self.new_context())
    }

    pub fn new_context(&self) -> SharedAnalysisContext {
        SharedAnalysisContext::new(
            self.config.history_limit,
            context::EscalationPolicy {
                min_run: self.config.escalation_min_run,
                min_step: self.config.escalation_min_step,
            },
        )
    }

    pub async fn analyze_message(
        &self,
        message: &EphemeralMessage,
        session: &AnalysisSession,
    ) -> AnalysisResult {
        let content = if message.subject().is_empty() {
            message.body().to_string()
        } else {
            format!("{}\n\n{}", message.subject(), message.body())
        };
        self.analyze(&content, message.sender(), session).await
    }

    /// Run all phases and commit the outcome to `session`.
    ///
    /// Never fails: oracle problems are absorbed inside each phase.
    pub async fn analyze(
        &self,
        content: &str,
        sender: &str,
        session: &AnalysisSession,
    ) -> AnalysisResult {
        let start = Instant::now();
        let mut working = session.snapshot();
        let oracle_timeout = Duration::from_millis(self.config.oracle_timeout_ms);
        let mut records = Vec::with_capacity(self.phases.len());

        for phase in &self.phases {
            let record = {
                let input = PhaseInput {
                    content,
                    sender,
                    context: &working,
                    oracle: self.oracle.as_deref(),
                    oracle_timeout,
                };
                phase.run(&input).await
            };
            log::debug!(
                "Phase {} finished: score={:.2} method={:?}",
                record.phase.label(),
                record.score,
                record.method
            );
            working.record_phase(record.clone());
            records.push(record);
        }

        let fact_ratio = working.fact_ratio();
        let toxicity_score = self.combine(&working, fact_ratio);
        let hits = merge_hits(
            records
                .iter()
                .filter(|r| matches!(r.phase, PhaseKind::Patterns | PhaseKind::Implicit))
                .flat_map(|r| r.hits.iter().cloned()),
        );
        let method = overall_method(&records);
        let disagreement = records.iter().any(|r| {
            matches!(
                r.detail,
                PhaseDetail::Patterns {
                    disagreement: true,
                    ..
                }
            )
        });
        let facts = match working.phase(PhaseKind::FactExtraction).map(|r| &r.detail) {
            Some(PhaseDetail::Facts { facts, .. }) => facts.clone(),
            _ => Vec::new(),
        };
        let tone = match working.phase(PhaseKind::Manner).map(|r| &r.detail) {
            Some(PhaseDetail::Manner { tone }) => *tone,
            _ => Tone::Neutral,
        };
        let phases = records
            .iter()
            .map(|r| PhaseSummary {
                phase: r.phase,
                score: r.score,
                method: r.method,
            })
            .collect();

        // Commit in one step so an abandoned analysis leaves no trace.
        let escalation_detected = session.commit(ContextUpdate {
            records,
            toxicity: toxicity_score,
            fact_ratio,
        });

        let threat_level = ThreatLevel::from_score(toxicity_score);
        let reasoning = build_reasoning(
            toxicity_score,
            threat_level,
            &hits,
            tone,
            fact_ratio,
            escalation_detected,
            disagreement,
            method,
        );

        AnalysisResult {
            safe: toxicity_score < self.config.safety_cutoff,
            threat_level,
            toxicity_score,
            hits,
            reasoning,
            processing_time_ms: start.elapsed().as_millis() as u64,
            method,
            phases,
            facts,
            fact_ratio,
            tone,
            escalation_detected,
            disagreement,
        }
    }

    fn combine(&self, context: &SharedAnalysisContext, fact_ratio: f64) -> f64 {
        let score_of = |kind| context.phase(kind).map(|r| r.score).unwrap_or(0.0);

        let raw = noisy_or([
            score_of(PhaseKind::Patterns),
            score_of(PhaseKind::Implicit),
            score_of(PhaseKind::Manner) * self.config.manner_weight,
        ]);

        clamp_unit(raw * (1.0 - clamp_unit(self.config.fact_damping) * fact_ratio))
    }
}

fn overall_method(records: &[PhaseRecord]) -> AnalysisMethod {
    let oracle_count = records
        .iter()
        .filter(|r| r.method == AnalysisMethod::Oracle)
        .count();
    if oracle_count == 0 {
        AnalysisMethod::Fallback
    } else if oracle_count == records.len() {
        AnalysisMethod::Oracle
    } else {
        AnalysisMethod::Mixed
    }
}

#[allow(clippy::too_many_arguments)]
fn build_reasoning(
    score: f64,
    level: ThreatLevel,
    hits: &[PatternHit],
    tone: Tone,
    fact_ratio: f64,
    escalation: bool,
    disagreement: bool,
    method: AnalysisMethod,
) -> String {
    let mut parts = vec![format!("Toxicity {:.2} ({:?})", score, level)];

    if hits.is_empty() {
        parts.push("no abuse patterns detected".to_string());
    } else {
        let labels: Vec<&str> = hits.iter().map(|h| h.category.label()).collect();
        parts.push(format!("patterns: {}", labels.join(", ")));
    }
    parts.push(format!("tone: {:?}", tone).to_lowercase());
    parts.push(format!("fact ratio {:.2}", fact_ratio));
    if escalation {
        parts.push("escalating hostility across session".to_string());
    }
    if disagreement {
        parts.push("oracle and pattern matcher disagree".to_string());
    }
    parts.push(format!("method: {:?}", method).to_lowercase());

    parts.join("; ")
}
