//! Graduated Decision Maker
//!
//! Maps a toxicity score onto one of five protection actions and applies
//! the matching content transform. The mapping itself ([`decide`]) is a pure
//! function of score and thresholds.

use crate::analysis::facts::{FactKind, FactSpan};
use crate::analysis::manner::ToneEstimator;
use crate::analysis::matcher::{merge_ranges, StaticMatcher};
use crate::analysis::{AnalysisResult, PatternHit, PhaseKind};
use crate::message::EphemeralMessage;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

pub const REDACTION_MARKER: &str = "[redacted]";

/// Summary body used when not even one fact fits.
const WITHHELD_MARKER: &str = "[Message withheld]";

/// Sentences at least this negative are redacted when no phrase matched.
const HOSTILE_SENTENCE_MIN: f64 = 0.2;

/// Phases scoring at least this much are named as drivers of a decision.
const DRIVER_MIN_SCORE: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtectionAction {
    ForwardClean,
    ForwardWithContext,
    RedactHarmful,
    SummarizeOnly,
    BlockEntirely,
}

impl ProtectionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionAction::ForwardClean => "FORWARD_CLEAN",
            ProtectionAction::ForwardWithContext => "FORWARD_WITH_CONTEXT",
            ProtectionAction::RedactHarmful => "REDACT_HARMFUL",
            ProtectionAction::SummarizeOnly => "SUMMARIZE_ONLY",
            ProtectionAction::BlockEntirely => "BLOCK_ENTIRELY",
        }
    }

    pub fn is_delivered(&self) -> bool {
        *self != ProtectionAction::BlockEntirely
    }
}

impl fmt::Display for ProtectionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lower band edges, one per action above `ForwardClean`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub forward_with_context: f64,
    pub redact_harmful: f64,
    pub summarize_only: f64,
    pub block_entirely: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            forward_with_context: 0.3,
            redact_harmful: 0.5,
            summarize_only: 0.7,
            block_entirely: 0.9,
        }
    }
}

impl Thresholds {
    /// Clamp edges to [0, 1] and make them non-decreasing. An override that
    /// undercuts a lower band pulls nothing down; the higher band simply
    /// starts where the lower one does.
    pub fn normalized(self) -> Self {
        let edge = |v: f64| if v.is_nan() { 1.0 } else { v.clamp(0.0, 1.0) };
        let forward_with_context = edge(self.forward_with_context);
        let redact_harmful = edge(self.redact_harmful).max(forward_with_context);
        let summarize_only = edge(self.summarize_only).max(redact_harmful);
        let block_entirely = edge(self.block_entirely).max(summarize_only);

        Self {
            forward_with_context,
            redact_harmful,
            summarize_only,
            block_entirely,
        }
    }

    /// Score band `[low, high)` covered by `action`.
    pub fn band(&self, action: ProtectionAction) -> (f64, f64) {
        let t = self.normalized();
        match action {
            ProtectionAction::ForwardClean => (0.0, t.forward_with_context),
            ProtectionAction::ForwardWithContext => (t.forward_with_context, t.redact_harmful),
            ProtectionAction::RedactHarmful => (t.redact_harmful, t.summarize_only),
            ProtectionAction::SummarizeOnly => (t.summarize_only, t.block_entirely),
            ProtectionAction::BlockEntirely => (t.block_entirely, 1.0),
        }
    }
}

/// Per-edge overrides; unset edges keep their base value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdOverrides {
    pub forward_with_context: Option<f64>,
    pub redact_harmful: Option<f64>,
    pub summarize_only: Option<f64>,
    pub block_entirely: Option<f64>,
}

impl ThresholdOverrides {
    pub fn apply_to(&self, base: Thresholds) -> Thresholds {
        Thresholds {
            forward_with_context: self
                .forward_with_context
                .unwrap_or(base.forward_with_context),
            redact_harmful: self.redact_harmful.unwrap_or(base.redact_harmful),
            summarize_only: self.summarize_only.unwrap_or(base.summarize_only),
            block_entirely: self.block_entirely.unwrap_or(base.block_entirely),
        }
        .normalized()
    }

    pub fn resolve(&self) -> Thresholds {
        self.apply_to(Thresholds::default())
    }
}

/// Map a score to an action. Deterministic, and monotonic in `score` for
/// fixed thresholds. NaN fails closed.
pub fn decide(score: f64, thresholds: &Thresholds) -> ProtectionAction {
    let score = if score.is_nan() { 1.0 } else { score };
    let t = thresholds.normalized();

    if score >= t.block_entirely {
        ProtectionAction::BlockEntirely
    } else if score >= t.summarize_only {
        ProtectionAction::SummarizeOnly
    } else if score >= t.redact_harmful {
        ProtectionAction::RedactHarmful
    } else if score >= t.forward_with_context {
        ProtectionAction::ForwardWithContext
    } else {
        ProtectionAction::ForwardClean
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformedContent {
    pub subject: String,
    pub body: String,
    pub html_body: Option<String>,
}

impl TransformedContent {
    pub fn is_empty(&self) -> bool {
        self.subject.is_empty() && self.body.is_empty() && self.html_body.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProtectionDecision {
    pub action: ProtectionAction,
    pub score: f64,
    pub content: TransformedContent,
    pub reasoning: String,
}

pub struct GraduatedDecisionMaker {
    thresholds: Thresholds,
    redactor: StaticMatcher,
    tone: ToneEstimator,
}

impl Default for GraduatedDecisionMaker {
    fn default() -> Self {
        Self::new(Thresholds::default())
    }
}

impl GraduatedDecisionMaker {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds: thresholds.normalized(),
            redactor: StaticMatcher::all(),
            tone: ToneEstimator::new(),
        }
    }

    pub fn from_overrides(overrides: &ThresholdOverrides) -> Self {
        Self::new(overrides.resolve())
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn update_thresholds(&mut self, thresholds: Thresholds) {
        self.thresholds = thresholds.normalized();
    }

    pub fn make_decision(
        &self,
        analysis: &AnalysisResult,
        message: &EphemeralMessage,
    ) -> ProtectionDecision {
        let score = analysis.toxicity_score;
        let action = decide(score, &self.thresholds);
        let content = self.transform(
            action,
            analysis,
            message.subject(),
            message.body(),
            message.html_body(),
        );
        let reasoning = self.build_reasoning(action, analysis);

        // Audit line: action and score only.
        log::info!("Protection decision: {} (score {:.2})", action, score);

        ProtectionDecision {
            action,
            score,
            content,
            reasoning,
        }
    }

    pub fn transform(
        &self,
        action: ProtectionAction,
        analysis: &AnalysisResult,
        subject: &str,
        body: &str,
        html_body: Option<&str>,
    ) -> TransformedContent {
        match action {
            ProtectionAction::ForwardClean => TransformedContent {
                subject: subject.to_string(),
                body: body.to_string(),
                html_body: html_body.map(str::to_string),
            },
            ProtectionAction::ForwardWithContext => TransformedContent {
                subject: subject.to_string(),
                body: format!("{}{}", body, context_annotation(analysis)),
                html_body: None,
            },
            ProtectionAction::RedactHarmful => TransformedContent {
                subject: self.redact(subject, &analysis.hits),
                body: self.redact_body(body, analysis),
                html_body: None,
            },
            ProtectionAction::SummarizeOnly => TransformedContent {
                subject: "[Summarized message]".to_string(),
                body: factual_summary(&analysis.facts, body.len()),
                html_body: None,
            },
            ProtectionAction::BlockEntirely => TransformedContent {
                subject: String::new(),
                body: String::new(),
                html_body: None,
            },
        }
    }

    /// Replace every harmful span with [`REDACTION_MARKER`].
    pub fn redact(&self, text: &str, hits: &[PatternHit]) -> String {
        splice_marker(text, self.harmful_spans(text, hits))
    }

    fn harmful_spans(&self, text: &str, hits: &[PatternHit]) -> Vec<Range<usize>> {
        let mut ranges = self.redactor.spans(text);
        ranges.extend(indicator_spans(text, hits));
        merge_ranges(ranges)
    }

    /// Redact the body by phrase. With no phrase match, redact whole
    /// sentences instead: the negative ones if tone finds any, otherwise
    /// every sentence without an extracted fact, and append the annotation.
    fn redact_body(&self, body: &str, analysis: &AnalysisResult) -> String {
        let ranges = self.harmful_spans(body, &analysis.hits);
        if !ranges.is_empty() {
            return splice_marker(body, ranges);
        }

        let sentences = sentence_spans(body);
        let mut hostile: Vec<Range<usize>> = sentences
            .iter()
            .filter(|r| self.tone.estimate(&body[(*r).clone()]).negativity >= HOSTILE_SENTENCE_MIN)
            .cloned()
            .collect();
        if hostile.is_empty() {
            hostile = sentences
                .into_iter()
                .filter(|r| !mentions_fact(&body[r.clone()], &analysis.facts))
                .collect();
        }

        let mut redacted = splice_marker(body, hostile);
        redacted.push_str(&context_annotation(analysis));
        redacted
    }

    fn build_reasoning(&self, action: ProtectionAction, analysis: &AnalysisResult) -> String {
        let (low, high) = self.thresholds.band(action);
        let band = if action == ProtectionAction::BlockEntirely {
            format!(">= {:.2}", low)
        } else {
            format!("in [{:.2}, {:.2})", low, high)
        };

        let mut drivers: Vec<(PhaseKind, f64)> = analysis
            .phases
            .iter()
            .filter(|p| p.phase != PhaseKind::FactExtraction && p.score >= DRIVER_MIN_SCORE)
            .map(|p| (p.phase, p.score))
            .collect();
        drivers.sort_by(|a, b| b.1.total_cmp(&a.1));

        let driver_text = if drivers.is_empty() {
            format!("no phase scored above {:.2}", DRIVER_MIN_SCORE)
        } else {
            let named: Vec<String> = drivers
                .iter()
                .map(|(phase, score)| format!("{} ({:.2})", phase.label(), score))
                .collect();
            format!("driven by {}", named.join(", "))
        };

        let mut reasoning = format!(
            "{}: score {:.2} {} - {}",
            action, analysis.toxicity_score, band, driver_text
        );
        if action == ProtectionAction::SummarizeOnly {
            reasoning.push_str(&format!(
                "; summary built from {} fact(s) found by {}",
                analysis.facts.len(),
                PhaseKind::FactExtraction.label()
            ));
        }
        if analysis.escalation_detected {
            reasoning.push_str("; session shows escalating hostility");
        }
        reasoning
    }
}

fn splice_marker(text: &str, ranges: Vec<Range<usize>>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for range in ranges {
        out.push_str(&text[cursor..range.start]);
        out.push_str(REDACTION_MARKER);
        cursor = range.end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Sentence byte ranges with surrounding whitespace trimmed. A sentence ends
/// at a line break or at `.`, `!` or `?` followed by whitespace.
fn sentence_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let boundary = match c {
            '\n' => true,
            '.' | '!' | '?' => chars.peek().map_or(true, |(_, next)| next.is_whitespace()),
            _ => false,
        };
        if boundary {
            let end = i + c.len_utf8();
            push_trimmed(text, start..end, &mut spans);
            start = end;
        }
    }
    push_trimmed(text, start..text.len(), &mut spans);
    spans
}

fn push_trimmed(text: &str, range: Range<usize>, spans: &mut Vec<Range<usize>>) {
    let slice = &text[range.clone()];
    let lead = slice.len() - slice.trim_start().len();
    let trail = slice.len() - slice.trim_end().len();
    if range.start + lead < range.end - trail {
        spans.push(range.start + lead..range.end - trail);
    }
}

fn mentions_fact(sentence: &str, facts: &[FactSpan]) -> bool {
    let lowered = sentence.to_lowercase();
    facts
        .iter()
        .map(|f| f.text.trim().to_lowercase())
        .any(|fact| !fact.is_empty() && lowered.contains(&fact))
}

fn indicator_spans(text: &str, hits: &[PatternHit]) -> Vec<Range<usize>> {
    hits.iter()
        .flat_map(|hit| hit.indicators.iter())
        .filter(|indicator| !indicator.trim().is_empty())
        .filter_map(|indicator| {
            RegexBuilder::new(&regex::escape(indicator))
                .case_insensitive(true)
                .build()
                .ok()
        })
        .flat_map(|re| re.find_iter(text).map(|m| m.range()).collect::<Vec<_>>())
        .collect()
}

fn context_annotation(analysis: &AnalysisResult) -> String {
    let mut labels: Vec<&str> = analysis.hits.iter().map(|h| h.category.label()).collect();
    labels.dedup();

    let signs = if labels.is_empty() {
        format!("a {:?} tone", analysis.tone).to_lowercase()
    } else {
        labels.join(", ")
    };

    let mut note = format!(
        "\n\n-- \n[Message context] This message shows signs of: {}. Toxicity score {:.2}.",
        signs, analysis.toxicity_score
    );
    if analysis.escalation_detected {
        note.push_str(" Recent messages in this conversation have been escalating.");
    }
    note
}

/// Neutral stand-in for a withheld body, always shorter than the original
/// (`original_len` bytes) unless the original is empty. Short originals get
/// the bare fact list, then as many facts as fit, then a marker.
fn factual_summary(facts: &[FactSpan], original_len: usize) -> String {
    let groups = fact_groups(facts);

    let mut full =
        String::from("[Summary] The original message was withheld because of hostile content.");
    if groups.is_empty() {
        full.push_str(" No factual details (amounts, dates, events) were found.");
    } else {
        full.push_str("\nFacts mentioned:");
        for (label, values) in &groups {
            full.push_str(&format!("\n- {}: {}", label, values.join(", ")));
        }
    }
    if full.len() < original_len {
        return full;
    }

    let mut compact = String::new();
    for value in groups.iter().flat_map(|(_, values)| values) {
        let separator = if compact.is_empty() { "" } else { "; " };
        if compact.len() + separator.len() + value.len() >= original_len {
            break;
        }
        compact.push_str(separator);
        compact.push_str(value);
    }
    if !compact.is_empty() {
        compact
    } else if WITHHELD_MARKER.len() < original_len {
        WITHHELD_MARKER.to_string()
    } else {
        String::new()
    }
}

fn fact_groups(facts: &[FactSpan]) -> Vec<(&'static str, Vec<String>)> {
    let groups = [
        (FactKind::Amount, "Amounts"),
        (FactKind::Date, "Dates"),
        (FactKind::Time, "Times"),
        (FactKind::Event, "Events"),
        (FactKind::Other, "Other details"),
    ];

    groups
        .into_iter()
        .filter_map(|(kind, label)| {
            let mut values: Vec<String> = facts
                .iter()
                .filter(|f| f.kind == kind)
                .map(|f| f.text.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            values.dedup_by(|a, b| a.eq_ignore_ascii_case(b));
            (!values.is_empty()).then_some((label, values))
        })
        .collect()
}
