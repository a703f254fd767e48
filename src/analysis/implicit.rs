//! Phase 4: messages that are implied rather than stated.

use super::matcher::StaticMatcher;
use super::oracle::{consult, OracleRequest};
use super::{
    clamp_unit, noisy_or, AnalysisMethod, AnalysisPhase, PatternHit, PhaseDetail, PhaseInput,
    PhaseKind, PhaseRecord,
};
use async_trait::async_trait;

/// Severity multiplier for fallback hits once the session is escalating.
const ESCALATION_AMPLIFIER: f64 = 1.15;

pub struct ImplicitMessagePhase {
    matcher: StaticMatcher,
}

impl Default for ImplicitMessagePhase {
    fn default() -> Self {
        Self::new()
    }
}

impl ImplicitMessagePhase {
    pub fn new() -> Self {
        Self {
            matcher: StaticMatcher::implicit(),
        }
    }
}

#[async_trait]
impl AnalysisPhase for ImplicitMessagePhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Implicit
    }

    async fn run(&self, input: &PhaseInput<'_>) -> PhaseRecord {
        let request = OracleRequest {
            phase: PhaseKind::Implicit,
            content: input.content,
            sender: input.sender,
            context: input.context,
        };

        let (score, hits, method, notes) =
            match consult(input.oracle, &request, input.oracle_timeout).await {
                Some(assessment) => (
                    clamp_unit(assessment.score),
                    assessment.hits,
                    AnalysisMethod::Oracle,
                    Vec::new(),
                ),
                None => {
                    let mut hits = self.matcher.find(input.content);
                    let mut notes = vec!["implicit signals from pattern matcher".to_string()];
                    // Veiled threats read differently in a session that is
                    // already heating up.
                    if input.context.escalation_detected() && !hits.is_empty() {
                        for hit in &mut hits {
                            hit.severity = clamp_unit(hit.severity * ESCALATION_AMPLIFIER);
                        }
                        notes.push("severity amplified by session escalation".to_string());
                    }
                    let score = noisy_or(hits.iter().map(PatternHit::weight));
                    (score, hits, AnalysisMethod::Fallback, notes)
                }
            };

        let signals = hits.iter().map(|h| h.category).collect();

        PhaseRecord {
            phase: PhaseKind::Implicit,
            method,
            score,
            hits,
            detail: PhaseDetail::Implicit { signals },
            notes,
        }
    }
}
