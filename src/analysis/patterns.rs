//! Phase 3: manipulation tactics and Four Horsemen categories.
//!
//! Both the oracle and the static matcher are consulted. When their
//! severities diverge the record carries a disagreement flag instead of
//! quietly trusting either side.

use super::manner::Tone;
use super::matcher::StaticMatcher;
use super::oracle::{consult, OracleRequest};
use super::{
    clamp_unit, merge_hits, noisy_or, AnalysisMethod, AnalysisPhase, PatternHit, PhaseDetail,
    PhaseInput, PhaseKind, PhaseRecord,
};
use async_trait::async_trait;

/// Static hits gain this much confidence when the manner phase found a
/// hostile tone.
const HOSTILE_TONE_BOOST: f64 = 0.1;

pub struct PatternPhase {
    matcher: StaticMatcher,
    disagreement_threshold: f64,
}

impl PatternPhase {
    pub fn new(disagreement_threshold: f64) -> Self {
        Self {
            matcher: StaticMatcher::manipulation(),
            disagreement_threshold,
        }
    }

    fn static_hits(&self, input: &PhaseInput<'_>) -> Vec<PatternHit> {
        let hostile = matches!(
            input.context.phase(PhaseKind::Manner).map(|r| &r.detail),
            Some(PhaseDetail::Manner {
                tone: Tone::Negative | Tone::Mixed
            })
        );

        let mut hits = self.matcher.find(input.content);
        if hostile {
            for hit in &mut hits {
                hit.confidence = clamp_unit(hit.confidence + HOSTILE_TONE_BOOST);
            }
        }
        hits
    }
}

#[async_trait]
impl AnalysisPhase for PatternPhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Patterns
    }

    async fn run(&self, input: &PhaseInput<'_>) -> PhaseRecord {
        let static_hits = self.static_hits(input);
        let static_severity = noisy_or(static_hits.iter().map(PatternHit::weight));

        let request = OracleRequest {
            phase: PhaseKind::Patterns,
            content: input.content,
            sender: input.sender,
            context: input.context,
        };

        match consult(input.oracle, &request, input.oracle_timeout).await {
            Some(assessment) => {
                let oracle_severity = clamp_unit(assessment.score);
                let disagreement =
                    (oracle_severity - static_severity).abs() > self.disagreement_threshold;
                let mut notes = Vec::new();
                if disagreement {
                    log::debug!(
                        "Pattern sources disagree: oracle={:.2} static={:.2}",
                        oracle_severity,
                        static_severity
                    );
                    notes.push(format!(
                        "validation: oracle severity {:.2} vs pattern severity {:.2}",
                        oracle_severity, static_severity
                    ));
                }

                PhaseRecord {
                    phase: PhaseKind::Patterns,
                    method: AnalysisMethod::Oracle,
                    score: clamp_unit((oracle_severity + static_severity) / 2.0),
                    hits: merge_hits(assessment.hits.into_iter().chain(static_hits)),
                    detail: PhaseDetail::Patterns {
                        static_severity,
                        oracle_severity: Some(oracle_severity),
                        disagreement,
                    },
                    notes,
                }
            }
            None => PhaseRecord {
                phase: PhaseKind::Patterns,
                method: AnalysisMethod::Fallback,
                score: static_severity,
                hits: static_hits,
                detail: PhaseDetail::Patterns {
                    static_severity,
                    oracle_severity: None,
                    disagreement: false,
                },
                notes: vec!["severity from static pattern matcher only".to_string()],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::context::SharedAnalysisContext;
    use crate::analysis::test_support::ScriptedOracle;
    use crate::analysis::PatternCategory;
    use std::time::Duration;

    fn input<'a>(
        content: &'a str,
        ctx: &'a SharedAnalysisContext,
        oracle: Option<&'a dyn crate::analysis::oracle::ScoringOracle>,
    ) -> PhaseInput<'a> {
        PhaseInput {
            content,
            sender: "a@b.c",
            context: ctx,
            oracle,
            oracle_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_fallback_uses_static_matcher() {
        let ctx = SharedAnalysisContext::default();
        let record = PatternPhase::new(0.3)
            .run(&input("You always do this. Whatever.", &ctx, None))
            .await;

        assert_eq!(record.method, AnalysisMethod::Fallback);
        assert!(record.score > 0.0);
        assert!(record
            .hits
            .iter()
            .any(|h| h.category == PatternCategory::Criticism));
    }

    #[tokio::test]
    async fn test_disagreement_is_flagged() {
        let ctx = SharedAnalysisContext::default();
        let oracle = ScriptedOracle::new(&[0.9]);
        let record = PatternPhase::new(0.3)
            .run(&input("See you Friday.", &ctx, Some(&oracle)))
            .await;

        assert_eq!(record.method, AnalysisMethod::Oracle);
        assert!(matches!(
            record.detail,
            PhaseDetail::Patterns {
                disagreement: true,
                ..
            }
        ));
        assert!((record.score - 0.45).abs() < 1e-9);
        assert_eq!(record.notes.len(), 1);
    }

    #[tokio::test]
    async fn test_agreement_is_not_flagged() {
        let ctx = SharedAnalysisContext::default();
        let oracle = ScriptedOracle::new(&[0.1]);
        let record = PatternPhase::new(0.3)
            .run(&input("See you Friday.", &ctx, Some(&oracle)))
            .await;

        assert!(matches!(
            record.detail,
            PhaseDetail::Patterns {
                disagreement: false,
                ..
            }
        ));
    }
}
