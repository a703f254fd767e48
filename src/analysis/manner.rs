//! Phase 2: overall tone of the message.

use super::oracle::{consult, OracleRequest};
use super::{
    clamp_unit, AnalysisMethod, AnalysisPhase, PhaseDetail, PhaseInput, PhaseKind, PhaseRecord,
};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Positive,
    Neutral,
    Negative,
    Mixed,
}

impl Tone {
    /// Tone implied by a bare negativity score.
    pub fn from_negativity(score: f64) -> Self {
        match score {
            s if s >= 0.5 => Tone::Negative,
            s if s >= 0.2 => Tone::Mixed,
            _ => Tone::Neutral,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ToneEstimate {
    pub tone: Tone,
    /// 0.0 (calm) to 1.0 (hostile).
    pub negativity: f64,
}

const POSITIVE_WORDS: &str = r"\b(?:thanks|thank you|appreciate|appreciated|great|glad|happy|wonderful|kind|hope|please|sorry|good|love|welcome|nice|helpful)\b";
const NEGATIVE_WORDS: &str = r"\b(?:hate|angry|furious|disgusting|stupid|terrible|awful|worst|sick of|tired of|ridiculous|pathetic|useless|shut up|damn|hell|liar|lying|selfish|lazy|incompetent|ashamed|disgrace|failure)\b";

pub struct ToneEstimator {
    positive: Option<Regex>,
    negative: Option<Regex>,
}

impl Default for ToneEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl ToneEstimator {
    pub fn new() -> Self {
        let compile = |pattern: &str| match Regex::new(&format!("(?i){}", pattern)) {
            Ok(re) => Some(re),
            Err(e) => {
                log::warn!("Tone lexicon failed to compile: {}", e);
                None
            }
        };

        Self {
            positive: compile(POSITIVE_WORDS),
            negative: compile(NEGATIVE_WORDS),
        }
    }

    pub fn estimate(&self, content: &str) -> ToneEstimate {
        let count = |re: &Option<Regex>| re.as_ref().map(|re| re.find_iter(content).count()).unwrap_or(0);
        let positive = count(&self.positive) as f64;
        let negative = count(&self.negative) as f64;
        let intensity = shouting_intensity(content);

        let negativity = if negative > 0.0 {
            let balance = negative / (negative + positive);
            let volume = (negative / 3.0).min(1.0);
            clamp_unit(balance * (0.4 + 0.6 * volume) + intensity)
        } else {
            clamp_unit(intensity)
        };

        let tone = match (positive > 0.0, negative > 0.0) {
            (false, false) => Tone::from_negativity(negativity),
            (true, false) => Tone::Positive,
            (false, true) => Tone::Negative,
            (true, true) => {
                let minority = positive.min(negative) / positive.max(negative);
                if minority >= 0.3 {
                    Tone::Mixed
                } else if negative > positive {
                    Tone::Negative
                } else {
                    Tone::Positive
                }
            }
        };

        ToneEstimate { tone, negativity }
    }
}

/// All-caps text and repeated exclamation marks.
fn shouting_intensity(content: &str) -> f64 {
    let letters: Vec<char> = content.chars().filter(|c| c.is_alphabetic()).collect();
    let mut intensity = 0.0;

    if letters.len() >= 10 {
        let upper = letters.iter().filter(|c| c.is_uppercase()).count();
        if upper as f64 / letters.len() as f64 > 0.6 {
            intensity += 0.15;
        }
    }

    let exclamations = content.matches("!!").count();
    intensity + (exclamations as f64 * 0.05).min(0.15)
}

pub struct MannerPhase {
    estimator: ToneEstimator,
}

impl Default for MannerPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl MannerPhase {
    pub fn new() -> Self {
        Self {
            estimator: ToneEstimator::new(),
        }
    }
}

#[async_trait]
impl AnalysisPhase for MannerPhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Manner
    }

    async fn run(&self, input: &PhaseInput<'_>) -> PhaseRecord {
        let request = OracleRequest {
            phase: PhaseKind::Manner,
            content: input.content,
            sender: input.sender,
            context: input.context,
        };

        let (estimate, method, notes) =
            match consult(input.oracle, &request, input.oracle_timeout).await {
                Some(assessment) => {
                    let negativity = clamp_unit(assessment.score);
                    let tone = assessment
                        .tone
                        .unwrap_or_else(|| Tone::from_negativity(negativity));
                    (ToneEstimate { tone, negativity }, AnalysisMethod::Oracle, Vec::new())
                }
                None => (
                    self.estimator.estimate(input.content),
                    AnalysisMethod::Fallback,
                    vec!["tone estimated from keyword lexicon".to_string()],
                ),
            };

        PhaseRecord {
            phase: PhaseKind::Manner,
            method,
            score: estimate.negativity,
            hits: Vec::new(),
            detail: PhaseDetail::Manner {
                tone: estimate.tone,
            },
            notes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::context::SharedAnalysisContext;
    use crate::analysis::test_support::FailingOracle;
    use std::time::Duration;

    #[test]
    fn test_tone_classification() {
        let estimator = ToneEstimator::new();

        assert_eq!(estimator.estimate("Thanks, that works great.").tone, Tone::Positive);
        assert_eq!(estimator.estimate("Pickup is at 5.").tone, Tone::Neutral);
        assert_eq!(
            estimator.estimate("You are lazy and selfish, I hate this.").tone,
            Tone::Negative
        );
        assert_eq!(
            estimator.estimate("Thanks for the help, but the schedule is terrible.").tone,
            Tone::Mixed
        );
    }

    #[test]
    fn test_shouting_raises_negativity() {
        let estimator = ToneEstimator::new();
        let calm = estimator.estimate("this is terrible").negativity;
        let loud = estimator.estimate("THIS IS TERRIBLE!!!!").negativity;
        assert!(loud > calm);
    }

    #[tokio::test]
    async fn test_oracle_failure_is_recorded_as_fallback() {
        let ctx = SharedAnalysisContext::default();
        let oracle = FailingOracle;
        let input = PhaseInput {
            content: "I hate this",
            sender: "a@b.c",
            context: &ctx,
            oracle: Some(&oracle),
            oracle_timeout: Duration::from_secs(1),
        };

        let record = MannerPhase::new().run(&input).await;
        assert_eq!(record.method, AnalysisMethod::Fallback);
        assert!(!record.notes.is_empty());
        assert!(record.score > 0.0);
    }
}
