//! Pluggable scoring oracles.
//!
//! A phase asks its oracle for an [`OracleAssessment`]. [`consult`] wraps
//! the call with a timeout and turns every failure into `None`, so phases
//! only ever see "answer" or "fall back".

use super::context::SharedAnalysisContext;
use super::facts::FactExtractor;
use super::manner::{Tone, ToneEstimator};
use super::matcher::StaticMatcher;
use super::{noisy_or, PatternHit, PhaseKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OracleKind {
    #[default]
    Http,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default)]
    pub kind: OracleKind,
    /// Required for the `http` kind.
    #[serde(default)]
    pub endpoint: String,
    /// Environment variable holding the bearer token, if any.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
    #[error("oracle returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("oracle timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OracleAssessment {
    /// Harm score for the phase, 0.0 to 1.0.
    pub score: f64,
    #[serde(default)]
    pub tone: Option<Tone>,
    #[serde(default)]
    pub hits: Vec<PatternHit>,
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

impl OracleAssessment {
    /// Pull the score and every hit's severity and confidence into [0, 1].
    pub fn bounded(mut self) -> Self {
        self.score = super::clamp_unit(self.score);
        for hit in &mut self.hits {
            hit.severity = super::clamp_unit(hit.severity);
            hit.confidence = super::clamp_unit(hit.confidence);
        }
        self
    }
}

pub struct OracleRequest<'a> {
    pub phase: PhaseKind,
    pub content: &'a str,
    pub sender: &'a str,
    pub context: &'a SharedAnalysisContext,
}

#[async_trait]
pub trait ScoringOracle: Send + Sync {
    fn name(&self) -> &str;
    async fn assess(&self, request: &OracleRequest<'_>) -> Result<OracleAssessment, OracleError>;
}

/// Ask `oracle` with a deadline. Failures are logged without content and
/// reported as `None`.
pub async fn consult(
    oracle: Option<&dyn ScoringOracle>,
    request: &OracleRequest<'_>,
    timeout: Duration,
) -> Option<OracleAssessment> {
    let oracle = oracle?;

    let result = match tokio::time::timeout(timeout, oracle.assess(request)).await {
        Ok(result) => result,
        Err(_) => Err(OracleError::Timeout(timeout)),
    };

    match result {
        Ok(assessment) if assessment.score.is_finite() => Some(assessment),
        Ok(_) => {
            log::warn!(
                "Oracle '{}' returned a non-finite score during {}, using fallback",
                oracle.name(),
                request.phase.label()
            );
            None
        }
        Err(e) => {
            log::warn!(
                "Oracle '{}' failed during {}, using fallback: {}",
                oracle.name(),
                request.phase.label(),
                e
            );
            None
        }
    }
}

/// Build the configured oracle. `None` config means phases always use
/// their fallbacks.
pub fn build_oracle(
    config: Option<&OracleConfig>,
    timeout: Duration,
) -> anyhow::Result<Option<Arc<dyn ScoringOracle>>> {
    let Some(config) = config else {
        return Ok(None);
    };
    let oracle: Arc<dyn ScoringOracle> = match config.kind {
        OracleKind::Local => Arc::new(LocalOracle::new()),
        OracleKind::Http => Arc::new(HttpOracle::from_config(config, timeout)?),
    };
    Ok(Some(oracle))
}

/// Oracle backed entirely by the local heuristics. Usable without any
/// network access.
pub struct LocalOracle {
    facts: FactExtractor,
    tone: ToneEstimator,
    manipulation: StaticMatcher,
    implicit: StaticMatcher,
}

impl Default for LocalOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalOracle {
    pub fn new() -> Self {
        Self {
            facts: FactExtractor::new(),
            tone: ToneEstimator::new(),
            manipulation: StaticMatcher::manipulation(),
            implicit: StaticMatcher::implicit(),
        }
    }
}

#[async_trait]
impl ScoringOracle for LocalOracle {
    fn name(&self) -> &str {
        "local"
    }

    async fn assess(&self, request: &OracleRequest<'_>) -> Result<OracleAssessment, OracleError> {
        let assessment = match request.phase {
            PhaseKind::FactExtraction => {
                let extraction = self.facts.extract(request.content);
                OracleAssessment {
                    score: 0.0,
                    facts: extraction.facts.into_iter().map(|f| f.text).collect(),
                    reasoning: format!("fact ratio {:.2}", extraction.fact_ratio),
                    ..Default::default()
                }
            }
            PhaseKind::Manner => {
                let estimate = self.tone.estimate(request.content);
                OracleAssessment {
                    score: estimate.negativity,
                    tone: Some(estimate.tone),
                    ..Default::default()
                }
            }
            PhaseKind::Patterns | PhaseKind::Implicit => {
                let matcher = if request.phase == PhaseKind::Patterns {
                    &self.manipulation
                } else {
                    &self.implicit
                };
                let hits = matcher.find(request.content);
                OracleAssessment {
                    score: noisy_or(hits.iter().map(PatternHit::weight)),
                    hits,
                    ..Default::default()
                }
            }
        };
        Ok(assessment)
    }
}

#[derive(Serialize)]
struct HttpOracleRequest<'a> {
    phase: PhaseKind,
    content: &'a str,
    sender: &'a str,
    iteration: u64,
    recent_scores: Vec<f64>,
    escalation_detected: bool,
}

/// Oracle reached over HTTP. The endpoint receives a JSON request per phase
/// and answers with an [`OracleAssessment`].
pub struct HttpOracle {
    client: reqwest::Client,
    endpoint: url::Url,
    api_key: Option<String>,
}

impl HttpOracle {
    pub fn from_config(config: &OracleConfig, timeout: Duration) -> anyhow::Result<Self> {
        let endpoint = url::Url::parse(&config.endpoint)
            .map_err(|e| anyhow::anyhow!("invalid oracle endpoint: {e}"))?;
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl ScoringOracle for HttpOracle {
    fn name(&self) -> &str {
        "http"
    }

    async fn assess(&self, request: &OracleRequest<'_>) -> Result<OracleAssessment, OracleError> {
        let body = HttpOracleRequest {
            phase: request.phase,
            content: request.content,
            sender: request.sender,
            iteration: request.context.iteration(),
            recent_scores: request.context.recent_scores(5),
            escalation_detected: request.context.escalation_detected(),
        };

        let mut builder = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        // reqwest errors can embed the URL but never the request body.
        let response = builder
            .send()
            .await
            .map_err(|e| OracleError::Unavailable(e.without_url().to_string()))?;

        if !response.status().is_success() {
            return Err(OracleError::Unavailable(format!(
                "HTTP status {}",
                response.status()
            )));
        }

        let assessment: OracleAssessment = response
            .json()
            .await
            .map_err(|e| OracleError::InvalidResponse(e.without_url().to_string()))?;
        Ok(assessment.bounded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowOracle;

    #[async_trait]
    impl ScoringOracle for SlowOracle {
        fn name(&self) -> &str {
            "slow"
        }

        async fn assess(
            &self,
            _request: &OracleRequest<'_>,
        ) -> Result<OracleAssessment, OracleError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(OracleAssessment::default())
        }
    }

    struct NanOracle;

    #[async_trait]
    impl ScoringOracle for NanOracle {
        fn name(&self) -> &str {
            "nan"
        }

        async fn assess(
            &self,
            _request: &OracleRequest<'_>,
        ) -> Result<OracleAssessment, OracleError> {
            Ok(OracleAssessment {
                score: f64::NAN,
                ..Default::default()
            })
        }
    }

    fn request<'a>(phase: PhaseKind, content: &'a str, ctx: &'a SharedAnalysisContext) -> OracleRequest<'a> {
        OracleRequest {
            phase,
            content,
            sender: "a@b.c",
            context: ctx,
        }
    }

    #[tokio::test]
    async fn test_consult_without_oracle() {
        let ctx = SharedAnalysisContext::default();
        let answer = consult(None, &request(PhaseKind::Manner, "hi", &ctx), Duration::from_secs(1)).await;
        assert!(answer.is_none());
    }

    #[tokio::test]
    async fn test_consult_times_out() {
        let ctx = SharedAnalysisContext::default();
        let oracle = SlowOracle;
        let answer = consult(
            Some(&oracle),
            &request(PhaseKind::Manner, "hi", &ctx),
            Duration::from_millis(20),
        )
        .await;
        assert!(answer.is_none());
    }

    #[tokio::test]
    async fn test_consult_rejects_nan_scores() {
        let ctx = SharedAnalysisContext::default();
        let oracle = NanOracle;
        let answer = consult(
            Some(&oracle),
            &request(PhaseKind::Patterns, "hi", &ctx),
            Duration::from_secs(1),
        )
        .await;
        assert!(answer.is_none());
    }

    #[tokio::test]
    async fn test_local_oracle_covers_every_phase() {
        let ctx = SharedAnalysisContext::default();
        let oracle = LocalOracle::new();
        let content = "You are worthless. Court date is March 3rd. You'll regret this.";

        let facts = oracle
            .assess(&request(PhaseKind::FactExtraction, content, &ctx))
            .await
            .unwrap();
        assert!(!facts.facts.is_empty());

        let patterns = oracle
            .assess(&request(PhaseKind::Patterns, content, &ctx))
            .await
            .unwrap();
        assert!(patterns.score > 0.0);

        let implicit = oracle
            .assess(&request(PhaseKind::Implicit, content, &ctx))
            .await
            .unwrap();
        assert!(implicit.score > 0.0);
        assert!(implicit
            .hits
            .iter()
            .any(|h| h.category == crate::analysis::PatternCategory::ImplicitThreat));
    }

    #[test]
    fn test_assessment_values_are_bounded() {
        let raw = r#"{
            "score": 1.7,
            "hits": [
                {"category": "contempt", "confidence": 3.0, "severity": -0.4},
                {"category": "gaslighting", "confidence": 0.6, "severity": 0.5}
            ]
        }"#;
        let assessment: OracleAssessment = serde_json::from_str(raw).unwrap();
        let assessment = assessment.bounded();

        assert_eq!(assessment.score, 1.0);
        assert_eq!(assessment.hits[0].confidence, 1.0);
        assert_eq!(assessment.hits[0].severity, 0.0);
        assert_eq!(assessment.hits[1].confidence, 0.6);
        assert_eq!(assessment.hits[1].severity, 0.5);
    }

    #[test]
    fn test_http_oracle_rejects_bad_endpoint() {
        let config = OracleConfig {
            kind: OracleKind::Http,
            endpoint: "not a url".to_string(),
            api_key_env: None,
        };
        assert!(HttpOracle::from_config(&config, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_build_oracle() {
        let timeout = Duration::from_secs(1);
        assert!(build_oracle(None, timeout).unwrap().is_none());

        let local = OracleConfig {
            kind: OracleKind::Local,
            endpoint: String::new(),
            api_key_env: None,
        };
        let oracle = build_oracle(Some(&local), timeout).unwrap().unwrap();
        assert_eq!(oracle.name(), "local");
    }
}
