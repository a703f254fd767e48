//! Phase 1: literal facts such as amounts, dates, times and named events.

use super::matcher::merge_ranges;
use super::oracle::{consult, OracleRequest};
use super::{AnalysisMethod, AnalysisPhase, PhaseDetail, PhaseInput, PhaseKind, PhaseRecord};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactKind {
    Amount,
    Date,
    Time,
    Event,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactSpan {
    pub kind: FactKind,
    pub text: String,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone)]
pub struct FactExtraction {
    pub facts: Vec<FactSpan>,
    pub fact_ratio: f64,
}

const FACT_PATTERNS: &[(FactKind, &str)] = &[
    (
        FactKind::Amount,
        r"[$€£]\s?\d[\d,]*(?:\.\d{1,2})?|\b\d[\d,]*(?:\.\d{1,2})?\s?(?:dollars|usd|eur|euros|pounds|gbp)\b",
    ),
    (FactKind::Date, r"\b\d{4}-\d{2}-\d{2}\b|\b\d{1,2}/\d{1,2}(?:/\d{2,4})?\b"),
    (
        FactKind::Date,
        r"\b(?:jan|feb|mar|apr|may|jun|jul|aug|sep|sept|oct|nov|dec)[a-z]*\.? \d{1,2}(?:st|nd|rd|th)?(?:,? \d{4})?\b",
    ),
    (
        FactKind::Date,
        r"\b(?:monday|tuesday|wednesday|thursday|friday|saturday|sunday|today|tomorrow|tonight|next week|this weekend)\b",
    ),
    (FactKind::Time, r"\b\d{1,2}(?::\d{2})?\s?(?:am|pm)\b|\b\d{1,2}:\d{2}\b"),
    (
        FactKind::Event,
        r"\b(?:pick ?up|drop ?off|appointment|meeting|hearing|court date|school|practice|recital|doctor|dentist|payment|child support|rent|visit|birthday|flight|dinner|vacation)\b",
    ),
];

pub struct FactExtractor {
    patterns: Vec<(FactKind, Regex)>,
}

impl Default for FactExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FactExtractor {
    pub fn new() -> Self {
        let patterns = FACT_PATTERNS
            .iter()
            .filter_map(|(kind, pattern)| {
                Regex::new(&format!("(?i){}", pattern))
                    .map(|re| (*kind, re))
                    .map_err(|e| log::warn!("Skipping invalid {:?} fact pattern: {}", kind, e))
                    .ok()
            })
            .collect();
        Self { patterns }
    }

    pub fn extract(&self, content: &str) -> FactExtraction {
        let mut facts: Vec<FactSpan> = self
            .patterns
            .iter()
            .flat_map(|(kind, re)| {
                re.find_iter(content).map(move |m| FactSpan {
                    kind: *kind,
                    text: m.as_str().to_string(),
                    start: m.start(),
                    end: m.end(),
                })
            })
            .collect();
        facts.sort_by_key(|f| (f.start, Reverse(f.end)));
        // Drop spans fully covered by an earlier, longer one.
        let mut kept: Vec<FactSpan> = Vec::with_capacity(facts.len());
        for fact in facts {
            if kept
                .iter()
                .any(|k| k.start <= fact.start && fact.end <= k.end)
            {
                continue;
            }
            kept.push(fact);
        }

        let fact_ratio = fact_ratio(content, &kept);
        FactExtraction {
            facts: kept,
            fact_ratio,
        }
    }

    /// Locate oracle-supplied fact strings in the content.
    pub fn locate(&self, content: &str, texts: &[String]) -> FactExtraction {
        let lowered = content.to_lowercase();
        let mut facts = Vec::new();
        for text in texts {
            let needle = text.to_lowercase();
            if needle.trim().is_empty() {
                continue;
            }
            // Lowercasing can shift byte offsets for some scripts; only keep
            // positions that map back onto the original text.
            match lowered.find(&needle) {
                Some(start)
                    if lowered.len() == content.len()
                        && content.is_char_boundary(start)
                        && content.is_char_boundary(start + needle.len()) =>
                {
                    facts.push(FactSpan {
                        kind: self.classify(text),
                        text: content[start..start + needle.len()].to_string(),
                        start,
                        end: start + needle.len(),
                    })
                }
                _ => facts.push(FactSpan {
                    kind: self.classify(text),
                    text: text.clone(),
                    start: 0,
                    end: 0,
                }),
            }
        }

        let fact_ratio = fact_ratio(content, &facts);
        FactExtraction { facts, fact_ratio }
    }

    fn classify(&self, text: &str) -> FactKind {
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(kind, _)| *kind)
            .unwrap_or(FactKind::Other)
    }
}

fn fact_ratio(content: &str, facts: &[FactSpan]) -> f64 {
    if content.is_empty() {
        return 0.0;
    }
    let covered: usize = merge_ranges(facts.iter().map(|f| f.start..f.end))
        .iter()
        .map(|r| r.len())
        .sum();
    (covered as f64 / content.len() as f64).min(1.0)
}

pub struct FactExtractionPhase {
    extractor: FactExtractor,
}

impl Default for FactExtractionPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl FactExtractionPhase {
    pub fn new() -> Self {
        Self {
            extractor: FactExtractor::new(),
        }
    }
}

#[async_trait]
impl AnalysisPhase for FactExtractionPhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::FactExtraction
    }

    async fn run(&self, input: &PhaseInput<'_>) -> PhaseRecord {
        let request = OracleRequest {
            phase: PhaseKind::FactExtraction,
            content: input.content,
            sender: input.sender,
            context: input.context,
        };

        let (extraction, method, notes) =
            match consult(input.oracle, &request, input.oracle_timeout).await {
                Some(assessment) => (
                    self.extractor.locate(input.content, &assessment.facts),
                    AnalysisMethod::Oracle,
                    Vec::new(),
                ),
                None => (
                    self.extractor.extract(input.content),
                    AnalysisMethod::Fallback,
                    vec!["facts extracted with local patterns".to_string()],
                ),
            };

        PhaseRecord {
            phase: PhaseKind::FactExtraction,
            method,
            score: 0.0,
            hits: Vec::new(),
            detail: PhaseDetail::Facts {
                facts: extraction.facts,
                fact_ratio: extraction.fact_ratio,
            },
            notes,
        }
    }
}
