use super::{PatternCategory, PatternHit};
use regex::Regex;
use std::collections::BTreeMap;
use std::ops::Range;

struct PatternRule {
    category: PatternCategory,
    pattern: Regex,
    severity: f64,
}

/// Regex table mapping phrases to abuse categories.
pub struct StaticMatcher {
    rules: Vec<PatternRule>,
}

const MANIPULATION_RULES: &[(PatternCategory, f64, &str)] = &[
    (
        PatternCategory::PersonalAttack,
        0.7,
        r"\byou(?:'re| are) (?:such )?(?:an? )?(?:idiot|stupid|pathetic|worthless|useless|loser|failure|joke|disgrace|moron|crazy|psycho)\b",
    ),
    (
        PatternCategory::PersonalAttack,
        0.65,
        r"\b(?:idiot|moron|stupid|worthless|loser|dumb|psycho|bitch|bastard|jerk)\b",
    ),
    (
        PatternCategory::GuiltInduction,
        0.5,
        r"\bafter (?:all|everything) i(?:'ve| have) done\b|\byou should be ashamed\b|\bhow could you\b|\bbecause of you\b|\byou never think about\b",
    ),
    (
        PatternCategory::Gaslighting,
        0.6,
        r"\bthat never happened\b|\bi never said that\b|\byou(?:'re| are) (?:imagining (?:it|things)|making (?:it|this|things) up|overreacting|too sensitive|remembering (?:it )?wrong)\b",
    ),
    (
        PatternCategory::SocialPressure,
        0.45,
        r"\beveryone (?:knows|thinks|agrees|says)\b|\b(?:people|everybody) (?:are|is) talking\b|\bwhat will (?:people|your family|the neighbou?rs) think\b|\bask anyone\b",
    ),
    (
        PatternCategory::ControlTactic,
        0.6,
        r"\byou (?:will|must|have to|better) (?:do|answer|call|reply|respond)\b|\bi forbid you\b|\byou(?:'re| are) not allowed\b|\bdo what i say\b|\byou need my permission\b|\b(?:answer|reply|respond to) me (?:now|immediately)\b",
    ),
    (
        PatternCategory::Criticism,
        0.4,
        r"\byou (?:always|never) \w+|\bwhat(?:'s| is) wrong with you\b|\byou can(?:'t|not) (?:even )?do anything right\b",
    ),
    (
        PatternCategory::Contempt,
        0.75,
        r"\b(?:disgusting|pathetic|ridiculous|laughable|worthless)\b|\byou make me sick\b|\bnobody (?:cares|likes you)\b",
    ),
    (
        PatternCategory::Defensiveness,
        0.3,
        r"\b(?:it'?s|this is) not my fault\b|\bdon'?t blame me\b|\bi didn'?t do anything wrong\b|\byou started (?:it|this)\b",
    ),
    (
        PatternCategory::Stonewalling,
        0.3,
        r"\bi(?:'m| am) (?:done|not) (?:talking|discussing)\b|\bleave me alone\b|\bi(?:'m| am) not (?:going to|gonna) (?:answer|respond)\b|\bwhatever\b",
    ),
];

const IMPLICIT_RULES: &[(PatternCategory, f64, &str)] = &[
    (
        PatternCategory::ImplicitThreat,
        0.85,
        r"\byou(?:'ll| will) regret\b|\bwould be a shame if\b|\bi know where you (?:live|work)\b|\bwatch (?:your back|yourself)\b|\byou(?:'ll| will) (?:see|find out) what happens\b|\bdon'?t make me\b|\bor else\b",
    ),
    (
        PatternCategory::PowerAssertion,
        0.55,
        r"\bi pay for\b|\bmy (?:house|money),? my rules\b|\byou owe me\b|\bwithout me,? you(?:'d| would)? (?:have|be) nothing\b|\bi(?:'ll| will) (?:take|get) (?:the kids|custody|everything)\b|\bmy lawyer\b",
    ),
    (
        PatternCategory::EmotionalManipulation,
        0.6,
        r"\bif you (?:really )?loved? (?:me|them|the kids)\b|\byou made me (?:do|say|feel)\b|\blook what you made me\b|\byou(?:'re| are) (?:breaking|destroying) (?:this family|the kids|me)\b|\bi(?:'ll| will) (?:hurt|kill) myself\b",
    ),
    (
        PatternCategory::SocialPressure,
        0.45,
        r"\bthe kids will know\b|\beveryone will (?:know|find out|see)\b|\bpeople are talking\b|\bi(?:'ll| will) tell everyone\b",
    ),
];

impl StaticMatcher {
    fn from_table(table: &[(PatternCategory, f64, &str)]) -> Self {
        let rules = table
            .iter()
            .filter_map(|(category, severity, pattern)| {
                match Regex::new(&format!("(?i){}", pattern)) {
                    Ok(pattern) => Some(PatternRule {
                        category: *category,
                        pattern,
                        severity: *severity,
                    }),
                    Err(e) => {
                        log::warn!("Skipping invalid {} pattern: {}", category, e);
                        None
                    }
                }
            })
            .collect();
        Self { rules }
    }

    /// Manipulation tactics and Four Horsemen categories.
    pub fn manipulation() -> Self {
        Self::from_table(MANIPULATION_RULES)
    }

    /// Threats, power assertions and pressure that are implied rather than stated.
    pub fn implicit() -> Self {
        Self::from_table(IMPLICIT_RULES)
    }

    /// Every harmful pattern, used for redaction.
    pub fn all() -> Self {
        let mut matcher = Self::manipulation();
        matcher.rules.extend(Self::implicit().rules);
        matcher
    }

    /// One hit per matched category. Confidence grows with the number of
    /// matches.
    pub fn find(&self, text: &str) -> Vec<PatternHit> {
        let mut by_category: BTreeMap<PatternCategory, (f64, Vec<String>)> = BTreeMap::new();

        for rule in &self.rules {
            for m in rule.pattern.find_iter(text) {
                let entry = by_category
                    .entry(rule.category)
                    .or_insert((0.0, Vec::new()));
                entry.0 = entry.0.max(rule.severity);
                let indicator = m.as_str().to_lowercase();
                if !entry.1.contains(&indicator) {
                    entry.1.push(indicator);
                }
            }
        }

        by_category
            .into_iter()
            .map(|(category, (severity, indicators))| PatternHit {
                category,
                confidence: (0.5 + 0.15 * indicators.len() as f64).min(0.95),
                severity,
                indicators,
            })
            .collect()
    }

    /// Byte ranges of every match, sorted and merged.
    pub fn spans(&self, text: &str) -> Vec<Range<usize>> {
        let ranges = self
            .rules
            .iter()
            .flat_map(|rule| rule.pattern.find_iter(text).map(|m| m.range()));
        merge_ranges(ranges)
    }
}

pub fn merge_ranges<I: IntoIterator<Item = Range<usize>>>(ranges: I) -> Vec<Range<usize>> {
    let mut ranges: Vec<Range<usize>> = ranges.into_iter().filter(|r| !r.is_empty()).collect();
    ranges.sort_by_key(|r| (r.start, r.end));

    let mut merged: Vec<Range<usize>> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}
