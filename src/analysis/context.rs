//! Session-scoped analysis state.

use super::{PhaseDetail, PhaseKind, PhaseRecord};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub toxicity: f64,
    pub fact_ratio: f64,
}

/// A run of `min_run` consecutive scores, each at least `min_step` above
/// the previous one, counts as escalation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EscalationPolicy {
    pub min_run: usize,
    pub min_step: f64,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            min_run: 3,
            min_step: 0.05,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SharedAnalysisContext {
    iteration: u64,
    history: VecDeque<HistoryPoint>,
    history_limit: usize,
    records: HashMap<PhaseKind, PhaseRecord>,
    policy: EscalationPolicy,
    escalation_detected: bool,
}

impl Default for SharedAnalysisContext {
    fn default() -> Self {
        Self::new(20, EscalationPolicy::default())
    }
}

impl SharedAnalysisContext {
    pub fn new(history_limit: usize, policy: EscalationPolicy) -> Self {
        let policy = EscalationPolicy {
            min_run: policy.min_run.max(2),
            min_step: policy.min_step.max(0.0),
        };
        let history_limit = history_limit.max(policy.min_run);

        Self {
            iteration: 0,
            history: VecDeque::with_capacity(history_limit),
            history_limit,
            records: HashMap::new(),
            policy,
            escalation_detected: false,
        }
    }

    /// Number of messages committed to this context.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryPoint> {
        self.history.iter()
    }

    pub fn recent_scores(&self, n: usize) -> Vec<f64> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).map(|p| p.toxicity).collect()
    }

    pub fn escalation_detected(&self) -> bool {
        self.escalation_detected
    }

    pub fn phase(&self, kind: PhaseKind) -> Option<&PhaseRecord> {
        self.records.get(&kind)
    }

    /// Store a phase record, replacing the one from the previous message.
    pub fn record_phase(&mut self, record: PhaseRecord) {
        self.records.insert(record.phase, record);
    }

    /// Fact ratio of the most recent fact-extraction record.
    pub fn fact_ratio(&self) -> f64 {
        match self.phase(PhaseKind::FactExtraction).map(|r| &r.detail) {
            Some(PhaseDetail::Facts { fact_ratio, .. }) => *fact_ratio,
            _ => 0.0,
        }
    }

    /// Append one message's scores and re-derive the escalation flag.
    pub fn push_history(&mut self, toxicity: f64, fact_ratio: f64) -> bool {
        self.iteration += 1;
        if self.history.len() == self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(HistoryPoint {
            toxicity,
            fact_ratio,
        });
        self.escalation_detected = self.detect_escalation();
        self.escalation_detected
    }

    fn detect_escalation(&self) -> bool {
        let run = self.policy.min_run;
        if self.history.len() < run {
            return false;
        }
        let recent = self.recent_scores(run);
        recent
            .windows(2)
            .all(|pair| pair[1] - pair[0] >= self.policy.min_step && pair[1] > pair[0])
    }

    fn apply(&mut self, update: ContextUpdate) -> bool {
        for record in update.records {
            self.record_phase(record);
        }
        self.push_history(update.toxicity, update.fact_ratio)
    }
}

/// Everything one analysis run writes back to its session.
#[derive(Debug, Clone)]
pub struct ContextUpdate {
    pub records: Vec<PhaseRecord>,
    pub toxicity: f64,
    pub fact_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SessionSummary {
    pub iterations: u64,
    pub escalation_detected: bool,
}

/// Handle to one session's context.
///
/// Cloning the handle shares the context. The lock is only held to take a
/// snapshot or to apply an update, never while a phase is running.
#[derive(Debug, Clone)]
pub struct AnalysisSession {
    key: String,
    context: Arc<Mutex<SharedAnalysisContext>>,
}

impl AnalysisSession {
    pub fn open(key: impl Into<String>, context: SharedAnalysisContext) -> Self {
        Self {
            key: key.into(),
            context: Arc::new(Mutex::new(context)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn lock(&self) -> MutexGuard<'_, SharedAnalysisContext> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> SharedAnalysisContext {
        self.lock().clone()
    }

    /// Apply an update atomically; returns the new escalation flag.
    pub fn commit(&self, update: ContextUpdate) -> bool {
        self.lock().apply(update)
    }

    pub fn summary(&self) -> SessionSummary {
        let context = self.lock();
        SessionSummary {
            iterations: context.iteration,
            escalation_detected: context.escalation_detected,
        }
    }

    /// End this handle's use of the session.
    pub fn close(self) -> SessionSummary {
        let summary = self.summary();
        log::debug!(
            "Analysis session closed after {} messages (escalation={})",
            summary.iterations,
            summary.escalation_detected
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> SharedAnalysisContext {
        SharedAnalysisContext::new(10, EscalationPolicy::default())
    }

    #[test]
    fn test_rising_scores_escalate() {
        let mut ctx = context();
        assert!(!ctx.push_history(0.2, 0.0));
        assert!(!ctx.push_history(0.4, 0.0));
        assert!(ctx.push_history(0.7, 0.0));
        assert!(ctx.escalation_detected());
    }

    #[test]
    fn test_flat_or_declining_scores_do_not_escalate() {
        let mut ctx = context();
        ctx.push_history(0.3, 0.0);
        ctx.push_history(0.3, 0.0);
        assert!(!ctx.push_history(0.2, 0.0));
    }

    #[test]
    fn test_escalation_is_rederived() {
        let mut ctx = context();
        for score in [0.2, 0.4, 0.7] {
            ctx.push_history(score, 0.0);
        }
        assert!(ctx.escalation_detected());
        ctx.push_history(0.1, 0.0);
        assert!(!ctx.escalation_detected());
    }

    #[test]
    fn test_small_steps_do_not_count() {
        let mut ctx = context();
        for score in [0.30, 0.32, 0.34] {
            ctx.push_history(score, 0.0);
        }
        assert!(!ctx.escalation_detected());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut ctx = SharedAnalysisContext::new(3, EscalationPolicy::default());
        for i in 0..10 {
            ctx.push_history(i as f64 / 10.0, 0.0);
        }
        assert_eq!(ctx.history().count(), 3);
        assert_eq!(ctx.iteration(), 10);
        assert_eq!(ctx.recent_scores(2), vec![0.8, 0.9]);
    }

    #[test]
    fn test_history_limit_never_below_run_length() {
        let mut ctx = SharedAnalysisContext::new(1, EscalationPolicy::default());
        for score in [0.1, 0.5, 0.9] {
            ctx.push_history(score, 0.0);
        }
        assert!(ctx.escalation_detected());
    }

    #[test]
    fn test_session_commit_and_close() {
        let session = AnalysisSession::open("k", context());
        let clone = session.clone();
        clone.commit(ContextUpdate {
            records: Vec::new(),
            toxicity: 0.5,
            fact_ratio: 0.1,
        });

        assert_eq!(session.snapshot().iteration(), 1);
        let summary = session.close();
        assert_eq!(summary.iterations, 1);
        assert!(!summary.escalation_detected);
    }
}
