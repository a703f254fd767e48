//! Registry of open analysis sessions.
//!
//! A session is the conversation between one sender and one real user. It
//! is keyed by [`relationship_key`] so the registry never holds addresses.

use crate::analysis::context::{AnalysisSession, SessionSummary};
use crate::analysis::MultiPhaseAnalyzer;
use crate::privacy::relationship_key;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct Entry {
    session: AnalysisSession,
    last_used: Instant,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Entry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the session for this relationship, opening one if needed.
    pub fn open(
        &self,
        analyzer: &MultiPhaseAnalyzer,
        sender: &str,
        real_user: &str,
    ) -> AnalysisSession {
        let key = relationship_key(sender, real_user);
        let mut sessions = self.lock();
        let entry = sessions.entry(key.clone()).or_insert_with(|| {
            log::debug!("Opening analysis session {key}");
            Entry {
                session: analyzer.open_session(key.clone()),
                last_used: Instant::now(),
            }
        });
        entry.last_used = Instant::now();
        entry.session.clone()
    }

    pub fn close(&self, key: &str) -> Option<SessionSummary> {
        let entry = self.lock().remove(key)?;
        Some(entry.session.close())
    }

    /// Close every session unused for longer than `max_idle`.
    pub fn close_idle(&self, max_idle: Duration) -> usize {
        let idle: Vec<Entry> = {
            let mut sessions = self.lock();
            let keys: Vec<String> = sessions
                .iter()
                .filter(|(_, e)| e.last_used.elapsed() > max_idle)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| sessions.remove(k)).collect()
        };

        let closed = idle.len();
        for entry in idle {
            entry.session.close();
        }
        if closed > 0 {
            log::info!("Closed {closed} idle analysis sessions");
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
