//! Admission control for tool executions.
//!
//! Checks run in a fixed order: the global stop switch, the concurrency
//! ceiling, then the per-document session ceiling. A request id may only be
//! in flight once, so each active id holds exactly one concurrency slot.
//! An admitted execution holds an [`AdmissionPermit`]; dropping it releases
//! the slot whatever the outcome.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::ExecutionError;

/// Tool-call accounting for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentSessionState {
    pub document_path: String,
    /// Calls that reached a server since the last reset.
    pub total_session_count: u32,
    pub last_accessed: DateTime<Utc>,
}

#[derive(Default)]
struct TrackerState {
    active: HashSet<String>,
    /// Admitted executions not yet counted against their document.
    reserved: HashMap<String, u32>,
    sessions: HashMap<String, DocumentSessionState>,
    total_executed: u64,
    peak_active: usize,
    stopped: bool,
}

impl TrackerState {
    fn session_count(&self, document: &str) -> u32 {
        self.sessions
            .get(document)
            .map_or(0, |s| s.total_session_count)
    }

    fn pending(&self, document: &str) -> u32 {
        self.reserved.get(document).copied().unwrap_or(0)
    }

    fn check_open(&self, limit: usize) -> Result<(), ExecutionError> {
        if self.stopped {
            return Err(ExecutionError::Stopped);
        }
        if self.active.len() >= limit {
            return Err(ExecutionError::ConcurrencyLimit {
                active: self.active.len(),
                limit,
            });
        }
        Ok(())
    }

    /// Stop switch, then request-id uniqueness, then the concurrency ceiling.
    fn check_admissible(&self, request_id: &str, limit: usize) -> Result<(), ExecutionError> {
        if !self.stopped && self.active.contains(request_id) {
            return Err(ExecutionError::DuplicateRequest(request_id.to_string()));
        }
        self.check_open(limit)
    }

    fn grant(&mut self, request_id: &str, document: Option<&str>) {
        self.active.insert(request_id.to_string());
        self.peak_active = self.peak_active.max(self.active.len());
        if let Some(document) = document {
            *self.reserved.entry(document.to_string()).or_default() += 1;
        }
    }
}

/// Outcome of the synchronous admission checks.
#[derive(Debug)]
pub enum Admission {
    Granted(AdmissionPermit),
    /// The document is at its limit; the caller must ask before going on.
    SessionLimitReached {
        document: String,
        limit: u32,
        current: u32,
    },
}

pub struct ExecutionAdmissionTracker {
    concurrent_limit: usize,
    session_limit: u32,
    state: Arc<Mutex<TrackerState>>,
}

impl ExecutionAdmissionTracker {
    pub fn new(concurrent_limit: usize, session_limit: u32) -> Self {
        Self {
            concurrent_limit,
            session_limit,
            state: Arc::new(Mutex::new(TrackerState::default())),
        }
    }

    pub fn concurrent_limit(&self) -> usize {
        self.concurrent_limit
    }

    pub fn session_limit(&self) -> u32 {
        self.session_limit
    }

    /// Run the ordered admission checks.
    pub fn try_admit(
        &self,
        request_id: &str,
        document: Option<&str>,
    ) -> Result<Admission, ExecutionError> {
        let mut state = self.state.lock();
        state.check_admissible(request_id, self.concurrent_limit)?;

        if let Some(document) = document {
            let current = state.session_count(document) + state.pending(document);
            if current >= self.session_limit {
                return Ok(Admission::SessionLimitReached {
                    document: document.to_string(),
                    limit: self.session_limit,
                    current,
                });
            }
        }

        state.grant(request_id, document);
        Ok(Admission::Granted(self.permit(request_id, document)))
    }

    /// Admit one call past the session limit after the user agreed.
    ///
    /// The stop switch, id uniqueness and concurrency ceiling still apply.
    pub fn admit_over_limit(
        &self,
        request_id: &str,
        document: &str,
    ) -> Result<AdmissionPermit, ExecutionError> {
        let mut state = self.state.lock();
        state.check_admissible(request_id, self.concurrent_limit)?;
        state.grant(request_id, Some(document));
        Ok(self.permit(request_id, Some(document)))
    }

    /// Side-effect free version of the admission checks.
    pub fn can_execute(&self, document: Option<&str>) -> bool {
        let state = self.state.lock();
        if state.check_open(self.concurrent_limit).is_err() {
            return false;
        }
        document.is_none_or(|d| state.session_count(d) + state.pending(d) < self.session_limit)
    }

    pub fn stop(&self) {
        self.state.lock().stopped = true;
    }

    pub fn resume(&self) {
        self.state.lock().stopped = false;
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn active_executions(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.state.lock().active.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Highest number of simultaneous executions seen.
    pub fn peak_active(&self) -> usize {
        self.state.lock().peak_active
    }

    pub fn total_executed(&self) -> u64 {
        self.state.lock().total_executed
    }

    pub fn total_session_count(&self, document: &str) -> u32 {
        self.state.lock().session_count(document)
    }

    pub fn session_state(&self, document: &str) -> Option<DocumentSessionState> {
        self.state.lock().sessions.get(document).cloned()
    }

    pub fn reset_session(&self, document: &str) {
        self.state.lock().sessions.remove(document);
    }

    pub fn reset_all_sessions(&self) {
        self.state.lock().sessions.clear();
    }

    fn permit(&self, request_id: &str, document: Option<&str>) -> AdmissionPermit {
        AdmissionPermit {
            state: self.state.clone(),
            request_id: request_id.to_string(),
            document: document.map(str::to_string),
            reserved: document.is_some(),
        }
    }
}

/// Proof of admission. Releases its slot on drop.
pub struct AdmissionPermit {
    state: Arc<Mutex<TrackerState>>,
    request_id: String,
    document: Option<String>,
    reserved: bool,
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("request_id", &self.request_id)
            .field("document", &self.document)
            .finish()
    }
}

impl AdmissionPermit {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Count this execution against its document. Call once the request is
    /// about to reach a server; cached answers are never counted.
    pub fn commit_session(&mut self) {
        if !self.reserved {
            return;
        }
        self.reserved = false;
        let Some(document) = &self.document else {
            return;
        };
        let mut state = self.state.lock();
        release_reservation(&mut state, document);
        let session = state
            .sessions
            .entry(document.clone())
            .or_insert_with(|| DocumentSessionState {
                document_path: document.clone(),
                total_session_count: 0,
                last_accessed: Utc::now(),
            });
        session.total_session_count += 1;
        session.last_accessed = Utc::now();
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.active.remove(&self.request_id);
        state.total_executed += 1;
        if self.reserved {
            if let Some(document) = &self.document {
                release_reservation(&mut state, document);
            }
        }
    }
}

fn release_reservation(state: &mut TrackerState, document: &str) {
    if let Some(count) = state.reserved.get_mut(document) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            state.reserved.remove(document);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granted(admission: Admission) -> AdmissionPermit {
        match admission {
            Admission::Granted(permit) => permit,
            other => panic!("expected a permit, got {other:?}"),
        }
    }

    #[test]
    fn concurrency_ceiling() {
        let tracker = ExecutionAdmissionTracker::new(2, 10);
        let a = granted(tracker.try_admit("a", None).unwrap());
        let _b = granted(tracker.try_admit("b", None).unwrap());
        assert!(!tracker.can_execute(None));
        let err = tracker.try_admit("c", None).unwrap_err();
        assert_eq!(err, ExecutionError::ConcurrencyLimit { active: 2, limit: 2 });
        assert!(err.is_retryable());

        drop(a);
        assert!(tracker.can_execute(None));
        assert_eq!(tracker.active_executions(), vec!["b".to_string()]);
        assert_eq!(tracker.total_executed(), 1);
        assert_eq!(tracker.peak_active(), 2);
    }

    #[test]
    fn stop_switch_comes_first() {
        let tracker = ExecutionAdmissionTracker::new(1, 1);
        tracker.stop();
        assert_eq!(
            tracker.try_admit("a", Some("doc.md")).unwrap_err(),
            ExecutionError::Stopped
        );
        tracker.resume();
        assert!(tracker.can_execute(Some("doc.md")));
    }

    #[test]
    fn session_count_only_on_commit() {
        let tracker = ExecutionAdmissionTracker::new(4, 2);
        let mut a = granted(tracker.try_admit("a", Some("doc.md")).unwrap());
        a.commit_session();
        drop(a);
        // Dropped without commit, e.g. a cached answer.
        drop(granted(tracker.try_admit("b", Some("doc.md")).unwrap()));
        assert_eq!(tracker.total_session_count("doc.md"), 1);

        let mut c = granted(tracker.try_admit("c", Some("doc.md")).unwrap());
        c.commit_session();
        drop(c);
        assert_eq!(tracker.total_session_count("doc.md"), 2);
        assert!(!tracker.can_execute(Some("doc.md")));
        assert!(tracker.can_execute(Some("other.md")));

        match tracker.try_admit("d", Some("doc.md")).unwrap() {
            Admission::SessionLimitReached { limit, current, .. } => {
                assert_eq!((limit, current), (2, 2));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(tracker.active_count(), 0);

        let mut d = tracker.admit_over_limit("d", "doc.md").unwrap();
        d.commit_session();
        drop(d);
        assert_eq!(tracker.total_session_count("doc.md"), 3);

        tracker.reset_session("doc.md");
        assert!(tracker.session_state("doc.md").is_none());
        assert!(tracker.can_execute(Some("doc.md")));
    }

    #[test]
    fn request_ids_are_unique_while_in_flight() {
        let tracker = ExecutionAdmissionTracker::new(4, 10);
        let first = granted(tracker.try_admit("dup", None).unwrap());
        assert_eq!(
            tracker.try_admit("dup", None).unwrap_err(),
            ExecutionError::DuplicateRequest("dup".into())
        );
        assert_eq!(
            tracker.admit_over_limit("dup", "doc.md").unwrap_err(),
            ExecutionError::DuplicateRequest("dup".into())
        );
        assert_eq!(tracker.active_count(), 1);

        drop(first);
        assert_eq!(tracker.active_count(), 0);
        drop(granted(tracker.try_admit("dup", None).unwrap()));
    }

    #[test]
    fn in_flight_reservations_count_toward_limit() {
        let tracker = ExecutionAdmissionTracker::new(4, 1);
        let _a = granted(tracker.try_admit("a", Some("doc.md")).unwrap());
        assert!(matches!(
            tracker.try_admit("b", Some("doc.md")).unwrap(),
            Admission::SessionLimitReached { current: 1, .. }
        ));
    }
}
