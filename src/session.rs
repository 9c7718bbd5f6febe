//! Sessions and their state machine.
//!
//! A session is one in-progress attempt to autonomously complete a single
//! backlog task. Its state transitions are the spine of the orchestrator:
//! every transition is validated against an explicit table so reachable and
//! unreachable transitions can be enumerated exhaustively.
//!
//! # State Machine
//! ```text
//! Idle -> Ready -> Allocating -> Processing <-> TestValidation -> SyncCheck
//!                                    ^                               |    \
//!                                    |                               v     v
//!                                 Blocked <------------------- ReviewPending -> Merging -> Cleanup
//!
//! Every state may fall back to Idle (abort, budget deny, exhausted retries).
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::backlog::TaskId;
use crate::workspace::Workspace;

/// A session shared between its driver and the operator surface.
pub type SharedSession = Arc<RwLock<Session>>;

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// States a session moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Not started, or finished (terminal)
    #[default]
    Idle,
    /// Selected and waiting for a concurrency slot
    Ready,
    /// Workspace being provisioned
    Allocating,
    /// Code-generation attempt in flight
    Processing,
    /// Test suite running against the attempt's changes
    TestValidation,
    /// Documentation-synchronization gate evaluating the changeset
    SyncCheck,
    /// Gate unsatisfied; actionable notes recorded
    Blocked,
    /// Awaiting an external review decision
    ReviewPending,
    /// Approved; merge in flight
    Merging,
    /// Releasing resources and writing back status
    Cleanup,
}

impl SessionState {
    /// The transition table. Every state can fall back to `Idle`.
    pub fn allowed_transitions(&self) -> &'static [SessionState] {
        use SessionState::*;
        match self {
            Idle => &[Ready],
            Ready => &[Allocating, Idle],
            Allocating => &[Processing, Idle],
            Processing => &[TestValidation, Idle],
            TestValidation => &[Processing, SyncCheck, Idle],
            SyncCheck => &[ReviewPending, Blocked, Idle],
            Blocked => &[Processing, Idle],
            ReviewPending => &[Merging, Idle],
            Merging => &[Cleanup, Idle],
            Cleanup => &[Idle],
        }
    }

    pub fn can_transition_to(&self, target: SessionState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// Whether the session occupies a concurrency slot in this state.
    ///
    /// The span `Allocating..Cleanup` is what the concurrency ceiling bounds.
    pub fn in_active_span(&self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Ready => "ready",
            Self::Allocating => "allocating",
            Self::Processing => "processing",
            Self::TestValidation => "test_validation",
            Self::SyncCheck => "sync_check",
            Self::Blocked => "blocked",
            Self::ReviewPending => "review_pending",
            Self::Merging => "merging",
            Self::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Changes merged, task done
    Merged,
    /// Retry/cost/time budget exhausted
    Failed,
    /// Review rejected
    Abandoned,
    /// Operator abort; workspace preserved for forensics
    Aborted,
    /// Sync gate unsatisfied, pending human review; workspace preserved
    Blocked,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merged => "merged",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
            Self::Aborted => "aborted",
            Self::Blocked => "blocked",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Merged)
    }
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}

/// One in-progress run of a backlog task.
///
/// # Invariants
/// - `state` only changes through [`transition_to`](Session::transition_to),
///   which validates against the transition table.
/// - `outcome` is set at most once, on the terminal transition.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub task_id: TaskId,
    state: SessionState,
    pub workspace: Option<Workspace>,
    pub attempt: u32,
    pub cost_cents: u64,
    pub started_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub outcome: Option<SessionOutcome>,
    pub notes: Vec<String>,
}

impl Session {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            id: SessionId::new(),
            task_id,
            state: SessionState::Idle,
            workspace: None,
            attempt: 0,
            cost_cents: 0,
            started_at: Utc::now(),
            consecutive_failures: 0,
            outcome: None,
            notes: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `target`, validating against the transition table.
    ///
    /// # Errors
    /// Returns `SessionError::InvalidTransition` for a move the table does
    /// not allow; such a call is a caller bug, not a runtime condition.
    pub fn transition_to(&mut self, target: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(target) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: target,
            });
        }
        info!(session = %self.id, task = %self.task_id, from = %self.state, to = %target, "session transition");
        self.state = target;
        Ok(())
    }

    /// Start one more code-generation attempt.
    pub fn begin_attempt(&mut self) {
        self.attempt += 1;
    }

    pub fn add_cost(&mut self, cents: u64) {
        self.cost_cents = self.cost_cents.saturating_add(cents);
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// Wall-clock time since the session started.
    pub fn elapsed(&self) -> std::time::Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }

    /// Record the terminal outcome. Later calls win only if none was set;
    /// the first outcome sticks.
    pub fn finish(&mut self, outcome: SessionOutcome) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }

    /// Snapshot for the operator surface.
    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id,
            task_id: self.task_id.clone(),
            state: self.state,
            branch: self.workspace.as_ref().map(|w| w.branch.clone()),
            attempt: self.attempt,
            cost_cents: self.cost_cents,
            started_at: self.started_at,
            outcome: self.outcome,
            notes: self.notes.clone(),
        }
    }
}

/// Serializable session snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: SessionId,
    pub task_id: TaskId,
    pub state: SessionState,
    pub branch: Option<String>,
    pub attempt: u32,
    pub cost_cents: u64,
    pub started_at: DateTime<Utc>,
    pub outcome: Option<SessionOutcome>,
    pub notes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [SessionState; 10] = [
        SessionState::Idle,
        SessionState::Ready,
        SessionState::Allocating,
        SessionState::Processing,
        SessionState::TestValidation,
        SessionState::SyncCheck,
        SessionState::Blocked,
        SessionState::ReviewPending,
        SessionState::Merging,
        SessionState::Cleanup,
    ];

    #[test]
    fn happy_path_transitions_are_allowed() {
        use SessionState::*;
        let path = [
            Ready,
            Allocating,
            Processing,
            TestValidation,
            SyncCheck,
            ReviewPending,
            Merging,
            Cleanup,
            Idle,
        ];
        let mut session = Session::new(TaskId::from("t"));
        for state in path {
            session.transition_to(state).unwrap();
        }
    }

    #[test]
    fn retry_loop_and_gate_feedback_are_allowed() {
        use SessionState::*;
        assert!(TestValidation.can_transition_to(Processing));
        assert!(SyncCheck.can_transition_to(Blocked));
        assert!(Blocked.can_transition_to(Processing));
    }

    #[test]
    fn every_state_can_fall_back_to_idle_except_idle() {
        for state in ALL_STATES {
            if state == SessionState::Idle {
                assert!(!state.can_transition_to(SessionState::Idle));
            } else {
                assert!(state.can_transition_to(SessionState::Idle), "{}", state);
            }
        }
    }

    #[test]
    fn unreachable_transitions_are_rejected() {
        use SessionState::*;
        // A gate failure can never jump straight to review.
        assert!(!Blocked.can_transition_to(ReviewPending));
        // Merging requires an approval, never a direct hop from tests.
        assert!(!TestValidation.can_transition_to(Merging));
        // Cleanup only ever returns to Idle.
        assert_eq!(Cleanup.allowed_transitions(), &[Idle]);

        let mut session = Session::new(TaskId::from("t"));
        let err = session.transition_to(Processing).unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition { .. }));
    }

    #[test]
    fn active_span_covers_allocating_through_cleanup() {
        use SessionState::*;
        assert!(!Idle.in_active_span());
        assert!(!Ready.in_active_span());
        for state in [
            Allocating,
            Processing,
            TestValidation,
            SyncCheck,
            Blocked,
            ReviewPending,
            Merging,
            Cleanup,
        ] {
            assert!(state.in_active_span(), "{}", state);
        }
    }

    #[test]
    fn first_outcome_sticks() {
        let mut session = Session::new(TaskId::from("t"));
        session.finish(SessionOutcome::Failed);
        session.finish(SessionOutcome::Merged);
        assert_eq!(session.outcome, Some(SessionOutcome::Failed));
    }
}
