//! Result processing: review requests and decision handling.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backlog::Task;
use crate::session::Session;
use crate::sync_gate::SyncReport;
use crate::vcs::{ReviewDecision, ReviewRequestHandle, VcsError, VcsHost};

/// How a review wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewWait {
    Approved,
    Rejected { reason: String },
    /// Operator abort or orchestrator shutdown.
    Aborted,
    /// Configured review timeout elapsed with no decision.
    TimedOut,
}

/// Packages changesets into review artifacts and reacts to decisions.
pub struct ResultProcessor {
    vcs: Arc<dyn VcsHost>,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl ResultProcessor {
    pub fn new(vcs: Arc<dyn VcsHost>, poll_interval: Duration, timeout: Option<Duration>) -> Self {
        Self {
            vcs,
            poll_interval,
            timeout,
        }
    }

    /// Open a review request carrying the changeset description and the
    /// satisfied synchronization checklist.
    pub async fn create_review_request(
        &self,
        session: &Session,
        task: &Task,
        report: &SyncReport,
    ) -> Result<ReviewRequestHandle, VcsError> {
        let workspace = session
            .workspace
            .as_ref()
            .ok_or_else(|| VcsError::Protocol("session has no workspace".to_string()))?;

        let criteria = if task.acceptance_criteria.is_empty() {
            "- none given".to_string()
        } else {
            task.acceptance_criteria
                .iter()
                .map(|c| format!("- {}", c))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let description = format!(
            "{}\n\n## Acceptance criteria\n{}\n\n## Documentation sync checklist\n{}\n\n\
             Automated session `{}`, {} attempt(s), {} cents spent.",
            task.description,
            criteria,
            report.checklist(),
            session.id,
            session.attempt,
            session.cost_cents,
        );

        let handle = self
            .vcs
            .create_review_request(&workspace.branch, &task.title, &description)
            .await?;
        info!(session = %session.id, review = %handle.id, "review request opened");
        Ok(handle)
    }

    /// Poll until the review is decided, the wait is cancelled, or the
    /// configured timeout elapses. The wait is unbounded by default.
    pub async fn await_decision(
        &self,
        handle: &ReviewRequestHandle,
        cancel: &CancellationToken,
    ) -> Result<ReviewWait, VcsError> {
        let deadline = self.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut consecutive_errors = 0u32;

        loop {
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return Ok(ReviewWait::TimedOut);
                }
            }

            let decision = tokio::select! {
                _ = cancel.cancelled() => return Ok(ReviewWait::Aborted),
                result = self.vcs.get_review_decision(handle) => result,
            };

            match decision {
                Ok(ReviewDecision::Approved) => return Ok(ReviewWait::Approved),
                Ok(ReviewDecision::Rejected { reason }) => {
                    return Ok(ReviewWait::Rejected { reason })
                }
                Ok(ReviewDecision::Pending) => {
                    consecutive_errors = 0;
                }
                Err(e) => {
                    // Transient host errors shouldn't kill a wait that may
                    // span hours; give up only after a sustained outage.
                    consecutive_errors += 1;
                    warn!(review = %handle.id, error = %e, consecutive_errors, "review poll failed");
                    if consecutive_errors >= 10 {
                        return Err(e);
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(ReviewWait::Aborted),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Merge the approved review request.
    pub async fn merge(&self, handle: &ReviewRequestHandle) -> Result<(), VcsError> {
        self.vcs.merge(handle).await
    }

    /// Fold the decision into the session's outcome notes.
    pub fn finalize(&self, session: &mut Session, wait: &ReviewWait) {
        match wait {
            ReviewWait::Approved => session.add_note("review approved".to_string()),
            ReviewWait::Rejected { reason } => {
                session.add_note(format!("review rejected: {}", reason))
            }
            ReviewWait::Aborted => session.add_note("review wait aborted".to_string()),
            ReviewWait::TimedOut => {
                session.add_note("review timed out without a decision".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::{TaskId, TaskStatus};
    use crate::session::SessionState;
    use crate::sync_gate::SyncGate;
    use crate::vcs::stub::StubVcsHost;
    use crate::vcs::{ChangeKind, ChangedPath};
    use crate::workspace::{Workspace, WorkspaceStatus};
    use chrono::Utc;

    fn fixture() -> (Session, Task) {
        let task = Task {
            id: TaskId::from("t-1"),
            title: "Add widget".to_string(),
            description: "Implement the widget".to_string(),
            status: TaskStatus::InProgress,
            priority: 0,
            depends_on: vec![],
            labels: vec![],
            acceptance_criteria: vec!["widget renders".to_string()],
            created_at: Utc::now(),
        };
        let mut session = Session::new(task.id.clone());
        session.workspace = Some(Workspace {
            path: "/tmp/ws".into(),
            branch: "auto/t-1".to_string(),
            status: WorkspaceStatus::Active,
            session_id: session.id,
            task_id: task.id.clone(),
            created_at: Utc::now(),
        });
        (session, task)
    }

    #[tokio::test]
    async fn review_request_carries_the_checklist() {
        let (session, task) = fixture();
        let vcs = Arc::new(StubVcsHost::new());
        let processor =
            ResultProcessor::new(Arc::clone(&vcs) as _, Duration::from_millis(5), None);

        let gate = SyncGate::new("docs");
        let report = gate.evaluate(&[
            ChangedPath::new("src/widget.rs", ChangeKind::Added),
            ChangedPath::new("docs/widget.md", ChangeKind::Added),
        ]);
        assert!(report.is_satisfied());

        let handle = processor
            .create_review_request(&session, &task, &report)
            .await
            .unwrap();
        assert_eq!(handle.id, "review-auto/t-1");
    }

    #[tokio::test]
    async fn approval_ends_the_wait() {
        let vcs = Arc::new(StubVcsHost::new());
        vcs.set_decision(ReviewDecision::Approved);
        let processor =
            ResultProcessor::new(Arc::clone(&vcs) as _, Duration::from_millis(5), None);

        let handle = ReviewRequestHandle {
            id: "r-1".to_string(),
            url: None,
        };
        let wait = processor
            .await_decision(&handle, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(wait, ReviewWait::Approved);
    }

    #[tokio::test]
    async fn cancellation_is_observed_while_pending() {
        let vcs = Arc::new(StubVcsHost::new()); // stays Pending
        let processor =
            ResultProcessor::new(Arc::clone(&vcs) as _, Duration::from_secs(3600), None);

        let cancel = CancellationToken::new();
        let handle = ReviewRequestHandle {
            id: "r-1".to_string(),
            url: None,
        };

        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { processor.await_decision(&handle, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap().unwrap(), ReviewWait::Aborted);
    }

    #[tokio::test]
    async fn timeout_ends_an_undecided_wait() {
        let vcs = Arc::new(StubVcsHost::new());
        let processor = ResultProcessor::new(
            Arc::clone(&vcs) as _,
            Duration::from_millis(1),
            Some(Duration::from_millis(30)),
        );
        let handle = ReviewRequestHandle {
            id: "r-1".to_string(),
            url: None,
        };
        let wait = processor
            .await_decision(&handle, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(wait, ReviewWait::TimedOut);
    }

    #[test]
    fn finalize_records_the_reason() {
        let (mut session, _task) = fixture();
        session.transition_to(SessionState::Ready).unwrap();
        let vcs = Arc::new(StubVcsHost::new());
        let processor = ResultProcessor::new(vcs, Duration::from_millis(5), None);

        processor.finalize(
            &mut session,
            &ReviewWait::Rejected {
                reason: "needs tests".to_string(),
            },
        );
        assert!(session.notes.iter().any(|n| n.contains("needs tests")));
    }
}
