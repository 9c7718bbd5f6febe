//! Top-level orchestrator: polls the backlog and drives sessions through
//! their state machine.
//!
//! A single control loop owns all decisions that touch shared counters;
//! each session then progresses on its own spawned driver task. Suspension
//! points (slot waits, agent invocations, test runs, review waits) are all
//! cancellable, so an operator abort takes effect at the next natural
//! checkpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backlog::{BacklogStore, Task, TaskStatus};
use crate::config::Config;
use crate::engine::{CodeGenAgent, ExecutionEngine, ExecutionResult, TestRunner};
use crate::fetcher::TaskFetcher;
use crate::review::{ResultProcessor, ReviewWait};
use crate::router::{HandlerKind, TaskRouter};
use crate::safety::SafetyMonitor;
use crate::session::{
    Session, SessionId, SessionOutcome, SessionState, SessionView, SharedSession,
};
use crate::sync_gate::SyncGate;
use crate::util::retry_with_backoff;
use crate::vcs::VcsHost;
use crate::workspace::{AllocationError, TaskReservation, WorkspaceAllocator};

const IO_RETRIES: u32 = 3;
const IO_BACKOFF: Duration = Duration::from_millis(500);

struct SessionEntry {
    record: SharedSession,
    cancel: CancellationToken,
}

/// How a session ended, before the cleanup epilogue runs.
struct SessionFinish {
    outcome: SessionOutcome,
    reason: String,
}

impl SessionFinish {
    fn new(outcome: SessionOutcome, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            reason: reason.into(),
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self::new(SessionOutcome::Failed, reason)
    }
}

struct Inner {
    poll_interval: Duration,
    max_attempts: u32,
    store: Arc<dyn BacklogStore>,
    fetcher: TaskFetcher,
    router: TaskRouter,
    allocator: WorkspaceAllocator,
    engine: ExecutionEngine,
    gate: SyncGate,
    processor: ResultProcessor,
    vcs: Arc<dyn VcsHost>,
    monitor: Arc<SafetyMonitor>,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// The orchestrator handle. Cheap to clone; all state lives behind `Arc`.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        store: Arc<dyn BacklogStore>,
        agent: Arc<dyn CodeGenAgent>,
        tests: Arc<dyn TestRunner>,
        vcs: Arc<dyn VcsHost>,
        monitor: Arc<SafetyMonitor>,
    ) -> Self {
        let fetcher = TaskFetcher::new(Arc::clone(&store));
        let router = TaskRouter::new(config.escalation_label.clone());
        let allocator = WorkspaceAllocator::new(
            config.workspace_root.clone(),
            Arc::clone(&vcs),
            Arc::clone(&monitor),
        );
        let engine = ExecutionEngine::new(
            agent,
            tests,
            Arc::clone(&monitor),
            config.max_attempts_per_session,
            config.agent_timeout,
        );
        let gate = SyncGate::new(config.docs_root.clone());
        let processor = ResultProcessor::new(
            Arc::clone(&vcs),
            config.review_poll_interval,
            config.review_timeout,
        );

        Self {
            inner: Arc::new(Inner {
                poll_interval: config.poll_interval,
                max_attempts: config.max_attempts_per_session,
                store,
                fetcher,
                router,
                allocator,
                engine,
                gate,
                processor,
                vcs,
                monitor,
                sessions: RwLock::new(HashMap::new()),
                handles: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Run the control loop until shutdown, then drain in-flight sessions.
    pub async fn run(&self) {
        info!("orchestrator started");
        let mut ticker = tokio::time::interval(self.inner.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.poll_cycle().await;
        }

        info!("orchestrator stopping; waiting for in-flight sessions");
        self.drain().await;
        info!("orchestrator stopped");
    }

    /// One polling cycle: fetch eligible tasks and start sessions while
    /// slots are free.
    ///
    /// Eligibility ordering is re-evaluated here every cycle; a task left
    /// behind for lack of a slot is simply picked up later, never by
    /// pre-empting an in-flight session.
    pub async fn poll_cycle(&self) {
        let inner = &self.inner;

        if inner.shutdown.is_cancelled() {
            return;
        }
        if inner.monitor.circuit_broken() {
            warn!("circuit breaker open; not starting new sessions");
            return;
        }

        let eligible = match inner.fetcher.fetch_eligible().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "failed to fetch eligible tasks");
                return;
            }
        };

        for task in eligible {
            if inner.shutdown.is_cancelled() || inner.monitor.circuit_broken() {
                break;
            }

            match inner.router.route(&task) {
                HandlerKind::HumanEscalation => {
                    self.escalate(&task).await;
                    continue;
                }
                HandlerKind::Autonomous => {}
            }

            // A session only leaves Idle when a slot is free; tasks beyond
            // the ceiling stay queued in the backlog for the next cycle.
            let slot = match inner.monitor.try_acquire_slot() {
                Some(slot) => slot,
                None => {
                    debug!("no free session slots; deferring remaining eligible tasks");
                    break;
                }
            };

            let reservation = match inner.allocator.reserve_with_slot(&task.id, slot) {
                Ok(reservation) => reservation,
                Err(AllocationError::TaskInFlight(_)) => continue,
                Err(e) => {
                    warn!(task = %task.id, error = %e, "could not reserve task");
                    continue;
                }
            };

            // The backlog is eventually consistent; re-validate right before
            // committing a session to the task.
            match inner.fetcher.revalidate(&task.id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(task = %task.id, "task no longer eligible; skipping");
                    continue;
                }
                Err(e) => {
                    warn!(task = %task.id, error = %e, "revalidation failed; skipping");
                    continue;
                }
            }

            self.spawn_session(task, reservation).await;
        }
    }

    /// Mark an escalated task for its human collaborator.
    async fn escalate(&self, task: &Task) {
        let inner = &self.inner;
        let note = format!(
            "requires human attention (label '{}')",
            inner.router.escalation_label()
        );
        let result = retry_with_backoff(IO_RETRIES, IO_BACKOFF, "escalate", || {
            inner.store.update_status(&task.id, TaskStatus::Blocked, &note)
        })
        .await;
        match result {
            Ok(()) => info!(task = %task.id, "task escalated to human"),
            Err(e) => error!(task = %task.id, error = %e, "failed to escalate task"),
        }
    }

    async fn spawn_session(&self, task: Task, reservation: TaskReservation) {
        let inner = Arc::clone(&self.inner);
        let session = Session::new(task.id.clone());
        let session_id = session.id;
        let record: SharedSession = Arc::new(RwLock::new(session));
        let cancel = inner.shutdown.child_token();

        inner.sessions.write().await.insert(
            session_id,
            SessionEntry {
                record: Arc::clone(&record),
                cancel: cancel.clone(),
            },
        );
        info!(session = %session_id, task = %task.id, "session created");

        let handle = tokio::spawn(async move {
            let finish = run_session(&inner, &task, &record, &reservation, &cancel).await;
            finish_session(&inner, &task, &record, finish).await;
            drop(reservation);
        });
        self.inner.handles.lock().await.push(handle);
    }

    /// Wait for every spawned session driver to finish.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.inner.handles.lock().await;
            guard.drain(..).collect()
        };
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "session driver panicked");
            }
        }
    }

    /// Abort one session. Takes effect at the session's next checkpoint.
    pub async fn abort_session(&self, id: SessionId) -> bool {
        let sessions = self.inner.sessions.read().await;
        match sessions.get(&id) {
            Some(entry) => {
                info!(session = %id, "operator abort requested");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop fetching new tasks and abort in-flight sessions at their next
    /// checkpoint.
    pub fn shutdown(&self) {
        info!("orchestrator shutdown requested");
        self.inner.shutdown.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn monitor(&self) -> &Arc<SafetyMonitor> {
        &self.inner.monitor
    }

    /// Snapshots of every session this process has run, newest first.
    pub async fn session_views(&self) -> Vec<SessionView> {
        let sessions = self.inner.sessions.read().await;
        let mut views = Vec::with_capacity(sessions.len());
        for entry in sessions.values() {
            views.push(entry.record.read().await.view());
        }
        views.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        views
    }
}

async fn transition(
    shared: &SharedSession,
    to: SessionState,
) -> Result<(), SessionFinish> {
    shared
        .write()
        .await
        .transition_to(to)
        .map_err(|e| SessionFinish::failed(format!("internal error: {}", e)))
}

/// Drive one session from `Idle` to its terminal finish.
async fn run_session(
    inner: &Arc<Inner>,
    task: &Task,
    shared: &SharedSession,
    reservation: &TaskReservation,
    cancel: &CancellationToken,
) -> SessionFinish {
    match run_session_inner(inner, task, shared, reservation, cancel).await {
        Ok(finish) | Err(finish) => finish,
    }
}

async fn run_session_inner(
    inner: &Arc<Inner>,
    task: &Task,
    shared: &SharedSession,
    reservation: &TaskReservation,
    cancel: &CancellationToken,
) -> Result<SessionFinish, SessionFinish> {
    let session_id = shared.read().await.id;

    transition(shared, SessionState::Ready).await?;
    transition(shared, SessionState::Allocating).await?;

    let workspace = tokio::select! {
        _ = cancel.cancelled() => {
            return Ok(SessionFinish::new(SessionOutcome::Aborted, "aborted during allocation"));
        }
        result = retry_with_backoff(IO_RETRIES, IO_BACKOFF, "provision_workspace", || {
            inner.allocator.provision(session_id, task, reservation)
        }) => result.map_err(|e| SessionFinish::failed(format!("workspace allocation failed: {}", e)))?,
    };
    shared.write().await.workspace = Some(workspace.clone());

    let start_note = format!("session {} started", session_id);
    retry_with_backoff(IO_RETRIES, IO_BACKOFF, "mark_in_progress", || {
        inner
            .store
            .update_status(&task.id, TaskStatus::InProgress, &start_note)
    })
    .await
    .map_err(|e| SessionFinish::failed(format!("backlog update failed: {}", e)))?;

    transition(shared, SessionState::Processing).await?;

    let mut gate_feedback: Option<String> = None;
    loop {
        let result = inner
            .engine
            .run(shared, &workspace, task, gate_feedback.take(), cancel)
            .await
            .map_err(|e| SessionFinish::failed(format!("internal error: {}", e)))?;

        match result {
            ExecutionResult::Success => {}
            ExecutionResult::Aborted => {
                return Ok(SessionFinish::new(SessionOutcome::Aborted, "aborted by operator"));
            }
            ExecutionResult::Denied { reason } => {
                return Ok(SessionFinish::failed(format!("budget denied: {}", reason)));
            }
            ExecutionResult::Failure {
                reason,
                last_test_output,
            } => {
                let detail = match last_test_output {
                    Some(output) => format!("{}; last failure: {}", reason, output),
                    None => reason,
                };
                return Ok(SessionFinish::failed(detail));
            }
        }

        transition(shared, SessionState::SyncCheck).await?;

        let changes = retry_with_backoff(IO_RETRIES, IO_BACKOFF, "changed_paths", || {
            inner.vcs.changed_paths(&workspace.branch)
        })
        .await
        .map_err(|e| SessionFinish::failed(format!("could not read changeset: {}", e)))?;

        let report = inner.gate.evaluate(&changes);
        if report.is_satisfied() {
            transition(shared, SessionState::ReviewPending).await?;

            let snapshot = shared.read().await.clone();
            let handle = retry_with_backoff(IO_RETRIES, IO_BACKOFF, "create_review", || {
                inner.processor.create_review_request(&snapshot, task, &report)
            })
            .await
            .map_err(|e| SessionFinish::failed(format!("could not open review request: {}", e)))?;

            let wait = inner
                .processor
                .await_decision(&handle, cancel)
                .await
                .map_err(|e| SessionFinish::failed(format!("review polling failed: {}", e)))?;
            inner.processor.finalize(&mut *shared.write().await, &wait);

            return match wait {
                ReviewWait::Approved => {
                    transition(shared, SessionState::Merging).await?;
                    retry_with_backoff(IO_RETRIES, IO_BACKOFF, "merge", || {
                        inner.processor.merge(&handle)
                    })
                    .await
                    .map_err(|e| SessionFinish::failed(format!("merge failed: {}", e)))?;
                    Ok(SessionFinish::new(
                        SessionOutcome::Merged,
                        "changes merged",
                    ))
                }
                ReviewWait::Rejected { reason } => Ok(SessionFinish::new(
                    SessionOutcome::Abandoned,
                    format!("review rejected: {}", reason),
                )),
                ReviewWait::TimedOut => Ok(SessionFinish::new(
                    SessionOutcome::Abandoned,
                    "review timed out without a decision",
                )),
                ReviewWait::Aborted => Ok(SessionFinish::new(
                    SessionOutcome::Aborted,
                    "aborted while awaiting review",
                )),
            };
        }

        // Gate unsatisfied: block, and feed the missing-docs list back into
        // the retry loop if the attempt budget still has room.
        transition(shared, SessionState::Blocked).await?;
        let summary = report.missing_summary(inner.gate.docs_root());
        warn!(session = %session_id, "{}", summary);
        shared.write().await.add_note(summary.clone());

        let attempts_used = shared.read().await.attempt;
        if attempts_used >= inner.max_attempts {
            return Ok(SessionFinish::new(SessionOutcome::Blocked, summary));
        }

        transition(shared, SessionState::Processing).await?;
        gate_feedback = Some(format!(
            "The previous changeset was blocked by the documentation gate. {}",
            summary
        ));
    }
}

/// Cleanup epilogue, run exactly once per session: release the workspace,
/// write the outcome back to the backlog, and record it with the safety
/// monitor.
async fn finish_session(
    inner: &Arc<Inner>,
    task: &Task,
    shared: &SharedSession,
    finish: SessionFinish,
) {
    let SessionFinish { outcome, reason } = finish;
    let session_id = shared.read().await.id;

    if outcome == SessionOutcome::Merged {
        if let Err(e) = shared.write().await.transition_to(SessionState::Cleanup) {
            error!(session = %session_id, error = %e, "cleanup transition failed");
        }
    }

    let workspace = shared.read().await.workspace.clone();
    if let Some(mut ws) = workspace {
        let mut released = false;
        for attempt in 1..=IO_RETRIES {
            match inner.allocator.release(&mut ws, outcome).await {
                Ok(()) => {
                    released = true;
                    break;
                }
                Err(e) if attempt < IO_RETRIES => {
                    warn!(session = %session_id, attempt, error = %e, "workspace release failed; retrying");
                    tokio::time::sleep(IO_BACKOFF).await;
                }
                Err(e) => {
                    error!(session = %session_id, error = %e, "workspace release failed; operator attention needed");
                }
            }
        }
        if released {
            shared.write().await.workspace = Some(ws);
        }
    }

    let (status, note) = match outcome {
        SessionOutcome::Merged => (
            TaskStatus::Done,
            format!("session {}: {}", session_id, reason),
        ),
        SessionOutcome::Failed
        | SessionOutcome::Blocked
        | SessionOutcome::Abandoned
        | SessionOutcome::Aborted => (
            TaskStatus::Blocked,
            format!("session {} {}: {}", session_id, outcome.as_str(), reason),
        ),
    };
    let update = retry_with_backoff(IO_RETRIES, IO_BACKOFF, "write_outcome", || {
        inner.store.update_status(&task.id, status, &note)
    })
    .await;
    if let Err(e) = update {
        error!(session = %session_id, error = %e, "failed to write outcome to backlog");
    }

    inner.monitor.record_outcome(outcome.is_success());

    {
        let mut s = shared.write().await;
        s.add_note(reason);
        s.finish(outcome);
        if let Err(e) = s.transition_to(SessionState::Idle) {
            error!(session = %session_id, error = %e, "idle transition failed");
        }
    }
    info!(session = %session_id, task = %task.id, outcome = outcome.as_str(), "session finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::{InMemoryBacklog, TaskId};
    use crate::engine::stubs::{ScriptedAgent, ScriptedTestRunner};
    use crate::safety::SafetyLimits;
    use crate::vcs::stub::StubVcsHost;
    use crate::vcs::{ChangeKind, ChangedPath, ReviewDecision};
    use chrono::Utc;

    struct Harness {
        store: Arc<InMemoryBacklog>,
        vcs: Arc<StubVcsHost>,
        monitor: Arc<SafetyMonitor>,
        orchestrator: Orchestrator,
        _tmp: tempfile::TempDir,
    }

    fn harness(
        agent: Arc<dyn CodeGenAgent>,
        tests: Arc<dyn TestRunner>,
        mutate: impl FnOnce(&mut Config),
    ) -> Harness {
        harness_with(agent, tests, Arc::new(StubVcsHost::new()), mutate)
    }

    fn harness_with(
        agent: Arc<dyn CodeGenAgent>,
        tests: Arc<dyn TestRunner>,
        vcs: Arc<StubVcsHost>,
        mutate: impl FnOnce(&mut Config),
    ) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::new(tmp.path().to_path_buf());
        mutate(&mut config);

        let store = Arc::new(InMemoryBacklog::new());
        let monitor = Arc::new(SafetyMonitor::new(SafetyLimits::from(&config)));
        let orchestrator = Orchestrator::new(
            &config,
            Arc::clone(&store) as _,
            agent,
            tests,
            Arc::clone(&vcs) as _,
            Arc::clone(&monitor),
        );

        Harness {
            store,
            vcs,
            monitor,
            orchestrator,
            _tmp: tmp,
        }
    }

    fn task(id: &str, priority: i64) -> Task {
        Task {
            id: TaskId::from(id),
            title: format!("task {}", id),
            description: "implement it".to_string(),
            status: TaskStatus::Pending,
            priority,
            depends_on: vec![],
            labels: vec![],
            acceptance_criteria: vec!["works".to_string()],
            created_at: Utc::now(),
        }
    }

    fn synced_changes() -> Vec<ChangedPath> {
        vec![
            ChangedPath::new("src/widget.rs", ChangeKind::Added),
            ChangedPath::new("docs/widget.md", ChangeKind::Added),
        ]
    }

    #[tokio::test]
    async fn happy_path_merges_and_completes_the_task() {
        let h = harness(
            Arc::new(ScriptedAgent::succeeding(10)),
            Arc::new(ScriptedTestRunner::passing()),
            |_| {},
        );
        *h.vcs.changes.lock().unwrap() = synced_changes();
        h.vcs.set_decision(ReviewDecision::Approved);
        h.store.insert(task("t-1", 1)).await;

        h.orchestrator.poll_cycle().await;
        h.orchestrator.drain().await;

        let done = h
            .store
            .get_task(&TaskId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(h.vcs.merges.load(std::sync::atomic::Ordering::SeqCst), 1);

        let views = h.orchestrator.session_views().await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].outcome, Some(SessionOutcome::Merged));
        assert_eq!(views[0].state, SessionState::Idle);

        // Merged workspaces are fully cleaned up.
        assert!(h
            .vcs
            .deleted_branches
            .lock()
            .unwrap()
            .contains(&"auto/t-1".to_string()));
        assert_eq!(h.monitor.counters().consecutive_failures, 0);
        assert_eq!(h.monitor.active_sessions(), 0);
    }

    #[tokio::test]
    async fn always_failing_agent_fails_the_session() {
        // Scenario: the agent never produces passing tests; after the
        // attempt cap the session fails and the failure streak grows by one.
        let h = harness(
            Arc::new(ScriptedAgent::succeeding(1)),
            Arc::new(ScriptedTestRunner::always_failing()),
            |_| {},
        );
        *h.vcs.changes.lock().unwrap() = synced_changes();
        h.store.insert(task("t-1", 1)).await;

        h.orchestrator.poll_cycle().await;
        h.orchestrator.drain().await;

        let views = h.orchestrator.session_views().await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].outcome, Some(SessionOutcome::Failed));
        assert_eq!(views[0].attempt, 3);

        let blocked = h
            .store
            .get_task(&TaskId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(blocked.status, TaskStatus::Blocked);
        let notes = h.store.notes(&TaskId::from("t-1")).await;
        assert!(notes.iter().any(|n| n.contains("attempt budget")));

        assert_eq!(h.monitor.counters().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn missing_docs_block_the_session() {
        // Changeset adds a module but no documentation; with a single
        // attempt the session ends blocked and the workspace is preserved.
        let h = harness(
            Arc::new(ScriptedAgent::succeeding(1)),
            Arc::new(ScriptedTestRunner::passing()),
            |c| c.max_attempts_per_session = 1,
        );
        *h.vcs.changes.lock().unwrap() =
            vec![ChangedPath::new("src/widget.rs", ChangeKind::Added)];
        h.store.insert(task("t-1", 1)).await;

        h.orchestrator.poll_cycle().await;
        h.orchestrator.drain().await;

        let views = h.orchestrator.session_views().await;
        assert_eq!(views[0].outcome, Some(SessionOutcome::Blocked));
        assert!(views[0]
            .notes
            .iter()
            .any(|n| n.contains("new top-level module")));

        let blocked = h
            .store
            .get_task(&TaskId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(blocked.status, TaskStatus::Blocked);

        // Workspace preserved for inspection.
        let ws_path = h._tmp.path().join("auto-t-1");
        assert!(ws_path.exists());
    }

    /// Agent that omits documentation on its first pass and, once told about
    /// the gate failure, adds it on the second.
    struct DocsFixingAgent {
        vcs: Arc<StubVcsHost>,
        calls: std::sync::atomic::AtomicU32,
        saw_gate_feedback: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl CodeGenAgent for DocsFixingAgent {
        async fn execute(
            &self,
            request: crate::engine::AgentRequest,
        ) -> Result<crate::engine::ChangesetApplied, crate::engine::AgentError> {
            use std::sync::atomic::Ordering;
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= 2 {
                let feedback = request.prior_failure_context.unwrap_or_default();
                if feedback.contains("documentation") {
                    self.saw_gate_feedback.store(true, Ordering::SeqCst);
                }
                *self.vcs.changes.lock().unwrap() = synced_changes();
            }
            Ok(crate::engine::ChangesetApplied {
                summary: format!("changeset {}", call),
                cost_cents: 1,
            })
        }
    }

    #[tokio::test]
    async fn gate_feedback_consumes_one_more_attempt() {
        // First pass produces no docs; the blocked feedback loops back into
        // the engine, and the second attempt (with docs now in the
        // changeset) goes through.
        let vcs = Arc::new(StubVcsHost::new());
        *vcs.changes.lock().unwrap() =
            vec![ChangedPath::new("src/widget.rs", ChangeKind::Added)];
        vcs.set_decision(ReviewDecision::Approved);

        let agent = Arc::new(DocsFixingAgent {
            vcs: Arc::clone(&vcs),
            calls: std::sync::atomic::AtomicU32::new(0),
            saw_gate_feedback: std::sync::atomic::AtomicBool::new(false),
        });
        let h = harness_with(
            agent.clone(),
            Arc::new(ScriptedTestRunner::passing()),
            vcs,
            |_| {},
        );
        h.store.insert(task("t-1", 1)).await;

        h.orchestrator.poll_cycle().await;
        h.orchestrator.drain().await;

        let views = h.orchestrator.session_views().await;
        assert_eq!(views[0].outcome, Some(SessionOutcome::Merged));
        assert_eq!(views[0].attempt, 2);
        assert!(agent
            .saw_gate_feedback
            .load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn concurrency_ceiling_defers_the_fourth_task() {
        // Four eligible tasks, ceiling of three: exactly three sessions
        // start; the fourth stays queued until a slot frees up.
        let hold = CancellationToken::new();
        let agent = Arc::new(ScriptedAgent::held(hold.clone(), 1));
        let h = harness(agent, Arc::new(ScriptedTestRunner::passing()), |_| {});
        *h.vcs.changes.lock().unwrap() = synced_changes();
        h.vcs.set_decision(ReviewDecision::Approved);

        for i in 1..=4 {
            h.store.insert(task(&format!("t-{}", i), 10 - i as i64)).await;
        }

        h.orchestrator.poll_cycle().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(h.monitor.active_sessions(), 3);
        let views = h.orchestrator.session_views().await;
        assert_eq!(views.len(), 3);
        assert!(views.iter().all(|v| v.state.in_active_span()));

        // Re-polling while saturated must not start a fourth session.
        h.orchestrator.poll_cycle().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.orchestrator.session_views().await.len(), 3);

        // Let the first wave finish; the fourth task now gets its session.
        hold.cancel();
        h.orchestrator.drain().await;
        assert_eq!(h.monitor.active_sessions(), 0);

        h.orchestrator.poll_cycle().await;
        h.orchestrator.drain().await;
        let views = h.orchestrator.session_views().await;
        assert_eq!(views.len(), 4);
        for i in 1..=4 {
            let t = h
                .store
                .get_task(&TaskId::from(format!("t-{}", i).as_str()))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(t.status, TaskStatus::Done, "task t-{}", i);
        }
    }

    #[tokio::test]
    async fn circuit_breaker_stops_new_sessions_until_reset() {
        let h = harness(
            Arc::new(ScriptedAgent::always_failing()),
            Arc::new(ScriptedTestRunner::passing()),
            |c| c.consecutive_failure_circuit_break = 2,
        );
        h.store.insert(task("t-1", 2)).await;
        h.store.insert(task("t-2", 1)).await;

        h.orchestrator.poll_cycle().await;
        h.orchestrator.drain().await;
        assert!(h.monitor.circuit_broken());

        // A new eligible task must not start while the breaker is open.
        h.store.insert(task("t-3", 1)).await;
        h.orchestrator.poll_cycle().await;
        h.orchestrator.drain().await;
        assert_eq!(h.orchestrator.session_views().await.len(), 2);

        // Operator reset re-opens the pipeline.
        h.monitor.clear_circuit_break();
        h.orchestrator.poll_cycle().await;
        h.orchestrator.drain().await;
        assert_eq!(h.orchestrator.session_views().await.len(), 3);
    }

    #[tokio::test]
    async fn escalation_label_bypasses_the_engine() {
        let h = harness(
            Arc::new(ScriptedAgent::succeeding(1)),
            Arc::new(ScriptedTestRunner::passing()),
            |_| {},
        );
        let mut escalated = task("t-1", 1);
        escalated.labels.push("needs-human".to_string());
        h.store.insert(escalated).await;

        h.orchestrator.poll_cycle().await;
        h.orchestrator.drain().await;

        assert!(h.orchestrator.session_views().await.is_empty());
        let t = h
            .store
            .get_task(&TaskId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.status, TaskStatus::Blocked);
        let notes = h.store.notes(&TaskId::from("t-1")).await;
        assert!(notes.iter().any(|n| n.contains("needs-human")));
    }

    #[tokio::test]
    async fn operator_abort_preserves_the_workspace() {
        let hold = CancellationToken::new();
        let agent = Arc::new(ScriptedAgent::held(hold.clone(), 1));
        let h = harness(agent, Arc::new(ScriptedTestRunner::passing()), |_| {});
        h.store.insert(task("t-1", 1)).await;

        h.orchestrator.poll_cycle().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let views = h.orchestrator.session_views().await;
        assert_eq!(views.len(), 1);
        assert!(h.orchestrator.abort_session(views[0].id).await);

        h.orchestrator.drain().await;
        let views = h.orchestrator.session_views().await;
        assert_eq!(views[0].outcome, Some(SessionOutcome::Aborted));

        // Workspace kept for forensics.
        assert!(h._tmp.path().join("auto-t-1").exists());
        drop(hold);
    }

    #[tokio::test]
    async fn rejection_abandons_the_session() {
        let h = harness(
            Arc::new(ScriptedAgent::succeeding(1)),
            Arc::new(ScriptedTestRunner::passing()),
            |_| {},
        );
        *h.vcs.changes.lock().unwrap() = synced_changes();
        h.vcs.set_decision(ReviewDecision::Rejected {
            reason: "not convinced".to_string(),
        });
        h.store.insert(task("t-1", 1)).await;

        h.orchestrator.poll_cycle().await;
        h.orchestrator.drain().await;

        let views = h.orchestrator.session_views().await;
        assert_eq!(views[0].outcome, Some(SessionOutcome::Abandoned));
        assert!(views[0].notes.iter().any(|n| n.contains("not convinced")));
        assert_eq!(h.vcs.merges.load(std::sync::atomic::Ordering::SeqCst), 0);

        let t = h
            .store
            .get_task(&TaskId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.status, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn shutdown_aborts_in_flight_sessions_at_a_checkpoint() {
        let hold = CancellationToken::new();
        let agent = Arc::new(ScriptedAgent::held(hold.clone(), 1));
        let h = harness(agent, Arc::new(ScriptedTestRunner::passing()), |_| {});
        h.store.insert(task("t-1", 1)).await;

        h.orchestrator.poll_cycle().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.orchestrator.shutdown();
        h.orchestrator.drain().await;

        let views = h.orchestrator.session_views().await;
        assert_eq!(views[0].outcome, Some(SessionOutcome::Aborted));

        // No new work is picked up after shutdown.
        h.store.insert(task("t-2", 1)).await;
        h.orchestrator.poll_cycle().await;
        assert_eq!(h.orchestrator.session_views().await.len(), 1);
        drop(hold);
    }
}
