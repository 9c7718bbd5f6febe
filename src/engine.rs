//! Execution engine: the bounded code-generation / test-validation loop.
//!
//! The external code-generation agent is a capability the engine depends on
//! but does not control. It is modeled as an injected trait so tests can
//! substitute a deterministic stub, and every invocation is wrapped in a
//! timeout. An error from the agent is a failed attempt, never a process
//! crash.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backlog::Task;
use crate::safety::{BudgetDecision, SafetyMonitor};
use crate::session::{SessionError, SessionState, SharedSession};
use crate::util::tail;
use crate::workspace::Workspace;

const OUTPUT_TAIL_BYTES: usize = 16 * 1024;

/// One invocation of the code-generation agent.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub task_description: String,
    pub acceptance_criteria: Vec<String>,
    pub workspace_path: PathBuf,
    pub branch: String,
    /// Test failure output (or gate feedback) from the previous attempt.
    pub prior_failure_context: Option<String>,
}

/// Signal that the agent applied a changeset to the workspace.
#[derive(Debug, Clone)]
pub struct ChangesetApplied {
    pub summary: String,
    pub cost_cents: u64,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent invocation failed: {0}")]
    Invocation(String),

    #[error("agent timed out after {0:?}")]
    Timeout(Duration),
}

/// External code-generation agent, treated as untrusted and unreliable.
#[async_trait]
pub trait CodeGenAgent: Send + Sync {
    async fn execute(&self, request: AgentRequest) -> Result<ChangesetApplied, AgentError>;
}

/// Result of one test-suite run inside a workspace.
#[derive(Debug, Clone)]
pub struct TestReport {
    pub passed: bool,
    pub output: String,
}

#[derive(Debug, Error)]
pub enum TestRunError {
    #[error("failed to spawn test command: {0}")]
    Spawn(String),
}

/// Runs the project's test suite inside a workspace.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, workspace: &Path) -> Result<TestReport, TestRunError>;
}

/// Test runner that shells out to a configured command.
pub struct ProcessTestRunner {
    command: String,
}

impl ProcessTestRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl TestRunner for ProcessTestRunner {
    async fn run(&self, workspace: &Path) -> Result<TestReport, TestRunError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TestRunError::Spawn(e.to_string()))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(TestReport {
            passed: output.status.success(),
            output: tail(&combined, OUTPUT_TAIL_BYTES),
        })
    }
}

/// Agent backed by an external CLI tool.
///
/// The command runs with the workspace as its working directory and receives
/// the task via environment variables (`OVERSEER_TASK_DESCRIPTION`,
/// `OVERSEER_ACCEPTANCE_CRITERIA`, `OVERSEER_PRIOR_FAILURE`,
/// `OVERSEER_BRANCH`). If the last line of stdout is a JSON object with
/// `summary` and `cost_cents`, it is used as the result; otherwise the whole
/// output tail is the summary and cost is unknown (zero).
pub struct ProcessCodeGenAgent {
    command: String,
}

impl ProcessCodeGenAgent {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[derive(Deserialize)]
struct AgentReport {
    summary: String,
    #[serde(default)]
    cost_cents: u64,
}

#[async_trait]
impl CodeGenAgent for ProcessCodeGenAgent {
    async fn execute(&self, request: AgentRequest) -> Result<ChangesetApplied, AgentError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&request.workspace_path)
            .env("OVERSEER_TASK_DESCRIPTION", &request.task_description)
            .env(
                "OVERSEER_ACCEPTANCE_CRITERIA",
                request.acceptance_criteria.join("\n"),
            )
            .env(
                "OVERSEER_PRIOR_FAILURE",
                request.prior_failure_context.as_deref().unwrap_or(""),
            )
            .env("OVERSEER_BRANCH", &request.branch)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| AgentError::Invocation(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::Invocation(tail(&stderr, OUTPUT_TAIL_BYTES)));
        }

        match stdout
            .lines()
            .last()
            .and_then(|line| serde_json::from_str::<AgentReport>(line).ok())
        {
            Some(report) => Ok(ChangesetApplied {
                summary: report.summary,
                cost_cents: report.cost_cents,
            }),
            None => Ok(ChangesetApplied {
                summary: tail(&stdout, OUTPUT_TAIL_BYTES),
                cost_cents: 0,
            }),
        }
    }
}

/// Terminal result of the attempt loop.
#[derive(Debug, Clone)]
pub enum ExecutionResult {
    /// All tests pass; the session sits in `TestValidation` ready to advance.
    Success,
    /// Attempt budget exhausted.
    Failure {
        reason: String,
        last_test_output: Option<String>,
    },
    /// The safety monitor denied further spend.
    Denied { reason: String },
    /// Cancelled by operator or shutdown.
    Aborted,
}

/// Drives the retry loop for one session.
pub struct ExecutionEngine {
    agent: Arc<dyn CodeGenAgent>,
    tests: Arc<dyn TestRunner>,
    monitor: Arc<SafetyMonitor>,
    max_attempts: u32,
    agent_timeout: Duration,
}

impl ExecutionEngine {
    pub fn new(
        agent: Arc<dyn CodeGenAgent>,
        tests: Arc<dyn TestRunner>,
        monitor: Arc<SafetyMonitor>,
        max_attempts: u32,
        agent_timeout: Duration,
    ) -> Self {
        Self {
            agent,
            tests,
            monitor,
            max_attempts,
            agent_timeout,
        }
    }

    /// Run attempts until tests pass, the attempt budget is exhausted, the
    /// safety monitor denies further spend, or `cancel` fires.
    ///
    /// # Preconditions
    /// - The session is in `Processing`.
    ///
    /// # Postconditions
    /// - On `Success` the session is in `TestValidation`.
    /// - `session.attempt <= max_attempts` always.
    ///
    /// The attempt counter persists across calls, so re-entry after a sync
    /// gate block consumes attempts from the same budget.
    pub async fn run(
        &self,
        session: &SharedSession,
        workspace: &Workspace,
        task: &Task,
        initial_context: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SessionError> {
        let mut context = initial_context;

        loop {
            let (attempts_used, spent_cents, elapsed, session_id) = {
                let s = session.read().await;
                (s.attempt, s.cost_cents, s.elapsed(), s.id)
            };
            if attempts_used >= self.max_attempts {
                break;
            }

            // Budget is re-checked before every attempt, retries included.
            if let BudgetDecision::Denied { reason } =
                self.monitor
                    .check_budget(spent_cents, elapsed, 0, Duration::ZERO)
            {
                return Ok(ExecutionResult::Denied { reason });
            }

            let attempt = {
                let mut s = session.write().await;
                s.begin_attempt();
                s.attempt
            };
            info!(
                session = %session_id,
                attempt,
                max = self.max_attempts,
                "starting code-generation attempt"
            );

            let request = AgentRequest {
                task_description: task.description.clone(),
                acceptance_criteria: task.acceptance_criteria.clone(),
                workspace_path: workspace.path.clone(),
                branch: workspace.branch.clone(),
                prior_failure_context: context.clone(),
            };

            let invocation = tokio::select! {
                _ = cancel.cancelled() => return Ok(ExecutionResult::Aborted),
                result = tokio::time::timeout(self.agent_timeout, self.agent.execute(request)) => result,
            };

            let changeset = match invocation {
                Err(_) => {
                    let err = AgentError::Timeout(self.agent_timeout);
                    warn!(session = %session_id, attempt, error = %err, "agent attempt failed");
                    let mut s = session.write().await;
                    s.add_note(format!("attempt {}: {}", attempt, err));
                    s.record_failure();
                    context = Some(err.to_string());
                    continue;
                }
                Ok(Err(err)) => {
                    warn!(session = %session_id, attempt, error = %err, "agent attempt failed");
                    let mut s = session.write().await;
                    s.add_note(format!("attempt {}: {}", attempt, err));
                    s.record_failure();
                    context = Some(err.to_string());
                    continue;
                }
                Ok(Ok(changeset)) => changeset,
            };

            {
                let mut s = session.write().await;
                s.add_cost(changeset.cost_cents);
                s.transition_to(SessionState::TestValidation)?;
            }
            self.monitor.record_cost(changeset.cost_cents);

            let report = tokio::select! {
                _ = cancel.cancelled() => return Ok(ExecutionResult::Aborted),
                result = self.tests.run(&workspace.path) => result,
            };

            match report {
                Ok(report) if report.passed => {
                    info!(session = %session_id, attempt, "tests passed");
                    return Ok(ExecutionResult::Success);
                }
                Ok(report) => {
                    warn!(session = %session_id, attempt, "tests failed");
                    let mut s = session.write().await;
                    s.add_note(format!("attempt {}: tests failed", attempt));
                    s.record_failure();
                    s.transition_to(SessionState::Processing)?;
                    context = Some(report.output);
                }
                Err(err) => {
                    // Infrastructure failure of the test run itself still
                    // consumes the attempt.
                    warn!(session = %session_id, attempt, error = %err, "test run errored");
                    let mut s = session.write().await;
                    s.add_note(format!("attempt {}: {}", attempt, err));
                    s.record_failure();
                    s.transition_to(SessionState::Processing)?;
                    context = Some(err.to_string());
                }
            }
        }

        Ok(ExecutionResult::Failure {
            reason: format!("attempt budget of {} exhausted", self.max_attempts),
            last_test_output: context,
        })
    }
}

#[cfg(test)]
pub mod stubs {
    //! Scripted agent and test runner for tests.

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Agent whose behavior is scripted per call.
    pub struct ScriptedAgent {
        pub calls: AtomicU32,
        pub fail_times: u32,
        pub cost_per_call: u64,
        pub last_context: Mutex<Option<String>>,
        /// When set, every call parks until the token is cancelled.
        pub hold: Option<CancellationToken>,
    }

    impl ScriptedAgent {
        pub fn succeeding(cost_per_call: u64) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_times: 0,
                cost_per_call,
                last_context: Mutex::new(None),
                hold: None,
            }
        }

        pub fn failing_first(fail_times: u32) -> Self {
            Self {
                fail_times,
                ..Self::succeeding(1)
            }
        }

        pub fn always_failing() -> Self {
            Self::failing_first(u32::MAX)
        }

        pub fn held(hold: CancellationToken, cost_per_call: u64) -> Self {
            Self {
                hold: Some(hold),
                ..Self::succeeding(cost_per_call)
            }
        }
    }

    #[async_trait]
    impl CodeGenAgent for ScriptedAgent {
        async fn execute(&self, request: AgentRequest) -> Result<ChangesetApplied, AgentError> {
            if let Some(hold) = &self.hold {
                hold.cancelled().await;
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            *self.last_context.lock().unwrap() = request.prior_failure_context;
            if call <= self.fail_times {
                return Err(AgentError::Invocation(format!("scripted failure {}", call)));
            }
            Ok(ChangesetApplied {
                summary: format!("applied changeset {}", call),
                cost_cents: self.cost_per_call,
            })
        }
    }

    /// Test runner that fails a scripted number of times, then passes.
    pub struct ScriptedTestRunner {
        pub calls: AtomicU32,
        pub fail_times: u32,
    }

    impl ScriptedTestRunner {
        pub fn passing() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_times: 0,
            }
        }

        pub fn failing_first(fail_times: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_times,
            }
        }

        pub fn always_failing() -> Self {
            Self::failing_first(u32::MAX)
        }
    }

    #[async_trait]
    impl TestRunner for ScriptedTestRunner {
        async fn run(&self, _workspace: &Path) -> Result<TestReport, TestRunError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_times {
                return Ok(TestReport {
                    passed: false,
                    output: format!("assertion failed in run {}", call),
                });
            }
            Ok(TestReport {
                passed: true,
                output: "all tests passed".to_string(),
            })
        }
    }
}
