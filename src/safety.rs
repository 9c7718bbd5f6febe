//! Safety monitor: budgets, concurrency slots, and the failure circuit breaker.
//!
//! # Invariants
//! - The number of outstanding [`SessionSlot`]s never exceeds
//!   `limits.max_concurrent_sessions`.
//! - `consecutive_failures` resets to zero whenever a session records a
//!   successful outcome.
//! - Once the breaker trips, every budget check is denied until
//!   [`SafetyMonitor::clear_circuit_break`] is called.
//!
//! The monitor is an explicitly passed shared object; nothing here is ambient
//! global state, so multiple orchestrators can coexist in one process.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

/// Budget limits enforced by the monitor.
#[derive(Debug, Clone)]
pub struct SafetyLimits {
    /// Maximum sessions concurrently holding a slot
    pub max_concurrent_sessions: usize,

    /// Per-session cost ceiling, in cents
    pub max_cost_per_session_cents: u64,

    /// Per-session wall-clock ceiling
    pub max_time_per_session: Duration,

    /// Consecutive failed sessions before the breaker trips
    pub circuit_break_threshold: u32,
}

impl From<&crate::config::Config> for SafetyLimits {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            max_concurrent_sessions: config.max_concurrent_sessions,
            max_cost_per_session_cents: config.max_cost_per_session_cents,
            max_time_per_session: config.max_time_per_session,
            circuit_break_threshold: config.consecutive_failure_circuit_break,
        }
    }
}

/// Outcome of a budget check.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum BudgetDecision {
    Allowed,
    Denied { reason: String },
}

impl BudgetDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, BudgetDecision::Allowed)
    }
}

/// A held concurrency slot. Dropping the slot releases it.
#[derive(Debug)]
pub struct SessionSlot {
    _permit: OwnedSemaphorePermit,
}

/// Snapshot of the monitor's counters, for the operator surface.
#[derive(Debug, Clone, Serialize)]
pub struct SafetyCounters {
    pub total_cost_cents: u64,
    pub uptime_secs: u64,
    pub consecutive_failures: u32,
    pub active_sessions: usize,
    pub max_concurrent_sessions: usize,
    pub circuit_broken: bool,
}

/// Process-wide safety counters with internal mutual exclusion.
///
/// All checks are advisory-then-enforced: callers must consult
/// [`check_budget`](SafetyMonitor::check_budget) before costly work and must
/// call [`record_outcome`](SafetyMonitor::record_outcome) exactly once per
/// session on its terminal transition.
pub struct SafetyMonitor {
    limits: SafetyLimits,
    slots: Arc<Semaphore>,
    total_cost_cents: AtomicU64,
    consecutive_failures: AtomicU32,
    circuit_broken: AtomicBool,
    started_at: Instant,
}

impl SafetyMonitor {
    pub fn new(limits: SafetyLimits) -> Self {
        let slots = Arc::new(Semaphore::new(limits.max_concurrent_sessions));
        Self {
            limits,
            slots,
            total_cost_cents: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            circuit_broken: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Check whether a session may proceed with the proposed spend.
    ///
    /// `spent_cents` and `elapsed` are the session's running totals; the
    /// deltas are what the next step would add.
    pub fn check_budget(
        &self,
        spent_cents: u64,
        elapsed: Duration,
        cost_delta_cents: u64,
        time_delta: Duration,
    ) -> BudgetDecision {
        if self.circuit_broken() {
            return BudgetDecision::Denied {
                reason: format!(
                    "circuit breaker open after {} consecutive failed sessions; \
                     operator reset required",
                    self.consecutive_failures.load(Ordering::Relaxed)
                ),
            };
        }

        let projected_cost = spent_cents.saturating_add(cost_delta_cents);
        if projected_cost > self.limits.max_cost_per_session_cents {
            return BudgetDecision::Denied {
                reason: format!(
                    "session cost {} cents would exceed cap of {} cents",
                    projected_cost, self.limits.max_cost_per_session_cents
                ),
            };
        }

        let projected_time = elapsed.saturating_add(time_delta);
        if projected_time > self.limits.max_time_per_session {
            return BudgetDecision::Denied {
                reason: format!(
                    "session elapsed {}s would exceed cap of {}s",
                    projected_time.as_secs(),
                    self.limits.max_time_per_session.as_secs()
                ),
            };
        }

        BudgetDecision::Allowed
    }

    /// Acquire a concurrency slot, waiting until one is free (back-pressure,
    /// not failure).
    pub async fn acquire_slot(&self) -> SessionSlot {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .expect("safety monitor semaphore is never closed");
        SessionSlot { _permit: permit }
    }

    /// Acquire a slot without waiting. Returns `None` when the ceiling is hit.
    pub fn try_acquire_slot(&self) -> Option<SessionSlot> {
        Arc::clone(&self.slots)
            .try_acquire_owned()
            .ok()
            .map(|permit| SessionSlot { _permit: permit })
    }

    /// Number of sessions currently holding a slot.
    pub fn active_sessions(&self) -> usize {
        self.limits.max_concurrent_sessions - self.slots.available_permits()
    }

    /// Add a spend to the running process-wide total.
    pub fn record_cost(&self, cents: u64) {
        self.total_cost_cents.fetch_add(cents, Ordering::Relaxed);
    }

    /// Record a session's terminal outcome.
    ///
    /// Must be called exactly once per session. Trips the circuit breaker
    /// once the consecutive-failure count reaches the configured threshold.
    pub fn record_outcome(&self, success: bool) {
        if success {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.limits.circuit_break_threshold && !self.circuit_broken() {
            self.circuit_broken.store(true, Ordering::Relaxed);
            warn!(
                consecutive_failures = failures,
                threshold = self.limits.circuit_break_threshold,
                "circuit breaker tripped; no new sessions will start until reset"
            );
        }
    }

    pub fn circuit_broken(&self) -> bool {
        self.circuit_broken.load(Ordering::Relaxed)
    }

    /// Operator command: close the breaker and zero the failure streak.
    pub fn clear_circuit_break(&self) {
        self.circuit_broken.store(false, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        info!("circuit breaker cleared by operator");
    }

    pub fn counters(&self) -> SafetyCounters {
        SafetyCounters {
            total_cost_cents: self.total_cost_cents.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            active_sessions: self.active_sessions(),
            max_concurrent_sessions: self.limits.max_concurrent_sessions,
            circuit_broken: self.circuit_broken(),
        }
    }
}
