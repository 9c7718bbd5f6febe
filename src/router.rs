//! Task routing: autonomous execution vs. human escalation.

use serde::Serialize;

use crate::backlog::Task;

/// Which handler a task is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Runs through the execution engine
    Autonomous,
    /// Surfaced to a human collaborator; never enters the engine
    HumanEscalation,
}

/// Pure classification over task labels.
pub struct TaskRouter {
    escalation_label: String,
}

impl TaskRouter {
    pub fn new(escalation_label: impl Into<String>) -> Self {
        Self {
            escalation_label: escalation_label.into(),
        }
    }

    pub fn escalation_label(&self) -> &str {
        &self.escalation_label
    }

    pub fn route(&self, task: &Task) -> HandlerKind {
        if task.has_label(&self.escalation_label) {
            HandlerKind::HumanEscalation
        } else {
            HandlerKind::Autonomous
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::{TaskId, TaskStatus};
    use chrono::Utc;

    fn task_with_labels(labels: &[&str]) -> Task {
        Task {
            id: TaskId::from("t"),
            title: "t".to_string(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: 0,
            depends_on: vec![],
            labels: labels.iter().map(|l| l.to_string()).collect(),
            acceptance_criteria: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn escalation_label_routes_to_human() {
        let router = TaskRouter::new("needs-human");
        assert_eq!(
            router.route(&task_with_labels(&["backend", "needs-human"])),
            HandlerKind::HumanEscalation
        );
        assert_eq!(
            router.route(&task_with_labels(&["backend"])),
            HandlerKind::Autonomous
        );
        assert_eq!(router.route(&task_with_labels(&[])), HandlerKind::Autonomous);
    }
}
