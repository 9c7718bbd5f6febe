//! Documentation-synchronization merge gate.
//!
//! Inspects a session's changeset for structural signals and requires that
//! matching documentation was touched in the same changeset. The gate is
//! deliberately conservative: a false positive costs one retry cycle, a
//! false negative costs the system its self-documentation guarantee, so
//! classification errs toward flagging.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::vcs::{ChangeKind, ChangedPath};

/// Fixed categories of structural change the gate recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuralChangeKind {
    /// A new top-level component or module appeared
    NewTopLevelModule,
    /// The shape of a persisted entity changed
    PersistedEntityShape,
    /// The set of state-machine transitions changed
    StateTransitionLogic,
}

impl StructuralChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewTopLevelModule => "new top-level module",
            Self::PersistedEntityShape => "persisted entity shape",
            Self::StateTransitionLogic => "state transition logic",
        }
    }
}

/// One gate category with its verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEntry {
    pub kind: StructuralChangeKind,
    pub satisfied: bool,
    /// The path(s) that triggered the category.
    pub detail: String,
}

/// Per-session gate verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub entries: Vec<SyncEntry>,
}

impl SyncReport {
    /// A session may only advance past the gate if every entry is satisfied.
    pub fn is_satisfied(&self) -> bool {
        self.entries.iter().all(|e| e.satisfied)
    }

    pub fn missing(&self) -> impl Iterator<Item = &SyncEntry> {
        self.entries.iter().filter(|e| !e.satisfied)
    }

    /// Markdown checklist attached to review requests and outcome notes.
    pub fn checklist(&self) -> String {
        if self.entries.is_empty() {
            return "- no structural changes detected".to_string();
        }
        self.entries
            .iter()
            .map(|e| {
                format!(
                    "- [{}] {}: {}",
                    if e.satisfied { "x" } else { " " },
                    e.kind.as_str(),
                    e.detail
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Actionable message naming every missing documentation update.
    pub fn missing_summary(&self, docs_root: &str) -> String {
        let items: Vec<String> = self
            .missing()
            .map(|e| format!("{} ({})", e.kind.as_str(), e.detail))
            .collect();
        format!(
            "documentation out of sync: update {}/ to cover: {}",
            docs_root,
            items.join("; ")
        )
    }
}

const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "py", "ts", "tsx", "js", "jsx", "go", "java", "kt", "rb", "c", "cc", "cpp", "h", "hpp",
    "cs", "swift", "scala", "ex", "exs",
];

const MODULE_MARKERS: &[&str] = &["mod.rs", "lib.rs", "__init__.py", "index.ts", "index.js"];

/// Evaluates changesets against the documentation requirement.
pub struct SyncGate {
    docs_root: String,
    schema_prefixes: Vec<String>,
    state_prefixes: Vec<String>,
}

impl SyncGate {
    pub fn new(docs_root: impl Into<String>) -> Self {
        Self {
            docs_root: docs_root.into(),
            schema_prefixes: vec![
                "schema".to_string(),
                "migrations".to_string(),
                "src/model".to_string(),
                "src/models".to_string(),
                "src/entities".to_string(),
            ],
            state_prefixes: vec![
                "src/state".to_string(),
                "src/fsm".to_string(),
                "src/session".to_string(),
            ],
        }
    }

    pub fn docs_root(&self) -> &str {
        &self.docs_root
    }

    pub fn with_schema_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.schema_prefixes = prefixes;
        self
    }

    pub fn with_state_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.state_prefixes = prefixes;
        self
    }

    /// Classify the changeset and check each category against the docs root.
    ///
    /// A category is satisfied iff at least one path under the docs root was
    /// added or modified in the same changeset. The requirement holds even
    /// for the first-ever occurrence of a category.
    pub fn evaluate(&self, changes: &[ChangedPath]) -> SyncReport {
        let docs_touched = changes.iter().any(|c| {
            c.kind != ChangeKind::Deleted && has_prefix(&c.path, &self.docs_root)
        });

        // BTreeMap keeps report ordering deterministic.
        let mut triggers: BTreeMap<StructuralChangeKind, Vec<&str>> = BTreeMap::new();

        for change in changes {
            if change.kind == ChangeKind::Added && is_new_top_level_module(&change.path) {
                triggers
                    .entry(StructuralChangeKind::NewTopLevelModule)
                    .or_default()
                    .push(&change.path);
            }
            if self
                .schema_prefixes
                .iter()
                .any(|p| has_prefix(&change.path, p))
            {
                triggers
                    .entry(StructuralChangeKind::PersistedEntityShape)
                    .or_default()
                    .push(&change.path);
            }
            if self
                .state_prefixes
                .iter()
                .any(|p| has_prefix(&change.path, p))
                || file_name(&change.path).contains("state_machine")
                || file_name(&change.path).contains("transitions")
            {
                triggers
                    .entry(StructuralChangeKind::StateTransitionLogic)
                    .or_default()
                    .push(&change.path);
            }
        }

        let entries = triggers
            .into_iter()
            .map(|(kind, paths)| SyncEntry {
                kind,
                satisfied: docs_touched,
                detail: paths.join(", "),
            })
            .collect();

        SyncReport { entries }
    }
}

fn has_prefix(path: &str, prefix: &str) -> bool {
    path == prefix || path.starts_with(&format!("{}/", prefix))
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_source_file(path: &str) -> bool {
    path.rsplit('.')
        .next()
        .map(|ext| SOURCE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// A path counts as a new top-level module when it is a source file at the
/// repository root, directly under `src/`, or a module marker file anywhere
/// at depth two (a fresh directory with its own entry point).
fn is_new_top_level_module(path: &str) -> bool {
    let components: Vec<&str> = path.split('/').collect();
    match components.len() {
        1 => is_source_file(path),
        2 => {
            let in_src = components[0] == "src";
            let is_marker = MODULE_MARKERS.contains(&components[1]);
            (in_src && is_source_file(path)) || is_marker
        }
        3 => components[0] == "src" && MODULE_MARKERS.contains(&components[2]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::ChangeKind::*;

    fn change(path: &str, kind: ChangeKind) -> ChangedPath {
        ChangedPath::new(path, kind)
    }

    #[test]
    fn new_module_without_docs_blocks() {
        let gate = SyncGate::new("docs");
        let report = gate.evaluate(&[
            change("src/telemetry.rs", Added),
            change("src/main.rs", Modified),
        ]);

        assert!(!report.is_satisfied());
        let missing: Vec<_> = report.missing().collect();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].kind, StructuralChangeKind::NewTopLevelModule);
        assert!(missing[0].detail.contains("src/telemetry.rs"));
    }

    #[test]
    fn docs_change_satisfies_the_category() {
        let gate = SyncGate::new("docs");
        let report = gate.evaluate(&[
            change("src/telemetry.rs", Added),
            change("docs/architecture.md", Modified),
        ]);
        assert!(report.is_satisfied());
    }

    #[test]
    fn schema_and_state_changes_are_flagged() {
        let gate = SyncGate::new("docs");
        let report = gate.evaluate(&[
            change("migrations/0042_add_column.sql", Added),
            change("src/state/machine.rs", Modified),
        ]);

        let kinds: Vec<_> = report.entries.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&StructuralChangeKind::PersistedEntityShape));
        assert!(kinds.contains(&StructuralChangeKind::StateTransitionLogic));
        assert!(!report.is_satisfied());
    }

    #[test]
    fn modified_existing_source_is_not_a_new_module() {
        let gate = SyncGate::new("docs");
        let report = gate.evaluate(&[
            change("src/util.rs", Modified),
            change("src/nested/deep/helper.rs", Added),
        ]);
        assert!(report.entries.is_empty());
        assert!(report.is_satisfied());
    }

    #[test]
    fn module_marker_in_fresh_directory_is_flagged() {
        let gate = SyncGate::new("docs");
        let report = gate.evaluate(&[change("src/billing/mod.rs", Added)]);
        assert_eq!(report.entries.len(), 1);
        assert_eq!(
            report.entries[0].kind,
            StructuralChangeKind::NewTopLevelModule
        );
    }

    #[test]
    fn deleted_docs_do_not_satisfy() {
        let gate = SyncGate::new("docs");
        let report = gate.evaluate(&[
            change("src/widget.rs", Added),
            change("docs/old.md", Deleted),
        ]);
        assert!(!report.is_satisfied());
    }

    #[test]
    fn first_occurrence_of_a_kind_still_requires_docs() {
        // No docs exist yet anywhere in the changeset's history; the gate
        // still demands a doc change for the first structural change.
        let gate = SyncGate::new("docs");
        let report = gate.evaluate(&[change("src/first_module.rs", Added)]);
        assert!(!report.is_satisfied());
    }

    #[test]
    fn checklist_renders_markdown() {
        let gate = SyncGate::new("docs");
        let report = gate.evaluate(&[
            change("src/widget.rs", Added),
            change("docs/widget.md", Added),
        ]);
        let checklist = report.checklist();
        assert!(checklist.contains("- [x] new top-level module"));

        let empty = gate.evaluate(&[change("src/nested/deep/fix.rs", Modified)]);
        assert!(empty.checklist().contains("no structural changes"));
    }

    #[test]
    fn missing_summary_names_the_docs_root() {
        let gate = SyncGate::new("docs");
        let report = gate.evaluate(&[change("src/widget.rs", Added)]);
        let summary = report.missing_summary(gate.docs_root());
        assert!(summary.contains("docs/"));
        assert!(summary.contains("new top-level module"));
    }
}
