//! Version-control host interface.
//!
//! The host is an external collaborator: branches, changesets, review
//! requests, and merges all live there. The trait keeps the orchestrator
//! testable with a scripted stub.

mod http;

pub use http::HttpVcsHost;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("vcs transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("vcs api error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("invalid vcs url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("vcs protocol error: {0}")]
    Protocol(String),
}

/// How a path changed relative to the branch point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// One entry in a branch's changeset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangedPath {
    pub path: String,
    pub kind: ChangeKind,
}

impl ChangedPath {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Handle to a review request on the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequestHandle {
    pub id: String,
    pub url: Option<String>,
}

/// Decision state of a review request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ReviewDecision {
    Pending,
    Approved,
    Rejected { reason: String },
}

/// External version-control host.
#[async_trait]
pub trait VcsHost: Send + Sync {
    /// Create a branch. An already-existing branch of the same name is not
    /// an error; it signals a retried session for the same task and is
    /// reused.
    async fn create_branch(&self, name: &str) -> Result<(), VcsError>;

    async fn delete_branch(&self, name: &str) -> Result<(), VcsError>;

    /// Changeset of `branch` relative to its branch point.
    async fn changed_paths(&self, branch: &str) -> Result<Vec<ChangedPath>, VcsError>;

    async fn create_review_request(
        &self,
        branch: &str,
        title: &str,
        description: &str,
    ) -> Result<ReviewRequestHandle, VcsError>;

    async fn get_review_decision(
        &self,
        handle: &ReviewRequestHandle,
    ) -> Result<ReviewDecision, VcsError>;

    async fn merge(&self, handle: &ReviewRequestHandle) -> Result<(), VcsError>;
}
