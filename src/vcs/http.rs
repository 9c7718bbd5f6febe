//! HTTP client for the version-control host API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use super::{ChangedPath, ReviewDecision, ReviewRequestHandle, VcsError, VcsHost};

/// JSON REST client for the version-control host.
///
/// Expected surface (all paths relative to the base URL):
/// - `POST   api/branches` `{ "name": ... }` (409 = branch exists, reused)
/// - `DELETE api/branches/{name}` (404 tolerated)
/// - `GET    api/branches/{name}/changes` -> `{ "changes": [{path, kind}] }`
/// - `POST   api/reviews` `{ branch, title, description }` -> `{ id, url }`
/// - `GET    api/reviews/{id}` -> `{ state, reason? }`
/// - `POST   api/reviews/{id}/merge`
pub struct HttpVcsHost {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl HttpVcsHost {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, VcsError> {
        // Url::join drops the last path segment without a trailing slash.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        Ok(Self {
            client: reqwest::Client::new(),
            base: Url::parse(&normalized)?,
            token,
        })
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn api_error(response: reqwest::Response) -> VcsError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        VcsError::Api { status, message }
    }
}

#[derive(Deserialize)]
struct ChangesResponse {
    changes: Vec<ChangedPath>,
}

#[derive(Deserialize)]
struct ReviewCreated {
    id: String,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct ReviewState {
    state: String,
    #[serde(default)]
    reason: Option<String>,
}

#[async_trait]
impl VcsHost for HttpVcsHost {
    async fn create_branch(&self, name: &str) -> Result<(), VcsError> {
        let url = self.base.join("api/branches")?;
        let response = self
            .request(reqwest::Method::POST, url)
            .json(&json!({ "name": name }))
            .send()
            .await?;

        // An existing branch signals a retried session; reuse it.
        if response.status().is_success() || response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        Err(Self::api_error(response).await)
    }

    async fn delete_branch(&self, name: &str) -> Result<(), VcsError> {
        let url = self.base.join(&format!("api/branches/{}", name))?;
        let response = self.request(reqwest::Method::DELETE, url).send().await?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Self::api_error(response).await)
    }

    async fn changed_paths(&self, branch: &str) -> Result<Vec<ChangedPath>, VcsError> {
        let url = self.base.join(&format!("api/branches/{}/changes", branch))?;
        let response = self.request(reqwest::Method::GET, url).send().await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let body: ChangesResponse = response.json().await?;
        Ok(body.changes)
    }

    async fn create_review_request(
        &self,
        branch: &str,
        title: &str,
        description: &str,
    ) -> Result<ReviewRequestHandle, VcsError> {
        let url = self.base.join("api/reviews")?;
        let response = self
            .request(reqwest::Method::POST, url)
            .json(&json!({
                "branch": branch,
                "title": title,
                "description": description,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let body: ReviewCreated = response.json().await?;
        Ok(ReviewRequestHandle {
            id: body.id,
            url: body.url,
        })
    }

    async fn get_review_decision(
        &self,
        handle: &ReviewRequestHandle,
    ) -> Result<ReviewDecision, VcsError> {
        let url = self.base.join(&format!("api/reviews/{}", handle.id))?;
        let response = self.request(reqwest::Method::GET, url).send().await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let body: ReviewState = response.json().await?;
        match body.state.as_str() {
            "pending" => Ok(ReviewDecision::Pending),
            "approved" => Ok(ReviewDecision::Approved),
            "rejected" => Ok(ReviewDecision::Rejected {
                reason: body.reason.unwrap_or_else(|| "no reason given".to_string()),
            }),
            other => Err(VcsError::Protocol(format!(
                "unknown review state '{}'",
                other
            ))),
        }
    }

    async fn merge(&self, handle: &ReviewRequestHandle) -> Result<(), VcsError> {
        let url = self.base.join(&format!("api/reviews/{}/merge", handle.id))?;
        let response = self.request(reqwest::Method::POST, url).send().await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(())
    }
}
