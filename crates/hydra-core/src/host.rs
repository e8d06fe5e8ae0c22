use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

/// Classified issue-host failure; the kind drives the retry policy.
#[derive(Debug, Clone, Error)]
pub enum HostError {
    /// Retryable I/O: connect errors, timeouts, 429, 5xx.
    #[error("transient host error: {0}")]
    Transient(String),
    /// 4xx beyond retry; escalates the affected issue rather than the loop.
    #[error("permanent host error ({status}): {message}")]
    Permanent { status: u16, message: String },
    /// 401/403 — unrecoverable; the process shuts down with exit code 3.
    #[error("host authentication failed: {0}")]
    Auth(String),
}

impl HostError {
    pub fn kind(&self) -> &'static str {
        match self {
            HostError::Transient(_) => "transient_host",
            HostError::Permanent { .. } => "permanent_host",
            HostError::Auth(_) => "auth",
        }
    }
}

/// An issue as reported by the host.
#[derive(Debug, Clone, Deserialize)]
pub struct HostIssue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub url: String,
}

/// A pull request as reported by the host.
#[derive(Debug, Clone, Deserialize)]
pub struct HostPull {
    pub number: u64,
    pub issue: u64,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub merged: bool,
}

/// The narrow seam to the source-code host. The host is the source of truth
/// for issues and PRs; the core only observes and commands it.
#[async_trait]
pub trait IssueHost: Send + Sync {
    async fn create_issue(&self, title: &str, body: &str, label: &str) -> Result<HostIssue, HostError>;
    async fn list_open_issues(&self, label: &str) -> Result<Vec<HostIssue>, HostError>;
    async fn close_issue(&self, number: u64) -> Result<(), HostError>;
    async fn list_open_prs(&self) -> Result<Vec<HostPull>, HostError>;
    async fn pr_merged(&self, pr: u64) -> Result<bool, HostError>;
    /// CI verdict for a PR; None while checks are still running.
    async fn ci_passing(&self, pr: u64) -> Result<Option<bool>, HostError>;
    async fn merge_pr(&self, pr: u64) -> Result<(), HostError>;
}

/// Retry budget for transient host errors.
pub const RETRY_BUDGET: u32 = 5;

/// Run a host operation with exponential backoff and jitter on transient
/// errors. Permanent and auth errors return immediately.
pub async fn with_retry<T, F, Fut>(op: &str, f: F) -> Result<T, HostError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, HostError>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(HostError::Transient(msg)) if attempt + 1 < RETRY_BUDGET => {
                attempt += 1;
                let base = 500u64 * (1 << attempt.min(5));
                let jitter = rand::thread_rng().gen_range(0..250);
                warn!(op, attempt, "transient host error, retrying: {msg}");
                tokio::time::sleep(Duration::from_millis(base + jitter)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// `IssueHost` over a GitHub-like forge's JSON API, authenticated with a
/// bearer token.
pub struct HttpIssueHost {
    client: reqwest::Client,
    base: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct CiStatus {
    /// "passing" | "failing" | "running"
    state: String,
}

impl HttpIssueHost {
    pub fn new(base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base: base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn classify(status: reqwest::StatusCode, body: String) -> HostError {
        match status.as_u16() {
            401 | 403 => HostError::Auth(body),
            429 => HostError::Transient(format!("rate limited: {body}")),
            s if s >= 500 => HostError::Transient(format!("{s}: {body}")),
            s => HostError::Permanent { status: s, message: body },
        }
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, HostError> {
        let mut req = self
            .client
            .request(method, format!("{}{}", self.base, path))
            .header("accept", "application/json");
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| HostError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify(status, body));
        }
        resp.json::<T>()
            .await
            .map_err(|e| HostError::Transient(format!("invalid host response: {e}")))
    }

    async fn request_unit(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(), HostError> {
        let mut req = self.client.request(method, format!("{}{}", self.base, path));
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| HostError::Transient(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify(status, body));
        }
        Ok(())
    }
}

#[async_trait]
impl IssueHost for HttpIssueHost {
    async fn create_issue(&self, title: &str, body: &str, label: &str) -> Result<HostIssue, HostError> {
        self.request(
            reqwest::Method::POST,
            "/api/issues",
            Some(json!({ "title": title, "body": body, "labels": [label] })),
        )
        .await
    }

    async fn list_open_issues(&self, label: &str) -> Result<Vec<HostIssue>, HostError> {
        self.request(
            reqwest::Method::GET,
            &format!("/api/issues?state=open&label={label}"),
            None,
        )
        .await
    }

    async fn close_issue(&self, number: u64) -> Result<(), HostError> {
        self.request_unit(
            reqwest::Method::PATCH,
            &format!("/api/issues/{number}"),
            Some(json!({ "state": "closed" })),
        )
        .await
    }

    async fn list_open_prs(&self) -> Result<Vec<HostPull>, HostError> {
        self.request(reqwest::Method::GET, "/api/pulls?state=open", None).await
    }

    async fn pr_merged(&self, pr: u64) -> Result<bool, HostError> {
        let pull: HostPull = self
            .request(reqwest::Method::GET, &format!("/api/pulls/{pr}"), None)
            .await?;
        Ok(pull.merged)
    }

    async fn ci_passing(&self, pr: u64) -> Result<Option<bool>, HostError> {
        let status: CiStatus = self
            .request(reqwest::Method::GET, &format!("/api/pulls/{pr}/status"), None)
            .await?;
        Ok(match status.state.as_str() {
            "passing" => Some(true),
            "failing" => Some(false),
            _ => None,
        })
    }

    async fn merge_pr(&self, pr: u64) -> Result<(), HostError> {
        self.request_unit(reqwest::Method::PUT, &format!("/api/pulls/{pr}/merge"), None)
            .await
    }
}
