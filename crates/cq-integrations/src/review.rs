//! HTTP client for a Rietveld-style review service.
//!
//! Endpoints used (relative to the configured base URL):
//!
//! | Operation          | Request                                              |
//! |--------------------|------------------------------------------------------|
//! | `list_pending`     | `GET  /search?format=json&commit=1&closed=3&...`     |
//! | `fetch_patch`      | `GET  /download/issue{issue}_{patchset}.diff`        |
//! | `post_comment`     | `POST /{issue}/publish` (form)                       |
//! | `close_issue`      | `POST /{issue}/close`                                |
//! | `trigger_try_jobs` | `POST /api/{issue}/{patchset}/try` (json)            |
//! | `get_try_jobs`     | `GET  /api/{issue}/{patchset}?try_jobs=true`         |

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use cq_core::{
    ChangeInfo, ReviewClient, ReviewError, ReviewMessage, ReviewResult, TryJobResult, TryJobState,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{normalize_base_url, Result};
use crate::retry::{transport, with_retry, RetryPolicy};

const USER_AGENT: &str = concat!("commit-queue/", env!("CARGO_PKG_VERSION"));

/// `[review]` section of the daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewClientConfig {
    /// Base URL of the review service.
    pub url: String,
    /// Restrict discovery to one project.
    #[serde(default)]
    pub project: Option<String>,
    /// Account the queue posts as; its own issues are never picked up.
    #[serde(default)]
    pub user: Option<String>,
    /// Bearer token sent with every request.
    #[serde(default)]
    pub token: Option<String>,
    /// Checkout-relative directory patches apply in.
    #[serde(default)]
    pub relpath: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Page size of a discovery query.
    #[serde(default = "default_search_limit")]
    pub search_limit: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_search_limit() -> u32 {
    100
}

impl ReviewClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            project: None,
            user: None,
            token: None,
            relpath: String::new(),
            timeout_secs: default_timeout_secs(),
            search_limit: default_search_limit(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Review client speaking the Rietveld JSON API over reqwest.
#[derive(Debug, Clone)]
pub struct HttpReviewClient {
    client: Client,
    base_url: String,
    config: ReviewClientConfig,
}

impl HttpReviewClient {
    pub fn new(config: ReviewClientConfig) -> Result<Self> {
        let base_url = normalize_base_url(&config.url)?;
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn search_query(&self, cursor: Option<&str>) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("format", "json".to_string()),
            ("commit", "1".to_string()),
            // 3 = open issues only
            ("closed", "3".to_string()),
            ("keys_only", "False".to_string()),
            ("with_messages", "True".to_string()),
            ("limit", self.config.search_limit.to_string()),
        ];
        if let Some(project) = &self.config.project {
            query.push(("project", project.clone()));
        }
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        query
    }

    async fn get_text(&self, path: &str, issue: Option<u64>) -> ReviewResult<String> {
        let url = &self.url(path);
        with_retry(&self.config.retry, path, || async move {
            let response = self
                .authorized(self.client.get(url))
                .send()
                .await
                .map_err(transport)?;
            checked(response, issue).await?.text().await.map_err(transport)
        })
        .await
    }
}

/// Turn a non-success response into a `ReviewError`.
async fn checked(response: Response, issue: Option<u64>) -> ReviewResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        if let Some(issue) = issue {
            return Err(ReviewError::NotFound(issue));
        }
    }
    let body = response.text().await.unwrap_or_default();
    Err(ReviewError::Status {
        status: status.as_u16(),
        body: body.chars().take(512).collect(),
    })
}

#[async_trait]
impl ReviewClient for HttpReviewClient {
    async fn list_pending(&self) -> ReviewResult<Vec<ChangeInfo>> {
        let url = &self.url("search");
        let mut changes = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let query = &self.search_query(cursor.as_deref());
            let body = with_retry(&self.config.retry, "search", || async move {
                let response = self
                    .authorized(self.client.get(url).query(query))
                    .send()
                    .await
                    .map_err(transport)?;
                checked(response, None).await?.text().await.map_err(transport)
            })
            .await?;

            let page = parse_search(&body)?;
            let fetched = page.results.len();
            for issue in page.results {
                if let Some(change) = issue.into_change(&self.config) {
                    changes.push(change);
                }
            }
            // A short page is the last one.
            match page.cursor {
                Some(next) if fetched as u32 >= self.config.search_limit && fetched > 0 => {
                    cursor = Some(next)
                }
                _ => break,
            }
        }
        debug!(count = changes.len(), "Listed pending changes");
        Ok(changes)
    }

    async fn fetch_patch(&self, issue: u64, patchset: u64) -> ReviewResult<String> {
        self.get_text(
            &format!("download/issue{issue}_{patchset}.diff"),
            Some(issue),
        )
        .await
    }

    async fn post_comment(&self, issue: u64, message: &str) -> ReviewResult<()> {
        let url = &self.url(&format!("{issue}/publish"));
        let form = &[
            ("message_only", "True"),
            ("send_mail", "True"),
            ("no_redirect", "True"),
            ("message", message),
        ];
        with_retry(&self.config.retry, "publish", || async move {
            let response = self
                .authorized(self.client.post(url).form(form))
                .send()
                .await
                .map_err(transport)?;
            checked(response, Some(issue)).await.map(|_| ())
        })
        .await?;
        info!(issue, "Posted review comment");
        Ok(())
    }

    async fn close_issue(&self, issue: u64) -> ReviewResult<()> {
        let url = &self.url(&format!("{issue}/close"));
        with_retry(&self.config.retry, "close", || async move {
            let response = self
                .authorized(self.client.post(url))
                .send()
                .await
                .map_err(transport)?;
            checked(response, Some(issue)).await.map(|_| ())
        })
        .await?;
        info!(issue, "Closed issue");
        Ok(())
    }

    async fn trigger_try_jobs(
        &self,
        issue: u64,
        patchset: u64,
        builders: &[String],
    ) -> ReviewResult<()> {
        let url = &self.url(&format!("api/{issue}/{patchset}/try"));
        let body = &serde_json::json!({ "builders": builders });
        with_retry(&self.config.retry, "try", || async move {
            let response = self
                .authorized(self.client.post(url).json(body))
                .send()
                .await
                .map_err(transport)?;
            checked(response, Some(issue)).await.map(|_| ())
        })
        .await?;
        info!(issue, patchset, builders = ?builders, "Triggered try jobs");
        Ok(())
    }

    async fn get_try_jobs(&self, issue: u64, patchset: u64) -> ReviewResult<Vec<TryJobResult>> {
        let body = self
            .get_text(&format!("api/{issue}/{patchset}?try_jobs=true"), Some(issue))
            .await?;
        parse_try_jobs(&body)
    }

    fn issue_url(&self, issue: u64) -> String {
        self.url(&issue.to_string())
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    results: Vec<WireIssue>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireIssue {
    issue: u64,
    owner_email: String,
    #[serde(default)]
    reviewers: Vec<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    base_url: String,
    #[serde(default)]
    patchsets: Vec<u64>,
    #[serde(default)]
    messages: Vec<WireMessage>,
    created: String,
    #[serde(default)]
    closed: bool,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    sender: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    approval: bool,
}

impl WireIssue {
    /// `None` for issues the queue must not pick up.
    fn into_change(self, config: &ReviewClientConfig) -> Option<ChangeInfo> {
        if self.closed {
            return None;
        }
        if let Some(user) = &config.user {
            if self.owner_email.eq_ignore_ascii_case(user) {
                debug!(issue = self.issue, "Skipping issue owned by the queue account");
                return None;
            }
        }
        let patchset = *self.patchsets.iter().max()?;
        let created_at = match parse_timestamp(&self.created) {
            Some(ts) => ts,
            None => {
                debug!(issue = self.issue, created = %self.created, "Unparseable creation time");
                return None;
            }
        };
        Some(ChangeInfo {
            issue: self.issue,
            patchset,
            owner: self.owner_email,
            reviewers: self.reviewers,
            description: self.description,
            base_url: self.base_url,
            relpath: config.relpath.clone(),
            messages: self
                .messages
                .into_iter()
                .map(|m| ReviewMessage {
                    sender: m.sender,
                    text: m.text,
                    approval: m.approval,
                })
                .collect(),
            created_at,
        })
    }
}

/// Rietveld timestamps are naive UTC, with or without fractional seconds.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|ts| ts.with_timezone(&Utc)))
}

fn parse_search(body: &str) -> ReviewResult<SearchPage> {
    serde_json::from_str(body).map_err(|e| ReviewError::Decode(format!("search results: {e}")))
}

#[derive(Debug, Deserialize)]
struct TryJobsPage {
    #[serde(default)]
    try_job_results: Vec<WireTryJob>,
}

#[derive(Debug, Deserialize)]
struct WireTryJob {
    builder: String,
    result: i64,
    #[serde(default)]
    url: Option<String>,
}

/// Result codes: -1 pending, 0/1/3 success (ok, warnings, skipped),
/// 2/4 failure (failed, exception), anything else still running.
fn try_job_state(code: i64) -> TryJobState {
    match code {
        -1 => TryJobState::Pending,
        0 | 1 | 3 => TryJobState::Success,
        2 | 4 => TryJobState::Failure,
        _ => TryJobState::Running,
    }
}

fn parse_try_jobs(body: &str) -> ReviewResult<Vec<TryJobResult>> {
    let page: TryJobsPage = serde_json::from_str(body)
        .map_err(|e| ReviewError::Decode(format!("try job results: {e}")))?;
    Ok(page
        .try_job_results
        .into_iter()
        .map(|job| TryJobResult {
            builder: job.builder,
            state: try_job_state(job.result),
            url: job.url.filter(|u| !u.is_empty()),
        })
        .collect())
}
