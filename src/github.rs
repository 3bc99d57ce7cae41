//! GitHub access: issue URL parsing, issue retrieval and repository cloning.
//!
//! REST calls go through `curl` and clones through `git`, so the binary has
//! no TLS stack of its own.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{OssDevError, Result};

/// Timeout for a single REST call.
const API_TIMEOUT_SECS: u64 = 30;

/// Timeout for a shallow clone.
const CLONE_TIMEOUT: Duration = Duration::from_secs(600);

/// A specific issue in a specific repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssueRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl IssueRef {
    /// HTTPS clone URL of the repository.
    #[must_use]
    pub fn clone_url(&self) -> String {
        format!("https://github.com/{}/{}.git", self.owner, self.repo)
    }
}

impl std::fmt::Display for IssueRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.number)
    }
}

static ISSUE_URL_RE: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| {
        Regex::new(
            r"^(?:https?://)?(?:www\.)?github\.com/([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+)/issues/([^/?#]+)/?(?:[?#].*)?$",
        )
    });

/// Parse `https://github.com/<owner>/<repo>/issues/<n>`.
///
/// Query strings and fragments are ignored.
///
/// # Errors
///
/// Returns [`OssDevError::InvalidIssueUrl`] for anything else.
///
/// # Example
///
/// ```rust
/// use ossdev::github::parse_issue_url;
///
/// let issue = parse_issue_url("https://github.com/rust-lang/cargo/issues/42").unwrap();
/// assert_eq!(issue.to_string(), "rust-lang/cargo#42");
/// ```
pub fn parse_issue_url(url: &str) -> Result<IssueRef> {
    let invalid = |reason: &str| OssDevError::InvalidIssueUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let re = ISSUE_URL_RE.as_ref().map_err(|e| invalid(&e.to_string()))?;

    let trimmed = url.trim();
    if !trimmed.contains("github.com/") {
        return Err(invalid("not a github.com URL"));
    }
    let caps = re
        .captures(trimmed)
        .ok_or_else(|| invalid("expected https://github.com/<owner>/<repo>/issues/<number>"))?;

    let number = caps[3]
        .parse::<u64>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| invalid("issue number must be a positive integer"))?;

    Ok(IssueRef {
        owner: caps[1].to_string(),
        repo: caps[2].trim_end_matches(".git").to_string(),
        number,
    })
}

/// The parts of an issue the analyzer reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GitHubIssue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub html_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiIssue {
    number: u64,
    title: String,
    body: Option<String>,
    #[serde(default)]
    labels: Vec<ApiLabel>,
    #[serde(default)]
    html_url: String,
    pull_request: Option<serde_json::Value>,
}

/// Parse a REST `GET /repos/{owner}/{repo}/issues/{n}` body.
///
/// # Errors
///
/// Returns [`OssDevError::GitHub`] for undecodable bodies and for pull
/// requests, which the issues endpoint also serves.
pub fn parse_issue_json(body: &str) -> Result<GitHubIssue> {
    let issue: ApiIssue = serde_json::from_str(body)
        .map_err(|e| OssDevError::github(format!("unexpected issue payload: {}", e)))?;
    if issue.pull_request.is_some() {
        return Err(OssDevError::github(format!(
            "#{} is a pull request, not an issue",
            issue.number
        )));
    }
    Ok(GitHubIssue {
        number: issue.number,
        title: issue.title,
        body: issue.body.unwrap_or_default(),
        labels: issue.labels.into_iter().map(|l| l.name).collect(),
        html_url: issue.html_url,
    })
}

/// Minimal GitHub REST client.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    token: Option<String>,
    api_base: String,
}

impl GitHubClient {
    /// Default API base URL.
    pub const DEFAULT_API_BASE: &'static str = "https://api.github.com";

    /// Create a client; without a token requests are anonymous and rate
    /// limited.
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
            api_base: Self::DEFAULT_API_BASE.to_string(),
        }
    }

    /// Set a custom API base URL (GitHub Enterprise).
    #[must_use]
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    /// Fetch an issue's title, body and labels.
    ///
    /// # Errors
    ///
    /// Returns [`OssDevError::GitHub`] if the request fails or the issue does
    /// not exist.
    pub async fn fetch_issue(&self, issue: &IssueRef) -> Result<GitHubIssue> {
        let url = format!(
            "{}/repos/{}/{}/issues/{}",
            self.api_base, issue.owner, issue.repo, issue.number
        );
        debug!("Fetching {}", url);

        let mut cmd = Command::new("curl");
        cmd.args([
            "-sS",
            "-L",
            "-H",
            "Accept: application/vnd.github+json",
            "-H",
            "User-Agent: oss-dev",
            "--max-time",
            &API_TIMEOUT_SECS.to_string(),
            "-w",
            "\n%{http_code}",
        ]);
        if let Some(token) = &self.token {
            cmd.args(["-H", &format!("Authorization: Bearer {}", token)]);
        }
        cmd.arg(&url);

        let output = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| OssDevError::github(format!("failed to run curl: {}", e)))?;
        if !output.status.success() {
            return Err(OssDevError::github(format!(
                "curl failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (body, status) = match stdout.rsplit_once('\n') {
            Some((body, code)) => (body, code.trim().parse::<u16>().unwrap_or(0)),
            None => ("", 0),
        };
        match status {
            200 => parse_issue_json(body),
            404 => Err(OssDevError::github(format!("issue {} not found", issue))),
            401 | 403 => Err(OssDevError::github(format!(
                "GitHub rejected the request (HTTP {}); check the token or rate limit",
                status
            ))),
            other => Err(OssDevError::github(format!(
                "unexpected HTTP {} fetching {}",
                other, issue
            ))),
        }
    }

    /// Shallow-clone the issue's repository into `dest`.
    ///
    /// # Errors
    ///
    /// Returns [`OssDevError::Clone`] if `git` fails or times out.
    pub async fn clone_repo(&self, issue: &IssueRef, dest: &Path) -> Result<()> {
        let url = issue.clone_url();
        info!("Cloning {} into {}", url, dest.display());

        let clone_error = |message: String| OssDevError::Clone {
            url: url.clone(),
            message,
        };

        let mut cmd = Command::new("git");
        cmd.args(["clone", "--depth", "1", "--quiet", &url])
            .arg(dest)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(CLONE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| clone_error(format!("timed out after {}s", CLONE_TIMEOUT.as_secs())))?
            .map_err(|e| clone_error(format!("failed to run git: {}", e)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(clone_error(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}
