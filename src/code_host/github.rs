use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;

use super::{CodeHost, CodeHostPlatform, PrStatus, check_pr_url};

/// Fields requested from `gh pr view --json`.
const GH_PR_FIELDS: &str = "state,mergedAt,reviewDecision";

/// Subset of `gh pr view --json` output we care about.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhPullRequest {
    state: String,
    #[serde(default)]
    merged_at: Option<String>,
    #[serde(default)]
    review_decision: Option<String>,
}

/// Parse `gh pr view --json state,mergedAt,reviewDecision` output.
///
/// A `CHANGES_REQUESTED` review decision counts as unresolved comments.
pub fn parse_gh_pr_view(json: &str) -> Result<PrStatus> {
    let pr: GhPullRequest = serde_json::from_str(json).context("Invalid gh pr view JSON")?;
    let state = pr.state.to_lowercase();
    let merged = state == "merged" || pr.merged_at.is_some_and(|m| !m.is_empty());
    let has_unresolved_comments = pr
        .review_decision
        .is_some_and(|d| d.eq_ignore_ascii_case("CHANGES_REQUESTED"));
    Ok(PrStatus {
        merged,
        has_unresolved_comments,
        state,
    })
}

/// GitHub adapter backed by the `gh` CLI.
#[derive(Debug, Clone)]
pub struct GitHubCodeHost {
    cli: String,
}

impl GitHubCodeHost {
    pub fn new() -> Self {
        Self::with_cli("gh")
    }

    pub fn with_cli(cli: &str) -> Self {
        Self {
            cli: cli.to_string(),
        }
    }

    async fn fetch(&self, url: &str) -> Result<PrStatus> {
        check_pr_url(url)?;
        let output = tokio::process::Command::new(&self.cli)
            .args(["pr", "view", "--json", GH_PR_FIELDS, "--", url])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run {} pr view", self.cli))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} pr view failed: {}", self.cli, stderr.trim());
        }

        let stdout = String::from_utf8(output.stdout).context("Invalid UTF-8 in gh output")?;
        parse_gh_pr_view(&stdout)
    }
}

impl Default for GitHubCodeHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CodeHost for GitHubCodeHost {
    fn platform(&self) -> CodeHostPlatform {
        CodeHostPlatform::Github
    }

    async fn get_pr_status(&self, url: &str) -> PrStatus {
        match self.fetch(url).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(url, error = %format!("{:#}", e), "GitHub PR status lookup failed");
                PrStatus::error()
            }
        }
    }
}
