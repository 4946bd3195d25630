use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;

use super::{CodeHost, CodeHostPlatform, PrStatus, check_pr_url};

#[derive(Debug, Deserialize)]
struct GlabMergeRequest {
    state: String,
    #[serde(default)]
    blocking_discussions_resolved: Option<bool>,
}

/// Parse `glab mr view --output json` output.
pub fn parse_glab_mr_view(json: &str) -> Result<PrStatus> {
    let mr: GlabMergeRequest = serde_json::from_str(json).context("Invalid glab mr view JSON")?;
    let state = match mr.state.to_lowercase().as_str() {
        "opened" => "open".to_string(),
        other => other.to_string(),
    };
    Ok(PrStatus {
        merged: state == "merged",
        has_unresolved_comments: mr.blocking_discussions_resolved == Some(false),
        state,
    })
}

/// GitLab adapter backed by the `glab` CLI.
#[derive(Debug, Clone)]
pub struct GitLabCodeHost {
    cli: String,
}

impl GitLabCodeHost {
    pub fn new() -> Self {
        Self::with_cli("glab")
    }

    pub fn with_cli(cli: &str) -> Self {
        Self {
            cli: cli.to_string(),
        }
    }

    async fn fetch(&self, url: &str) -> Result<PrStatus> {
        check_pr_url(url)?;
        let output = tokio::process::Command::new(&self.cli)
            .args(["mr", "view", "--output", "json", "--", url])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run {} mr view", self.cli))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} mr view failed: {}", self.cli, stderr.trim());
        }

        let stdout = String::from_utf8(output.stdout).context("Invalid UTF-8 in glab output")?;
        parse_glab_mr_view(&stdout)
    }
}

impl Default for GitLabCodeHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CodeHost for GitLabCodeHost {
    fn platform(&self) -> CodeHostPlatform {
        CodeHostPlatform::Gitlab
    }

    async fn get_pr_status(&self, url: &str) -> PrStatus {
        match self.fetch(url).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(url, error = %format!("{:#}", e), "GitLab MR status lookup failed");
                PrStatus::error()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_opened_with_blocking_discussions() {
        let status =
            parse_glab_mr_view(r#"{"state":"opened","blocking_discussions_resolved":false}"#).unwrap();
        assert_eq!(status.state, "open");
        assert!(!status.merged);
        assert!(status.has_unresolved_comments);
    }

    #[test]
    fn test_parse_merged() {
        let status =
            parse_glab_mr_view(r#"{"state":"merged","blocking_discussions_resolved":true}"#).unwrap();
        assert!(status.merged);
        assert!(!status.has_unresolved_comments);
    }

    #[test]
    fn test_parse_missing_discussion_flag_means_resolved() {
        let status = parse_glab_mr_view(r#"{"state":"closed"}"#).unwrap();
        assert_eq!(status.state, "closed");
        assert!(!status.has_unresolved_comments);
    }

    /// A stand-in CLI that records its arguments next to itself.
    #[cfg(unix)]
    fn recording_cli(dir: &std::path::Path) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("fake-cli.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\nprintf '%s\\n' \"$@\" > \"$(dirname \"$0\")/args\"\necho '{\"state\":\"opened\"}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_url_is_passed_after_end_of_options() {
        let dir = tempfile::tempdir().unwrap();
        let host = GitLabCodeHost::with_cli(recording_cli(dir.path()).to_str().unwrap());

        let status = host.get_pr_status("https://gitlab.com/acme/app/-/merge_requests/7").await;
        assert_eq!(status.state, "open");
        let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
        let args: Vec<&str> = args.lines().collect();
        assert_eq!(args[..3], ["mr", "view", "--output"]);
        assert_eq!(args[args.len() - 2..], ["--", "https://gitlab.com/acme/app/-/merge_requests/7"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_flag_like_url_never_reaches_the_cli() {
        let dir = tempfile::tempdir().unwrap();
        let host = GitLabCodeHost::with_cli(recording_cli(dir.path()).to_str().unwrap());

        assert!(host.get_pr_status("--web").await.is_error());
        assert!(!dir.path().join("args").exists());
    }
}
