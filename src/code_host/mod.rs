//! Code-host adapters: pull/merge request status for resolvers.
//!
//! Adapters shell out to the platform CLI (`gh`, `glab`) and never propagate
//! failures: any error is logged and mapped to [`PrStatus::error`], so one flaky
//! dependency cannot stall evaluation of a stage.

mod github;
mod gitlab;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::Mode;

pub use github::GitHubCodeHost;
pub use gitlab::GitLabCodeHost;

/// Which code host a repository lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeHostPlatform {
    #[default]
    Github,
    Gitlab,
    Unknown,
}

impl std::fmt::Display for CodeHostPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeHostPlatform::Github => write!(f, "github"),
            CodeHostPlatform::Gitlab => write!(f, "gitlab"),
            CodeHostPlatform::Unknown => write!(f, "unknown"),
        }
    }
}

/// Review state of a pull/merge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrStatus {
    pub merged: bool,
    pub has_unresolved_comments: bool,
    /// Normalized lowercase state (`open`, `merged`, `closed`), or `error`.
    pub state: String,
}

impl PrStatus {
    /// Neutral status reported when the host could not be queried.
    pub fn error() -> Self {
        Self {
            merged: false,
            has_unresolved_comments: false,
            state: "error".to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.state == "error"
    }
}

/// Read access to pull/merge request state.
#[async_trait]
pub trait CodeHost: Send + Sync {
    fn platform(&self) -> CodeHostPlatform;

    /// Never fails; errors map to [`PrStatus::error`].
    async fn get_pr_status(&self, url: &str) -> PrStatus;
}

/// Canned adapter used in [`Mode::Simulated`] and in tests.
#[derive(Debug, Clone)]
pub struct SimulatedCodeHost {
    status: PrStatus,
}

impl SimulatedCodeHost {
    pub fn new(status: PrStatus) -> Self {
        Self { status }
    }
}

impl Default for SimulatedCodeHost {
    fn default() -> Self {
        Self::new(PrStatus {
            merged: false,
            has_unresolved_comments: false,
            state: "open".to_string(),
        })
    }
}

#[async_trait]
impl CodeHost for SimulatedCodeHost {
    fn platform(&self) -> CodeHostPlatform {
        CodeHostPlatform::Unknown
    }

    async fn get_pr_status(&self, _url: &str) -> PrStatus {
        self.status.clone()
    }
}

/// PR references come from stage frontmatter; one the CLI would read as a
/// flag is refused before the CLI runs.
fn check_pr_url(url: &str) -> anyhow::Result<()> {
    if url.trim().is_empty() || url.starts_with('-') {
        anyhow::bail!("Refusing PR reference {:?}", url);
    }
    Ok(())
}

/// Build the adapter for a platform. `Unknown` yields no adapter.
pub fn create_code_host(platform: CodeHostPlatform, mode: Mode) -> Option<Arc<dyn CodeHost>> {
    match (platform, mode) {
        (CodeHostPlatform::Unknown, _) => None,
        (_, Mode::Simulated) => Some(Arc::new(SimulatedCodeHost::default())),
        (CodeHostPlatform::Github, Mode::Normal) => Some(Arc::new(GitHubCodeHost::new())),
        (CodeHostPlatform::Gitlab, Mode::Normal) => Some(Arc::new(GitLabCodeHost::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_display_and_yaml_names() {
        assert_eq!(CodeHostPlatform::Unknown.to_string(), "unknown");
        let parsed: CodeHostPlatform = serde_yaml::from_str("gitlab").unwrap();
        assert_eq!(parsed, CodeHostPlatform::Gitlab);
        assert!(serde_yaml::from_str::<CodeHostPlatform>("bitbucket").is_err());
    }

    #[test]
    fn test_pr_url_that_reads_as_a_flag_is_refused() {
        assert!(check_pr_url("--web").is_err());
        assert!(check_pr_url("-R").is_err());
        assert!(check_pr_url("  ").is_err());
        check_pr_url("https://github.com/acme/app/pull/7").unwrap();
        check_pr_url("42").unwrap();
    }

    #[test]
    fn test_unknown_platform_has_no_adapter() {
        assert!(create_code_host(CodeHostPlatform::Unknown, Mode::Normal).is_none());
        assert!(create_code_host(CodeHostPlatform::Unknown, Mode::Simulated).is_none());
    }

    #[test]
    fn test_factory_selects_adapter() {
        let gh = create_code_host(CodeHostPlatform::Github, Mode::Normal).unwrap();
        assert_eq!(gh.platform(), CodeHostPlatform::Github);
        let gl = create_code_host(CodeHostPlatform::Gitlab, Mode::Normal).unwrap();
        assert_eq!(gl.platform(), CodeHostPlatform::Gitlab);
        let sim = create_code_host(CodeHostPlatform::Github, Mode::Simulated).unwrap();
        assert_eq!(sim.platform(), CodeHostPlatform::Unknown);
    }

    #[tokio::test]
    async fn test_simulated_host_returns_canned_status() {
        let host = SimulatedCodeHost::new(PrStatus {
            merged: true,
            has_unresolved_comments: false,
            state: "merged".into(),
        });
        let status = host.get_pr_status("https://example.com/pr/1").await;
        assert!(status.merged);
        assert!(!status.is_error());
    }

    #[test]
    fn test_pr_status_error_is_neutral() {
        let status = PrStatus::error();
        assert!(!status.merged);
        assert!(!status.has_unresolved_comments);
        assert!(status.is_error());
    }
}
