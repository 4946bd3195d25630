//! Discovery of ready-to-run stages.
//!
//! The query itself belongs to an external tool (`kanban-cli` by default),
//! which understands epics, tickets, dependencies and priorities. Discovery
//! only removes stages that need a human and passes the aggregate counts
//! through unchanged. It never retries; the orchestrator tries again next tick.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;

use crate::errors::DiscoveryError;
use crate::resolvers::StageInput;

/// A candidate stage as reported by the external query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadyStage {
    pub id: String,
    #[serde(default)]
    pub ticket: Option<String>,
    #[serde(default)]
    pub epic: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub worktree_branch: Option<String>,
    #[serde(default)]
    pub refinement_type: Vec<String>,
    #[serde(default)]
    pub priority_score: f64,
    #[serde(default)]
    pub priority_reason: String,
    #[serde(default)]
    pub needs_human: bool,
}

impl ReadyStage {
    /// Resolver projection of this stage at `status`.
    pub fn to_input(&self, status: &str, pr_url: Option<String>) -> StageInput {
        StageInput {
            id: self.id.clone(),
            ticket: self.ticket.clone(),
            epic: self.epic.clone(),
            title: self.title.clone(),
            status: status.to_string(),
            worktree_branch: self.worktree_branch.clone(),
            refinement_type: self.refinement_type.clone(),
            pr_url,
        }
    }

    /// Branch for this stage's worktree, derived from the id when unset.
    pub fn branch(&self) -> String {
        self.worktree_branch
            .clone()
            .unwrap_or_else(|| format!("stage/{}", self.id.to_lowercase()))
    }
}

/// Raw output of the "next workable stages" query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub ready_stages: Vec<ReadyStage>,
    #[serde(default)]
    pub blocked_count: usize,
    #[serde(default)]
    pub in_progress_count: usize,
    #[serde(default)]
    pub to_convert_count: usize,
}

/// What the orchestrator schedules from.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryResult {
    pub ready_stages: Vec<ReadyStage>,
    pub blocked_count: usize,
    pub in_progress_count: usize,
    pub to_convert_count: usize,
}

/// The external "next workable stages" query.
#[async_trait]
pub trait StageQuery: Send + Sync {
    async fn next(&self, repo_path: &Path, max: usize) -> Result<QueryResult, DiscoveryError>;
}

/// Runs `<cmd> next --repo <path> --max <n> --output json`.
#[derive(Debug, Clone)]
pub struct CommandStageQuery {
    command: String,
}

impl CommandStageQuery {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }
}

#[async_trait]
impl StageQuery for CommandStageQuery {
    async fn next(&self, repo_path: &Path, max: usize) -> Result<QueryResult, DiscoveryError> {
        let output = tokio::process::Command::new(&self.command)
            .arg("next")
            .arg("--repo")
            .arg(repo_path)
            .args(["--max", &max.to_string(), "--output", "json"])
            .current_dir(repo_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| DiscoveryError::SpawnFailed {
                command: self.command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(DiscoveryError::QueryFailed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(DiscoveryError::MalformedOutput)
    }
}

/// Canned query results, used in simulated mode and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticStageQuery {
    result: QueryResult,
}

impl StaticStageQuery {
    pub fn new(result: QueryResult) -> Self {
        Self { result }
    }
}

#[async_trait]
impl StageQuery for StaticStageQuery {
    async fn next(&self, _repo_path: &Path, max: usize) -> Result<QueryResult, DiscoveryError> {
        let mut result = self.result.clone();
        result.ready_stages.truncate(max);
        Ok(result)
    }
}

pub struct Discovery {
    query: Box<dyn StageQuery>,
}

impl Discovery {
    pub fn new(query: impl StageQuery + 'static) -> Self {
        Self {
            query: Box::new(query),
        }
    }

    pub async fn discover(
        &self,
        repo_path: &Path,
        max: usize,
    ) -> Result<DiscoveryResult, DiscoveryError> {
        let raw = self.query.next(repo_path, max).await?;
        let total = raw.ready_stages.len();
        let ready_stages: Vec<ReadyStage> = raw
            .ready_stages
            .into_iter()
            .filter(|stage| {
                if stage.needs_human {
                    tracing::debug!(stage_id = %stage.id, "Skipping stage that needs a human");
                }
                !stage.needs_human
            })
            .collect();

        tracing::debug!(
            candidates = total,
            ready = ready_stages.len(),
            blocked = raw.blocked_count,
            in_progress = raw.in_progress_count,
            "Discovery complete"
        );

        Ok(DiscoveryResult {
            ready_stages,
            blocked_count: raw.blocked_count,
            in_progress_count: raw.in_progress_count,
            to_convert_count: raw.to_convert_count,
        })
    }
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"{
        "ready_stages": [
            {"id": "STAGE-001-001-001", "ticket": "TICKET-001-001", "epic": "EPIC-001",
             "title": "Login form", "worktree_branch": "feat/login",
             "refinement_type": ["frontend"], "priority_score": 9.5,
             "priority_reason": "unblocks two tickets", "needs_human": false},
            {"id": "STAGE-001-001-002", "title": "Pick a vendor", "needs_human": true},
            {"id": "STAGE-002-001-001", "title": "Schema migration"}
        ],
        "blocked_count": 4,
        "in_progress_count": 2,
        "to_convert_count": 1
    }"#;

    fn sample() -> QueryResult {
        serde_json::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_query_result_parses_wire_format() {
        let result = sample();
        assert_eq!(result.ready_stages.len(), 3);
        let first = &result.ready_stages[0];
        assert_eq!(first.priority_score, 9.5);
        assert_eq!(first.refinement_type, vec!["frontend"]);
        assert!(result.ready_stages[1].needs_human);
        assert_eq!(result.ready_stages[2].worktree_branch, None);
    }

    #[tokio::test]
    async fn test_discover_filters_needs_human_and_keeps_counts() {
        let discovery = Discovery::new(StaticStageQuery::new(sample()));
        let result = discovery.discover(Path::new("."), 10).await.unwrap();

        let ids: Vec<_> = result.ready_stages.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["STAGE-001-001-001", "STAGE-002-001-001"]);
        assert_eq!(result.blocked_count, 4);
        assert_eq!(result.in_progress_count, 2);
        assert_eq!(result.to_convert_count, 1);
    }

    #[tokio::test]
    async fn test_command_query_spawn_failure() {
        let dir = tempdir().unwrap();
        let query = CommandStageQuery::new("stagehand-no-such-discovery-cmd");
        let err = query.next(dir.path(), 1).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::SpawnFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_query_non_zero_exit_propagates() {
        let dir = tempdir().unwrap();
        let discovery = Discovery::new(CommandStageQuery::new("false"));
        let err = discovery.discover(dir.path(), 1).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::QueryFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_query_malformed_output() {
        // `echo next --repo ...` prints its arguments, which is not JSON
        let dir = tempdir().unwrap();
        let err = CommandStageQuery::new("echo")
            .next(dir.path(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::MalformedOutput(_)));
    }

    #[test]
    fn test_branch_defaults_from_id() {
        let stage = ReadyStage {
            id: "STAGE-003-002-001".into(),
            ..Default::default()
        };
        assert_eq!(stage.branch(), "stage/stage-003-002-001");
        let input = stage.to_input("Build", None);
        assert_eq!(input.status, "Build");
        assert_eq!(input.id, "STAGE-003-002-001");
    }
}
