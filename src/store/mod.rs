//! Stage status projection.
//!
//! The orchestrator does not own stage persistence. It reads the few fields it
//! needs for one scheduling decision and writes back a validated status. The
//! default store is the stage markdown files themselves:
//!
//! ```text
//! <repo>/epics/EPIC-001/TICKET-001-001/STAGE-001-001-001.md
//! ---
//! status: Build
//! requested_transition: Testing Router
//! ---
//! ...body...
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};
use walkdir::WalkDir;

/// Directory under the repository root holding stage files.
pub const EPICS_DIR: &str = "epics";

const FENCE: &str = "---";

// Stage ids name files; no separators or leading dots.
static STAGE_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").unwrap());
const STATUS_KEY: &str = "status";
const REQUESTED_TRANSITION_KEY: &str = "requested_transition";

/// The fields of a stage the orchestrator reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub pr_url: Option<String>,
    /// Transition target a session asked for when it finished.
    #[serde(default)]
    pub requested_transition: Option<String>,
    #[serde(default)]
    pub refinement_type: Vec<String>,
}

#[async_trait]
pub trait StageStore: Send + Sync {
    async fn load(&self, stage_id: &str) -> Result<StageRecord>;

    /// Persist `status` and clear any pending `requested_transition`.
    async fn set_status(&self, stage_id: &str, status: &str) -> Result<()>;
}

/// Stage store backed by YAML frontmatter in `<repo>/epics/**/<id>.md`.
#[derive(Debug, Clone)]
pub struct FrontmatterStageStore {
    root: PathBuf,
}

impl FrontmatterStageStore {
    pub fn new(repo_path: &Path) -> Self {
        Self {
            root: repo_path.join(EPICS_DIR),
        }
    }

    fn find(&self, stage_id: &str) -> Result<PathBuf> {
        if !STAGE_ID_REGEX.is_match(stage_id) {
            anyhow::bail!("Invalid stage id '{}'", stage_id);
        }
        let file_name = format!("{}.md", stage_id);
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .find(|entry| entry.file_type().is_file() && entry.file_name() == file_name.as_str())
            .map(|entry| entry.into_path())
            .with_context(|| {
                format!("No stage file {} under {}", file_name, self.root.display())
            })
    }

    async fn read(&self, stage_id: &str) -> Result<(PathBuf, serde_yaml::Mapping, String)> {
        let path = self.find(stage_id)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read stage file: {}", path.display()))?;
        let (yaml, body) = split_frontmatter(&content)
            .with_context(|| format!("Stage file has no frontmatter: {}", path.display()))?;
        let mapping = parse_mapping(yaml)
            .with_context(|| format!("Invalid frontmatter in {}", path.display()))?;
        Ok((path, mapping, body.to_string()))
    }
}

#[async_trait]
impl StageStore for FrontmatterStageStore {
    async fn load(&self, stage_id: &str) -> Result<StageRecord> {
        let (path, mapping, _) = self.read(stage_id).await?;
        serde_yaml::from_value(serde_yaml::Value::Mapping(mapping))
            .with_context(|| format!("Unexpected frontmatter shape in {}", path.display()))
    }

    async fn set_status(&self, stage_id: &str, status: &str) -> Result<()> {
        let (path, mut mapping, body) = self.read(stage_id).await?;
        mapping.insert(STATUS_KEY.into(), status.into());
        mapping.remove(REQUESTED_TRANSITION_KEY);

        let yaml = serde_yaml::to_string(&mapping).context("Failed to serialize frontmatter")?;
        let content = format!("{FENCE}\n{yaml}{FENCE}\n{body}");
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write stage file: {}", path.display()))?;

        tracing::info!(stage_id, status, "Persisted stage status");
        Ok(())
    }
}

/// Split `---`-fenced frontmatter from the body. The opening fence must be the
/// first line.
fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix(FENCE)?;
    let rest = rest
        .strip_prefix("\r\n")
        .or_else(|| rest.strip_prefix('\n'))?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == FENCE {
            return Some((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}

fn parse_mapping(yaml: &str) -> Result<serde_yaml::Mapping> {
    if yaml.trim().is_empty() {
        return Ok(serde_yaml::Mapping::new());
    }
    Ok(serde_yaml::from_str(yaml)?)
}

/// In-memory store for simulated runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStageStore {
    records: Mutex<HashMap<String, StageRecord>>,
}

impl MemoryStageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, stage_id: &str, record: StageRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(stage_id.to_string(), record);
        }
    }

    /// Record the transition a finished session asked for.
    pub fn request_transition(&self, stage_id: &str, target: &str) {
        if let Ok(mut records) = self.records.lock() {
            records.entry(stage_id.to_string()).or_default().requested_transition =
                Some(target.to_string());
        }
    }

    pub fn status(&self, stage_id: &str) -> Option<String> {
        self.records
            .lock()
            .ok()?
            .get(stage_id)
            .map(|r| r.status.clone())
    }
}

#[async_trait]
impl StageStore for MemoryStageStore {
    async fn load(&self, stage_id: &str) -> Result<StageRecord> {
        let records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("stage store lock poisoned"))?;
        records
            .get(stage_id)
            .cloned()
            .with_context(|| format!("Unknown stage {}", stage_id))
    }

    async fn set_status(&self, stage_id: &str, status: &str) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("stage store lock poisoned"))?;
        let record = records.entry(stage_id.to_string()).or_default();
        record.status = status.to_string();
        record.requested_transition = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const STAGE: &str = "---\nid: STAGE-001-001-001\nstatus: Build\nrequested_transition: Testing Router\nrefinement_type:\n  - frontend\n---\n# Login form\n\nBody text.\n";

    fn write_stage(repo: &Path, id: &str, content: &str) -> PathBuf {
        let dir = repo.join(EPICS_DIR).join("EPIC-001").join("TICKET-001-001");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}.md", id));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_split_frontmatter() {
        let (yaml, body) = split_frontmatter(STAGE).unwrap();
        assert!(yaml.starts_with("id: STAGE-001-001-001"));
        assert!(yaml.ends_with("  - frontend\n"));
        assert_eq!(body, "# Login form\n\nBody text.\n");

        assert!(split_frontmatter("no fence here").is_none());
        assert!(split_frontmatter("---\nstatus: Build\n").is_none());
        assert_eq!(split_frontmatter("---\n---\n"), Some(("", "")));
    }

    #[tokio::test]
    async fn test_load_finds_nested_stage() {
        let dir = tempdir().unwrap();
        write_stage(dir.path(), "STAGE-001-001-001", STAGE);

        let store = FrontmatterStageStore::new(dir.path());
        let record = store.load("STAGE-001-001-001").await.unwrap();
        assert_eq!(record.status, "Build");
        assert_eq!(record.requested_transition.as_deref(), Some("Testing Router"));
        assert_eq!(record.refinement_type, vec!["frontend"]);
        assert_eq!(record.pr_url, None);
    }

    #[tokio::test]
    async fn test_set_status_clears_request_and_keeps_body() {
        let dir = tempdir().unwrap();
        let path = write_stage(dir.path(), "STAGE-001-001-001", STAGE);

        let store = FrontmatterStageStore::new(dir.path());
        store
            .set_status("STAGE-001-001-001", "Routing Tests")
            .await
            .unwrap();

        let record = store.load("STAGE-001-001-001").await.unwrap();
        assert_eq!(record.status, "Routing Tests");
        assert_eq!(record.requested_transition, None);

        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("id: STAGE-001-001-001"));
        assert!(content.ends_with("---\n# Login form\n\nBody text.\n"));
    }

    #[tokio::test]
    async fn test_missing_stage_is_error() {
        let dir = tempdir().unwrap();
        let store = FrontmatterStageStore::new(dir.path());
        let err = store.load("STAGE-404-404-404").await.unwrap_err();
        assert!(err.to_string().contains("STAGE-404-404-404.md"));
    }

    #[tokio::test]
    async fn test_path_like_stage_id_is_rejected() {
        let dir = tempdir().unwrap();
        let store = FrontmatterStageStore::new(dir.path());
        let err = store.load("../secrets").await.unwrap_err();
        assert!(err.to_string().contains("Invalid stage id"));
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStageStore::new();
        store.insert(
            "S1",
            StageRecord {
                status: "Build".into(),
                ..Default::default()
            },
        );
        store.request_transition("S1", "Testing Router");
        assert_eq!(
            store.load("S1").await.unwrap().requested_transition.as_deref(),
            Some("Testing Router")
        );

        store.set_status("S1", "Routing Tests").await.unwrap();
        let record = store.load("S1").await.unwrap();
        assert_eq!(record.status, "Routing Tests");
        assert_eq!(record.requested_transition, None);
        assert!(store.load("S2").await.is_err());
    }
}
