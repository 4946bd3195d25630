//! Skill content for skill-backed pipeline states.
//!
//! Skills are markdown files authored by humans, one directory per skill:
//!
//! ```text
//! <repo>/skills/
//! ├── phase-design/
//! │   └── SKILL.md
//! └── phase-build/
//!     └── SKILL.md
//! ```
//!
//! The pipeline validator reads them opportunistically through
//! [`SkillContentReader`]; the session executor turns them into the opening
//! prompt of a session.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The filename for skill content
pub const SKILL_FILE: &str = "SKILL.md";

/// Read access to skill content by name.
#[async_trait]
pub trait SkillContentReader: Send + Sync {
    /// `Ok(None)` when the skill does not exist; `Err` only for I/O failures
    /// on a skill that does.
    async fn read_skill(&self, name: &str) -> Result<Option<String>>;
}

/// A loaded skill with its content.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub path: PathBuf,
    pub content: String,
}

impl Skill {
    pub fn new(name: &str, path: PathBuf, content: String) -> Self {
        Self {
            name: name.to_string(),
            path,
            content,
        }
    }

    /// Opening prompt for a session working `stage_id` under this skill.
    pub fn session_prompt(&self, stage_id: &str) -> String {
        format!(
            "## SKILL: {}\n\n{}\n\n## STAGE\n\nYou are working on stage {}.",
            self.name.to_uppercase().replace('-', " "),
            self.content.trim(),
            stage_id
        )
    }
}

/// Filesystem skill loader with a per-name cache.
#[derive(Debug)]
pub struct SkillsLoader {
    skills_dir: PathBuf,
    cache: Mutex<HashMap<String, Skill>>,
}

impl SkillsLoader {
    pub fn new(skills_dir: impl Into<PathBuf>) -> Self {
        Self {
            skills_dir: skills_dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Loader for `<repo>/<skills_dir>`.
    pub fn for_repo(repo_path: &Path, skills_dir: &str) -> Self {
        Self::new(repo_path.join(skills_dir))
    }

    fn skill_file(&self, name: &str) -> PathBuf {
        self.skills_dir.join(name).join(SKILL_FILE)
    }

    /// Load a single skill by name, consulting the cache first.
    pub async fn load_skill(&self, name: &str) -> Result<Option<Skill>> {
        if let Some(skill) = self.cached(name) {
            return Ok(Some(skill));
        }

        let skill_file = self.skill_file(name);
        if !tokio::fs::try_exists(&skill_file).await.unwrap_or(false) {
            tracing::debug!(skill = name, path = %skill_file.display(), "Skill not found");
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&skill_file)
            .await
            .with_context(|| format!("Failed to read skill file: {}", skill_file.display()))?;

        let skill = Skill::new(name, self.skills_dir.join(name), content);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(name.to_string(), skill.clone());
        }
        Ok(Some(skill))
    }

    fn cached(&self, name: &str) -> Option<Skill> {
        self.cache.lock().ok()?.get(name).cloned()
    }
}

#[async_trait]
impl SkillContentReader for SkillsLoader {
    async fn read_skill(&self, name: &str) -> Result<Option<String>> {
        Ok(self.load_skill(name).await?.map(|skill| skill.content))
    }
}
