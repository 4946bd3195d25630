//! Layer 3: skill content is present. Opportunistic; never reports errors.

use std::time::Duration;

use crate::config::PipelineConfig;
use crate::pipeline::Automation;
use crate::skills::SkillContentReader;

use super::{Layer, LayerFindings};

pub async fn check(
    config: &PipelineConfig,
    reader: Option<&dyn SkillContentReader>,
    timeout: Duration,
) -> LayerFindings {
    let mut findings = LayerFindings::new(Layer::SkillContent);

    let Some(reader) = reader else {
        findings.warning(None, "No skill reader available; skill content not checked");
        return findings;
    };

    for state in &config.phases {
        let Automation::Skill(skill) = &state.automation else {
            continue;
        };

        match tokio::time::timeout(timeout, reader.read_skill(skill)).await {
            Ok(Ok(Some(_))) => {}
            Ok(Ok(None)) => findings.warning(
                Some(&state.name),
                format!("Skill '{}' for phase '{}' was not found", skill, state.name),
            ),
            Ok(Err(e)) => findings.warning(
                Some(&state.name),
                format!("Skill '{}' for phase '{}' could not be read: {}", skill, state.name, e),
            ),
            Err(_) => findings.warning(
                Some(&state.name),
                format!(
                    "Reading skill '{}' for phase '{}' timed out after {:?}",
                    skill, state.name, timeout
                ),
            ),
        }
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::SkillsLoader;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct StuckReader;

    #[async_trait]
    impl SkillContentReader for StuckReader {
        async fn read_skill(&self, _name: &str) -> anyhow::Result<Option<String>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_missing_skill_is_warning() {
        let dir = tempdir().unwrap();
        let loader = SkillsLoader::new(dir.path());
        let findings = check(&PipelineConfig::builtin(), Some(&loader), Duration::from_secs(1)).await;

        assert!(!findings.has_errors());
        // five skill-backed phases in the built-in pipeline
        assert_eq!(findings.issues().len(), 5);
        assert!(findings.issues()[0].message.contains("phase-design"));
    }

    #[tokio::test]
    async fn test_present_skills_and_resolvers_are_silent() {
        let dir = tempdir().unwrap();
        for name in [
            "phase-design",
            "phase-build",
            "manual-testing",
            "phase-finalize",
            "review-cycle",
        ] {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
            std::fs::write(dir.path().join(name).join("SKILL.md"), "# skill").unwrap();
        }
        let loader = SkillsLoader::new(dir.path());
        let findings = check(&PipelineConfig::builtin(), Some(&loader), Duration::from_secs(1)).await;
        assert!(findings.issues().is_empty(), "{:?}", findings.issues());
    }

    #[tokio::test]
    async fn test_slow_reader_times_out_as_warning() {
        let findings = check(
            &PipelineConfig::builtin(),
            Some(&StuckReader),
            Duration::from_millis(20),
        )
        .await;
        assert!(!findings.has_errors());
        assert!(findings.issues().iter().all(|i| i.message.contains("timed out")));
    }
}
