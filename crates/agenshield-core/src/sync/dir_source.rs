//! Directory-backed sync source.
//!
//! Serves skills out of a local directory: one subdirectory per skill,
//! with an optional `skill.json` (`{name?, version?, description?}`)
//! manifest. The reference adapter for offline provisioning.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use crate::types::FileEntry;

use super::{SkillDefinition, SkillSourceAdapter};

#[derive(Debug, Default, Deserialize)]
struct DirManifest {
    name: Option<String>,
    version: Option<String>,
    description: Option<String>,
}

pub struct DirectorySourceAdapter {
    id: String,
    root: PathBuf,
    trusted: bool,
}

impl DirectorySourceAdapter {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>, trusted: bool) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
            trusted,
        }
    }

    fn definition_for(&self, slug: &str, dir: &std::path::Path) -> anyhow::Result<SkillDefinition> {
        let files = crate::fs::read_files(dir)?;
        let manifest: DirManifest = files
            .iter()
            .find(|f| f.relative_path == "skill.json")
            .and_then(|f| serde_json::from_slice(&f.bytes).ok())
            .unwrap_or_default();

        let sha = SkillDefinition::content_sha(&files);
        Ok(SkillDefinition {
            skill_id: slug.to_string(),
            name: manifest.name.unwrap_or_else(|| slug.to_string()),
            description: manifest.description,
            version: manifest.version.unwrap_or_else(|| "0.0.0".to_string()),
            sha,
            files,
            trusted: self.trusted,
        })
    }
}

#[async_trait]
impl SkillSourceAdapter for DirectorySourceAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_available(&self) -> bool {
        self.root.is_dir()
    }

    async fn get_skills_for(&self, _target: &str) -> anyhow::Result<Vec<SkillDefinition>> {
        let mut out = Vec::new();
        if !self.root.is_dir() {
            return Ok(out);
        }

        let mut slugs = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let slug = entry.file_name().to_string_lossy().to_string();
            if slug.starts_with('.') {
                continue;
            }
            slugs.push((slug, entry.path()));
        }
        slugs.sort_by(|a, b| a.0.cmp(&b.0));

        for (slug, path) in slugs {
            out.push(self.definition_for(&slug, &path)?);
        }
        Ok(out)
    }

    async fn get_skill_files(&self, skill_id: &str) -> anyhow::Result<Vec<FileEntry>> {
        let dir = self.root.join(skill_id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        crate::fs::read_files(&dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn lists_skills_with_manifest_metadata() {
        let tmp = TempDir::new().unwrap();
        let skill_dir = tmp.path().join("hello");
        fs::create_dir_all(&skill_dir).unwrap();
        fs::write(skill_dir.join("SKILL.md"), "# Hello\n").unwrap();
        fs::write(
            skill_dir.join("skill.json"),
            r#"{"name": "Hello", "version": "1.2.0"}"#,
        )
        .unwrap();

        let adapter = DirectorySourceAdapter::new("local", tmp.path(), true);
        assert!(adapter.is_available().await);

        let skills = adapter.get_skills_for("workspace").await.unwrap();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].skill_id, "hello");
        assert_eq!(skills[0].name, "Hello");
        assert_eq!(skills[0].version, "1.2.0");
        assert!(skills[0].trusted);
        assert_eq!(skills[0].sha, SkillDefinition::content_sha(&skills[0].files));
    }

    #[tokio::test]
    async fn sha_tracks_content_changes() {
        let tmp = TempDir::new().unwrap();
        let skill_dir = tmp.path().join("hello");
        fs::create_dir_all(&skill_dir).unwrap();
        fs::write(skill_dir.join("SKILL.md"), "v1").unwrap();

        let adapter = DirectorySourceAdapter::new("local", tmp.path(), false);
        let before = adapter.get_skills_for("t").await.unwrap()[0].sha.clone();

        fs::write(skill_dir.join("SKILL.md"), "v2").unwrap();
        let after = adapter.get_skills_for("t").await.unwrap()[0].sha.clone();
        assert_ne!(before, after);
    }
}
