//! Reference adapter: deploys into the agent workspace filesystem.
//!
//! Target layout is `{deployRoot}/{slug}/` with the manifest files
//! verbatim. Optionally writes an executable `{binDir}/{slug}` wrapper
//! that runs its arguments from inside the deployed directory. The deploy
//! root is fixed at construction; `version.folder_path` is provenance and
//! never used to derive a target.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::fs::{collect_files, content_hash, hash_file, remove_path, replace_dir_atomic};
use crate::types::{Skill, SkillFile, SkillInstallation, SkillVersion};

use super::{DeployAdapter, DeployContext, DeployOutcome, IntegrityCheckResult};

pub const WORKSPACE_ADAPTER_ID: &str = "workspace";

pub struct WorkspaceDeployAdapter {
    deploy_root: PathBuf,
    bin_dir: Option<PathBuf>,
}

impl WorkspaceDeployAdapter {
    /// `deploy_root` must exist; it is resolved to an absolute path so
    /// later comparisons against notifier paths are stable.
    pub fn new(deploy_root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let deploy_root = deploy_root.into();
        fs::create_dir_all(&deploy_root).with_context(|| {
            format!("Failed to create deploy root: {}", deploy_root.display())
        })?;
        let deploy_root = deploy_root
            .canonicalize()
            .with_context(|| format!("Failed to resolve deploy root: {}", deploy_root.display()))?;
        Ok(Self {
            deploy_root,
            bin_dir: None,
        })
    }

    /// Also write wrapper scripts into `bin_dir`.
    pub fn with_bin_dir(mut self, bin_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let bin_dir = bin_dir.into();
        fs::create_dir_all(&bin_dir)
            .with_context(|| format!("Failed to create bin dir: {}", bin_dir.display()))?;
        self.bin_dir = Some(
            bin_dir
                .canonicalize()
                .with_context(|| format!("Failed to resolve bin dir: {}", bin_dir.display()))?,
        );
        Ok(self)
    }

    pub fn deploy_root(&self) -> &Path {
        &self.deploy_root
    }

    fn skill_dir(&self, slug: &str) -> PathBuf {
        self.deploy_root.join(slug)
    }

    fn write_wrapper(&self, slug: &str, deployed: &Path) -> anyhow::Result<Option<PathBuf>> {
        let Some(bin_dir) = &self.bin_dir else {
            return Ok(None);
        };
        let wrapper = bin_dir.join(slug);
        let script = format!(
            "#!/bin/sh\ncd \"{}\" || exit 1\nexec \"$@\"\n",
            deployed.display()
        );
        fs::write(&wrapper, script)
            .with_context(|| format!("Failed to write wrapper: {}", wrapper.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&wrapper, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("Failed to mark executable: {}", wrapper.display()))?;
        }

        Ok(Some(wrapper))
    }
}

impl DeployAdapter for WorkspaceDeployAdapter {
    fn id(&self) -> &str {
        WORKSPACE_ADAPTER_ID
    }

    fn display_name(&self) -> &str {
        "Agent workspace"
    }

    fn can_deploy(&self, profile_id: Option<&str>) -> bool {
        match profile_id {
            None => true,
            Some(id) => id == WORKSPACE_ADAPTER_ID,
        }
    }

    fn deploy(&self, ctx: &DeployContext<'_>) -> anyhow::Result<DeployOutcome> {
        let target = self.skill_dir(&ctx.skill.slug);

        replace_dir_atomic(&target, |stage| {
            match ctx.file_contents {
                Some(contents) => {
                    for file in ctx.files {
                        let bytes = contents.get(&file.relative_path).ok_or_else(|| {
                            anyhow::anyhow!(
                                "file contents missing manifest entry: {}",
                                file.relative_path
                            )
                        })?;
                        write_entry(stage, &file.relative_path, bytes)?;
                    }
                }
                None => {
                    let folder = ctx.version.folder_path.as_deref().ok_or_else(|| {
                        anyhow::anyhow!(
                            "version {} has no source folder and no file contents",
                            ctx.version.id
                        )
                    })?;
                    let source = Path::new(folder);
                    for file in ctx.files {
                        let bytes =
                            fs::read(source.join(&file.relative_path)).with_context(|| {
                                format!(
                                    "Failed to read source file: {}/{}",
                                    source.display(),
                                    file.relative_path
                                )
                            })?;
                        write_entry(stage, &file.relative_path, &bytes)?;
                    }
                }
            }
            Ok(())
        })?;

        let entries: Vec<(String, String)> = ctx
            .files
            .iter()
            .map(|f| {
                hash_file(&target.join(&f.relative_path))
                    .map(|(hash, _)| (f.relative_path.clone(), hash))
            })
            .collect::<anyhow::Result<_>>()?;
        let deployed_hash = content_hash(&entries);

        let wrapper_path = self.write_wrapper(&ctx.skill.slug, &target)?;

        Ok(DeployOutcome {
            deployed_path: target,
            deployed_hash,
            wrapper_path,
        })
    }

    fn undeploy(
        &self,
        installation: &SkillInstallation,
        _version: &SkillVersion,
        skill: &Skill,
    ) -> anyhow::Result<()> {
        remove_path(&self.skill_dir(&skill.slug))?;

        if let Some(wrapper) = installation.wrapper_path.as_deref() {
            remove_path(Path::new(wrapper))?;
        } else if let Some(bin_dir) = &self.bin_dir {
            remove_path(&bin_dir.join(&skill.slug))?;
        }
        Ok(())
    }

    fn check_integrity(
        &self,
        _installation: &SkillInstallation,
        version: &SkillVersion,
        skill: &Skill,
        files: &[SkillFile],
    ) -> anyhow::Result<IntegrityCheckResult> {
        let dir = self.skill_dir(&skill.slug);
        let mut result = IntegrityCheckResult {
            expected_hash: Some(version.content_hash.clone()),
            ..Default::default()
        };

        let mut manifest_paths: HashSet<&str> = HashSet::new();
        for file in files {
            manifest_paths.insert(file.relative_path.as_str());
            let on_disk = dir.join(&file.relative_path);
            if !on_disk.is_file() {
                result.missing_files.push(file.relative_path.clone());
                continue;
            }
            let (hash, _) = hash_file(&on_disk)?;
            if hash != file.file_hash {
                result.modified_files.push(file.relative_path.clone());
            }
        }

        let mut current_entries = Vec::new();
        if dir.is_dir() {
            for found in collect_files(&dir)? {
                let (hash, _) = hash_file(&found.path)?;
                current_entries.push((found.relative_path.clone(), hash));
                if !manifest_paths.contains(found.relative_path.as_str()) {
                    result.unexpected_files.push(found.relative_path);
                }
            }
            result.current_hash = Some(content_hash(&current_entries));
        }

        result.intact = result.modified_files.is_empty()
            && result.missing_files.is_empty()
            && result.unexpected_files.is_empty();
        Ok(result)
    }
}

fn write_entry(stage: &Path, relative_path: &str, bytes: &[u8]) -> anyhow::Result<()> {
    let path = stage.join(relative_path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, bytes)
        .with_context(|| format!("Failed to write file: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AnalysisStatus, ApprovalState, InstallStatus, SkillSource,
    };
    use chrono::Utc;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn fixture_skill(slug: &str) -> Skill {
        Skill {
            id: "skill-1".into(),
            slug: slug.into(),
            name: slug.into(),
            author: None,
            description: None,
            tags: vec![],
            source: SkillSource::Manual,
            remote_id: None,
            is_public: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn fixture_version(folder: Option<&Path>) -> SkillVersion {
        SkillVersion {
            id: "version-1".into(),
            skill_id: "skill-1".into(),
            version: "1.0.0".into(),
            folder_path: folder.map(|p| p.display().to_string()),
            content_hash: String::new(),
            hash_updated_at: None,
            approval: ApprovalState::Approved,
            approved_at: None,
            trusted: false,
            analysis_status: AnalysisStatus::Pending,
            analysis_json: None,
            analyzed_at: None,
            required_bins: vec![],
            required_env: vec![],
            extracted_commands: vec![],
            metadata_json: None,
        }
    }

    fn fixture_installation() -> SkillInstallation {
        SkillInstallation {
            id: "inst-1".into(),
            skill_version_id: "version-1".into(),
            profile_id: None,
            target_id: None,
            user_username: None,
            status: InstallStatus::Active,
            auto_update: true,
            pinned_version: None,
            wrapper_path: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn manifest(entries: &[(&str, &[u8])]) -> Vec<SkillFile> {
        entries
            .iter()
            .enumerate()
            .map(|(i, (path, bytes))| SkillFile {
                id: format!("file-{i}"),
                skill_version_id: "version-1".into(),
                relative_path: path.to_string(),
                file_hash: crate::fs::sha256_hex(bytes),
                size_bytes: bytes.len() as u64,
            })
            .collect()
    }

    #[test]
    fn deploys_from_file_contents_map() {
        let tmp = TempDir::new().unwrap();
        let adapter = WorkspaceDeployAdapter::new(tmp.path().join("deploy")).unwrap();
        let skill = fixture_skill("hello");
        let version = fixture_version(None);
        let installation = fixture_installation();
        let files = manifest(&[("SKILL.md", b"# Hello\n")]);

        let mut contents = HashMap::new();
        contents.insert("SKILL.md".to_string(), b"# Hello\n".to_vec());

        let outcome = adapter
            .deploy(&DeployContext {
                skill: &skill,
                version: &version,
                files: &files,
                installation: &installation,
                file_contents: Some(&contents),
            })
            .unwrap();

        assert_eq!(
            fs::read(outcome.deployed_path.join("SKILL.md")).unwrap(),
            b"# Hello\n"
        );
    }

    #[test]
    fn integrity_reports_exact_diff() {
        let tmp = TempDir::new().unwrap();
        let adapter = WorkspaceDeployAdapter::new(tmp.path().join("deploy")).unwrap();
        let skill = fixture_skill("hello");
        let version = fixture_version(None);
        let installation = fixture_installation();
        let files = manifest(&[("SKILL.md", b"# Hello\n"), ("run.sh", b"echo hi\n")]);

        let mut contents = HashMap::new();
        contents.insert("SKILL.md".to_string(), b"# Hello\n".to_vec());
        contents.insert("run.sh".to_string(), b"echo hi\n".to_vec());
        adapter
            .deploy(&DeployContext {
                skill: &skill,
                version: &version,
                files: &files,
                installation: &installation,
                file_contents: Some(&contents),
            })
            .unwrap();

        let intact = adapter
            .check_integrity(&installation, &version, &skill, &files)
            .unwrap();
        assert!(intact.intact);

        let dir = adapter.deploy_root().join("hello");
        fs::write(dir.join("SKILL.md"), "# HACKED\n").unwrap();
        fs::remove_file(dir.join("run.sh")).unwrap();
        fs::write(dir.join("extra.txt"), "surprise").unwrap();

        let result = adapter
            .check_integrity(&installation, &version, &skill, &files)
            .unwrap();
        assert!(!result.intact);
        assert_eq!(result.modified_files, vec!["SKILL.md"]);
        assert_eq!(result.missing_files, vec!["run.sh"]);
        assert_eq!(result.unexpected_files, vec!["extra.txt"]);
    }

    #[test]
    fn wrapper_is_written_and_removed() {
        let tmp = TempDir::new().unwrap();
        let adapter = WorkspaceDeployAdapter::new(tmp.path().join("deploy"))
            .unwrap()
            .with_bin_dir(tmp.path().join("bin"))
            .unwrap();
        let skill = fixture_skill("hello");
        let version = fixture_version(None);
        let mut installation = fixture_installation();
        let files = manifest(&[("SKILL.md", b"# Hello\n")]);

        let mut contents = HashMap::new();
        contents.insert("SKILL.md".to_string(), b"# Hello\n".to_vec());
        let outcome = adapter
            .deploy(&DeployContext {
                skill: &skill,
                version: &version,
                files: &files,
                installation: &installation,
                file_contents: Some(&contents),
            })
            .unwrap();

        let wrapper = outcome.wrapper_path.clone().expect("wrapper expected");
        assert!(wrapper.is_file());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&wrapper).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }

        installation.wrapper_path = Some(wrapper.display().to_string());
        adapter.undeploy(&installation, &version, &skill).unwrap();
        assert!(!wrapper.exists());
        assert!(!adapter.deploy_root().join("hello").exists());
    }
}
