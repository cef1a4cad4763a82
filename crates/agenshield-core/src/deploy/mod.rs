//! Deploy adapters and the deploy service.
//!
//! An adapter materializes a skill version into its target namespace and
//! can audit that namespace against the registered manifest. The service
//! selects the adapter, feeds it verified backup bytes when the source
//! folder is unusable, and reconciles hashes for adapters that rewrite
//! content during deploy.

pub mod workspace;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backup::BackupStore;
use crate::error::{Result, ShieldError};
use crate::events::{DeployEvent, EventBus, LifecycleEvent, UndeployEvent};
use crate::repo::Repository;
use crate::types::{InstallStatus, Skill, SkillFile, SkillInstallation, SkillVersion};

pub use workspace::WorkspaceDeployAdapter;

/// Everything an adapter needs to materialize one version.
///
/// When `file_contents` is present it is the authoritative byte source
/// (typically the verified backup) and adapters must prefer it over
/// reading `version.folder_path`.
pub struct DeployContext<'a> {
    pub skill: &'a Skill,
    pub version: &'a SkillVersion,
    pub files: &'a [SkillFile],
    pub installation: &'a SkillInstallation,
    pub file_contents: Option<&'a HashMap<String, Vec<u8>>>,
}

#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub deployed_path: PathBuf,
    pub deployed_hash: String,
    pub wrapper_path: Option<PathBuf>,
}

/// Outcome of auditing a deployment against the registered manifest.
///
/// A manifest file is `missing` when absent on disk, `modified` when its
/// SHA-256 differs from the registered hash; any on-disk file outside the
/// manifest is `unexpected`. `intact` is the conjunction.
#[derive(Debug, Clone, Default)]
pub struct IntegrityCheckResult {
    pub intact: bool,
    pub modified_files: Vec<String>,
    pub missing_files: Vec<String>,
    pub unexpected_files: Vec<String>,
    pub current_hash: Option<String>,
    pub expected_hash: Option<String>,
}

/// Pluggable writer for one deployment target family.
pub trait DeployAdapter: Send + Sync {
    fn id(&self) -> &str;

    fn display_name(&self) -> &str;

    /// Whether this adapter serves the given profile. The default adapter
    /// answers true for an absent profile.
    fn can_deploy(&self, profile_id: Option<&str>) -> bool;

    fn deploy(&self, ctx: &DeployContext<'_>) -> anyhow::Result<DeployOutcome>;

    fn undeploy(
        &self,
        installation: &SkillInstallation,
        version: &SkillVersion,
        skill: &Skill,
    ) -> anyhow::Result<()>;

    fn check_integrity(
        &self,
        installation: &SkillInstallation,
        version: &SkillVersion,
        skill: &Skill,
        files: &[SkillFile],
    ) -> anyhow::Result<IntegrityCheckResult>;
}

pub struct DeployService {
    repo: Arc<Repository>,
    backup: Option<Arc<BackupStore>>,
    adapters: Vec<Arc<dyn DeployAdapter>>,
    bus: EventBus,
}

impl DeployService {
    pub fn new(
        repo: Arc<Repository>,
        backup: Option<Arc<BackupStore>>,
        adapters: Vec<Arc<dyn DeployAdapter>>,
        bus: EventBus,
    ) -> Self {
        Self {
            repo,
            backup,
            adapters,
            bus,
        }
    }

    /// First adapter claiming the profile, or none.
    pub fn adapter_for(&self, profile_id: Option<&str>) -> Option<Arc<dyn DeployAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.can_deploy(profile_id))
            .cloned()
    }

    /// Materialize `version` for `installation`. Returns `None` when no
    /// adapter claims the installation's profile.
    ///
    /// When `file_contents` is absent and the source folder is missing or
    /// incomplete, verified backup bytes are substituted. After the
    /// adapter runs, every deployed file is re-hashed and divergences are
    /// reconciled into the repository so later integrity checks compare
    /// against what the adapter actually wrote.
    pub fn deploy(
        &self,
        installation: &SkillInstallation,
        version: &SkillVersion,
        skill: &Skill,
        file_contents: Option<HashMap<String, Vec<u8>>>,
    ) -> Result<Option<DeployOutcome>> {
        let Some(adapter) = self.adapter_for(installation.profile_id.as_deref()) else {
            debug!(
                slug = %skill.slug,
                profile = ?installation.profile_id,
                "no deploy adapter for profile, skipping"
            );
            return Ok(None);
        };

        let files = self.repo.get_files(&version.id)?;
        let file_contents = match file_contents {
            Some(contents) => Some(contents),
            None => self.backup_contents_if_needed(version, &files)?,
        };

        let operation_id = uuid::Uuid::new_v4().to_string();
        self.bus.publish(LifecycleEvent::Deploy(DeployEvent::Started {
            operation_id: operation_id.clone(),
            installation_id: installation.id.clone(),
            adapter_id: adapter.id().to_string(),
            slug: skill.slug.clone(),
        }));

        let ctx = DeployContext {
            skill,
            version,
            files: &files,
            installation,
            file_contents: file_contents.as_ref(),
        };

        let outcome = match adapter.deploy(&ctx) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.bus.publish(LifecycleEvent::Deploy(DeployEvent::Error {
                    operation_id,
                    installation_id: installation.id.clone(),
                    slug: skill.slug.clone(),
                    error: err.to_string(),
                }));
                return Err(ShieldError::Other(err));
            }
        };

        let deployed_hash =
            match self.reconcile_hashes(version, &files, &outcome.deployed_path) {
                Ok(hash) => hash,
                Err(err) => {
                    self.bus.publish(LifecycleEvent::Deploy(DeployEvent::Error {
                        operation_id,
                        installation_id: installation.id.clone(),
                        slug: skill.slug.clone(),
                        error: err.to_string(),
                    }));
                    return Err(err);
                }
            };

        self.bus
            .publish(LifecycleEvent::Deploy(DeployEvent::Completed {
                operation_id,
                installation_id: installation.id.clone(),
                adapter_id: adapter.id().to_string(),
                slug: skill.slug.clone(),
                deployed_path: outcome.deployed_path.display().to_string(),
                deployed_hash: deployed_hash.clone(),
            }));

        Ok(Some(DeployOutcome {
            deployed_hash,
            ..outcome
        }))
    }

    pub fn undeploy(
        &self,
        installation: &SkillInstallation,
        version: &SkillVersion,
        skill: &Skill,
    ) -> Result<()> {
        let Some(adapter) = self.adapter_for(installation.profile_id.as_deref()) else {
            return Ok(());
        };

        let operation_id = uuid::Uuid::new_v4().to_string();
        self.bus
            .publish(LifecycleEvent::Undeploy(UndeployEvent::Started {
                operation_id: operation_id.clone(),
                installation_id: installation.id.clone(),
                slug: skill.slug.clone(),
            }));

        if let Err(err) = adapter.undeploy(installation, version, skill) {
            self.bus
                .publish(LifecycleEvent::Undeploy(UndeployEvent::Error {
                    operation_id,
                    installation_id: installation.id.clone(),
                    slug: skill.slug.clone(),
                    error: err.to_string(),
                }));
            return Err(ShieldError::Other(err));
        }

        self.bus
            .publish(LifecycleEvent::Undeploy(UndeployEvent::Completed {
                operation_id,
                installation_id: installation.id.clone(),
                slug: skill.slug.clone(),
            }));
        Ok(())
    }

    /// Audit one installation. `None` when no adapter claims it.
    pub fn check_integrity(
        &self,
        installation: &SkillInstallation,
    ) -> Result<Option<IntegrityCheckResult>> {
        let Some(adapter) = self.adapter_for(installation.profile_id.as_deref()) else {
            return Ok(None);
        };
        let (skill, version, installation) = self.repo.resolve_installation(&installation.id)?;
        let files = self.repo.get_files(&version.id)?;
        let result = adapter
            .check_integrity(&installation, &version, &skill, &files)
            .map_err(ShieldError::Other)?;
        Ok(Some(result))
    }

    /// Audit every active installation.
    pub fn check_all_integrity(
        &self,
    ) -> Result<Vec<(SkillInstallation, IntegrityCheckResult)>> {
        let mut out = Vec::new();
        for installation in self.repo.get_active_installations()? {
            debug_assert_eq!(installation.status, InstallStatus::Active);
            match self.check_integrity(&installation) {
                Ok(Some(result)) => out.push((installation, result)),
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        installation = %installation.id,
                        error = %err,
                        "integrity check failed"
                    );
                }
            }
        }
        Ok(out)
    }

    /// Verified backup bytes when the source folder cannot serve a deploy.
    fn backup_contents_if_needed(
        &self,
        version: &SkillVersion,
        files: &[SkillFile],
    ) -> Result<Option<HashMap<String, Vec<u8>>>> {
        let Some(backup) = &self.backup else {
            return Ok(None);
        };
        if !backup.has_backup(&version.id) {
            return Ok(None);
        }
        if source_folder_complete(version, files) {
            return Ok(None);
        }
        Ok(Some(backup.load_files(&version.id, files)?))
    }

    /// Re-hash what the adapter wrote and fold divergences back into the
    /// manifest, then recompute the version's content hash. Without this,
    /// an adapter that legitimately rewrites content on deploy would turn
    /// every later integrity check into a false violation.
    fn reconcile_hashes(
        &self,
        version: &SkillVersion,
        files: &[SkillFile],
        deployed_path: &std::path::Path,
    ) -> Result<String> {
        let mut divergent = false;
        for file in files {
            let on_disk = deployed_path.join(&file.relative_path);
            if !on_disk.is_file() {
                continue;
            }
            let (hash, size) = crate::fs::hash_file(&on_disk)?;
            if hash != file.file_hash {
                self.repo.update_file_hash(&file.id, &hash, size)?;
                divergent = true;
            }
        }
        if divergent {
            self.repo.recompute_content_hash(&version.id)
        } else {
            Ok(version.content_hash.clone())
        }
    }
}

fn source_folder_complete(version: &SkillVersion, files: &[SkillFile]) -> bool {
    let Some(folder) = &version.folder_path else {
        return false;
    };
    let root = std::path::Path::new(folder);
    if !root.is_dir() {
        return false;
    }
    files
        .iter()
        .all(|f| root.join(&f.relative_path).is_file())
}
