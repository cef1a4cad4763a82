//! Sync sources and the per-source reconciliation loop.
//!
//! A source adapter reports the skills a target should have; the
//! orchestrator converges the installed set to it: install what is new,
//! re-ingest on content-hash change, and remove orphans the source no
//! longer names.

pub mod dir_source;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, ShieldError};
use crate::events::{EventBus, LifecycleEvent, SkillEvent, SyncEvent};
use crate::lifecycle::install::{InstallRequest, InstallService};
use crate::lifecycle::uninstall::UninstallService;
use crate::lifecycle::upload::{UploadRequest, UploadService};
use crate::repo::Repository;
use crate::types::{ApprovalState, FileEntry, SkillSource};

/// One skill as a sync source defines it. `sha` is the canonical content
/// hash (SHA-256 over the per-file hashes sorted by path) so
/// adapter-reported identity matches stored identity bit-for-bit.
#[derive(Debug, Clone)]
pub struct SkillDefinition {
    pub skill_id: String,
    pub name: String,
    pub description: Option<String>,
    pub version: String,
    pub sha: String,
    pub files: Vec<FileEntry>,
    pub trusted: bool,
}

impl SkillDefinition {
    /// Compute the canonical `sha` for a file set.
    pub fn content_sha(files: &[FileEntry]) -> String {
        let entries: Vec<(String, String)> = files
            .iter()
            .map(|f| (f.relative_path.clone(), crate::fs::sha256_hex(&f.bytes)))
            .collect();
        crate::fs::content_hash(&entries)
    }
}

/// Adapter over one provisioning source (integration, git checkout,
/// config directory, ...).
#[async_trait]
pub trait SkillSourceAdapter: Send + Sync {
    fn id(&self) -> &str;

    async fn is_available(&self) -> bool;

    /// The desired skill set for a target.
    async fn get_skills_for(&self, target: &str) -> anyhow::Result<Vec<SkillDefinition>>;

    /// Files of a single skill, for sources that can serve them lazily.
    async fn get_skill_files(&self, skill_id: &str) -> anyhow::Result<Vec<FileEntry>> {
        let _ = skill_id;
        Ok(Vec::new())
    }

    /// Binaries the source expects on the target.
    async fn get_bins(&self, target: &str) -> anyhow::Result<Vec<String>> {
        let _ = target;
        Ok(Vec::new())
    }

    /// Tool descriptors the source contributes.
    async fn get_tools(&self, target: &str) -> anyhow::Result<Vec<serde_json::Value>> {
        let _ = target;
        Ok(Vec::new())
    }

    /// Free-form instructions the source contributes.
    async fn get_instructions(&self, target: &str) -> anyhow::Result<Option<String>> {
        let _ = target;
        Ok(None)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub installed: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.installed.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    fn merge(&mut self, other: SyncReport) {
        self.installed.extend(other.installed);
        self.updated.extend(other.updated);
        self.removed.extend(other.removed);
        self.errors.extend(other.errors);
    }
}

pub struct SyncOrchestrator {
    repo: Arc<Repository>,
    upload: Arc<UploadService>,
    install: Arc<InstallService>,
    uninstall: Arc<UninstallService>,
    adapters: Vec<Arc<dyn SkillSourceAdapter>>,
    bus: EventBus,
}

impl SyncOrchestrator {
    pub fn new(
        repo: Arc<Repository>,
        upload: Arc<UploadService>,
        install: Arc<InstallService>,
        uninstall: Arc<UninstallService>,
        adapters: Vec<Arc<dyn SkillSourceAdapter>>,
        bus: EventBus,
    ) -> Self {
        Self {
            repo,
            upload,
            install,
            uninstall,
            adapters,
            bus,
        }
    }

    pub fn adapters(&self) -> &[Arc<dyn SkillSourceAdapter>] {
        &self.adapters
    }

    /// Reconcile one source against the store. Per-definition failures are
    /// collected into the report; the loop continues.
    pub async fn sync_source(&self, source_id: &str, target: &str) -> Result<SyncReport> {
        let adapter = self
            .adapters
            .iter()
            .find(|a| a.id() == source_id)
            .cloned()
            .ok_or_else(|| {
                ShieldError::Other(anyhow::anyhow!("unknown sync source: {source_id}"))
            })?;

        let operation_id = uuid::Uuid::new_v4().to_string();
        self.bus.publish(LifecycleEvent::Sync(SyncEvent::Started {
            operation_id: operation_id.clone(),
            source_id: source_id.to_string(),
        }));

        let desired = match adapter.get_skills_for(target).await {
            Ok(desired) => desired,
            Err(err) => {
                self.bus.publish(LifecycleEvent::Sync(SyncEvent::Error {
                    operation_id,
                    source_id: source_id.to_string(),
                    error: err.to_string(),
                }));
                return Err(ShieldError::Other(err));
            }
        };

        let mut report = SyncReport::default();
        let installed: HashMap<String, crate::types::Skill> = self
            .repo
            .get_integration_skills(source_id)?
            .into_iter()
            .map(|skill| (skill.slug.clone(), skill))
            .collect();

        let desired_slugs: Vec<String> =
            desired.iter().map(|def| def.skill_id.clone()).collect();

        for def in desired {
            let slug = def.skill_id.clone();
            let outcome = match installed.get(&slug) {
                None => self
                    .install_definition(source_id, target, &def)
                    .await
                    .map(|_| report.installed.push(slug.clone())),
                Some(skill) => match self.repo.get_latest_version(&skill.id) {
                    Err(err) => Err(err),
                    Ok(current) => {
                        let current_sha = current.map(|v| v.content_hash).unwrap_or_default();
                        if current_sha == def.sha {
                            Ok(())
                        } else {
                            self.update_definition(source_id, skill, &def)
                                .await
                                .map(|_| report.updated.push(slug.clone()))
                        }
                    }
                },
            };
            if let Err(err) = outcome {
                warn!(slug = %slug, error = %err, "sync entry failed");
                report.errors.push(format!("{slug}: {err}"));
            }
        }

        for (slug, skill) in &installed {
            if desired_slugs.iter().any(|s| s == slug) {
                continue;
            }
            match self.remove_skill(skill).await {
                Ok(()) => report.removed.push(slug.clone()),
                Err(err) => {
                    warn!(slug = %slug, error = %err, "sync removal failed");
                    report.errors.push(format!("{slug}: {err}"));
                }
            }
        }

        self.bus.publish(LifecycleEvent::Sync(SyncEvent::Completed {
            operation_id,
            source_id: source_id.to_string(),
            installed: report.installed.clone(),
            updated: report.updated.clone(),
            removed: report.removed.clone(),
        }));
        info!(
            source = source_id,
            installed = report.installed.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            "sync completed"
        );
        Ok(report)
    }

    /// Union of `sync_source` across every registered adapter that is
    /// currently available.
    pub async fn sync_all(&self, target: &str) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        for adapter in &self.adapters {
            if !adapter.is_available().await {
                continue;
            }
            match self.sync_source(adapter.id(), target).await {
                Ok(one) => report.merge(one),
                Err(err) => report.errors.push(format!("{}: {err}", adapter.id())),
            }
        }
        Ok(report)
    }

    async fn install_definition(
        &self,
        source_id: &str,
        target: &str,
        def: &SkillDefinition,
    ) -> Result<()> {
        let (skill, version) = self.ingest_definition(source_id, def, &def.version)?;
        let mut request = InstallRequest::local(skill.id.clone());
        request.target_id = Some(target.to_string());
        request.version = Some(version.version.clone());
        self.install.install(request).await?;
        Ok(())
    }

    /// Ingest the changed content as a new version and repoint the
    /// active installation at it (or install fresh when none exists).
    async fn update_definition(
        &self,
        source_id: &str,
        skill: &crate::types::Skill,
        def: &SkillDefinition,
    ) -> Result<()> {
        let mut version_string = def.version.clone();
        if self.repo.get_version(&skill.id, &version_string)?.is_some() {
            version_string = format!("{}-{}", version_string, &def.sha[..8]);
        }
        let (_, version) = self.ingest_definition(source_id, def, &version_string)?;

        match self.repo.get_active_installation_for_skill(&skill.id)? {
            Some(installation) => {
                self.repo
                    .update_installation_version(&installation.id, &version.id)?;
                let (skill, version, installation) =
                    self.repo.resolve_installation(&installation.id)?;
                let suppressor = self.install_suppressor();
                suppressor.suppress(&skill.slug);
                let deployed = self
                    .install
                    .redeploy(&installation, &version, &skill);
                suppressor.unsuppress(&skill.slug);
                deployed?;
            }
            None => {
                let mut request = InstallRequest::local(skill.id.clone());
                request.version = Some(version.version.clone());
                self.install.install(request).await?;
            }
        }
        Ok(())
    }

    fn ingest_definition(
        &self,
        source_id: &str,
        def: &SkillDefinition,
        version_string: &str,
    ) -> Result<(crate::types::Skill, crate::types::SkillVersion)> {
        let (skill, version) = self.upload.upload(UploadRequest {
            name: def.name.clone(),
            slug: def.skill_id.clone(),
            version: version_string.to_string(),
            files: def.files.clone(),
            source: SkillSource::Integration,
            remote_id: Some(source_id.to_string()),
            trusted: def.trusted,
            approval: ApprovalState::Unknown,
            folder_path: None,
            metadata_json: None,
        })?;
        if def.trusted {
            self.repo.approve_version(&version.id)?;
        }
        Ok((skill, version))
    }

    async fn remove_skill(&self, skill: &crate::types::Skill) -> Result<()> {
        for version in self.repo.get_versions(&skill.id)? {
            for installation in self.repo.get_installations(Some(&version.id))? {
                self.uninstall.uninstall(&installation.id).await?;
            }
        }
        self.repo.delete_skill(&skill.id)?;
        self.bus.publish(LifecycleEvent::Skill(SkillEvent::Deleted {
            skill_id: skill.id.clone(),
            slug: skill.slug.clone(),
        }));
        Ok(())
    }

    fn install_suppressor(&self) -> crate::watcher::Suppressor {
        self.install.suppressor()
    }
}
