//! Update checking and propagation for marketplace-tracked skills.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backup::BackupStore;
use crate::deploy::DeployService;
use crate::error::{Result, ShieldError};
use crate::events::{EventBus, LifecycleEvent, UpdateEvent};
use crate::lifecycle::upload::{UploadRequest, UploadService};
use crate::remote::MarketplaceClient;
use crate::repo::Repository;
use crate::types::{ApprovalState, SkillSource};
use crate::watcher::Suppressor;

/// One skill whose remote latest differs from the local latest and which
/// has at least one installation following updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCheckResult {
    pub skill_id: String,
    pub slug: String,
    pub remote_id: String,
    pub current_version: Option<String>,
    pub latest_version: String,
}

pub struct UpdateService {
    repo: Arc<Repository>,
    deploy: Arc<DeployService>,
    backup: Option<Arc<BackupStore>>,
    upload: Arc<UploadService>,
    remote: Option<Arc<dyn MarketplaceClient>>,
    suppressor: Suppressor,
    bus: EventBus,
}

impl UpdateService {
    pub fn new(
        repo: Arc<Repository>,
        deploy: Arc<DeployService>,
        backup: Option<Arc<BackupStore>>,
        upload: Arc<UploadService>,
        remote: Option<Arc<dyn MarketplaceClient>>,
        suppressor: Suppressor,
        bus: EventBus,
    ) -> Self {
        Self {
            repo,
            deploy,
            backup,
            upload,
            remote,
            suppressor,
            bus,
        }
    }

    /// Ask the marketplace for every tracked skill's latest version and
    /// report the ones with a pending update. Per-skill failures are
    /// logged and skipped, never fatal for the sweep.
    pub async fn check_updates(&self) -> Result<Vec<UpdateCheckResult>> {
        let client = self.require_client()?;
        let operation_id = uuid::Uuid::new_v4().to_string();
        self.bus
            .publish(LifecycleEvent::Update(UpdateEvent::Checking {
                operation_id: operation_id.clone(),
            }));

        let mut pending = Vec::new();
        for skill in self.repo.get_remote_tracked()? {
            let Some(remote_id) = skill.remote_id.clone() else {
                continue;
            };
            let latest = match client.get_latest_version(&remote_id).await {
                Ok(latest) => latest,
                Err(err) => {
                    warn!(slug = %skill.slug, error = %err, "update check failed");
                    continue;
                }
            };
            let current = self.repo.get_latest_version(&skill.id)?;
            let current_version = current.map(|v| v.version);
            if current_version.as_deref() == Some(latest.as_str()) {
                continue;
            }
            if self.repo.get_auto_updatable(&skill.id)?.is_empty() {
                continue;
            }

            self.bus.publish(LifecycleEvent::Update(UpdateEvent::Found {
                operation_id: operation_id.clone(),
                slug: skill.slug.clone(),
                current_version: current_version.clone(),
                latest_version: latest.clone(),
            }));
            pending.push(UpdateCheckResult {
                skill_id: skill.id.clone(),
                slug: skill.slug.clone(),
                remote_id,
                current_version,
                latest_version: latest,
            });
        }
        Ok(pending)
    }

    /// Download and record each pending update, repoint every
    /// auto-updatable installation, and redeploy it under suppression so
    /// the on-disk tree matches the new manifest before the watcher looks.
    pub async fn apply_pending_updates(&self) -> Result<usize> {
        let client = self.require_client()?;
        let operation_id = uuid::Uuid::new_v4().to_string();
        let pending = self.check_updates().await?;

        let mut applied = 0;
        for update in pending {
            self.bus
                .publish(LifecycleEvent::Update(UpdateEvent::Applying {
                    operation_id: operation_id.clone(),
                    slug: update.slug.clone(),
                }));

            let result = self.apply_one(client.as_ref(), &update).await;
            match result {
                Ok(new_version_id) => {
                    applied += 1;
                    self.bus
                        .publish(LifecycleEvent::Update(UpdateEvent::SkillDone {
                            operation_id: operation_id.clone(),
                            slug: update.slug.clone(),
                            new_version_id,
                        }));
                }
                Err(err) => {
                    warn!(slug = %update.slug, error = %err, "update failed");
                    self.bus.publish(LifecycleEvent::Update(UpdateEvent::Error {
                        operation_id: operation_id.clone(),
                        error: format!("{}: {err}", update.slug),
                    }));
                }
            }
        }

        self.bus
            .publish(LifecycleEvent::Update(UpdateEvent::Completed {
                operation_id,
                applied,
            }));
        Ok(applied)
    }

    async fn apply_one(
        &self,
        client: &dyn MarketplaceClient,
        update: &UpdateCheckResult,
    ) -> Result<String> {
        let files = client
            .download_version(&update.remote_id, &update.latest_version)
            .await?;

        let skill = self
            .repo
            .get_by_id(&update.skill_id)?
            .ok_or_else(|| ShieldError::SkillNotFound(update.skill_id.clone()))?;

        let (_, version) = self.upload.upload(UploadRequest {
            name: skill.name.clone(),
            slug: skill.slug.clone(),
            version: update.latest_version.clone(),
            files,
            source: SkillSource::Marketplace,
            remote_id: Some(update.remote_id.clone()),
            trusted: false,
            approval: ApprovalState::Unknown,
            folder_path: None,
            metadata_json: None,
        })?;

        for installation in self.repo.get_auto_updatable(&update.skill_id)? {
            self.repo
                .update_installation_version(&installation.id, &version.id)?;

            // Redeploy so the deployed tree matches the new manifest;
            // otherwise the next integrity pass reports a false violation.
            let contents = match &self.backup {
                Some(backup) if backup.has_backup(&version.id) => {
                    let manifest = self.repo.get_files(&version.id)?;
                    Some(backup.load_files(&version.id, &manifest)?)
                }
                _ => None,
            };

            let (skill, version, installation) =
                self.repo.resolve_installation(&installation.id)?;
            self.suppressor.suppress(&skill.slug);
            let deployed = self.deploy.deploy(&installation, &version, &skill, contents);
            self.suppressor.unsuppress(&skill.slug);
            deployed?;
        }

        info!(slug = %update.slug, version = %update.latest_version, "update applied");
        Ok(version.id)
    }

    fn require_client(&self) -> Result<Arc<dyn MarketplaceClient>> {
        self.remote
            .clone()
            .ok_or_else(|| ShieldError::Other(anyhow::anyhow!("no marketplace client configured")))
    }
}
