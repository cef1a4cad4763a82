//! Install orchestration: resolve a (skill, version) pair, locally or
//! from the marketplace, then create the installation, deploy, activate.

use std::sync::Arc;

use tracing::{info, warn};

use crate::analyze::AnalyzeService;
use crate::deploy::DeployService;
use crate::error::{Result, ShieldError};
use crate::events::{DownloadEvent, EventBus, InstallEvent, LifecycleEvent};
use crate::lifecycle::upload::{UploadRequest, UploadService};
use crate::remote::MarketplaceClient;
use crate::repo::{NewInstallation, Repository};
use crate::types::{ApprovalState, InstallStatus, Skill, SkillInstallation, SkillSource, SkillVersion};
use crate::watcher::Suppressor;

#[derive(Debug, Clone, Default)]
pub struct InstallRequest {
    /// Marketplace reference; when set, the skill and version are fetched
    /// and ingested on demand.
    pub remote_id: Option<String>,
    /// Local skill id; exclusive with `remote_id`.
    pub skill_id: Option<String>,
    /// Specific version string; latest when absent.
    pub version: Option<String>,
    pub profile_id: Option<String>,
    pub target_id: Option<String>,
    pub user_username: Option<String>,
    pub auto_update: bool,
}

impl InstallRequest {
    pub fn local(skill_id: impl Into<String>) -> Self {
        Self {
            skill_id: Some(skill_id.into()),
            auto_update: true,
            ..Default::default()
        }
    }

    pub fn remote(remote_id: impl Into<String>) -> Self {
        Self {
            remote_id: Some(remote_id.into()),
            auto_update: true,
            ..Default::default()
        }
    }
}

pub struct InstallService {
    repo: Arc<Repository>,
    deploy: Arc<DeployService>,
    upload: Arc<UploadService>,
    remote: Option<Arc<dyn MarketplaceClient>>,
    analyze: Option<Arc<AnalyzeService>>,
    suppressor: Suppressor,
    bus: EventBus,
}

impl InstallService {
    pub fn new(
        repo: Arc<Repository>,
        deploy: Arc<DeployService>,
        upload: Arc<UploadService>,
        remote: Option<Arc<dyn MarketplaceClient>>,
        analyze: Option<Arc<AnalyzeService>>,
        suppressor: Suppressor,
        bus: EventBus,
    ) -> Self {
        Self {
            repo,
            deploy,
            upload,
            remote,
            analyze,
            suppressor,
            bus,
        }
    }

    pub fn suppressor(&self) -> Suppressor {
        self.suppressor.clone()
    }

    /// Redeploy an existing installation, preferring verified backup
    /// bytes. Callers bracket this with suppression.
    pub fn redeploy(
        &self,
        installation: &SkillInstallation,
        version: &SkillVersion,
        skill: &Skill,
    ) -> Result<()> {
        self.deploy.deploy(installation, version, skill, None)?;
        Ok(())
    }

    pub async fn install(&self, request: InstallRequest) -> Result<SkillInstallation> {
        let operation_id = uuid::Uuid::new_v4().to_string();

        // The resolved slug is only known after lookup; the started event
        // carries the identifier the caller asked for.
        let requested = request
            .remote_id
            .clone()
            .or(request.skill_id.clone())
            .unwrap_or_default();
        self.bus
            .publish(LifecycleEvent::Install(InstallEvent::Started {
                operation_id: operation_id.clone(),
                slug: requested.clone(),
            }));

        let (skill, version) = match self.resolve(&operation_id, &request).await {
            Ok(pair) => pair,
            Err(err) => {
                self.bus.publish(LifecycleEvent::Install(InstallEvent::Error {
                    operation_id,
                    slug: requested,
                    error: err.to_string(),
                }));
                return Err(err);
            }
        };

        match self
            .create_and_deploy(&operation_id, &request, &skill, &version)
            .await
        {
            Ok(installation) => {
                self.bus
                    .publish(LifecycleEvent::Install(InstallEvent::Completed {
                        operation_id,
                        slug: skill.slug.clone(),
                        installation_id: installation.id.clone(),
                    }));
                info!(slug = %skill.slug, installation = %installation.id, "skill installed");
                Ok(installation)
            }
            Err(err) => {
                self.bus.publish(LifecycleEvent::Install(InstallEvent::Error {
                    operation_id,
                    slug: skill.slug.clone(),
                    error: err.to_string(),
                }));
                Err(err)
            }
        }
    }

    /// Resolve the (skill, version) to install, ingesting from the
    /// marketplace when the request names a remote id.
    async fn resolve(
        &self,
        operation_id: &str,
        request: &InstallRequest,
    ) -> Result<(Skill, SkillVersion)> {
        if let Some(remote_id) = &request.remote_id {
            return self.resolve_remote(operation_id, remote_id, request).await;
        }

        let skill_id = request.skill_id.as_deref().ok_or_else(|| {
            ShieldError::Other(anyhow::anyhow!(
                "install request needs either remote_id or skill_id"
            ))
        })?;
        let skill = self
            .repo
            .get_by_id(skill_id)?
            .ok_or_else(|| ShieldError::SkillNotFound(skill_id.to_string()))?;

        let version = match &request.version {
            Some(version) => self
                .repo
                .get_version(&skill.id, version)?
                .ok_or_else(|| ShieldError::VersionNotFound(version.clone()))?,
            None => self
                .repo
                .get_latest_version(&skill.id)?
                .ok_or_else(|| ShieldError::VersionNotFound(skill.slug.clone()))?,
        };
        Ok((skill, version))
    }

    async fn resolve_remote(
        &self,
        operation_id: &str,
        remote_id: &str,
        request: &InstallRequest,
    ) -> Result<(Skill, SkillVersion)> {
        let client = self.remote.as_ref().ok_or_else(|| {
            ShieldError::Other(anyhow::anyhow!("no marketplace client configured"))
        })?;

        let descriptor = client.get_skill(remote_id).await?;
        let wanted = request
            .version
            .clone()
            .unwrap_or_else(|| descriptor.latest_version.clone());

        // Reuse an already-ingested version when present.
        if let Some(skill) = self.repo.get_by_remote_id(remote_id)? {
            if let Some(version) = self.repo.get_version(&skill.id, &wanted)? {
                return Ok((skill, version));
            }
        }

        self.bus
            .publish(LifecycleEvent::Install(InstallEvent::Downloading {
                operation_id: operation_id.to_string(),
                slug: descriptor.slug.clone(),
            }));
        self.bus
            .publish(LifecycleEvent::Download(DownloadEvent::Started {
                operation_id: operation_id.to_string(),
                remote_id: remote_id.to_string(),
            }));
        let files = match client.download_version(remote_id, &wanted).await {
            Ok(files) => {
                self.bus
                    .publish(LifecycleEvent::Download(DownloadEvent::Completed {
                        operation_id: operation_id.to_string(),
                        remote_id: remote_id.to_string(),
                        file_count: files.len(),
                    }));
                files
            }
            Err(err) => {
                self.bus
                    .publish(LifecycleEvent::Download(DownloadEvent::Error {
                        operation_id: operation_id.to_string(),
                        remote_id: remote_id.to_string(),
                        error: err.to_string(),
                    }));
                return Err(err);
            }
        };

        self.bus
            .publish(LifecycleEvent::Install(InstallEvent::Registering {
                operation_id: operation_id.to_string(),
                slug: descriptor.slug.clone(),
            }));
        let (skill, version) = self.upload.upload(UploadRequest {
            name: descriptor.name.clone(),
            slug: descriptor.slug.clone(),
            version: wanted,
            files,
            source: SkillSource::Marketplace,
            remote_id: Some(remote_id.to_string()),
            trusted: false,
            approval: ApprovalState::Unknown,
            folder_path: None,
            metadata_json: None,
        })?;

        if let Some(analyze) = &self.analyze {
            self.bus
                .publish(LifecycleEvent::Install(InstallEvent::Analyzing {
                    operation_id: operation_id.to_string(),
                    slug: skill.slug.clone(),
                }));
            if let Err(err) = analyze.analyze_version(&version.id).await {
                warn!(version = %version.id, error = %err, "analysis during install failed");
            }
        }

        Ok((skill, version))
    }

    /// Create the pending installation, deploy, and activate. Pre-deploy
    /// failures delete the row; deploy failures leave it `disabled`.
    async fn create_and_deploy(
        &self,
        operation_id: &str,
        request: &InstallRequest,
        skill: &Skill,
        version: &SkillVersion,
    ) -> Result<SkillInstallation> {
        self.bus
            .publish(LifecycleEvent::Install(InstallEvent::Creating {
                operation_id: operation_id.to_string(),
                slug: skill.slug.clone(),
            }));

        let installation = self.repo.install(NewInstallation {
            skill_version_id: version.id.clone(),
            status: InstallStatus::Pending,
            auto_update: request.auto_update,
            profile_id: request.profile_id.clone(),
            target_id: request.target_id.clone(),
            user_username: request.user_username.clone(),
        })?;

        self.suppressor.suppress(&skill.slug);
        let result = (|| {
            match self.deploy.deploy(&installation, version, skill, None) {
                Ok(outcome) => {
                    if let Some(outcome) = &outcome {
                        if let Some(wrapper) = &outcome.wrapper_path {
                            self.repo.update_wrapper_path(
                                &installation.id,
                                Some(&wrapper.display().to_string()),
                            )?;
                        }
                    }
                    self.repo
                        .update_installation_status(&installation.id, InstallStatus::Active)?;
                    self.repo
                        .get_installation_by_id(&installation.id)?
                        .ok_or_else(|| ShieldError::InstallationNotFound(installation.id.clone()))
                }
                Err(err) => {
                    self.repo
                        .update_installation_status(&installation.id, InstallStatus::Disabled)?;
                    Err(err)
                }
            }
        })();
        self.suppressor.unsuppress(&skill.slug);
        result
    }
}
