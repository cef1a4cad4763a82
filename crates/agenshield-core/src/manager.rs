//! Manager façade: one object wiring the repository, services, adapters,
//! watcher, and event bridge. Public methods are thin delegations.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::analyze::{AnalyzeAdapter, AnalyzeService, MetadataAnalyzer, RemoteAnalyzer};
use crate::backup::BackupStore;
use crate::config::ShieldConfig;
use crate::deploy::{DeployAdapter, DeployService, WorkspaceDeployAdapter};
use crate::error::Result;
use crate::events::bridge::{spawn_bridge, PublicEvent};
use crate::events::{EventBus, EventReceiver};
use crate::lifecycle::{
    InstallRequest, InstallService, UninstallService, UpdateCheckResult, UpdateService,
    UploadRequest, UploadService,
};
use crate::remote::{HttpMarketplaceClient, MarketplaceClient};
use crate::repo::Repository;
use crate::sync::{SkillSourceAdapter, SyncOrchestrator, SyncReport};
use crate::types::{
    AnalysisResult, Skill, SkillInstallation, SkillSource, SkillVersion,
};
use crate::vault::{ConfigIntegrity, CONFIG_HMAC_META_KEY};
use crate::watcher::{IntegrityWatcher, Suppressor, WatcherOptions};

pub struct ShieldManagerOptions {
    pub config: ShieldConfig,
    /// Deploy adapters; a workspace adapter over the configured deploy
    /// root when empty.
    pub deploy_adapters: Vec<Arc<dyn DeployAdapter>>,
    /// Analyze adapters; metadata (plus remote when an analyzer URL is
    /// configured) when empty.
    pub analyze_adapters: Vec<Arc<dyn AnalyzeAdapter>>,
    pub source_adapters: Vec<Arc<dyn SkillSourceAdapter>>,
    /// Marketplace client; an HTTP client over the configured URL when
    /// unset.
    pub marketplace: Option<Arc<dyn MarketplaceClient>>,
    /// Bridge internal events onto this external channel.
    pub external_bus: Option<broadcast::Sender<PublicEvent>>,
    pub auto_start_watcher: bool,
}

impl ShieldManagerOptions {
    pub fn new(config: ShieldConfig) -> Self {
        Self {
            config,
            deploy_adapters: Vec::new(),
            analyze_adapters: Vec::new(),
            source_adapters: Vec::new(),
            marketplace: None,
            external_bus: None,
            auto_start_watcher: false,
        }
    }
}

pub struct ShieldManager {
    repo: Arc<Repository>,
    backup: Arc<BackupStore>,
    bus: EventBus,
    upload: Arc<UploadService>,
    install: Arc<InstallService>,
    uninstall: Arc<UninstallService>,
    update: Arc<UpdateService>,
    analyze: Arc<AnalyzeService>,
    sync: Arc<SyncOrchestrator>,
    watcher: IntegrityWatcher,
    bridge_task: Option<JoinHandle<()>>,
}

impl ShieldManager {
    pub fn new(options: ShieldManagerOptions) -> Result<Self> {
        let config = options.config;

        let repo = Arc::new(Repository::new(config.db_path())?);
        let backup = Arc::new(BackupStore::new(config.backup_dir())?);
        let bus = EventBus::default();
        let suppressor = Suppressor::new(config.debounce());

        let deploy_adapters = if options.deploy_adapters.is_empty() {
            let mut adapter = WorkspaceDeployAdapter::new(config.deploy_root())?;
            if let Some(bin_dir) = &config.bin_dir {
                adapter = adapter.with_bin_dir(bin_dir)?;
            }
            vec![Arc::new(adapter) as Arc<dyn DeployAdapter>]
        } else {
            options.deploy_adapters
        };
        let deploy = Arc::new(DeployService::new(
            Arc::clone(&repo),
            Some(Arc::clone(&backup)),
            deploy_adapters,
            bus.clone(),
        ));

        let analyze_adapters = if options.analyze_adapters.is_empty() {
            let mut adapters: Vec<Arc<dyn AnalyzeAdapter>> =
                vec![Arc::new(MetadataAnalyzer::new())];
            if let Some(analyzer_url) = &config.analyzer_url {
                adapters.push(Arc::new(RemoteAnalyzer::new(analyzer_url.clone())));
            }
            adapters
        } else {
            options.analyze_adapters
        };
        let analyze = Arc::new(AnalyzeService::new(
            Arc::clone(&repo),
            Some(Arc::clone(&backup)),
            analyze_adapters,
            bus.clone(),
        ));

        let marketplace = options.marketplace.or_else(|| {
            config
                .marketplace_url
                .clone()
                .map(|url| Arc::new(HttpMarketplaceClient::new(url)) as Arc<dyn MarketplaceClient>)
        });

        let upload = Arc::new(UploadService::new(
            Arc::clone(&repo),
            Some(Arc::clone(&backup)),
            bus.clone(),
        ));
        let install = Arc::new(InstallService::new(
            Arc::clone(&repo),
            Arc::clone(&deploy),
            Arc::clone(&upload),
            marketplace.clone(),
            Some(Arc::clone(&analyze)),
            suppressor.clone(),
            bus.clone(),
        ));
        let uninstall = Arc::new(UninstallService::new(
            Arc::clone(&repo),
            Arc::clone(&deploy),
            suppressor.clone(),
            bus.clone(),
        ));
        let update = Arc::new(UpdateService::new(
            Arc::clone(&repo),
            Arc::clone(&deploy),
            Some(Arc::clone(&backup)),
            Arc::clone(&upload),
            marketplace,
            suppressor.clone(),
            bus.clone(),
        ));
        let sync = Arc::new(SyncOrchestrator::new(
            Arc::clone(&repo),
            Arc::clone(&upload),
            Arc::clone(&install),
            Arc::clone(&uninstall),
            options.source_adapters,
            bus.clone(),
        ));

        let mut watcher_options = WatcherOptions::new(config.deploy_root());
        watcher_options.quarantine_dir = config.quarantine_dir.clone();
        watcher_options.poll_interval = config.poll_interval();
        watcher_options.debounce = config.debounce();
        watcher_options.default_policy = config.default_policy();
        let watcher = IntegrityWatcher::new(
            Arc::clone(&repo),
            Arc::clone(&deploy),
            Some(Arc::clone(&backup)),
            bus.clone(),
            suppressor,
            watcher_options,
        )?;

        let bridge_task = options
            .external_bus
            .map(|external| spawn_bridge(&bus, external));

        let manager = Self {
            repo,
            backup,
            bus,
            upload,
            install,
            uninstall,
            update,
            analyze,
            sync,
            watcher,
            bridge_task,
        };

        if options.auto_start_watcher {
            manager.watcher.start()?;
        }
        Ok(manager)
    }

    // ---- lifecycle ----

    pub fn upload(&self, request: UploadRequest) -> Result<(Skill, SkillVersion)> {
        self.upload.upload(request)
    }

    pub fn upload_archive(
        &self,
        name: &str,
        slug: &str,
        version: &str,
        archive: &[u8],
    ) -> Result<(Skill, SkillVersion)> {
        self.upload.upload_archive(name, slug, version, archive)
    }

    pub async fn install(&self, request: InstallRequest) -> Result<SkillInstallation> {
        self.install.install(request).await
    }

    pub async fn uninstall(&self, installation_id: &str) -> Result<()> {
        self.uninstall.uninstall(installation_id).await
    }

    pub async fn analyze_version(&self, version_id: &str) -> Result<AnalysisResult> {
        self.analyze.analyze_version(version_id).await
    }

    pub async fn analyze_pending(&self) -> Result<usize> {
        self.analyze.analyze_pending().await
    }

    pub async fn reanalyze(&self, version_id: &str) -> Result<AnalysisResult> {
        self.analyze.reanalyze(version_id).await
    }

    pub async fn check_updates(&self) -> Result<Vec<UpdateCheckResult>> {
        self.update.check_updates().await
    }

    pub async fn apply_pending_updates(&self) -> Result<usize> {
        self.update.apply_pending_updates().await
    }

    pub async fn sync_source(&self, source_id: &str, target: &str) -> Result<SyncReport> {
        self.sync.sync_source(source_id, target).await
    }

    pub async fn sync_all(&self, target: &str) -> Result<SyncReport> {
        self.sync.sync_all(target).await
    }

    pub fn approve_version(&self, version_id: &str) -> Result<()> {
        self.repo.approve_version(version_id)
    }

    /// Verify the policy list against the vault-style HMAC stored in the
    /// meta KV. The first call on a fresh store trusts and records the
    /// mac; later calls fail with `ConfigTamper` on any divergence.
    pub fn verify_config_integrity(
        &self,
        machine_id: &str,
        policies: &[serde_json::Value],
    ) -> Result<()> {
        let integrity = ConfigIntegrity::new(machine_id)?;
        let stored = self.repo.get_meta(CONFIG_HMAC_META_KEY)?;
        let mac = integrity.verify_or_trust(policies, stored.as_deref())?;
        if stored.is_none() {
            self.repo.set_meta(CONFIG_HMAC_META_KEY, &mac)?;
        }
        Ok(())
    }

    // ---- reads ----

    pub fn skills(&self, source: Option<SkillSource>) -> Result<Vec<Skill>> {
        self.repo.get_all(source)
    }

    pub fn skill_by_slug(&self, slug: &str) -> Result<Option<Skill>> {
        self.repo.get_by_slug(slug)
    }

    pub fn versions(&self, skill_id: &str) -> Result<Vec<SkillVersion>> {
        self.repo.get_versions(skill_id)
    }

    pub fn installations(&self) -> Result<Vec<SkillInstallation>> {
        self.repo.get_installations(None)
    }

    // ---- watcher ----

    pub fn start_watcher(&self) -> Result<()> {
        self.watcher.start()
    }

    pub fn stop_watcher(&self) {
        self.watcher.stop()
    }

    pub async fn poll(&self) -> Result<usize> {
        self.watcher.poll().await
    }

    pub fn watcher(&self) -> &IntegrityWatcher {
        &self.watcher
    }

    // ---- wiring accessors ----

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    pub fn backup_store(&self) -> &Arc<BackupStore> {
        &self.backup
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }
}

impl Drop for ShieldManager {
    fn drop(&mut self) {
        self.watcher.stop();
        if let Some(task) = self.bridge_task.take() {
            task.abort();
        }
    }
}
