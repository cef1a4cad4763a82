//! Integrity watcher.
//!
//! Verifies that every active installation's on-disk bytes match the
//! registered manifest, quarantines unknown drops, and recovers tampered
//! installations per policy. Two detection sources cooperate: recursive
//! filesystem notifications (debounced per slug) and an interval poll.
//! The state machine is `idle → watching → degraded`: a notifier error
//! degrades the watcher and a restart is attempted every five seconds
//! while the poll keeps running.

pub mod suppress;

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backup::BackupStore;
use crate::deploy::{DeployService, IntegrityCheckResult};
use crate::error::{Result, ShieldError};
use crate::events::{EventBus, LifecycleEvent, WatcherEvent};
use crate::repo::{NewFile, NewSkill, Repository, VersionIngest};
use crate::types::{
    ApprovalState, IntegrityPolicy, IntegrityPolicyOverride, Skill, SkillInstallation,
    SkillSource, ViolationAction,
};

pub use suppress::Suppressor;

const NOTIFIER_RESTART_DELAY: Duration = Duration::from_secs(5);
const UNKNOWN_DROP_REASON: &str = "Skill not in approved list";

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub deploy_root: PathBuf,
    /// Where quarantined directories are moved; deleted outright if unset.
    pub quarantine_dir: Option<PathBuf>,
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub default_policy: IntegrityPolicy,
}

impl WatcherOptions {
    pub fn new(deploy_root: impl Into<PathBuf>) -> Self {
        Self {
            deploy_root: deploy_root.into(),
            quarantine_dir: None,
            poll_interval: Duration::from_millis(30_000),
            debounce: Duration::from_millis(500),
            default_policy: IntegrityPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatcherState {
    Idle,
    Watching,
    Degraded,
}

enum NotifierMsg {
    Event(notify::Event),
    Error(String),
}

struct DebounceEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct IntegrityWatcher {
    inner: Arc<WatcherInner>,
}

struct WatcherInner {
    repo: Arc<Repository>,
    deploy: Arc<DeployService>,
    backup: Option<Arc<BackupStore>>,
    bus: EventBus,
    options: WatcherOptions,
    suppressor: Suppressor,
    policies: Mutex<HashMap<String, IntegrityPolicyOverride>>,
    debounces: Mutex<HashMap<String, DebounceEntry>>,
    next_generation: Mutex<u64>,
    state: Mutex<WatcherState>,
    notifier: Mutex<Option<RecommendedWatcher>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    forwarder_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: tokio::sync::Notify,
}

impl IntegrityWatcher {
    /// Roots are resolved to absolute paths here; notifier paths are
    /// reconciled against them later.
    pub fn new(
        repo: Arc<Repository>,
        deploy: Arc<DeployService>,
        backup: Option<Arc<BackupStore>>,
        bus: EventBus,
        suppressor: Suppressor,
        mut options: WatcherOptions,
    ) -> Result<Self> {
        std::fs::create_dir_all(&options.deploy_root)?;
        options.deploy_root = options.deploy_root.canonicalize()?;
        if let Some(quarantine) = options.quarantine_dir.take() {
            std::fs::create_dir_all(&quarantine)?;
            options.quarantine_dir = Some(quarantine.canonicalize()?);
        }

        Ok(Self {
            inner: Arc::new(WatcherInner {
                repo,
                deploy,
                backup,
                bus,
                options,
                suppressor,
                policies: Mutex::new(HashMap::new()),
                debounces: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
                state: Mutex::new(WatcherState::Idle),
                notifier: Mutex::new(None),
                poll_task: Mutex::new(None),
                forwarder_task: Mutex::new(None),
                shutdown: tokio::sync::Notify::new(),
            }),
        })
    }

    pub fn suppressor(&self) -> Suppressor {
        self.inner.suppressor.clone()
    }

    /// Install a per-installation policy override (merged field-wise onto
    /// the default policy).
    pub fn set_policy_override(&self, installation_id: &str, over: IntegrityPolicyOverride) {
        lock(&self.inner.policies).insert(installation_id.to_string(), over);
    }

    /// Begin watching. Idempotent: a running watcher is left untouched.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if *state == WatcherState::Watching {
                return Ok(());
            }
            *state = WatcherState::Watching;
        }

        if let Err(err) = start_notifier(&self.inner) {
            // Poll still covers integrity; degrade and keep retrying.
            warn!(error = %err, "filesystem notifier failed to start");
            *lock(&self.inner.state) = WatcherState::Degraded;
            schedule_notifier_restart(Arc::clone(&self.inner));
        }

        let inner = Arc::clone(&self.inner);
        let poll_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.options.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = inner.poll().await {
                            warn!(error = %err, "watcher poll failed");
                        }
                    }
                    _ = inner.shutdown.notified() => break,
                }
            }
        });
        *lock(&self.inner.poll_task) = Some(poll_task);

        self.inner
            .bus
            .publish(LifecycleEvent::Watcher(WatcherEvent::Started));
        info!(root = %self.inner.options.deploy_root.display(), "integrity watcher started");
        Ok(())
    }

    /// Stop watching: cancel the next poll tick, close the notifier, and
    /// drop all debounce timers and suppressions. An in-flight violation
    /// evaluation runs to completion.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state == WatcherState::Idle {
                return;
            }
            *state = WatcherState::Idle;
        }

        self.inner.shutdown.notify_waiters();
        if let Some(task) = lock(&self.inner.poll_task).take() {
            task.abort();
        }
        lock(&self.inner.notifier).take();
        if let Some(task) = lock(&self.inner.forwarder_task).take() {
            task.abort();
        }

        for (_, entry) in lock(&self.inner.debounces).drain() {
            entry.handle.abort();
        }
        self.inner.suppressor.clear();

        self.inner
            .bus
            .publish(LifecycleEvent::Watcher(WatcherEvent::Stopped));
        info!("integrity watcher stopped");
    }

    /// One full pass: unknown-drop scan, then an integrity audit of every
    /// active installation with per-violation handling.
    pub async fn poll(&self) -> Result<usize> {
        self.inner.poll().await
    }

    /// Evaluate one slug now, as the debounced notifier would.
    pub async fn handle_fs_change(&self, slug: &str) -> Result<()> {
        self.inner.handle_fs_change(slug).await
    }

    /// Scan the deploy root for directories that no active installation
    /// claims, quarantining each.
    pub async fn scan_for_new_skills(&self) -> Result<usize> {
        self.inner.scan_for_new_skills()
    }
}

impl WatcherInner {
    async fn poll(&self) -> Result<usize> {
        self.bus
            .publish(LifecycleEvent::Watcher(WatcherEvent::PollStarted));

        if let Err(err) = self.scan_for_new_skills() {
            warn!(error = %err, "unknown-drop scan failed");
        }

        let results = self.deploy.check_all_integrity()?;
        let mut violation_count = 0;
        for (installation, result) in results {
            if result.intact {
                continue;
            }
            violation_count += 1;
            self.handle_integrity_violation(&installation, &result).await;
        }

        self.bus
            .publish(LifecycleEvent::Watcher(WatcherEvent::PollCompleted {
                violation_count,
            }));
        Ok(violation_count)
    }

    async fn handle_fs_change(&self, slug: &str) -> Result<()> {
        if self.suppressor.is_suppressed(slug) {
            return Ok(());
        }

        self.bus
            .publish(LifecycleEvent::Watcher(WatcherEvent::FsChange {
                slug: slug.to_string(),
            }));

        let skill = self.repo.get_by_slug(slug)?;
        match skill {
            Some(skill) => {
                match self.repo.get_active_installation_for_skill(&skill.id)? {
                    Some(installation) => self.check_one(&installation).await,
                    // Known skill without an active installation: the
                    // directory is a drop all the same.
                    None => self.scan_for_new_skills().map(|_| ()),
                }
            }
            None => self.scan_for_new_skills().map(|_| ()),
        }
    }

    async fn check_one(&self, installation: &SkillInstallation) -> Result<()> {
        let Some(result) = self.deploy.check_integrity(installation)? else {
            return Ok(());
        };
        if !result.intact {
            self.handle_integrity_violation(installation, &result).await;
        }
        Ok(())
    }

    async fn handle_integrity_violation(
        &self,
        installation: &SkillInstallation,
        result: &IntegrityCheckResult,
    ) {
        let resolved = match self.repo.resolve_installation(&installation.id) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(
                    installation = %installation.id,
                    error = %err,
                    "violation on unresolvable installation"
                );
                return;
            }
        };
        let (skill, version, installation) = resolved;

        let policy = self.policy_for(&installation.id);
        let action = select_action(&policy, result);

        let adapter_id = self
            .deploy
            .adapter_for(installation.profile_id.as_deref())
            .map(|a| a.id().to_string())
            .unwrap_or_default();
        self.bus
            .publish(LifecycleEvent::Watcher(WatcherEvent::IntegrityViolation {
                installation_id: installation.id.clone(),
                slug: skill.slug.clone(),
                adapter_id,
                modified_files: result.modified_files.clone(),
                missing_files: result.missing_files.clone(),
                unexpected_files: result.unexpected_files.clone(),
                action,
            }));

        // Suppress before any state change so the debounced evaluator
        // cannot race the transition.
        self.suppressor.suppress(&skill.slug);
        self.cancel_debounce(&skill.slug);

        let outcome = match action {
            ViolationAction::Quarantine => self.quarantine(&skill, &installation),
            ViolationAction::Reinstall => self.reinstall(&skill, &version, &installation),
        };

        if let Err(err) = outcome {
            error!(
                slug = %skill.slug,
                installation = %installation.id,
                action = action.as_str(),
                error = %err,
                "violation action failed"
            );
            self.bus
                .publish(LifecycleEvent::Watcher(WatcherEvent::ActionError {
                    installation_id: installation.id.clone(),
                    slug: skill.slug.clone(),
                    action,
                    error: err.to_string(),
                }));
        }

        self.suppressor.unsuppress(&skill.slug);
    }

    fn quarantine(&self, skill: &Skill, installation: &SkillInstallation) -> Result<()> {
        self.repo.update_installation_status(
            &installation.id,
            crate::types::InstallStatus::Quarantined,
        )?;

        let deployed = self.options.deploy_root.join(&skill.slug);
        let quarantine_path = match &self.options.quarantine_dir {
            Some(quarantine_dir) => {
                let target = quarantine_dir.join(&skill.slug);
                move_dir(&deployed, &target)?;
                Some(target.display().to_string())
            }
            None => {
                crate::fs::remove_path(&deployed)?;
                None
            }
        };

        warn!(slug = %skill.slug, "installation quarantined");
        self.bus
            .publish(LifecycleEvent::Watcher(WatcherEvent::Quarantined {
                installation_id: installation.id.clone(),
                slug: skill.slug.clone(),
                quarantine_path,
            }));
        Ok(())
    }

    /// Backup-first recovery: verified backup bytes are authoritative;
    /// the source folder serves only when no backup exists. A backup that
    /// fails verification aborts the reinstall.
    fn reinstall(
        &self,
        skill: &Skill,
        version: &crate::types::SkillVersion,
        installation: &SkillInstallation,
    ) -> Result<()> {
        let contents = match &self.backup {
            Some(backup) if backup.has_backup(&version.id) => {
                let manifest = self.repo.get_files(&version.id)?;
                Some(backup.load_files(&version.id, &manifest)?)
            }
            _ => {
                let has_source = version
                    .folder_path
                    .as_deref()
                    .map(|p| Path::new(p).is_dir())
                    .unwrap_or(false);
                if !has_source {
                    return Err(ShieldError::Other(anyhow::anyhow!(
                        "version {} has neither backup nor source folder",
                        version.id
                    )));
                }
                None
            }
        };

        self.deploy.deploy(installation, version, skill, contents)?;

        info!(slug = %skill.slug, "installation restored from backup");
        self.bus
            .publish(LifecycleEvent::Watcher(WatcherEvent::Reinstalled {
                installation_id: installation.id.clone(),
                slug: skill.slug.clone(),
            }));
        Ok(())
    }

    /// Quarantine every top-level directory no active installation claims.
    fn scan_for_new_skills(&self) -> Result<usize> {
        let mut detected = 0;
        let entries = match std::fs::read_dir(&self.options.deploy_root) {
            Ok(entries) => entries,
            Err(err) => return Err(ShieldError::Io(err)),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let slug = entry.file_name().to_string_lossy().to_string();
            if slug.starts_with('.') {
                continue;
            }
            if self.suppressor.is_suppressed(&slug) {
                continue;
            }

            if let Some(skill) = self.repo.get_by_slug(&slug)? {
                if self
                    .repo
                    .get_active_installation_for_skill(&skill.id)?
                    .is_some()
                {
                    continue;
                }
            }

            match self.quarantine_drop(&slug, &entry.path()) {
                Ok(true) => detected += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(slug = %slug, error = %err, "failed to quarantine unknown drop");
                    self.bus
                        .publish(LifecycleEvent::Watcher(WatcherEvent::Error {
                            error: format!("quarantine of '{slug}' failed: {err}"),
                        }));
                }
            }
        }
        Ok(detected)
    }

    /// Register one unknown drop as a quarantined version, back up its
    /// bytes, and remove it from the deploy root. Returns false when the
    /// drop deduplicated against an already-recorded version.
    fn quarantine_drop(&self, dir_slug: &str, dir: &Path) -> Result<bool> {
        let meta = read_drop_meta(dir);
        let slug = meta.slug.clone().unwrap_or_else(|| dir_slug.to_string());
        let version = meta.version.clone().unwrap_or_else(|| "0.0.0".to_string());
        let name = meta.name.clone().unwrap_or_else(|| slug.clone());

        let files = crate::fs::read_files(dir)?;
        let manifest: Vec<NewFile> = files
            .iter()
            .map(|f| NewFile {
                relative_path: f.relative_path.clone(),
                file_hash: crate::fs::sha256_hex(&f.bytes),
                size_bytes: f.bytes.len() as u64,
            })
            .collect();
        let entries: Vec<(String, String)> = manifest
            .iter()
            .map(|f| (f.relative_path.clone(), f.file_hash.clone()))
            .collect();
        let content_hash = crate::fs::content_hash(&entries);

        let mut version_string = version.clone();
        if let Some(skill) = self.repo.get_by_slug(&slug)? {
            if self
                .repo
                .find_version_by_content_hash(&skill.id, &content_hash)?
                .is_some()
            {
                // Identical content already recorded; nothing new to keep.
                crate::fs::remove_path(dir)?;
                debug!(slug = %slug, "duplicate drop removed");
                return Ok(false);
            }
            if self.repo.get_version(&skill.id, &version_string)?.is_some() {
                version_string = format!("{}-{}", version_string, &content_hash[..8]);
            }
        }

        let (skill, stored) = self.repo.ingest_version(
            NewSkill {
                slug: slug.clone(),
                name,
                author: None,
                description: meta.description.clone(),
                tags: Vec::new(),
                source: SkillSource::Watcher,
                remote_id: None,
                is_public: None,
            },
            VersionIngest {
                version: version_string,
                folder_path: None,
                approval: ApprovalState::Quarantined,
                trusted: false,
                metadata_json: None,
                files: manifest,
            },
        )?;

        let mut quarantine_path = None;
        if let Some(backup) = &self.backup {
            let registered = self.repo.get_files(&stored.id)?;
            if let Err(err) = backup.save_files(&stored.id, &files, &registered) {
                // Keep the directory as evidence; retry on the next pass.
                let _ = self.repo.delete_version(&stored.id);
                return Err(err);
            }
            quarantine_path = Some(backup.root().join(&stored.id).display().to_string());
        }

        crate::fs::remove_path(dir)?;

        warn!(slug = %skill.slug, version = %stored.version, "unknown skill drop quarantined");
        self.bus
            .publish(LifecycleEvent::Watcher(WatcherEvent::SkillDetected {
                slug: skill.slug.clone(),
                version: stored.version.clone(),
                quarantine_path,
                reason: UNKNOWN_DROP_REASON.to_string(),
            }));
        Ok(true)
    }

    fn policy_for(&self, installation_id: &str) -> IntegrityPolicy {
        let overrides = lock(&self.policies);
        match overrides.get(installation_id) {
            Some(over) => self.options.default_policy.merged(over),
            None => self.options.default_policy,
        }
    }

    fn cancel_debounce(&self, slug: &str) {
        if let Some(entry) = lock(&self.debounces).remove(slug) {
            entry.handle.abort();
        }
    }
}

/// Debounced notification entry point: restart the slug's timer, or drop
/// the notification outright while suppressed.
fn dispatch_notification(inner: &Arc<WatcherInner>, slug: String) {
    if inner.suppressor.is_suppressed(&slug) {
        return;
    }

    let generation = {
        let mut next = lock(&inner.next_generation);
        *next += 1;
        *next
    };

    let task_inner = Arc::clone(inner);
    let task_slug = slug.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(task_inner.options.debounce).await;
        {
            let mut debounces = lock(&task_inner.debounces);
            match debounces.get(&task_slug) {
                Some(entry) if entry.generation == generation => {
                    debounces.remove(&task_slug);
                }
                _ => return,
            }
        }
        if let Err(err) = task_inner.handle_fs_change(&task_slug).await {
            warn!(slug = %task_slug, error = %err, "fs-change evaluation failed");
        }
    });

    let mut debounces = lock(&inner.debounces);
    if let Some(previous) = debounces.insert(slug, DebounceEntry { generation, handle }) {
        previous.handle.abort();
    }
}

/// Pick the action for a violation: the stricter lever when both kinds of
/// damage are present, the matching lever otherwise.
fn select_action(policy: &IntegrityPolicy, result: &IntegrityCheckResult) -> ViolationAction {
    let has_modified = !result.modified_files.is_empty() || !result.unexpected_files.is_empty();
    let has_missing = !result.missing_files.is_empty();
    match (has_modified, has_missing) {
        (true, true) => policy.on_modified.stricter(policy.on_deleted),
        (false, true) => policy.on_deleted,
        _ => policy.on_modified,
    }
}

fn start_notifier(inner: &Arc<WatcherInner>) -> notify::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<NotifierMsg>();

    let callback_tx = tx.clone();
    let mut notifier = RecommendedWatcher::new(
        move |result: notify::Result<notify::Event>| {
            let msg = match result {
                Ok(event) => NotifierMsg::Event(event),
                Err(err) => NotifierMsg::Error(err.to_string()),
            };
            let _ = callback_tx.send(msg);
        },
        notify::Config::default(),
    )?;
    notifier.watch(&inner.options.deploy_root, RecursiveMode::Recursive)?;
    *lock(&inner.notifier) = Some(notifier);

    let forwarder_inner = Arc::clone(inner);
    let forwarder = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                NotifierMsg::Event(event) => {
                    for path in &event.paths {
                        if let Some(slug) =
                            slug_for_path(&forwarder_inner.options.deploy_root, path)
                        {
                            dispatch_notification(&forwarder_inner, slug);
                        }
                    }
                }
                NotifierMsg::Error(message) => {
                    error!(error = %message, "filesystem notifier failed");
                    forwarder_inner
                        .bus
                        .publish(LifecycleEvent::Watcher(WatcherEvent::Error {
                            error: message,
                        }));
                    lock(&forwarder_inner.notifier).take();
                    *lock(&forwarder_inner.state) = WatcherState::Degraded;
                    schedule_notifier_restart(Arc::clone(&forwarder_inner));
                    break;
                }
            }
        }
    });
    *lock(&inner.forwarder_task) = Some(forwarder);
    Ok(())
}

fn schedule_notifier_restart(inner: Arc<WatcherInner>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(NOTIFIER_RESTART_DELAY).await;
            if *lock(&inner.state) != WatcherState::Degraded {
                return;
            }
            match start_notifier(&inner) {
                Ok(()) => {
                    *lock(&inner.state) = WatcherState::Watching;
                    info!("filesystem notifier restarted");
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "filesystem notifier restart failed");
                }
            }
        }
    });
}

/// First path segment under the resolved deploy root; notifications may
/// carry absolute or root-relative paths. Dot-prefixed segments (staging
/// directories) are ignored.
fn slug_for_path(root: &Path, path: &Path) -> Option<String> {
    let relative = match path.strip_prefix(root) {
        Ok(relative) => relative,
        Err(_) if path.is_relative() => path,
        Err(_) => return None,
    };
    let first = relative.components().next()?;
    let slug = match first {
        Component::Normal(segment) => segment.to_str()?.to_string(),
        _ => return None,
    };
    if slug.starts_with('.') {
        return None;
    }
    Some(slug)
}

fn move_dir(from: &Path, to: &Path) -> Result<()> {
    if !from.exists() {
        return Ok(());
    }
    crate::fs::remove_path(to)?;
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Cross-device fallback: copy then delete.
            copy_tree(from, to)?;
            crate::fs::remove_path(from)?;
            Ok(())
        }
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if ty.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Metadata an unknown drop may carry in `_meta.json`.
#[derive(Debug, Default, serde::Deserialize)]
struct DropMeta {
    name: Option<String>,
    slug: Option<String>,
    version: Option<String>,
    description: Option<String>,
}

fn read_drop_meta(dir: &Path) -> DropMeta {
    let path = dir.join("_meta.json");
    match std::fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => DropMeta::default(),
    }
}
