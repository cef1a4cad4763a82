//! Shared wiring for lifecycle integration tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use agenshield_core::backup::BackupStore;
use agenshield_core::deploy::{DeployAdapter, DeployService, WorkspaceDeployAdapter};
use agenshield_core::events::{EventBus, EventBusError, EventReceiver};
use agenshield_core::lifecycle::{InstallService, UninstallService, UploadService};
use agenshield_core::repo::Repository;
use agenshield_core::types::{FileEntry, IntegrityPolicy};
use agenshield_core::watcher::{IntegrityWatcher, Suppressor, WatcherOptions};

pub struct Harness {
    pub tmp: TempDir,
    pub repo: Arc<Repository>,
    pub backup: Arc<BackupStore>,
    pub bus: EventBus,
    pub deploy: Arc<DeployService>,
    pub upload: Arc<UploadService>,
    pub install: Arc<InstallService>,
    pub uninstall: Arc<UninstallService>,
    pub suppressor: Suppressor,
    pub deploy_root: PathBuf,
}

pub const DEBOUNCE: Duration = Duration::from_millis(50);

pub fn harness() -> Harness {
    let tmp = TempDir::new().expect("tempdir should succeed");
    let deploy_root = tmp.path().join("deploy");

    let repo = Arc::new(Repository::new(tmp.path().join("shield.sqlite")).unwrap());
    let backup = Arc::new(BackupStore::new(tmp.path().join("backups")).unwrap());
    let bus = EventBus::default();
    let suppressor = Suppressor::new(DEBOUNCE);

    let adapter = WorkspaceDeployAdapter::new(&deploy_root).unwrap();
    let deploy = Arc::new(DeployService::new(
        Arc::clone(&repo),
        Some(Arc::clone(&backup)),
        vec![Arc::new(adapter) as Arc<dyn DeployAdapter>],
        bus.clone(),
    ));

    let upload = Arc::new(UploadService::new(
        Arc::clone(&repo),
        Some(Arc::clone(&backup)),
        bus.clone(),
    ));
    let install = Arc::new(InstallService::new(
        Arc::clone(&repo),
        Arc::clone(&deploy),
        Arc::clone(&upload),
        None,
        None,
        suppressor.clone(),
        bus.clone(),
    ));
    let uninstall = Arc::new(UninstallService::new(
        Arc::clone(&repo),
        Arc::clone(&deploy),
        suppressor.clone(),
        bus.clone(),
    ));

    // The deploy root is created by the adapter constructor.
    let deploy_root = deploy_root.canonicalize().unwrap();

    Harness {
        tmp,
        repo,
        backup,
        bus,
        deploy,
        upload,
        install,
        uninstall,
        suppressor,
        deploy_root,
    }
}

impl Harness {
    pub fn watcher(&self, policy: IntegrityPolicy, with_quarantine_dir: bool) -> IntegrityWatcher {
        let mut options = WatcherOptions::new(self.deploy_root.clone());
        options.debounce = DEBOUNCE;
        options.default_policy = policy;
        if with_quarantine_dir {
            options.quarantine_dir = Some(self.tmp.path().join("quarantine"));
        }
        IntegrityWatcher::new(
            Arc::clone(&self.repo),
            Arc::clone(&self.deploy),
            Some(Arc::clone(&self.backup)),
            self.bus.clone(),
            self.suppressor.clone(),
            options,
        )
        .unwrap()
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.tmp.path().join("quarantine")
    }
}

pub fn hello_files() -> Vec<FileEntry> {
    vec![
        FileEntry::new("SKILL.md", b"# Hello\n".to_vec()),
        FileEntry::new("run.sh", b"#!/bin/sh\necho hi\n".to_vec()),
    ]
}

/// Drain every event currently buffered on the receiver into its names.
pub fn drain_event_names(rx: &mut EventReceiver) -> Vec<String> {
    let mut names = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => names.push(event.name().to_string()),
            Err(EventBusError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    names
}
