mod support;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use agenshield_core::sync::{
    SkillDefinition, SkillSourceAdapter, SyncOrchestrator,
};
use agenshield_core::types::{ApprovalState, FileEntry, InstallStatus, SkillSource};

use support::{harness, Harness};

/// Scripted source whose desired set the test mutates between runs.
struct ScriptedSource {
    definitions: Mutex<Vec<SkillDefinition>>,
}

impl ScriptedSource {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            definitions: Mutex::new(Vec::new()),
        })
    }

    fn set(&self, defs: Vec<SkillDefinition>) {
        *self.definitions.lock().unwrap() = defs;
    }
}

#[async_trait]
impl SkillSourceAdapter for ScriptedSource {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn get_skills_for(&self, _target: &str) -> anyhow::Result<Vec<SkillDefinition>> {
        Ok(self.definitions.lock().unwrap().clone())
    }
}

fn definition(skill_id: &str, version: &str, content: &str, trusted: bool) -> SkillDefinition {
    let files = vec![FileEntry::new("SKILL.md", content.as_bytes().to_vec())];
    let sha = SkillDefinition::content_sha(&files);
    SkillDefinition {
        skill_id: skill_id.to_string(),
        name: skill_id.to_string(),
        description: None,
        version: version.to_string(),
        sha,
        files,
        trusted,
    }
}

fn orchestrator(h: &Harness, source: Arc<ScriptedSource>) -> SyncOrchestrator {
    SyncOrchestrator::new(
        Arc::clone(&h.repo),
        Arc::clone(&h.upload),
        Arc::clone(&h.install),
        Arc::clone(&h.uninstall),
        vec![source as Arc<dyn SkillSourceAdapter>],
        h.bus.clone(),
    )
}

#[tokio::test]
async fn sync_installs_then_converges() {
    let h = harness();
    let source = ScriptedSource::new();
    source.set(vec![definition("x", "1.0.0", "x", true)]);
    let sync = orchestrator(&h, Arc::clone(&source));

    // First run installs.
    let report = sync.sync_source("scripted", "workspace").await.unwrap();
    assert_eq!(report.installed, vec!["x"]);
    assert!(report.updated.is_empty() && report.removed.is_empty());
    assert!(report.errors.is_empty());

    let skill = h.repo.get_by_slug("x").unwrap().unwrap();
    assert_eq!(skill.source, SkillSource::Integration);
    assert_eq!(skill.remote_id.as_deref(), Some("scripted"));
    assert_eq!(
        std::fs::read(h.deploy_root.join("x/SKILL.md")).unwrap(),
        b"x"
    );

    // Trusted definitions are approved on ingest.
    let version = h.repo.get_latest_version(&skill.id).unwrap().unwrap();
    assert_eq!(version.approval, ApprovalState::Approved);

    // Unchanged source: second run is a no-op.
    let report = sync.sync_source("scripted", "workspace").await.unwrap();
    assert!(report.is_noop(), "expected no-op, got {report:?}");
}

#[tokio::test]
async fn content_change_updates_the_installation() {
    let h = harness();
    let source = ScriptedSource::new();
    source.set(vec![definition("x", "1.0.0", "v1", true)]);
    let sync = orchestrator(&h, Arc::clone(&source));

    sync.sync_source("scripted", "workspace").await.unwrap();

    let changed = definition("x", "1.1.0", "v2", true);
    let new_sha = changed.sha.clone();
    source.set(vec![changed]);

    let report = sync.sync_source("scripted", "workspace").await.unwrap();
    assert_eq!(report.updated, vec!["x"]);
    assert!(report.installed.is_empty() && report.removed.is_empty());

    // Installation points at the new version; bytes propagated.
    let skill = h.repo.get_by_slug("x").unwrap().unwrap();
    let installation = h
        .repo
        .get_active_installation_for_skill(&skill.id)
        .unwrap()
        .unwrap();
    let version = h
        .repo
        .get_version_by_id(&installation.skill_version_id)
        .unwrap()
        .unwrap();
    assert_eq!(version.content_hash, new_sha);
    assert_eq!(
        std::fs::read(h.deploy_root.join("x/SKILL.md")).unwrap(),
        b"v2"
    );

    // Convergence after the update.
    let report = sync.sync_source("scripted", "workspace").await.unwrap();
    assert!(report.is_noop());
}

#[tokio::test]
async fn orphans_are_uninstalled_and_deleted() {
    let h = harness();
    let source = ScriptedSource::new();
    source.set(vec![
        definition("x", "1.0.0", "x", true),
        definition("y", "1.0.0", "y", true),
    ]);
    let sync = orchestrator(&h, Arc::clone(&source));

    sync.sync_source("scripted", "workspace").await.unwrap();
    assert!(h.deploy_root.join("y").exists());

    source.set(vec![definition("x", "1.0.0", "x", true)]);
    let report = sync.sync_source("scripted", "workspace").await.unwrap();
    assert_eq!(report.removed, vec!["y"]);

    assert!(h.repo.get_by_slug("y").unwrap().is_none());
    assert!(!h.deploy_root.join("y").exists());
    assert!(h.repo.get_by_slug("x").unwrap().is_some());
}

#[tokio::test]
async fn untrusted_definitions_install_unapproved() {
    let h = harness();
    let source = ScriptedSource::new();
    source.set(vec![definition("x", "1.0.0", "x", false)]);
    let sync = orchestrator(&h, Arc::clone(&source));

    sync.sync_source("scripted", "workspace").await.unwrap();

    let skill = h.repo.get_by_slug("x").unwrap().unwrap();
    let version = h.repo.get_latest_version(&skill.id).unwrap().unwrap();
    assert_eq!(version.approval, ApprovalState::Unknown);

    let installation = h
        .repo
        .get_active_installation_for_skill(&skill.id)
        .unwrap()
        .unwrap();
    assert_eq!(installation.status, InstallStatus::Active);
    assert_eq!(installation.target_id.as_deref(), Some("workspace"));
}

#[tokio::test]
async fn sync_all_unions_available_sources() {
    let h = harness();
    let source = ScriptedSource::new();
    source.set(vec![definition("x", "1.0.0", "x", true)]);
    let sync = orchestrator(&h, Arc::clone(&source));

    let report = sync.sync_all("workspace").await.unwrap();
    assert_eq!(report.installed, vec!["x"]);
}
