//! Typed lifecycle event stream.
//!
//! In-process pub/sub over a tokio broadcast channel. Events are tagged
//! variants grouped by family; for a single `operation_id` the emission
//! order is `*:started`, intermediates, then `*:completed` or `*:error`,
//! and the bus never reorders events from one emitter.

pub mod bridge;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

use crate::types::{AnalysisResult, ViolationAction};

/// All internal lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Download(DownloadEvent),
    Upload(UploadEvent),
    Install(InstallEvent),
    Uninstall(UninstallEvent),
    Analyze(AnalyzeEvent),
    Deploy(DeployEvent),
    Undeploy(UndeployEvent),
    Update(UpdateEvent),
    Skill(SkillEvent),
    Sync(SyncEvent),
    Watcher(WatcherEvent),
}

impl LifecycleEvent {
    /// The wire name of the event, e.g. `install:started`.
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Download(e) => e.name(),
            LifecycleEvent::Upload(e) => e.name(),
            LifecycleEvent::Install(e) => e.name(),
            LifecycleEvent::Uninstall(e) => e.name(),
            LifecycleEvent::Analyze(e) => e.name(),
            LifecycleEvent::Deploy(e) => e.name(),
            LifecycleEvent::Undeploy(e) => e.name(),
            LifecycleEvent::Update(e) => e.name(),
            LifecycleEvent::Skill(e) => e.name(),
            LifecycleEvent::Sync(e) => e.name(),
            LifecycleEvent::Watcher(e) => e.name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum DownloadEvent {
    Started {
        operation_id: String,
        remote_id: String,
    },
    Completed {
        operation_id: String,
        remote_id: String,
        file_count: usize,
    },
    Error {
        operation_id: String,
        remote_id: String,
        error: String,
    },
}

impl DownloadEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DownloadEvent::Started { .. } => "download:started",
            DownloadEvent::Completed { .. } => "download:completed",
            DownloadEvent::Error { .. } => "download:error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum UploadEvent {
    Hashing {
        operation_id: String,
        slug: String,
    },
    Registering {
        operation_id: String,
        slug: String,
    },
    Completed {
        operation_id: String,
        slug: String,
        version_id: String,
    },
    Error {
        operation_id: String,
        slug: String,
        error: String,
    },
}

impl UploadEvent {
    pub fn name(&self) -> &'static str {
        match self {
            UploadEvent::Hashing { .. } => "upload:hashing",
            UploadEvent::Registering { .. } => "upload:registering",
            UploadEvent::Completed { .. } => "upload:completed",
            UploadEvent::Error { .. } => "upload:error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum InstallEvent {
    Started {
        operation_id: String,
        slug: String,
    },
    Downloading {
        operation_id: String,
        slug: String,
    },
    Analyzing {
        operation_id: String,
        slug: String,
    },
    Registering {
        operation_id: String,
        slug: String,
    },
    Creating {
        operation_id: String,
        slug: String,
    },
    Completed {
        operation_id: String,
        slug: String,
        installation_id: String,
    },
    Error {
        operation_id: String,
        slug: String,
        error: String,
    },
}

impl InstallEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InstallEvent::Started { .. } => "install:started",
            InstallEvent::Downloading { .. } => "install:downloading",
            InstallEvent::Analyzing { .. } => "install:analyzing",
            InstallEvent::Registering { .. } => "install:registering",
            InstallEvent::Creating { .. } => "install:creating",
            InstallEvent::Completed { .. } => "install:completed",
            InstallEvent::Error { .. } => "install:error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum UninstallEvent {
    Started {
        operation_id: String,
        installation_id: String,
        slug: String,
    },
    Completed {
        operation_id: String,
        installation_id: String,
        slug: String,
    },
    Error {
        operation_id: String,
        installation_id: String,
        slug: String,
        error: String,
    },
}

impl UninstallEvent {
    pub fn name(&self) -> &'static str {
        match self {
            UninstallEvent::Started { .. } => "uninstall:started",
            UninstallEvent::Completed { .. } => "uninstall:completed",
            UninstallEvent::Error { .. } => "uninstall:error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum AnalyzeEvent {
    Started {
        operation_id: String,
        version_id: String,
    },
    Parsing {
        operation_id: String,
        version_id: String,
    },
    Extracting {
        operation_id: String,
        version_id: String,
    },
    Completed {
        operation_id: String,
        version_id: String,
        analysis: AnalysisResult,
    },
    Error {
        operation_id: String,
        version_id: String,
        error: String,
    },
}

impl AnalyzeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AnalyzeEvent::Started { .. } => "analyze:started",
            AnalyzeEvent::Parsing { .. } => "analyze:parsing",
            AnalyzeEvent::Extracting { .. } => "analyze:extracting",
            AnalyzeEvent::Completed { .. } => "analyze:completed",
            AnalyzeEvent::Error { .. } => "analyze:error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum DeployEvent {
    Started {
        operation_id: String,
        installation_id: String,
        adapter_id: String,
        slug: String,
    },
    Completed {
        operation_id: String,
        installation_id: String,
        adapter_id: String,
        slug: String,
        deployed_path: String,
        deployed_hash: String,
    },
    Error {
        operation_id: String,
        installation_id: String,
        slug: String,
        error: String,
    },
}

impl DeployEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DeployEvent::Started { .. } => "deploy:started",
            DeployEvent::Completed { .. } => "deploy:completed",
            DeployEvent::Error { .. } => "deploy:error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum UndeployEvent {
    Started {
        operation_id: String,
        installation_id: String,
        slug: String,
    },
    Completed {
        operation_id: String,
        installation_id: String,
        slug: String,
    },
    Error {
        operation_id: String,
        installation_id: String,
        slug: String,
        error: String,
    },
}

impl UndeployEvent {
    pub fn name(&self) -> &'static str {
        match self {
            UndeployEvent::Started { .. } => "undeploy:started",
            UndeployEvent::Completed { .. } => "undeploy:completed",
            UndeployEvent::Error { .. } => "undeploy:error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum UpdateEvent {
    Checking {
        operation_id: String,
    },
    Found {
        operation_id: String,
        slug: String,
        current_version: Option<String>,
        latest_version: String,
    },
    Applying {
        operation_id: String,
        slug: String,
    },
    SkillDone {
        operation_id: String,
        slug: String,
        new_version_id: String,
    },
    Completed {
        operation_id: String,
        applied: usize,
    },
    Error {
        operation_id: String,
        error: String,
    },
}

impl UpdateEvent {
    pub fn name(&self) -> &'static str {
        match self {
            UpdateEvent::Checking { .. } => "update:checking",
            UpdateEvent::Found { .. } => "update:found",
            UpdateEvent::Applying { .. } => "update:applying",
            UpdateEvent::SkillDone { .. } => "update:skill-done",
            UpdateEvent::Completed { .. } => "update:completed",
            UpdateEvent::Error { .. } => "update:error",
        }
    }
}

/// CRUD notifications for skills and versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum SkillEvent {
    Created {
        skill_id: String,
        slug: String,
    },
    Deleted {
        skill_id: String,
        slug: String,
    },
    VersionCreated {
        version_id: String,
        skill_id: String,
        slug: String,
        version: String,
    },
}

impl SkillEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SkillEvent::Created { .. } => "skill:created",
            SkillEvent::Deleted { .. } => "skill:deleted",
            SkillEvent::VersionCreated { .. } => "version:created",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum SyncEvent {
    Started {
        operation_id: String,
        source_id: String,
    },
    Completed {
        operation_id: String,
        source_id: String,
        installed: Vec<String>,
        updated: Vec<String>,
        removed: Vec<String>,
    },
    Error {
        operation_id: String,
        source_id: String,
        error: String,
    },
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Started { .. } => "sync:started",
            SyncEvent::Completed { .. } => "sync:completed",
            SyncEvent::Error { .. } => "sync:error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum WatcherEvent {
    Started,
    Stopped,
    PollStarted,
    PollCompleted {
        violation_count: usize,
    },
    FsChange {
        slug: String,
    },
    IntegrityViolation {
        installation_id: String,
        slug: String,
        adapter_id: String,
        modified_files: Vec<String>,
        missing_files: Vec<String>,
        unexpected_files: Vec<String>,
        action: ViolationAction,
    },
    Quarantined {
        installation_id: String,
        slug: String,
        quarantine_path: Option<String>,
    },
    Reinstalled {
        installation_id: String,
        slug: String,
    },
    SkillDetected {
        slug: String,
        version: String,
        quarantine_path: Option<String>,
        reason: String,
    },
    ActionError {
        installation_id: String,
        slug: String,
        action: ViolationAction,
        error: String,
    },
    Error {
        error: String,
    },
}

impl WatcherEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WatcherEvent::Started => "watcher:started",
            WatcherEvent::Stopped => "watcher:stopped",
            WatcherEvent::PollStarted => "watcher:poll-started",
            WatcherEvent::PollCompleted { .. } => "watcher:poll-completed",
            WatcherEvent::FsChange { .. } => "watcher:fs-change",
            WatcherEvent::IntegrityViolation { .. } => "watcher:integrity-violation",
            WatcherEvent::Quarantined { .. } => "watcher:quarantined",
            WatcherEvent::Reinstalled { .. } => "watcher:reinstalled",
            WatcherEvent::SkillDetected { .. } => "watcher:skill-detected",
            WatcherEvent::ActionError { .. } => "watcher:action-error",
            WatcherEvent::Error { .. } => "watcher:error",
        }
    }
}

/// Multi-subscriber event bus. Publishing never blocks and never fails;
/// events published with no subscribers are dropped.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<LifecycleEvent>>,
}

impl EventBus {
    /// Create a bus with the given buffer capacity per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: LifecycleEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Receiver side of the bus.
pub struct EventReceiver {
    receiver: broadcast::Receiver<LifecycleEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<LifecycleEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    pub fn try_recv(&mut self) -> Result<LifecycleEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => EventBusError::Lagged(n),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("event bus is closed")]
    Closed,

    #[error("no events available")]
    Empty,

    #[error("receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(LifecycleEvent::Watcher(WatcherEvent::Started));

        let got_a = a.recv().await.unwrap();
        let got_b = b.recv().await.unwrap();
        assert_eq!(got_a.name(), "watcher:started");
        assert_eq!(got_b.name(), "watcher:started");
    }

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let op = "op-1".to_string();

        bus.publish(LifecycleEvent::Install(InstallEvent::Started {
            operation_id: op.clone(),
            slug: "hello".into(),
        }));
        bus.publish(LifecycleEvent::Install(InstallEvent::Registering {
            operation_id: op.clone(),
            slug: "hello".into(),
        }));
        bus.publish(LifecycleEvent::Install(InstallEvent::Completed {
            operation_id: op,
            slug: "hello".into(),
            installation_id: "inst-1".into(),
        }));

        let names: Vec<&str> = vec![
            rx.recv().await.unwrap().name(),
            rx.recv().await.unwrap().name(),
            rx.recv().await.unwrap().name(),
        ];
        assert_eq!(
            names,
            vec!["install:started", "install:registering", "install:completed"]
        );
    }
}
