//! AgenShield Skill Lifecycle Core
//!
//! Makes a "skill" (a named directory of agent-callable files) a first-class
//! managed object: a content-addressed identity, an approval state, a
//! deployment, continuously verified on-disk integrity, and a recoverable
//! backup. The HTTP control plane, vault, proxy, and UI are external
//! collaborators; this crate owns the lifecycle state machine.

pub mod analyze;
pub mod backup;
pub mod config;
pub mod deploy;
pub mod error;
pub mod events;
pub mod fs;
pub mod lifecycle;
pub mod manager;
pub mod remote;
pub mod repo;
pub mod sync;
pub mod types;
pub mod vault;
pub mod watcher;

/// Re-exports of commonly used types
pub mod prelude {
    pub use crate::error::{Result, ShieldError};

    // Entities
    pub use crate::types::{
        AnalysisResult, AnalysisSeverity, AnalysisStatus, ApprovalState, FileEntry,
        InstallStatus, IntegrityPolicy, Skill, SkillFile, SkillInstallation, SkillSource,
        SkillVersion, ViolationAction,
    };

    // Services
    pub use crate::analyze::{AnalyzeAdapter, AnalyzeService};
    pub use crate::backup::BackupStore;
    pub use crate::deploy::{
        DeployAdapter, DeployContext, DeployOutcome, DeployService, IntegrityCheckResult,
        WorkspaceDeployAdapter,
    };
    pub use crate::lifecycle::{
        InstallRequest, InstallService, UninstallService, UpdateService, UploadRequest,
        UploadService,
    };
    pub use crate::repo::Repository;
    pub use crate::sync::{SkillDefinition, SkillSourceAdapter, SyncOrchestrator, SyncReport};
    pub use crate::watcher::{IntegrityWatcher, WatcherOptions};

    // Events
    pub use crate::events::{EventBus, EventReceiver, LifecycleEvent};

    // Wiring
    pub use crate::config::ShieldConfig;
    pub use crate::manager::{ShieldManager, ShieldManagerOptions};
    pub use crate::remote::{HttpMarketplaceClient, MarketplaceClient, RemoteSkill};
}
