//! Error taxonomy for the lifecycle core.
//!
//! Services translate failures into these categories or into `*:error`
//! events; repository transactions never partially apply, and the watcher
//! converts every error into an event instead of crashing the process.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShieldError>;

#[derive(Debug, Error)]
pub enum ShieldError {
    /// Slug uniqueness violation on skill creation. Not retried.
    #[error("skill slug already exists: {0}")]
    SlugConflict(String),

    /// (skillId, version) uniqueness violation. Not retried.
    #[error("version '{version}' already exists for skill {skill_id}")]
    VersionConflict { skill_id: String, version: String },

    #[error("skill not found: {0}")]
    SkillNotFound(String),

    #[error("skill version not found: {0}")]
    VersionNotFound(String),

    #[error("skill file not found: {0}")]
    FileNotFound(String),

    #[error("installation not found: {0}")]
    InstallationNotFound(String),

    #[error("remote skill not found: {0}")]
    RemoteSkillNotFound(String),

    /// Any non-2xx response from the remote marketplace or analyzer.
    #[error("remote api error: HTTP {status}: {body}")]
    RemoteApi { status: u16, body: String },

    /// Analyze adapter failure. Captured into the AnalysisResult as
    /// `{status: error}` where possible rather than propagated.
    #[error("analysis failed: {message}")]
    Analysis {
        status: Option<u16>,
        message: String,
    },

    /// A backup byte stream no longer matches its registered hash. Fatal
    /// for the reinstall attempt; operator intervention required.
    #[error("backup for version {0} failed hash verification")]
    BackupTamper(String),

    /// The policy-set HMAC did not verify against the vault-stored value.
    #[error("config integrity verification failed")]
    ConfigTamper,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ShieldError {
    /// Whether the error is a uniqueness conflict (caller bug or benign
    /// race, never retried internally).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ShieldError::SlugConflict(_) | ShieldError::VersionConflict { .. }
        )
    }
}
