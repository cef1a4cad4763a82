//! Core entities and state enums.
//!
//! The repository is the sole owner of persisted instances of these types;
//! everything here is plain data with serde representations matching the
//! store's string forms.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a skill entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillSource {
    Marketplace,
    Manual,
    Watcher,
    Integration,
    Unknown,
}

impl SkillSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillSource::Marketplace => "marketplace",
            SkillSource::Manual => "manual",
            SkillSource::Watcher => "watcher",
            SkillSource::Integration => "integration",
            SkillSource::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "marketplace" => SkillSource::Marketplace,
            "manual" => SkillSource::Manual,
            "watcher" => SkillSource::Watcher,
            "integration" => SkillSource::Integration,
            _ => SkillSource::Unknown,
        }
    }
}

/// Approval state of a skill version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Unknown,
    Approved,
    Quarantined,
}

impl ApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalState::Unknown => "unknown",
            ApprovalState::Approved => "approved",
            ApprovalState::Quarantined => "quarantined",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "approved" => ApprovalState::Approved,
            "quarantined" => ApprovalState::Quarantined,
            _ => ApprovalState::Unknown,
        }
    }
}

/// Lifecycle state of an installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Pending,
    Active,
    Disabled,
    Quarantined,
}

impl InstallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallStatus::Pending => "pending",
            InstallStatus::Active => "active",
            InstallStatus::Disabled => "disabled",
            InstallStatus::Quarantined => "quarantined",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => InstallStatus::Active,
            "disabled" => InstallStatus::Disabled,
            "quarantined" => InstallStatus::Quarantined,
            _ => InstallStatus::Pending,
        }
    }
}

/// Analysis progress for a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Complete,
    Error,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Complete => "complete",
            AnalysisStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "complete" => AnalysisStatus::Complete,
            "error" => AnalysisStatus::Error,
            _ => AnalysisStatus::Pending,
        }
    }
}

/// What the watcher does to a tampered installation.
///
/// `Quarantine` is strictly harsher than `Reinstall`; when a violation has
/// both modified and missing files the harsher of the two policy levers
/// wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationAction {
    Reinstall,
    Quarantine,
}

impl ViolationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationAction::Reinstall => "reinstall",
            ViolationAction::Quarantine => "quarantine",
        }
    }

    /// The stricter of two actions.
    pub fn stricter(self, other: ViolationAction) -> ViolationAction {
        if self == ViolationAction::Quarantine || other == ViolationAction::Quarantine {
            ViolationAction::Quarantine
        } else {
            ViolationAction::Reinstall
        }
    }
}

/// Per-installation tamper policy. A process-wide default applies unless an
/// installation carries an override; overrides merge field-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityPolicy {
    pub on_modified: ViolationAction,
    pub on_deleted: ViolationAction,
}

impl Default for IntegrityPolicy {
    fn default() -> Self {
        Self {
            on_modified: ViolationAction::Reinstall,
            on_deleted: ViolationAction::Reinstall,
        }
    }
}

/// Field-wise override for a single installation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityPolicyOverride {
    pub on_modified: Option<ViolationAction>,
    pub on_deleted: Option<ViolationAction>,
}

impl IntegrityPolicy {
    pub fn merged(&self, over: &IntegrityPolicyOverride) -> IntegrityPolicy {
        IntegrityPolicy {
            on_modified: over.on_modified.unwrap_or(self.on_modified),
            on_deleted: over.on_deleted.unwrap_or(self.on_deleted),
        }
    }
}

/// The logical skill identity. Slug is globally unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub source: SkillSource,
    pub remote_id: Option<String>,
    pub is_public: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One content-addressed revision of a skill.
///
/// `content_hash` is SHA-256 over the lowercase-hex per-file hashes,
/// concatenated after sorting entries by relative path (byte-wise).
/// `folder_path` is provenance only and is never a deployment target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillVersion {
    pub id: String,
    pub skill_id: String,
    pub version: String,
    pub folder_path: Option<String>,
    pub content_hash: String,
    pub hash_updated_at: Option<DateTime<Utc>>,
    pub approval: ApprovalState,
    pub approved_at: Option<DateTime<Utc>>,
    pub trusted: bool,
    pub analysis_status: AnalysisStatus,
    pub analysis_json: Option<serde_json::Value>,
    pub analyzed_at: Option<DateTime<Utc>>,
    pub required_bins: Vec<String>,
    pub required_env: Vec<String>,
    pub extracted_commands: Vec<String>,
    pub metadata_json: Option<serde_json::Value>,
}

/// Per-version file manifest entry. `relative_path` is forward-slash
/// normalized and unique within the version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillFile {
    pub id: String,
    pub skill_version_id: String,
    pub relative_path: String,
    pub file_hash: String,
    pub size_bytes: u64,
}

/// A decision to deploy a specific version to a specific target. At most
/// one active installation per (skill, target).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillInstallation {
    pub id: String,
    pub skill_version_id: String,
    pub profile_id: Option<String>,
    pub target_id: Option<String>,
    pub user_username: Option<String>,
    pub status: InstallStatus,
    pub auto_update: bool,
    pub pinned_version: Option<String>,
    pub wrapper_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Worst-wins severity for merged analysis results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSeverity {
    Success,
    Warning,
    Error,
}

impl AnalysisSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisSeverity::Success => "success",
            AnalysisSeverity::Warning => "warning",
            AnalysisSeverity::Error => "error",
        }
    }
}

/// Output of one analyze adapter, or of the merged fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub status: AnalysisSeverity,
    pub data: serde_json::Value,
    #[serde(default)]
    pub required_bins: Vec<String>,
    #[serde(default)]
    pub required_env: Vec<String>,
    #[serde(default)]
    pub extracted_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalysisResult {
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            status: AnalysisSeverity::Success,
            data,
            required_bins: Vec::new(),
            required_env: Vec::new(),
            extracted_commands: Vec::new(),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: AnalysisSeverity::Error,
            data: serde_json::Value::Null,
            required_bins: Vec::new(),
            required_env: Vec::new(),
            extracted_commands: Vec::new(),
            error: Some(message.into()),
        }
    }
}

/// An in-memory file being ingested (upload, download, sync, drop scan).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub relative_path: String,
    pub bytes: Vec<u8>,
}

impl FileEntry {
    pub fn new(relative_path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            relative_path: relative_path.into(),
            bytes: bytes.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stricter_action_prefers_quarantine() {
        assert_eq!(
            ViolationAction::Reinstall.stricter(ViolationAction::Quarantine),
            ViolationAction::Quarantine
        );
        assert_eq!(
            ViolationAction::Reinstall.stricter(ViolationAction::Reinstall),
            ViolationAction::Reinstall
        );
    }

    #[test]
    fn policy_override_merges_field_wise() {
        let base = IntegrityPolicy::default();
        let over = IntegrityPolicyOverride {
            on_modified: Some(ViolationAction::Quarantine),
            on_deleted: None,
        };
        let merged = base.merged(&over);
        assert_eq!(merged.on_modified, ViolationAction::Quarantine);
        assert_eq!(merged.on_deleted, ViolationAction::Reinstall);
    }

    #[test]
    fn enum_string_round_trips() {
        for s in ["marketplace", "manual", "watcher", "integration", "unknown"] {
            assert_eq!(SkillSource::parse(s).as_str(), s);
        }
        for s in ["unknown", "approved", "quarantined"] {
            assert_eq!(ApprovalState::parse(s).as_str(), s);
        }
        for s in ["pending", "active", "disabled", "quarantined"] {
            assert_eq!(InstallStatus::parse(s).as_str(), s);
        }
    }
}
