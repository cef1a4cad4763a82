//! Analyze adapters and the multi-adapter fan-out service.
//!
//! Every adapter classifies a version's files into an `AnalysisResult`;
//! the service runs all adapters concurrently and merges worst-wins
//! before persisting onto the version.

pub mod metadata;
pub mod remote;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use crate::backup::BackupStore;
use crate::error::{Result, ShieldError};
use crate::events::{AnalyzeEvent, EventBus, LifecycleEvent};
use crate::repo::{AnalysisUpdate, Repository};
use crate::types::{AnalysisResult, AnalysisSeverity, AnalysisStatus, FileEntry, SkillVersion};

pub use metadata::MetadataAnalyzer;
pub use remote::RemoteAnalyzer;

/// Pluggable classifier over a version's file set. Failures should be
/// captured as `{status: error}` results, not raised.
#[async_trait]
pub trait AnalyzeAdapter: Send + Sync {
    fn id(&self) -> &str;

    async fn analyze(&self, version: &SkillVersion, files: &[FileEntry]) -> AnalysisResult;
}

pub struct AnalyzeService {
    repo: Arc<Repository>,
    backup: Option<Arc<BackupStore>>,
    adapters: Vec<Arc<dyn AnalyzeAdapter>>,
    bus: EventBus,
}

impl AnalyzeService {
    pub fn new(
        repo: Arc<Repository>,
        backup: Option<Arc<BackupStore>>,
        adapters: Vec<Arc<dyn AnalyzeAdapter>>,
        bus: EventBus,
    ) -> Self {
        Self {
            repo,
            backup,
            adapters,
            bus,
        }
    }

    /// Analyze one version: fan out to all adapters, merge worst-wins,
    /// persist onto the version row.
    pub async fn analyze_version(&self, version_id: &str) -> Result<AnalysisResult> {
        let version = self
            .repo
            .get_version_by_id(version_id)?
            .ok_or_else(|| ShieldError::VersionNotFound(version_id.to_string()))?;

        let operation_id = uuid::Uuid::new_v4().to_string();
        self.bus
            .publish(LifecycleEvent::Analyze(AnalyzeEvent::Started {
                operation_id: operation_id.clone(),
                version_id: version_id.to_string(),
            }));

        let files = match self.load_bytes(&version) {
            Ok(files) => files,
            Err(err) => {
                self.bus.publish(LifecycleEvent::Analyze(AnalyzeEvent::Error {
                    operation_id,
                    version_id: version_id.to_string(),
                    error: err.to_string(),
                }));
                return Err(err);
            }
        };

        self.bus
            .publish(LifecycleEvent::Analyze(AnalyzeEvent::Parsing {
                operation_id: operation_id.clone(),
                version_id: version_id.to_string(),
            }));

        let version = Arc::new(version);
        let files = Arc::new(files);
        let mut tasks = tokio::task::JoinSet::new();
        for adapter in &self.adapters {
            let adapter = Arc::clone(adapter);
            let version = Arc::clone(&version);
            let files = Arc::clone(&files);
            tasks.spawn(async move {
                let result = adapter.analyze(&version, &files).await;
                (adapter.id().to_string(), result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(pair) => results.push(pair),
                Err(err) => warn!(error = %err, "analyze adapter task panicked"),
            }
        }
        // JoinSet completion order is nondeterministic; keep the merged
        // data keyed deterministically.
        results.sort_by(|a, b| a.0.cmp(&b.0));

        self.bus
            .publish(LifecycleEvent::Analyze(AnalyzeEvent::Extracting {
                operation_id: operation_id.clone(),
                version_id: version_id.to_string(),
            }));

        let merged = merge_results(results);

        self.repo.update_analysis(
            version_id,
            AnalysisUpdate {
                status: if merged.status == AnalysisSeverity::Success {
                    AnalysisStatus::Complete
                } else {
                    AnalysisStatus::Error
                },
                json: serde_json::to_value(&merged).ok(),
                analyzed_at: Some(Utc::now()),
                required_bins: merged.required_bins.clone(),
                required_env: merged.required_env.clone(),
                extracted_commands: merged.extracted_commands.clone(),
            },
        )?;

        self.bus
            .publish(LifecycleEvent::Analyze(AnalyzeEvent::Completed {
                operation_id,
                version_id: version_id.to_string(),
                analysis: merged.clone(),
            }));

        Ok(merged)
    }

    /// Analyze every version still marked pending.
    pub async fn analyze_pending(&self) -> Result<usize> {
        let pending = self.repo.get_pending_analysis()?;
        let mut analyzed = 0;
        for version in pending {
            match self.analyze_version(&version.id).await {
                Ok(_) => analyzed += 1,
                Err(err) => warn!(version = %version.id, error = %err, "analysis failed"),
            }
        }
        Ok(analyzed)
    }

    /// Reset a version to pending and analyze it again.
    pub async fn reanalyze(&self, version_id: &str) -> Result<AnalysisResult> {
        self.repo.reset_analysis(version_id)?;
        self.analyze_version(version_id).await
    }

    /// Byte source for analysis: the verified backup when present, the
    /// source folder otherwise.
    fn load_bytes(&self, version: &SkillVersion) -> Result<Vec<FileEntry>> {
        let manifest = self.repo.get_files(&version.id)?;

        if let Some(backup) = &self.backup {
            if backup.has_backup(&version.id) {
                let map = backup.load_files(&version.id, &manifest)?;
                let mut out: Vec<FileEntry> = map
                    .into_iter()
                    .map(|(relative_path, bytes)| FileEntry {
                        relative_path,
                        bytes,
                    })
                    .collect();
                out.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
                return Ok(out);
            }
        }

        let folder = version.folder_path.as_deref().ok_or_else(|| {
            ShieldError::Other(anyhow::anyhow!(
                "version {} has neither backup nor source folder",
                version.id
            ))
        })?;
        Ok(crate::fs::read_files(std::path::Path::new(folder))?)
    }
}

/// Merge adapter outputs: set-union the requirement arrays, worst-wins the
/// status, and keep a single adapter's `data` verbatim (an object keyed by
/// adapter id once there are several).
pub fn merge_results(results: Vec<(String, AnalysisResult)>) -> AnalysisResult {
    if results.is_empty() {
        return AnalysisResult::success(serde_json::Value::Null);
    }

    let mut status = AnalysisSeverity::Success;
    let mut required_bins = Vec::new();
    let mut required_env = Vec::new();
    let mut extracted_commands = Vec::new();
    let mut errors = Vec::new();

    for (_, result) in &results {
        status = status.max(result.status);
        union_into(&mut required_bins, &result.required_bins);
        union_into(&mut required_env, &result.required_env);
        union_into(&mut extracted_commands, &result.extracted_commands);
        if let Some(error) = &result.error {
            errors.push(error.clone());
        }
    }

    let data = if results.len() == 1 {
        results[0].1.data.clone()
    } else {
        let map: HashMap<&str, &serde_json::Value> = results
            .iter()
            .map(|(id, r)| (id.as_str(), &r.data))
            .collect();
        serde_json::to_value(map).unwrap_or(serde_json::Value::Null)
    };

    AnalysisResult {
        status,
        data,
        required_bins,
        required_env,
        extracted_commands,
        error: if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        },
    }
}

fn union_into(target: &mut Vec<String>, source: &[String]) {
    for item in source {
        if !target.iter().any(|t| t == item) {
            target.push(item.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(status: AnalysisSeverity, bins: &[&str]) -> AnalysisResult {
        AnalysisResult {
            status,
            data: json!({"status": status.as_str()}),
            required_bins: bins.iter().map(|s| s.to_string()).collect(),
            required_env: vec![],
            extracted_commands: vec![],
            error: None,
        }
    }

    #[test]
    fn single_adapter_data_passes_through_verbatim() {
        let merged = merge_results(vec![(
            "meta".into(),
            result(AnalysisSeverity::Success, &["bash"]),
        )]);
        assert_eq!(merged.data, json!({"status": "success"}));
        assert_eq!(merged.required_bins, vec!["bash"]);
    }

    #[test]
    fn multiple_adapters_key_data_by_id_and_union_bins() {
        let merged = merge_results(vec![
            ("meta".into(), result(AnalysisSeverity::Success, &["bash", "jq"])),
            ("remote".into(), result(AnalysisSeverity::Warning, &["jq", "curl"])),
        ]);
        assert_eq!(merged.status, AnalysisSeverity::Warning);
        assert_eq!(merged.required_bins, vec!["bash", "jq", "curl"]);
        assert!(merged.data.get("meta").is_some());
        assert!(merged.data.get("remote").is_some());
    }

    #[test]
    fn worst_status_wins() {
        let merged = merge_results(vec![
            ("a".into(), result(AnalysisSeverity::Success, &[])),
            ("b".into(), result(AnalysisSeverity::Error, &[])),
            ("c".into(), result(AnalysisSeverity::Warning, &[])),
        ]);
        assert_eq!(merged.status, AnalysisSeverity::Error);
    }
}
