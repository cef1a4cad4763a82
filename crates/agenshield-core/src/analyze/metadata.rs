//! Metadata-only analyzer.
//!
//! Inspects well-known manifest files by name (`SKILL.md`, `skill.json`,
//! `package.json`) and unions whatever explicit requirement fields they
//! declare. Never touches the network; never fails.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::types::{AnalysisResult, AnalysisSeverity, FileEntry, SkillVersion};

use super::AnalyzeAdapter;

pub const METADATA_ANALYZER_ID: &str = "metadata";

#[derive(Debug, Default)]
pub struct MetadataAnalyzer;

impl MetadataAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AnalyzeAdapter for MetadataAnalyzer {
    fn id(&self) -> &str {
        METADATA_ANALYZER_ID
    }

    async fn analyze(&self, version: &SkillVersion, files: &[FileEntry]) -> AnalysisResult {
        let mut required_bins = Vec::new();
        let mut required_env = Vec::new();
        let mut extracted_commands = Vec::new();
        let mut manifests = Vec::new();

        for file in files {
            match file.relative_path.as_str() {
                "skill.json" => {
                    if let Ok(value) = serde_json::from_slice::<Value>(&file.bytes) {
                        union_str_array(&mut required_bins, &value, "requiredBins");
                        union_str_array(&mut required_env, &value, "requiredEnv");
                        union_str_array(&mut extracted_commands, &value, "commands");
                        manifests.push(json!({"file": "skill.json", "manifest": value}));
                    }
                }
                "package.json" => {
                    if let Ok(value) = serde_json::from_slice::<Value>(&file.bytes) {
                        if let Some(scripts) = value.get("scripts").and_then(Value::as_object) {
                            for script in scripts.values() {
                                if let Some(cmd) = script.as_str() {
                                    push_unique(&mut extracted_commands, cmd);
                                }
                            }
                        }
                        if value.get("scripts").is_some() || value.get("bin").is_some() {
                            push_unique(&mut required_bins, "node");
                        }
                        manifests.push(json!({"file": "package.json", "manifest": value}));
                    }
                }
                "SKILL.md" => {
                    if let Ok(text) = std::str::from_utf8(&file.bytes) {
                        for command in fenced_shell_commands(text) {
                            push_unique(&mut extracted_commands, &command);
                        }
                        manifests.push(json!({"file": "SKILL.md"}));
                    }
                }
                _ => {}
            }
        }

        // Explicit metadata on the version participates too.
        if let Some(meta) = &version.metadata_json {
            union_str_array(&mut required_bins, meta, "requiredBins");
            union_str_array(&mut required_env, meta, "requiredEnv");
        }

        AnalysisResult {
            status: AnalysisSeverity::Success,
            data: json!({
                "fileCount": files.len(),
                "manifests": manifests,
            }),
            required_bins,
            required_env,
            extracted_commands,
            error: None,
        }
    }
}

fn union_str_array(target: &mut Vec<String>, value: &Value, key: &str) {
    if let Some(items) = value.get(key).and_then(Value::as_array) {
        for item in items {
            if let Some(s) = item.as_str() {
                push_unique(target, s);
            }
        }
    }
}

fn push_unique(target: &mut Vec<String>, value: &str) {
    if !target.iter().any(|t| t == value) {
        target.push(value.to_string());
    }
}

/// Commands inside ```sh / ```bash / ```shell fenced blocks, one per line.
fn fenced_shell_commands(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut in_shell_block = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(lang) = trimmed.strip_prefix("```") {
            if in_shell_block {
                in_shell_block = false;
            } else {
                in_shell_block = matches!(lang.trim(), "sh" | "bash" | "shell");
            }
            continue;
        }
        if in_shell_block && !trimmed.is_empty() && !trimmed.starts_with('#') {
            out.push(trimmed.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AnalysisStatus, ApprovalState};
    use chrono::Utc;

    fn version_with_metadata(metadata: Option<serde_json::Value>) -> SkillVersion {
        SkillVersion {
            id: "v1".into(),
            skill_id: "s1".into(),
            version: "1.0.0".into(),
            folder_path: None,
            content_hash: String::new(),
            hash_updated_at: None,
            approval: ApprovalState::Unknown,
            approved_at: Some(Utc::now()),
            trusted: false,
            analysis_status: AnalysisStatus::Pending,
            analysis_json: None,
            analyzed_at: None,
            required_bins: vec![],
            required_env: vec![],
            extracted_commands: vec![],
            metadata_json: metadata,
        }
    }

    #[tokio::test]
    async fn unions_skill_json_fields() {
        let analyzer = MetadataAnalyzer::new();
        let files = vec![FileEntry::new(
            "skill.json",
            br#"{"requiredBins": ["jq"], "requiredEnv": ["API_KEY"], "commands": ["jq ."]}"#
                .to_vec(),
        )];
        let result = analyzer.analyze(&version_with_metadata(None), &files).await;
        assert_eq!(result.status, AnalysisSeverity::Success);
        assert_eq!(result.required_bins, vec!["jq"]);
        assert_eq!(result.required_env, vec!["API_KEY"]);
        assert_eq!(result.extracted_commands, vec!["jq ."]);
    }

    #[tokio::test]
    async fn extracts_fenced_shell_commands() {
        let analyzer = MetadataAnalyzer::new();
        let files = vec![FileEntry::new(
            "SKILL.md",
            b"# Hello\n```sh\necho hi\ncurl https://example.com\n```\n```python\nprint()\n```\n"
                .to_vec(),
        )];
        let result = analyzer.analyze(&version_with_metadata(None), &files).await;
        assert_eq!(
            result.extracted_commands,
            vec!["echo hi", "curl https://example.com"]
        );
    }

    #[tokio::test]
    async fn version_metadata_participates() {
        let analyzer = MetadataAnalyzer::new();
        let version =
            version_with_metadata(Some(serde_json::json!({"requiredBins": ["python3"]})));
        let result = analyzer.analyze(&version, &[]).await;
        assert_eq!(result.required_bins, vec!["python3"]);
    }
}
