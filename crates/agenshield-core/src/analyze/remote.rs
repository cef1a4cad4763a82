//! Remote analyzer client.
//!
//! POSTs a version's readable text files to an external analysis endpoint
//! and consumes its newline-delimited JSON stream, keeping the single
//! `{type: "done", data: summary}` record. Network, timeout, and
//! empty-input failures are captured into an error result instead of
//! propagating.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::types::{AnalysisResult, AnalysisSeverity, FileEntry, SkillVersion};

use super::AnalyzeAdapter;

pub const REMOTE_ANALYZER_ID: &str = "remote";

/// Per-file size cap for submission.
const MAX_FILE_BYTES: usize = 100 * 1024;
/// At most this many files per submission.
const MAX_FILES: usize = 20;
/// Absolute per-call deadline.
const ANALYZE_TIMEOUT: Duration = Duration::from_secs(240);

pub struct RemoteAnalyzer {
    endpoint: url::Url,
    client: reqwest::Client,
    timeout: Duration,
}

impl RemoteAnalyzer {
    pub fn new(endpoint: url::Url) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
            timeout: ANALYZE_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn submit(&self, version: &SkillVersion, files: &[FileEntry]) -> anyhow::Result<Value> {
        let readable: Vec<&FileEntry> = files
            .iter()
            .filter(|f| f.bytes.len() <= MAX_FILE_BYTES && std::str::from_utf8(&f.bytes).is_ok())
            .take(MAX_FILES)
            .collect();
        if readable.is_empty() {
            anyhow::bail!("no readable text files to analyze");
        }

        let body = json!({
            "version": version.version,
            "files": readable
                .iter()
                .map(|f| {
                    json!({
                        "path": f.relative_path,
                        "content": String::from_utf8_lossy(&f.bytes),
                    })
                })
                .collect::<Vec<_>>(),
        });

        debug!(
            version = %version.id,
            files = readable.len(),
            "submitting files for remote analysis"
        );

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("remote analyzer returned HTTP {}", status.as_u16());
        }

        // Newline-delimited JSON; the terminal record carries the summary.
        let text = response.text().await?;
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let record: Value = match serde_json::from_str(trimmed) {
                Ok(record) => record,
                Err(_) => continue,
            };
            if record.get("type").and_then(Value::as_str) == Some("done") {
                return Ok(record.get("data").cloned().unwrap_or(Value::Null));
            }
        }
        anyhow::bail!("remote analyzer stream ended without a done record");
    }
}

#[async_trait]
impl AnalyzeAdapter for RemoteAnalyzer {
    fn id(&self) -> &str {
        REMOTE_ANALYZER_ID
    }

    async fn analyze(&self, version: &SkillVersion, files: &[FileEntry]) -> AnalysisResult {
        let summary = match tokio::time::timeout(self.timeout, self.submit(version, files)).await
        {
            Ok(Ok(summary)) => summary,
            Ok(Err(err)) => return AnalysisResult::error(err.to_string()),
            Err(_) => return AnalysisResult::error("timeout"),
        };

        let level = summary
            .get("vulnerabilityLevel")
            .or_else(|| summary.get("level"))
            .and_then(Value::as_str)
            .unwrap_or("none");
        let status = match level {
            "critical" | "high" => AnalysisSeverity::Error,
            _ => AnalysisSeverity::Success,
        };

        AnalysisResult {
            status,
            data: summary.clone(),
            required_bins: str_array(&summary, "requiredBins"),
            required_env: str_array(&summary, "requiredEnv"),
            extracted_commands: str_array(&summary, "commands"),
            error: None,
        }
    }
}

fn str_array(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
