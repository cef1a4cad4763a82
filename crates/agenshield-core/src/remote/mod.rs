//! Marketplace client contract and its HTTP implementation.
//!
//! The marketplace service itself is an external collaborator; the core
//! depends only on this contract: resolve a remote descriptor, report the
//! latest version string, and download a version's file set.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShieldError};
use crate::types::FileEntry;

/// Descriptor of a skill as the marketplace reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSkill {
    #[serde(rename = "remoteId")]
    pub remote_id: String,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(rename = "latestVersion")]
    pub latest_version: String,
    #[serde(default, rename = "isPublic")]
    pub is_public: Option<bool>,
}

#[async_trait]
pub trait MarketplaceClient: Send + Sync {
    async fn get_skill(&self, remote_id: &str) -> Result<RemoteSkill>;

    async fn get_latest_version(&self, remote_id: &str) -> Result<String>;

    /// Download the full file set of one version.
    async fn download_version(&self, remote_id: &str, version: &str) -> Result<Vec<FileEntry>>;
}

/// Absolute deadline for a version download.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(90);

pub struct HttpMarketplaceClient {
    base: url::Url,
    client: reqwest::Client,
    download_timeout: Duration,
}

impl HttpMarketplaceClient {
    pub fn new(base: url::Url) -> Self {
        Self {
            base,
            client: reqwest::Client::new(),
            download_timeout: DOWNLOAD_TIMEOUT,
        }
    }

    fn endpoint(&self, path: &str) -> Result<url::Url> {
        self.base
            .join(path)
            .map_err(|e| ShieldError::Other(anyhow::anyhow!("invalid marketplace url: {e}")))
    }
}

#[async_trait]
impl MarketplaceClient for HttpMarketplaceClient {
    async fn get_skill(&self, remote_id: &str) -> Result<RemoteSkill> {
        let url = self.endpoint(&format!("skills/{remote_id}"))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ShieldError::Other(anyhow::anyhow!("marketplace request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(ShieldError::RemoteSkillNotFound(remote_id.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ShieldError::RemoteApi {
                status: status.as_u16(),
                body,
            });
        }

        let skill = response
            .json::<RemoteSkill>()
            .await
            .map_err(|e| ShieldError::Other(anyhow::anyhow!("invalid descriptor: {e}")))?;
        Ok(skill)
    }

    async fn get_latest_version(&self, remote_id: &str) -> Result<String> {
        Ok(self.get_skill(remote_id).await?.latest_version)
    }

    async fn download_version(&self, remote_id: &str, version: &str) -> Result<Vec<FileEntry>> {
        let url = self.endpoint(&format!("skills/{remote_id}/versions/{version}/archive"))?;

        let fetch = async {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| ShieldError::Other(anyhow::anyhow!("download failed: {e}")))?;
            let status = response.status();
            if status.as_u16() == 404 {
                return Err(ShieldError::RemoteSkillNotFound(remote_id.to_string()));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ShieldError::RemoteApi {
                    status: status.as_u16(),
                    body,
                });
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ShieldError::Other(anyhow::anyhow!("download failed: {e}")))?;
            Ok(crate::fs::archive::extract_zip(&bytes)?)
        };

        match tokio::time::timeout(self.download_timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(ShieldError::Other(anyhow::anyhow!("timeout"))),
        }
    }
}
