//! Direct skill ingestion from in-memory file sets and zip bundles.

use std::sync::Arc;

use tracing::info;

use crate::backup::BackupStore;
use crate::error::Result;
use crate::events::{EventBus, LifecycleEvent, SkillEvent, UploadEvent};
use crate::repo::{NewFile, NewSkill, Repository, VersionIngest};
use crate::types::{ApprovalState, FileEntry, Skill, SkillSource, SkillVersion};

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub name: String,
    pub slug: String,
    pub version: String,
    pub files: Vec<FileEntry>,
    pub source: SkillSource,
    pub remote_id: Option<String>,
    pub trusted: bool,
    pub approval: ApprovalState,
    /// Provenance path of the ingested files, when they came from disk.
    pub folder_path: Option<String>,
    pub metadata_json: Option<serde_json::Value>,
}

impl UploadRequest {
    /// A manual upload: unknown approval, untrusted, no provenance.
    pub fn new(
        name: impl Into<String>,
        slug: impl Into<String>,
        version: impl Into<String>,
        files: Vec<FileEntry>,
    ) -> Self {
        Self {
            name: name.into(),
            slug: slug.into(),
            version: version.into(),
            files,
            source: SkillSource::Manual,
            remote_id: None,
            trusted: false,
            approval: ApprovalState::Unknown,
            folder_path: None,
            metadata_json: None,
        }
    }
}

pub struct UploadService {
    repo: Arc<Repository>,
    backup: Option<Arc<BackupStore>>,
    bus: EventBus,
}

impl UploadService {
    pub fn new(repo: Arc<Repository>, backup: Option<Arc<BackupStore>>, bus: EventBus) -> Self {
        Self { repo, backup, bus }
    }

    /// Ingest a version: hash every file, upsert the skill by slug, record
    /// the version + manifest + content hash atomically, then write the
    /// backup. A failed backup rolls the version row back so no version
    /// ever exists without its recovery copy.
    pub fn upload(&self, request: UploadRequest) -> Result<(Skill, SkillVersion)> {
        let operation_id = uuid::Uuid::new_v4().to_string();
        let slug = request.slug.clone();

        match self.upload_inner(&operation_id, request) {
            Ok(pair) => Ok(pair),
            Err(err) => {
                self.bus.publish(LifecycleEvent::Upload(UploadEvent::Error {
                    operation_id,
                    slug,
                    error: err.to_string(),
                }));
                Err(err)
            }
        }
    }

    fn upload_inner(
        &self,
        operation_id: &str,
        request: UploadRequest,
    ) -> Result<(Skill, SkillVersion)> {
        self.bus.publish(LifecycleEvent::Upload(UploadEvent::Hashing {
            operation_id: operation_id.to_string(),
            slug: request.slug.clone(),
        }));

        let manifest: Vec<NewFile> = request
            .files
            .iter()
            .map(|f| NewFile {
                relative_path: f.relative_path.clone(),
                file_hash: crate::fs::sha256_hex(&f.bytes),
                size_bytes: f.bytes.len() as u64,
            })
            .collect();

        self.bus
            .publish(LifecycleEvent::Upload(UploadEvent::Registering {
                operation_id: operation_id.to_string(),
                slug: request.slug.clone(),
            }));

        let is_new_skill = self.repo.get_by_slug(&request.slug)?.is_none();
        let skill_input = NewSkill {
            slug: request.slug.clone(),
            name: request.name.clone(),
            author: None,
            description: None,
            tags: Vec::new(),
            source: request.source,
            remote_id: request.remote_id.clone(),
            is_public: None,
        };
        let (skill, version) = self.repo.ingest_version(
            skill_input,
            VersionIngest {
                version: request.version.clone(),
                folder_path: request.folder_path.clone(),
                approval: request.approval,
                trusted: request.trusted,
                metadata_json: request.metadata_json.clone(),
                files: manifest,
            },
        )?;

        if let Some(backup) = &self.backup {
            let registered = self.repo.get_files(&version.id)?;
            if let Err(err) = backup.save_files(&version.id, &request.files, &registered) {
                let _ = self.repo.delete_version(&version.id);
                return Err(err);
            }
        }

        if is_new_skill {
            self.bus.publish(LifecycleEvent::Skill(SkillEvent::Created {
                skill_id: skill.id.clone(),
                slug: skill.slug.clone(),
            }));
        }
        self.bus
            .publish(LifecycleEvent::Skill(SkillEvent::VersionCreated {
                version_id: version.id.clone(),
                skill_id: skill.id.clone(),
                slug: skill.slug.clone(),
                version: version.version.clone(),
            }));
        self.bus
            .publish(LifecycleEvent::Upload(UploadEvent::Completed {
                operation_id: operation_id.to_string(),
                slug: skill.slug.clone(),
                version_id: version.id.clone(),
            }));

        info!(slug = %skill.slug, version = %version.version, "skill uploaded");
        Ok((skill, version))
    }

    /// Ingest a skill packaged as a zip archive.
    pub fn upload_archive(
        &self,
        name: impl Into<String>,
        slug: impl Into<String>,
        version: impl Into<String>,
        archive: &[u8],
    ) -> Result<(Skill, SkillVersion)> {
        let files = crate::fs::archive::extract_zip(archive)?;
        self.upload(UploadRequest::new(name, slug, version, files))
    }
}
