//! Content-addressed backup store, the recovery ground truth.
//!
//! Layout: `{backupDir}/{versionId}/` holds one file per manifest
//! relative path, verbatim, nothing else. Every byte stream is verified
//! against its registered file hash on save and again on load; a backup
//! that stops verifying is treated as tampered and unusable.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::error::{Result, ShieldError};
use crate::fs::{remove_path, replace_dir_atomic, sha256_hex};
use crate::types::{FileEntry, SkillFile};

pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    /// Open the store rooted at `root`, creating it with restrictive
    /// permissions when absent. The root is resolved to an absolute path.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create backup root: {}", root.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&root, fs::Permissions::from_mode(0o700))
                .with_context(|| format!("Failed to restrict backup root: {}", root.display()))?;
        }

        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve backup root: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn version_dir(&self, version_id: &str) -> PathBuf {
        self.root.join(version_id)
    }

    /// Atomically write a version's full file set. Fails without touching
    /// an existing backup if any byte stream does not match its registered
    /// hash, or if the manifest and the file set disagree.
    pub fn save_files(
        &self,
        version_id: &str,
        files: &[FileEntry],
        manifest: &[SkillFile],
    ) -> Result<()> {
        let expected: HashMap<&str, &SkillFile> = manifest
            .iter()
            .map(|f| (f.relative_path.as_str(), f))
            .collect();

        if files.len() != manifest.len() {
            return Err(ShieldError::Other(anyhow::anyhow!(
                "backup for version {version_id}: {} files supplied, {} registered",
                files.len(),
                manifest.len()
            )));
        }
        for file in files {
            let registered = expected.get(file.relative_path.as_str()).ok_or_else(|| {
                ShieldError::Other(anyhow::anyhow!(
                    "backup for version {version_id}: unregistered file {}",
                    file.relative_path
                ))
            })?;
            let actual = sha256_hex(&file.bytes);
            if actual != registered.file_hash {
                return Err(ShieldError::Other(anyhow::anyhow!(
                    "backup for version {version_id}: hash mismatch for {}",
                    file.relative_path
                )));
            }
        }

        let dir = self.version_dir(version_id);
        replace_dir_atomic(&dir, |stage| {
            for file in files {
                let path = stage.join(&file.relative_path);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create backup subdirectory: {}", parent.display())
                    })?;
                }
                fs::write(&path, &file.bytes)
                    .with_context(|| format!("Failed to write backup file: {}", path.display()))?;
            }
            Ok(())
        })?;

        debug!(version_id, files = files.len(), "backup saved");
        Ok(())
    }

    pub fn has_backup(&self, version_id: &str) -> bool {
        self.version_dir(version_id).is_dir()
    }

    /// Load and verify a version's full file set. Any stream whose SHA-256
    /// no longer matches the registered hash (including a missing file)
    /// fails the whole load with `BackupTamper`.
    pub fn load_files(
        &self,
        version_id: &str,
        manifest: &[SkillFile],
    ) -> Result<HashMap<String, Vec<u8>>> {
        let dir = self.version_dir(version_id);
        let mut out = HashMap::new();

        for entry in manifest {
            let path = dir.join(&entry.relative_path);
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(_) => return Err(ShieldError::BackupTamper(version_id.to_string())),
            };
            if sha256_hex(&bytes) != entry.file_hash {
                return Err(ShieldError::BackupTamper(version_id.to_string()));
            }
            out.insert(entry.relative_path.clone(), bytes);
        }
        Ok(out)
    }

    /// Convenience read of the backup's `SKILL.md`, unverified.
    pub fn load_skill_md(&self, version_id: &str) -> Option<String> {
        fs::read_to_string(self.version_dir(version_id).join("SKILL.md")).ok()
    }

    pub fn delete_backup(&self, version_id: &str) -> Result<()> {
        remove_path(&self.version_dir(version_id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest_for(files: &[FileEntry], version_id: &str) -> Vec<SkillFile> {
        files
            .iter()
            .enumerate()
            .map(|(i, f)| SkillFile {
                id: format!("file-{i}"),
                skill_version_id: version_id.to_string(),
                relative_path: f.relative_path.clone(),
                file_hash: sha256_hex(&f.bytes),
                size_bytes: f.bytes.len() as u64,
            })
            .collect()
    }

    #[test]
    fn save_and_load_round_trips_byte_exact() {
        let tmp = TempDir::new().unwrap();
        let store = BackupStore::new(tmp.path().join("backups")).unwrap();
        let files = vec![
            FileEntry::new("SKILL.md", b"# Hello\n".to_vec()),
            FileEntry::new("nested/run.sh", b"#!/bin/sh\necho hi\n".to_vec()),
        ];
        let manifest = manifest_for(&files, "v1");

        store.save_files("v1", &files, &manifest).unwrap();
        assert!(store.has_backup("v1"));

        let loaded = store.load_files("v1", &manifest).unwrap();
        assert_eq!(loaded["SKILL.md"], b"# Hello\n");
        assert_eq!(loaded["nested/run.sh"], b"#!/bin/sh\necho hi\n");
    }

    #[test]
    fn save_rejects_mismatched_bytes() {
        let tmp = TempDir::new().unwrap();
        let store = BackupStore::new(tmp.path().join("backups")).unwrap();
        let files = vec![FileEntry::new("SKILL.md", b"# Hello\n".to_vec())];
        let mut manifest = manifest_for(&files, "v1");
        manifest[0].file_hash = sha256_hex(b"something else");

        assert!(store.save_files("v1", &files, &manifest).is_err());
        assert!(!store.has_backup("v1"));
    }

    #[test]
    fn tampered_backup_fails_load() {
        let tmp = TempDir::new().unwrap();
        let store = BackupStore::new(tmp.path().join("backups")).unwrap();
        let files = vec![FileEntry::new("SKILL.md", b"# Hello\n".to_vec())];
        let manifest = manifest_for(&files, "v1");
        store.save_files("v1", &files, &manifest).unwrap();

        std::fs::write(store.root().join("v1").join("SKILL.md"), "# HACKED\n").unwrap();

        let err = store.load_files("v1", &manifest).unwrap_err();
        assert!(matches!(err, ShieldError::BackupTamper(id) if id == "v1"));
    }

    #[test]
    fn missing_backup_file_is_tamper() {
        let tmp = TempDir::new().unwrap();
        let store = BackupStore::new(tmp.path().join("backups")).unwrap();
        let files = vec![FileEntry::new("SKILL.md", b"# Hello\n".to_vec())];
        let manifest = manifest_for(&files, "v1");
        store.save_files("v1", &files, &manifest).unwrap();

        std::fs::remove_file(store.root().join("v1").join("SKILL.md")).unwrap();
        assert!(matches!(
            store.load_files("v1", &manifest),
            Err(ShieldError::BackupTamper(_))
        ));
    }

    #[test]
    fn delete_backup_removes_directory() {
        let tmp = TempDir::new().unwrap();
        let store = BackupStore::new(tmp.path().join("backups")).unwrap();
        let files = vec![FileEntry::new("SKILL.md", b"x".to_vec())];
        let manifest = manifest_for(&files, "v1");
        store.save_files("v1", &files, &manifest).unwrap();

        store.delete_backup("v1").unwrap();
        assert!(!store.has_backup("v1"));
    }
}
