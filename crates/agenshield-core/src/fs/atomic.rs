//! Atomic directory replacement: stage into a sibling temp path, then
//! rename into place. A failed stage never leaves a partial destination.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;

/// Allocate a unique dot-prefixed temp path next to `dst`.
pub fn unique_temp_path(dst: &Path) -> anyhow::Result<PathBuf> {
    let parent = dst
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Destination path has no parent: {}", dst.display()))?;
    let base = dst
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Destination path has no filename: {}", dst.display()))?;

    for attempt in 0u32..1000 {
        let name = if attempt == 0 {
            format!(".{}.tmp.{}", base.to_string_lossy(), std::process::id())
        } else {
            format!(
                ".{}.tmp.{}.{}",
                base.to_string_lossy(),
                std::process::id(),
                attempt
            )
        };
        let candidate = parent.join(name);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }

    anyhow::bail!("Failed to allocate a unique temp path for {}", dst.display());
}

/// Remove a file or directory tree, tolerating absence.
pub fn remove_path(path: &Path) -> anyhow::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if meta.is_dir() {
                fs::remove_dir_all(path)
                    .with_context(|| format!("Failed to remove directory: {}", path.display()))?;
            } else {
                fs::remove_file(path)
                    .with_context(|| format!("Failed to remove file: {}", path.display()))?;
            }
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(anyhow::Error::new(err).context(format!("Failed to stat: {}", path.display())))
        }
    }
}

/// Stage a directory via `populate`, then swap it into `dst`. The staging
/// directory is cleaned up on failure; the destination is replaced only
/// after a fully successful stage.
pub fn replace_dir_atomic(
    dst: &Path,
    populate: impl FnOnce(&Path) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent directory: {}", parent.display()))?;
    }

    let tmp = unique_temp_path(dst)?;
    fs::create_dir_all(&tmp)
        .with_context(|| format!("Failed to create temp directory: {}", tmp.display()))?;

    if let Err(err) = populate(&tmp) {
        let _ = fs::remove_dir_all(&tmp);
        return Err(err);
    }

    remove_path(dst)?;
    fs::rename(&tmp, dst).with_context(|| {
        format!(
            "Failed to move temp path {} into destination {}",
            tmp.display(),
            dst.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn replace_swaps_full_tree() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let dst = tmp.path().join("skill");
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("stale.txt"), "old").unwrap();

        replace_dir_atomic(&dst, |stage| {
            fs::write(stage.join("fresh.txt"), "new")?;
            Ok(())
        })
        .expect("replace should succeed");

        assert!(dst.join("fresh.txt").exists());
        assert!(!dst.join("stale.txt").exists());
    }

    #[test]
    fn failed_stage_leaves_destination_untouched() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let dst = tmp.path().join("skill");
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("keep.txt"), "keep").unwrap();

        let result = replace_dir_atomic(&dst, |_| anyhow::bail!("stage failed"));
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(dst.join("keep.txt")).unwrap(), "keep");
    }
}
