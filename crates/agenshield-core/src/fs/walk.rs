//! Recursive file collection with forward-slash normalized relative paths.

use std::path::{Path, PathBuf};

use anyhow::Context;

/// A file discovered under a skill directory.
#[derive(Debug, Clone)]
pub struct CollectedFile {
    /// Forward-slash relative path under the root.
    pub relative_path: String,
    /// Absolute path on disk.
    pub path: PathBuf,
}

/// Collect all non-hidden files under `root`, depth-first, sorted by
/// relative path. Hidden entries (leading dot) are skipped at every level.
/// Symlinks are rejected; a skill directory is plain files only.
pub fn collect_files(root: &Path) -> anyhow::Result<Vec<CollectedFile>> {
    let mut out = Vec::new();
    collect_recursive(root, "", &mut out)?;
    out.sort_by(|a, b| a.relative_path.as_bytes().cmp(b.relative_path.as_bytes()));
    Ok(out)
}

fn collect_recursive(dir: &Path, base: &str, out: &mut Vec<CollectedFile>) -> anyhow::Result<()> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?;

    for entry in entries {
        let entry =
            entry.with_context(|| format!("Failed to read directory entry: {}", dir.display()))?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if name_str.starts_with('.') {
            continue;
        }
        let rel_path = if base.is_empty() {
            name_str.to_string()
        } else {
            format!("{}/{}", base, name_str)
        };

        let ty = entry
            .file_type()
            .with_context(|| format!("Failed to stat entry: {}", entry.path().display()))?;
        if ty.is_dir() {
            collect_recursive(&entry.path(), &rel_path, out)?;
        } else if ty.is_file() {
            out.push(CollectedFile {
                relative_path: rel_path,
                path: entry.path(),
            });
        } else {
            anyhow::bail!(
                "Unsupported filesystem entry type: {}",
                entry.path().display()
            );
        }
    }
    Ok(())
}

/// Collect and read all non-hidden files under `root` into memory.
pub fn read_files(root: &Path) -> anyhow::Result<Vec<crate::types::FileEntry>> {
    let mut out = Vec::new();
    for file in collect_files(root)? {
        let bytes = std::fs::read(&file.path)
            .with_context(|| format!("Failed to read file: {}", file.path.display()))?;
        out.push(crate::types::FileEntry {
            relative_path: file.relative_path,
            bytes,
        });
    }
    Ok(out)
}
