//! In-memory zip extraction for skill bundles.
//!
//! Entries must stay inside the archive root: absolute paths and `..`
//! traversal are rejected outright, not skipped.

use std::io::{Cursor, Read};

use anyhow::Context;

use crate::types::FileEntry;

/// Extract a zip archive into in-memory file entries. Directory entries
/// are dropped; file paths are forward-slash normalized.
pub fn extract_zip(bytes: &[u8]) -> anyhow::Result<Vec<FileEntry>> {
    let cursor = Cursor::new(bytes);
    let mut archive =
        zip::ZipArchive::new(cursor).context("Failed to read bytes as zip archive")?;

    let mut out = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .with_context(|| format!("Failed to read zip entry {i}"))?;
        if entry.is_dir() {
            continue;
        }

        let name = entry.name().replace('\\', "/");
        ensure_safe_entry_path(&name)?;

        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to read zip entry: {name}"))?;
        out.push(FileEntry {
            relative_path: name,
            bytes,
        });
    }
    Ok(out)
}

fn ensure_safe_entry_path(name: &str) -> anyhow::Result<()> {
    if name.starts_with('/') {
        anyhow::bail!("Absolute paths not allowed in skill archives: {name}");
    }
    for component in name.split('/') {
        if component == ".." {
            anyhow::bail!("Path traversal not allowed in skill archives: {name}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            for (name, bytes) in entries {
                writer.start_file(*name, options).expect("start_file");
                writer.write_all(bytes).expect("write_all");
            }
            writer.finish().expect("finish");
        }
        buf.into_inner()
    }

    #[test]
    fn extracts_nested_entries() {
        let data = zip_of(&[("SKILL.md", b"# Hello\n"), ("scripts/run.sh", b"echo hi\n")]);
        let files = extract_zip(&data).expect("extract should succeed");
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].relative_path, "SKILL.md");
        assert_eq!(files[1].relative_path, "scripts/run.sh");
        assert_eq!(files[1].bytes, b"echo hi\n");
    }

    #[test]
    fn rejects_path_traversal() {
        let data = zip_of(&[("../evil.sh", b"rm -rf /")]);
        assert!(extract_zip(&data).is_err());
    }

    #[test]
    fn rejects_absolute_paths() {
        let data = zip_of(&[("/etc/passwd", b"x")]);
        assert!(extract_zip(&data).is_err());
    }
}
