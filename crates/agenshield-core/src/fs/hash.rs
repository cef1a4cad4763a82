//! Content addressing.
//!
//! A file's identity is the SHA-256 of its bytes. A version's identity is
//! the SHA-256 over the lowercase-hex file hashes concatenated after
//! sorting entries by relative path with plain byte-wise comparison of the
//! UTF-8 path (no locale, no Unicode normalization; ASCII uppercase sorts
//! before lowercase).

use std::io::Read;
use std::path::Path;

use anyhow::Context;
use sha2::{Digest, Sha256};

/// SHA-256 of a byte slice as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Streaming SHA-256 of a file. Returns `(hash, size_bytes)`.
pub fn hash_file(path: &Path) -> anyhow::Result<(String, u64)> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size: u64 = 0;
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read file: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Canonical content hash of a version: sort `(relative_path, file_hash)`
/// pairs by path, concatenate the lowercase-hex hashes, SHA-256 the result.
pub fn content_hash(entries: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = entries.iter().collect();
    sorted.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    let mut hasher = Sha256::new();
    for (_, file_hash) in sorted {
        hasher.update(file_hash.to_ascii_lowercase().as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_known_vector() {
        // SHA-256("")
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn content_hash_is_permutation_invariant() {
        let a = vec![
            ("a.txt".to_string(), sha256_hex(b"one")),
            ("b.txt".to_string(), sha256_hex(b"two")),
            ("dir/c.txt".to_string(), sha256_hex(b"three")),
        ];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn content_hash_changes_with_content() {
        let a = vec![("a.txt".to_string(), sha256_hex(b"one"))];
        let b = vec![("a.txt".to_string(), sha256_hex(b"two"))];
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn content_hash_changes_with_path() {
        let a = vec![("a.txt".to_string(), sha256_hex(b"one"))];
        let b = vec![("b.txt".to_string(), sha256_hex(b"one"))];
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn ordering_is_byte_wise() {
        // 'S' (0x53) sorts before 'r' (0x72), so SKILL.md precedes run.sh.
        let skill_hash = sha256_hex(b"# Hello\n");
        let run_hash = sha256_hex(b"#!/bin/sh\necho hi\n");
        let entries = vec![
            ("run.sh".to_string(), run_hash.clone()),
            ("SKILL.md".to_string(), skill_hash.clone()),
        ];
        let expected = sha256_hex(format!("{skill_hash}{run_hash}").as_bytes());
        assert_eq!(content_hash(&entries), expected);
    }
}
