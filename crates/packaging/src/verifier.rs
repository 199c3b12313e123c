use liveswap_models::{normalize_checksum, UpdateError};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};
use walkdir::WalkDir;

/// Result of comparing a path against an expected fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub matches: bool,
    pub actual: String,
}

/// Content fingerprints for raw archives (plain SHA-256) and unpacked trees
/// (canonical digest, see [`TreeDigest`]).
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    /// `Ok(false)` on mismatch; errors only when `path` cannot be read.
    pub async fn verify(path: &Path, expected_checksum: &str) -> Result<bool, UpdateError> {
        Ok(Self::check(path, expected_checksum).await?.matches)
    }

    #[instrument(skip(expected_checksum))]
    pub async fn check(path: &Path, expected_checksum: &str) -> Result<Verification, UpdateError> {
        let actual = Self::digest(path).await?;
        let matches = match normalize_checksum(expected_checksum) {
            Ok(expected) => constant_time_eq(expected.as_bytes(), actual.as_bytes()),
            Err(_) => {
                warn!("Expected checksum for {} is not a sha256 digest", path.display());
                false
            }
        };

        if matches {
            info!("Checksum verified for {}", path.display());
        } else {
            warn!("Checksum mismatch for {}: actual {}", path.display(), actual);
        }
        Ok(Verification { matches, actual })
    }

    /// Hex digest of a file's bytes, or the canonical digest of a directory tree.
    pub async fn digest(path: &Path) -> Result<String, UpdateError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::digest_blocking(&path))
            .await
            .map_err(|e| UpdateError::Internal {
                reason: format!("digest task failed: {e}"),
            })?
    }

    pub fn digest_blocking(path: &Path) -> Result<String, UpdateError> {
        let metadata = std::fs::metadata(path).map_err(|e| UpdateError::io(path, e))?;
        if metadata.is_dir() {
            tree_digest(path)
        } else {
            let file = File::open(path).map_err(|e| UpdateError::io(path, e))?;
            let (_, hex) = hash_reader(file).map_err(|e| UpdateError::io(path, e))?;
            Ok(hex)
        }
    }
}

/// Streams `reader` through SHA-256, returning the byte count and hex digest.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let len = io::copy(&mut reader, &mut hasher)?;
    Ok((len, format!("{:x}", hasher.finalize())))
}

/// Compares two byte strings without short-circuiting on the first difference.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum TreeEntry {
    File { len: u64, sha256: String },
    Link { target: String },
}

/// Order-independent builder for the canonical tree digest.
///
/// Entries are sorted by their `/`-separated relative path. Files contribute
/// `F\0<path>\0<len>\0<sha256>\n` and symlinks `L\0<path>\0<target>\n`;
/// directories contribute nothing. The result is the SHA-256 of the
/// concatenation, so an archive's contents and the tree unpacked from it hash
/// to the same value.
#[derive(Debug, Default)]
pub struct TreeDigest {
    entries: Vec<(String, TreeEntry)>,
}

impl TreeDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, rel_path: impl Into<String>, len: u64, sha256: impl Into<String>) {
        self.entries.push((
            rel_path.into(),
            TreeEntry::File {
                len,
                sha256: sha256.into(),
            },
        ));
    }

    pub fn add_link(&mut self, rel_path: impl Into<String>, target: impl Into<String>) {
        self.entries.push((rel_path.into(), TreeEntry::Link { target: target.into() }));
    }

    pub fn file_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, e)| matches!(e, TreeEntry::File { .. }))
            .count()
    }

    pub fn finish(mut self) -> String {
        self.entries.sort();
        let mut hasher = Sha256::new();
        for (path, entry) in &self.entries {
            match entry {
                TreeEntry::File { len, sha256 } => {
                    hasher.update(format!("F\0{path}\0{len}\0{sha256}\n").as_bytes());
                }
                TreeEntry::Link { target } => {
                    hasher.update(format!("L\0{path}\0{target}\n").as_bytes());
                }
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

/// `/`-joined path of `path` relative to `root`.
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn tree_digest(root: &Path) -> Result<String, UpdateError> {
    let mut digest = TreeDigest::new();

    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            UpdateError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;
        let Some(key) = relative_key(root, entry.path()) else {
            continue;
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if file_type.is_symlink() {
            let target: PathBuf =
                std::fs::read_link(entry.path()).map_err(|e| UpdateError::io(entry.path(), e))?;
            digest.add_link(key, target.to_string_lossy());
            continue;
        }

        let file = File::open(entry.path()).map_err(|e| UpdateError::io(entry.path(), e))?;
        let (len, sha) = hash_reader(file).map_err(|e| UpdateError::io(entry.path(), e))?;
        digest.add_file(key, len, sha);
    }

    Ok(digest.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_digest_matches_known_sha256() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("artifact.zip");
        fs::write(&path, b"test").unwrap();

        let expected = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
        assert!(IntegrityVerifier::verify(&path, expected).await.unwrap());
        assert!(IntegrityVerifier::verify(&path, &format!("sha256:{expected}")).await.unwrap());
        assert!(IntegrityVerifier::verify(&path, &expected.to_uppercase()).await.unwrap());
    }

    #[tokio::test]
    async fn mismatch_returns_false_not_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("artifact.zip");
        fs::write(&path, b"tampered").unwrap();

        let check = IntegrityVerifier::check(&path, &"0".repeat(64)).await.unwrap();
        assert!(!check.matches);
        assert_eq!(check.actual.len(), 64);
        assert!(!IntegrityVerifier::verify(&path, "not-a-digest").await.unwrap());
    }

    #[tokio::test]
    async fn unreadable_input_is_an_io_error() {
        let dir = tempdir().unwrap();
        let err = IntegrityVerifier::verify(&dir.path().join("missing"), &"0".repeat(64))
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Io { .. }));
    }

    #[test]
    fn tree_digest_is_independent_of_creation_order() {
        let a = tempdir().unwrap();
        fs::create_dir_all(a.path().join("static/css")).unwrap();
        fs::write(a.path().join("main.py"), b"app = None\n").unwrap();
        fs::write(a.path().join("static/css/site.css"), b"body{}").unwrap();

        let b = tempdir().unwrap();
        fs::create_dir_all(b.path().join("static/css")).unwrap();
        fs::write(b.path().join("static/css/site.css"), b"body{}").unwrap();
        fs::write(b.path().join("main.py"), b"app = None\n").unwrap();

        assert_eq!(
            IntegrityVerifier::digest_blocking(a.path()).unwrap(),
            IntegrityVerifier::digest_blocking(b.path()).unwrap()
        );
    }

    #[test]
    fn tree_digest_detects_added_and_changed_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("main.py"), b"v1").unwrap();
        let before = IntegrityVerifier::digest_blocking(dir.path()).unwrap();

        fs::write(dir.path().join("main.py"), b"v2").unwrap();
        let changed = IntegrityVerifier::digest_blocking(dir.path()).unwrap();
        assert_ne!(before, changed);

        fs::write(dir.path().join("extra.py"), b"").unwrap();
        let added = IntegrityVerifier::digest_blocking(dir.path()).unwrap();
        assert_ne!(changed, added);
    }

    #[test]
    fn tree_digest_matches_builder_over_same_contents() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("pkg")).unwrap();
        fs::write(dir.path().join("pkg/a.txt"), b"alpha").unwrap();

        let mut builder = TreeDigest::new();
        let (len, sha) = hash_reader(&b"alpha"[..]).unwrap();
        builder.add_file("pkg/a.txt", len, sha);
        assert_eq!(builder.file_count(), 1);

        assert_eq!(IntegrityVerifier::digest_blocking(dir.path()).unwrap(), builder.finish());
    }

    #[test]
    fn constant_time_eq_behaviour() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
