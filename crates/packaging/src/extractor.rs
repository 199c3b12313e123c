use chrono::Utc;
use flate2::read::GzDecoder;
use liveswap_models::{ArchiveFormat, ExtractConfig, StagingArtifact, UpdateError, UpdateManifest};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use zip::ZipArchive;

use crate::verifier::{hash_reader, TreeDigest};

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;

const COPY_CHUNK: usize = 64 * 1024;

pub struct ArchiveExtractor {
    max_entries: usize,
    max_unpacked_bytes: u64,
    required_paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Dir,
    File,
}

/// Everything learned about an archive without writing to disk.
#[derive(Debug)]
struct ArchivePlan {
    nodes: BTreeMap<String, Node>,
    entries: usize,
    file_count: usize,
    unpacked_bytes: u64,
    tree_checksum: String,
}

enum EntryKind {
    Dir,
    File { declared_size: u64, mode: Option<u32> },
    Skip,
}

impl ArchiveExtractor {
    pub fn new(config: &ExtractConfig) -> Self {
        Self {
            max_entries: config.max_entries,
            max_unpacked_bytes: config.max_unpacked_bytes,
            required_paths: config.required_paths.clone(),
        }
    }

    /// Validates the whole archive, then unpacks it into `staging_dir`.
    ///
    /// `staging_dir` must be absent or empty. It is left empty on any failure.
    #[instrument(skip(self, manifest, token), fields(version = %manifest.version))]
    pub async fn extract(
        &self,
        archive_path: &Path,
        staging_dir: &Path,
        manifest: &UpdateManifest,
        token: &CancellationToken,
    ) -> Result<StagingArtifact, UpdateError> {
        prepare_staging(staging_dir)?;

        let worker = Worker {
            archive_path: archive_path.to_path_buf(),
            staging_dir: staging_dir.to_path_buf(),
            format: manifest.archive_format,
            max_entries: self.max_entries,
            max_unpacked_bytes: self.max_unpacked_bytes,
            required_paths: self.required_paths.clone(),
            token: token.clone(),
        };

        let result = tokio::task::spawn_blocking(move || worker.run())
            .await
            .map_err(|e| UpdateError::Internal {
                reason: format!("extract task failed: {e}"),
            })
            .and_then(|r| r);

        match result {
            Ok(plan) => {
                info!(
                    "Extracted {} entries, {} files ({} bytes) into {}",
                    plan.entries,
                    plan.file_count,
                    plan.unpacked_bytes,
                    staging_dir.display()
                );
                Ok(StagingArtifact {
                    staging_path: staging_dir.to_path_buf(),
                    manifest: manifest.clone(),
                    extracted_at: Utc::now(),
                    tree_checksum: plan.tree_checksum,
                    file_count: plan.file_count,
                    unpacked_bytes: plan.unpacked_bytes,
                })
            }
            Err(e) => {
                if let Err(clean_err) = empty_dir(staging_dir) {
                    warn!("Failed to clean staging {}: {}", staging_dir.display(), clean_err);
                }
                Err(e)
            }
        }
    }
}

struct Worker {
    archive_path: PathBuf,
    staging_dir: PathBuf,
    format: ArchiveFormat,
    max_entries: usize,
    max_unpacked_bytes: u64,
    required_paths: Vec<String>,
    token: CancellationToken,
}

impl Worker {
    fn run(&self) -> Result<ArchivePlan, UpdateError> {
        let plan = match self.format {
            ArchiveFormat::Zip => self.validate_zip()?,
            ArchiveFormat::TarGz => self.validate_tar()?,
        };
        self.check_required(&plan)?;

        match self.format {
            ArchiveFormat::Zip => self.unpack_zip()?,
            ArchiveFormat::TarGz => self.unpack_tar()?,
        }
        Ok(plan)
    }

    fn checkpoint(&self) -> Result<(), UpdateError> {
        if self.token.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        Ok(())
    }

    fn open_archive(&self) -> Result<File, UpdateError> {
        File::open(&self.archive_path).map_err(|e| UpdateError::io(&self.archive_path, e))
    }

    fn validate_zip(&self) -> Result<ArchivePlan, UpdateError> {
        let mut archive = ZipArchive::new(self.open_archive()?).map_err(malformed)?;
        let mut pass = Pass::new(self.max_entries, self.max_unpacked_bytes);

        for i in 0..archive.len() {
            self.checkpoint()?;
            let mut file = archive.by_index(i).map_err(malformed)?;
            let name = file.name().to_string();
            let kind = zip_kind(file.is_dir(), file.unix_mode(), file.size(), &name)?;
            pass.visit(&name, kind, &mut file)?;
        }
        Ok(pass.finish())
    }

    fn validate_tar(&self) -> Result<ArchivePlan, UpdateError> {
        let mut archive = tar::Archive::new(GzDecoder::new(self.open_archive()?));
        let mut pass = Pass::new(self.max_entries, self.max_unpacked_bytes);

        for entry in archive.entries().map_err(malformed)? {
            self.checkpoint()?;
            let mut entry = entry.map_err(malformed)?;
            let name = tar_name(&entry)?;
            let kind = tar_kind(&entry, &name)?;
            pass.visit(&name, kind, &mut entry)?;
        }
        Ok(pass.finish())
    }

    fn check_required(&self, plan: &ArchivePlan) -> Result<(), UpdateError> {
        for pattern in &self.required_paths {
            let found = match pattern.strip_prefix('*') {
                Some(suffix) => {
                    let suffix = suffix.to_ascii_lowercase();
                    plan.nodes.iter().any(|(path, node)| {
                        *node == Node::File && path.to_ascii_lowercase().ends_with(&suffix)
                    })
                }
                None => plan.nodes.contains_key(pattern.trim_matches('/')),
            };
            if !found {
                return Err(UpdateError::MalformedArchive {
                    reason: format!("required path missing: {pattern}"),
                });
            }
        }
        Ok(())
    }

    fn unpack_zip(&self) -> Result<(), UpdateError> {
        let mut archive = ZipArchive::new(self.open_archive()?).map_err(malformed)?;
        for i in 0..archive.len() {
            self.checkpoint()?;
            let mut file = archive.by_index(i).map_err(malformed)?;
            let name = file.name().to_string();
            let kind = zip_kind(file.is_dir(), file.unix_mode(), file.size(), &name)?;
            self.write_entry(&name, kind, &mut file)?;
        }
        Ok(())
    }

    fn unpack_tar(&self) -> Result<(), UpdateError> {
        let mut archive = tar::Archive::new(GzDecoder::new(self.open_archive()?));
        for entry in archive.entries().map_err(malformed)? {
            self.checkpoint()?;
            let mut entry = entry.map_err(malformed)?;
            let name = tar_name(&entry)?;
            let kind = tar_kind(&entry, &name)?;
            self.write_entry(&name, kind, &mut entry)?;
        }
        Ok(())
    }

    fn write_entry<R: Read>(
        &self,
        name: &str,
        kind: EntryKind,
        reader: &mut R,
    ) -> Result<(), UpdateError> {
        if matches!(kind, EntryKind::Skip) {
            return Ok(());
        }
        let Some(rel) = sanitize_entry_name(name)? else {
            return Ok(());
        };
        let target = self.staging_dir.join(&rel);

        match kind {
            EntryKind::Skip => Ok(()),
            EntryKind::Dir => fs::create_dir_all(&target).map_err(|e| UpdateError::io(&target, e)),
            EntryKind::File { mode, .. } => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| UpdateError::io(parent, e))?;
                }
                let mut out = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&target)
                    .map_err(|e| UpdateError::io(&target, e))?;
                self.copy_entry(&mut reader.take(self.max_unpacked_bytes), &mut out, &target)?;

                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Some(mode) = mode {
                        let permissions = fs::Permissions::from_mode(mode & 0o777);
                        fs::set_permissions(&target, permissions)
                            .map_err(|e| UpdateError::io(&target, e))?;
                    }
                }
                #[cfg(not(unix))]
                let _ = mode;
                Ok(())
            }
        }
    }

    /// Copies one entry, checking for cancellation between chunks.
    fn copy_entry<R: Read, W: Write>(
        &self,
        reader: &mut R,
        out: &mut W,
        target: &Path,
    ) -> Result<u64, UpdateError> {
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut copied = 0u64;
        loop {
            self.checkpoint()?;
            let n = match reader.read(&mut buf) {
                Ok(0) => return Ok(copied),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(UpdateError::io(target, e)),
            };
            out.write_all(&buf[..n]).map_err(|e| UpdateError::io(target, e))?;
            copied += n as u64;
        }
    }
}

/// Pass-one bookkeeping: path claims, limits and the running tree digest.
struct Pass {
    max_entries: usize,
    max_unpacked_bytes: u64,
    nodes: BTreeMap<String, Node>,
    digest: TreeDigest,
    entries: usize,
    unpacked_bytes: u64,
}

impl Pass {
    fn new(max_entries: usize, max_unpacked_bytes: u64) -> Self {
        Self {
            max_entries,
            max_unpacked_bytes,
            nodes: BTreeMap::new(),
            digest: TreeDigest::new(),
            entries: 0,
            unpacked_bytes: 0,
        }
    }

    fn visit<R: Read>(
        &mut self,
        name: &str,
        kind: EntryKind,
        reader: &mut R,
    ) -> Result<(), UpdateError> {
        if matches!(kind, EntryKind::Skip) {
            return Ok(());
        }
        self.entries += 1;
        if self.entries > self.max_entries {
            return Err(UpdateError::MalformedArchive {
                reason: format!("archive has more than {} entries", self.max_entries),
            });
        }

        let Some(rel) = sanitize_entry_name(name)? else {
            return Ok(());
        };

        match kind {
            EntryKind::Skip => Ok(()),
            EntryKind::Dir => self.claim(&rel, Node::Dir),
            EntryKind::File { declared_size, .. } => {
                self.claim(&rel, Node::File)?;
                let remaining = self.max_unpacked_bytes - self.unpacked_bytes;
                if declared_size > remaining {
                    return Err(self.too_big());
                }
                let (len, sha) =
                    hash_reader(reader.take(remaining.saturating_add(1))).map_err(malformed)?;
                if len > remaining {
                    return Err(self.too_big());
                }
                self.unpacked_bytes += len;
                self.digest.add_file(rel, len, sha);
                Ok(())
            }
        }
    }

    fn too_big(&self) -> UpdateError {
        UpdateError::MalformedArchive {
            reason: format!("unpacked size exceeds {} bytes", self.max_unpacked_bytes),
        }
    }

    fn claim(&mut self, rel: &str, node: Node) -> Result<(), UpdateError> {
        let mut prefix = String::new();
        let mut parts = rel.split('/').peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                break;
            }
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            if self.nodes.insert(prefix.clone(), Node::Dir) == Some(Node::File) {
                return Err(UpdateError::MalformedArchive {
                    reason: format!("file/directory collision at {prefix}"),
                });
            }
        }

        match (self.nodes.get(rel), node) {
            (None, _) => {
                self.nodes.insert(rel.to_string(), node);
                Ok(())
            }
            (Some(Node::Dir), Node::Dir) => Ok(()),
            (Some(Node::File), Node::File) => Err(UpdateError::MalformedArchive {
                reason: format!("duplicate entry {rel}"),
            }),
            (Some(_), _) => Err(UpdateError::MalformedArchive {
                reason: format!("file/directory collision at {rel}"),
            }),
        }
    }

    fn finish(self) -> ArchivePlan {
        let file_count = self.digest.file_count();
        ArchivePlan {
            nodes: self.nodes,
            entries: self.entries,
            file_count,
            unpacked_bytes: self.unpacked_bytes,
            tree_checksum: self.digest.finish(),
        }
    }
}

/// Normalizes an archive entry name to a `/`-joined relative path.
///
/// `Ok(None)` for entries that name the archive root itself.
pub fn sanitize_entry_name(raw: &str) -> Result<Option<String>, UpdateError> {
    if raw.contains('\0') {
        return Err(UpdateError::MalformedArchive {
            reason: format!("entry name contains NUL: {raw:?}"),
        });
    }
    let name = raw.replace('\\', "/");
    let traversal = || UpdateError::PathTraversal { entry: raw.to_string() };

    if name.starts_with('/') {
        return Err(traversal());
    }
    let bytes = name.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(traversal());
    }

    let mut parts = Vec::new();
    for part in name.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(traversal()),
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parts.join("/")))
    }
}

fn zip_kind(
    is_dir: bool,
    unix_mode: Option<u32>,
    size: u64,
    name: &str,
) -> Result<EntryKind, UpdateError> {
    if let Some(mode) = unix_mode {
        let file_type = mode & S_IFMT;
        if file_type == S_IFLNK {
            return Err(UpdateError::MalformedArchive {
                reason: format!("symlink entries are not supported: {name}"),
            });
        }
        if file_type != 0 && file_type != S_IFREG && file_type != S_IFDIR {
            return Err(UpdateError::MalformedArchive {
                reason: format!("special file entries are not supported: {name}"),
            });
        }
    }
    if is_dir {
        Ok(EntryKind::Dir)
    } else {
        Ok(EntryKind::File {
            declared_size: size,
            mode: unix_mode,
        })
    }
}

fn tar_name<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String, UpdateError> {
    String::from_utf8(entry.path_bytes().into_owned()).map_err(|_| UpdateError::MalformedArchive {
        reason: "entry name is not valid UTF-8".to_string(),
    })
}

fn tar_kind<R: Read>(entry: &tar::Entry<'_, R>, name: &str) -> Result<EntryKind, UpdateError> {
    let header = entry.header();
    let entry_type = header.entry_type();
    match entry_type {
        tar::EntryType::Regular | tar::EntryType::Continuous => Ok(EntryKind::File {
            declared_size: header.size().map_err(malformed)?,
            mode: header.mode().ok(),
        }),
        tar::EntryType::Directory => Ok(EntryKind::Dir),
        tar::EntryType::XGlobalHeader => Ok(EntryKind::Skip),
        tar::EntryType::Symlink | tar::EntryType::Link => Err(UpdateError::MalformedArchive {
            reason: format!("link entries are not supported: {name}"),
        }),
        other => Err(UpdateError::MalformedArchive {
            reason: format!("unsupported entry type {other:?}: {name}"),
        }),
    }
}

fn malformed(e: impl std::fmt::Display) -> UpdateError {
    UpdateError::MalformedArchive { reason: e.to_string() }
}

fn prepare_staging(staging_dir: &Path) -> Result<(), UpdateError> {
    match fs::read_dir(staging_dir) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(UpdateError::InvalidRequest {
                    reason: format!("staging directory {} is not empty", staging_dir.display()),
                });
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(staging_dir).map_err(|e| UpdateError::io(staging_dir, e))
        }
        Err(e) => Err(UpdateError::io(staging_dir, e)),
    }
}

fn empty_dir(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use liveswap_models::Version;
    use liveswap_testsupport::archives::{tar_gz_bytes, zip_bytes, ArchiveEntry};
    use tempfile::tempdir;

    fn manifest(format: ArchiveFormat) -> UpdateManifest {
        UpdateManifest {
            version: Version::new("2.0.0"),
            source_url: "http://127.0.0.1/artifact".to_string(),
            expected_checksum: "0".repeat(64),
            archive_format: format,
            tree_checksum: None,
        }
    }

    fn extractor() -> ArchiveExtractor {
        ArchiveExtractor::new(&ExtractConfig {
            max_entries: 100,
            max_unpacked_bytes: 1024 * 1024,
            required_paths: Vec::new(),
        })
    }

    fn write_archive(dir: &Path, name: &str, bytes: Vec<u8>) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    fn sample_entries() -> Vec<ArchiveEntry> {
        vec![
            ArchiveEntry::dir("app/"),
            ArchiveEntry::file("app/main.py", b"print('v2')\n").with_mode(0o755),
            ArchiveEntry::file("app/static/site.css", b"body{}"),
            ArchiveEntry::file("README.txt", b"release notes"),
        ]
    }

    fn is_empty(dir: &Path) -> bool {
        fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn zip_extracts_and_digest_matches_tree() {
        let work = tempdir().unwrap();
        let archive = write_archive(work.path(), "a.zip", zip_bytes(&sample_entries()));
        let staging = work.path().join("staging");

        let artifact = extractor()
            .extract(&archive, &staging, &manifest(ArchiveFormat::Zip), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(artifact.file_count, 3);
        assert_eq!(fs::read(staging.join("app/main.py")).unwrap(), b"print('v2')\n");
        assert_eq!(
            artifact.tree_checksum,
            crate::IntegrityVerifier::digest_blocking(&staging).unwrap()
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(staging.join("app/main.py")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[tokio::test]
    async fn tar_gz_and_zip_of_same_tree_share_a_digest() {
        let work = tempdir().unwrap();
        let zip = write_archive(work.path(), "a.zip", zip_bytes(&sample_entries()));
        let tgz = write_archive(work.path(), "a.tar.gz", tar_gz_bytes(&sample_entries()));
        let token = CancellationToken::new();

        let from_zip = extractor()
            .extract(&zip, &work.path().join("z"), &manifest(ArchiveFormat::Zip), &token)
            .await
            .unwrap();
        let from_tar = extractor()
            .extract(&tgz, &work.path().join("t"), &manifest(ArchiveFormat::TarGz), &token)
            .await
            .unwrap();

        assert_eq!(from_zip.tree_checksum, from_tar.tree_checksum);
        assert_eq!(from_tar.unpacked_bytes, from_zip.unpacked_bytes);
    }

    #[tokio::test]
    async fn traversal_entry_writes_nothing() {
        let work = tempdir().unwrap();
        let entries = vec![
            ArchiveEntry::file("ok.txt", b"fine"),
            ArchiveEntry::file("../../etc/passwd", b"root::0:0"),
        ];
        let archive = write_archive(work.path(), "evil.zip", zip_bytes(&entries));
        let staging = work.path().join("staging");

        let err = extractor()
            .extract(&archive, &staging, &manifest(ArchiveFormat::Zip), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::PathTraversal { .. }));
        assert!(is_empty(&staging));
        assert!(!work.path().join("etc").exists());
    }

    #[tokio::test]
    async fn duplicate_and_colliding_entries_are_malformed() {
        let work = tempdir().unwrap();
        let token = CancellationToken::new();

        let dup = vec![ArchiveEntry::file("a.txt", b"1"), ArchiveEntry::file("a.txt", b"2")];
        let archive = write_archive(work.path(), "dup.tar.gz", tar_gz_bytes(&dup));
        let err = extractor()
            .extract(&archive, &work.path().join("s1"), &manifest(ArchiveFormat::TarGz), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::MalformedArchive { .. }));

        let collide = vec![ArchiveEntry::file("a", b"1"), ArchiveEntry::file("a/b", b"2")];
        let archive = write_archive(work.path(), "collide.zip", zip_bytes(&collide));
        let err = extractor()
            .extract(&archive, &work.path().join("s2"), &manifest(ArchiveFormat::Zip), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::MalformedArchive { .. }));
        assert!(is_empty(&work.path().join("s2")));
    }

    #[tokio::test]
    async fn symlink_entries_are_rejected() {
        let work = tempdir().unwrap();
        let entries = vec![ArchiveEntry::symlink("link", "/etc/passwd")];
        let archive = write_archive(work.path(), "link.tar.gz", tar_gz_bytes(&entries));

        let err = extractor()
            .extract(
                &archive,
                &work.path().join("s"),
                &manifest(ArchiveFormat::TarGz),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::MalformedArchive { .. }));
    }

    #[tokio::test]
    async fn limits_and_required_paths_are_enforced() {
        let work = tempdir().unwrap();
        let token = CancellationToken::new();
        let archive = write_archive(work.path(), "a.zip", zip_bytes(&sample_entries()));

        let tiny = ArchiveExtractor::new(&ExtractConfig {
            max_entries: 100,
            max_unpacked_bytes: 8,
            required_paths: Vec::new(),
        });
        let err = tiny
            .extract(&archive, &work.path().join("s1"), &manifest(ArchiveFormat::Zip), &token)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unpacked size"));

        let few = ArchiveExtractor::new(&ExtractConfig {
            max_entries: 2,
            max_unpacked_bytes: 1024,
            required_paths: Vec::new(),
        });
        let err = few
            .extract(&archive, &work.path().join("s2"), &manifest(ArchiveFormat::Zip), &token)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("entries"));

        let needs_csv = ArchiveExtractor::new(&ExtractConfig {
            max_entries: 100,
            max_unpacked_bytes: 1024,
            required_paths: vec!["*.csv".to_string()],
        });
        let err = needs_csv
            .extract(&archive, &work.path().join("s3"), &manifest(ArchiveFormat::Zip), &token)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("*.csv"));

        let needs_main = ArchiveExtractor::new(&ExtractConfig {
            max_entries: 100,
            max_unpacked_bytes: 1024,
            required_paths: vec!["*.PY".to_string(), "app/static".to_string()],
        });
        needs_main
            .extract(&archive, &work.path().join("s4"), &manifest(ArchiveFormat::Zip), &token)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn corrupt_archive_is_malformed() {
        let work = tempdir().unwrap();
        let archive = write_archive(work.path(), "junk.zip", b"definitely not a zip".to_vec());
        let err = extractor()
            .extract(
                &archive,
                &work.path().join("s"),
                &manifest(ArchiveFormat::Zip),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::MalformedArchive { .. }));
    }

    #[tokio::test]
    async fn refuses_non_empty_staging_and_honours_cancel() {
        let work = tempdir().unwrap();
        let archive = write_archive(work.path(), "a.zip", zip_bytes(&sample_entries()));

        let staging = work.path().join("busy");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("leftover"), b"x").unwrap();
        let err = extractor()
            .extract(&archive, &staging, &manifest(ArchiveFormat::Zip), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::InvalidRequest { .. }));
        assert!(staging.join("leftover").exists());

        let token = CancellationToken::new();
        token.cancel();
        let staging = work.path().join("cancelled");
        let err = extractor()
            .extract(&archive, &staging, &manifest(ArchiveFormat::Zip), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Cancelled));
        assert!(is_empty(&staging));
    }

    /// Endless entry body that cancels the token as soon as it is read.
    struct CancellingReader(CancellationToken);

    impl Read for CancellingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.cancel();
            buf.fill(b'x');
            Ok(buf.len())
        }
    }

    #[test]
    fn cancel_stops_entry_copy_between_chunks() {
        let work = tempdir().unwrap();
        let token = CancellationToken::new();
        let worker = Worker {
            archive_path: work.path().join("unused.zip"),
            staging_dir: work.path().to_path_buf(),
            format: ArchiveFormat::Zip,
            max_entries: 1,
            max_unpacked_bytes: u64::MAX,
            required_paths: Vec::new(),
            token: token.clone(),
        };

        let mut out = Vec::new();
        let err = worker
            .copy_entry(&mut CancellingReader(token), &mut out, Path::new("big.bin"))
            .unwrap_err();
        assert!(matches!(err, UpdateError::Cancelled));
        assert_eq!(out.len(), COPY_CHUNK);
    }

    #[test]
    fn entry_name_sanitization() {
        assert_eq!(sanitize_entry_name("./a//b/").unwrap(), Some("a/b".to_string()));
        assert_eq!(sanitize_entry_name("dir\\file.txt").unwrap(), Some("dir/file.txt".to_string()));
        assert_eq!(sanitize_entry_name("./").unwrap(), None);
        assert!(matches!(
            sanitize_entry_name("/etc/passwd"),
            Err(UpdateError::PathTraversal { .. })
        ));
        assert!(matches!(
            sanitize_entry_name("C:\\Windows"),
            Err(UpdateError::PathTraversal { .. })
        ));
        assert!(matches!(sanitize_entry_name("a/../../b"), Err(UpdateError::PathTraversal { .. })));
        assert!(matches!(sanitize_entry_name("a\0b"), Err(UpdateError::MalformedArchive { .. })));
    }
}
