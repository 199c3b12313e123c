use chrono::{DateTime, Utc};
use liveswap_models::{InstalledRelease, ReleaseMetadata, StagingArtifact, UpdateError, Version};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument, warn};

use crate::verifier::IntegrityVerifier;

/// What the install pointer currently looks like on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerState {
    Missing,
    /// A symlink resolving to a directory.
    Release(PathBuf),
    /// A symlink whose target is gone or not a directory.
    Dangling(PathBuf),
    /// A real directory, from before the pointer was managed.
    PlainDir,
    Unexpected,
}

/// Publishes release trees by swapping a symlink at the install path.
#[derive(Debug, Clone)]
pub struct AtomicInstaller {
    releases_dir: PathBuf,
}

impl AtomicInstaller {
    pub fn new(releases_dir: impl Into<PathBuf>) -> Self {
        Self {
            releases_dir: releases_dir.into(),
        }
    }

    pub fn releases_dir(&self) -> &Path {
        &self.releases_dir
    }

    /// Moves the staged tree into the releases directory and points
    /// `install_path` at it. The previous tree stays on disk.
    #[instrument(skip(self, staging), fields(version = %staging.manifest.version))]
    pub async fn install(
        &self,
        staging: &StagingArtifact,
        install_path: &Path,
    ) -> Result<InstalledRelease, UpdateError> {
        let this = self.clone();
        let staging_path = staging.staging_path.clone();
        let version = staging.manifest.version.clone();
        let tree_checksum = staging.tree_checksum.clone();
        let install_path = install_path.to_path_buf();
        blocking(move || {
            this.install_blocking(&staging_path, &version, &tree_checksum, &install_path)
        })
        .await
    }

    /// Re-points `install_path` at an already installed release.
    #[instrument(skip(self, release), fields(version = %release.active_version))]
    pub async fn activate(&self, release: &InstalledRelease) -> Result<(), UpdateError> {
        let release_dir = release.release_dir.clone();
        let install_path = release.install_path.clone();
        blocking(move || {
            if !release_dir.is_dir() {
                return Err(UpdateError::install(format!(
                    "release directory {} is missing",
                    release_dir.display()
                )));
            }
            swap_or_classify(&install_path, &release_dir)?;
            info!("Pointer {} now resolves to {}", install_path.display(), release_dir.display());
            Ok(())
        })
        .await
    }

    /// Converts a plain directory at `install_path` into a managed release.
    /// Only safe before the serving process has started.
    #[instrument(skip(self))]
    pub async fn adopt(
        &self,
        install_path: &Path,
        version: &Version,
    ) -> Result<InstalledRelease, UpdateError> {
        let this = self.clone();
        let install_path = install_path.to_path_buf();
        let version = version.clone();
        blocking(move || this.adopt_blocking(&install_path, &version)).await
    }

    /// Deletes release trees beyond the newest `keep`, never touching `protect`.
    pub async fn prune(
        &self,
        keep: usize,
        protect: Vec<PathBuf>,
    ) -> Result<Vec<PathBuf>, UpdateError> {
        let this = self.clone();
        blocking(move || this.prune_blocking(keep, &protect)).await
    }

    pub fn inspect(install_path: &Path) -> Result<PointerState, UpdateError> {
        let meta = match fs::symlink_metadata(install_path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(PointerState::Missing),
            Err(e) => return Err(UpdateError::io(install_path, e)),
        };

        if meta.file_type().is_symlink() {
            let target = fs::read_link(install_path).map_err(|e| UpdateError::io(install_path, e))?;
            let target = match install_path.parent() {
                Some(parent) if target.is_relative() => parent.join(target),
                _ => target,
            };
            if fs::metadata(install_path).map(|m| m.is_dir()).unwrap_or(false) {
                Ok(PointerState::Release(target))
            } else {
                Ok(PointerState::Dangling(target))
            }
        } else if meta.is_dir() {
            Ok(PointerState::PlainDir)
        } else {
            Ok(PointerState::Unexpected)
        }
    }

    pub fn read_metadata(release_dir: &Path) -> Result<Option<ReleaseMetadata>, UpdateError> {
        let path = metadata_path(release_dir)?;
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| UpdateError::Io {
                    path: path.display().to_string(),
                    reason: format!("invalid release metadata: {e}"),
                }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(UpdateError::io(&path, e)),
        }
    }

    fn install_blocking(
        &self,
        staging_path: &Path,
        version: &Version,
        tree_checksum: &str,
        install_path: &Path,
    ) -> Result<InstalledRelease, UpdateError> {
        if !staging_path.is_dir() {
            return Err(UpdateError::install(format!(
                "staging tree {} is missing",
                staging_path.display()
            )));
        }
        let install_parent = pointer_parent(install_path)?;
        fs::create_dir_all(&self.releases_dir).map_err(|e| UpdateError::io(&self.releases_dir, e))?;
        fs::create_dir_all(install_parent).map_err(|e| UpdateError::io(install_parent, e))?;

        match Self::inspect(install_path)? {
            PointerState::Missing | PointerState::Release(_) | PointerState::Dangling(_) => {}
            PointerState::PlainDir => {
                return Err(UpdateError::install(format!(
                    "{} is a plain directory; adopt it before installing",
                    install_path.display()
                )))
            }
            PointerState::Unexpected => {
                return Err(UpdateError::install(format!(
                    "{} is neither a directory nor a symlink",
                    install_path.display()
                )))
            }
        }
        ensure_same_volume(&[staging_path, self.releases_dir.as_path(), install_parent])?;

        let release_id = release_id(version);
        let release_dir = self.release_dir(&release_id)?;
        fs::rename(staging_path, &release_dir).map_err(|e| {
            UpdateError::install(format!(
                "failed to move {} to {}: {}",
                staging_path.display(),
                release_dir.display(),
                e
            ))
        })?;

        let installed_at = Utc::now();
        let metadata = ReleaseMetadata {
            release_id: release_id.clone(),
            version: version.clone(),
            installed_at,
            tree_checksum: tree_checksum.to_string(),
        };
        if let Err(e) = write_metadata(&release_dir, &metadata) {
            remove_release(&release_dir);
            return Err(e);
        }

        if let Err(e) = swap_or_classify(install_path, &release_dir) {
            remove_release(&release_dir);
            return Err(e);
        }

        info!(
            "Installed {} at {} -> {}",
            version,
            install_path.display(),
            release_dir.display()
        );
        Ok(InstalledRelease {
            release_id,
            install_path: install_path.to_path_buf(),
            release_dir,
            active_version: version.clone(),
            installed_at,
        })
    }

    fn adopt_blocking(
        &self,
        install_path: &Path,
        version: &Version,
    ) -> Result<InstalledRelease, UpdateError> {
        if Self::inspect(install_path)? != PointerState::PlainDir {
            return Err(UpdateError::install(format!(
                "{} is not a plain directory",
                install_path.display()
            )));
        }
        let install_parent = pointer_parent(install_path)?;
        fs::create_dir_all(&self.releases_dir).map_err(|e| UpdateError::io(&self.releases_dir, e))?;
        ensure_same_volume(&[install_path, self.releases_dir.as_path(), install_parent])?;

        let tree_checksum = IntegrityVerifier::digest_blocking(install_path)?;
        let release_id = release_id(version);
        let release_dir = self.release_dir(&release_id)?;
        fs::rename(install_path, &release_dir).map_err(|e| {
            UpdateError::install(format!("failed to adopt {}: {}", install_path.display(), e))
        })?;

        let installed_at = Utc::now();
        let metadata = ReleaseMetadata {
            release_id: release_id.clone(),
            version: version.clone(),
            installed_at,
            tree_checksum,
        };
        let linked = write_metadata(&release_dir, &metadata)
            .and_then(|_| swap_or_classify(install_path, &release_dir));
        if let Err(e) = linked {
            if let Err(restore) = fs::rename(&release_dir, install_path) {
                error!(
                    "Failed to restore {} after adopt failure: {}",
                    install_path.display(),
                    restore
                );
            }
            return Err(e);
        }

        info!("Adopted {} as release {} ({})", install_path.display(), release_id, version);
        Ok(InstalledRelease {
            release_id,
            install_path: install_path.to_path_buf(),
            release_dir,
            active_version: version.clone(),
            installed_at,
        })
    }

    fn prune_blocking(
        &self,
        keep: usize,
        protect: &[PathBuf],
    ) -> Result<Vec<PathBuf>, UpdateError> {
        let entries = match fs::read_dir(&self.releases_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(UpdateError::io(&self.releases_dir, e)),
        };

        let mut releases: Vec<(DateTime<Utc>, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| UpdateError::io(&self.releases_dir, e))?;
            let path = entry.path();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir || entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let installed_at = match Self::read_metadata(&path) {
                Ok(Some(meta)) => meta.installed_at,
                _ => entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now()),
            };
            releases.push((installed_at, path));
        }
        releases.sort_by(|a, b| b.0.cmp(&a.0));

        let protected: Vec<PathBuf> = protect.iter().map(|p| canonical_or_self(p)).collect();
        let mut removed = Vec::new();
        for (_, path) in releases.into_iter().skip(keep) {
            if protected.contains(&canonical_or_self(&path)) {
                continue;
            }
            remove_release(&path);
            removed.push(path);
        }
        if !removed.is_empty() {
            info!("Pruned {} old releases", removed.len());
        }
        Ok(removed)
    }

    fn release_dir(&self, release_id: &str) -> Result<PathBuf, UpdateError> {
        let root = self
            .releases_dir
            .canonicalize()
            .map_err(|e| UpdateError::io(&self.releases_dir, e))?;
        Ok(root.join(release_id))
    }
}

async fn blocking<T, F>(f: F) -> Result<T, UpdateError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, UpdateError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| UpdateError::Internal {
            reason: format!("install task failed: {e}"),
        })?
}

/// Directory name for a release: sanitized version plus a short random suffix.
fn release_id(version: &Version) -> String {
    let safe: String = version
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", safe.trim_start_matches('.'), &suffix[..8])
}

fn pointer_parent(install_path: &Path) -> Result<&Path, UpdateError> {
    match install_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(parent),
        Some(_) => Ok(Path::new(".")),
        None => Err(UpdateError::install(format!(
            "{} has no parent directory",
            install_path.display()
        ))),
    }
}

fn metadata_path(release_dir: &Path) -> Result<PathBuf, UpdateError> {
    match (release_dir.parent(), release_dir.file_name()) {
        (Some(parent), Some(name)) => Ok(parent.join(format!("{}.json", name.to_string_lossy()))),
        _ => Err(UpdateError::install(format!(
            "{} is not a release directory",
            release_dir.display()
        ))),
    }
}

fn write_metadata(release_dir: &Path, metadata: &ReleaseMetadata) -> Result<(), UpdateError> {
    let path = metadata_path(release_dir)?;
    let bytes = serde_json::to_vec_pretty(metadata).map_err(|e| UpdateError::Internal {
        reason: format!("failed to encode release metadata: {e}"),
    })?;
    fs::write(&path, bytes).map_err(|e| UpdateError::io(&path, e))
}

fn remove_release(release_dir: &Path) {
    if let Err(e) = fs::remove_dir_all(release_dir) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove release {}: {}", release_dir.display(), e);
        }
    }
    if let Ok(sidecar) = metadata_path(release_dir) {
        let _ = fs::remove_file(sidecar);
    }
}

fn canonical_or_self(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Swaps the pointer; on failure reports whether it still resolves.
fn swap_or_classify(install_path: &Path, target: &Path) -> Result<(), UpdateError> {
    match swap_pointer(install_path, target) {
        Ok(()) => Ok(()),
        Err(e) => {
            let state = AtomicInstaller::inspect(install_path);
            let still_resolves = matches!(state, Ok(PointerState::Release(_)));
            let was_absent = matches!(state, Ok(PointerState::Missing));
            Err(UpdateError::Install {
                reason: format!("failed to swap {}: {}", install_path.display(), e),
                indeterminate: !still_resolves && !was_absent,
            })
        }
    }
}

#[cfg(unix)]
fn swap_pointer(install_path: &Path, target: &Path) -> io::Result<()> {
    let parent = install_path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "install path has no parent"))?;
    let name = install_path
        .file_name()
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "install path has no file name")
        })?;
    let tmp = parent.join(format!(
        ".{}.swap-{}",
        name.to_string_lossy(),
        uuid::Uuid::new_v4().simple()
    ));

    std::os::unix::fs::symlink(target, &tmp)?;
    if let Err(e) = fs::rename(&tmp, install_path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    match fs::File::open(if parent.as_os_str().is_empty() { Path::new(".") } else { parent }) {
        Ok(dir) => {
            if let Err(e) = dir.sync_all() {
                debug!("fsync of {} failed: {}", parent.display(), e);
            }
        }
        Err(e) => debug!("Could not open {} for fsync: {}", parent.display(), e),
    }
    Ok(())
}

#[cfg(not(unix))]
fn swap_pointer(_install_path: &Path, _target: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "atomic pointer swap requires a unix platform",
    ))
}

#[cfg(unix)]
fn ensure_same_volume(paths: &[&Path]) -> Result<(), UpdateError> {
    use std::os::unix::fs::MetadataExt;

    let mut first: Option<(&Path, u64)> = None;
    for &path in paths {
        let dev = fs::metadata(path).map_err(|e| UpdateError::io(path, e))?.dev();
        match first {
            None => first = Some((path, dev)),
            Some((origin, origin_dev)) if origin_dev != dev => {
                return Err(UpdateError::CrossVolume {
                    from: origin.display().to_string(),
                    to: path.display().to_string(),
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_same_volume(_paths: &[&Path]) -> Result<(), UpdateError> {
    Err(UpdateError::install("atomic install requires a unix platform"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use liveswap_models::{ArchiveFormat, UpdateManifest};
    use std::io::Read;
    use tempfile::tempdir;

    struct Layout {
        _root: tempfile::TempDir,
        install_path: PathBuf,
        releases: PathBuf,
        staging: PathBuf,
    }

    fn layout() -> Layout {
        let root = tempdir().unwrap();
        let install_path = root.path().join("current");
        let releases = root.path().join("releases");
        let staging = root.path().join("staging");
        fs::create_dir_all(&staging).unwrap();
        Layout {
            install_path,
            releases,
            staging,
            _root: root,
        }
    }

    fn stage(layout: &Layout, version: &str, body: &str) -> StagingArtifact {
        let tree = layout.staging.join(version);
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("VERSION"), body).unwrap();
        StagingArtifact {
            staging_path: tree.clone(),
            manifest: UpdateManifest {
                version: Version::new(version),
                source_url: "http://127.0.0.1/a.zip".to_string(),
                expected_checksum: "0".repeat(64),
                archive_format: ArchiveFormat::Zip,
                tree_checksum: None,
            },
            extracted_at: Utc::now(),
            tree_checksum: IntegrityVerifier::digest_blocking(&tree).unwrap(),
            file_count: 1,
            unpacked_bytes: body.len() as u64,
        }
    }

    #[tokio::test]
    async fn first_install_creates_pointer_and_sidecar() {
        let l = layout();
        let installer = AtomicInstaller::new(&l.releases);
        let staged = stage(&l, "1.0.0", "one");

        let release = installer.install(&staged, &l.install_path).await.unwrap();

        assert_eq!(fs::read_to_string(l.install_path.join("VERSION")).unwrap(), "one");
        assert!(!staged.staging_path.exists());
        assert!(release.release_id.starts_with("1.0.0-"));
        assert_eq!(
            AtomicInstaller::inspect(&l.install_path).unwrap(),
            PointerState::Release(release.release_dir.clone())
        );

        let meta = AtomicInstaller::read_metadata(&release.release_dir).unwrap().unwrap();
        assert_eq!(meta.version, Version::new("1.0.0"));
        assert_eq!(meta.tree_checksum, staged.tree_checksum);
    }

    #[tokio::test]
    async fn swap_keeps_old_tree_for_open_handles() {
        let l = layout();
        let installer = AtomicInstaller::new(&l.releases);
        let v1 = installer.install(&stage(&l, "1.0.0", "one"), &l.install_path).await.unwrap();

        let mut reader = fs::File::open(l.install_path.join("VERSION")).unwrap();
        let v2 = installer.install(&stage(&l, "2.0.0", "two"), &l.install_path).await.unwrap();

        let mut held = String::new();
        reader.read_to_string(&mut held).unwrap();
        assert_eq!(held, "one");
        assert_eq!(fs::read_to_string(l.install_path.join("VERSION")).unwrap(), "two");
        assert!(v1.release_dir.exists());
        assert_ne!(v1.release_dir, v2.release_dir);

        installer.activate(&v1).await.unwrap();
        assert_eq!(fs::read_to_string(l.install_path.join("VERSION")).unwrap(), "one");
    }

    #[tokio::test]
    async fn plain_directory_is_refused_until_adopted() {
        let l = layout();
        fs::create_dir_all(&l.install_path).unwrap();
        fs::write(l.install_path.join("VERSION"), "legacy").unwrap();
        let installer = AtomicInstaller::new(&l.releases);

        let err = installer
            .install(&stage(&l, "2.0.0", "two"), &l.install_path)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Install { indeterminate: false, .. }));
        assert_eq!(fs::read_to_string(l.install_path.join("VERSION")).unwrap(), "legacy");

        let adopted = installer.adopt(&l.install_path, &Version::new("0.9.0")).await.unwrap();
        assert_eq!(fs::read_to_string(l.install_path.join("VERSION")).unwrap(), "legacy");
        assert!(matches!(
            AtomicInstaller::inspect(&l.install_path).unwrap(),
            PointerState::Release(_)
        ));
        assert_eq!(adopted.active_version, Version::new("0.9.0"));

        installer.install(&stage(&l, "2.0.0", "two"), &l.install_path).await.unwrap();
        assert_eq!(fs::read_to_string(l.install_path.join("VERSION")).unwrap(), "two");
    }

    #[tokio::test]
    async fn activate_missing_release_leaves_pointer_alone() {
        let l = layout();
        let installer = AtomicInstaller::new(&l.releases);
        let v1 = installer.install(&stage(&l, "1.0.0", "one"), &l.install_path).await.unwrap();

        let mut ghost = v1.clone();
        ghost.release_dir = l.releases.join("gone");
        let err = installer.activate(&ghost).await.unwrap_err();
        assert!(!err.is_indeterminate());
        assert_eq!(fs::read_to_string(l.install_path.join("VERSION")).unwrap(), "one");
    }

    #[tokio::test]
    async fn dangling_pointer_is_detected() {
        let l = layout();
        std::os::unix::fs::symlink(l.releases.join("nowhere"), &l.install_path).unwrap();
        assert!(matches!(
            AtomicInstaller::inspect(&l.install_path).unwrap(),
            PointerState::Dangling(_)
        ));
        assert_eq!(
            AtomicInstaller::inspect(&l.releases.join("absent")).unwrap(),
            PointerState::Missing
        );
    }

    #[tokio::test]
    async fn prune_keeps_newest_and_protected() {
        let l = layout();
        let installer = AtomicInstaller::new(&l.releases);
        let mut installed = Vec::new();
        for v in ["1.0.0", "1.1.0", "1.2.0", "1.3.0"] {
            installed.push(installer.install(&stage(&l, v, v), &l.install_path).await.unwrap());
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let removed = installer
            .prune(2, vec![installed[0].release_dir.clone()])
            .await
            .unwrap();

        assert_eq!(removed, vec![installed[1].release_dir.clone()]);
        assert!(installed[0].release_dir.exists());
        assert!(!installed[1].release_dir.exists());
        assert!(AtomicInstaller::read_metadata(&installed[1].release_dir).unwrap().is_none());
        assert!(installed[3].release_dir.exists());
    }

    #[test]
    fn release_ids_are_filesystem_safe() {
        let id = release_id(&Version::new("../2.0 beta"));
        assert!(!id.contains('/'));
        assert!(!id.starts_with('.'));
        assert!(!id.contains(' '));
    }
}
