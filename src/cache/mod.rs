//! Shared download cache.
//!
//! Archives live once in the cache directory, keyed by file name, and are
//! promoted into each build root's `sources/` directory only after their
//! checksum matches. Layout:
//!
//! ```text
//! <cache>/
//!   binutils-2.42.tar.xz          verified archive
//!   .index/binutils-2.42.tar.xz.json   DownloadRecord
//!   .locks/binutils-2.42.tar.xz.lock   per-artifact advisory lock
//!   .tmp/                         in-flight downloads
//! ```
//!
//! [`DownloadCache::ensure`] runs four steps in order, each gating the next:
//! scan, download, checksum, copy.

mod checksum;
mod fetch;

pub use checksum::Checksum;
pub use fetch::{FetchError, Fetcher, HttpFetcher};

use crate::config::PackageSpec;
use crate::error::BuildError;
use crate::status::Status;
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Build-root-relative directory archives are promoted into.
pub const SOURCES_DIR: &str = "sources";

const INDEX_DIR: &str = ".index";
const LOCK_DIR: &str = ".locks";
const TMP_DIR: &str = ".tmp";

/// Persistent record of a verified, promoted artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// Path inside the cache directory.
    pub cache_path: PathBuf,
    /// Path inside the build root.
    pub target_path: PathBuf,
    pub checksum: Checksum,
    pub verified: bool,
}

/// One step of [`DownloadCache::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStep {
    Scan,
    Download,
    Checksum,
    Copy,
}

impl CacheStep {
    pub fn status(self) -> Status {
        match self {
            CacheStep::Scan => Status::Scanning,
            CacheStep::Download => Status::Downloading,
            CacheStep::Checksum => Status::Verifying,
            CacheStep::Copy => Status::Copying,
        }
    }
}

/// A package resolved against a cache and a build root.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub file_name: String,
    pub url: Option<String>,
    pub checksum: Checksum,
    pub cache_path: PathBuf,
    pub target_path: PathBuf,
}

/// Holds the per-artifact lock until dropped.
#[derive(Debug)]
pub struct CacheLock {
    _file: File,
    path: PathBuf,
}

impl CacheLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct DownloadCache {
    cache_dir: PathBuf,
    fetcher: Box<dyn Fetcher>,
}

impl DownloadCache {
    pub fn new(cache_dir: impl Into<PathBuf>, fetcher: Box<dyn Fetcher>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            fetcher,
        }
    }

    /// A cache that fetches over HTTP(S).
    pub fn http(cache_dir: impl Into<PathBuf>) -> Self {
        Self::new(cache_dir, Box::new(HttpFetcher))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Resolve where `package` lives in the cache and in `build_root`.
    pub fn artifact(&self, package: &PackageSpec, build_root: &Path) -> Artifact {
        let file_name = package.file_name();
        Artifact {
            cache_path: self.cache_dir.join(&file_name),
            target_path: build_root.join(SOURCES_DIR).join(&file_name),
            url: package.download_url(),
            checksum: package.checksum.clone(),
            file_name,
        }
    }

    /// Make `package` present and verified in `build_root`.
    pub fn ensure(&self, package: &PackageSpec, build_root: &Path) -> bool {
        self.ensure_reporting(package, build_root, &mut |_| {})
    }

    /// [`ensure`](Self::ensure), announcing each step before it runs.
    pub fn ensure_reporting(
        &self,
        package: &PackageSpec,
        build_root: &Path,
        on_step: &mut dyn FnMut(CacheStep),
    ) -> bool {
        let artifact = self.artifact(package, build_root);
        let _lock = match self.lock(&artifact) {
            Ok(lock) => lock,
            Err(err) => {
                warn!("{}: {err:#}", artifact.file_name);
                return false;
            }
        };

        on_step(CacheStep::Scan);
        if !self.scan(&artifact) {
            return false;
        }
        on_step(CacheStep::Download);
        if !self.download(&artifact) {
            return false;
        }
        on_step(CacheStep::Checksum);
        if !self.checksum(&artifact) {
            return false;
        }
        on_step(CacheStep::Copy);
        self.copy(&artifact)
    }

    /// Block until this process holds the artifact's lock.
    pub fn lock(&self, artifact: &Artifact) -> Result<CacheLock> {
        let lock_path = self
            .cache_dir
            .join(LOCK_DIR)
            .join(format!("{}.lock", artifact.file_name));
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        // Never unlink lock files: a second process could create a fresh file
        // at the same path and lock it while ours is still held.
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;
        lock_file
            .lock_exclusive()
            .with_context(|| format!("Failed to lock {}", lock_path.display()))?;

        Ok(CacheLock {
            _file: lock_file,
            path: lock_path,
        })
    }

    pub fn scan(&self, artifact: &Artifact) -> bool {
        step_result(artifact, "scan", self.try_scan(artifact))
    }

    pub fn download(&self, artifact: &Artifact) -> bool {
        step_result(artifact, "download", self.try_download(artifact))
    }

    pub fn checksum(&self, artifact: &Artifact) -> bool {
        step_result(artifact, "checksum", self.try_checksum(artifact))
    }

    pub fn copy(&self, artifact: &Artifact) -> bool {
        step_result(artifact, "copy", self.try_copy(artifact))
    }

    /// Reconcile a build root that already holds the archive but the cache does not.
    pub(crate) fn try_scan(&self, artifact: &Artifact) -> Result<(), BuildError> {
        if artifact.cache_path.exists() || !artifact.target_path.exists() {
            return Ok(());
        }
        let target = &artifact.target_path;
        let matches = artifact
            .checksum
            .matches(target)
            .map_err(|err| BuildError::io(target, err))?;
        if matches {
            info!("promoting {} into the cache", target.display());
            self.install_file(target, &artifact.cache_path)?;
        } else {
            warn!("removing {}: checksum mismatch", target.display());
            fs::remove_file(target).map_err(|err| BuildError::io(target, err))?;
        }
        Ok(())
    }

    /// Fetch the archive if the cache lacks it. Transport errors leave it absent.
    pub(crate) fn try_download(&self, artifact: &Artifact) -> Result<(), BuildError> {
        if artifact.cache_path.exists() {
            debug!("{} already cached", artifact.file_name);
            return Ok(());
        }
        let Some(url) = &artifact.url else {
            debug!("{} has no download url", artifact.file_name);
            return Ok(());
        };

        let tmp_dir = self.cache_dir.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir).map_err(|err| BuildError::io(&tmp_dir, err))?;
        let tmp = tmp_dir.join(tmp_name(&artifact.file_name));

        info!("fetching {url}");
        match self.fetcher.fetch(url, &tmp) {
            Ok(()) => atomic_rename(&tmp, &artifact.cache_path),
            Err(err) => {
                warn!("{err}");
                let _ = fs::remove_file(&tmp);
                Ok(())
            }
        }
    }

    /// Verify the cached archive; a mismatching file is evicted.
    pub(crate) fn try_checksum(&self, artifact: &Artifact) -> Result<(), BuildError> {
        let path = &artifact.cache_path;
        let actual = artifact
            .checksum
            .digest_file(path)
            .map_err(|err| BuildError::io(path, err))?;
        if actual != artifact.checksum.expected() {
            let _ = fs::remove_file(path);
            return Err(BuildError::ChecksumMismatch {
                path: path.clone(),
                expected: artifact.checksum.expected().to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Promote the verified archive into the build root and record it.
    pub(crate) fn try_copy(&self, artifact: &Artifact) -> Result<(), BuildError> {
        self.install_file(&artifact.cache_path, &artifact.target_path)?;

        let record = DownloadRecord {
            cache_path: PathBuf::from(&artifact.file_name),
            target_path: Path::new(SOURCES_DIR).join(&artifact.file_name),
            checksum: artifact.checksum.clone(),
            verified: true,
        };
        let index = self
            .cache_dir
            .join(INDEX_DIR)
            .join(format!("{}.json", artifact.file_name));
        let json = serde_json::to_vec_pretty(&record).map_err(|err| {
            BuildError::io(&index, std::io::Error::new(std::io::ErrorKind::InvalidData, err))
        })?;
        write_atomic(&index, &json)
    }

    /// Copy `src` to `dst` through a temporary sibling so `dst` is never partial.
    fn install_file(&self, src: &Path, dst: &Path) -> Result<(), BuildError> {
        let parent = dst.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|err| BuildError::io(parent, err))?;
        let tmp = parent.join(tmp_name(".wander"));
        fs::copy(src, &tmp).map_err(|err| BuildError::io(src, err))?;
        atomic_rename(&tmp, dst)
    }

    /// Every record in the index, sorted by cache path.
    pub fn records(&self) -> Result<Vec<DownloadRecord>> {
        let index = self.cache_dir.join(INDEX_DIR);
        if !index.exists() {
            return Ok(vec![]);
        }
        let mut out = vec![];
        for ent in WalkDir::new(&index).into_iter().filter_map(|e| e.ok()) {
            if !ent.file_type().is_file()
                || ent.path().extension().and_then(|s| s.to_str()) != Some("json")
            {
                continue;
            }
            let bytes = fs::read(ent.path())
                .with_context(|| format!("Failed to read {}", ent.path().display()))?;
            let record: DownloadRecord = serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse {}", ent.path().display()))?;
            out.push(record);
        }
        out.sort_by(|a, b| a.cache_path.cmp(&b.cache_path));
        Ok(out)
    }
}

fn step_result(artifact: &Artifact, step: &str, result: Result<(), BuildError>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            warn!("{} {step} failed: {err}", artifact.file_name);
            false
        }
    }
}

fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{}-{n}", std::process::id())
}

fn atomic_rename(src: &Path, dst: &Path) -> Result<(), BuildError> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|err| BuildError::io(parent, err))?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Fall back to copy+remove (e.g. EXDEV).
            fs::copy(src, dst).map_err(|err| BuildError::io(dst, err))?;
            fs::remove_file(src).map_err(|err| BuildError::io(src, err))
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), BuildError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| BuildError::io(parent, err))?;
    let tmp = parent.join(tmp_name(".record"));
    fs::write(&tmp, bytes).map_err(|err| BuildError::io(&tmp, err))?;
    atomic_rename(&tmp, path)
}
