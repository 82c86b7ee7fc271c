//! On-disk concordance artifacts.
//!
//! # File Layout
//!
//! ```text
//! {cache_root}/{corpus dir}/{fingerprint}.conc       published artifact
//! {cache_root}/{corpus dir}/{fingerprint}.conc.tmp   write in progress
//! ```
//!
//! # Publication
//!
//! Writers save to `<path>.tmp` and rename over `<path>`. A published file is
//! never truncated in place, so readers holding it open always see a complete
//! snapshot. Permissions are normalized to group-writable after every rename
//! so that any worker process can republish.
//!
//! # Header
//!
//! The body is engine-specific. The coordinator only peeks at three header
//! fields: the finished flag (byte 15), fullsize (u64 LE at byte 16) and
//! concsize (u32 LE at byte 32).

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::fingerprint::{CorpusCacheKey, Fingerprint};

/// Offset of the finished flag.
pub const FINISHED_OFFSET: usize = 15;
/// Offset of the fullsize field.
pub const FULLSIZE_OFFSET: usize = 16;
/// Offset of the concsize field.
pub const CONCSIZE_OFFSET: usize = 32;
/// Bytes needed to read every header field.
pub const HEADER_LEN: usize = CONCSIZE_OFFSET + 4;

/// Extension of published artifacts.
pub const ARTIFACT_EXTENSION: &str = "conc";
/// Suffix appended to an artifact path while it is being written.
pub const TMP_SUFFIX: &str = ".tmp";

/// Size information peeked from an artifact header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArtifactHeader {
    pub finished: bool,
    pub fullsize: u64,
    pub concsize: u32,
}

impl ArtifactHeader {
    /// Parses the header fields. Returns `None` if `bytes` is too short.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let mut fullsize = [0u8; 8];
        fullsize.copy_from_slice(&bytes[FULLSIZE_OFFSET..FULLSIZE_OFFSET + 8]);
        let mut concsize = [0u8; 4];
        concsize.copy_from_slice(&bytes[CONCSIZE_OFFSET..CONCSIZE_OFFSET + 4]);
        Some(Self {
            finished: bytes[FINISHED_OFFSET] == 1,
            fullsize: u64::from_le_bytes(fullsize),
            concsize: u32::from_le_bytes(concsize),
        })
    }

    /// Encodes a header with the engine's layout.
    ///
    /// The coordinator never writes artifacts itself; this exists for engine
    /// adapters and fixtures.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[FINISHED_OFFSET] = u8::from(self.finished);
        buf[FULLSIZE_OFFSET..FULLSIZE_OFFSET + 8].copy_from_slice(&self.fullsize.to_le_bytes());
        buf[CONCSIZE_OFFSET..CONCSIZE_OFFSET + 4].copy_from_slice(&self.concsize.to_le_bytes());
        buf
    }
}

/// Filesystem metadata of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactStat {
    pub size: u64,
    pub mtime: SystemTime,
}

/// Artifact file layout and publication.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the artifacts of one corpus/subcorpus.
    pub fn corpus_dir(&self, corpus: &CorpusCacheKey) -> PathBuf {
        self.root.join(corpus.dir_name())
    }

    /// Path of the artifact for `fp`.
    pub fn artifact_path(&self, corpus: &CorpusCacheKey, fp: &Fingerprint) -> PathBuf {
        self.corpus_dir(corpus)
            .join(format!("{}.{}", fp.as_str(), ARTIFACT_EXTENSION))
    }

    /// Temporary path a writer saves to before publishing `path`.
    pub fn tmp_path(path: &Path) -> PathBuf {
        let mut s: OsString = path.as_os_str().to_owned();
        s.push(TMP_SUFFIX);
        PathBuf::from(s)
    }

    /// Returns true if `path` is a transient write file.
    pub fn is_tmp_path(path: &Path) -> bool {
        path.to_string_lossy().ends_with(TMP_SUFFIX)
    }

    /// Creates the per-corpus directory.
    pub async fn ensure_dir(&self, corpus: &CorpusCacheKey) -> io::Result<PathBuf> {
        let dir = self.corpus_dir(corpus);
        tokio::fs::create_dir_all(&dir).await?;
        set_group_writable(&dir).await;
        Ok(dir)
    }

    /// Publishes `<path>.tmp` as `path` by renaming over it.
    pub async fn publish(&self, path: &Path) -> io::Result<()> {
        let tmp = Self::tmp_path(path);
        tokio::fs::rename(&tmp, path).await?;
        set_group_writable(path).await;
        debug!(path = %path.display(), "Artifact published");
        Ok(())
    }

    /// Writes `data` to `<path>.tmp` and publishes it.
    pub async fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(Self::tmp_path(path), data).await?;
        self.publish(path).await
    }

    /// Reads the header of a published artifact.
    ///
    /// Returns `Ok(None)` if the file is shorter than a header.
    pub async fn read_header(&self, path: &Path) -> io::Result<Option<ArtifactHeader>> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = [0u8; HEADER_LEN];
        match file.read_exact(&mut buf).await {
            Ok(_) => Ok(ArtifactHeader::parse(&buf)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Size and mtime, or `None` if the file does not exist.
    pub async fn stat(&self, path: &Path) -> io::Result<Option<ArtifactStat>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(Some(ArtifactStat {
                size: meta.len(),
                mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    /// Deletes a file. Returns false if it did not exist.
    pub async fn delete(&self, path: &Path) -> io::Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Deletes an artifact and its temporary file, swallowing I/O errors.
    pub async fn del_silent(&self, path: &Path) {
        for p in [path.to_path_buf(), Self::tmp_path(path)] {
            if let Err(e) = self.delete(&p).await {
                warn!(path = %p.display(), error = %e, "Failed to delete artifact");
            }
        }
    }

    /// Lists per-corpus directories under the cache root.
    pub async fn corpus_dirs(&self) -> io::Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(dirs),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }

    /// Lists files of a corpus directory with their metadata.
    pub async fn list_files(&self, dir: &Path) -> io::Result<Vec<(PathBuf, ArtifactStat)>> {
        let mut files = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            files.push((
                entry.path(),
                ArtifactStat {
                    size: meta.len(),
                    mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                },
            ));
        }
        Ok(files)
    }
}

/// Fingerprint string encoded in an artifact file name, if it is one.
pub fn fingerprint_of(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(".conc")
}

#[cfg(unix)]
async fn set_group_writable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(_) => return,
    };
    let mut perms = meta.permissions();
    let mode = perms.mode() | 0o660;
    if mode != perms.mode() {
        perms.set_mode(mode);
        if let Err(e) = tokio::fs::set_permissions(path, perms).await {
            debug!(path = %path.display(), error = %e, "Failed to set group-writable permissions");
        }
    }
}

#[cfg(not(unix))]
async fn set_group_writable(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Pipeline;
    use tempfile::TempDir;

    fn fp() -> (CorpusCacheKey, Fingerprint) {
        let key = CorpusCacheKey::whole("syn2020");
        let q = Pipeline::parse(&["q[word=\"dog\"]"]).unwrap();
        let fp = Fingerprint::compute(&key, q.ops(), 0);
        (key, fp)
    }

    #[test]
    fn test_header_encode_parse() {
        let header = ArtifactHeader {
            finished: true,
            fullsize: 1_234_567_890_123,
            concsize: 42,
        };
        let bytes = header.encode();
        assert_eq!(bytes[15], 1);
        assert_eq!(ArtifactHeader::parse(&bytes), Some(header));
        assert_eq!(ArtifactHeader::parse(&bytes[..20]), None);
    }

    #[test]
    fn test_paths() {
        let store = ArtifactStore::new("/cache");
        let (key, fp) = fp();
        let path = store.artifact_path(&key, &fp);
        assert_eq!(path.parent().unwrap(), Path::new("/cache/syn2020"));
        assert_eq!(fingerprint_of(&path), Some(fp.as_str()));

        let tmp = ArtifactStore::tmp_path(&path);
        assert!(tmp.to_string_lossy().ends_with(".conc.tmp"));
        assert!(ArtifactStore::is_tmp_path(&tmp));
        assert_eq!(fingerprint_of(&tmp), None);
    }

    #[tokio::test]
    async fn test_write_atomic_leaves_no_tmp() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let (key, fp) = fp();
        store.ensure_dir(&key).await.unwrap();
        let path = store.artifact_path(&key, &fp);

        let header = ArtifactHeader {
            finished: false,
            fullsize: 10,
            concsize: 3,
        };
        store.write_atomic(&path, &header.encode()).await.unwrap();

        assert!(store.exists(&path).await);
        assert!(!store.exists(&ArtifactStore::tmp_path(&path)).await);
        assert_eq!(store.read_header(&path).await.unwrap(), Some(header));
    }

    #[tokio::test]
    async fn test_republish_replaces_content() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let (key, fp) = fp();
        let path = store.artifact_path(&key, &fp);

        for concsize in [1u32, 5, 9] {
            let header = ArtifactHeader {
                finished: concsize == 9,
                fullsize: 9,
                concsize,
            };
            store.write_atomic(&path, &header.encode()).await.unwrap();
        }
        let header = store.read_header(&path).await.unwrap().unwrap();
        assert!(header.finished);
        assert_eq!(header.concsize, 9);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_publish_sets_group_writable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let path = dir.path().join("x.conc");
        store.write_atomic(&path, b"data").await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o060, 0o060);
    }

    #[tokio::test]
    async fn test_short_file_has_no_header() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let path = dir.path().join("short.conc");
        store.write_atomic(&path, b"abc").await.unwrap();
        assert_eq!(store.read_header(&path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_del_silent_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.del_silent(&dir.path().join("missing.conc")).await;
    }

    #[tokio::test]
    async fn test_stat_and_listing() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let (key, fp) = fp();
        store.ensure_dir(&key).await.unwrap();
        let path = store.artifact_path(&key, &fp);
        store.write_atomic(&path, &[0u8; 64]).await.unwrap();

        let stat = store.stat(&path).await.unwrap().unwrap();
        assert_eq!(stat.size, 64);
        assert!(store.stat(&dir.path().join("nope")).await.unwrap().is_none());

        let dirs = store.corpus_dirs().await.unwrap();
        assert_eq!(dirs.len(), 1);
        let files = store.list_files(&dirs[0]).await.unwrap();
        assert_eq!(files.len(), 1);
    }
}
