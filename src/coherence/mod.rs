//! Per-file locking and optimistic-concurrency writes
//!
//! Every operation on a file goes through the lock for its canonical path, so
//! two tool calls (or two scripts) can never interleave a read-modify-write on
//! the same file. Writers present the version they last read; a write against
//! a stale version is rejected instead of overwriting someone else's change.

use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::util::canonicalize_allow_missing;

/// Reads retried while the file keeps changing underneath.
const READ_ATTEMPTS: usize = 3;

/// On-disk identity of a file: modification time plus length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileVersion {
    /// Nanoseconds since the Unix epoch.
    pub modified_ns: u64,
    pub len: u64,
}

impl FileVersion {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        let modified_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self {
            modified_ns,
            len: meta.len(),
        }
    }
}

/// Compact token handed to the model, e.g. `1718000000123456789-42`.
impl fmt::Display for FileVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.modified_ns, self.len)
    }
}

impl FromStr for FileVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (modified, len) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("Invalid file version: {}", s))?;
        Ok(Self {
            modified_ns: modified
                .parse()
                .map_err(|_| format!("Invalid file version: {}", s))?,
            len: len.parse().map_err(|_| format!("Invalid file version: {}", s))?,
        })
    }
}

/// What the caller believes about the file before writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Overwrite whatever is there.
    Any,
    /// The file must not exist yet.
    Absent,
    /// The file must still be at this version.
    Matches(FileVersion),
}

impl From<Option<FileVersion>> for Precondition {
    fn from(expected: Option<FileVersion>) -> Self {
        match expected {
            Some(version) => Precondition::Matches(version),
            None => Precondition::Absent,
        }
    }
}

#[derive(Debug, Error)]
pub enum CoherenceError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),
    #[error("{path} changed since it was read (expected {expected}, found {actual})")]
    VersionConflict {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CoherenceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return CoherenceError::NotFound(path.to_path_buf());
        }
        CoherenceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub version: FileVersion,
    /// Unified diff against the previous content; `None` for new files.
    pub patch: Option<String>,
    pub created: bool,
}

/// Owner of all per-path locks. Entries are created on first touch and live
/// for the rest of the process.
#[derive(Default)]
pub struct FileCoherenceManager {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileCoherenceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, canonical: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(canonical.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Number of distinct paths that have been locked so far.
    pub fn tracked_paths(&self) -> usize {
        self.locks
            .lock()
            .map(|l| l.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    /// Run `op` while holding the exclusive lock for `path`.
    ///
    /// The operation receives a [`LockedFile`] whose helpers must be used
    /// for I/O on this path; calling back into the manager for the same
    /// path from inside `op` would deadlock.
    pub async fn with_file_lock<F, Fut, T>(&self, path: &Path, op: F) -> Result<T, CoherenceError>
    where
        F: FnOnce(LockedFile) -> Fut,
        Fut: Future<Output = T>,
    {
        let canonical = canonicalize_allow_missing(path).map_err(|e| CoherenceError::io(path, e))?;
        let lock = self.lock_for(&canonical);
        let _guard = lock.lock().await;
        tracing::trace!(path = %canonical.display(), "file lock acquired");
        Ok(op(LockedFile { path: canonical }).await)
    }

    pub async fn read_with_version(&self, path: &Path) -> Result<(String, FileVersion), CoherenceError> {
        self.with_file_lock(path, |file| async move { file.read_with_version().await })
            .await?
    }

    /// Current version, `None` when the file does not exist.
    pub async fn version(&self, path: &Path) -> Result<Option<FileVersion>, CoherenceError> {
        self.with_file_lock(path, |file| async move { file.version().await })
            .await?
    }

    /// Write `content` only if the file is still at `expected_version`
    /// (`None` meaning it must not exist). Returns `false` without writing on
    /// a mismatch.
    pub async fn write_with_coherence(
        &self,
        path: &Path,
        content: &str,
        expected_version: Option<FileVersion>,
    ) -> Result<bool, CoherenceError> {
        match self
            .write_versioned(path, content, expected_version.into())
            .await
        {
            Ok(_) => Ok(true),
            Err(CoherenceError::VersionConflict { path, .. }) => {
                tracing::debug!(path = %path.display(), "rejected stale write");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn write_versioned(
        &self,
        path: &Path,
        content: &str,
        precondition: Precondition,
    ) -> Result<WriteOutcome, CoherenceError> {
        let content = content.to_string();
        self.with_file_lock(path, move |file| async move {
            file.write_checked(&content, precondition).await
        })
        .await?
    }
}

/// Handle to a file whose lock is held by the surrounding
/// [`FileCoherenceManager::with_file_lock`] call.
#[derive(Debug)]
pub struct LockedFile {
    path: PathBuf,
}

impl LockedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn version(&self) -> Result<Option<FileVersion>, CoherenceError> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => Ok(Some(FileVersion::from_metadata(&meta))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoherenceError::io(&self.path, e)),
        }
    }

    /// Content and version taken from one open handle. A version that moves
    /// while the bytes are read triggers a re-read; if it never settles the
    /// earlier version is returned so a write against it conflicts.
    pub async fn read_with_version(&self) -> Result<(String, FileVersion), CoherenceError> {
        let io = |e: std::io::Error| CoherenceError::io(&self.path, e);
        let mut file = tokio::fs::File::open(&self.path).await.map_err(io)?;
        let mut bytes = Vec::new();
        let mut version;
        let mut attempt = 0;
        loop {
            attempt += 1;
            version = FileVersion::from_metadata(&file.metadata().await.map_err(io)?);
            bytes.clear();
            file.seek(SeekFrom::Start(0)).await.map_err(io)?;
            file.read_to_end(&mut bytes).await.map_err(io)?;
            let after = FileVersion::from_metadata(&file.metadata().await.map_err(io)?);
            if (after == version && bytes.len() as u64 == version.len) || attempt == READ_ATTEMPTS {
                break;
            }
            tracing::debug!(path = %self.path.display(), attempt, "file changed during read");
        }
        let content = String::from_utf8(bytes)
            .map_err(|e| io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        Ok((content, version))
    }

    /// Check the precondition, then replace the file atomically.
    pub async fn write_checked(
        &self,
        content: &str,
        precondition: Precondition,
    ) -> Result<WriteOutcome, CoherenceError> {
        let current = self.version().await?;
        let ok = match (precondition, current) {
            (Precondition::Any, _) => true,
            (Precondition::Absent, None) => true,
            (Precondition::Matches(expected), Some(actual)) => expected == actual,
            _ => false,
        };
        if !ok {
            return Err(CoherenceError::VersionConflict {
                path: self.path.clone(),
                expected: describe(precondition),
                actual: current
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "missing".to_string()),
            });
        }

        let previous = match current {
            Some(_) => tokio::fs::read_to_string(&self.path).await.ok(),
            None => None,
        };

        self.write_atomic(content).await?;
        let version = self
            .version()
            .await?
            .ok_or_else(|| CoherenceError::NotFound(self.path.clone()))?;

        let patch = previous.map(|old| unified_patch(&self.path, &old, content));
        tracing::debug!(path = %self.path.display(), %version, "file written");
        Ok(WriteOutcome {
            version,
            patch,
            created: current.is_none(),
        })
    }

    /// Sibling temp file, fsync, rename. The temp file is removed on failure.
    pub async fn write_atomic(&self, content: &str) -> Result<(), CoherenceError> {
        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| CoherenceError::io(&parent, e))?;

        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let tmp_path = parent.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()));

        let result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(content.as_bytes()).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &self.path).await
        }
        .await;

        if let Err(err) = result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(CoherenceError::io(&self.path, err));
        }
        Ok(())
    }
}

fn describe(precondition: Precondition) -> String {
    match precondition {
        Precondition::Any => "any".to_string(),
        Precondition::Absent => "missing".to_string(),
        Precondition::Matches(v) => v.to_string(),
    }
}

/// Unified diff for human review.
pub fn unified_patch(path: &Path, old: &str, new: &str) -> String {
    let name = path.to_string_lossy();
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{}", name), &format!("b/{}", name))
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn read_returns_content_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "hello").unwrap();

        let manager = FileCoherenceManager::new();
        let (content, version) = manager.read_with_version(&path).await.unwrap();
        assert_eq!(content, "hello");
        assert_eq!(version.len, 5);

        let missing = manager.read_with_version(&dir.path().join("nope")).await;
        assert!(matches!(missing, Err(CoherenceError::NotFound(_))));
    }

    #[tokio::test]
    async fn read_version_describes_the_bytes_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "first draft\n").unwrap();

        let manager = FileCoherenceManager::new();
        let (_, before) = manager.read_with_version(&path).await.unwrap();
        std::fs::write(&path, "second, longer draft\n").unwrap();

        let (content, version) = manager.read_with_version(&path).await.unwrap();
        assert_eq!(content, "second, longer draft\n");
        assert_eq!(version.len, content.len() as u64);
        assert_ne!(version, before);
        assert_eq!(manager.version(&path).await.unwrap(), Some(version));

        std::fs::write(&path, [0xff, 0xfe]).unwrap();
        assert!(matches!(
            manager.read_with_version(&path).await,
            Err(CoherenceError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn stale_version_rejects_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "one").unwrap();

        let manager = FileCoherenceManager::new();
        let (_, v1) = manager.read_with_version(&path).await.unwrap();

        assert!(manager
            .write_with_coherence(&path, "second", Some(v1))
            .await
            .unwrap());
        // v1 is now stale.
        assert!(!manager
            .write_with_coherence(&path, "third!!", Some(v1))
            .await
            .unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }

    #[tokio::test]
    async fn absent_precondition_creates_file_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/new.txt");

        let manager = FileCoherenceManager::new();
        assert!(manager.write_with_coherence(&path, "fresh", None).await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "fresh");

        // A second create must fail: the file exists now.
        assert!(!manager.write_with_coherence(&path, "again", None).await.unwrap());
    }

    #[tokio::test]
    async fn overwrite_produces_patch_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("code.rs");
        std::fs::write(&path, "fn a() {}\nfn b() {}\n").unwrap();

        let manager = FileCoherenceManager::new();
        let outcome = manager
            .write_versioned(&path, "fn a() {}\nfn c() {}\n", Precondition::Any)
            .await
            .unwrap();
        assert!(!outcome.created);
        let patch = outcome.patch.unwrap();
        assert!(patch.contains("-fn b() {}"));
        assert!(patch.contains("+fn c() {}"));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn same_path_operations_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.txt");
        let manager = Arc::new(FileCoherenceManager::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let path = path.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .with_file_lock(&path, |_file| async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(manager.tracked_paths(), 1);
    }

    #[tokio::test]
    async fn different_paths_may_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(FileCoherenceManager::new());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        let m1 = manager.clone();
        // Holds the lock on `a` until `b`'s operation signals.
        let waiter = tokio::spawn(async move {
            m1.with_file_lock(&a, |_f| async move {
                rx.await.ok();
            })
            .await
            .unwrap();
        });
        manager
            .with_file_lock(&b, |_f| async move {
                tx.send(()).ok();
            })
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("different paths should not block each other")
            .unwrap();
    }

    #[tokio::test]
    async fn locked_file_supports_read_modify_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter.txt");
        std::fs::write(&path, "1").unwrap();

        let manager = FileCoherenceManager::new();
        let result = manager
            .with_file_lock(&path, |file| async move {
                let (content, version) = file.read_with_version().await?;
                let next = content.parse::<u32>().unwrap_or(0) + 1;
                file.write_checked(&next.to_string(), Precondition::Matches(version))
                    .await
            })
            .await
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "2");
    }

    #[test]
    fn version_token_round_trips() {
        let v = FileVersion {
            modified_ns: 1_718_000_000_123,
            len: 42,
        };
        assert_eq!(v.to_string().parse::<FileVersion>().unwrap(), v);
        assert!("garbage".parse::<FileVersion>().is_err());
    }
}
