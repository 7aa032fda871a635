//! Filesystem primitives shared by the warehouse, mirror, and snapshot layers.
//!
//! This module centralizes the low-level file operations the rest of the
//! crate builds on:
//!
//! - Atomic replacement writes (write-then-rename with fsync) for pointer
//!   files and the mirror database file.
//! - Create-new writes for commit files and snapshot artifacts, where
//!   per-name uniqueness is the correctness mechanism.
//! - Whole-file reads with `NotFound` distinguished from other I/O failures.
//! - Directory listing used by the catalog scan.
//!
//! Keeping path handling and durability tricks here means the changelog,
//! mirror, and snapshot modules stay focused on their own invariants. Only
//! the local filesystem is supported; the `StoreLocation` enum leaves room
//! for object-store backends without rewriting callers.

use snafu::{Backtrace, prelude::*};
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Root location of a store (warehouse, mirror file parent, snapshot dir).
#[derive(Clone, Debug)]
pub enum StoreLocation {
    /// A store rooted on the local filesystem.
    Local(PathBuf),
    // Future:
    // S3 { bucket: String, prefix: String },
}

impl StoreLocation {
    /// Creates a `StoreLocation` for a local filesystem root.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        StoreLocation::Local(root.into())
    }

    /// Resolve a relative path under this location to an absolute local path.
    pub fn join(&self, rel: &Path) -> PathBuf {
        match self {
            StoreLocation::Local(root) => root.join(rel),
        }
    }

    /// The root path of the location.
    pub fn root(&self) -> &Path {
        match self {
            StoreLocation::Local(root) => root,
        }
    }
}

/// Errors raised by storage operations.
#[derive(Debug, Snafu)]
pub enum StorageError {
    /// The referenced path does not exist.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// The path that was not found.
        path: String,
        /// Underlying I/O error.
        source: io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Create-new semantics were requested but the path already exists.
    #[snafu(display("Path already exists: {path}"))]
    AlreadyExists {
        /// The path found to already exist.
        path: String,
        /// Underlying I/O error reporting the existing resource.
        source: io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Any other local filesystem failure.
    #[snafu(display("I/O error at {path}: {source}"))]
    Io {
        /// The path the operation was working on.
        path: String,
        /// Underlying I/O error with platform-specific details.
        source: io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent).await.context(IoSnafu {
            path: parent.display().to_string(),
        })?;
    }
    Ok(())
}

/// Guard that removes a temporary file on drop unless disarmed.
/// Ensures cleanup on error paths during atomic writes.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Disarm after a successful rename so the renamed file survives.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort cleanup; we are likely already handling another error.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Write `contents` to `rel_path` under `location` with atomic replacement.
///
/// The payload is written to a sibling temporary file, synced, and renamed
/// into place, so readers never observe a half-written file.
pub async fn write_atomic(
    location: &StoreLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.join(rel_path);
    create_parent_dir(&abs).await?;

    let tmp_path = abs.with_extension("tmp");
    let mut guard = TempFileGuard::new(tmp_path.clone());

    {
        let mut file = fs::File::create(&tmp_path).await.context(IoSnafu {
            path: tmp_path.display().to_string(),
        })?;

        file.write_all(contents).await.context(IoSnafu {
            path: tmp_path.display().to_string(),
        })?;

        file.sync_all().await.context(IoSnafu {
            path: tmp_path.display().to_string(),
        })?;
    }

    fs::rename(&tmp_path, &abs).await.context(IoSnafu {
        path: abs.display().to_string(),
    })?;

    guard.disarm();

    Ok(())
}

/// Create a *new* file at `rel_path` and write `contents`, failing with
/// [`StorageError::AlreadyExists`] if the file exists.
///
/// Used for commit files and snapshot artifacts where per-name uniqueness
/// is the collision-detection mechanism.
pub async fn write_new(
    location: &StoreLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.join(rel_path);
    create_parent_dir(&abs).await?;

    let path_str = abs.display().to_string();

    let open_result = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&abs)
        .await;

    let mut file = match open_result {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(e).context(AlreadyExistsSnafu { path: path_str });
        }
        Err(e) => {
            return Err(e).context(IoSnafu { path: path_str });
        }
    };

    file.write_all(contents).await.context(IoSnafu {
        path: path_str.clone(),
    })?;

    file.sync_all().await.context(IoSnafu { path: path_str })?;

    Ok(())
}

/// Read the file at `rel_path` under `location` as a `String`.
pub async fn read_to_string(location: &StoreLocation, rel_path: &Path) -> StorageResult<String> {
    let abs = location.join(rel_path);

    match fs::read_to_string(&abs).await {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e).context(NotFoundSnafu {
            path: abs.display().to_string(),
        }),
        Err(e) => Err(e).context(IoSnafu {
            path: abs.display().to_string(),
        }),
    }
}

/// Read the full contents of the file at `rel_path` under `location`.
pub async fn read_all_bytes(location: &StoreLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    let abs = location.join(rel_path);
    let path_str = abs.display().to_string();

    match fs::read(&abs).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(e).context(NotFoundSnafu { path: path_str })
        }
        Err(e) => Err(e).context(IoSnafu { path: path_str }),
    }
}

/// Copy the file at `src` to a *new* file at `dst`.
///
/// Fails with [`StorageError::AlreadyExists`] if `dst` exists, so callers
/// can disambiguate colliding names instead of silently overwriting. The
/// copy goes through [`write_new`], inheriting its fsync.
pub async fn copy_file_new(src: &Path, dst: &Path) -> StorageResult<()> {
    let bytes = match fs::read(src).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(e).context(NotFoundSnafu {
                path: src.display().to_string(),
            });
        }
        Err(e) => {
            return Err(e).context(IoSnafu {
                path: src.display().to_string(),
            });
        }
    };

    let location = StoreLocation::local(dst.parent().unwrap_or_else(|| Path::new(".")));
    let name = dst.file_name().map(PathBuf::from).unwrap_or_default();
    write_new(&location, &name, &bytes).await
}

/// List the names of subdirectories directly under `rel_path`.
///
/// A missing directory is treated as "no entries" so a catalog scan over a
/// not-yet-created namespace simply reports no tables.
pub async fn list_dir_names(
    location: &StoreLocation,
    rel_path: &Path,
) -> StorageResult<Vec<String>> {
    let abs = location.join(rel_path);
    let path_str = abs.display().to_string();

    let mut entries = match fs::read_dir(&abs).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).context(IoSnafu { path: path_str }),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.context(IoSnafu {
        path: path_str.clone(),
    })? {
        let file_type = entry.file_type().await.context(IoSnafu {
            path: path_str.clone(),
        })?;
        if file_type.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }

    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn write_atomic_creates_file_with_contents() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());

        write_atomic(&location, Path::new("test.txt"), b"hello world").await?;

        let read_back = tokio::fs::read_to_string(tmp.path().join("test.txt")).await?;
        assert_eq!(read_back, "hello world");
        Ok(())
    }

    #[tokio::test]
    async fn write_atomic_creates_parent_directories() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());

        let rel_path = Path::new("nested/deep/file.txt");
        write_atomic(&location, rel_path, b"nested content").await?;

        assert!(tmp.path().join(rel_path).exists());
        Ok(())
    }

    #[tokio::test]
    async fn write_atomic_overwrites_existing_file() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let rel_path = Path::new("overwrite.txt");

        write_atomic(&location, rel_path, b"original").await?;
        write_atomic(&location, rel_path, b"updated").await?;

        let read_back = read_to_string(&location, rel_path).await?;
        assert_eq!(read_back, "updated");
        Ok(())
    }

    #[tokio::test]
    async fn write_atomic_no_leftover_tmp_file() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());

        write_atomic(&location, Path::new("clean.txt"), b"data").await?;

        assert!(!tmp.path().join("clean.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn read_to_string_returns_not_found_for_missing_file() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());

        let err = read_to_string(&location, Path::new("missing.txt"))
            .await
            .expect_err("expected NotFound error");
        assert!(matches!(err, StorageError::NotFound { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn write_new_fails_if_file_exists() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let rel_path = Path::new("existing.txt");

        write_new(&location, rel_path, b"first").await?;

        let err = write_new(&location, rel_path, b"second")
            .await
            .expect_err("expected AlreadyExists error");
        assert!(matches!(err, StorageError::AlreadyExists { .. }));

        // Original content must be unchanged.
        let read_back = read_to_string(&location, rel_path).await?;
        assert_eq!(read_back, "first");
        Ok(())
    }

    #[tokio::test]
    async fn copy_file_new_copies_and_refuses_overwrite() -> TestResult {
        let tmp = TempDir::new()?;
        let src = tmp.path().join("src.db");
        let dst = tmp.path().join("snaps/20250101_000000.db");
        tokio::fs::write(&src, b"payload").await?;

        copy_file_new(&src, &dst).await?;
        assert_eq!(tokio::fs::read(&dst).await?, b"payload");

        let err = copy_file_new(&src, &dst)
            .await
            .expect_err("expected AlreadyExists error");
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn copy_file_new_missing_source_is_not_found() -> TestResult {
        let tmp = TempDir::new()?;
        let src = tmp.path().join("absent.db");
        let dst = tmp.path().join("out.db");

        let err = copy_file_new(&src, &dst)
            .await
            .expect_err("expected NotFound error");
        assert!(matches!(err, StorageError::NotFound { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn list_dir_names_lists_only_directories() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());

        tokio::fs::create_dir_all(tmp.path().join("ns/alpha")).await?;
        tokio::fs::create_dir_all(tmp.path().join("ns/beta")).await?;
        tokio::fs::write(tmp.path().join("ns/stray.txt"), b"x").await?;

        let names = list_dir_names(&location, Path::new("ns")).await?;
        assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn list_dir_names_missing_dir_is_empty() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());

        let names = list_dir_names(&location, Path::new("nope")).await?;
        assert!(names.is_empty());
        Ok(())
    }
}
