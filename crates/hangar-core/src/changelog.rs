//! Per-table commit log: durability and optimistic concurrency.
//!
//! Each table directory carries a `_changelog/` with zero-padded JSON commit
//! files and a `CURRENT` pointer naming the latest committed version. This
//! module owns all on-disk interactions with that layout:
//!
//! - Interpreting a missing `CURRENT` as version `0` (table not yet created).
//! - Writing commit files with create-new semantics so each version is
//!   created exactly once (the OCC guard).
//! - Replaying commits in order to rebuild the current [`TableState`].
//!
//! Higher layers decide *which* actions to commit; this module only makes
//! them durable and re-readable.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

use crate::{
    schema::TableSchema,
    segment::SegmentMeta,
    storage::{self, StorageError, StoreLocation},
};

/// An action recorded in a commit, applied in order during replay.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogAction {
    /// Set or replace the table schema (full replacement).
    SetSchema(TableSchema),

    /// Add a data segment.
    AddSegment(SegmentMeta),

    /// Drop all live segments (overwrite semantics).
    Truncate,
}

/// A single, immutable commit in the changelog.
///
/// `base_version` records what the writer believed was current when the
/// commit was prepared; the create-new write of the commit file enforces
/// that belief.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Commit {
    /// Version number of this commit (monotonic, starting from 1).
    pub version: u64,

    /// Version the writer observed before preparing this commit.
    pub base_version: u64,

    /// Commit creation timestamp, RFC3339 UTC.
    pub timestamp: DateTime<Utc>,

    /// Ordered actions describing how table state changes.
    pub actions: Vec<LogAction>,
}

/// In-memory view of a table, reconstructed by replaying the changelog.
///
/// Invariant: `version` matches `CURRENT`, and `schema`/`segments` are the
/// result of applying commits 1..=`version` in order. Segment order is
/// append order, which is also read order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableState {
    /// Latest committed version recorded in CURRENT.
    pub version: u64,
    /// Declared table schema, if a SetSchema action has been committed.
    pub schema: Option<TableSchema>,
    /// Live segments in append order.
    pub segments: Vec<SegmentMeta>,
}

impl TableState {
    /// Total rows across live segments.
    pub fn row_count(&self) -> u64 {
        self.segments.iter().map(|s| s.row_count).sum()
    }
}

/// Errors from commit machinery.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommitError {
    /// Another writer committed the version this writer was about to write.
    #[snafu(display(
        "Commit conflict: version {version} already exists (expected base {base_version})"
    ))]
    Conflict {
        /// The version that already existed.
        version: u64,
        /// The base version the writer observed.
        base_version: u64,
    },

    /// Storage failure while reading or writing log files.
    #[snafu(display("Changelog storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(source, backtrace)]
        source: StorageError,
    },

    /// The on-disk log contents are not interpretable.
    #[snafu(display("Corrupt changelog state: {msg}"))]
    CorruptState {
        /// Description of the corruption.
        msg: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

/// Reader/writer for the commit log under one table root.
///
/// Layout:
///   `<table>/_changelog/0000000001.json`
///   `<table>/_changelog/0000000002.json`
///   `<table>/_changelog/CURRENT`
#[derive(Debug, Clone)]
pub struct ChangeLog {
    location: StoreLocation,
}

impl ChangeLog {
    /// Name of the subdirectory containing the commit log.
    pub const LOG_DIR_NAME: &'static str = "_changelog";
    /// Name of the file storing the current version pointer.
    pub const CURRENT_FILE_NAME: &'static str = "CURRENT";
    /// Digits used in zero-padded commit file names.
    pub const COMMIT_FILENAME_DIGITS: usize = 10;

    /// Create a changelog rooted at a table directory.
    pub fn new(location: StoreLocation) -> Self {
        Self { location }
    }

    /// The table root this log lives under.
    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    fn log_rel_dir() -> PathBuf {
        PathBuf::from(Self::LOG_DIR_NAME)
    }

    fn current_rel_path() -> PathBuf {
        Self::log_rel_dir().join(Self::CURRENT_FILE_NAME)
    }

    fn commit_rel_path(version: u64) -> PathBuf {
        let file_name = format!(
            "{:0width$}.json",
            version,
            width = Self::COMMIT_FILENAME_DIGITS
        );
        Self::log_rel_dir().join(file_name)
    }

    /// Load the CURRENT version pointer.
    ///
    /// A missing CURRENT means the table has never been committed to and
    /// reads as version 0. Invalid contents are corruption, not absence.
    pub async fn load_current_version(&self) -> Result<u64, CommitError> {
        let rel = Self::current_rel_path();

        let contents = match storage::read_to_string(&self.location, &rel).await {
            Ok(s) => s,
            Err(StorageError::NotFound { .. }) => return Ok(0),
            Err(source) => return Err(CommitError::Storage { source }),
        };

        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return CorruptStateSnafu {
                msg: format!("CURRENT has empty content at {rel:?}"),
            }
            .fail();
        }

        trimmed.parse::<u64>().map_err(|e| {
            CorruptStateSnafu {
                msg: format!("CURRENT does not contain a version number: {e}"),
            }
            .build()
        })
    }

    /// Load a single commit by version.
    pub async fn load_commit(&self, version: u64) -> Result<Commit, CommitError> {
        let rel = Self::commit_rel_path(version);
        let json = storage::read_to_string(&self.location, &rel)
            .await
            .context(StorageSnafu)?;

        serde_json::from_str(&json).map_err(|e| {
            CorruptStateSnafu {
                msg: format!("failed to parse commit {version}: {e}"),
            }
            .build()
        })
    }

    /// Commit `actions` as version `expected_version + 1`.
    ///
    /// The commit file write uses create-new semantics; if the file already
    /// exists another writer won the version and this returns
    /// [`CommitError::Conflict`]. On success the CURRENT pointer is advanced
    /// and the new version returned.
    pub async fn commit_with_expected_version(
        &self,
        expected_version: u64,
        actions: Vec<LogAction>,
    ) -> Result<u64, CommitError> {
        let next_version = expected_version + 1;

        let commit = Commit {
            version: next_version,
            base_version: expected_version,
            timestamp: Utc::now(),
            actions,
        };

        let payload = serde_json::to_vec_pretty(&commit).map_err(|e| {
            CorruptStateSnafu {
                msg: format!("failed to serialize commit {next_version}: {e}"),
            }
            .build()
        })?;

        let rel = Self::commit_rel_path(next_version);
        match storage::write_new(&self.location, &rel, &payload).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists { .. }) => {
                return ConflictSnafu {
                    version: next_version,
                    base_version: expected_version,
                }
                .fail();
            }
            Err(source) => return Err(CommitError::Storage { source }),
        }

        let current = format!("{next_version}");
        storage::write_atomic(&self.location, &Self::current_rel_path(), current.as_bytes())
            .await
            .context(StorageSnafu)?;

        Ok(next_version)
    }

    /// Rebuild the current [`TableState`] by replaying all commits up to CURRENT.
    ///
    /// CURRENT == 0 yields an empty state (version 0, no schema, no
    /// segments); callers decide whether that means "not found".
    pub async fn rebuild_state(&self) -> Result<TableState, CommitError> {
        let current_version = self.load_current_version().await?;

        let mut schema: Option<TableSchema> = None;
        let mut segments: Vec<SegmentMeta> = Vec::new();

        for v in 1..=current_version {
            let commit = self.load_commit(v).await?;

            // File name version must match payload.
            if commit.version != v {
                return CorruptStateSnafu {
                    msg: format!(
                        "Commit version mismatch: expected {v}, found {} in payload",
                        commit.version
                    ),
                }
                .fail();
            }

            for action in commit.actions {
                match action {
                    LogAction::SetSchema(s) => {
                        schema = Some(s);
                    }
                    LogAction::AddSegment(meta) => {
                        segments.push(meta);
                    }
                    LogAction::Truncate => {
                        segments.clear();
                    }
                }
            }
        }

        Ok(TableState {
            version: current_version,
            schema,
            segments,
        })
    }

    /// Whether this table has any committed state at all.
    pub async fn exists(&self) -> Result<bool, CommitError> {
        Ok(self.load_current_version().await? > 0)
    }

    /// Relative path of one commit file, exposed for tooling and tests.
    pub fn commit_path(version: u64) -> PathBuf {
        Self::commit_rel_path(version)
    }

    /// Relative path of the CURRENT pointer.
    pub fn current_path() -> PathBuf {
        Self::current_rel_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType};
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn create_test_log() -> (TempDir, ChangeLog) {
        let tmp = TempDir::new().expect("create temp dir");
        let location = StoreLocation::local(tmp.path());
        (tmp, ChangeLog::new(location))
    }

    fn sample_schema() -> TableSchema {
        TableSchema::new(vec![
            ColumnDef {
                name: "id".to_string(),
                data_type: ColumnType::Int64,
                nullable: true,
            },
            ColumnDef {
                name: "value".to_string(),
                data_type: ColumnType::Utf8,
                nullable: true,
            },
        ])
        .expect("valid schema")
    }

    fn sample_segment(id: &str, rows: u64) -> SegmentMeta {
        SegmentMeta {
            segment_id: crate::segment::SegmentId(id.to_string()),
            path: format!("data/{id}.parquet"),
            row_count: rows,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn fresh_table_reads_as_version_zero() -> TestResult {
        let (_tmp, log) = create_test_log();
        assert_eq!(log.load_current_version().await?, 0);
        assert!(!log.exists().await?);

        let state = log.rebuild_state().await?;
        assert_eq!(state.version, 0);
        assert!(state.schema.is_none());
        assert!(state.segments.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn commit_and_replay_happy_path() -> TestResult {
        let (_tmp, log) = create_test_log();
        let schema = sample_schema();

        let v1 = log
            .commit_with_expected_version(0, vec![LogAction::SetSchema(schema.clone())])
            .await?;
        let v2 = log
            .commit_with_expected_version(
                v1,
                vec![
                    LogAction::AddSegment(sample_segment("seg1", 10)),
                    LogAction::AddSegment(sample_segment("seg2", 5)),
                ],
            )
            .await?;

        let state = log.rebuild_state().await?;
        assert_eq!(state.version, v2);
        assert_eq!(state.schema, Some(schema));
        assert_eq!(state.segments.len(), 2);
        assert_eq!(state.row_count(), 15);
        Ok(())
    }

    #[tokio::test]
    async fn truncate_clears_segments() -> TestResult {
        let (_tmp, log) = create_test_log();
        let schema = sample_schema();

        let v1 = log
            .commit_with_expected_version(
                0,
                vec![
                    LogAction::SetSchema(schema.clone()),
                    LogAction::AddSegment(sample_segment("old", 100)),
                ],
            )
            .await?;
        log.commit_with_expected_version(
            v1,
            vec![
                LogAction::Truncate,
                LogAction::AddSegment(sample_segment("new", 3)),
            ],
        )
        .await?;

        let state = log.rebuild_state().await?;
        assert_eq!(state.segments.len(), 1);
        assert_eq!(state.segments[0].segment_id.0, "new");
        assert_eq!(state.row_count(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts() -> TestResult {
        let (_tmp, log) = create_test_log();

        log.commit_with_expected_version(0, vec![LogAction::SetSchema(sample_schema())])
            .await?;

        // A second writer still believing version 0 must lose.
        let err = log
            .commit_with_expected_version(0, vec![LogAction::Truncate])
            .await
            .expect_err("expected conflict");
        assert!(matches!(err, CommitError::Conflict { version: 1, .. }));
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_commit_payload_is_reported() -> TestResult {
        let (tmp, log) = create_test_log();

        log.commit_with_expected_version(0, vec![LogAction::SetSchema(sample_schema())])
            .await?;

        let commit_path = tmp.path().join(ChangeLog::commit_path(1));
        tokio::fs::write(&commit_path, b"not-json").await?;

        let err = log.rebuild_state().await.expect_err("expected error");
        assert!(matches!(err, CommitError::CorruptState { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn empty_current_is_corrupt() -> TestResult {
        let (tmp, log) = create_test_log();

        let current = tmp.path().join(ChangeLog::current_path());
        tokio::fs::create_dir_all(current.parent().expect("log dir parent")).await?;
        tokio::fs::write(&current, b"  \n").await?;

        let err = log
            .load_current_version()
            .await
            .expect_err("expected corrupt state");
        assert!(matches!(err, CommitError::CorruptState { .. }));
        Ok(())
    }
}
