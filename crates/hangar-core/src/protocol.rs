//! JSON payloads exchanged over the Flight surface.
//!
//! Flight itself carries the record batches; these structs ride along in
//! descriptor commands and `PutResult` metadata. They are the only wire
//! contract shared between the server and client crates, so both depend on
//! this module instead of redeclaring the shapes.

use serde::{Deserialize, Serialize};

use crate::store::{InsertReport, SnapshotStatus};

/// Action name for query-based schema probes.
pub const GET_SCHEMA_ACTION: &str = "get_schema_using_query";

/// Command descriptor payload for an upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadCommand {
    /// Target table name.
    pub table: String,
    /// Insert mode: `"append"` or `"overwrite"`.
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Optional destination-store hint, echoed back and logged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

fn default_mode() -> String {
    "append".to_string()
}

/// Snapshot outcome carried in an [`UploadResult`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SnapshotOutcome {
    /// Snapshot pipeline completed.
    Completed {
        /// Timestamp-derived snapshot key.
        key: String,
        /// Path of the snapshot artifact on the server.
        path: String,
    },
    /// Snapshot pipeline failed after the insert committed.
    Failed {
        /// Human-readable cause.
        message: String,
    },
    /// No snapshot was attempted (zero-row upload).
    Skipped,
}

impl SnapshotOutcome {
    /// Whether the snapshot completed.
    pub fn is_completed(&self) -> bool {
        matches!(self, SnapshotOutcome::Completed { .. })
    }
}

impl From<&SnapshotStatus> for SnapshotOutcome {
    fn from(status: &SnapshotStatus) -> Self {
        match status {
            SnapshotStatus::Completed(snap) => SnapshotOutcome::Completed {
                key: snap.key.clone(),
                path: snap.path.display().to_string(),
            },
            SnapshotStatus::Failed { message } => SnapshotOutcome::Failed {
                message: message.clone(),
            },
            SnapshotStatus::Skipped => SnapshotOutcome::Skipped,
        }
    }
}

/// Result of one upload, carried in `PutResult.app_metadata`.
///
/// The snapshot outcome is a field rather than an error: a failed snapshot
/// after a committed insert still reports the insert as successful.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadResult {
    /// Table written to.
    pub table_name: String,
    /// Rows committed by this upload.
    pub rows_written: u64,
    /// Outcome of the snapshot triggered by the upload.
    pub snapshot: SnapshotOutcome,
}

impl From<&InsertReport> for UploadResult {
    fn from(report: &InsertReport) -> Self {
        UploadResult {
            table_name: report.table.clone(),
            rows_written: report.rows_written,
            snapshot: SnapshotOutcome::from(&report.snapshot),
        }
    }
}
