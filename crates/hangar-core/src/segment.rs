//! Parquet segment metadata and I/O.
//!
//! A segment is a single Parquet file holding the rows of one insert. The
//! metadata model here is pure data recorded in changelog commits; the I/O
//! helpers encode record batches to Parquet bytes and decode them back as
//! bounded-size batches.

use std::{fmt, path::Path};

use arrow::{array::RecordBatch, datatypes::SchemaRef, error::ArrowError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parquet::{
    arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter},
    errors::ParquetError,
};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::storage::{self, StorageError, StoreLocation};

/// Identifier for a physical segment file.
///
/// A logical ID distinct from the file path, so metadata never has to parse
/// path strings to reason about identity.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SegmentId(pub String);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Metadata about one segment recorded in the changelog.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentMeta {
    /// Logical identifier for this segment.
    pub segment_id: SegmentId,

    /// File path relative to the table root (for example, `"data/00000003.parquet"`).
    pub path: String,

    /// Number of rows in this segment.
    pub row_count: u64,

    /// When the segment was written, RFC3339 UTC.
    pub created_at: DateTime<Utc>,
}

/// Errors from segment encode/decode or the storage underneath.
#[derive(Debug, Snafu)]
pub enum SegmentError {
    /// Storage failure while reading or writing a segment file.
    #[snafu(display("Storage error for segment {path}: {source}"))]
    Storage {
        /// Segment path involved.
        path: String,
        /// Underlying storage error.
        #[snafu(source, backtrace)]
        source: StorageError,
    },

    /// Parquet encode/decode failure.
    #[snafu(display("Parquet error for segment {path}: {source}"))]
    Parquet {
        /// Segment path involved.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Arrow failure while assembling batches.
    #[snafu(display("Arrow error for segment {path}: {source}"))]
    Arrow {
        /// Segment path involved.
        path: String,
        /// Underlying Arrow error.
        source: ArrowError,
    },
}

/// Encode `batches` into Parquet bytes with the given schema.
///
/// All batches must share `schema`; the caller has validated that already.
pub fn encode_parquet(schema: SchemaRef, batches: &[RecordBatch]) -> Result<Bytes, SegmentError> {
    let mut buf = Vec::new();
    {
        let mut writer =
            ArrowWriter::try_new(&mut buf, schema, None).context(ParquetSnafu { path: "<mem>" })?;
        for batch in batches {
            writer.write(batch).context(ParquetSnafu { path: "<mem>" })?;
        }
        writer.close().context(ParquetSnafu { path: "<mem>" })?;
    }
    Ok(Bytes::from(buf))
}

/// Write a new segment file at `rel_path` under the table root.
///
/// Uses create-new semantics: segment paths are derived from committed
/// versions, so an existing file means a concurrent writer got there first.
pub async fn write_segment(
    location: &StoreLocation,
    rel_path: &str,
    contents: &Bytes,
) -> Result<(), SegmentError> {
    storage::write_new(location, Path::new(rel_path), contents)
        .await
        .context(StorageSnafu { path: rel_path })
}

/// Read a segment back as record batches of at most `batch_size` rows.
pub async fn read_segment(
    location: &StoreLocation,
    rel_path: &str,
    batch_size: usize,
) -> Result<Vec<RecordBatch>, SegmentError> {
    let bytes = storage::read_all_bytes(location, Path::new(rel_path))
        .await
        .context(StorageSnafu { path: rel_path })?;

    decode_parquet(rel_path, Bytes::from(bytes), batch_size)
}

/// Decode Parquet bytes into record batches of at most `batch_size` rows.
pub fn decode_parquet(
    path: &str,
    bytes: Bytes,
    batch_size: usize,
) -> Result<Vec<RecordBatch>, SegmentError> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
        .context(ParquetSnafu { path })?
        .with_batch_size(batch_size)
        .build()
        .context(ParquetSnafu { path })?;

    let mut batches = Vec::new();
    for item in reader {
        batches.push(item.context(ArrowSnafu { path })?);
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::{
        array::{Int64Array, StringArray},
        datatypes::{DataType, Field, Schema},
    };
    use std::sync::Arc;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn sample_batch(ids: &[i64]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, true),
            Field::new("value", DataType::Utf8, true),
        ]));
        let values: Vec<String> = ids.iter().map(|i| format!("v{i}")).collect();
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids.to_vec())),
                Arc::new(StringArray::from(values)),
            ],
        )
        .expect("valid batch")
    }

    #[test]
    fn encode_decode_preserves_rows() -> TestResult {
        let batch = sample_batch(&[1, 2, 3, 4, 5]);
        let bytes = encode_parquet(batch.schema(), &[batch.clone()])?;

        let batches = decode_parquet("mem.parquet", bytes, 2)?;
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 5);
        // Chunk size bound holds for every decoded batch.
        assert!(batches.iter().all(|b| b.num_rows() <= 2));
        Ok(())
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let batch = sample_batch(&[7, 8]);
        let bytes = encode_parquet(batch.schema(), &[batch])?;

        write_segment(&location, "data/00000001.parquet", &bytes).await?;
        let batches = read_segment(&location, "data/00000001.parquet", 1024).await?;

        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 2);
        Ok(())
    }

    #[tokio::test]
    async fn write_segment_refuses_existing_path() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let batch = sample_batch(&[1]);
        let bytes = encode_parquet(batch.schema(), &[batch])?;

        write_segment(&location, "data/dup.parquet", &bytes).await?;
        let err = write_segment(&location, "data/dup.parquet", &bytes)
            .await
            .expect_err("expected AlreadyExists");
        assert!(matches!(
            err,
            SegmentError::Storage {
                source: StorageError::AlreadyExists { .. },
                ..
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn read_missing_segment_is_storage_error() {
        let tmp = TempDir::new().expect("tempdir");
        let location = StoreLocation::local(tmp.path());

        let err = read_segment(&location, "data/absent.parquet", 64)
            .await
            .expect_err("expected storage error");
        assert!(matches!(err, SegmentError::Storage { .. }));
    }
}
