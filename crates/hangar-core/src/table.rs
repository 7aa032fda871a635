//! Table layer: create/open/append/overwrite/scan for one named table.
//!
//! A table is a directory holding a `_changelog/` and `data/*.parquet`
//! segments. This module owns the write flow: validate the incoming batch
//! schema against the declared schema, normalize batches to the declared
//! schema so every segment decodes identically, write the segment with
//! create-new semantics, then commit it to the changelog under the version
//! guard. Reads replay the changelog first so externally committed writes
//! are always visible.

use arrow::{
    array::RecordBatch,
    datatypes::{Schema, SchemaRef},
    error::ArrowError,
};
use chrono::Utc;
use futures::{stream, Stream, StreamExt, TryStreamExt};
use snafu::prelude::*;

use crate::{
    changelog::{ChangeLog, CommitError, LogAction, TableState},
    schema::{SchemaError, TableSchema},
    segment::{self, SegmentError, SegmentId, SegmentMeta},
    storage::StoreLocation,
};

/// Options controlling a table scan.
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    /// Maximum rows per emitted batch.
    pub chunk_size: usize,
    /// Optional cap on the total rows emitted.
    pub limit: Option<usize>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            chunk_size: 8192,
            limit: None,
        }
    }
}

/// Errors from table operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TableError {
    /// The table has no committed state.
    #[snafu(display("Table not found: {table}"))]
    NotFound {
        /// The missing table name.
        table: String,
    },

    /// Incoming data does not match the declared schema.
    #[snafu(display("Schema mismatch for table {table}: expected {expected}, found {found}"))]
    SchemaMismatch {
        /// The table being written.
        table: String,
        /// Declared schema rendering.
        expected: String,
        /// Incoming schema rendering.
        found: String,
    },

    /// The incoming batch schema cannot be represented logically.
    #[snafu(display("Unsupported upload schema for table {table}: {source}"))]
    UnsupportedSchema {
        /// The table being written.
        table: String,
        /// Underlying schema conversion error.
        source: SchemaError,
    },

    /// Batches could not be normalized to the declared schema.
    #[snafu(display("Invalid batch for table {table}: {source}"))]
    InvalidBatch {
        /// The table being written.
        table: String,
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// Changelog failure.
    #[snafu(display("Changelog error for table {table}: {source}"))]
    Changelog {
        /// The table involved.
        table: String,
        /// Underlying commit error.
        #[snafu(source, backtrace)]
        source: CommitError,
    },

    /// Segment I/O failure.
    #[snafu(display("Segment error for table {table}: {source}"))]
    Segment {
        /// The table involved.
        table: String,
        /// Underlying segment error.
        #[snafu(source, backtrace)]
        source: SegmentError,
    },
}

/// Handle to one table: its location, changelog, and last-read state.
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    location: StoreLocation,
    log: ChangeLog,
    state: TableState,
}

fn schema_names_and_types_match(declared: &Schema, incoming: &Schema) -> bool {
    declared.fields().len() == incoming.fields().len()
        && declared
            .fields()
            .iter()
            .zip(incoming.fields().iter())
            .all(|(d, i)| d.name() == i.name() && d.data_type() == i.data_type())
}

impl Table {
    /// Open an existing table, replaying its changelog.
    ///
    /// Returns [`TableError::NotFound`] if the table has no commits.
    pub async fn open(location: StoreLocation, name: impl Into<String>) -> Result<Self, TableError> {
        let name = name.into();
        let log = ChangeLog::new(location.clone());
        let state = log
            .rebuild_state()
            .await
            .context(ChangelogSnafu { table: name.clone() })?;

        if state.version == 0 {
            return NotFoundSnafu { table: name }.fail();
        }

        Ok(Self {
            name,
            location,
            log,
            state,
        })
    }

    /// Create a table with the given declared schema.
    ///
    /// - Existing table, `overwrite == false`, same schema: idempotent open.
    /// - Existing table, `overwrite == false`, different schema: schema
    ///   mismatch (the store surfaces this as a schema conflict).
    /// - Existing table, `overwrite == true`: truncate and replace schema.
    /// - Absent table: first commit sets the schema.
    pub async fn create(
        location: StoreLocation,
        name: impl Into<String>,
        schema: TableSchema,
        overwrite: bool,
    ) -> Result<Self, TableError> {
        let name = name.into();
        let log = ChangeLog::new(location.clone());
        let state = log
            .rebuild_state()
            .await
            .context(ChangelogSnafu { table: name.clone() })?;

        if state.version > 0 && !overwrite {
            match &state.schema {
                Some(existing) if *existing == schema => {
                    return Ok(Self {
                        name,
                        location,
                        log,
                        state,
                    });
                }
                existing => {
                    let expected = existing
                        .as_ref()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "(none)".to_string());
                    return SchemaMismatchSnafu {
                        table: name,
                        expected,
                        found: schema.to_string(),
                    }
                    .fail();
                }
            }
        }

        let mut actions = Vec::new();
        if state.version > 0 {
            actions.push(LogAction::Truncate);
        }
        actions.push(LogAction::SetSchema(schema.clone()));

        let version = log
            .commit_with_expected_version(state.version, actions)
            .await
            .context(ChangelogSnafu { table: name.clone() })?;

        Ok(Self {
            name,
            location,
            log,
            state: TableState {
                version,
                schema: Some(schema),
                segments: if state.version > 0 {
                    Vec::new()
                } else {
                    state.segments
                },
            },
        })
    }

    /// Re-replay the changelog so externally committed writes become visible.
    pub async fn refresh(&mut self) -> Result<(), TableError> {
        self.state = self
            .log
            .rebuild_state()
            .await
            .context(ChangelogSnafu {
                table: self.name.clone(),
            })?;
        Ok(())
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last-read table state.
    pub fn state(&self) -> &TableState {
        &self.state
    }

    /// Declared schema, if any.
    pub fn schema(&self) -> Option<&TableSchema> {
        self.state.schema.as_ref()
    }

    /// Declared schema as Arrow, if any.
    pub fn arrow_schema(&self) -> Option<SchemaRef> {
        self.state.schema.as_ref().map(|s| s.to_arrow_ref())
    }

    fn segment_rel_path(version: u64) -> String {
        format!("data/{version:010}.parquet")
    }

    /// Validate `batches` against the declared schema and rebuild them with
    /// the declared schema reference so every segment decodes identically.
    fn normalize_batches(
        &self,
        declared: &TableSchema,
        batches: &[RecordBatch],
    ) -> Result<Vec<RecordBatch>, TableError> {
        let declared_arrow = declared.to_arrow_ref();

        let mut normalized = Vec::with_capacity(batches.len());
        for batch in batches {
            if !schema_names_and_types_match(&declared_arrow, batch.schema().as_ref()) {
                let found = TableSchema::from_arrow(batch.schema().as_ref())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| format!("{:?}", batch.schema()));
                return SchemaMismatchSnafu {
                    table: self.name.clone(),
                    expected: declared.to_string(),
                    found,
                }
                .fail();
            }

            let rebuilt = RecordBatch::try_new(declared_arrow.clone(), batch.columns().to_vec())
                .context(InvalidBatchSnafu {
                    table: self.name.clone(),
                })?;
            normalized.push(rebuilt);
        }

        Ok(normalized)
    }

    async fn write_and_commit(
        &mut self,
        actions_before: Vec<LogAction>,
        batches: Vec<RecordBatch>,
        declared_arrow: SchemaRef,
    ) -> Result<u64, TableError> {
        let rows: u64 = batches.iter().map(|b| b.num_rows() as u64).sum();
        let next_version = self.state.version + 1;
        let rel_path = Self::segment_rel_path(next_version);

        let bytes = segment::encode_parquet(declared_arrow, &batches).context(SegmentSnafu {
            table: self.name.clone(),
        })?;
        segment::write_segment(&self.location, &rel_path, &bytes)
            .await
            .context(SegmentSnafu {
                table: self.name.clone(),
            })?;

        let meta = SegmentMeta {
            segment_id: SegmentId(format!("{next_version:010}")),
            path: rel_path,
            row_count: rows,
            created_at: Utc::now(),
        };

        let mut actions = actions_before;
        actions.push(LogAction::AddSegment(meta));

        self.log
            .commit_with_expected_version(self.state.version, actions)
            .await
            .context(ChangelogSnafu {
                table: self.name.clone(),
            })?;

        self.refresh().await?;
        Ok(rows)
    }

    /// Append `batches` as one new segment. Returns rows written.
    ///
    /// The batch schema must match the declared schema by name and type. A
    /// table created without a schema adopts the schema of its first append.
    pub async fn append(&mut self, batches: &[RecordBatch]) -> Result<u64, TableError> {
        let rows: u64 = batches.iter().map(|b| b.num_rows() as u64).sum();
        if rows == 0 {
            return Ok(0);
        }

        let (declared, actions) = match self.state.schema.clone() {
            Some(declared) => (declared, Vec::new()),
            None => {
                // Adopt the schema of the first data to arrive.
                let adopted = TableSchema::from_arrow(batches[0].schema().as_ref()).context(
                    UnsupportedSchemaSnafu {
                        table: self.name.clone(),
                    },
                )?;
                (adopted.clone(), vec![LogAction::SetSchema(adopted)])
            }
        };

        let normalized = self.normalize_batches(&declared, batches)?;
        let declared_arrow = declared.to_arrow_ref();

        self.write_and_commit(actions, normalized, declared_arrow)
            .await
    }

    /// Replace the table contents with `batches`, adopting their schema.
    pub async fn overwrite(&mut self, batches: &[RecordBatch]) -> Result<u64, TableError> {
        let rows: u64 = batches.iter().map(|b| b.num_rows() as u64).sum();
        if rows == 0 {
            return Ok(0);
        }

        let adopted = TableSchema::from_arrow(batches[0].schema().as_ref()).context(
            UnsupportedSchemaSnafu {
                table: self.name.clone(),
            },
        )?;
        let normalized = self.normalize_batches(&adopted, batches)?;
        let declared_arrow = adopted.to_arrow_ref();

        self.write_and_commit(
            vec![LogAction::Truncate, LogAction::SetSchema(adopted)],
            normalized,
            declared_arrow,
        )
        .await
    }

    /// Stream the table contents as batches of at most `opts.chunk_size`
    /// rows, in segment append order, honoring `opts.limit`.
    ///
    /// The stream borrows nothing from the handle; dropping it mid-way
    /// releases the segment readers with no further I/O.
    pub fn stream_batches(
        &self,
        opts: ScanOptions,
    ) -> impl Stream<Item = Result<RecordBatch, TableError>> + Send + 'static {
        let location = self.location.clone();
        let segments = self.state.segments.clone();
        let table = self.name.clone();
        let chunk_size = opts.chunk_size.max(1);

        stream::iter(segments)
            .then(move |seg| {
                let location = location.clone();
                let table = table.clone();
                async move {
                    segment::read_segment(&location, &seg.path, chunk_size)
                        .await
                        .context(SegmentSnafu { table })
                }
            })
            .map_ok(|batches| stream::iter(batches.into_iter().map(Ok)))
            .try_flatten()
            .scan(opts.limit, |remaining, item| {
                let out = match (item, *remaining) {
                    (Err(e), _) => Some(Some(Err(e))),
                    (Ok(_), Some(0)) => None,
                    (Ok(batch), Some(rem)) => {
                        if batch.num_rows() > rem {
                            *remaining = Some(0);
                            Some(Some(Ok(batch.slice(0, rem))))
                        } else {
                            *remaining = Some(rem - batch.num_rows());
                            Some(Some(Ok(batch)))
                        }
                    }
                    (Ok(batch), None) => Some(Some(Ok(batch))),
                };
                futures::future::ready(out)
            })
            .filter_map(futures::future::ready)
    }

    /// Collect the full table contents (refreshing first), mostly for the
    /// mirror refresh and tests.
    pub async fn load_all(&mut self, chunk_size: usize) -> Result<Vec<RecordBatch>, TableError> {
        self.refresh().await?;
        self.stream_batches(ScanOptions {
            chunk_size,
            limit: None,
        })
        .try_collect()
        .await
    }
}
