//! Table Store facade: catalog + tables + mirror + snapshot pipeline.
//!
//! `TableStore` is the single entry point the service layer talks to. It
//! composes the pieces rather than inheriting from any of them: writes go
//! through the table layer, each successful insert refreshes the mirror
//! entry and synchronously runs the snapshot pipeline, and reads re-replay
//! the changelog so external commits are visible.
//!
//! Locking:
//! - one async mutex per table serializes insert + snapshot for that table
//!   while leaving other tables fully parallel on the write path;
//! - a store-wide mutex over the mirror serializes the
//!   shadow/checkpoint/copy step, because the mirror file is a
//!   single-writer resource.
//!
//! The mirror refresh for insert N happens under both locks before the
//! snapshot for insert N is taken, so a snapshot always reflects the rows
//! of the insert that triggered it.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
};

use arrow::{array::RecordBatch, datatypes::Schema};
use futures::{Stream, StreamExt};
use snafu::prelude::*;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info};

use crate::{
    catalog::{Catalog, CatalogError},
    mirror::{MirrorDb, MirrorError},
    probe::{self, ProbeError},
    schema::TableSchema,
    snapshot::{SnapshotManager, SnapshotRef},
    storage::StoreLocation,
    table::{ScanOptions, Table, TableError},
};

/// Default maximum rows per streamed batch.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Connection-time configuration for a table store.
///
/// Supplied once at construction; there is no reconfiguration of a live
/// store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Warehouse root directory holding `<namespace>/<table>/` trees.
    pub warehouse_root: PathBuf,
    /// Namespace the store is scoped to.
    pub namespace: String,
    /// Override for the mirror database file (the secondary state).
    pub mirror_path: Option<PathBuf>,
    /// Override for the snapshot directory.
    pub snapshot_dir: Option<PathBuf>,
    /// Maximum rows per batch on streamed reads.
    pub chunk_size: usize,
}

impl StoreConfig {
    /// Configuration rooted at `warehouse_root` with defaults for the rest.
    pub fn new(warehouse_root: impl Into<PathBuf>) -> Self {
        Self {
            warehouse_root: warehouse_root.into(),
            namespace: "default".to_string(),
            mirror_path: None,
            snapshot_dir: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Override the mirror database file path.
    pub fn mirror_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mirror_path = Some(path.into());
        self
    }

    /// Override the snapshot directory.
    pub fn snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_dir = Some(dir.into());
        self
    }

    fn resolved_mirror_path(&self) -> PathBuf {
        self.mirror_path
            .clone()
            .unwrap_or_else(|| self.warehouse_root.join("default.db"))
    }

    fn resolved_snapshot_dir(&self) -> PathBuf {
        self.snapshot_dir
            .clone()
            .unwrap_or_else(|| self.warehouse_root.join("snapshots"))
    }
}

/// How an insert treats existing table contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Add rows to the existing table; fails if the table is absent.
    Append,
    /// Replace the table (created implicitly if absent).
    Overwrite,
}

impl InsertMode {
    /// Parse the wire spelling used by upload commands.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "append" => Some(InsertMode::Append),
            "overwrite" => Some(InsertMode::Overwrite),
            _ => None,
        }
    }

    /// Wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            InsertMode::Append => "append",
            InsertMode::Overwrite => "overwrite",
        }
    }
}

/// Outcome of the snapshot step attached to an insert.
///
/// A failed snapshot does not undo the insert; it is reported here so the
/// caller can retry the snapshot independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// Snapshot pipeline completed.
    Completed(SnapshotRef),
    /// Snapshot pipeline failed after the insert committed.
    Failed {
        /// Human-readable cause, already logged.
        message: String,
    },
    /// No snapshot was attempted (zero-row insert).
    Skipped,
}

impl SnapshotStatus {
    /// Whether the pipeline completed.
    pub fn is_completed(&self) -> bool {
        matches!(self, SnapshotStatus::Completed(_))
    }
}

/// Result of one insert, snapshot outcome included.
#[derive(Debug, Clone)]
pub struct InsertReport {
    /// Table written to.
    pub table: String,
    /// Rows committed by this insert.
    pub rows_written: u64,
    /// Outcome of the triggered snapshot.
    pub snapshot: SnapshotStatus,
}

/// Errors from store operations.
#[derive(Debug, Snafu)]
pub enum StoreError {
    /// Referenced table does not exist.
    #[snafu(display("Table not found: {table}"))]
    NotFound {
        /// The missing table.
        table: String,
    },

    /// An existing table has a different schema.
    #[snafu(display("Schema conflict for table {table}: expected {expected}, found {found}"))]
    SchemaConflict {
        /// The conflicting table.
        table: String,
        /// Declared schema rendering.
        expected: String,
        /// Offered schema rendering.
        found: String,
    },

    /// A schema probe query failed to plan.
    #[snafu(display("Invalid query {query:?}: {message}"))]
    InvalidQuery {
        /// The offending query.
        query: String,
        /// Planner message.
        message: String,
    },

    /// Table-layer failure (storage, changelog, segments).
    #[snafu(display("Table operation failed for {table}: {source}"))]
    Table {
        /// The table involved.
        table: String,
        /// Underlying table error.
        #[snafu(source, backtrace)]
        source: TableError,
    },

    /// Catalog scan failure.
    #[snafu(display("Catalog error: {source}"))]
    Catalog {
        /// Underlying catalog error.
        #[snafu(source, backtrace)]
        source: CatalogError,
    },

    /// Mirror failure outside the snapshot pipeline (open/reflect).
    #[snafu(display("Mirror error: {source}"))]
    Mirror {
        /// Underlying mirror error.
        #[snafu(source, backtrace)]
        source: MirrorError,
    },

    /// Probe engine failure outside planning.
    #[snafu(display("Probe error: {source}"))]
    Probe {
        /// Underlying probe error.
        #[snafu(source, backtrace)]
        source: ProbeError,
    },
}

fn map_table_error(table: &str, err: TableError) -> StoreError {
    match err {
        TableError::NotFound { table } => StoreError::NotFound { table },
        TableError::SchemaMismatch {
            table,
            expected,
            found,
        } => StoreError::SchemaConflict {
            table,
            expected,
            found,
        },
        other => StoreError::Table {
            table: table.to_string(),
            source: other,
        },
    }
}

/// Durable, queryable store for named tables with snapshot-on-insert.
pub struct TableStore {
    config: StoreConfig,
    catalog: Catalog,
    snapshots: SnapshotManager,
    mirror: AsyncMutex<MirrorDb>,
    table_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TableStore {
    /// Open a store with the given configuration.
    ///
    /// Creates the warehouse root if needed, loads the mirror file if one
    /// exists, and reflects every cataloged table into the mirror so the
    /// first snapshot already covers pre-existing state.
    pub async fn open(config: StoreConfig) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&config.warehouse_root)
            .await
            .ok();

        let warehouse = StoreLocation::local(&config.warehouse_root);
        let catalog = Catalog::new(warehouse, config.namespace.clone());
        let snapshots = SnapshotManager::new(config.resolved_snapshot_dir(), &config.namespace);

        let mut mirror = MirrorDb::open(config.resolved_mirror_path())
            .await
            .context(MirrorSnafu)?;

        // Reflect current warehouse contents into the mirror.
        for name in catalog.list_tables().await.context(CatalogSnafu)? {
            Self::reflect_table(&catalog, config.chunk_size, &mut mirror, &name).await?;
        }

        Ok(Self {
            config,
            catalog,
            snapshots,
            mirror: AsyncMutex::new(mirror),
            table_locks: StdMutex::new(HashMap::new()),
        })
    }

    /// The store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The snapshot directory in use.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.config.resolved_snapshot_dir()
    }

    fn table_lock(&self, table: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.table_locks.lock().expect("table lock map poisoned");
        locks
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn reflect_table(
        catalog: &Catalog,
        chunk_size: usize,
        mirror: &mut MirrorDb,
        table: &str,
    ) -> Result<(), StoreError> {
        let mut handle = Table::open(catalog.table_root(table), table)
            .await
            .map_err(|e| map_table_error(table, e))?;

        let Some(schema_ref) = handle.arrow_schema() else {
            return Ok(());
        };

        let batches = handle
            .load_all(chunk_size)
            .await
            .map_err(|e| map_table_error(table, e))?;

        mirror.set_table(table, schema_ref, batches);
        Ok(())
    }

    async fn reflect_into(&self, mirror: &mut MirrorDb, table: &str) -> Result<(), StoreError> {
        Self::reflect_table(&self.catalog, self.config.chunk_size, mirror, table).await
    }

    /// List tables with committed state, freshly scanned.
    pub async fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        self.catalog.list_tables().await.context(CatalogSnafu)
    }

    /// Create a table with a declared schema, optionally seeding it with
    /// `initial_data`.
    ///
    /// `overwrite == false` against an existing table with a different
    /// schema is a [`StoreError::SchemaConflict`]; with a matching schema
    /// it is an idempotent open. Creation does not trigger a snapshot;
    /// only inserts do.
    pub async fn create_table(
        &self,
        name: &str,
        schema: TableSchema,
        initial_data: Vec<RecordBatch>,
        overwrite: bool,
    ) -> Result<(), StoreError> {
        let lock = self.table_lock(name);
        let _guard = lock.lock().await;

        let mut table = Table::create(self.catalog.table_root(name), name, schema, overwrite)
            .await
            .map_err(|e| map_table_error(name, e))?;

        if !initial_data.is_empty() {
            table
                .append(&initial_data)
                .await
                .map_err(|e| map_table_error(name, e))?;
        }

        info!(table = name, overwrite, "table created");
        Ok(())
    }

    /// Insert `batches` into `name` and synchronously run the snapshot
    /// pipeline.
    ///
    /// Zero total rows is the documented no-op: logs, writes nothing,
    /// snapshots nothing, returns `rows_written == 0`. A snapshot failure
    /// is reported in the returned [`InsertReport`], never as an `Err`:
    /// the insert itself has already committed.
    pub async fn insert(
        &self,
        name: &str,
        batches: &[RecordBatch],
        mode: InsertMode,
    ) -> Result<InsertReport, StoreError> {
        let rows: u64 = batches.iter().map(|b| b.num_rows() as u64).sum();
        if rows == 0 {
            info!(table = name, "no data to store");
            return Ok(InsertReport {
                table: name.to_string(),
                rows_written: 0,
                snapshot: SnapshotStatus::Skipped,
            });
        }

        info!(table = name, mode = mode.as_str(), rows, "inserting data");

        let lock = self.table_lock(name);
        let _guard = lock.lock().await;

        let root = self.catalog.table_root(name);
        let rows_written = match mode {
            InsertMode::Append => {
                let mut table = Table::open(root, name)
                    .await
                    .map_err(|e| map_table_error(name, e))?;
                table
                    .append(batches)
                    .await
                    .map_err(|e| map_table_error(name, e))?
            }
            InsertMode::Overwrite => {
                let exists = self
                    .catalog
                    .table_exists(name)
                    .await
                    .context(CatalogSnafu)?;
                if exists {
                    let mut table = Table::open(root, name)
                        .await
                        .map_err(|e| map_table_error(name, e))?;
                    table
                        .overwrite(batches)
                        .await
                        .map_err(|e| map_table_error(name, e))?
                } else {
                    let adopted = TableSchema::from_arrow(batches[0].schema().as_ref())
                        .map_err(|source| {
                            map_table_error(
                                name,
                                TableError::UnsupportedSchema {
                                    table: name.to_string(),
                                    source,
                                },
                            )
                        })?;
                    let mut table = Table::create(root, name, adopted, false)
                        .await
                        .map_err(|e| map_table_error(name, e))?;
                    table
                        .append(batches)
                        .await
                        .map_err(|e| map_table_error(name, e))?
                }
            }
        };

        info!(table = name, rows_written, "data inserted successfully");

        // Snapshot pipeline: refresh the mirror entry for this table under
        // the mirror lock, then snapshot. The lock order (table, then
        // mirror) is the same on every path.
        let snapshot = {
            let mut mirror = self.mirror.lock().await;
            match self.reflect_into(&mut mirror, name).await {
                Ok(()) => match self.snapshots.snapshot(&mut mirror).await {
                    Ok(snap) => SnapshotStatus::Completed(snap),
                    Err(e) => {
                        error!(table = name, error = %e, "snapshot failed after insert");
                        SnapshotStatus::Failed {
                            message: e.to_string(),
                        }
                    }
                },
                Err(e) => {
                    error!(table = name, error = %e, "mirror refresh failed after insert");
                    SnapshotStatus::Failed {
                        message: e.to_string(),
                    }
                }
            }
        };

        Ok(InsertReport {
            table: name.to_string(),
            rows_written,
            snapshot,
        })
    }

    /// Plan `query` without executing it and return the output schema.
    pub async fn read_schema(&self, query: &str) -> Result<Schema, StoreError> {
        match probe::probe_schema(&self.catalog, query).await {
            Ok(schema) => Ok(schema),
            Err(ProbeError::InvalidQuery { query, message }) => {
                Err(StoreError::InvalidQuery { query, message })
            }
            Err(ProbeError::TableNotFound { message, .. }) => Err(StoreError::NotFound {
                table: extract_quoted_name(&message),
            }),
            Err(source) => Err(StoreError::Probe { source }),
        }
    }

    /// Declared schema of `name`, or `NotFound`.
    pub async fn table_schema(&self, name: &str) -> Result<Schema, StoreError> {
        let table = Table::open(self.catalog.table_root(name), name)
            .await
            .map_err(|e| map_table_error(name, e))?;
        table
            .schema()
            .map(|s| s.to_arrow())
            .ok_or_else(|| StoreError::NotFound {
                table: name.to_string(),
            })
    }

    /// Stream the contents of `name` as batches of at most
    /// `opts.chunk_size` rows.
    ///
    /// The table state is re-read from the changelog first, so rows
    /// committed by other writers are included. Dropping the stream stops
    /// all further segment reads.
    pub async fn stream_batches(
        &self,
        name: &str,
        opts: ScanOptions,
    ) -> Result<impl Stream<Item = Result<RecordBatch, StoreError>> + Send + 'static, StoreError>
    {
        let table = Table::open(self.catalog.table_root(name), name)
            .await
            .map_err(|e| map_table_error(name, e))?;

        let owner = name.to_string();
        Ok(table
            .stream_batches(opts)
            .map(move |item| item.map_err(|e| map_table_error(&owner, e))))
    }

    /// Default scan options from the store configuration.
    pub fn scan_options(&self, limit: Option<usize>) -> ScanOptions {
        ScanOptions {
            chunk_size: self.config.chunk_size,
            limit,
        }
    }
}

fn extract_quoted_name(message: &str) -> String {
    // Planner messages look like: table 'ns.public.name' not found
    let mut parts = message.split('\'');
    let quoted = parts.nth(1).unwrap_or(message);
    quoted
        .rsplit('.')
        .next()
        .unwrap_or(quoted)
        .to_string()
}
