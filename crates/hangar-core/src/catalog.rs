//! Catalog: namespace-scoped table discovery over the warehouse layout.
//!
//! The warehouse is a directory tree `<root>/<namespace>/<table>/`; a
//! directory counts as a table once it carries a committed changelog. The
//! catalog holds no cached state: every listing is a fresh scan, so tables
//! committed by other handles (or other processes) are visible to the next
//! caller without invalidation hooks.

use std::path::{Path, PathBuf};

use snafu::prelude::*;

use crate::{
    changelog::{ChangeLog, CommitError},
    storage::{self, StorageError, StoreLocation},
};

/// Errors from catalog scans.
#[derive(Debug, Snafu)]
pub enum CatalogError {
    /// Storage failure while scanning the warehouse tree.
    #[snafu(display("Catalog scan failed under {path}: {source}"))]
    Scan {
        /// The path being scanned.
        path: String,
        /// Underlying storage error.
        #[snafu(source, backtrace)]
        source: StorageError,
    },

    /// A table directory exists but its changelog is unreadable.
    #[snafu(display("Catalog entry {table} is unreadable: {source}"))]
    Entry {
        /// The table whose changelog failed to read.
        table: String,
        /// Underlying commit error.
        #[snafu(source, backtrace)]
        source: CommitError,
    },
}

/// Directory-backed catalog for one warehouse root and namespace.
#[derive(Debug, Clone)]
pub struct Catalog {
    warehouse: StoreLocation,
    namespace: String,
}

impl Catalog {
    /// Create a catalog over `warehouse` scoped to `namespace`.
    pub fn new(warehouse: StoreLocation, namespace: impl Into<String>) -> Self {
        Self {
            warehouse,
            namespace: namespace.into(),
        }
    }

    /// The namespace this catalog is scoped to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The warehouse root.
    pub fn warehouse(&self) -> &StoreLocation {
        &self.warehouse
    }

    /// Root directory of one table.
    pub fn table_root(&self, table: &str) -> StoreLocation {
        let rel: PathBuf = [self.namespace.as_str(), table].iter().collect();
        StoreLocation::local(self.warehouse.join(&rel))
    }

    /// List tables in the namespace that have committed state, sorted.
    ///
    /// Directories without a committed changelog (mid-creation, stray) are
    /// skipped rather than reported.
    pub async fn list_tables(&self) -> Result<Vec<String>, CatalogError> {
        let ns_rel = Path::new(self.namespace.as_str());
        let names = storage::list_dir_names(&self.warehouse, ns_rel)
            .await
            .context(ScanSnafu {
                path: self.warehouse.join(ns_rel).display().to_string(),
            })?;

        let mut tables = Vec::new();
        for name in names {
            let log = ChangeLog::new(self.table_root(&name));
            let committed = log.exists().await.context(EntrySnafu {
                table: name.clone(),
            })?;
            if committed {
                tables.push(name);
            }
        }

        Ok(tables)
    }

    /// Whether `table` exists with committed state.
    pub async fn table_exists(&self, table: &str) -> Result<bool, CatalogError> {
        let log = ChangeLog::new(self.table_root(table));
        log.exists().await.context(EntrySnafu {
            table: table.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        schema::{ColumnDef, ColumnType, TableSchema},
        table::Table,
    };
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn simple_schema() -> TableSchema {
        TableSchema::new(vec![ColumnDef {
            name: "id".to_string(),
            data_type: ColumnType::Int64,
            nullable: true,
        }])
        .expect("valid schema")
    }

    #[tokio::test]
    async fn empty_warehouse_lists_nothing() -> TestResult {
        let tmp = TempDir::new()?;
        let catalog = Catalog::new(StoreLocation::local(tmp.path()), "default");
        assert!(catalog.list_tables().await?.is_empty());
        assert!(!catalog.table_exists("t").await?);
        Ok(())
    }

    #[tokio::test]
    async fn created_tables_become_visible() -> TestResult {
        let tmp = TempDir::new()?;
        let catalog = Catalog::new(StoreLocation::local(tmp.path()), "default");

        Table::create(catalog.table_root("beta"), "beta", simple_schema(), false).await?;
        Table::create(catalog.table_root("alpha"), "alpha", simple_schema(), false).await?;

        assert_eq!(
            catalog.list_tables().await?,
            vec!["alpha".to_string(), "beta".to_string()]
        );
        assert!(catalog.table_exists("alpha").await?);
        Ok(())
    }

    #[tokio::test]
    async fn uncommitted_directories_are_skipped() -> TestResult {
        let tmp = TempDir::new()?;
        let catalog = Catalog::new(StoreLocation::local(tmp.path()), "default");

        tokio::fs::create_dir_all(tmp.path().join("default/stray")).await?;
        Table::create(catalog.table_root("real"), "real", simple_schema(), false).await?;

        assert_eq!(catalog.list_tables().await?, vec!["real".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn namespaces_are_isolated() -> TestResult {
        let tmp = TempDir::new()?;
        let a = Catalog::new(StoreLocation::local(tmp.path()), "a");
        let b = Catalog::new(StoreLocation::local(tmp.path()), "b");

        Table::create(a.table_root("t"), "t", simple_schema(), false).await?;

        assert_eq!(a.list_tables().await?, vec!["t".to_string()]);
        assert!(b.list_tables().await?.is_empty());
        Ok(())
    }
}
