//! Zero-row schema probes via DataFusion.
//!
//! A probe plans a SQL query against schema-only registrations of every
//! table in the catalog and returns the resulting Arrow schema without
//! executing anything, the `LIMIT 0` equivalent. Each probe builds a
//! fresh `SessionContext`, so the catalog is re-reflected on every call
//! and externally committed tables are always visible.

use std::sync::Arc;

use arrow::datatypes::Schema;
use datafusion::{
    datasource::MemTable,
    error::DataFusionError,
    prelude::{SessionConfig, SessionContext},
};
use snafu::prelude::*;

use crate::{
    catalog::{Catalog, CatalogError},
    table::{Table, TableError},
};

/// Errors from schema probes.
#[derive(Debug, Snafu)]
pub enum ProbeError {
    /// The query failed to plan.
    #[snafu(display("Invalid probe query {query:?}: {message}"))]
    InvalidQuery {
        /// The offending query.
        query: String,
        /// Planner message.
        message: String,
    },

    /// The query references a table the catalog does not have.
    #[snafu(display("Probe query {query:?} references missing table: {message}"))]
    TableNotFound {
        /// The offending query.
        query: String,
        /// Planner message naming the table.
        message: String,
    },

    /// Catalog scan failure while reflecting tables.
    #[snafu(display("Probe failed to reflect catalog: {source}"))]
    Reflect {
        /// Underlying catalog error.
        #[snafu(source, backtrace)]
        source: CatalogError,
    },

    /// A reflected table failed to open.
    #[snafu(display("Probe failed to open table {table}: {source}"))]
    Open {
        /// The table that failed to open.
        table: String,
        /// Underlying table error.
        #[snafu(source, backtrace)]
        source: TableError,
    },

    /// Engine failure outside planning (registration, schema assembly).
    #[snafu(display("Probe engine error: {source}"))]
    Engine {
        /// Underlying DataFusion error.
        source: DataFusionError,
    },
}

fn is_missing_table_error(message: &str) -> bool {
    // Planner spellings vary across versions; match the stable parts.
    let lowered = message.to_ascii_lowercase();
    (lowered.contains("table") && lowered.contains("not found"))
        || lowered.contains("no table named")
}

/// Plan `query` against schema-only views of the catalog's tables and
/// return the output schema.
pub async fn probe_schema(catalog: &Catalog, query: &str) -> Result<Schema, ProbeError> {
    let ctx = SessionContext::new_with_config(SessionConfig::new());

    let tables = catalog.list_tables().await.context(ReflectSnafu)?;
    for name in tables {
        let table = Table::open(catalog.table_root(&name), &name)
            .await
            .context(OpenSnafu { table: name.clone() })?;

        let Some(schema_ref) = table.arrow_schema() else {
            continue;
        };

        // Schema-only registration: planning needs the layout, not the rows.
        let provider =
            MemTable::try_new(schema_ref, vec![vec![]]).context(EngineSnafu)?;
        ctx.register_table(name.as_str(), Arc::new(provider))
            .context(EngineSnafu)?;
    }

    let df = match ctx.sql(query).await {
        Ok(df) => df,
        Err(e) => {
            let message = e.to_string();
            if is_missing_table_error(&message) {
                return TableNotFoundSnafu {
                    query: query.to_string(),
                    message,
                }
                .fail();
            }
            return InvalidQuerySnafu {
                query: query.to_string(),
                message,
            }
            .fail();
        }
    };

    Ok(df.schema().as_arrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        schema::{ColumnDef, ColumnType, TableSchema},
        storage::StoreLocation,
    };
    use arrow::datatypes::DataType;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn id_value_schema() -> TableSchema {
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

    async fn catalog_with_table(tmp: &TempDir) -> Catalog {
        let catalog = Catalog::new(StoreLocation::local(tmp.path()), "default");
        Table::create(catalog.table_root("t"), "t", id_value_schema(), false)
            .await
            .expect("create table");
        catalog
    }

    #[tokio::test]
    async fn select_star_returns_declared_schema() -> TestResult {
        let tmp = TempDir::new()?;
        let catalog = catalog_with_table(&tmp).await;

        let schema = probe_schema(&catalog, "SELECT * FROM t").await?;
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["id", "value"]);
        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert_eq!(schema.field(1).data_type(), &DataType::Utf8);
        Ok(())
    }

    #[tokio::test]
    async fn projection_narrows_schema() -> TestResult {
        let tmp = TempDir::new()?;
        let catalog = catalog_with_table(&tmp).await;

        let schema = probe_schema(&catalog, "SELECT value FROM t").await?;
        assert_eq!(schema.fields().len(), 1);
        assert_eq!(schema.field(0).name(), "value");
        Ok(())
    }

    #[tokio::test]
    async fn malformed_query_is_invalid() -> TestResult {
        let tmp = TempDir::new()?;
        let catalog = catalog_with_table(&tmp).await;

        let err = probe_schema(&catalog, "SELEKT * FORM t")
            .await
            .expect_err("expected invalid query");
        assert!(matches!(err, ProbeError::InvalidQuery { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn missing_table_is_distinguished() -> TestResult {
        let tmp = TempDir::new()?;
        let catalog = catalog_with_table(&tmp).await;

        let err = probe_schema(&catalog, "SELECT * FROM nope")
            .await
            .expect_err("expected missing table");
        assert!(matches!(err, ProbeError::TableNotFound { .. }));
        Ok(())
    }
}
