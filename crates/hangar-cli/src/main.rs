//! CLI entry point for the hangar ingestion gateway.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
};

use clap::{Parser, Subcommand};
use snafu::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hangar_core::{
    schema::{ColumnDef, ColumnType, TableSchema},
    store::{StoreConfig, StoreError},
};
use hangar_server::{IngestServer, ServerError};

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("Failed to read schema file {path}: {source}"))]
    SchemaFile {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Schema file {path} is not a valid table schema: {source}"))]
    SchemaParse {
        path: String,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to bootstrap table {table}: {source}"))]
    Bootstrap { table: String, source: StoreError },

    #[snafu(display("{source}"))]
    Server { source: ServerError },
}

type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the Flight ingestion endpoint over a warehouse
    Serve {
        /// Warehouse root directory
        #[arg(short = 'w', long = "warehouse-path", default_value = "warehouse")]
        warehouse_path: PathBuf,

        /// Listen host
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,

        /// Listen port
        #[arg(short = 'p', long, default_value_t = 8816)]
        port: u16,

        /// Namespace the store is scoped to
        #[arg(long, default_value = "default")]
        namespace: String,

        /// Table to create (overwrite semantics) before serving
        #[arg(short = 't', long = "table-name")]
        table_name: Option<String>,

        /// JSON schema file for the bootstrap table
        #[arg(long)]
        schema: Option<PathBuf>,

        /// Override the mirror database file (secondary state)
        #[arg(long = "mirror-file")]
        mirror_file: Option<PathBuf>,

        /// Override the snapshot directory
        #[arg(long = "snapshot-dir")]
        snapshot_dir: Option<PathBuf>,
    },
}

#[derive(Debug, Parser)]
#[command(name = "hangar", about = "Table-ingestion gateway over Arrow Flight")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

async fn load_schema(path: &Path) -> CliResult<TableSchema> {
    let json = tokio::fs::read_to_string(path)
        .await
        .context(SchemaFileSnafu {
            path: path.display().to_string(),
        })?;
    serde_json::from_str(&json).context(SchemaParseSnafu {
        path: path.display().to_string(),
    })
}

/// Degraded fallback used only when no schema file is supplied: the
/// two-column layout the upstream loaders ship. Loud on purpose.
fn fallback_schema() -> TableSchema {
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
    .expect("fallback schema is valid")
}

#[allow(clippy::too_many_arguments)]
async fn cmd_serve(
    warehouse_path: PathBuf,
    host: IpAddr,
    port: u16,
    namespace: String,
    table_name: Option<String>,
    schema: Option<PathBuf>,
    mirror_file: Option<PathBuf>,
    snapshot_dir: Option<PathBuf>,
) -> CliResult<()> {
    let mut config = StoreConfig::new(warehouse_path).namespace(namespace);
    if let Some(path) = mirror_file {
        config = config.mirror_path(path);
    }
    if let Some(dir) = snapshot_dir {
        config = config.snapshot_dir(dir);
    }

    let server = IngestServer::connect(config).await.context(ServerSnafu)?;

    if let Some(table) = &table_name {
        let table_schema = match &schema {
            Some(path) => load_schema(path).await?,
            None => {
                warn!(
                    table = %table,
                    "no --schema file supplied; using built-in id/value fallback schema"
                );
                fallback_schema()
            }
        };

        server
            .store()
            .create_table(table, table_schema, Vec::new(), true)
            .await
            .context(BootstrapSnafu {
                table: table.clone(),
            })?;
        info!(table = %table, "bootstrap table ready");
    }

    let handle = server
        .serve(SocketAddr::new(host, port))
        .await
        .context(ServerSnafu)?;
    info!(addr = %handle.addr(), "flight server started");

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");

    handle.shutdown().await.context(ServerSnafu)?;
    Ok(())
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Serve {
            warehouse_path,
            host,
            port,
            namespace,
            table_name,
            schema,
            mirror_file,
            snapshot_dir,
        } => {
            cmd_serve(
                warehouse_path,
                host,
                port,
                namespace,
                table_name,
                schema,
                mirror_file,
                snapshot_dir,
            )
            .await
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
