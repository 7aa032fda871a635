//! Mirror database: the file-backed secondary store behind snapshots.
//!
//! The mirror holds a full in-memory copy of every table the store has
//! reflected, plus the `<table>_snapshot` shadow copies taken during the
//! snapshot pipeline. `checkpoint` flushes the whole mirror to a single
//! database file with an atomic replacement write; the snapshot manager
//! then copies that file wholesale into the snapshot directory.
//!
//! On-disk container (private to this module):
//!
//! ```text
//! [8-byte magic "HANGARDB"]
//! [u32 LE format version]
//! [u64 LE index length]
//! [index JSON: [{ name, offset, len }, ...]]
//! [per-table Arrow IPC file payloads, back to back]
//! ```
//!
//! Offsets are relative to the start of the data section. Everything else
//! in the crate treats the mirror file as an opaque artifact.

use std::{
    collections::BTreeMap,
    io::Cursor,
    path::{Path, PathBuf},
};

use arrow::{
    array::RecordBatch,
    datatypes::SchemaRef,
    error::ArrowError,
    ipc::{reader::FileReader, writer::FileWriter},
};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

use crate::storage::{self, StorageError, StoreLocation};

/// Magic bytes at the start of a mirror database file.
const MIRROR_MAGIC: &[u8; 8] = b"HANGARDB";
/// Current container format version.
const MIRROR_FORMAT_VERSION: u32 = 1;
/// Suffix marking shadow-copy entries.
pub const SHADOW_SUFFIX: &str = "_snapshot";

/// Errors from mirror load/checkpoint.
#[derive(Debug, Snafu)]
pub enum MirrorError {
    /// Storage failure reading or writing the mirror file.
    #[snafu(display("Mirror storage error at {path}: {source}"))]
    Storage {
        /// The mirror file path.
        path: String,
        /// Underlying storage error.
        #[snafu(source, backtrace)]
        source: StorageError,
    },

    /// Arrow IPC encode/decode failure.
    #[snafu(display("Mirror IPC error for table {table}: {source}"))]
    Ipc {
        /// The table entry involved.
        table: String,
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// The file does not parse as a mirror database.
    #[snafu(display("Corrupt mirror file at {path}: {msg}"))]
    Corrupt {
        /// The mirror file path.
        path: String,
        /// Description of the corruption.
        msg: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    name: String,
    offset: u64,
    len: u64,
}

/// One table entry held in the mirror.
#[derive(Debug, Clone)]
pub struct MirrorTable {
    /// Schema of the mirrored table.
    pub schema: SchemaRef,
    /// Full contents, in insertion order.
    pub batches: Vec<RecordBatch>,
}

impl MirrorTable {
    /// Total rows across batches.
    pub fn row_count(&self) -> u64 {
        self.batches.iter().map(|b| b.num_rows() as u64).sum()
    }
}

/// In-memory mirror of the store plus its file-backed persistence.
#[derive(Debug)]
pub struct MirrorDb {
    path: PathBuf,
    tables: BTreeMap<String, MirrorTable>,
}

impl MirrorDb {
    /// Open a mirror at `path`, loading existing contents if the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, MirrorError> {
        let path = path.into();

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self {
                    path,
                    tables: BTreeMap::new(),
                });
            }
            Err(e) => {
                let source = StorageError::Io {
                    path: path.display().to_string(),
                    source: e,
                    backtrace: Backtrace::capture(),
                };
                return Err(MirrorError::Storage {
                    path: path.display().to_string(),
                    source,
                });
            }
        };

        let tables = Self::decode(&path, &bytes)?;
        Ok(Self { path, tables })
    }

    fn decode(path: &Path, bytes: &[u8]) -> Result<BTreeMap<String, MirrorTable>, MirrorError> {
        let path_str = path.display().to_string();

        let header_len = MIRROR_MAGIC.len() + 4 + 8;
        if bytes.len() < header_len {
            return CorruptSnafu {
                path: path_str,
                msg: "file shorter than header".to_string(),
            }
            .fail();
        }
        if &bytes[..8] != MIRROR_MAGIC {
            return CorruptSnafu {
                path: path_str,
                msg: "bad magic bytes".to_string(),
            }
            .fail();
        }

        let version = u32::from_le_bytes(bytes[8..12].try_into().unwrap_or_default());
        if version != MIRROR_FORMAT_VERSION {
            return CorruptSnafu {
                path: path_str,
                msg: format!("unsupported format version {version}"),
            }
            .fail();
        }

        let index_len = u64::from_le_bytes(bytes[12..20].try_into().unwrap_or_default()) as usize;
        let data_start = header_len + index_len;
        if bytes.len() < data_start {
            return CorruptSnafu {
                path: path_str,
                msg: "index extends past end of file".to_string(),
            }
            .fail();
        }

        let index: Vec<IndexEntry> =
            serde_json::from_slice(&bytes[header_len..data_start]).map_err(|e| {
                CorruptSnafu {
                    path: path_str.clone(),
                    msg: format!("index is not valid JSON: {e}"),
                }
                .build()
            })?;

        let data = &bytes[data_start..];
        let mut tables = BTreeMap::new();
        for entry in index {
            let start = entry.offset as usize;
            let end = start + entry.len as usize;
            if end > data.len() {
                return CorruptSnafu {
                    path: path_str,
                    msg: format!("entry {} extends past end of file", entry.name),
                }
                .fail();
            }

            let reader =
                FileReader::try_new(Cursor::new(&data[start..end]), None).context(IpcSnafu {
                    table: entry.name.clone(),
                })?;
            let schema = reader.schema();
            let batches = reader
                .collect::<Result<Vec<_>, ArrowError>>()
                .context(IpcSnafu {
                    table: entry.name.clone(),
                })?;

            tables.insert(entry.name, MirrorTable { schema, batches });
        }

        Ok(tables)
    }

    /// The mirror database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the mirrored contents of `name`.
    pub fn set_table(
        &mut self,
        name: impl Into<String>,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) {
        self.tables
            .insert(name.into(), MirrorTable { schema, batches });
    }

    /// Look up a mirrored table.
    pub fn get(&self, name: &str) -> Option<&MirrorTable> {
        self.tables.get(name)
    }

    /// Names of all entries, shadows included, sorted.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Names of base entries (shadow copies excluded), sorted.
    pub fn base_table_names(&self) -> Vec<String> {
        self.tables
            .keys()
            .filter(|k| !k.ends_with(SHADOW_SUFFIX))
            .cloned()
            .collect()
    }

    /// Materialize a `<table>_snapshot` shadow copy of every base table.
    ///
    /// Shadows of shadows are not taken; an existing shadow is replaced.
    pub fn shadow_tables(&mut self) {
        for name in self.base_table_names() {
            let entry = self.tables[&name].clone();
            self.tables.insert(format!("{name}{SHADOW_SUFFIX}"), entry);
        }
    }

    /// Flush the whole mirror to its database file.
    ///
    /// Serializes every entry as an Arrow IPC payload, then writes the
    /// container atomically (write-then-rename with fsync). The on-disk
    /// file is only ever a complete checkpoint, never a partial write.
    pub async fn checkpoint(&self) -> Result<(), MirrorError> {
        let mut index: Vec<IndexEntry> = Vec::with_capacity(self.tables.len());
        let mut data: Vec<u8> = Vec::new();

        for (name, table) in &self.tables {
            let mut payload = Vec::new();
            {
                let mut writer = FileWriter::try_new(&mut payload, table.schema.as_ref())
                    .context(IpcSnafu {
                        table: name.clone(),
                    })?;
                for batch in &table.batches {
                    writer.write(batch).context(IpcSnafu {
                        table: name.clone(),
                    })?;
                }
                writer.finish().context(IpcSnafu {
                    table: name.clone(),
                })?;
            }

            index.push(IndexEntry {
                name: name.clone(),
                offset: data.len() as u64,
                len: payload.len() as u64,
            });
            data.extend_from_slice(&payload);
        }

        let index_json = serde_json::to_vec(&index).map_err(|e| {
            CorruptSnafu {
                path: self.path.display().to_string(),
                msg: format!("failed to serialize index: {e}"),
            }
            .build()
        })?;

        let mut contents =
            Vec::with_capacity(MIRROR_MAGIC.len() + 12 + index_json.len() + data.len());
        contents.extend_from_slice(MIRROR_MAGIC);
        contents.extend_from_slice(&MIRROR_FORMAT_VERSION.to_le_bytes());
        contents.extend_from_slice(&(index_json.len() as u64).to_le_bytes());
        contents.extend_from_slice(&index_json);
        contents.extend_from_slice(&data);

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let location = StoreLocation::local(parent);
        let name = self
            .path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("mirror.db"));

        storage::write_atomic(&location, &name, &contents)
            .await
            .context(StorageSnafu {
                path: self.path.display().to_string(),
            })
    }
}
