//! Logical table schema stored in changelog metadata.
//!
//! Models the ordered (column name, type, nullability) triples a table is
//! declared with, independent of Arrow so the persisted JSON stays stable,
//! with lossless conversion in both directions for the types this gateway
//! ingests.

use std::{collections::HashSet, fmt, sync::Arc};

use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Units for logical timestamps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ColumnTimestampUnit {
    /// Second precision.
    Seconds,
    /// Millisecond precision.
    Millis,
    /// Microsecond precision.
    Micros,
    /// Nanosecond precision.
    Nanos,
}

impl ColumnTimestampUnit {
    fn to_arrow_time_unit(self) -> TimeUnit {
        match self {
            ColumnTimestampUnit::Seconds => TimeUnit::Second,
            ColumnTimestampUnit::Millis => TimeUnit::Millisecond,
            ColumnTimestampUnit::Micros => TimeUnit::Microsecond,
            ColumnTimestampUnit::Nanos => TimeUnit::Nanosecond,
        }
    }

    fn from_arrow_time_unit(unit: &TimeUnit) -> Self {
        match unit {
            TimeUnit::Second => ColumnTimestampUnit::Seconds,
            TimeUnit::Millisecond => ColumnTimestampUnit::Millis,
            TimeUnit::Microsecond => ColumnTimestampUnit::Micros,
            TimeUnit::Nanosecond => ColumnTimestampUnit::Nanos,
        }
    }
}

impl fmt::Display for ColumnTimestampUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnTimestampUnit::Seconds => write!(f, "s"),
            ColumnTimestampUnit::Millis => write!(f, "ms"),
            ColumnTimestampUnit::Micros => write!(f, "us"),
            ColumnTimestampUnit::Nanos => write!(f, "ns"),
        }
    }
}

/// Logical data types this gateway accepts in table schemas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Boolean value.
    Bool,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 32-bit floating point.
    Float32,
    /// 64-bit floating point.
    Float64,
    /// UTF-8 encoded string.
    Utf8,
    /// Variable-length binary data.
    Binary,
    /// Timestamp with precision unit and optional IANA timezone.
    Timestamp {
        /// Timestamp precision unit.
        unit: ColumnTimestampUnit,
        /// Optional IANA timezone identifier.
        timezone: Option<String>,
    },
}

impl ColumnType {
    fn to_arrow_datatype(&self) -> DataType {
        match self {
            ColumnType::Bool => DataType::Boolean,
            ColumnType::Int32 => DataType::Int32,
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float32 => DataType::Float32,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Utf8 => DataType::Utf8,
            ColumnType::Binary => DataType::Binary,
            ColumnType::Timestamp { unit, timezone } => {
                let tz: Option<Arc<str>> = timezone.as_ref().map(|s| Arc::<str>::from(s.as_str()));
                DataType::Timestamp(unit.to_arrow_time_unit(), tz)
            }
        }
    }

    fn from_arrow_datatype(column: &str, dt: &DataType) -> Result<Self, SchemaError> {
        Ok(match dt {
            DataType::Boolean => ColumnType::Bool,
            DataType::Int32 => ColumnType::Int32,
            DataType::Int64 => ColumnType::Int64,
            DataType::Float32 => ColumnType::Float32,
            DataType::Float64 => ColumnType::Float64,
            DataType::Utf8 => ColumnType::Utf8,
            DataType::Binary => ColumnType::Binary,
            DataType::Timestamp(unit, tz) => ColumnType::Timestamp {
                unit: ColumnTimestampUnit::from_arrow_time_unit(unit),
                timezone: tz.as_ref().map(|s| s.to_string()),
            },
            other => {
                return UnsupportedTypeSnafu {
                    column: column.to_string(),
                    data_type: format!("{other:?}"),
                }
                .fail();
            }
        })
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Bool => write!(f, "bool"),
            ColumnType::Int32 => write!(f, "int32"),
            ColumnType::Int64 => write!(f, "int64"),
            ColumnType::Float32 => write!(f, "float32"),
            ColumnType::Float64 => write!(f, "float64"),
            ColumnType::Utf8 => write!(f, "utf8"),
            ColumnType::Binary => write!(f, "binary"),
            ColumnType::Timestamp { unit, timezone } => match timezone {
                Some(tz) => write!(f, "timestamp[{unit}]({tz})"),
                None => write!(f, "timestamp[{unit}]"),
            },
        }
    }
}

/// One column declaration in a table schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Logical data type.
    pub data_type: ColumnType,
    /// Whether the column allows null values.
    pub nullable: bool,
}

impl fmt::Display for ColumnDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nullable {
            write!(f, "{}?: {}", self.name, self.data_type)
        } else {
            write!(f, "{}: {}", self.name, self.data_type)
        }
    }
}

/// Ordered collection of column declarations for one table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSchema {
    columns: Vec<ColumnDef>,
}

impl TableSchema {
    /// Build a schema from column definitions, rejecting duplicate names.
    pub fn new(columns: Vec<ColumnDef>) -> Result<Self, SchemaError> {
        let mut seen = HashSet::new();
        for c in &columns {
            if !seen.insert(c.name.as_str()) {
                return DuplicateColumnSnafu {
                    column: c.name.clone(),
                }
                .fail();
            }
        }
        Ok(Self { columns })
    }

    /// Derive a logical schema from an Arrow schema.
    ///
    /// Fails on Arrow types the gateway does not accept so unsupported
    /// uploads are rejected at the door with the offending column named.
    pub fn from_arrow(schema: &Schema) -> Result<Self, SchemaError> {
        let columns = schema
            .fields()
            .iter()
            .map(|f| {
                Ok(ColumnDef {
                    name: f.name().clone(),
                    data_type: ColumnType::from_arrow_datatype(f.name(), f.data_type())?,
                    nullable: f.is_nullable(),
                })
            })
            .collect::<Result<Vec<_>, SchemaError>>()?;

        Self::new(columns)
    }

    /// Convert to an owned Arrow [`Schema`].
    pub fn to_arrow(&self) -> Schema {
        let fields: Vec<Field> = self
            .columns
            .iter()
            .map(|c| Field::new(c.name.clone(), c.data_type.to_arrow_datatype(), c.nullable))
            .collect();
        Schema::new(fields)
    }

    /// Convert to a shared Arrow [`SchemaRef`].
    pub fn to_arrow_ref(&self) -> SchemaRef {
        Arc::new(self.to_arrow())
    }

    /// The column declarations in order.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the schema has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl fmt::Display for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, c) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{c}")?;
        }
        write!(f, ")")
    }
}

/// Errors while constructing or converting a table schema.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
pub enum SchemaError {
    /// Duplicate column names are not allowed.
    #[snafu(display("Duplicate column name: {column}"))]
    DuplicateColumn {
        /// The duplicate column name.
        column: String,
    },

    /// The Arrow type has no logical counterpart here.
    #[snafu(display("Unsupported data type for column '{column}': {data_type}"))]
    UnsupportedType {
        /// Column carrying the unsupported type.
        column: String,
        /// Debug rendering of the Arrow type.
        data_type: String,
    },
}
