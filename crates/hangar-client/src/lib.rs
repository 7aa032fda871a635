//! Typed Arrow Flight client for the hangar ingestion service.
//!
//! Wraps [`arrow_flight::FlightClient`] with the gateway's conventions:
//! the `get_schema_using_query` probe action, JSON upload commands in the
//! flight descriptor, and the upload result (snapshot outcome included)
//! parsed from `PutResult` metadata.
//!
//! Connection establishment fails fast on unreachable endpoints; there is
//! no hidden retry policy anywhere in this crate. Callers needing
//! resilience wrap the calls themselves.
#![deny(missing_docs)]

mod client;

pub use client::{ClientConfig, ClientError, HangarClient};
pub use hangar_core::protocol::{SnapshotOutcome, UploadCommand, UploadResult};
pub use hangar_core::store::InsertMode;
