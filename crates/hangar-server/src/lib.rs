//! Arrow Flight ingestion service for the hangar table store.
//!
//! Exposes uploads (`DoPut`), streaming reads (`DoGet`), and zero-row
//! schema probes (the `get_schema_using_query` action) over one
//! [`hangar_core::store::TableStore`]. The server lifecycle is the
//! explicit state machine in [`server`]; the Flight surface itself lives
//! in [`service`].
#![deny(missing_docs)]

pub mod server;
pub mod service;

pub use server::{IngestServer, ServerError, ServerHandle, ServerState};
pub use service::HangarFlightService;
