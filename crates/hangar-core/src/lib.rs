//! Core engine for the hangar table-ingestion gateway.
//!
//! This crate provides the pieces the Flight service is built on:
//!
//! - A warehouse of named tables, each backed by Parquet segments and an
//!   append-only JSON changelog with version-guard optimistic concurrency
//!   (`table`, `changelog`, `segment` modules).
//! - Directory-backed catalog discovery that is re-scanned before every
//!   read (`catalog` module).
//! - A file-backed mirror store and the snapshot pipeline that shadows,
//!   checkpoints, and copies it after every insert (`mirror`, `snapshot`
//!   modules).
//! - Zero-row schema probes over DataFusion (`probe` module).
//! - The `TableStore` facade wiring all of the above together with
//!   per-table write serialization (`store` module).
//!
//! The RPC surface and CLI live in sibling crates and depend on this one
//! rather than re-implementing storage logic.
#![deny(missing_docs)]

pub mod catalog;
pub mod changelog;
pub mod mirror;
pub mod probe;
pub mod protocol;
pub mod schema;
pub mod segment;
pub mod snapshot;
pub mod storage;
pub mod store;
pub mod table;
