//! Database module: models and schema for persistent storage.
//!
//! Layout:
//! - `models.rs`: Rust structs mirroring DB rows
//! - `schema.rs`: SQL DDL for initializing the database (SQLite-first)
//! - `sqlite.rs`: `EmbarkStorage`, the query layer used by handlers and the importer

pub mod models;
pub mod schema;
pub mod sqlite;

pub use models::{
    AnalysisResult, AnalysisStatus, DbFirmwareAnalysis, DbFirmwareFile, DbLabel, DbVulnerability,
    NewAnalysis,
};
pub use schema::SQLITE_INIT;
pub use sqlite::{EmbarkStorage, SqlitePool};
