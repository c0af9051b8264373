//! SQLite storage for historical and speculative race data
//!
//! The pipeline only reads from these tables. Batches written by the
//! ingestion side are loaded through [`RaceRepository::import`].

#[cfg(test)]
pub mod fixtures;
pub mod repository;
pub mod schema;

pub use repository::{RaceRepository, RecordBatch};
