//! Feature schema, assembler and table.

pub mod assembler;
pub mod schema;
pub mod table;

pub use assembler::FeatureAssembler;
pub use schema::{FeatureSchema, NEUTRAL_SCORE};
pub use table::{FeatureRow, FeatureTable};
