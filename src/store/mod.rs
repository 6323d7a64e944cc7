//! Persistence layer: libSQL-backed sequence state.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    Expected, ProcessedMessage, SequenceRepository, StageAdvance, StatusCounts, WriteOutcome,
};
