//! conveyor-testkit
//!
//! In-process doubles for every reconciliation port, plus seed fixtures.
//! No DB or network. Scenario tests for the engine and the daemon loop live
//! under this crate's `tests/`.

mod catalog;
mod doubles;
pub mod fixtures;

pub use catalog::{CatalogState, InMemoryCatalog, MemTx, Op};
pub use doubles::{LogLine, MemOutbox, RecordingEmitter, RecordingLog, RecordingMetrics};
pub use fixtures::{outcome, seed_transfer, Harness, Seeded};
