//! conveyor-daemon library target.
//!
//! Exposes the poll loop for integration tests.
//! The binary `main.rs` depends on this library target.

pub mod poller;

pub use poller::{ItemResult, PollSummary, Poller, PollerSettings};
