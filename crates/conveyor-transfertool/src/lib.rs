//! conveyor-transfertool
//!
//! Boundary to the external transfer tool: a [`TransferTool`] trait that
//! returns the tool's raw status report for one job, and [`FtsRestClient`],
//! an FTS3-style REST implementation.
//!
//! Reports are returned verbatim as [`RawTransferResponse`]; turning them
//! into outcomes is the normalizer's job, not this crate's.

mod fts;

pub use conveyor_reconcile::RawTransferResponse;
pub use fts::FtsRestClient;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferToolError {
    /// Network or transport failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// The tool answered with a non-success HTTP status other than 404.
    #[error("transfer tool api error status={status}: {message}")]
    Api { status: u16, message: String },
    /// A response payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Status source for submitted transfers.
///
/// A job the tool has forgotten must be reported with state `NOT_FOUND`
/// rather than as an error, so that it normalizes to LOST.
#[async_trait::async_trait]
pub trait TransferTool: Send + Sync {
    /// Short identifier of the tool (e.g. `"fts3"`).
    fn name(&self) -> &'static str;

    async fn query(&self, external_id: &str) -> Result<RawTransferResponse, TransferToolError>;
}

#[async_trait::async_trait]
impl<T: TransferTool + ?Sized> TransferTool for std::sync::Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn query(&self, external_id: &str) -> Result<RawTransferResponse, TransferToolError> {
        (**self).query(external_id).await
    }
}
