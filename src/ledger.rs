use async_trait::async_trait;
use ulid::Ulid;

use crate::model::Booking;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerError(pub String);

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for LedgerError {}

/// Downstream financial ledger.
///
/// Called from inside `Engine::approve` while the booking and its resources
/// are locked. An `Err` aborts the approval: the booking stays `Requested`
/// and nothing is written.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Record a charge for `booking` and return the ledger entry id.
    async fn record_charge(&self, booking: &Booking, amount: i64) -> Result<Ulid, LedgerError>;
}
