use ulid::Ulid;

use crate::model::Shortfall;

/// Why an approval (or reschedule) could not take the requested window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictDetail {
    /// An exclusive resource is already held by this booking.
    Booking(Ulid),
    /// Every pooled item that cannot cover its requested quantity.
    Shortfalls(Vec<Shortfall>),
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    Conflict(ConflictDetail),
    InvalidTransition {
        id: Ulid,
        state: &'static str,
        action: &'static str,
    },
    InvariantViolation(&'static str),
    LimitExceeded(&'static str),
    Ledger(String),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(ConflictDetail::Booking(id)) => {
                write!(f, "conflict with booking: {id}")
            }
            EngineError::Conflict(ConflictDetail::Shortfalls(shortfalls)) => {
                write!(f, "insufficient stock:")?;
                for s in shortfalls {
                    write!(
                        f,
                        " {} (requested {}, available {})",
                        s.item_id, s.requested, s.available
                    )?;
                }
                Ok(())
            }
            EngineError::InvalidTransition { id, state, action } => {
                write!(f, "cannot {action} {id}: it is {state}")
            }
            EngineError::InvariantViolation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Ledger(e) => write!(f, "ledger error: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Conflict(_) => "conflict",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::InvariantViolation(_) => "invariant_violation",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Ledger(_) => "ledger",
            EngineError::WalError(_) => "wal",
        }
    }
}
