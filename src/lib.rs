//! Booking, duty rotation and sequence numbering for a lodge's scheduling
//! system.
//!
//! Everything runs in-process against an [`engine::Engine`], which owns its
//! rows behind per-row locks and makes every committed transaction durable
//! through a write-ahead log before it becomes visible.

pub mod compactor;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod tenant;
pub mod wal;
