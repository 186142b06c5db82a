use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{record_op, CONFLICTS_TOTAL};

use super::conflict::{check_target, now_ms, validate_label, validate_lines, validate_window};
use super::{ConflictDetail, Engine, EngineError};

fn invalid(booking: &Booking, action: &'static str) -> EngineError {
    EngineError::InvalidTransition {
        id: booking.id,
        state: booking.status.as_str(),
        action,
    }
}

fn record_conflict<T>(result: &Result<T, EngineError>) {
    if let Err(EngineError::Conflict(detail)) = result {
        let kind = match detail {
            ConflictDetail::Booking(_) => "exclusive",
            ConflictDetail::Shortfalls(_) => "pooled",
        };
        metrics::counter!(CONFLICTS_TOTAL, "kind" => kind).increment(1);
    }
}

impl Engine {
    /// File a request for an exclusive resource. No availability check:
    /// contested windows are resolved at approval time.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        let span = validate_window(req.start, req.end)?;
        validate_label(&req.label)?;
        let rs = self
            .get_resource(&req.resource_id)
            .ok_or(EngineError::NotFound(req.resource_id))?;
        if rs.read().await.kind != ResourceKind::Exclusive {
            return Err(EngineError::InvariantViolation("not an exclusive resource"));
        }

        let booking = Booking {
            id: req.id,
            target: BookingTarget::Exclusive {
                resource_id: req.resource_id,
            },
            span,
            status: BookingStatus::Requested,
            requester_id: req.requester_id,
            amount: req.amount,
            ledger_entry_id: None,
            label: req.label,
            created_at: now_ms(),
            approved_at: None,
            activated_at: None,
            closed_at: None,
        };
        self.insert_booking(booking).await
    }

    /// File a loan request for one or more pooled items.
    pub async fn create_pooled_booking(
        &self,
        req: PooledBookingRequest,
    ) -> Result<Booking, EngineError> {
        let span = validate_window(req.start, req.end)?;
        validate_label(&req.label)?;
        validate_lines(&req.lines)?;
        for line in &req.lines {
            let rs = self
                .get_resource(&line.item_id)
                .ok_or(EngineError::NotFound(line.item_id))?;
            if rs.read().await.total_stock().is_none() {
                return Err(EngineError::InvariantViolation("not a pooled item"));
            }
        }

        let booking = Booking {
            id: req.id,
            target: BookingTarget::Pooled { lines: req.lines },
            span,
            status: BookingStatus::Requested,
            requester_id: req.requester_id,
            amount: req.amount,
            ledger_entry_id: None,
            label: req.label,
            created_at: now_ms(),
            approved_at: None,
            activated_at: None,
            closed_at: None,
        };
        self.insert_booking(booking).await
    }

    async fn insert_booking(&self, booking: Booking) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let _tx = self.begin().await;
        let result = async {
            // Claim the id with a row that is already locked: racing creates see
            // it occupied, and nothing else can touch it until the commit lands.
            let row = Arc::new(Mutex::new(booking.clone()));
            let mut pending = row.clone().lock_owned().await;
            match self.bookings.entry(booking.id) {
                Entry::Occupied(_) => return Err(EngineError::AlreadyExists(booking.id)),
                Entry::Vacant(slot) => {
                    slot.insert(row.clone());
                }
            }

            let event = Event::BookingRecorded {
                booking: booking.clone(),
            };
            if let Err(e) = self.wal_commit(std::slice::from_ref(&event)).await {
                // Anyone queued on the row finds it closed.
                pending.status = BookingStatus::Cancelled;
                self.bookings
                    .remove_if(&booking.id, |_, current| Arc::ptr_eq(current, &row));
                return Err(e);
            }
            drop(pending);
            self.notify.send(&event);
            info!("booking {} requested by {}", booking.id, booking.requester_id);
            Ok(booking)
        }
        .await;
        record_op("create_booking", started, &result);
        result
    }

    /// Requested -> Approved. Re-checks availability under write locks on
    /// every resource the booking touches, then charges the ledger if the
    /// booking carries an amount. Any failure leaves the booking `Requested`.
    pub async fn approve(&self, id: Ulid) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.approve_locked(id).await;
        record_conflict(&result);
        record_op("approve", started, &result);
        result
    }

    async fn approve_locked(&self, id: Ulid) -> Result<Booking, EngineError> {
        let _tx = self.begin().await;
        let row = self.get_booking_row(&id).ok_or(EngineError::NotFound(id))?;
        let mut booking = row.lock().await;
        if booking.status != BookingStatus::Requested {
            return Err(invalid(&booking, "approve"));
        }

        let mut guards = self.lock_resources(&booking.resource_ids()).await?;
        {
            let states: Vec<&ResourceState> = guards.iter().map(|g| &**g).collect();
            if let Err(e) = check_target(&booking.target, &booking.span, &states, Some(id)) {
                warn!("approval of {id} rejected: {e}");
                return Err(e);
            }
        }

        let ledger_entry_id = match (booking.amount, &self.ledger) {
            (Some(amount), Some(ledger)) if amount > 0 => {
                match ledger.record_charge(&booking, amount).await {
                    Ok(entry_id) => Some(entry_id),
                    Err(e) => {
                        warn!("ledger refused charge for {id}: {e}");
                        return Err(EngineError::Ledger(e.to_string()));
                    }
                }
            }
            _ => None,
        };

        let events = vec![Event::BookingApproved {
            id,
            ledger_entry_id,
            at: now_ms(),
        }];
        self.commit_booking(&mut booking, &mut guards, events).await?;
        info!("booking {id} approved");
        Ok(booking.clone())
    }

    /// Approved -> Active (physical pickup). The resources are already held.
    pub async fn activate(&self, id: Ulid) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = async {
            let _tx = self.begin().await;
            let row = self.get_booking_row(&id).ok_or(EngineError::NotFound(id))?;
            let mut booking = row.lock().await;
            if booking.status != BookingStatus::Approved {
                return Err(invalid(&booking, "activate"));
            }
            let events = vec![Event::BookingActivated { id, at: now_ms() }];
            self.commit_booking(&mut booking, &mut [], events).await?;
            info!("booking {id} active");
            Ok(booking.clone())
        }
        .await;
        record_op("activate", started, &result);
        result
    }

    /// Approved | Active -> Completed. Releases the held resources.
    pub async fn complete(&self, id: Ulid) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self
            .close(id, "complete", |status| status.holds_resources(), |at| {
                Event::BookingCompleted { id, at }
            })
            .await;
        record_op("complete", started, &result);
        result
    }

    /// Requested | Approved -> Cancelled. An in-progress loan (Active) must be
    /// completed instead.
    pub async fn cancel(&self, id: Ulid) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self
            .close(
                id,
                "cancel",
                |status| matches!(status, BookingStatus::Requested | BookingStatus::Approved),
                |at| Event::BookingCancelled { id, at },
            )
            .await;
        record_op("cancel", started, &result);
        result
    }

    async fn close(
        &self,
        id: Ulid,
        action: &'static str,
        allowed: impl Fn(BookingStatus) -> bool,
        event: impl Fn(Ms) -> Event,
    ) -> Result<Booking, EngineError> {
        let _tx = self.begin().await;
        let row = self.get_booking_row(&id).ok_or(EngineError::NotFound(id))?;
        let mut booking = row.lock().await;
        if !allowed(booking.status) {
            return Err(invalid(&booking, action));
        }
        let mut guards = self.lock_resources(&booking.resource_ids()).await?;
        self.commit_booking(&mut booking, &mut guards, vec![event(now_ms())])
            .await?;
        info!("booking {id} {}", booking.status.as_str());
        Ok(booking.clone())
    }

    /// Move a Requested or Approved booking to a new window. An Approved
    /// booking keeps its resources only if the new window is free (its own
    /// allocation is ignored); otherwise nothing changes.
    pub async fn reschedule(&self, id: Ulid, start: Ms, end: Ms) -> Result<Booking, EngineError> {
        let span = validate_window(start, end)?;
        let started = Instant::now();
        let result = async {
            let _tx = self.begin().await;
            let row = self.get_booking_row(&id).ok_or(EngineError::NotFound(id))?;
            let mut booking = row.lock().await;
            let mut guards = match booking.status {
                BookingStatus::Requested => Vec::new(),
                BookingStatus::Approved => {
                    let guards = self.lock_resources(&booking.resource_ids()).await?;
                    let states: Vec<&ResourceState> = guards.iter().map(|g| &**g).collect();
                    check_target(&booking.target, &span, &states, Some(id))?;
                    drop(states);
                    guards
                }
                _ => return Err(invalid(&booking, "reschedule")),
            };
            let events = vec![Event::BookingRescheduled { id, span }];
            self.commit_booking(&mut booking, &mut guards, events).await?;
            info!("booking {id} moved to [{}, {})", span.start, span.end);
            Ok(booking.clone())
        }
        .await;
        record_conflict(&result);
        record_op("reschedule", started, &result);
        result
    }
}
