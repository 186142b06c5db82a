use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability::WAL_COMPACTIONS_TOTAL;

use super::availability;
use super::conflict::{
    exclusive_availability, pooled_availability, validate_lines, validate_query_window,
    validate_window,
};
use super::{Engine, EngineError, SharedBooking, WalCommand};

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let row = self.get_booking_row(&id)?;
        let booking = row.lock().await.clone();
        Some(booking)
    }

    /// Bookings touching `resource_id` (any resource when `None`), optionally
    /// narrowed to one status, ordered by window start.
    pub async fn list_bookings(
        &self,
        resource_id: Option<Ulid>,
        status: Option<BookingStatus>,
    ) -> Vec<Booking> {
        let rows: Vec<SharedBooking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for row in rows {
            let booking = row.lock().await;
            if resource_id.is_some_and(|rid| booking.quantity_on(rid).is_none()) {
                continue;
            }
            if status.is_some_and(|s| booking.status != s) {
                continue;
            }
            out.push(booking.clone());
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        out
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let rows: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(rows.len());
        for rs in rows {
            out.push(rs.read().await.info());
        }
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn get_resource_info(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let info = rs.read().await.info();
        Ok(info)
    }

    pub fn participant(&self, id: Ulid) -> Option<Participant> {
        self.participants.get(&id).map(|p| p.value().clone())
    }

    /// Advisory: is the venue free over `[start, end)`? Read locks only, so
    /// the answer may be stale by the time `approve` runs.
    pub async fn check_exclusive(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        excluding: Option<Ulid>,
    ) -> Result<ExclusiveAvailability, EngineError> {
        let span = validate_window(start, end)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        let result = exclusive_availability(&guard, &span, excluding)?;
        debug!(
            "check_exclusive {resource_id} [{start}, {end}) -> {}",
            result.available
        );
        Ok(result)
    }

    /// Advisory: can every line be lent over `[start, end)`? Every shortfall
    /// is reported.
    pub async fn check_pooled(
        &self,
        lines: &[LoanLine],
        start: Ms,
        end: Ms,
        excluding: Option<Ulid>,
    ) -> Result<PooledAvailability, EngineError> {
        let span = validate_window(start, end)?;
        validate_lines(lines)?;

        let mut ids: Vec<Ulid> = lines.iter().map(|l| l.item_id).collect();
        ids.sort();
        let mut rows = Vec::with_capacity(ids.len());
        for id in &ids {
            rows.push(self.get_resource(id).ok_or(EngineError::NotFound(*id))?);
        }
        let mut guards = Vec::with_capacity(rows.len());
        for rs in &rows {
            guards.push(rs.read().await);
        }
        let states: Vec<&ResourceState> = guards.iter().map(|g| &**g).collect();
        let result = pooled_availability(lines, &states, &span, excluding)?;
        debug!(
            "check_pooled {} lines [{start}, {end}) -> {} shortfalls",
            lines.len(),
            result.shortfalls.len()
        );
        Ok(result)
    }

    /// Open sub-windows of a venue within `[start, end)`.
    pub async fn free_windows(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        let query = validate_query_window(start, end)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        if guard.kind != ResourceKind::Exclusive {
            return Err(EngineError::InvariantViolation("not an exclusive resource"));
        }
        Ok(availability::free_windows(&guard, &query))
    }

    /// Remaining quantity of a pooled item over `[start, end)` as a step function.
    pub async fn stock_profile(
        &self,
        item_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<StockLevel>, EngineError> {
        let query = validate_query_window(start, end)?;
        let rs = self
            .get_resource(&item_id)
            .ok_or(EngineError::NotFound(item_id))?;
        let guard = rs.read().await;
        if guard.total_stock().is_none() {
            return Err(EngineError::InvariantViolation("not a pooled item"));
        }
        Ok(availability::stock_profile(&guard, &query))
    }

    /// Rewrite the WAL as a minimal snapshot of current state.
    ///
    /// Holds the commit gate exclusively, so no transaction commits between
    /// the snapshot and the file swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        let resources: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        for rs in resources {
            let guard = rs.read().await;
            events.push(Event::ResourceCreated {
                id: guard.id,
                name: guard.name.clone(),
                kind: guard.kind,
            });
        }

        let participants: Vec<Participant> =
            self.participants.iter().map(|e| e.value().clone()).collect();
        for p in participants {
            events.push(Event::ParticipantRegistered {
                id: p.id,
                display_name: p.display_name,
            });
        }

        let bookings: Vec<SharedBooking> =
            self.bookings.iter().map(|e| e.value().clone()).collect();
        for row in bookings {
            let booking = row.lock().await.clone();
            events.push(Event::BookingRecorded { booking });
        }

        let counters: Vec<_> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (name, row) in counters {
            if let Some(value) = *row.lock().await {
                events.push(Event::CounterSet { name, value });
            }
        }

        for entry in &self.roster.lock().await.entries {
            events.push(Event::RosterEntryRecorded {
                entry: entry.clone(),
            });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
