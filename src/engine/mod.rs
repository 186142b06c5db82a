mod availability;
mod bookings;
mod conflict;
mod counters;
mod error;
mod mutations;
mod queries;
mod rotation;

pub use availability::{
    available_quantity, borrowed_quantity, exclusive_conflict, free_windows, merge_overlapping,
    stock_profile, subtract_intervals,
};
pub use error::{ConflictDetail, EngineError};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use ulid::Ulid;

use crate::ledger::Ledger;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
pub type SharedBooking = Arc<Mutex<Booking>>;
/// `None` until the counter's first value is committed.
pub type SharedCounter = Arc<Mutex<Option<u64>>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingFrame = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer its frame (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingFrame>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} frames: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingFrame]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (events, _) in batch {
        if let Err(e) = wal.append_buffered(events) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One lodge's booking, rotation and numbering state.
///
/// Rows live behind their own locks; taking a row's write lock is the
/// equivalent of `SELECT ... FOR UPDATE`. Multi-row transactions lock the
/// booking first, then its resources in ascending id order.
pub struct Engine {
    pub(super) resources: DashMap<Ulid, SharedResourceState>,
    pub(super) bookings: DashMap<Ulid, SharedBooking>,
    pub(super) counters: DashMap<String, SharedCounter>,
    pub(super) participants: DashMap<Ulid, Participant>,
    pub(super) roster: Mutex<Roster>,
    /// Held shared by every mutating operation and exclusively by compaction,
    /// so a snapshot never misses a frame committed while it was being taken.
    pub(super) commit_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) ledger: Option<Arc<dyn Ledger>>,
}

/// Re-place a booking's allocations on its locked resources so they match
/// its current status and span.
fn sync_allocations(booking: &Booking, resources: &mut [OwnedRwLockWriteGuard<ResourceState>]) {
    for rs in resources.iter_mut() {
        rs.remove_allocation(booking.id);
        if booking.status.holds_resources()
            && let Some(quantity) = booking.quantity_on(rs.id)
        {
            rs.insert_allocation(Allocation {
                booking_id: booking.id,
                span: booking.span,
                quantity,
            });
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            resources: DashMap::new(),
            bookings: DashMap::new(),
            counters: DashMap::new(),
            participants: DashMap::new(),
            roster: Mutex::new(Roster::default()),
            commit_gate: RwLock::new(()),
            wal_tx,
            notify,
            ledger: None,
        };

        // We're the sole owner of every row here, so try_lock/try_write always
        // succeed instantly. Never block: this may run inside an async context
        // (e.g. lazy tenant creation).
        for event in &events {
            engine.replay_event(event);
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events from {}",
                events.len(),
                wal_path.display()
            );
        }

        Ok(engine)
    }

    /// Install the ledger that `approve` charges bookings with an amount to.
    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::ResourceCreated { id, name, kind } => {
                let rs = ResourceState::new(*id, name.clone(), *kind);
                self.resources.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Event::ResourceUpdated { id, name, kind } => {
                if let Some(rs) = self.get_resource(id) {
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    guard.name = name.clone();
                    guard.kind = *kind;
                }
            }
            Event::ParticipantRegistered { id, display_name } => {
                self.participants.insert(
                    *id,
                    Participant {
                        id: *id,
                        display_name: display_name.clone(),
                    },
                );
            }
            Event::BookingRecorded { booking } => {
                self.bookings
                    .insert(booking.id, Arc::new(Mutex::new(booking.clone())));
                let mut guards = self.try_lock_resources_for_replay(&booking.resource_ids());
                sync_allocations(booking, &mut guards);
            }
            Event::CounterSet { name, value } => {
                let counter = self.counters.entry(name.clone()).or_default().clone();
                *counter.try_lock().expect("replay: uncontended lock") = Some(*value);
            }
            other if other.is_roster_event() => {
                self.roster
                    .try_lock()
                    .expect("replay: uncontended lock")
                    .apply(other);
            }
            other => {
                let Some(booking_id) = other.booking_id() else { return };
                let Some(row) = self.get_booking_row(&booking_id) else { return };
                let mut booking = row.try_lock().expect("replay: uncontended lock");
                booking.apply(other);
                let mut guards = self.try_lock_resources_for_replay(&booking.resource_ids());
                sync_allocations(&booking, &mut guards);
            }
        }
    }

    fn try_lock_resources_for_replay(
        &self,
        ids: &[Ulid],
    ) -> Vec<OwnedRwLockWriteGuard<ResourceState>> {
        ids.iter()
            .filter_map(|id| self.get_resource(id))
            .map(|rs| rs.try_write_owned().expect("replay: uncontended write"))
            .collect()
    }

    /// Enter a mutating transaction. Hold the guard until the last write is applied.
    pub(super) async fn begin(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_gate.read().await
    }

    /// Write one transaction's events to the WAL as a single frame via the
    /// background group-commit writer. Nothing is applied on error.
    pub(super) async fn wal_commit(&self, events: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-commit + apply + notify for one booking and its locked resources.
    pub(super) async fn commit_booking(
        &self,
        booking: &mut Booking,
        resources: &mut [OwnedRwLockWriteGuard<ResourceState>],
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        self.wal_commit(&events).await?;
        for event in &events {
            booking.apply(event);
        }
        sync_allocations(booking, resources);
        self.notify.send_all(&events);
        Ok(())
    }

    /// WAL-commit + apply + notify for the roster.
    pub(super) async fn commit_roster(
        &self,
        roster: &mut Roster,
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        self.wal_commit(&events).await?;
        for event in &events {
            roster.apply(event);
        }
        self.notify.send_all(&events);
        Ok(())
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub(super) fn get_booking_row(&self, id: &Ulid) -> Option<SharedBooking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    /// Acquire write locks on resources in ascending id order.
    pub(super) async fn lock_resources(
        &self,
        ids: &[Ulid],
    ) -> Result<Vec<OwnedRwLockWriteGuard<ResourceState>>, EngineError> {
        let mut sorted = ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for id in &sorted {
            let rs = self.get_resource(id).ok_or(EngineError::NotFound(*id))?;
            guards.push(rs.write_owned().await);
        }
        Ok(guards)
    }
}
