use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Resources ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    /// One approved booking at a time (a venue).
    Exclusive,
    /// Concurrent loans up to `total_stock` units (an asset in the catalog).
    Pooled { total_stock: u32 },
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Exclusive => "exclusive",
            ResourceKind::Pooled { .. } => "pooled",
        }
    }
}

/// Capacity held on a resource by an Approved or Active booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub booking_id: Ulid,
    pub span: Span,
    pub quantity: u32,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: Option<String>,
    pub kind: ResourceKind,
    /// Held allocations, sorted by `span.start`.
    pub allocations: Vec<Allocation>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: Option<String>, kind: ResourceKind) -> Self {
        Self {
            id,
            name,
            kind,
            allocations: Vec::new(),
        }
    }

    pub fn total_stock(&self) -> Option<u32> {
        match self.kind {
            ResourceKind::Pooled { total_stock } => Some(total_stock),
            ResourceKind::Exclusive => None,
        }
    }

    /// Insert allocation maintaining sort order by span.start.
    pub fn insert_allocation(&mut self, allocation: Allocation) {
        let pos = self
            .allocations
            .binary_search_by_key(&allocation.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.allocations.insert(pos, allocation);
    }

    pub fn remove_allocation(&mut self, booking_id: Ulid) -> Option<Allocation> {
        let pos = self
            .allocations
            .iter()
            .position(|a| a.booking_id == booking_id)?;
        Some(self.allocations.remove(pos))
    }

    /// Return only allocations whose span overlaps the query window.
    /// Uses binary search to skip allocations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Allocation> {
        let right_bound = self
            .allocations
            .partition_point(|a| a.span.start < query.end);
        self.allocations[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
        }
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanLine {
    pub item_id: Ulid,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingTarget {
    Exclusive { resource_id: Ulid },
    Pooled { lines: Vec<LoanLine> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Requested,
    Approved,
    /// Physically picked up.
    Active,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Requested => "requested",
            BookingStatus::Approved => "approved",
            BookingStatus::Active => "active",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// Only these states count toward overlap checks.
    pub fn holds_resources(&self) -> bool {
        matches!(self, BookingStatus::Approved | BookingStatus::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub target: BookingTarget,
    pub span: Span,
    pub status: BookingStatus,
    pub requester_id: Ulid,
    /// Charge in minor currency units. Passed through to the ledger untouched.
    pub amount: Option<i64>,
    pub ledger_entry_id: Option<Ulid>,
    pub label: Option<String>,
    pub created_at: Ms,
    pub approved_at: Option<Ms>,
    pub activated_at: Option<Ms>,
    /// Set when the booking is completed or cancelled.
    pub closed_at: Option<Ms>,
}

impl Booking {
    /// Referenced resource ids, sorted and deduplicated (lock order).
    pub fn resource_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = match &self.target {
            BookingTarget::Exclusive { resource_id } => vec![*resource_id],
            BookingTarget::Pooled { lines } => lines.iter().map(|l| l.item_id).collect(),
        };
        ids.sort();
        ids.dedup();
        ids
    }

    /// Units this booking occupies on `resource_id` while it holds resources.
    pub fn quantity_on(&self, resource_id: Ulid) -> Option<u32> {
        match &self.target {
            BookingTarget::Exclusive { resource_id: rid } if *rid == resource_id => Some(1),
            BookingTarget::Exclusive { .. } => None,
            BookingTarget::Pooled { lines } => lines
                .iter()
                .find(|l| l.item_id == resource_id)
                .map(|l| l.quantity),
        }
    }

    /// Apply a booking-scoped event. Allocations are synced by the caller.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::BookingRescheduled { span, .. } => self.span = *span,
            Event::BookingApproved {
                ledger_entry_id,
                at,
                ..
            } => {
                self.status = BookingStatus::Approved;
                self.ledger_entry_id = *ledger_entry_id;
                self.approved_at = Some(*at);
            }
            Event::BookingActivated { at, .. } => {
                self.status = BookingStatus::Active;
                self.activated_at = Some(*at);
            }
            Event::BookingCompleted { at, .. } => {
                self.status = BookingStatus::Completed;
                self.closed_at = Some(*at);
            }
            Event::BookingCancelled { at, .. } => {
                self.status = BookingStatus::Cancelled;
                self.closed_at = Some(*at);
            }
            _ => {}
        }
    }
}

/// Request to occupy an exclusive resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub requester_id: Ulid,
    pub amount: Option<i64>,
    pub label: Option<String>,
}

/// Request to borrow quantities of pooled items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PooledBookingRequest {
    pub id: Ulid,
    pub lines: Vec<LoanLine>,
    pub start: Ms,
    pub end: Ms,
    pub requester_id: Ulid,
    pub amount: Option<i64>,
    pub label: Option<String>,
}

// ── Rotation ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Ulid,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RosterStatus {
    Active,
    Paused,
}

impl RosterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RosterStatus::Active => "active",
            RosterStatus::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: Ulid,
    pub participant_id: Ulid,
    /// 1-based turn order among Active entries; 0 while Paused.
    pub order: u32,
    pub used_in_current_cycle: bool,
    pub status: RosterStatus,
    /// Manual pin to one specific occurrence.
    pub designated_booking_id: Option<Ulid>,
}

impl RosterEntry {
    pub fn is_active(&self) -> bool {
        self.status == RosterStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyAssignment {
    pub participant_id: Ulid,
    pub roster_entry_id: Ulid,
}

#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub entries: Vec<RosterEntry>,
}

impl Roster {
    pub fn get(&self, id: Ulid) -> Option<&RosterEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn get_active(&self, id: Ulid) -> Option<&RosterEntry> {
        self.get(id).filter(|e| e.is_active())
    }

    pub fn for_participant(&self, participant_id: Ulid) -> Option<&RosterEntry> {
        self.entries.iter().find(|e| e.participant_id == participant_id)
    }

    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_active()).count()
    }

    /// Active entries in turn order.
    pub fn active_by_order(&self) -> Vec<&RosterEntry> {
        let mut active: Vec<&RosterEntry> = self.entries.iter().filter(|e| e.is_active()).collect();
        active.sort_by_key(|e| (e.order, e.id));
        active
    }

    /// The entry whose turn is next in the current cycle.
    pub fn next_unused(&self) -> Option<&RosterEntry> {
        self.entries
            .iter()
            .filter(|e| e.is_active() && !e.used_in_current_cycle)
            .min_by_key(|e| (e.order, e.id))
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::RosterEntryRecorded { entry } => {
                match self.entries.iter_mut().find(|e| e.id == entry.id) {
                    Some(existing) => *existing = entry.clone(),
                    None => self.entries.push(entry.clone()),
                }
            }
            Event::RosterEntryRemoved { id } => self.entries.retain(|e| e.id != *id),
            Event::RosterOrderAssigned { orders } => {
                for (id, order) in orders {
                    if let Some(e) = self.entries.iter_mut().find(|e| e.id == *id) {
                        e.order = *order;
                    }
                }
            }
            Event::RosterCycleReset => {
                for e in self.entries.iter_mut().filter(|e| e.is_active()) {
                    e.used_in_current_cycle = false;
                }
            }
            Event::RosterEntryUsed { id } => {
                if let Some(e) = self.entries.iter_mut().find(|e| e.id == *id) {
                    e.used_in_current_cycle = true;
                }
            }
            Event::RosterEntryStatusChanged { id, status } => {
                if let Some(e) = self.entries.iter_mut().find(|e| e.id == *id) {
                    e.status = *status;
                    e.used_in_current_cycle = false;
                }
            }
            Event::RosterEntryPinned { id, booking_id } => {
                if let Some(e) = self.entries.iter_mut().find(|e| e.id == *id) {
                    e.designated_booking_id = *booking_id;
                }
            }
            _ => {}
        }
    }
}

// ── WAL events ───────────────────────────────────────────────────

/// The event types: flat, no nesting. A committed transaction is one WAL
/// frame holding one or more of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: Option<String>,
        kind: ResourceKind,
    },
    ResourceUpdated {
        id: Ulid,
        name: Option<String>,
        kind: ResourceKind,
    },
    ParticipantRegistered {
        id: Ulid,
        display_name: String,
    },
    /// Full booking record. Written on creation and by compaction.
    BookingRecorded {
        booking: Booking,
    },
    BookingRescheduled {
        id: Ulid,
        span: Span,
    },
    BookingApproved {
        id: Ulid,
        ledger_entry_id: Option<Ulid>,
        at: Ms,
    },
    BookingActivated {
        id: Ulid,
        at: Ms,
    },
    BookingCompleted {
        id: Ulid,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        at: Ms,
    },
    CounterSet {
        name: String,
        value: u64,
    },
    RosterEntryRecorded {
        entry: RosterEntry,
    },
    RosterEntryRemoved {
        id: Ulid,
    },
    RosterOrderAssigned {
        orders: Vec<(Ulid, u32)>,
    },
    RosterCycleReset,
    RosterEntryUsed {
        id: Ulid,
    },
    RosterEntryStatusChanged {
        id: Ulid,
        status: RosterStatus,
    },
    RosterEntryPinned {
        id: Ulid,
        booking_id: Option<Ulid>,
    },
}

impl Event {
    /// The booking a booking-scoped event applies to.
    pub fn booking_id(&self) -> Option<Ulid> {
        match self {
            Event::BookingRecorded { booking } => Some(booking.id),
            Event::BookingRescheduled { id, .. }
            | Event::BookingApproved { id, .. }
            | Event::BookingActivated { id, .. }
            | Event::BookingCompleted { id, .. }
            | Event::BookingCancelled { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn is_roster_event(&self) -> bool {
        matches!(
            self,
            Event::RosterEntryRecorded { .. }
                | Event::RosterEntryRemoved { .. }
                | Event::RosterOrderAssigned { .. }
                | Event::RosterCycleReset
                | Event::RosterEntryUsed { .. }
                | Event::RosterEntryStatusChanged { .. }
                | Event::RosterEntryPinned { .. }
        )
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub kind: ResourceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExclusiveAvailability {
    pub available: bool,
    pub conflicting_booking_id: Option<Ulid>,
}

/// One pooled item that cannot cover the requested quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shortfall {
    pub item_id: Ulid,
    pub requested: u32,
    /// `total_stock - borrowed`; negative when stock was lowered below
    /// what is already out on loan.
    pub available: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PooledAvailability {
    pub available: bool,
    pub shortfalls: Vec<Shortfall>,
}

/// Remaining quantity of a pooled item over a constant stretch of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockLevel {
    pub span: Span,
    pub available: i64,
}
