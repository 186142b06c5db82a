use std::collections::HashSet;
use std::time::Instant;

use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_ROSTER_SIZE;
use crate::model::*;
use crate::observability::{record_op, ROTATION_ADVANCES_TOTAL, ROTATION_CYCLES_TOTAL};

use super::{Engine, EngineError};

/// `1..=N` over the Active entries in their current turn order.
fn contiguous_orders(roster: &Roster) -> Vec<(Ulid, u32)> {
    roster
        .active_by_order()
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id, i as u32 + 1))
        .collect()
}

fn preview(roster: &Roster, events: &[Event]) -> Roster {
    let mut next = roster.clone();
    for event in events {
        next.apply(event);
    }
    next
}

fn reject_duplicates(ids: &[Ulid]) -> Result<(), EngineError> {
    let mut seen = HashSet::with_capacity(ids.len());
    if ids.iter().all(|id| seen.insert(*id)) {
        Ok(())
    } else {
        Err(EngineError::InvariantViolation("id listed twice"))
    }
}

impl Engine {
    /// Turn order for a fresh cycle: Active entries by participant display
    /// name, ties broken by participant id.
    fn alphabetical_orders(&self, roster: &Roster) -> Vec<(Ulid, u32)> {
        let mut active: Vec<(String, Ulid, Ulid)> = roster
            .entries
            .iter()
            .filter(|e| e.is_active())
            .map(|e| {
                let name = self
                    .participants
                    .get(&e.participant_id)
                    .map(|p| p.display_name.clone())
                    .unwrap_or_default();
                (name, e.participant_id, e.id)
            })
            .collect();
        active.sort();
        active
            .into_iter()
            .enumerate()
            .map(|(i, (_, _, id))| (id, i as u32 + 1))
            .collect()
    }

    /// Hand the duty to the next Active entry that has not served this cycle.
    /// When everyone has served, the cycle restarts in alphabetical order.
    pub async fn advance(&self) -> Result<Option<DutyAssignment>, EngineError> {
        let started = Instant::now();
        let result = async {
            let _tx = self.begin().await;
            let mut roster = self.roster.lock().await;
            self.advance_locked(&mut roster).await
        }
        .await;
        record_op("advance", started, &result);
        result
    }

    async fn advance_locked(
        &self,
        roster: &mut Roster,
    ) -> Result<Option<DutyAssignment>, EngineError> {
        let (assignment, events) = match roster.next_unused() {
            Some(entry) => (
                DutyAssignment {
                    participant_id: entry.participant_id,
                    roster_entry_id: entry.id,
                },
                vec![Event::RosterEntryUsed { id: entry.id }],
            ),
            None => {
                let orders = self.alphabetical_orders(roster);
                let Some(&(first, _)) = orders.first() else {
                    return Ok(None);
                };
                let Some(entry) = roster.get(first) else {
                    return Ok(None);
                };
                let assignment = DutyAssignment {
                    participant_id: entry.participant_id,
                    roster_entry_id: entry.id,
                };
                let events = vec![
                    Event::RosterCycleReset,
                    Event::RosterOrderAssigned { orders },
                    Event::RosterEntryUsed { id: first },
                ];
                (assignment, events)
            }
        };

        let reseeded = events.len() > 1;
        self.commit_roster(roster, events).await?;
        metrics::counter!(ROTATION_ADVANCES_TOTAL).increment(1);
        if reseeded {
            metrics::counter!(ROTATION_CYCLES_TOTAL).increment(1);
            info!(
                "rotation cycle complete, reseeded {} entries",
                roster.active_count()
            );
        }
        Ok(Some(assignment))
    }

    /// Exchange the turn positions of two Active entries.
    pub async fn swap_order(&self, a: Ulid, b: Ulid) -> Result<(), EngineError> {
        let _tx = self.begin().await;
        let mut roster = self.roster.lock().await;
        let order_a = roster.get_active(a).ok_or(EngineError::NotFound(a))?.order;
        let order_b = roster.get_active(b).ok_or(EngineError::NotFound(b))?.order;
        if a == b {
            return Ok(());
        }
        let events = vec![Event::RosterOrderAssigned {
            orders: vec![(a, order_b), (b, order_a)],
        }];
        self.commit_roster(&mut roster, events).await
    }

    /// Put the listed entries first, in the given order. Active entries not
    /// listed keep their relative order after them.
    pub async fn reorder(&self, ids: &[Ulid]) -> Result<(), EngineError> {
        reject_duplicates(ids)?;
        let _tx = self.begin().await;
        let mut roster = self.roster.lock().await;
        for id in ids {
            roster.get_active(*id).ok_or(EngineError::NotFound(*id))?;
        }

        let listed: HashSet<Ulid> = ids.iter().copied().collect();
        let rest = roster
            .active_by_order()
            .into_iter()
            .map(|e| e.id)
            .filter(|id| !listed.contains(id));
        let orders = ids
            .iter()
            .copied()
            .chain(rest)
            .enumerate()
            .map(|(i, id)| (id, i as u32 + 1))
            .collect();
        let events = vec![Event::RosterOrderAssigned { orders }];
        self.commit_roster(&mut roster, events).await
    }

    /// Rebuild the roster from a participant list. Pinned entries survive and
    /// their participants get no second entry; everything else is replaced
    /// and the Active set is numbered alphabetically.
    pub async fn initialize_roster(
        &self,
        participant_ids: &[Ulid],
    ) -> Result<Vec<RosterEntry>, EngineError> {
        reject_duplicates(participant_ids)?;
        if participant_ids.len() > MAX_ROSTER_SIZE {
            return Err(EngineError::LimitExceeded("roster too large"));
        }
        for id in participant_ids {
            if !self.participants.contains_key(id) {
                return Err(EngineError::NotFound(*id));
            }
        }

        let started = Instant::now();
        let result = async {
            let _tx = self.begin().await;
            let mut roster = self.roster.lock().await;

            let mut events: Vec<Event> = Vec::new();
            let mut pinned: HashSet<Ulid> = HashSet::new();
            for entry in &roster.entries {
                if entry.designated_booking_id.is_some() {
                    pinned.insert(entry.participant_id);
                } else {
                    events.push(Event::RosterEntryRemoved { id: entry.id });
                }
            }
            for participant_id in participant_ids {
                if pinned.contains(participant_id) {
                    continue;
                }
                events.push(Event::RosterEntryRecorded {
                    entry: RosterEntry {
                        id: Ulid::new(),
                        participant_id: *participant_id,
                        order: 0,
                        used_in_current_cycle: false,
                        status: RosterStatus::Active,
                        designated_booking_id: None,
                    },
                });
            }
            let orders = self.alphabetical_orders(&preview(&roster, &events));
            events.push(Event::RosterOrderAssigned { orders });

            self.commit_roster(&mut roster, events).await?;
            info!("roster initialized with {} active entries", roster.active_count());
            Ok(ordered_view(&roster))
        }
        .await;
        record_op("initialize_roster", started, &result);
        result
    }

    /// Make a participant duty-eligible at the end of the current order.
    pub async fn add_roster_entry(
        &self,
        id: Ulid,
        participant_id: Ulid,
    ) -> Result<RosterEntry, EngineError> {
        if !self.participants.contains_key(&participant_id) {
            return Err(EngineError::NotFound(participant_id));
        }
        let _tx = self.begin().await;
        let mut roster = self.roster.lock().await;
        if roster.get(id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        if roster.for_participant(participant_id).is_some() {
            return Err(EngineError::InvariantViolation(
                "participant already on roster",
            ));
        }
        if roster.entries.len() >= MAX_ROSTER_SIZE {
            return Err(EngineError::LimitExceeded("roster too large"));
        }

        let entry = RosterEntry {
            id,
            participant_id,
            order: roster.active_count() as u32 + 1,
            used_in_current_cycle: false,
            status: RosterStatus::Active,
            designated_booking_id: None,
        };
        let events = vec![Event::RosterEntryRecorded {
            entry: entry.clone(),
        }];
        self.commit_roster(&mut roster, events).await?;
        Ok(entry)
    }

    /// Take an entry out of the rotation without losing it.
    pub async fn pause_roster_entry(&self, id: Ulid) -> Result<(), EngineError> {
        let _tx = self.begin().await;
        let mut roster = self.roster.lock().await;
        let entry = roster.get(id).ok_or(EngineError::NotFound(id))?;
        if !entry.is_active() {
            return Err(EngineError::InvalidTransition {
                id,
                state: entry.status.as_str(),
                action: "pause",
            });
        }

        let mut events = vec![Event::RosterEntryStatusChanged {
            id,
            status: RosterStatus::Paused,
        }];
        let mut orders = contiguous_orders(&preview(&roster, &events));
        orders.push((id, 0));
        events.push(Event::RosterOrderAssigned { orders });
        self.commit_roster(&mut roster, events).await
    }

    /// Return a paused entry to the rotation, last in line.
    pub async fn resume_roster_entry(&self, id: Ulid) -> Result<(), EngineError> {
        let _tx = self.begin().await;
        let mut roster = self.roster.lock().await;
        let entry = roster.get(id).ok_or(EngineError::NotFound(id))?;
        if entry.is_active() {
            return Err(EngineError::InvalidTransition {
                id,
                state: entry.status.as_str(),
                action: "resume",
            });
        }

        let order = roster.active_count() as u32 + 1;
        let events = vec![
            Event::RosterEntryStatusChanged {
                id,
                status: RosterStatus::Active,
            },
            Event::RosterOrderAssigned {
                orders: vec![(id, order)],
            },
        ];
        self.commit_roster(&mut roster, events).await
    }

    pub async fn remove_roster_entry(&self, id: Ulid) -> Result<(), EngineError> {
        let _tx = self.begin().await;
        let mut roster = self.roster.lock().await;
        let entry = roster.get(id).ok_or(EngineError::NotFound(id))?;

        let mut events = vec![Event::RosterEntryRemoved { id }];
        if entry.is_active() {
            let orders = contiguous_orders(&preview(&roster, &events));
            events.push(Event::RosterOrderAssigned { orders });
        }
        self.commit_roster(&mut roster, events).await
    }

    /// Tie an entry to one booking (or clear the tie with `None`).
    pub async fn pin_roster_entry(
        &self,
        id: Ulid,
        booking_id: Option<Ulid>,
    ) -> Result<(), EngineError> {
        if let Some(b) = booking_id
            && !self.bookings.contains_key(&b)
        {
            return Err(EngineError::NotFound(b));
        }
        let _tx = self.begin().await;
        let mut roster = self.roster.lock().await;
        roster.get(id).ok_or(EngineError::NotFound(id))?;
        let events = vec![Event::RosterEntryPinned { id, booking_id }];
        self.commit_roster(&mut roster, events).await
    }

    /// Pick who is on duty for a booking. A pinned Active entry wins and the
    /// rotation does not move; otherwise the rotation advances.
    pub async fn assign_duty(&self, booking_id: Ulid) -> Result<Option<DutyAssignment>, EngineError> {
        if !self.bookings.contains_key(&booking_id) {
            return Err(EngineError::NotFound(booking_id));
        }
        let started = Instant::now();
        let result = async {
            let _tx = self.begin().await;
            let mut roster = self.roster.lock().await;
            let pinned = roster
                .entries
                .iter()
                .find(|e| e.is_active() && e.designated_booking_id == Some(booking_id));
            if let Some(entry) = pinned {
                return Ok(Some(DutyAssignment {
                    participant_id: entry.participant_id,
                    roster_entry_id: entry.id,
                }));
            }
            self.advance_locked(&mut roster).await
        }
        .await;
        record_op("assign_duty", started, &result);
        result
    }

    /// Active entries in turn order, then paused ones.
    pub async fn roster(&self) -> Vec<RosterEntry> {
        ordered_view(&*self.roster.lock().await)
    }
}

fn ordered_view(roster: &Roster) -> Vec<RosterEntry> {
    let mut view: Vec<RosterEntry> = roster.active_by_order().into_iter().cloned().collect();
    let mut paused: Vec<RosterEntry> = roster
        .entries
        .iter()
        .filter(|e| !e.is_active())
        .cloned()
        .collect();
    paused.sort_by_key(|e| e.id);
    view.extend(paused);
    view
}
