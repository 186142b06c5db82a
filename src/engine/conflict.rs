use std::collections::HashSet;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{available_quantity, exclusive_conflict};
use super::{ConflictDetail, EngineError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvariantViolation("start must be before end"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(Span::new(start, end))
}

pub(crate) fn validate_query_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = validate_window(start, end)?;
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(span)
}

pub(crate) fn validate_label(label: &Option<String>) -> Result<(), EngineError> {
    if let Some(l) = label
        && l.len() > MAX_LABEL_LEN
    {
        return Err(EngineError::LimitExceeded("label too long"));
    }
    Ok(())
}

pub(crate) fn validate_lines(lines: &[LoanLine]) -> Result<(), EngineError> {
    if lines.is_empty() {
        return Err(EngineError::InvariantViolation("booking has no items"));
    }
    if lines.len() > MAX_LINES_PER_BOOKING {
        return Err(EngineError::LimitExceeded("too many items in booking"));
    }
    let mut seen = HashSet::with_capacity(lines.len());
    for line in lines {
        if line.quantity == 0 {
            return Err(EngineError::InvariantViolation("quantity must be positive"));
        }
        if !seen.insert(line.item_id) {
            return Err(EngineError::InvariantViolation("item listed twice"));
        }
    }
    Ok(())
}

fn find_state<'a>(states: &[&'a ResourceState], id: Ulid) -> Result<&'a ResourceState, EngineError> {
    states
        .iter()
        .copied()
        .find(|rs| rs.id == id)
        .ok_or(EngineError::NotFound(id))
}

pub(crate) fn exclusive_availability(
    rs: &ResourceState,
    span: &Span,
    excluding: Option<Ulid>,
) -> Result<ExclusiveAvailability, EngineError> {
    if rs.kind != ResourceKind::Exclusive {
        return Err(EngineError::InvariantViolation("not an exclusive resource"));
    }
    let conflicting_booking_id = exclusive_conflict(rs, span, excluding);
    Ok(ExclusiveAvailability {
        available: conflicting_booking_id.is_none(),
        conflicting_booking_id,
    })
}

/// Check every line, collecting all shortfalls rather than stopping at the first.
pub(crate) fn pooled_availability(
    lines: &[LoanLine],
    states: &[&ResourceState],
    span: &Span,
    excluding: Option<Ulid>,
) -> Result<PooledAvailability, EngineError> {
    let mut shortfalls = Vec::new();
    for line in lines {
        let rs = find_state(states, line.item_id)?;
        if rs.total_stock().is_none() {
            return Err(EngineError::InvariantViolation("not a pooled item"));
        }
        let available = available_quantity(rs, span, excluding);
        if available < line.quantity as i64 {
            shortfalls.push(Shortfall {
                item_id: line.item_id,
                requested: line.quantity,
                available,
            });
        }
    }
    Ok(PooledAvailability {
        available: shortfalls.is_empty(),
        shortfalls,
    })
}

/// The authoritative check, run on write-locked resources right before a
/// booking starts (or keeps) holding them.
pub(crate) fn check_target(
    target: &BookingTarget,
    span: &Span,
    states: &[&ResourceState],
    excluding: Option<Ulid>,
) -> Result<(), EngineError> {
    match target {
        BookingTarget::Exclusive { resource_id } => {
            let rs = find_state(states, *resource_id)?;
            let result = exclusive_availability(rs, span, excluding)?;
            match result.conflicting_booking_id {
                Some(other) => Err(EngineError::Conflict(ConflictDetail::Booking(other))),
                None => Ok(()),
            }
        }
        BookingTarget::Pooled { lines } => {
            let result = pooled_availability(lines, states, span, excluding)?;
            if result.available {
                Ok(())
            } else {
                Err(EngineError::Conflict(ConflictDetail::Shortfalls(
                    result.shortfalls,
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(total_stock: u32) -> ResourceState {
        ResourceState::new(Ulid::new(), None, ResourceKind::Pooled { total_stock })
    }

    fn lend(rs: &mut ResourceState, start: Ms, end: Ms, quantity: u32) -> Ulid {
        let booking_id = Ulid::new();
        rs.insert_allocation(Allocation {
            booking_id,
            span: Span::new(start, end),
            quantity,
        });
        booking_id
    }

    #[test]
    fn window_validation() {
        assert!(matches!(
            validate_window(10, 10),
            Err(EngineError::InvariantViolation(_))
        ));
        assert!(matches!(
            validate_window(20, 10),
            Err(EngineError::InvariantViolation(_))
        ));
        assert!(matches!(
            validate_window(-5, 10),
            Err(EngineError::LimitExceeded(_))
        ));
        assert_eq!(validate_window(10, 20).unwrap(), Span::new(10, 20));
    }

    #[test]
    fn line_validation() {
        let a = Ulid::new();
        assert!(validate_lines(&[]).is_err());
        assert!(validate_lines(&[LoanLine { item_id: a, quantity: 0 }]).is_err());
        assert!(
            validate_lines(&[
                LoanLine { item_id: a, quantity: 1 },
                LoanLine { item_id: a, quantity: 2 },
            ])
            .is_err()
        );
        assert!(validate_lines(&[LoanLine { item_id: a, quantity: 3 }]).is_ok());
    }

    #[test]
    fn pooled_reports_every_shortfall() {
        let mut chairs = item(5);
        let mut tables = item(2);
        let aprons = item(10);
        lend(&mut chairs, 1, 10, 3);
        lend(&mut tables, 1, 10, 2);

        let lines = [
            LoanLine { item_id: chairs.id, quantity: 3 },
            LoanLine { item_id: aprons.id, quantity: 4 },
            LoanLine { item_id: tables.id, quantity: 1 },
        ];
        let states = [&chairs, &tables, &aprons];
        let result = pooled_availability(&lines, &states, &Span::new(5, 15), None).unwrap();
        assert!(!result.available);
        assert_eq!(
            result.shortfalls,
            vec![
                Shortfall { item_id: chairs.id, requested: 3, available: 2 },
                Shortfall { item_id: tables.id, requested: 1, available: 0 },
            ]
        );
    }

    #[test]
    fn check_target_excludes_own_allocation() {
        let mut chairs = item(5);
        let own = lend(&mut chairs, 0, 10, 5);
        let target = BookingTarget::Pooled {
            lines: vec![LoanLine { item_id: chairs.id, quantity: 5 }],
        };
        let span = Span::new(0, 10);
        assert!(check_target(&target, &span, &[&chairs], Some(own)).is_ok());
        assert!(matches!(
            check_target(&target, &span, &[&chairs], None),
            Err(EngineError::Conflict(ConflictDetail::Shortfalls(_)))
        ));
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let chairs = item(5);
        assert!(matches!(
            exclusive_availability(&chairs, &Span::new(0, 10), None),
            Err(EngineError::InvariantViolation(_))
        ));

        let hall = ResourceState::new(Ulid::new(), None, ResourceKind::Exclusive);
        let lines = [LoanLine { item_id: hall.id, quantity: 1 }];
        assert!(matches!(
            pooled_availability(&lines, &[&hall], &Span::new(0, 10), None),
            Err(EngineError::InvariantViolation(_))
        ));
    }
}
