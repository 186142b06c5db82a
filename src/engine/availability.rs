use ulid::Ulid;

use crate::model::*;

// ── Conflict primitives ───────────────────────────────────────────

/// First held allocation (earliest start) overlapping `span`, ignoring `excluding`.
pub fn exclusive_conflict(rs: &ResourceState, span: &Span, excluding: Option<Ulid>) -> Option<Ulid> {
    rs.overlapping(span)
        .find(|a| Some(a.booking_id) != excluding)
        .map(|a| a.booking_id)
}

/// Sum of quantities held by every allocation overlapping `span`.
///
/// This is a sum over the whole window, not the peak at any one instant:
/// two loans that overlap the window but not each other both count.
pub fn borrowed_quantity(rs: &ResourceState, span: &Span, excluding: Option<Ulid>) -> u64 {
    rs.overlapping(span)
        .filter(|a| Some(a.booking_id) != excluding)
        .map(|a| a.quantity as u64)
        .sum()
}

/// `total_stock - borrowed`. Negative when stock was lowered below what is out.
pub fn available_quantity(rs: &ResourceState, span: &Span, excluding: Option<Ulid>) -> i64 {
    let total = rs.total_stock().unwrap_or(0) as i64;
    total - borrowed_quantity(rs, span, excluding) as i64
}

// ── Previews ──────────────────────────────────────────────────────

/// Sub-windows of `query` not covered by any held allocation.
pub fn free_windows(rs: &ResourceState, query: &Span) -> Vec<Span> {
    let mut held: Vec<Span> = rs
        .overlapping(query)
        .map(|a| Span::new(a.span.start.max(query.start), a.span.end.min(query.end)))
        .collect();
    held.sort_by_key(|s| s.start);
    let held = merge_overlapping(&held);
    subtract_intervals(&[*query], &held)
}

/// Sweep line over allocation boundaries: remaining quantity of a pooled
/// item over each constant stretch of `query`. Adjacent stretches with the
/// same level are merged.
pub fn stock_profile(rs: &ResourceState, query: &Span) -> Vec<StockLevel> {
    let total = rs.total_stock().unwrap_or(0) as i64;

    let mut deltas: Vec<(Ms, i64)> = Vec::new();
    for a in rs.overlapping(query) {
        deltas.push((a.span.start.max(query.start), a.quantity as i64));
        deltas.push((a.span.end.min(query.end), -(a.quantity as i64)));
    }
    deltas.sort_by_key(|d| d.0);

    let mut levels: Vec<StockLevel> = Vec::new();
    let mut in_use: i64 = 0;
    let mut cursor = query.start;
    let mut i = 0;

    while i < deltas.len() {
        let time = deltas[i].0;
        if time > cursor {
            push_level(&mut levels, Span::new(cursor, time), total - in_use);
            cursor = time;
        }
        while i < deltas.len() && deltas[i].0 == time {
            in_use += deltas[i].1;
            i += 1;
        }
    }
    if cursor < query.end {
        push_level(&mut levels, Span::new(cursor, query.end), total - in_use);
    }

    levels
}

fn push_level(levels: &mut Vec<StockLevel>, span: Span, available: i64) {
    if let Some(last) = levels.last_mut()
        && last.available == available
        && last.span.end == span.start
    {
        last.span.end = span.end;
        return;
    }
    levels.push(StockLevel { span, available });
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Remove sorted, disjoint `to_remove` spans from sorted `base` spans.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
