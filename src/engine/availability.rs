use crate::model::*;

// ── Free-slot algorithm ───────────────────────────────────────────

/// Free gaps of `window` not covered by any of `existing`.
///
/// `existing` may be unsorted and overlapping; spans outside the window are
/// ignored and the rest clipped to it. Returns ascending, disjoint, non-empty
/// spans: `[window]` when nothing is booked, `[]` when fully covered.
pub fn free_slots(existing: &[Span], window: &Span) -> Vec<Span> {
    let mut clipped: Vec<Span> = existing.iter().filter_map(|s| s.clip(window)).collect();
    if clipped.is_empty() {
        return vec![*window];
    }
    clipped.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&clipped);
    subtract_intervals(&[*window], &busy)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Remove sorted, disjoint `to_remove` spans from sorted, disjoint `base`.
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
