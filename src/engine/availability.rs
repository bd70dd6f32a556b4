use tracing::error;

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────
//
// Every claim contributes a weighted span: a capacity-holding booking
// weighs 1 slot, a blocked/maintenance window weighs
// total_slots − slots_open. Free capacity over a window is
// total_slots minus the peak concurrent weight.

/// Collect weighted claim spans overlapping the query, clamped to it.
pub fn collect_loads(spot: &SpotState, query: &Span) -> Vec<(Span, u32)> {
    let mut loads: Vec<(Span, u32)> = Vec::new();
    for claim in spot.overlapping(query) {
        let weight = claim.load(spot.total_slots);
        if weight == 0 {
            continue;
        }
        loads.push((claim.span.clamped_to(query), weight));
    }
    loads.sort_by_key(|(s, _)| s.start);
    loads
}

/// Sweep-line: maximum concurrent weight across the given spans.
pub fn peak_load(loads: &[(Span, u32)]) -> u32 {
    if loads.is_empty() {
        return 0;
    }

    // +weight at start, -weight at end; ends sort before starts at the
    // same instant so adjacent spans don't stack (half-open intervals).
    let mut events: Vec<(Ms, i64)> = Vec::with_capacity(loads.len() * 2);
    for (span, weight) in loads {
        events.push((span.start, *weight as i64));
        events.push((span.end, -(*weight as i64)));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut peak: i64 = 0;
    let mut count: i64 = 0;
    for (_, delta) in &events {
        count += delta;
        if count > peak {
            peak = count;
        }
    }
    peak as u32
}

/// Free capacity for a window: total_slots − peak load. May be negative
/// when the owner shrank total_slots under committed bookings; callers
/// clamp, we keep the raw value for the bookkeeping check.
pub fn free_capacity(spot: &SpotState, query: &Span) -> i64 {
    let loads = collect_loads(spot, query);
    spot.total_slots as i64 - peak_load(&loads) as i64
}

/// Free capacity clamped at 0. A negative intermediate is a
/// bookkeeping signal and gets logged, never surfaced.
pub fn free_capacity_clamped(spot: &SpotState, query: &Span) -> u32 {
    let free = free_capacity(spot, query);
    if free < 0 {
        error!(
            spot_id = %spot.id,
            free,
            total_slots = spot.total_slots,
            "negative free capacity — committed load exceeds total_slots"
        );
        return 0;
    }
    free as u32
}

/// Sweep-line: time ranges where concurrent weight ≥ threshold.
/// Returns sorted, merged spans.
pub fn saturated_spans(loads: &[(Span, u32)], threshold: u32) -> Vec<Span> {
    if loads.is_empty() || threshold == 0 {
        return Vec::new();
    }

    let mut events: Vec<(Ms, i64)> = Vec::with_capacity(loads.len() * 2);
    for (span, weight) in loads {
        events.push((span.start, *weight as i64));
        events.push((span.end, -(*weight as i64)));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let threshold = threshold as i64;
    let mut result = Vec::new();
    let mut count: i64 = 0;
    let mut sat_start: Option<Ms> = None;

    for (time, delta) in &events {
        count += delta;
        if count >= threshold && sat_start.is_none() {
            sat_start = Some(*time);
        } else if count < threshold
            && let Some(start) = sat_start.take()
            && *time > start
        {
            result.push(Span::new(start, *time));
        }
    }

    merge_overlapping(&result)
}

/// Sub-windows of `query` where at least `min_slots` slots are free —
/// the "soonest next available" query. Empty when min_slots exceeds
/// the spot's capacity.
pub fn free_windows(spot: &SpotState, query: &Span, min_slots: u32) -> Vec<Span> {
    if min_slots == 0 || min_slots > spot.total_slots {
        return Vec::new();
    }
    let loads = collect_loads(spot, query);
    // Free < min_slots ⟺ load > total − min_slots.
    let saturated = saturated_spans(&loads, spot.total_slots - min_slots + 1);
    subtract_spans(&[*query], &saturated)
}

/// Merge sorted overlapping/adjacent spans into disjoint spans.
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

/// Subtract sorted disjoint `to_remove` spans from sorted `base` spans.
pub fn subtract_spans(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const H: Ms = 3_600_000;

    fn make_spot(total_slots: u32, claims: Vec<Claim>) -> SpotState {
        let mut spot = SpotState::new(Ulid::new(), Ulid::new(), None, total_slots, 100, 0.0, 0.0);
        for c in claims {
            spot.insert_claim(c);
        }
        spot
    }

    fn booking(start: Ms, end: Ms) -> Claim {
        booking_with_status(start, end, BookingStatus::Confirmed)
    }

    fn booking_with_status(start: Ms, end: Ms, status: BookingStatus) -> Claim {
        Claim {
            id: Ulid::new(),
            span: Span::new(start, end),
            kind: ClaimKind::Booking(BookingDetail {
                guest_id: Ulid::new(),
                vehicle_id: Ulid::new(),
                total_cost_cents: 0,
                status,
                payment: PaymentStatus::Pending,
                qr_code: String::new(),
                pin: 0,
                pay_deadline: 0,
            }),
        }
    }

    fn block(start: Ms, end: Ms, status: BlockStatus, slots_open: u32) -> Claim {
        Claim {
            id: Ulid::new(),
            span: Span::new(start, end),
            kind: ClaimKind::Block {
                status,
                slots_open,
                reason: None,
            },
        }
    }

    // ── subtract_spans ────────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        assert_eq!(subtract_spans(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 250)];
        assert!(subtract_spans(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![Span::new(100, 300)];
        let remove = vec![Span::new(150, 200)];
        assert_eq!(
            subtract_spans(&base, &remove),
            vec![Span::new(100, 150), Span::new(200, 300)]
        );
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![Span::new(0, 1000)];
        let remove = vec![Span::new(100, 200), Span::new(400, 500), Span::new(800, 900)];
        assert_eq!(
            subtract_spans(&base, &remove),
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![Span::new(100, 300), Span::new(200, 400), Span::new(500, 600)];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(100, 400), Span::new(500, 600)]
        );
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(100, 300)]);
    }

    // ── peak_load ────────────────────────────────────────

    #[test]
    fn peak_load_disjoint() {
        let loads = vec![(Span::new(0, 100), 1), (Span::new(200, 300), 1)];
        assert_eq!(peak_load(&loads), 1);
    }

    #[test]
    fn peak_load_stacked() {
        let loads = vec![
            (Span::new(0, 100), 1),
            (Span::new(50, 150), 1),
            (Span::new(75, 90), 1),
        ];
        assert_eq!(peak_load(&loads), 3);
    }

    #[test]
    fn peak_load_adjacent_do_not_stack() {
        // [0,100) and [100,200) share no instant under half-open semantics
        let loads = vec![(Span::new(0, 100), 1), (Span::new(100, 200), 1)];
        assert_eq!(peak_load(&loads), 1);
    }

    #[test]
    fn peak_load_weighted() {
        let loads = vec![(Span::new(0, 100), 3), (Span::new(50, 150), 2)];
        assert_eq!(peak_load(&loads), 5);
    }

    #[test]
    fn peak_load_empty() {
        assert_eq!(peak_load(&[]), 0);
    }

    // ── free_capacity ────────────────────────────────────

    #[test]
    fn free_capacity_empty_spot() {
        let spot = make_spot(3, vec![]);
        assert_eq!(free_capacity(&spot, &Span::new(0, 24 * H)), 3);
    }

    #[test]
    fn free_capacity_counts_overlapping_bookings() {
        // total_slots=2, one confirmed booking 9-17; window 12-14 has 1 free
        let spot = make_spot(2, vec![booking(9 * H, 17 * H)]);
        assert_eq!(free_capacity(&spot, &Span::new(12 * H, 14 * H)), 1);
    }

    #[test]
    fn free_capacity_ignores_terminal_bookings() {
        let spot = make_spot(1, vec![
            booking_with_status(9 * H, 17 * H, BookingStatus::Cancelled),
            booking_with_status(9 * H, 17 * H, BookingStatus::Completed),
        ]);
        assert_eq!(free_capacity(&spot, &Span::new(9 * H, 17 * H)), 1);
    }

    #[test]
    fn free_capacity_pending_holds_slot() {
        let spot = make_spot(1, vec![booking_with_status(9 * H, 17 * H, BookingStatus::Pending)]);
        assert_eq!(free_capacity(&spot, &Span::new(10 * H, 11 * H)), 0);
    }

    #[test]
    fn free_capacity_block_reduces() {
        // 4 slots, maintenance closes all but 1 from 10 to 12
        let spot = make_spot(4, vec![block(10 * H, 12 * H, BlockStatus::Maintenance, 1)]);
        assert_eq!(free_capacity(&spot, &Span::new(10 * H, 12 * H)), 1);
        assert_eq!(free_capacity(&spot, &Span::new(13 * H, 14 * H)), 4);
    }

    #[test]
    fn free_capacity_available_marker_no_effect() {
        let spot = make_spot(2, vec![block(0, 24 * H, BlockStatus::Available, 2)]);
        assert_eq!(free_capacity(&spot, &Span::new(0, 24 * H)), 2);
    }

    #[test]
    fn free_capacity_block_and_bookings_accumulate() {
        // 3 slots; blocked down to 2, plus 2 bookings → peak 3, free 0
        let spot = make_spot(3, vec![
            block(9 * H, 17 * H, BlockStatus::Blocked, 2),
            booking(10 * H, 12 * H),
            booking(11 * H, 13 * H),
        ]);
        assert_eq!(free_capacity(&spot, &Span::new(11 * H, 12 * H)), 0);
    }

    #[test]
    fn free_capacity_negative_when_overcommitted() {
        // Owner shrank capacity under two live bookings
        let mut spot = make_spot(2, vec![booking(0, 100), booking(0, 100)]);
        spot.total_slots = 1;
        assert_eq!(free_capacity(&spot, &Span::new(0, 100)), -1);
        assert_eq!(free_capacity_clamped(&spot, &Span::new(0, 100)), 0);
    }

    #[test]
    fn free_capacity_adjacent_bookings_one_slot() {
        // [9,10) and [10,11) coexist on a 1-slot spot
        let spot = make_spot(1, vec![booking(9 * H, 10 * H), booking(10 * H, 11 * H)]);
        assert_eq!(free_capacity(&spot, &Span::new(9 * H, 11 * H)), 0);
        assert_eq!(free_capacity(&spot, &Span::new(10 * H, 10 * H + 1)), 0);
        // but no instant sees both at once
        let loads = collect_loads(&spot, &Span::new(9 * H, 11 * H));
        assert_eq!(peak_load(&loads), 1);
    }

    // ── saturated_spans / free_windows ───────────────────

    #[test]
    fn saturated_spans_basic() {
        let loads = vec![(Span::new(0, 100), 1), (Span::new(50, 150), 1)];
        assert_eq!(saturated_spans(&loads, 2), vec![Span::new(50, 100)]);
    }

    #[test]
    fn saturated_spans_threshold_one_merges() {
        let loads = vec![(Span::new(0, 100), 1), (Span::new(100, 300), 1)];
        assert_eq!(saturated_spans(&loads, 1), vec![Span::new(0, 300)]);
    }

    #[test]
    fn saturated_spans_empty() {
        assert!(saturated_spans(&[], 5).is_empty());
    }

    #[test]
    fn free_windows_fragments_around_bookings() {
        let spot = make_spot(1, vec![booking(10 * H, 11 * H)]);
        let free = free_windows(&spot, &Span::new(9 * H, 12 * H), 1);
        assert_eq!(free, vec![Span::new(9 * H, 10 * H), Span::new(11 * H, 12 * H)]);
    }

    #[test]
    fn free_windows_min_slots_above_capacity() {
        let spot = make_spot(2, vec![]);
        assert!(free_windows(&spot, &Span::new(0, 100), 3).is_empty());
    }

    #[test]
    fn free_windows_partial_saturation() {
        // 2 slots, one booking 10-14: window still free for 1 slot all day,
        // free for 2 slots only outside the booking
        let spot = make_spot(2, vec![booking(10 * H, 14 * H)]);
        assert_eq!(
            free_windows(&spot, &Span::new(0, 24 * H), 1),
            vec![Span::new(0, 24 * H)]
        );
        assert_eq!(
            free_windows(&spot, &Span::new(0, 24 * H), 2),
            vec![Span::new(0, 10 * H), Span::new(14 * H, 24 * H)]
        );
    }

    #[test]
    fn free_windows_block_closes_whole_window() {
        let spot = make_spot(1, vec![block(0, 24 * H, BlockStatus::Maintenance, 0)]);
        assert!(free_windows(&spot, &Span::new(0, 24 * H), 1).is_empty());
    }
}
