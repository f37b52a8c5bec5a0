use chrono::{NaiveDate, NaiveDateTime, Timelike};

use crate::model::*;

use super::store::DayRules;
use super::EngineError;

// ── Slot Resolution ───────────────────────────────────────────────

/// Resolve the bookable slots of `service` on `date`.
///
/// Available rules are unioned, blocked rules and occupied intervals are
/// subtracted, and each remaining window is cut into back-to-back slots of
/// the service duration starting at the window's start. Tail time shorter
/// than the duration is dropped.
///
/// `occupied` must be sorted by start. `now` is business-local time; on the
/// current date a slot must start at least one full duration after `now`.
pub fn resolve_slots(
    rules: &DayRules,
    occupied: &[Span],
    service: &Service,
    date: NaiveDate,
    now: NaiveDateTime,
) -> Result<Vec<TimeSlot>, EngineError> {
    if !service.is_active {
        return Err(EngineError::InactiveService(service.id));
    }
    let today = now.date();
    if date < today {
        return Err(EngineError::PastDate(date));
    }
    if rules.available.is_empty() {
        return Ok(Vec::new());
    }

    let mut available = rules.available.clone();
    available.sort_by_key(|s| s.start);
    let mut free = merge_overlapping(&available);

    if !rules.blocked.is_empty() {
        free = free
            .iter()
            .flat_map(|window| subtract_many(*window, &rules.blocked))
            .collect();
    }

    if !occupied.is_empty() {
        free = subtract_intervals(&free, occupied);
    }

    let mut slots = quantize(&free, service.duration_minutes);

    if date == today {
        // Round a fractional second up so the lead is never short.
        let now_secs = now.time().num_seconds_from_midnight()
            + u32::from(now.time().nanosecond() > 0);
        let earliest = now_secs + service.duration_minutes * 60;
        slots.retain(|slot| slot.start_time.secs() >= earliest);
    }

    Ok(slots)
}

/// Cut each window into consecutive `duration_minutes` slots on a fixed grid.
pub fn quantize(windows: &[Span], duration_minutes: u32) -> Vec<TimeSlot> {
    let mut slots = Vec::new();
    if duration_minutes == 0 {
        return slots;
    }
    for window in windows {
        let mut cursor = window.start;
        while let Some(end) = cursor.plus_minutes(duration_minutes) {
            if end > window.end {
                break;
            }
            slots.push(TimeSlot {
                start_time: cursor,
                end_time: end,
            });
            cursor = end;
        }
    }
    slots
}

// ── Interval arithmetic ───────────────────────────────────────────

/// Remove `cut` from `base`: 0, 1 or 2 fragments, ascending.
pub fn subtract(base: Span, cut: Span) -> Vec<Span> {
    if !base.overlaps(&cut) {
        return vec![base];
    }
    let mut out = Vec::with_capacity(2);
    if let Some(left) = Span::try_new(base.start, cut.start) {
        out.push(left);
    }
    if let Some(right) = Span::try_new(cut.end, base.end) {
        out.push(right);
    }
    out
}

/// Apply `subtract` for every cut. Cuts may be unsorted and may overlap.
pub fn subtract_many(base: Span, cuts: &[Span]) -> Vec<Span> {
    let mut fragments = vec![base];
    for cut in cuts {
        if fragments.is_empty() {
            break;
        }
        fragments = fragments
            .into_iter()
            .flat_map(|f| subtract(f, *cut))
            .collect();
    }
    fragments
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

/// Sweep-line subtraction of a sorted cut list from a sorted, disjoint base list.
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

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn span(a: &str, b: &str) -> Span {
        Span::new(t(a), t(b))
    }

    fn service(duration_minutes: u32) -> Service {
        Service {
            id: Ulid::new(),
            name: "Consultation".into(),
            description: None,
            duration_minutes,
            price_cents: 0,
            is_active: true,
        }
    }

    // 2030-01-07 is a Monday.
    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()
    }

    fn long_ago() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2029, 12, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    }

    fn starts(slots: &[TimeSlot]) -> Vec<String> {
        slots
            .iter()
            .map(|s| s.start_time.to_string()[..5].to_string())
            .collect()
    }

    fn day(available: Vec<Span>, blocked: Vec<Span>) -> DayRules {
        DayRules { available, blocked }
    }

    // ── subtract ─────────────────────────────────────────

    #[test]
    fn subtract_disjoint_keeps_base() {
        assert_eq!(
            subtract(span("09:00", "10:00"), span("10:00", "11:00")),
            vec![span("09:00", "10:00")]
        );
    }

    #[test]
    fn subtract_left_edge() {
        assert_eq!(
            subtract(span("09:00", "12:00"), span("08:00", "10:00")),
            vec![span("10:00", "12:00")]
        );
    }

    #[test]
    fn subtract_right_edge() {
        assert_eq!(
            subtract(span("09:00", "12:00"), span("11:00", "13:00")),
            vec![span("09:00", "11:00")]
        );
    }

    #[test]
    fn subtract_contained_splits() {
        assert_eq!(
            subtract(span("09:00", "17:00"), span("12:00", "13:00")),
            vec![span("09:00", "12:00"), span("13:00", "17:00")]
        );
    }

    #[test]
    fn subtract_covering_removes() {
        assert!(subtract(span("09:00", "10:00"), span("09:00", "10:00")).is_empty());
        assert!(subtract(span("09:00", "10:00"), span("08:00", "11:00")).is_empty());
    }

    #[test]
    fn subtract_many_unsorted_overlapping_cuts() {
        let cuts = vec![
            span("15:00", "16:00"),
            span("10:00", "11:00"),
            span("10:30", "12:00"),
        ];
        assert_eq!(
            subtract_many(span("09:00", "17:00"), &cuts),
            vec![
                span("09:00", "10:00"),
                span("12:00", "15:00"),
                span("16:00", "17:00"),
            ]
        );
    }

    #[test]
    fn subtract_many_no_cuts() {
        assert_eq!(
            subtract_many(span("09:00", "10:00"), &[]),
            vec![span("09:00", "10:00")]
        );
    }

    // ── subtract_intervals ───────────────────────────────

    #[test]
    fn subtract_intervals_multiple_punches() {
        let base = vec![span("08:00", "18:00")];
        let remove = vec![
            span("09:00", "10:00"),
            span("12:00", "13:00"),
            span("16:00", "17:00"),
        ];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![
                span("08:00", "09:00"),
                span("10:00", "12:00"),
                span("13:00", "16:00"),
                span("17:00", "18:00"),
            ]
        );
    }

    #[test]
    fn subtract_intervals_spanning_two_bases() {
        let base = vec![span("09:00", "12:00"), span("13:00", "17:00")];
        let remove = vec![span("11:00", "14:00")];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![span("09:00", "11:00"), span("14:00", "17:00")]
        );
    }

    #[test]
    fn subtract_intervals_empty_inputs() {
        assert!(subtract_intervals(&[], &[span("09:00", "10:00")]).is_empty());
        let base = vec![span("09:00", "10:00")];
        assert_eq!(subtract_intervals(&base, &[]), base);
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![
            span("09:00", "12:00"),
            span("11:00", "14:00"),
            span("15:00", "16:00"),
        ];
        assert_eq!(
            merge_overlapping(&spans),
            vec![span("09:00", "14:00"), span("15:00", "16:00")]
        );
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![span("09:00", "10:00"), span("10:00", "11:00")];
        assert_eq!(merge_overlapping(&spans), vec![span("09:00", "11:00")]);
    }

    #[test]
    fn merge_empty() {
        assert!(merge_overlapping(&[]).is_empty());
    }

    // ── quantize ─────────────────────────────────────────

    #[test]
    fn quantize_discards_tail() {
        let slots = quantize(&[span("09:00", "11:45")], 60);
        assert_eq!(starts(&slots), vec!["09:00", "10:00"]);
        assert_eq!(slots[1].end_time, t("11:00"));
    }

    #[test]
    fn quantize_grid_restarts_per_window() {
        let slots = quantize(&[span("09:00", "10:00"), span("10:15", "11:15")], 30);
        assert_eq!(starts(&slots), vec!["09:00", "09:30", "10:15", "10:45"]);
    }

    #[test]
    fn quantize_window_shorter_than_duration() {
        assert!(quantize(&[span("09:00", "09:45")], 60).is_empty());
    }

    #[test]
    fn quantize_up_to_last_second_of_day() {
        let slots = quantize(&[span("22:00", "23:59:59")], 60);
        assert_eq!(starts(&slots), vec!["22:00"]);
    }

    // ── resolve_slots ────────────────────────────────────

    #[test]
    fn resolve_lunch_break_example() {
        let rules = day(vec![span("09:00", "17:00")], vec![span("12:00", "13:00")]);
        let slots = resolve_slots(&rules, &[], &service(60), monday(), long_ago()).unwrap();
        assert_eq!(
            starts(&slots),
            vec!["09:00", "10:00", "11:00", "13:00", "14:00", "15:00", "16:00"]
        );
    }

    #[test]
    fn resolve_removes_occupied_slot() {
        let rules = day(vec![span("09:00", "17:00")], vec![span("12:00", "13:00")]);
        let occupied = vec![span("10:00", "11:00")];
        let slots = resolve_slots(&rules, &occupied, &service(60), monday(), long_ago()).unwrap();
        assert_eq!(
            starts(&slots),
            vec!["09:00", "11:00", "13:00", "14:00", "15:00", "16:00"]
        );
    }

    #[test]
    fn resolve_no_rules_is_closed() {
        let slots = resolve_slots(&DayRules::default(), &[], &service(30), monday(), long_ago()).unwrap();
        assert!(slots.is_empty());
    }

    #[test]
    fn resolve_blocked_only_is_closed() {
        let rules = day(vec![], vec![span("09:00", "17:00")]);
        let slots = resolve_slots(&rules, &[], &service(30), monday(), long_ago()).unwrap();
        assert!(slots.is_empty());
    }

    #[test]
    fn resolve_overlapping_available_not_double_counted() {
        let rules = day(
            vec![span("09:00", "12:00"), span("10:00", "13:00"), span("09:00", "11:00")],
            vec![],
        );
        let slots = resolve_slots(&rules, &[], &service(60), monday(), long_ago()).unwrap();
        assert_eq!(starts(&slots), vec!["09:00", "10:00", "11:00", "12:00"]);
    }

    #[test]
    fn resolve_blocked_covers_whole_rule() {
        let rules = day(
            vec![span("09:00", "11:00"), span("14:00", "16:00")],
            vec![span("08:00", "12:00")],
        );
        let slots = resolve_slots(&rules, &[], &service(60), monday(), long_ago()).unwrap();
        assert_eq!(starts(&slots), vec!["14:00", "15:00"]);
    }

    #[test]
    fn resolve_occupied_off_grid() {
        // 10:30-11:00 removes the 10:00 slot; the next window's grid starts at 11:00.
        let rules = day(vec![span("09:00", "13:00")], vec![]);
        let occupied = vec![span("10:30", "11:00")];
        let slots = resolve_slots(&rules, &occupied, &service(60), monday(), long_ago()).unwrap();
        assert_eq!(starts(&slots), vec!["09:00", "11:00", "12:00"]);
    }

    #[test]
    fn resolve_inactive_service_fails() {
        let mut svc = service(60);
        svc.is_active = false;
        let rules = day(vec![span("09:00", "17:00")], vec![]);
        let result = resolve_slots(&rules, &[], &svc, monday(), long_ago());
        assert!(matches!(result, Err(EngineError::InactiveService(_))));
    }

    #[test]
    fn resolve_past_date_fails() {
        let rules = day(vec![span("09:00", "17:00")], vec![]);
        let now = monday().succ_opt().unwrap().and_hms_opt(0, 0, 0).unwrap();
        let result = resolve_slots(&rules, &[], &service(60), monday(), now);
        assert!(matches!(result, Err(EngineError::PastDate(d)) if d == monday()));
    }

    #[test]
    fn resolve_today_requires_full_duration_lead() {
        let rules = day(vec![span("09:00", "17:00")], vec![]);
        let now = monday().and_hms_opt(10, 0, 0).unwrap();
        let slots = resolve_slots(&rules, &[], &service(60), monday(), now).unwrap();
        // 10:00 starts exactly now; 11:00 is exactly one duration ahead.
        assert_eq!(starts(&slots), vec!["11:00", "12:00", "13:00", "14:00", "15:00", "16:00"]);
    }

    #[test]
    fn resolve_today_fractional_second_rounds_up() {
        let rules = day(vec![span("09:00", "12:00")], vec![]);
        let now = monday().and_hms_milli_opt(9, 0, 0, 1).unwrap();
        let slots = resolve_slots(&rules, &[], &service(60), monday(), now).unwrap();
        assert_eq!(starts(&slots), vec!["11:00"]);
    }

    #[test]
    fn resolve_today_late_evening_has_nothing() {
        let rules = day(vec![span("09:00", "23:30")], vec![]);
        let now = monday().and_hms_opt(23, 0, 0).unwrap();
        let slots = resolve_slots(&rules, &[], &service(60), monday(), now).unwrap();
        assert!(slots.is_empty());
    }

    #[test]
    fn resolve_slots_have_exact_duration_and_no_overlap() {
        let rules = day(
            vec![span("08:15", "12:40"), span("13:05", "18:00")],
            vec![span("09:50", "10:10"), span("15:00", "15:20")],
        );
        let occupied = vec![span("11:00", "11:25"), span("16:30", "17:00")];
        let svc = service(25);
        let slots = resolve_slots(&rules, &occupied, &svc, monday(), long_ago()).unwrap();
        assert!(!slots.is_empty());
        for pair in slots.windows(2) {
            assert!(pair[0].end_time <= pair[1].start_time);
        }
        for slot in &slots {
            assert_eq!(slot.end_time.minutes_since(slot.start_time), 25);
            let s = slot.span();
            assert!(rules.available.iter().any(|a| a.contains_span(&s)));
            assert!(rules.blocked.iter().all(|b| !b.overlaps(&s)));
            assert!(occupied.iter().all(|o| !o.overlaps(&s)));
        }
    }

    #[test]
    fn resolve_is_idempotent() {
        let rules = day(vec![span("09:00", "17:00")], vec![span("12:00", "12:30")]);
        let occupied = vec![span("14:00", "15:00")];
        let a = resolve_slots(&rules, &occupied, &service(45), monday(), long_ago()).unwrap();
        let b = resolve_slots(&rules, &occupied, &service(45), monday(), long_ago()).unwrap();
        assert_eq!(a, b);
    }
}
