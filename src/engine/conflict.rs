use chrono::{NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::*;

use super::availability::merge_overlapping;
use super::EngineError;

/// Current wall-clock time in the business timezone.
pub fn business_now(tz: Tz) -> NaiveDateTime {
    Utc::now().with_timezone(&tz).naive_local()
}

/// Merged, sorted intervals claimed by pending/confirmed bookings.
pub fn occupied_intervals(day: &DayBookings) -> Vec<Span> {
    let occupied: Vec<Span> = day
        .bookings
        .iter()
        .filter(|b| b.status.occupies())
        .map(|b| b.span)
        .collect();
    // `bookings` is kept sorted by start.
    merge_overlapping(&occupied)
}

/// First occupying booking overlapping `span`, other than `exclude`.
pub fn find_conflict(day: &DayBookings, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    day.occupying(span)
        .find(|b| Some(b.id) != exclude)
        .map(|b| b.id)
}

pub(crate) fn check_no_conflict(
    day: &DayBookings,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(day, span, exclude) {
        Some(id) => Err(EngineError::SlotTaken(id)),
        None => Ok(()),
    }
}

pub(crate) fn validate_horizon(date: NaiveDate, now: NaiveDateTime) -> Result<(), EngineError> {
    use crate::limits::MAX_BOOKING_HORIZON_DAYS;
    if (date - now.date()).num_days() > MAX_BOOKING_HORIZON_DAYS {
        return Err(EngineError::LimitExceeded("date too far in the future"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()
    }

    fn day_with(bookings: &[(&str, &str, BookingStatus)]) -> (DayBookings, Vec<Ulid>) {
        let mut day = DayBookings::new(date());
        let mut ids = Vec::new();
        for (start, end, status) in bookings {
            let id = Ulid::new();
            ids.push(id);
            day.insert_booking(Booking {
                id,
                user_id: Ulid::new(),
                service_id: Ulid::new(),
                date: date(),
                span: Span::new(t(start), t(end)),
                status: *status,
                created_at: date().and_hms_opt(0, 0, 0).unwrap(),
            });
        }
        (day, ids)
    }

    #[test]
    fn occupied_merges_and_skips_cancelled() {
        let (day, _) = day_with(&[
            ("09:00", "10:00", BookingStatus::Confirmed),
            ("10:00", "11:00", BookingStatus::Pending),
            ("13:00", "14:00", BookingStatus::Cancelled),
            ("15:00", "15:30", BookingStatus::Pending),
        ]);
        assert_eq!(
            occupied_intervals(&day),
            vec![
                Span::new(t("09:00"), t("11:00")),
                Span::new(t("15:00"), t("15:30")),
            ]
        );
    }

    #[test]
    fn occupied_empty_day() {
        assert!(occupied_intervals(&DayBookings::new(date())).is_empty());
    }

    #[test]
    fn conflict_detected_and_reported() {
        let (day, ids) = day_with(&[("10:00", "11:00", BookingStatus::Pending)]);
        let span = Span::new(t("10:30"), t("11:30"));
        assert!(matches!(
            check_no_conflict(&day, &span, None),
            Err(EngineError::SlotTaken(id)) if id == ids[0]
        ));
    }

    #[test]
    fn adjacent_is_not_conflict() {
        let (day, _) = day_with(&[("10:00", "11:00", BookingStatus::Confirmed)]);
        assert!(check_no_conflict(&day, &Span::new(t("11:00"), t("12:00")), None).is_ok());
        assert!(check_no_conflict(&day, &Span::new(t("09:00"), t("10:00")), None).is_ok());
    }

    #[test]
    fn cancelled_is_not_conflict() {
        let (day, _) = day_with(&[("10:00", "11:00", BookingStatus::Cancelled)]);
        assert!(find_conflict(&day, &Span::new(t("10:00"), t("11:00")), None).is_none());
    }

    #[test]
    fn excluded_booking_ignored() {
        let (day, ids) = day_with(&[("10:00", "11:00", BookingStatus::Pending)]);
        let span = Span::new(t("10:00"), t("11:00"));
        assert!(find_conflict(&day, &span, Some(ids[0])).is_none());
    }

    #[test]
    fn horizon_limit() {
        let now = date().and_hms_opt(9, 0, 0).unwrap();
        assert!(validate_horizon(date(), now).is_ok());
        let far = date() + chrono::Days::new(10_000);
        assert!(matches!(
            validate_horizon(far, now),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
