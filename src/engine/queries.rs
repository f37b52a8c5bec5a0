use chrono::{NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::model::*;

use super::availability::resolve_slots;
use super::conflict::{self, validate_horizon};
use super::store::DayRules;
use super::{Engine, EngineError, SharedDayBookings};

/// Optional filters for `list_bookings`. All set fields must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub user_id: Option<Ulid>,
    pub service_id: Option<Ulid>,
    pub date: Option<NaiveDate>,
}

impl BookingFilter {
    fn matches(&self, b: &Booking) -> bool {
        self.user_id.is_none_or(|u| b.user_id == u)
            && self.service_id.is_none_or(|s| b.service_id == s)
            && self.date.is_none_or(|d| b.date == d)
    }
}

impl Engine {
    pub async fn get_service(&self, id: &Ulid) -> Option<Service> {
        self.services.read().await.get(id).cloned()
    }

    /// Services ordered by id (creation order).
    pub async fn list_services(&self, active_only: bool) -> Vec<Service> {
        let services = self.services.read().await;
        let mut out: Vec<Service> = services
            .values()
            .filter(|s| !active_only || s.is_active)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub async fn list_rules(&self) -> Vec<AvailabilityRule> {
        self.rules.read().await.all()
    }

    pub async fn rules_for_day(&self, day: DayOfWeek) -> DayRules {
        self.rules.read().await.rules_for_day(day)
    }

    /// Merged intervals held by live bookings on `date`.
    pub async fn occupied_intervals(&self, date: NaiveDate) -> Vec<Span> {
        self.occupied_excluding(date, None).await
    }

    async fn occupied_excluding(&self, date: NaiveDate, exclude: Option<Ulid>) -> Vec<Span> {
        let Some(day) = self.get_day(&date) else {
            return Vec::new();
        };
        let guard = day.read().await;
        match exclude {
            None => conflict::occupied_intervals(&guard),
            Some(id) => {
                let mut without = guard.clone();
                without.remove_booking(id);
                conflict::occupied_intervals(&without)
            }
        }
    }

    /// Read the weekday's rules and the date's occupied intervals.
    async fn snapshot(&self, date: NaiveDate, exclude: Option<Ulid>) -> (DayRules, Vec<Span>) {
        let weekday = day_of_week(date);
        tokio::join!(
            self.rules_for_day(weekday),
            self.occupied_excluding(date, exclude)
        )
    }

    pub(super) async fn resolve_for(
        &self,
        service: &Service,
        date: NaiveDate,
        now: NaiveDateTime,
        exclude: Option<Ulid>,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let (rules, occupied) = self.snapshot(date, exclude).await;
        resolve_slots(&rules, &occupied, service, date, now)
    }

    /// Bookable slots for `service_id` on `date`, as seen at `now`.
    pub async fn available_slots(
        &self,
        service_id: Ulid,
        date: NaiveDate,
        now: NaiveDateTime,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let service = self
            .get_service(&service_id)
            .await
            .ok_or(EngineError::UnknownService(service_id))?;
        validate_horizon(date, now)?;
        let start = std::time::Instant::now();
        let result = self.resolve_for(&service, date, now, None).await;
        metrics::histogram!(crate::observability::SLOT_RESOLUTION_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());
        result
    }

    pub async fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        let date = *self.booking_dates.get(id)?.value();
        let day = self.get_day(&date)?;
        let guard = day.read().await;
        guard.get(*id).cloned()
    }

    /// Bookings matching `filter`, ordered by date then start time.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Vec<Booking> {
        let days: Vec<SharedDayBookings> = match filter.date {
            Some(date) => self.get_day(&date).into_iter().collect(),
            None => {
                let mut all: Vec<(NaiveDate, SharedDayBookings)> = self
                    .days
                    .iter()
                    .map(|e| (*e.key(), e.value().clone()))
                    .collect();
                all.sort_by_key(|(date, _)| *date);
                all.into_iter().map(|(_, day)| day).collect()
            }
        };

        let mut out = Vec::new();
        for day in days {
            let guard = day.read().await;
            out.extend(guard.bookings.iter().filter(|b| filter.matches(b)).cloned());
        }
        out
    }
}
