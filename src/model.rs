use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Seconds since midnight in the business timezone.
pub type Secs = u32;

pub const SECS_PER_DAY: Secs = 86_400;

/// 0 = Monday .. 6 = Sunday.
pub type DayOfWeek = u8;

pub fn day_of_week(date: NaiveDate) -> DayOfWeek {
    date.weekday().num_days_from_monday() as DayOfWeek
}

/// Wall-clock time of day, second precision, always `< 24:00:00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(Secs);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);

    pub fn from_secs(secs: Secs) -> Option<Self> {
        (secs < SECS_PER_DAY).then_some(Self(secs))
    }

    pub fn from_hms(hour: u32, minute: u32, second: u32) -> Option<Self> {
        if hour >= 24 || minute >= 60 || second >= 60 {
            return None;
        }
        Some(Self(hour * 3600 + minute * 60 + second))
    }

    pub fn secs(self) -> Secs {
        self.0
    }

    /// `None` when the result would reach or pass midnight.
    pub fn plus_minutes(self, minutes: u32) -> Option<Self> {
        minutes
            .checked_mul(60)
            .and_then(|d| self.0.checked_add(d))
            .and_then(Self::from_secs)
    }

    /// Whole minutes from `earlier` to `self` (negative if `earlier` is later).
    pub fn minutes_since(self, earlier: TimeOfDay) -> i64 {
        (self.0 as i64 - earlier.0 as i64) / 60
    }
}

impl From<NaiveTime> for TimeOfDay {
    fn from(t: NaiveTime) -> Self {
        Self(t.num_seconds_from_midnight())
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (h, m, s) = (self.0 / 3600, (self.0 / 60) % 60, self.0 % 60);
        write!(f, "{h:02}:{m:02}:{s:02}")
    }
}

/// Accepts `HH:MM` and `HH:MM:SS`.
impl FromStr for TimeOfDay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = match s.matches(':').count() {
            1 => NaiveTime::parse_from_str(s, "%H:%M"),
            2 => NaiveTime::parse_from_str(s, "%H:%M:%S"),
            _ => return Err(format!("bad time: {s} (expected HH:MM or HH:MM:SS)")),
        };
        let t = parsed.map_err(|e| format!("bad time: {s}: {e}"))?;
        if t.nanosecond() >= 1_000_000_000 {
            return Err(format!("bad time: {s}: leap seconds not accepted"));
        }
        Ok(t.into())
    }
}

/// Half-open interval `[start, end)` within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl Span {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Non-empty spans only.
    pub fn try_new(start: TimeOfDay, end: TimeOfDay) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_secs(&self) -> Secs {
        self.end.secs() - self.start.secs()
    }

    pub fn duration_minutes(&self) -> u32 {
        self.duration_secs() / 60
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A recurring weekly statement of availability (or blockage) for one weekday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: Ulid,
    pub day_of_week: DayOfWeek,
    pub span: Span,
    pub is_blocked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    /// Only pending and confirmed bookings claim time.
    pub fn occupies(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Pending, BookingStatus::Confirmed)
                | (BookingStatus::Pending, BookingStatus::Cancelled)
                | (BookingStatus::Confirmed, BookingStatus::Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub status: BookingStatus,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    /// Slot size for this service, 1..=1440.
    pub duration_minutes: u32,
    pub price_cents: u64,
    pub is_active: bool,
}

/// Partial service update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub duration_minutes: Option<u32>,
    pub price_cents: Option<u64>,
    pub is_active: Option<bool>,
}

impl ServicePatch {
    pub fn is_empty(&self) -> bool {
        *self == ServicePatch::default()
    }

    pub fn apply(&self, service: &Service) -> Service {
        Service {
            id: service.id,
            name: self.name.clone().unwrap_or_else(|| service.name.clone()),
            description: self.description.clone().or_else(|| service.description.clone()),
            duration_minutes: self.duration_minutes.unwrap_or(service.duration_minutes),
            price_cents: self.price_cents.unwrap_or(service.price_cents),
            is_active: self.is_active.unwrap_or(service.is_active),
        }
    }
}

/// A bookable window produced by slot resolution. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
}

impl TimeSlot {
    pub fn span(&self) -> Span {
        Span::new(self.start_time, self.end_time)
    }
}

// ── Reports ──────────────────────────────────────────────

/// Tenant-wide booking counts. Revenue counts confirmed bookings at the
/// service's current price.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingStats {
    pub total_services: u64,
    pub total_bookings: u64,
    pub pending_bookings: u64,
    pub confirmed_bookings: u64,
    pub cancelled_bookings: u64,
    pub total_revenue_cents: u64,
    /// Bookings dated on or after the first of the current month.
    pub bookings_this_month: u64,
    pub revenue_this_month_cents: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRevenue {
    pub service_id: Ulid,
    pub service_name: String,
    pub confirmed_bookings: u64,
    pub revenue_cents: u64,
}

/// A booking joined with the service it was made for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDetails {
    pub booking: Booking,
    pub service_name: String,
    pub price_cents: u64,
}

/// All bookings on one calendar date, cancelled ones included.
#[derive(Debug, Clone)]
pub struct DayBookings {
    pub date: NaiveDate,
    /// Sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl DayBookings {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Pending/confirmed bookings whose span overlaps `query`.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn occupying(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.status.occupies() && b.span.end > query.start)
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }
}

/// Flat event records; this is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceCreated {
        id: Ulid,
        name: String,
        description: Option<String>,
        duration_minutes: u32,
        price_cents: u64,
    },
    /// Carries the full post-update state.
    ServiceUpdated {
        id: Ulid,
        name: String,
        description: Option<String>,
        duration_minutes: u32,
        price_cents: u64,
        is_active: bool,
    },
    RuleAdded {
        id: Ulid,
        day_of_week: DayOfWeek,
        span: Span,
        is_blocked: bool,
    },
    RuleRemoved {
        id: Ulid,
        day_of_week: DayOfWeek,
    },
    BookingAdmitted {
        id: Ulid,
        user_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        span: Span,
        created_at: NaiveDateTime,
    },
    BookingStatusChanged {
        id: Ulid,
        date: NaiveDate,
        status: BookingStatus,
    },
    BookingRescheduled {
        id: Ulid,
        from_date: NaiveDate,
        to_date: NaiveDate,
        span: Span,
    },
}
