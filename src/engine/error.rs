use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{BookingStatus, TimeOfDay};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Service exists but is not bookable.
    InactiveService(Ulid),
    /// Service is missing or inactive at admission time.
    UnknownService(Ulid),
    PastDate(NaiveDate),
    /// Requested start is not among the resolved slots.
    SlotUnavailable {
        date: NaiveDate,
        start: TimeOfDay,
    },
    /// Lost the admission race to the given booking.
    SlotTaken(Ulid),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    /// Cancelled bookings can't be moved.
    BookingCancelled(Ulid),
    InvalidRule(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) | EngineError::UnknownService(_) => "02000",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::InactiveService(_) => "55000",
            EngineError::PastDate(_) => "22008",
            EngineError::SlotUnavailable { .. } => "22023",
            EngineError::SlotTaken(_) => "40001",
            EngineError::InvalidTransition { .. } | EngineError::BookingCancelled(_) => "55000",
            EngineError::InvalidRule(_) => "22023",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InactiveService(id) => write!(f, "service {id} is not active"),
            EngineError::UnknownService(id) => {
                write!(f, "service {id} not found or not available")
            }
            EngineError::PastDate(date) => write!(f, "date {date} is in the past"),
            EngineError::SlotUnavailable { date, start } => {
                write!(f, "no available slot starting at {start} on {date}; re-query availability")
            }
            EngineError::SlotTaken(id) => {
                write!(f, "slot already taken by booking {id}; re-query availability")
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid booking status transition: {from} -> {to}")
            }
            EngineError::BookingCancelled(id) => write!(f, "booking {id} is cancelled"),
            EngineError::InvalidRule(msg) => write!(f, "invalid rule: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
