mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod reports;
mod store;

pub use availability::{merge_overlapping, quantize, resolve_slots, subtract, subtract_intervals, subtract_many};
pub use conflict::{business_now, find_conflict, occupied_intervals};
pub use error::EngineError;
pub use queries::BookingFilter;
pub use reports::DEFAULT_RECENT_BOOKINGS;
pub use store::{DayRules, RuleStore};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock, RwLockReadGuard};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedDayBookings = Arc<RwLock<DayBookings>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One tenant's calendar: service catalog, weekly rules and per-date bookings.
pub struct Engine {
    pub(super) services: RwLock<HashMap<Ulid, Service>>,
    pub(super) rules: RwLock<RuleStore>,
    /// Per-date booking sets; the write lock on a date serializes admissions for it.
    pub(super) days: DashMap<NaiveDate, SharedDayBookings>,
    /// Reverse lookup: booking id → date
    pub(super) booking_dates: DashMap<Ulid, NaiveDate>,
    /// Mutations hold it shared from WAL append through apply; compaction takes it exclusively.
    pub(super) commit_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    tz: Tz,
}

// ── Event application (caller holds the relevant lock) ─────────

fn apply_to_catalog(services: &mut HashMap<Ulid, Service>, event: &Event) {
    match event {
        Event::ServiceCreated {
            id,
            name,
            description,
            duration_minutes,
            price_cents,
        } => {
            services.insert(
                *id,
                Service {
                    id: *id,
                    name: name.clone(),
                    description: description.clone(),
                    duration_minutes: *duration_minutes,
                    price_cents: *price_cents,
                    is_active: true,
                },
            );
        }
        Event::ServiceUpdated {
            id,
            name,
            description,
            duration_minutes,
            price_cents,
            is_active,
        } => {
            if let Some(svc) = services.get_mut(id) {
                svc.name = name.clone();
                svc.description = description.clone();
                svc.duration_minutes = *duration_minutes;
                svc.price_cents = *price_cents;
                svc.is_active = *is_active;
            }
        }
        _ => {}
    }
}

fn apply_to_rules(rules: &mut RuleStore, event: &Event) {
    match event {
        Event::RuleAdded {
            id,
            day_of_week,
            span,
            is_blocked,
        } => rules.insert(AvailabilityRule {
            id: *id,
            day_of_week: *day_of_week,
            span: *span,
            is_blocked: *is_blocked,
        }),
        Event::RuleRemoved { id, .. } => {
            rules.remove(id);
        }
        _ => {}
    }
}

/// Apply a single-date booking event. Cross-date reschedules go through `move_booking`.
fn apply_to_day(day: &mut DayBookings, event: &Event, booking_dates: &DashMap<Ulid, NaiveDate>) {
    match event {
        Event::BookingAdmitted {
            id,
            user_id,
            service_id,
            date,
            span,
            created_at,
        } => {
            day.insert_booking(Booking {
                id: *id,
                user_id: *user_id,
                service_id: *service_id,
                date: *date,
                span: *span,
                status: BookingStatus::Pending,
                created_at: *created_at,
            });
            booking_dates.insert(*id, *date);
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(b) = day.get_mut(*id) {
                b.status = *status;
            }
        }
        Event::BookingRescheduled { id, span, .. } => {
            // Same-date move: reinsert to keep start order.
            if let Some(mut b) = day.remove_booking(*id) {
                b.span = *span;
                day.insert_booking(b);
            }
        }
        _ => {}
    }
}

fn move_booking(
    from: &mut DayBookings,
    to: &mut DayBookings,
    id: Ulid,
    span: Span,
    booking_dates: &DashMap<Ulid, NaiveDate>,
) {
    if let Some(mut b) = from.remove_booking(id) {
        b.date = to.date;
        b.span = span;
        to.insert_booking(b);
        booking_dates.insert(id, to.date);
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, tz: Tz) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        // Replay into owned structures, then publish.
        let mut services = HashMap::new();
        let mut rules = RuleStore::new();
        let mut days: HashMap<NaiveDate, DayBookings> = HashMap::new();
        let booking_dates = DashMap::new();

        for event in &events {
            match event {
                Event::ServiceCreated { .. } | Event::ServiceUpdated { .. } => {
                    apply_to_catalog(&mut services, event);
                }
                Event::RuleAdded { .. } | Event::RuleRemoved { .. } => {
                    apply_to_rules(&mut rules, event);
                }
                Event::BookingAdmitted { date, .. } => {
                    let day = days.entry(*date).or_insert_with(|| DayBookings::new(*date));
                    apply_to_day(day, event, &booking_dates);
                }
                Event::BookingStatusChanged { date, .. } => {
                    if let Some(day) = days.get_mut(date) {
                        apply_to_day(day, event, &booking_dates);
                    }
                }
                Event::BookingRescheduled {
                    id,
                    from_date,
                    to_date,
                    span,
                } => {
                    if from_date == to_date {
                        if let Some(day) = days.get_mut(from_date) {
                            apply_to_day(day, event, &booking_dates);
                        }
                    } else if let Some(mut from) = days.remove(from_date) {
                        let to = days.entry(*to_date).or_insert_with(|| DayBookings::new(*to_date));
                        move_booking(&mut from, to, *id, *span, &booking_dates);
                        days.insert(*from_date, from);
                    }
                }
            }
        }

        tracing::debug!(
            "replayed {} events: {} services, {} rules, {} booking dates",
            events.len(),
            services.len(),
            rules.len(),
            days.len()
        );

        Ok(Self {
            services: RwLock::new(services),
            rules: RwLock::new(rules),
            days: days
                .into_iter()
                .map(|(date, day)| (date, Arc::new(RwLock::new(day))))
                .collect(),
            booking_dates,
            commit_gate: RwLock::new(()),
            wal_tx,
            tz,
        })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Current time in the business timezone.
    pub fn now(&self) -> NaiveDateTime {
        business_now(self.tz)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) async fn commit_permit(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_gate.read().await
    }

    pub(super) fn get_day(&self, date: &NaiveDate) -> Option<SharedDayBookings> {
        self.days.get(date).map(|e| e.value().clone())
    }

    pub(super) fn day_or_create(&self, date: NaiveDate) -> SharedDayBookings {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayBookings::new(date))))
            .value()
            .clone()
    }

    /// WAL-append + apply for an event confined to one date.
    pub(super) async fn persist_and_apply(
        &self,
        day: &mut DayBookings,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_day(day, event, &self.booking_dates);
        Ok(())
    }

    /// Lookup booking → date, acquire that date's write lock.
    /// Retries if a concurrent reschedule moved the booking in between.
    pub(super) async fn resolve_booking_write(
        &self,
        id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<DayBookings>, EngineError> {
        for _ in 0..3 {
            let date = *self
                .booking_dates
                .get(id)
                .ok_or(EngineError::NotFound(*id))?
                .value();
            let day = self.get_day(&date).ok_or(EngineError::NotFound(*id))?;
            let guard = day.write_owned().await;
            if guard.get(*id).is_some() {
                return Ok(guard);
            }
        }
        Err(EngineError::NotFound(*id))
    }
}
