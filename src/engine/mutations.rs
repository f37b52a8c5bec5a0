use chrono::{NaiveDate, NaiveDateTime};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, validate_horizon};
use super::{apply_to_catalog, apply_to_rules, move_booking, Engine, EngineError, WalCommand};

fn validate_service_fields(
    name: &str,
    description: Option<&str>,
    duration_minutes: u32,
) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::InvalidRule("service name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("service name too long"));
    }
    if description.is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        return Err(EngineError::LimitExceeded("service description too long"));
    }
    if duration_minutes == 0 || duration_minutes > MAX_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("duration_minutes must be between 1 and 1440"));
    }
    Ok(())
}

fn record_admission(outcome: &'static str) {
    metrics::counter!(observability::ADMISSIONS_TOTAL, "outcome" => outcome).increment(1);
}

impl Engine {
    // ── Service catalog ──────────────────────────────────────

    pub async fn create_service(
        &self,
        id: Ulid,
        name: String,
        description: Option<String>,
        duration_minutes: u32,
        price_cents: u64,
    ) -> Result<Service, EngineError> {
        validate_service_fields(&name, description.as_deref(), duration_minutes)?;
        let _permit = self.commit_permit().await;
        let mut services = self.services.write().await;
        if services.len() >= MAX_SERVICES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        if services.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ServiceCreated {
            id,
            name,
            description,
            duration_minutes,
            price_cents,
        };
        self.wal_append(&event).await?;
        apply_to_catalog(&mut services, &event);
        let service = services.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        info!("service {id} created ({} min)", service.duration_minutes);
        Ok(service)
    }

    /// Partial update. Existing bookings keep their intervals.
    pub async fn update_service(&self, id: Ulid, patch: ServicePatch) -> Result<Service, EngineError> {
        let _permit = self.commit_permit().await;
        let mut services = self.services.write().await;
        let current = services.get(&id).ok_or(EngineError::NotFound(id))?;
        let updated = patch.apply(current);
        validate_service_fields(&updated.name, updated.description.as_deref(), updated.duration_minutes)?;

        let event = Event::ServiceUpdated {
            id,
            name: updated.name.clone(),
            description: updated.description.clone(),
            duration_minutes: updated.duration_minutes,
            price_cents: updated.price_cents,
            is_active: updated.is_active,
        };
        self.wal_append(&event).await?;
        apply_to_catalog(&mut services, &event);
        Ok(updated)
    }

    /// Soft delete: the service stops being bookable.
    pub async fn deactivate_service(&self, id: Ulid) -> Result<Service, EngineError> {
        let patch = ServicePatch {
            is_active: Some(false),
            ..Default::default()
        };
        self.update_service(id, patch).await
    }

    // ── Availability rules ───────────────────────────────────

    pub async fn add_rule(
        &self,
        id: Ulid,
        day_of_week: DayOfWeek,
        start: TimeOfDay,
        end: TimeOfDay,
        is_blocked: bool,
    ) -> Result<AvailabilityRule, EngineError> {
        if day_of_week > 6 {
            return Err(EngineError::InvalidRule(
                "day_of_week must be between 0 (Monday) and 6 (Sunday)",
            ));
        }
        let span = Span::try_new(start, end)
            .ok_or(EngineError::InvalidRule("start_time must be before end_time"))?;

        let _permit = self.commit_permit().await;
        let mut rules = self.rules.write().await;
        if rules.contains(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if rules.day_len(day_of_week) >= MAX_RULES_PER_DAY {
            return Err(EngineError::LimitExceeded("too many rules for weekday"));
        }

        let event = Event::RuleAdded {
            id,
            day_of_week,
            span,
            is_blocked,
        };
        self.wal_append(&event).await?;
        apply_to_rules(&mut rules, &event);
        info!(
            "rule {id} added: day {day_of_week} {span}{}",
            if is_blocked { " blocked" } else { "" }
        );
        Ok(AvailabilityRule {
            id,
            day_of_week,
            span,
            is_blocked,
        })
    }

    /// Bookings made under the rule are left untouched.
    pub async fn remove_rule(&self, id: Ulid) -> Result<AvailabilityRule, EngineError> {
        let _permit = self.commit_permit().await;
        let mut rules = self.rules.write().await;
        let rule = rules.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        let event = Event::RuleRemoved {
            id,
            day_of_week: rule.day_of_week,
        };
        self.wal_append(&event).await?;
        apply_to_rules(&mut rules, &event);
        info!("rule {id} removed");
        Ok(rule)
    }

    // ── Booking admission ────────────────────────────────────

    /// Admit a booking for an exact slot boundary produced by slot resolution.
    pub async fn admit_booking(
        &self,
        id: Ulid,
        user_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        start: TimeOfDay,
        now: NaiveDateTime,
    ) -> Result<Booking, EngineError> {
        let service = match self.get_service(&service_id).await {
            Some(s) if s.is_active => s,
            _ => {
                record_admission("unknown_service");
                return Err(EngineError::UnknownService(service_id));
            }
        };
        validate_horizon(date, now)?;

        let candidates = self.resolve_for(&service, date, now, None).await?;
        let Some(slot) = candidates.iter().find(|s| s.start_time == start) else {
            debug!("admission {id}: {start} on {date} not among {} slots", candidates.len());
            record_admission("slot_unavailable");
            return Err(EngineError::SlotUnavailable { date, start });
        };

        self.commit_admission(id, user_id, service_id, date, slot.span(), now)
            .await
    }

    /// Commit step of admission: re-validate non-overlap under the date's
    /// write lock and persist a pending booking.
    pub async fn commit_admission(
        &self,
        id: Ulid,
        user_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        span: Span,
        now: NaiveDateTime,
    ) -> Result<Booking, EngineError> {
        let _permit = self.commit_permit().await;
        if self.booking_dates.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let day = self.day_or_create(date);
        let mut guard = day.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many bookings on date"));
        }

        if let Err(e) = check_no_conflict(&guard, &span, None) {
            debug!("admission {id}: lost race for {span} on {date}: {e}");
            record_admission("slot_taken");
            return Err(e);
        }

        let event = Event::BookingAdmitted {
            id,
            user_id,
            service_id,
            date,
            span,
            created_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        record_admission("admitted");
        info!("booking {id} admitted: service {service_id} on {date} {span}");

        guard
            .get(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    // ── Booking lifecycle ────────────────────────────────────

    pub async fn set_booking_status(
        &self,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let _permit = self.commit_permit().await;
        let mut guard = self.resolve_booking_write(&id).await?;
        let current = guard.get(id).map(|b| b.status).ok_or(EngineError::NotFound(id))?;
        if !current.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                from: current,
                to: status,
            });
        }

        let event = Event::BookingStatusChanged {
            id,
            date: guard.date,
            status,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("booking {id}: {current} -> {status}");
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.set_booking_status(id, BookingStatus::Cancelled).await
    }

    /// Move a live booking to another slot of the same service.
    /// The booking's own interval doesn't block its new slot.
    pub async fn reschedule_booking(
        &self,
        id: Ulid,
        new_date: NaiveDate,
        new_start: TimeOfDay,
        now: NaiveDateTime,
    ) -> Result<Booking, EngineError> {
        let booking = self.get_booking(&id).await.ok_or(EngineError::NotFound(id))?;
        if !booking.status.occupies() {
            return Err(EngineError::BookingCancelled(id));
        }
        let service = match self.get_service(&booking.service_id).await {
            Some(s) if s.is_active => s,
            _ => return Err(EngineError::UnknownService(booking.service_id)),
        };
        validate_horizon(new_date, now)?;

        let candidates = self.resolve_for(&service, new_date, now, Some(id)).await?;
        let span = candidates
            .iter()
            .find(|s| s.start_time == new_start)
            .map(|s| s.span())
            .ok_or(EngineError::SlotUnavailable {
                date: new_date,
                start: new_start,
            })?;

        let _permit = self.commit_permit().await;
        let from_date = booking.date;

        if from_date == new_date {
            let mut guard = self.resolve_booking_write(&id).await?;
            // Moved to another date while slots were being resolved.
            if guard.date != from_date {
                return Err(EngineError::NotFound(id));
            }
            if guard.get(id).is_some_and(|b| !b.status.occupies()) {
                return Err(EngineError::BookingCancelled(id));
            }
            check_no_conflict(&guard, &span, Some(id))?;
            let event = Event::BookingRescheduled {
                id,
                from_date,
                to_date: new_date,
                span,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            info!("booking {id} rescheduled to {new_date} {span}");
            return guard.get(id).cloned().ok_or(EngineError::NotFound(id));
        }

        // Acquire both date locks in ascending order to prevent deadlocks.
        let from_day = self.get_day(&from_date).ok_or(EngineError::NotFound(id))?;
        let to_day = self.day_or_create(new_date);
        let (mut from_guard, mut to_guard) = if from_date < new_date {
            let f = from_day.write_owned().await;
            let t = to_day.write_owned().await;
            (f, t)
        } else {
            let t = to_day.write_owned().await;
            let f = from_day.write_owned().await;
            (f, t)
        };

        match from_guard.get(id) {
            Some(b) if b.status.occupies() => {}
            Some(_) => return Err(EngineError::BookingCancelled(id)),
            // Moved by a concurrent reschedule.
            None => return Err(EngineError::NotFound(id)),
        }
        if to_guard.bookings.len() >= MAX_BOOKINGS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many bookings on date"));
        }
        check_no_conflict(&to_guard, &span, Some(id))?;

        let event = Event::BookingRescheduled {
            id,
            from_date,
            to_date: new_date,
            span,
        };
        self.wal_append(&event).await?;
        move_booking(&mut from_guard, &mut to_guard, id, span, &self.booking_dates);
        info!("booking {id} rescheduled from {from_date} to {new_date} {span}");
        to_guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;
        let mut events = Vec::new();

        {
            let services = self.services.read().await;
            let mut catalog: Vec<&Service> = services.values().collect();
            catalog.sort_by_key(|s| s.id);
            for svc in catalog {
                events.push(Event::ServiceCreated {
                    id: svc.id,
                    name: svc.name.clone(),
                    description: svc.description.clone(),
                    duration_minutes: svc.duration_minutes,
                    price_cents: svc.price_cents,
                });
                if !svc.is_active {
                    events.push(Event::ServiceUpdated {
                        id: svc.id,
                        name: svc.name.clone(),
                        description: svc.description.clone(),
                        duration_minutes: svc.duration_minutes,
                        price_cents: svc.price_cents,
                        is_active: false,
                    });
                }
            }
        }

        for rule in self.rules.read().await.all() {
            events.push(Event::RuleAdded {
                id: rule.id,
                day_of_week: rule.day_of_week,
                span: rule.span,
                is_blocked: rule.is_blocked,
            });
        }

        let mut dates: Vec<NaiveDate> = self.days.iter().map(|e| *e.key()).collect();
        dates.sort();
        for date in dates {
            let Some(day) = self.get_day(&date) else { continue };
            let guard = day.read().await;
            for b in &guard.bookings {
                events.push(Event::BookingAdmitted {
                    id: b.id,
                    user_id: b.user_id,
                    service_id: b.service_id,
                    date: b.date,
                    span: b.span,
                    created_at: b.created_at,
                });
                if b.status != BookingStatus::Pending {
                    events.push(Event::BookingStatusChanged {
                        id: b.id,
                        date: b.date,
                        status: b.status,
                    });
                }
            }
        }

        let count = events.len();
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        debug!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
