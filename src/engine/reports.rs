use std::cmp::Reverse;
use std::collections::HashMap;

use chrono::{Datelike, Days, NaiveDateTime};
use ulid::Ulid;

use crate::model::*;

use super::{BookingFilter, Engine};

/// Rows returned by `recent_bookings` when no LIMIT is given.
pub const DEFAULT_RECENT_BOOKINGS: usize = 10;

impl Engine {
    /// Current prices and names, keyed by service id.
    async fn price_list(&self) -> HashMap<Ulid, (String, u64)> {
        self.services
            .read()
            .await
            .values()
            .map(|s| (s.id, (s.name.clone(), s.price_cents)))
            .collect()
    }

    /// Counts by status plus confirmed revenue, overall and for the month containing `now`.
    pub async fn booking_stats(&self, now: NaiveDateTime) -> BookingStats {
        let prices = self.price_list().await;
        let today = now.date();
        let month_start = today - Days::new(u64::from(today.day0()));

        let mut stats = BookingStats {
            total_services: prices.len() as u64,
            ..BookingStats::default()
        };
        for b in self.list_bookings(&BookingFilter::default()).await {
            let this_month = b.date >= month_start;
            stats.total_bookings += 1;
            if this_month {
                stats.bookings_this_month += 1;
            }
            match b.status {
                BookingStatus::Pending => stats.pending_bookings += 1,
                BookingStatus::Cancelled => stats.cancelled_bookings += 1,
                BookingStatus::Confirmed => {
                    stats.confirmed_bookings += 1;
                    let price = prices.get(&b.service_id).map_or(0, |(_, p)| *p);
                    stats.total_revenue_cents = stats.total_revenue_cents.saturating_add(price);
                    if this_month {
                        stats.revenue_this_month_cents =
                            stats.revenue_this_month_cents.saturating_add(price);
                    }
                }
            }
        }
        stats
    }

    /// Confirmed bookings and revenue per service, highest revenue first.
    /// Services without bookings are listed with zeros.
    pub async fn revenue_by_service(&self) -> Vec<ServiceRevenue> {
        let mut confirmed: HashMap<Ulid, u64> = HashMap::new();
        for b in self.list_bookings(&BookingFilter::default()).await {
            if b.status == BookingStatus::Confirmed {
                *confirmed.entry(b.service_id).or_default() += 1;
            }
        }

        let mut out: Vec<ServiceRevenue> = self
            .price_list()
            .await
            .into_iter()
            .map(|(id, (name, price))| {
                let count = confirmed.get(&id).copied().unwrap_or(0);
                ServiceRevenue {
                    service_id: id,
                    service_name: name,
                    confirmed_bookings: count,
                    revenue_cents: count.saturating_mul(price),
                }
            })
            .collect();
        out.sort_by_key(|r| (Reverse(r.revenue_cents), r.service_id));
        out
    }

    /// The `limit` most recently created bookings, newest first.
    pub async fn recent_bookings(&self, limit: usize) -> Vec<BookingDetails> {
        let mut bookings = self.list_bookings(&BookingFilter::default()).await;
        bookings.sort_by_key(|b| Reverse((b.created_at, b.id)));
        bookings.truncate(limit);

        let prices = self.price_list().await;
        bookings
            .into_iter()
            .map(|booking| {
                let (service_name, price_cents) = prices
                    .get(&booking.service_id)
                    .cloned()
                    .unwrap_or_default();
                BookingDetails {
                    booking,
                    service_name,
                    price_cents,
                }
            })
            .collect()
    }
}
