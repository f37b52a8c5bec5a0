use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

/// One weekday's rules split by the `is_blocked` flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DayRules {
    pub available: Vec<Span>,
    pub blocked: Vec<Span>,
}

/// Recurring weekly rules, bucketed by weekday.
#[derive(Debug, Default)]
pub struct RuleStore {
    /// Indexed by `DayOfWeek`, each bucket sorted by `span.start`.
    days: [Vec<AvailabilityRule>; 7],
    /// Reverse lookup: rule id → weekday bucket.
    index: HashMap<Ulid, DayOfWeek>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.index.contains_key(id)
    }

    pub fn day_len(&self, day: DayOfWeek) -> usize {
        self.days.get(day as usize).map_or(0, Vec::len)
    }

    /// Insert rule maintaining sort order by span.start. Out-of-range weekdays are ignored.
    pub fn insert(&mut self, rule: AvailabilityRule) {
        let Some(bucket) = self.days.get_mut(rule.day_of_week as usize) else {
            return;
        };
        let pos = bucket
            .binary_search_by_key(&rule.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.index.insert(rule.id, rule.day_of_week);
        bucket.insert(pos, rule);
    }

    pub fn remove(&mut self, id: &Ulid) -> Option<AvailabilityRule> {
        let day = self.index.remove(id)?;
        let bucket = &mut self.days[day as usize];
        let pos = bucket.iter().position(|r| r.id == *id)?;
        Some(bucket.remove(pos))
    }

    pub fn get(&self, id: &Ulid) -> Option<&AvailabilityRule> {
        let day = self.index.get(id)?;
        self.days[*day as usize].iter().find(|r| r.id == *id)
    }

    /// Partition a weekday's rules into available and blocked windows.
    /// An empty result means the business is closed that day.
    pub fn rules_for_day(&self, day: DayOfWeek) -> DayRules {
        let mut out = DayRules::default();
        if let Some(bucket) = self.days.get(day as usize) {
            for rule in bucket {
                if rule.is_blocked {
                    out.blocked.push(rule.span);
                } else {
                    out.available.push(rule.span);
                }
            }
        }
        out
    }

    /// All rules, Monday first, each day ordered by start.
    pub fn all(&self) -> Vec<AvailabilityRule> {
        self.days.iter().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(day: DayOfWeek, start: &str, end: &str, is_blocked: bool) -> AvailabilityRule {
        AvailabilityRule {
            id: Ulid::new(),
            day_of_week: day,
            span: Span::new(start.parse().unwrap(), end.parse().unwrap()),
            is_blocked,
        }
    }

    #[test]
    fn rules_for_day_partitions_by_flag() {
        let mut store = RuleStore::new();
        store.insert(rule(0, "09:00", "17:00", false));
        store.insert(rule(0, "12:00", "13:00", true));
        store.insert(rule(1, "10:00", "11:00", false));

        let monday = store.rules_for_day(0);
        assert_eq!(monday.available.len(), 1);
        assert_eq!(monday.blocked.len(), 1);
        assert_eq!(store.rules_for_day(1).available.len(), 1);
        assert_eq!(store.rules_for_day(2), DayRules::default());
    }

    #[test]
    fn insert_keeps_day_sorted() {
        let mut store = RuleStore::new();
        store.insert(rule(3, "14:00", "15:00", false));
        store.insert(rule(3, "08:00", "09:00", false));
        store.insert(rule(3, "11:00", "12:00", true));
        let starts: Vec<String> = store.all().iter().map(|r| r.span.start.to_string()).collect();
        assert_eq!(starts, vec!["08:00:00", "11:00:00", "14:00:00"]);
        assert_eq!(store.day_len(3), 3);
    }

    #[test]
    fn all_orders_by_weekday() {
        let mut store = RuleStore::new();
        store.insert(rule(6, "09:00", "10:00", false));
        store.insert(rule(0, "09:00", "10:00", false));
        store.insert(rule(2, "09:00", "10:00", true));
        let days: Vec<_> = store.all().iter().map(|r| r.day_of_week).collect();
        assert_eq!(days, vec![0, 2, 6]);
    }

    #[test]
    fn remove_by_id() {
        let mut store = RuleStore::new();
        let r = rule(4, "09:00", "17:00", false);
        let id = r.id;
        store.insert(r.clone());
        assert!(store.contains(&id));
        assert_eq!(store.get(&id), Some(&r));
        assert_eq!(store.remove(&id), Some(r));
        assert!(store.is_empty());
        assert!(store.rules_for_day(4).available.is_empty());
        assert!(store.remove(&id).is_none());
    }

    #[test]
    fn out_of_range_weekday_ignored() {
        let mut store = RuleStore::new();
        store.insert(rule(7, "09:00", "10:00", false));
        assert_eq!(store.len(), 0);
        assert_eq!(store.rules_for_day(7), DayRules::default());
    }
}
