use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

// Upper bound for expiry arithmetic on absurd TTLs.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// In-memory event-id dedupe with per-record expiry.
///
/// Check and insert happen under one `&mut self` borrow, so callers sharing a
/// filter across tasks must hold it behind a lock for the whole call.
#[derive(Debug)]
pub struct IdempotencyFilter {
    ttl: Duration,
    max_records: usize,
    expiries: HashMap<String, Instant>,
    insertion_order: VecDeque<String>,
}

impl IdempotencyFilter {
    pub fn new(ttl: Duration, max_records: usize) -> Self {
        Self {
            ttl: ttl.min(MAX_TTL),
            max_records,
            expiries: HashMap::new(),
            insertion_order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.expiries.len()
    }

    /// Returns `true` when `event_id` has an unexpired record. Otherwise
    /// (re)marks it with a fresh expiry and returns `false`. Duplicate hits do
    /// not extend the expiry.
    pub fn check_and_mark(&mut self, event_id: &str, now: Instant) -> bool {
        if self.expiries.len() > self.max_records {
            self.evict_expired_batch(now);
        }

        if let Some(expiry) = self.expiries.get(event_id) {
            if *expiry > now {
                return true;
            }
        }

        let expiry = now + self.ttl;
        if self
            .expiries
            .insert(event_id.to_string(), expiry)
            .is_none()
        {
            self.insertion_order.push_back(event_id.to_string());
        }
        false
    }

    /// Drops the record for `event_id` so its next delivery is processed
    /// again. Used when a pass marked the event but failed to emit.
    pub fn forget(&mut self, event_id: &str) {
        if self.expiries.remove(event_id).is_some() {
            self.insertion_order.retain(|id| id != event_id);
        }
    }

    /// Looks at the oldest ⌈max/10⌉ records and drops the expired ones.
    /// Unexpired records in the batch keep their position, so the map can stay
    /// above the ceiling while old entries are still live.
    fn evict_expired_batch(&mut self, now: Instant) {
        let batch = self.max_records.div_ceil(10).min(self.insertion_order.len());
        let mut kept = Vec::with_capacity(batch);
        let mut evicted = 0usize;
        for event_id in self.insertion_order.drain(..batch) {
            match self.expiries.get(&event_id) {
                Some(expiry) if *expiry < now => {
                    self.expiries.remove(&event_id);
                    evicted += 1;
                }
                Some(_) => kept.push(event_id),
                None => {}
            }
        }
        for event_id in kept.into_iter().rev() {
            self.insertion_order.push_front(event_id);
        }
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.expiries.len(), "evicted expired idempotency records");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn first_occurrence_then_duplicate() {
        let mut filter = IdempotencyFilter::new(HOUR, 100);
        let now = Instant::now();
        assert!(!filter.check_and_mark("e1", now));
        assert!(filter.check_and_mark("e1", now + Duration::from_secs(1)));
        assert!(!filter.check_and_mark("e2", now));
        assert_eq!(filter.len(), 2);
    }

    #[test]
    fn expired_record_counts_as_first_occurrence() {
        let mut filter = IdempotencyFilter::new(Duration::from_secs(10), 100);
        let now = Instant::now();
        assert!(!filter.check_and_mark("e1", now));
        assert!(!filter.check_and_mark("e1", now + Duration::from_secs(10)));
        assert!(filter.check_and_mark("e1", now + Duration::from_secs(15)));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn duplicate_hits_do_not_refresh_expiry() {
        let mut filter = IdempotencyFilter::new(Duration::from_secs(10), 100);
        let now = Instant::now();
        assert!(!filter.check_and_mark("e1", now));
        assert!(filter.check_and_mark("e1", now + Duration::from_secs(9)));
        assert!(!filter.check_and_mark("e1", now + Duration::from_secs(11)));
    }

    #[test]
    fn eviction_removes_only_expired_records_from_oldest_batch() {
        let mut filter = IdempotencyFilter::new(Duration::from_secs(10), 10);
        let start = Instant::now();
        // e0 expires at +10s, the rest at +30s.
        filter.check_and_mark("e0", start);
        for i in 1..=10 {
            filter.check_and_mark(&format!("e{i}"), start + Duration::from_secs(20));
        }
        assert_eq!(filter.len(), 11);

        // Over the ceiling: batch of one looks at e0, which has expired.
        filter.check_and_mark("fresh", start + Duration::from_secs(25));
        assert_eq!(filter.len(), 11);
        assert!(!filter.expiries.contains_key("e0"));
        assert_eq!(filter.insertion_order.front().map(String::as_str), Some("e1"));
    }

    #[test]
    fn oversized_map_with_live_records_stays_oversized() {
        let mut filter = IdempotencyFilter::new(HOUR, 10);
        let now = Instant::now();
        for i in 0..20 {
            filter.check_and_mark(&format!("e{i}"), now);
        }
        assert_eq!(filter.len(), 20);
        assert_eq!(filter.insertion_order.len(), 20);
        assert_eq!(filter.insertion_order.front().map(String::as_str), Some("e0"));
        assert!(filter.check_and_mark("e0", now));
    }

    #[test]
    fn forget_allows_reprocessing() {
        let mut filter = IdempotencyFilter::new(HOUR, 100);
        let now = Instant::now();
        assert!(!filter.check_and_mark("e1", now));
        filter.forget("e1");
        assert_eq!(filter.len(), 0);
        assert!(filter.insertion_order.is_empty());
        assert!(!filter.check_and_mark("e1", now));
        assert!(filter.check_and_mark("e1", now));
    }

    #[test]
    fn reinserting_expired_key_keeps_single_order_entry() {
        let mut filter = IdempotencyFilter::new(Duration::from_secs(1), 100);
        let now = Instant::now();
        filter.check_and_mark("e1", now);
        filter.check_and_mark("e1", now + Duration::from_secs(5));
        assert_eq!(filter.insertion_order.len(), 1);
    }
}
