use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonically increasing counter
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge that can increase or decrease
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// A named read-out of one metric
pub type Attribute = (&'static str, fn(&StoreMetrics) -> i64);

/// Every metric a store exposes, by name. Exporters walk this table instead
/// of inspecting the struct.
const ATTRIBUTES: &[Attribute] = &[
    ("append", |m| m.append.value() as i64),
    ("get_and_append", |m| m.get_and_append.value() as i64),
    ("replace_at_head", |m| m.replace_at_head.value() as i64),
    ("replace_at_head_mismatch", |m| m.replace_at_head_mismatch.value() as i64),
    ("alloc_fail", |m| m.alloc_fail.value() as i64),
    ("recovery", |m| m.recovery.value() as i64),
    ("recovery_give_up", |m| m.recovery_give_up.value() as i64),
    ("evict", |m| m.evict.value() as i64),
    ("evict_bytes", |m| m.evict_bytes.value() as i64),
    ("shrink_bytes", |m| m.shrink_bytes.value() as i64),
    ("recovery_active", |m| m.recovery_active.value()),
];

/// Per-store metrics
///
/// Each Store instance has its own set, so tests can assert on exact counts
/// without interference from other stores in the same process.
pub struct StoreMetrics {
    // Operations that reached a segment
    pub append: Counter,
    pub get_and_append: Counter,
    pub replace_at_head: Counter,
    pub replace_at_head_mismatch: Counter, // Prefix did not match, nothing written

    // Allocation pressure
    pub alloc_fail: Counter,       // Segment-level allocation failures, retries included
    pub recovery: Counter,         // Recovery rounds started
    pub recovery_give_up: Counter, // Rounds that reclaimed nothing; request failed

    // Reclaimed space
    pub evict: Counter,
    pub evict_bytes: Counter,
    pub shrink_bytes: Counter,

    // Tasks currently running a recovery policy
    pub recovery_active: Gauge,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self {
            append: Counter::new(),
            get_and_append: Counter::new(),
            replace_at_head: Counter::new(),
            replace_at_head_mismatch: Counter::new(),
            alloc_fail: Counter::new(),
            recovery: Counter::new(),
            recovery_give_up: Counter::new(),
            evict: Counter::new(),
            evict_bytes: Counter::new(),
            shrink_bytes: Counter::new(),
            recovery_active: Gauge::new(),
        }
    }

    /// Current value of every metric, by name.
    pub fn attributes(&self) -> impl Iterator<Item = (&'static str, i64)> + '_ {
        ATTRIBUTES.iter().map(move |(name, read)| (*name, read(self)))
    }

    /// Current value of one named metric
    pub fn attribute(&self, name: &str) -> Option<i64> {
        ATTRIBUTES
            .iter()
            .find(|(attribute, _)| *attribute == name)
            .map(|(_, read)| read(self))
    }
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attributes_track_counters() {
        let metrics = StoreMetrics::new();
        metrics.append.increment();
        metrics.append.increment();
        metrics.evict_bytes.add(4096);
        metrics.recovery_active.increment();

        assert_eq!(metrics.attribute("append"), Some(2));
        assert_eq!(metrics.attribute("evict_bytes"), Some(4096));
        assert_eq!(metrics.attribute("recovery_active"), Some(1));
        assert_eq!(metrics.attribute("no_such_metric"), None);

        metrics.recovery_active.decrement();
        assert_eq!(metrics.attribute("recovery_active"), Some(0));
    }

    #[test]
    fn test_attribute_names_are_unique() {
        let metrics = StoreMetrics::new();
        let mut names: Vec<&str> = metrics.attributes().map(|(name, _)| name).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
        assert_eq!(total, 11);
    }
}
