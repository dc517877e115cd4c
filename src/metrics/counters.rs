//! Monotonic counters.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter split by one label, e.g. message class or discard reason.
#[derive(Debug)]
pub struct LabeledCounter {
    name: &'static str,
    help: &'static str,
    label: &'static str,
    values: RwLock<BTreeMap<&'static str, AtomicU64>>,
}

impl LabeledCounter {
    pub fn new(name: &'static str, help: &'static str, label: &'static str) -> Self {
        Self {
            name,
            help,
            label,
            values: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Increment the counter for `value`.
    pub fn inc(&self, value: &'static str) {
        {
            let values = self.values.read();
            if let Some(counter) = values.get(value) {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        self.values
            .write()
            .entry(value)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, value: &str) -> u64 {
        self.values
            .read()
            .get(value)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// All label values with their counts, sorted by label.
    pub fn get_all(&self) -> Vec<(&'static str, u64)> {
        self.values
            .read()
            .iter()
            .map(|(k, v)| (*k, v.load(Ordering::Relaxed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("ops", "ops seen");
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_labeled_counter() {
        let counter = LabeledCounter::new("discards", "discarded ops", "reason");
        counter.inc("stale_epoch");
        counter.inc("stale_epoch");
        counter.inc("session_gone");

        assert_eq!(counter.get("stale_epoch"), 2);
        assert_eq!(counter.get("session_gone"), 1);
        assert_eq!(counter.get("misdirected"), 0);
        assert_eq!(counter.get_all().len(), 2);
    }
}
