use std::collections::{HashSet, VecDeque};

/// Bounded set of recently seen event ids.
///
/// Pre-filters feed pages before they reach storage. Oldest ids are evicted
/// first; an evicted id that shows up again is caught by idempotent inserts.
pub struct SeenCache {
    capacity: usize,
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Remember an id. Returns `false` if it was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }

        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());

        while self.ids.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            } else {
                break;
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_reports_duplicates() {
        let mut cache = SeenCache::new(10);
        assert!(cache.insert("a"));
        assert!(!cache.insert("a"));
        assert!(cache.contains("a"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evicts_oldest() {
        let mut cache = SeenCache::new(2);
        cache.insert("a");
        cache.insert("b");
        cache.insert("c");
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.len(), 2);
    }
}
