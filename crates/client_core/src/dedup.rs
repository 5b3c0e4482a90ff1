use std::collections::{HashSet, VecDeque};

use shared::domain::MessageId;

/// Bounded window of recently processed message ids.
///
/// Guards against handling the same server-pushed message twice when it
/// arrives over two independent channels (a direct socket event racing a
/// history reload). Eviction is strictly by insertion order: once the window
/// is full, the oldest-recorded ids fall out first regardless of how recently
/// they were looked up.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    seen: HashSet<MessageId>,
    order: VecDeque<MessageId>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn seen(&self, id: MessageId) -> bool {
        self.seen.contains(&id)
    }

    /// Records `id`, evicting the oldest entries if the window is over
    /// capacity. Recording an id already in the window is a no-op.
    pub fn record(&mut self, id: MessageId) {
        if !self.seen.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/dedup_tests.rs"]
mod tests;
