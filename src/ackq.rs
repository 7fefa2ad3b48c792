//! Pending-acknowledgement queue for handed-off connections.
//!
//! A dense array with free-slot reuse: removal vacates a slot (or shrinks
//! the tail), insertion fills a vacated slot before growing, and the whole
//! structure resets to empty once every slot is vacant. The queue is the
//! sole authority on which ack tokens are still live.

use std::time::Instant;

#[derive(Debug)]
pub struct AckEntry<T> {
    pub token: u64,
    pub deadline: Instant,
    pub payload: T,
}

#[derive(Debug)]
pub struct AckQueue<T> {
    slots: Vec<Option<AckEntry<T>>>,
    reuse: usize,
}

impl<T> Default for AckQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AckQueue<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(128),
            reuse: 0,
        }
    }

    /// Number of slots in play, vacated ones included.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Vacated slots awaiting reuse.
    pub fn reuse(&self) -> usize {
        self.reuse
    }

    pub fn pending(&self) -> usize {
        self.slots.len() - self.reuse
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    pub fn contains(&self, token: u64) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|e| e.token == token)
    }

    pub fn add(&mut self, token: u64, deadline: Instant, payload: T) {
        let entry = AckEntry {
            token,
            deadline,
            payload,
        };
        if self.reuse > 0 {
            for slot in &mut self.slots {
                if slot.is_none() {
                    *slot = Some(entry);
                    self.reuse -= 1;
                    self.gc();
                    return;
                }
            }
            debug_assert!(false, "corrupted ack queue");
        }
        self.slots.push(Some(entry));
        self.gc();
    }

    /// Remove by token. Unknown tokens are a no-op, which makes late acks
    /// for already-torn-down connections harmless.
    pub fn remove(&mut self, token: u64) -> Option<AckEntry<T>> {
        let i = self
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|e| e.token == token))?;
        let entry = self.slots[i].take();
        if i + 1 == self.slots.len() {
            self.slots.pop();
        } else {
            self.reuse += 1;
        }
        self.gc();
        entry
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().flatten().map(|e| e.deadline).min()
    }

    /// Drain every entry whose deadline has passed.
    pub fn expire_due(&mut self, now: Instant) -> Vec<AckEntry<T>> {
        let due: Vec<u64> = self
            .slots
            .iter()
            .flatten()
            .filter(|e| e.deadline <= now)
            .map(|e| e.token)
            .collect();
        due.into_iter().filter_map(|t| self.remove(t)).collect()
    }

    fn gc(&mut self) {
        if self.reuse == self.slots.len() {
            self.slots.clear();
            self.reuse = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    #[test]
    fn matched_adds_and_removes_leave_nothing_behind() {
        let mut q = AckQueue::new();
        for t in 1..=5u64 {
            q.add(t, far(), t);
        }
        assert_eq!(q.pending(), 5);
        for t in [3, 1, 5, 2, 4] {
            assert_eq!(q.remove(t).unwrap().payload, t);
        }
        assert_eq!(q.size(), 0);
        assert_eq!(q.reuse(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn removal_of_the_tail_shrinks_instead_of_vacating() {
        let mut q = AckQueue::new();
        q.add(1, far(), ());
        q.add(2, far(), ());
        assert!(q.remove(2).is_some());
        assert_eq!(q.size(), 1);
        assert_eq!(q.reuse(), 0);
    }

    #[test]
    fn vacated_slots_are_reused_before_growing() {
        let mut q = AckQueue::new();
        q.add(1, far(), ());
        q.add(2, far(), ());
        q.add(3, far(), ());
        assert!(q.remove(1).is_some());
        assert_eq!(q.reuse(), 1);
        q.add(4, far(), ());
        assert_eq!(q.size(), 3); // filled the hole, no growth
        assert_eq!(q.reuse(), 0);
        assert!(q.contains(4));
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        let mut q: AckQueue<()> = AckQueue::new();
        q.add(7, far(), ());
        assert!(q.remove(8).is_none());
        assert!(q.remove(7).is_some());
        assert!(q.remove(7).is_none()); // idempotent
        assert!(!q.contains(7));
    }

    #[test]
    fn deadlines_expire_in_bulk() {
        let mut q = AckQueue::new();
        let now = Instant::now();
        q.add(1, now - Duration::from_secs(1), "late");
        q.add(2, now + Duration::from_secs(60), "ok");
        q.add(3, now - Duration::from_secs(2), "later");

        assert_eq!(q.next_deadline().unwrap(), now - Duration::from_secs(2));
        let expired = q.expire_due(now);
        assert_eq!(expired.len(), 2);
        assert!(q.contains(2));
        assert_eq!(q.pending(), 1);
    }
}
