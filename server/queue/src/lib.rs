//! Bounded, priority-ordered ingress queue (spec §4.2).
//!
//! Single producer per participant capture task, single drain consumer. The
//! queue itself does not enforce per-participant fairness; fairness comes
//! solely from priority ordering plus the drain batch size, per spec §4.3.

use bytes::Bytes;
use tracing::debug;

/// Lower numeric value sorts first (drains first, evicted last).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    Client = 1,
    CoachUnmuted = 2,
    CoachMuted = 3,
}

#[derive(Debug, Clone)]
pub struct IngressFrame {
    pub bytes: Bytes,
    pub participant_id: String,
    pub name: String,
    pub priority: Priority,
}

/// Default capacity, per spec §3.
pub const MAX_QUEUE: usize = 500;

/// Default drain batch size, per spec §4.2.
pub const DRAIN_BATCH: usize = 50;

pub struct IngressQueue {
    items: Vec<IngressFrame>,
    capacity: usize,
}

impl IngressQueue {
    pub fn new(capacity: usize) -> Self {
        Self { items: Vec::with_capacity(capacity.min(MAX_QUEUE)), capacity }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(MAX_QUEUE)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Pushes a frame, evicting the current lowest-priority (highest-numbered)
    /// frame first if the queue is already at capacity. A capacity of zero
    /// always discards the incoming frame.
    pub fn enqueue(&mut self, frame: IngressFrame) {
        if self.capacity == 0 {
            debug!("ingress queue capacity is zero, dropping frame");
            return;
        }
        if self.items.len() >= self.capacity {
            // Stable sort ascending by priority; the tail is the
            // highest-numbered (lowest priority) frame present.
            self.items.sort_by_key(|f| f.priority as u8);
            let evicted = self.items.pop();
            if let Some(ev) = evicted {
                debug!(participant = %ev.participant_id, priority = ev.priority as u8, "evicted lowest-priority frame on overflow");
            }
        }
        if self.items.len() < self.capacity {
            self.items.push(frame);
        }
    }

    /// Stable-sorts by priority and removes up to `n` frames from the front.
    pub fn drain(&mut self, n: usize) -> Vec<IngressFrame> {
        if self.items.is_empty() {
            return Vec::new();
        }
        self.items.sort_by_key(|f| f.priority as u8);
        let n = n.min(self.items.len());
        self.items.drain(0..n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(participant: &str, priority: Priority) -> IngressFrame {
        IngressFrame {
            bytes: Bytes::from_static(b"x"),
            participant_id: participant.to_string(),
            name: participant.to_string(),
            priority,
        }
    }

    #[test]
    fn capacity_zero_always_discards() {
        let mut q = IngressQueue::new(0);
        q.enqueue(frame("a", Priority::Client));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn eviction_prefers_coach_frames_when_client_present() {
        let mut q = IngressQueue::new(500);
        for i in 0..300 {
            q.enqueue(frame(&format!("c{i}"), Priority::Client));
        }
        for i in 0..100 {
            q.enqueue(frame(&format!("coach-unmuted{i}"), Priority::CoachUnmuted));
        }
        for i in 0..100 {
            q.enqueue(frame(&format!("coach-muted{i}"), Priority::CoachMuted));
        }
        assert_eq!(q.len(), 500);

        q.enqueue(frame("new-client", Priority::Client));
        assert_eq!(q.len(), 500);

        let client_count = q
            .items
            .iter()
            .filter(|f| f.priority == Priority::Client)
            .count();
        assert_eq!(client_count, 301, "no client frame should have been evicted");
        assert!(q.items.iter().any(|f| f.participant_id == "new-client"));
    }

    #[test]
    fn drain_preserves_per_participant_fifo() {
        let mut q = IngressQueue::new(10);
        q.enqueue(frame("a", Priority::Client));
        q.enqueue(frame("a", Priority::Client));
        q.enqueue(frame("a", Priority::Client));
        let drained = q.drain(10);
        let seqs: Vec<&str> = drained.iter().map(|f| f.participant_id.as_str()).collect();
        assert_eq!(seqs, vec!["a", "a", "a"]);
    }

    #[test]
    fn drain_orders_by_priority_first() {
        let mut q = IngressQueue::new(10);
        q.enqueue(frame("coach", Priority::CoachMuted));
        q.enqueue(frame("client", Priority::Client));
        let drained = q.drain(10);
        assert_eq!(drained[0].participant_id, "client");
        assert_eq!(drained[1].participant_id, "coach");
    }

    #[test]
    fn drain_n_limits_batch_size() {
        let mut q = IngressQueue::new(10);
        for i in 0..5 {
            q.enqueue(frame(&format!("p{i}"), Priority::Client));
        }
        let drained = q.drain(3);
        assert_eq!(drained.len(), 3);
        assert_eq!(q.len(), 2);
    }
}
