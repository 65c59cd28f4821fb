//! Bounded in-memory retry park (spec §4.6): frames that found no healthy
//! capable processor (`all_busy`/`all_unhealthy`) wait here for the next
//! routing pass instead of going straight to the dead-letter stream. The park
//! has a hard cap; once full, the oldest entry is evicted to make room and is
//! itself sent to the dead-letter stream with `park_cap_exceeded`.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use frame_proto::WireFields;

#[derive(Debug, Clone)]
pub struct ParkedFrame {
    pub entry_id: String,
    pub fields: WireFields,
    pub parked_at: DateTime<Utc>,
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,
}

pub struct RetryPark {
    cap: usize,
    queue: Mutex<VecDeque<ParkedFrame>>,
}

impl RetryPark {
    pub fn new(cap: usize) -> Self {
        Self { cap: cap.max(1), queue: Mutex::new(VecDeque::new()) }
    }

    /// Parks a frame, returning the frame evicted to make room if the park
    /// was already at capacity.
    pub fn push(&self, frame: ParkedFrame) -> Option<ParkedFrame> {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(frame);
        if queue.len() > self.cap { queue.pop_front() } else { None }
    }

    /// Takes out every parked frame whose `next_retry_at` has passed,
    /// leaving frames still in backoff untouched and in their original order.
    pub fn drain_ready(&self, now: DateTime<Utc>) -> Vec<ParkedFrame> {
        let mut queue = self.queue.lock().unwrap();
        let mut ready = Vec::new();
        let mut remaining = VecDeque::with_capacity(queue.len());
        for frame in queue.drain(..) {
            if frame.next_retry_at <= now {
                ready.push(frame);
            } else {
                remaining.push_back(frame);
            }
        }
        *queue = remaining;
        ready
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-frame retry delay for the in-memory park: base 50 ms, doubling per
/// attempt, capped at 5 s.
pub fn backoff_delay(attempts: u32) -> std::time::Duration {
    const BASE_MS: u64 = 50;
    const CAP: std::time::Duration = std::time::Duration::from_secs(5);
    let factor = 1u64 << attempts.min(20);
    std::time::Duration::from_millis(BASE_MS.saturating_mul(factor)).min(CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: &str) -> ParkedFrame {
        let now = Utc::now();
        ParkedFrame {
            entry_id: id.to_string(),
            fields: WireFields::new(),
            parked_at: now,
            attempts: 0,
            next_retry_at: now,
        }
    }

    fn frame_due_at(id: &str, next_retry_at: DateTime<Utc>) -> ParkedFrame {
        ParkedFrame {
            entry_id: id.to_string(),
            fields: WireFields::new(),
            parked_at: Utc::now(),
            attempts: 0,
            next_retry_at,
        }
    }

    #[test]
    fn push_under_cap_evicts_nothing() {
        let park = RetryPark::new(2);
        assert!(park.push(frame("a")).is_none());
        assert!(park.push(frame("b")).is_none());
        assert_eq!(park.len(), 2);
    }

    #[test]
    fn push_past_cap_evicts_oldest() {
        let park = RetryPark::new(2);
        park.push(frame("a"));
        park.push(frame("b"));
        let evicted = park.push(frame("c"));
        assert_eq!(evicted.unwrap().entry_id, "a");
        assert_eq!(park.len(), 2);
    }

    #[test]
    fn drain_ready_takes_only_due_frames() {
        let park = RetryPark::new(4);
        let now = Utc::now();
        park.push(frame_due_at("a", now - chrono::Duration::milliseconds(10)));
        park.push(frame_due_at("b", now + chrono::Duration::seconds(5)));

        let ready = park.drain_ready(now);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].entry_id, "a");
        assert_eq!(park.len(), 1);
    }

    #[test]
    fn backoff_delay_doubles_and_caps() {
        assert_eq!(backoff_delay(0), std::time::Duration::from_millis(50));
        assert_eq!(backoff_delay(1), std::time::Duration::from_millis(100));
        assert_eq!(backoff_delay(2), std::time::Duration::from_millis(200));
        assert_eq!(backoff_delay(10), std::time::Duration::from_secs(5));
    }
}
