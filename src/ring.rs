//! The pre-trigger ring buffer (C3): a bounded FIFO of the most recently
//! observed `FrameEvent`s, continuously refreshed from process start so a
//! trigger can recover footage metadata from just before it fired.

use std::collections::VecDeque;

use crate::frame::FrameEvent;

/// Fixed-capacity FIFO of `FrameEvent`s. Pushing past capacity evicts the
/// oldest element; `snapshot` returns a point-in-time copy without
/// clearing the buffer (§3 RingBuffer, §4.3).
pub struct RingBuffer {
    frames: VecDeque<FrameEvent>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be positive");
        RingBuffer {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Pushes a new frame, evicting the oldest if full. O(1) amortized;
    /// never blocks (§4.3 I5).
    pub fn push(&mut self, event: FrameEvent) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(event);
    }

    /// Returns a copy of the current contents in frame-number ascending
    /// order, without clearing the buffer.
    pub fn snapshot(&self) -> Vec<FrameEvent> {
        self.frames.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Age, in clock seconds, of the oldest frame still retained. `None` if
    /// empty.
    pub fn oldest_age(&self, now: f64) -> Option<f64> {
        self.frames.front().map(|f| now - f.capture_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameSource;

    fn ev(n: u64, t: f64) -> FrameEvent {
        FrameEvent {
            frame_number: n,
            capture_time: t,
            source: FrameSource::AgentStdout,
        }
    }

    #[test]
    fn push_grows_until_capacity_then_evicts_oldest() {
        let mut r = RingBuffer::new(10);
        for n in 1..=25u64 {
            r.push(ev(n, n as f64 * 0.01));
        }
        assert_eq!(r.len(), 10);
        let snap = r.snapshot();
        let nums: Vec<u64> = snap.iter().map(|e| e.frame_number).collect();
        assert_eq!(nums, (16..=25).collect::<Vec<_>>());
    }

    #[test]
    fn len_after_k_pushes_on_capacity_n() {
        let mut r = RingBuffer::new(5);
        for n in 1..=3u64 {
            r.push(ev(n, n as f64));
        }
        assert_eq!(r.len(), 3);
        assert_eq!(r.snapshot().first().unwrap().frame_number, 1);

        for n in 4..=12u64 {
            r.push(ev(n, n as f64));
        }
        // k=12, N=5: len == min(12,5) == 5, first == max(1, 12-5+1) == 8.
        assert_eq!(r.len(), 5);
        assert_eq!(r.snapshot().first().unwrap().frame_number, 8);
    }

    #[test]
    fn capacity_one_always_holds_most_recent() {
        let mut r = RingBuffer::new(1);
        r.push(ev(1, 0.0));
        r.push(ev(2, 0.1));
        r.push(ev(3, 0.2));
        let snap = r.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].frame_number, 3);
    }

    #[test]
    fn oldest_age_reflects_front_frame() {
        let mut r = RingBuffer::new(3);
        r.push(ev(1, 1.0));
        r.push(ev(2, 2.0));
        assert_eq!(r.oldest_age(5.0), Some(4.0));
    }

    #[test]
    fn snapshot_does_not_clear() {
        let mut r = RingBuffer::new(3);
        r.push(ev(1, 0.0));
        let first = r.snapshot();
        let second = r.snapshot();
        assert_eq!(first.len(), second.len());
        assert_eq!(r.len(), 1);
    }
}
