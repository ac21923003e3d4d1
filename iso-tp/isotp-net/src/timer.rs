//! One-shot timer scheduling for the network task.
//!
//! Every protocol deadline (N_Bs, N_Cr, STmin pacing, WAIT re-evaluation)
//! lives in one [`TimerQueue`] owned by the network event loop, which sleeps
//! until [`TimerQueue::next_deadline`] and dispatches whatever
//! [`TimerQueue::pop_expired`] yields. Expiry callbacks therefore run in the
//! same execution context as frame handling, so connection state is only
//! ever touched from one task.
//!
//! Cancellation is lazy: [`TimerQueue::cancel`] marks the handle dead and the
//! entry is discarded when it reaches the head of the heap. Cancelling a
//! timer that has already fired is a no-op and never blocks.
//!
//! Resolution is the tokio timer's (about a millisecond). Sub-millisecond
//! STmin encodings (100..900 µs) are scheduled as-is; on hosts that cannot
//! hit sub-millisecond deadlines the gap rounds up, never down.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use tokio::time::Instant;

/// Identifies a scheduled timer for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerHandle(u64);

struct Entry<E> {
    at: Instant,
    token: u64,
    event: E,
}

// BinaryHeap is a max-heap; invert the ordering to pop earliest-first.
impl<E> Ord for Entry<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.token.cmp(&self.token))
    }
}

impl<E> PartialOrd for Entry<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> PartialEq for Entry<E> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.token == other.token
    }
}

impl<E> Eq for Entry<E> {}

pub(crate) struct TimerQueue<E> {
    heap: BinaryHeap<Entry<E>>,
    cancelled: HashSet<u64>,
    next_token: u64,
}

impl<E> TimerQueue<E> {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_token: 0,
        }
    }

    /// Schedule `event` to fire at `at`.
    pub(crate) fn schedule(&mut self, at: Instant, event: E) -> TimerHandle {
        let token = self.next_token;
        self.next_token += 1;
        self.heap.push(Entry { at, token, event });
        TimerHandle(token)
    }

    /// Cancel a scheduled timer. No-op if it already fired.
    pub(crate) fn cancel(&mut self, handle: TimerHandle) {
        self.cancelled.insert(handle.0);
    }

    /// Earliest pending deadline, if any.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        self.drop_cancelled_head();
        self.heap.peek().map(|entry| entry.at)
    }

    /// Pop one event whose deadline is at or before `now`.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<E> {
        loop {
            self.drop_cancelled_head();
            match self.heap.peek() {
                Some(entry) if entry.at <= now => {
                    let entry = self.heap.pop().expect("peeked entry exists");
                    return Some(entry.event);
                }
                _ => return None,
            }
        }
    }

    fn drop_cancelled_head(&mut self) {
        while let Some(entry) = self.heap.peek() {
            if self.cancelled.remove(&entry.token) {
                self.heap.pop();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn fires_in_deadline_order() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.schedule(now + Duration::from_millis(20), "late");
        timers.schedule(now + Duration::from_millis(10), "early");

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(10)));
        assert_eq!(timers.pop_expired(now), None);
        let later = now + Duration::from_millis(25);
        assert_eq!(timers.pop_expired(later), Some("early"));
        assert_eq!(timers.pop_expired(later), Some("late"));
        assert_eq!(timers.pop_expired(later), None);
        assert_eq!(timers.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_deadlines_fire_in_schedule_order() {
        let mut timers = TimerQueue::new();
        let at = Instant::now() + Duration::from_millis(5);
        timers.schedule(at, 1);
        timers.schedule(at, 2);
        timers.schedule(at, 3);
        assert_eq!(timers.pop_expired(at), Some(1));
        assert_eq!(timers.pop_expired(at), Some(2));
        assert_eq!(timers.pop_expired(at), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timers_do_not_fire() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        let handle = timers.schedule(now + Duration::from_millis(1), "a");
        timers.schedule(now + Duration::from_millis(2), "b");
        timers.cancel(handle);

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(2)));
        assert_eq!(timers.pop_expired(now + Duration::from_millis(5)), Some("b"));

        // Cancelling after the fact is a quiet no-op.
        timers.cancel(handle);
        assert_eq!(timers.pop_expired(now + Duration::from_millis(5)), None);
    }
}
