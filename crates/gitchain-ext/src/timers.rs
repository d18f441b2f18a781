//! Timer registry backing `setTimeout`/`setInterval`
//!
//! Entries live in a per-context registry keyed by the JS-visible handle. The
//! real-time source is a [`DelayQueue`]; the scheduler polls it together with
//! the cancellation token, so waiting for the next timer is a genuine blocking
//! wait rather than a poll loop.
//!
//! The queue itself does not order entries sharing a wheel slot, so expired
//! entries are collected per poll and released by deadline, then by
//! scheduling order.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::time::{DelayQueue, delay_queue};

/// JS-visible timer handle
pub type TimerId = u32;

/// Smallest delay a timer can be scheduled with
pub const MIN_DELAY: Duration = Duration::from_millis(1);

/// Normalize a script-supplied delay in milliseconds.
///
/// NaN, infinities and anything below one millisecond are treated as the
/// minimum delay, so a timer never fires inline.
pub fn clamp_delay(delay_ms: f64) -> Duration {
    if !delay_ms.is_finite() || delay_ms < 1.0 {
        MIN_DELAY
    } else {
        Duration::from_millis(delay_ms as u64)
    }
}

/// A scheduled one-shot or repeating timer
#[derive(Debug)]
struct TimerEntry {
    period: Duration,
    repeating: bool,
    deadline: Instant,
    /// Scheduling order; breaks ties between equal deadlines
    seq: u64,
    /// Queue slot; `None` once expired
    key: Option<delay_queue::Key>,
}

/// Outstanding timers of one script context
#[derive(Default)]
pub struct TimerRegistry {
    queue: DelayQueue<TimerId>,
    entries: HashMap<TimerId, TimerEntry>,
    /// Expired handles not yet handed out, in firing order
    ready: VecDeque<TimerId>,
    next_id: TimerId,
    next_seq: u64,
}

impl TimerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a timer and start its countdown. Must run inside a tokio runtime.
    pub fn schedule(&mut self, delay: Duration, repeating: bool) -> TimerId {
        let id = self.allocate_id();
        let period = delay.max(MIN_DELAY);
        let seq = self.bump_seq();
        let key = self.queue.insert(id, period);
        self.entries.insert(
            id,
            TimerEntry {
                period,
                repeating,
                deadline: Instant::now() + period,
                seq,
                key: Some(key),
            },
        );
        id
    }

    /// Remove a timer. Unknown, fired or already cleared handles are ignored.
    pub fn clear(&mut self, id: TimerId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                match entry.key {
                    Some(key) => {
                        self.queue.remove(&key);
                    }
                    None => self.ready.retain(|ready| *ready != id),
                }
                true
            }
            None => false,
        }
    }

    /// Drop every outstanding timer
    pub fn clear_all(&mut self) {
        self.queue.clear();
        self.entries.clear();
        self.ready.clear();
    }

    /// Number of registered timers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no timers are registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a handle is registered
    pub fn contains(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Poll for the next expired timer; `Ready(None)` once nothing is left
    pub fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<Option<TimerId>> {
        let mut collected = false;
        let drained = loop {
            match self.queue.poll_expired(cx) {
                Poll::Ready(Some(expired)) => {
                    let id = expired.into_inner();
                    // Stale slots of cleared timers are skipped.
                    if let Some(entry) = self.entries.get_mut(&id) {
                        entry.key = None;
                        self.ready.push_back(id);
                        collected = true;
                    }
                }
                Poll::Ready(None) => break true,
                Poll::Pending => break false,
            }
        };

        if collected {
            let entries = &self.entries;
            self.ready
                .make_contiguous()
                .sort_by_key(|id| entries.get(id).map(|entry| (entry.deadline, entry.seq)));
        }

        match self.ready.pop_front() {
            Some(id) => Poll::Ready(Some(id)),
            None if drained => Poll::Ready(None),
            None => Poll::Pending,
        }
    }

    /// Claim a fired timer before its callback runs.
    ///
    /// One-shot entries leave the registry here; repeating entries stay so the
    /// callback may clear them. Returns whether the timer repeats.
    pub fn take_fired(&mut self, id: TimerId) -> Option<bool> {
        let repeating = self.entries.get(&id)?.repeating;
        if !repeating {
            self.entries.remove(&id);
        }
        Some(repeating)
    }

    /// Re-arm a repeating timer at its period, unless it was cleared meanwhile
    pub fn rearm(&mut self, id: TimerId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.repeating && entry.key.is_none() => {
                self.next_seq += 1;
                entry.seq = self.next_seq;
                entry.deadline = Instant::now() + entry.period;
                entry.key = Some(self.queue.insert(id, entry.period));
                true
            }
            _ => false,
        }
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn allocate_id(&mut self) -> TimerId {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0 && !self.entries.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }
}

impl fmt::Debug for TimerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerRegistry")
            .field("entries", &self.entries)
            .field("ready", &self.ready)
            .field("next_id", &self.next_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;

    async fn next_expired(registry: &mut TimerRegistry) -> Option<TimerId> {
        poll_fn(|cx| registry.poll_expired(cx)).await
    }

    #[test]
    fn test_clamp_delay() {
        assert_eq!(clamp_delay(0.0), MIN_DELAY);
        assert_eq!(clamp_delay(-50.0), MIN_DELAY);
        assert_eq!(clamp_delay(f64::NAN), MIN_DELAY);
        assert_eq!(clamp_delay(f64::INFINITY), MIN_DELAY);
        assert_eq!(clamp_delay(0.5), MIN_DELAY);
        assert_eq!(clamp_delay(12.9), Duration::from_millis(12));
        assert_eq!(clamp_delay(250.0), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_in_deadline_order() {
        let mut registry = TimerRegistry::new();
        let slow = registry.schedule(Duration::from_millis(30), false);
        let fast = registry.schedule(Duration::from_millis(10), false);

        assert_eq!(next_expired(&mut registry).await, Some(fast));
        assert_eq!(registry.take_fired(fast), Some(false));
        assert_eq!(next_expired(&mut registry).await, Some(slow));
        assert_eq!(registry.take_fired(slow), Some(false));
        assert!(registry.is_empty());
        assert_eq!(next_expired(&mut registry).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_deadlines_fire_in_scheduling_order() {
        let mut registry = TimerRegistry::new();
        let delay = Duration::from_millis(5);
        let scheduled: Vec<TimerId> = (0..4).map(|_| registry.schedule(delay, false)).collect();

        let mut fired = Vec::new();
        while let Some(id) = next_expired(&mut registry).await {
            registry.take_fired(id);
            fired.push(id);
        }
        assert_eq!(fired, scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_already_expired_timer() {
        let mut registry = TimerRegistry::new();
        let first = registry.schedule(MIN_DELAY, false);
        let second = registry.schedule(MIN_DELAY, false);

        assert_eq!(next_expired(&mut registry).await, Some(first));
        registry.take_fired(first);
        // `second` expired in the same poll; clearing it from `first`'s
        // callback must keep it from firing.
        assert!(registry.clear(second));
        assert_eq!(next_expired(&mut registry).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_unknown_or_fired_is_noop() {
        let mut registry = TimerRegistry::new();
        assert!(!registry.clear(99));

        let id = registry.schedule(MIN_DELAY, false);
        assert_eq!(next_expired(&mut registry).await, Some(id));
        registry.take_fired(id);
        assert!(!registry.clear(id));
        assert!(!registry.clear(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_timer_never_fires() {
        let mut registry = TimerRegistry::new();
        let cleared = registry.schedule(Duration::from_millis(5), false);
        let kept = registry.schedule(Duration::from_millis(10), false);
        assert!(registry.clear(cleared));

        assert_eq!(next_expired(&mut registry).await, Some(kept));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_timer_rearms_until_cleared() {
        let mut registry = TimerRegistry::new();
        let id = registry.schedule(Duration::from_millis(10), true);

        for _ in 0..3 {
            assert_eq!(next_expired(&mut registry).await, Some(id));
            assert_eq!(registry.take_fired(id), Some(true));
            assert!(registry.rearm(id));
        }

        assert_eq!(next_expired(&mut registry).await, Some(id));
        registry.take_fired(id);
        // Cleared from inside its own callback: no re-arm.
        assert!(registry.clear(id));
        assert!(!registry.rearm(id));
        assert_eq!(next_expired(&mut registry).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_empties_queue() {
        let mut registry = TimerRegistry::new();
        registry.schedule(Duration::from_millis(5), true);
        registry.schedule(Duration::from_millis(7), false);
        assert_eq!(registry.len(), 2);

        registry.clear_all();
        assert!(registry.is_empty());
        assert_eq!(next_expired(&mut registry).await, None);
    }

    #[test]
    fn test_ids_skip_zero_and_live_handles() {
        let mut registry = TimerRegistry::new();
        registry.next_id = TimerId::MAX;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let first = registry.schedule(MIN_DELAY, false);
            assert_eq!(first, 1);
            registry.next_id = 0;
            let second = registry.schedule(MIN_DELAY, false);
            assert_eq!(second, 2);
        });
    }
}
