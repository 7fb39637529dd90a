//! Retransmit, TIME_WAIT and idle timers (component C7), grounded on
//! `timer.c`: a hashed wheel for RTO deadlines (`RTO_HASH` buckets plus an
//! overflow bucket, rehashed periodically) and two FIFOs (TIME_WAIT, idle)
//! ordered by expiry since both intervals are constant per stream.

use std::collections::VecDeque;

use tcpcore_timing::{Duration, Instant};

use crate::stream::StreamId;

pub const RTO_HASH: usize = 1024;

/// Hashed timing wheel for RTO deadlines. A stream's bucket is
/// `(ts_rto - now_base) mod RTO_HASH` when that falls inside the window;
/// otherwise it lives in the overflow bucket until a periodic rehash walks
/// it back in. `on_rto_idx` (tracked by the caller via the returned bucket
/// index) makes cancellation O(1): removing a stream means finding its
/// bucket without hashing it against the current `now_base` again.
pub struct RtoWheel {
    buckets: Vec<Vec<(StreamId, Instant)>>,
    overflow: Vec<(StreamId, Instant)>,
    now_base: Instant,
    cursor: usize,
}

impl RtoWheel {
    pub fn new(now: Instant) -> Self {
        Self { buckets: (0..RTO_HASH).map(|_| Vec::new()).collect(), overflow: Vec::new(), now_base: now, cursor: 0 }
    }

    /// Schedules `id` to fire at `deadline`, returning the bucket index the
    /// caller should record as `on_rto_idx` (`RTO_HASH` means "overflow").
    pub fn schedule(&mut self, id: StreamId, deadline: Instant) -> usize {
        let delta_ms = deadline.wrapping_sub(self.now_base).as_millis();
        if (delta_ms as usize) < RTO_HASH {
            let idx = (self.cursor + delta_ms as usize) % RTO_HASH;
            self.buckets[idx].push((id, deadline));
            idx
        } else {
            self.overflow.push((id, deadline));
            RTO_HASH
        }
    }

    /// Removes `id` from the bucket it was scheduled into (O(1) given the
    /// bucket index returned by `schedule`).
    pub fn cancel(&mut self, id: StreamId, bucket_idx: usize) {
        let list = if bucket_idx < RTO_HASH { &mut self.buckets[bucket_idx] } else { &mut self.overflow };
        if let Some(pos) = list.iter().position(|(sid, _)| *sid == id) {
            list.swap_remove(pos);
        }
    }

    /// Advances the wheel by whole milliseconds elapsed since the last
    /// advance, draining every bucket crossed and returning the streams
    /// whose deadline has now passed. Periodically rehashes the overflow
    /// bucket so entries that have drifted into range get walked back into
    /// the ring.
    pub fn advance(&mut self, now: Instant) -> Vec<StreamId> {
        let elapsed_ms = now.wrapping_sub(self.now_base).as_millis() as usize;
        let mut fired = Vec::new();
        for _ in 0..elapsed_ms.min(RTO_HASH) {
            let due: Vec<(StreamId, Instant)> = self.buckets[self.cursor].drain(..).collect();
            for (id, deadline) in due {
                if now.has_passed(deadline) {
                    fired.push(id);
                } else {
                    self.buckets[self.cursor].push((id, deadline));
                }
            }
            self.cursor = (self.cursor + 1) % RTO_HASH;
        }
        self.now_base = now;

        if elapsed_ms > 0 {
            let still_future: Vec<(StreamId, Instant)> = std::mem::take(&mut self.overflow);
            for (id, deadline) in still_future {
                if now.has_passed(deadline) {
                    fired.push(id);
                } else {
                    self.schedule(id, deadline);
                }
            }
        }
        fired
    }
}

/// FIFO of streams ordered by expiry, used for both TIME_WAIT (2MSL) and
/// idle reaping: insertion is always at the tail because every stream's
/// interval from the configured duration is the same, so the list stays
/// sorted without re-sorting on insert.
pub struct ExpiryFifo {
    entries: VecDeque<(StreamId, Instant)>,
}

impl ExpiryFifo {
    pub fn new() -> Self {
        Self { entries: VecDeque::new() }
    }

    pub fn push(&mut self, id: StreamId, expire_at: Instant) {
        self.entries.push_back((id, expire_at));
    }

    /// Re-touches `id`: since it's always re-inserted at the tail with a
    /// fresh deadline, the natural way to "refresh" a timer on this FIFO is
    /// to remove the (possibly stale) earlier entry and push a new one.
    pub fn refresh(&mut self, id: StreamId, new_expire_at: Instant) {
        if let Some(pos) = self.entries.iter().position(|(sid, _)| *sid == id) {
            self.entries.remove(pos);
        }
        self.push(id, new_expire_at);
    }

    pub fn remove(&mut self, id: StreamId) {
        if let Some(pos) = self.entries.iter().position(|(sid, _)| *sid == id) {
            self.entries.remove(pos);
        }
    }

    /// Pops every entry at the head whose expiry has passed `now`, bounded
    /// by `max_per_tick` to keep one tick's timer work finite.
    pub fn drain_expired(&mut self, now: Instant, max_per_tick: usize) -> Vec<StreamId> {
        let mut fired = Vec::new();
        while fired.len() < max_per_tick {
            match self.entries.front() {
                Some((_, expire_at)) if now.has_passed(*expire_at) => {
                    let (id, _) = self.entries.pop_front().unwrap();
                    fired.push(id);
                }
                _ => break,
            }
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ExpiryFifo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rto_wheel_fires_after_its_deadline_advances_past() {
        let start = Instant(0);
        let mut wheel = RtoWheel::new(start);
        let idx = wheel.schedule(7, start + Duration::from_millis(50));
        assert!(idx < RTO_HASH);
        assert!(wheel.advance(start + Duration::from_millis(10)).is_empty());
        let fired = wheel.advance(start + Duration::from_millis(60));
        assert_eq!(fired, vec![7]);
    }

    #[test]
    fn rto_wheel_cancel_prevents_later_fire() {
        let start = Instant(0);
        let mut wheel = RtoWheel::new(start);
        let idx = wheel.schedule(3, start + Duration::from_millis(20));
        wheel.cancel(3, idx);
        let fired = wheel.advance(start + Duration::from_millis(30));
        assert!(fired.is_empty());
    }

    #[test]
    fn overflow_entry_eventually_fires_once_now_base_catches_up() {
        let start = Instant(0);
        let mut wheel = RtoWheel::new(start);
        let idx = wheel.schedule(1, start + Duration::from_millis(5000));
        assert_eq!(idx, RTO_HASH);
        let fired = wheel.advance(start + Duration::from_millis(5001));
        assert_eq!(fired, vec![1]);
    }

    #[test]
    fn expiry_fifo_drains_in_order_up_to_now() {
        let mut fifo = ExpiryFifo::new();
        fifo.push(1, Instant(100));
        fifo.push(2, Instant(200));
        fifo.push(3, Instant(300));
        let fired = fifo.drain_expired(Instant(250), 10);
        assert_eq!(fired, vec![1, 2]);
        assert_eq!(fifo.len(), 1);
    }

    #[test]
    fn expiry_fifo_respects_per_tick_cap() {
        let mut fifo = ExpiryFifo::new();
        for i in 0..5 {
            fifo.push(i, Instant(0));
        }
        let fired = fifo.drain_expired(Instant(100), 2);
        assert_eq!(fired.len(), 2);
        assert_eq!(fifo.len(), 3);
    }
}
