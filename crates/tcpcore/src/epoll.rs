//! Epoll-like readiness queue (component C9), grounded on `eventpoll.c`:
//! three bounded queues per epoll-set (`mtcp_queue` → `usr_queue` →
//! `usr_shadow_queue`) plus per-registration level/edge trigger tracking.

use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask(pub u32);

impl EventMask {
    pub const EPOLLIN: u32 = 0x001;
    pub const EPOLLOUT: u32 = 0x004;
    pub const EPOLLERR: u32 = 0x008;
    pub const EPOLLHUP: u32 = 0x010;

    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Level,
    Edge,
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    mask: u32,
    trigger: Trigger,
    data: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub sockid: u32,
    pub mask: u32,
    pub data: u64,
}

/// One epoll instance. `ctl` registers interest; the engine calls
/// `raise` as state changes produce readiness; `wait` is what the user
/// thread's blocking call drains.
pub struct EpollSet {
    registrations: HashMap<u32, Registration>,
    mtcp_queue: VecDeque<Event>,
    usr_queue: VecDeque<Event>,
    usr_shadow_queue: VecDeque<Event>,
    capacity: usize,
}

impl EpollSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            registrations: HashMap::new(),
            mtcp_queue: VecDeque::new(),
            usr_queue: VecDeque::new(),
            usr_shadow_queue: VecDeque::new(),
            capacity,
        }
    }

    /// `ADD`/`MOD`/`DEL`-shaped registration. `ADD` additionally takes the
    /// object's current readiness (if any) so applications don't miss
    /// events that predate registration.
    pub fn ctl_add(&mut self, sockid: u32, mask: u32, trigger: Trigger, data: u64, currently_ready: u32) {
        self.registrations.insert(sockid, Registration { mask, trigger, data });
        let immediate = mask & currently_ready;
        if immediate != 0 {
            self.raise(sockid, immediate);
        }
    }

    pub fn ctl_mod(&mut self, sockid: u32, mask: u32, trigger: Trigger, data: u64) {
        self.registrations.insert(sockid, Registration { mask, trigger, data });
    }

    pub fn ctl_del(&mut self, sockid: u32) {
        self.registrations.remove(&sockid);
        self.mtcp_queue.retain(|e| e.sockid != sockid);
        self.usr_queue.retain(|e| e.sockid != sockid);
        self.usr_shadow_queue.retain(|e| e.sockid != sockid);
    }

    /// Called by engine-side state transitions as readiness changes.
    /// Silently drops bits the registration doesn't currently want.
    pub fn raise(&mut self, sockid: u32, mask: u32) {
        let Some(reg) = self.registrations.get(&sockid) else { return };
        let relevant = mask & reg.mask;
        if relevant == 0 {
            return;
        }
        self.mtcp_queue.push_back(Event { sockid, mask: relevant, data: reg.data });
    }

    /// End-of-tick promotion: moves everything from `mtcp_queue` into
    /// `usr_queue` while there's room.
    pub fn flush_to_user_queue(&mut self) {
        while self.usr_queue.len() < self.capacity {
            let Some(ev) = self.mtcp_queue.pop_front() else { break };
            self.usr_queue.push_back(ev);
        }
    }

    /// Drains `usr_queue` then `usr_shadow_queue`, filtering out events for
    /// registrations that no longer include that bit (a late `MOD`/`DEL`).
    /// Level-triggered events whose `still_ready` callback still reports the
    /// condition are re-queued into `usr_shadow_queue` for the *next* call.
    pub fn wait<F: Fn(u32, u32) -> bool>(&mut self, max_events: usize, still_ready: F) -> Vec<Event> {
        let mut drained: Vec<Event> = self.usr_queue.drain(..).chain(self.usr_shadow_queue.drain(..)).collect();
        drained.retain(|e| matches!(self.registrations.get(&e.sockid), Some(r) if r.mask & e.mask != 0));
        drained.truncate(max_events);

        for ev in &drained {
            if let Some(reg) = self.registrations.get(&ev.sockid) {
                if reg.trigger == Trigger::Level && still_ready(ev.sockid, ev.mask) {
                    self.usr_shadow_queue.push_back(*ev);
                }
            }
        }
        drained
    }

    pub fn pending_user_events(&self) -> usize {
        self.usr_queue.len() + self.usr_shadow_queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_with_existing_readiness_is_reported_immediately() {
        let mut ep = EpollSet::new(16);
        ep.ctl_add(1, EventMask::EPOLLIN, Trigger::Level, 42, EventMask::EPOLLIN);
        ep.flush_to_user_queue();
        let events = ep.wait(10, |_, _| false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, 42);
    }

    #[test]
    fn level_trigger_rearms_until_condition_clears() {
        let mut ep = EpollSet::new(16);
        ep.ctl_add(1, EventMask::EPOLLIN, Trigger::Level, 0, 0);
        ep.raise(1, EventMask::EPOLLIN);
        ep.flush_to_user_queue();

        let first = ep.wait(10, |_, _| true); // still 2000 bytes unread
        assert_eq!(first.len(), 1);
        let second = ep.wait(10, |_, _| false); // now drained
        assert_eq!(second.len(), 1);
        let third = ep.wait(10, |_, _| false);
        assert!(third.is_empty());
    }

    #[test]
    fn edge_trigger_never_rearms_itself() {
        let mut ep = EpollSet::new(16);
        ep.ctl_add(1, EventMask::EPOLLIN, Trigger::Edge, 0, 0);
        ep.raise(1, EventMask::EPOLLIN);
        ep.flush_to_user_queue();
        let first = ep.wait(10, |_, _| true);
        assert_eq!(first.len(), 1);
        let second = ep.wait(10, |_, _| true);
        assert!(second.is_empty());
    }

    #[test]
    fn deregistered_events_are_filtered_on_wait() {
        let mut ep = EpollSet::new(16);
        ep.ctl_add(1, EventMask::EPOLLIN, Trigger::Level, 0, 0);
        ep.raise(1, EventMask::EPOLLIN);
        ep.flush_to_user_queue();
        ep.ctl_del(1);
        assert!(ep.wait(10, |_, _| false).is_empty());
    }

    #[test]
    fn raise_drops_bits_not_in_the_registration_mask() {
        let mut ep = EpollSet::new(16);
        ep.ctl_add(1, EventMask::EPOLLIN, Trigger::Edge, 0, 0);
        ep.raise(1, EventMask::EPOLLOUT);
        ep.flush_to_user_queue();
        assert!(ep.wait(10, |_, _| false).is_empty());
    }
}
