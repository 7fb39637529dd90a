//! Output path (component C6): the three per-NIC lists (control, ack,
//! send), the single segment-building routine they all funnel through, and
//! the window-probe rule. A stream is on at most one of {control, send}
//! and at most one {ack} list at a time, enforced here by consulting (and
//! updating) its `QueueMembership` before pushing.

use tcpcore_net::wire::tcp::{TcpFlags, TcpHeader, TcpOptions};
use tcpcore_timing::{Duration, Instant};

use crate::stream::{QueueSlot, Stream};

/// Minimum spacing between window-probe (WACK) emissions for one stream.
pub const WACK_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Default)]
pub struct OutputLists {
    pub control: Vec<u32>,
    pub ack: Vec<u32>,
    pub send: Vec<u32>,
}

impl OutputLists {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues on the control list unless already there (control and send
    /// share one membership slot: a stream never needs both at once since
    /// control segments carry no payload).
    pub fn enqueue_control(&mut self, stream: &mut Stream) {
        if stream.queues.output == Some(QueueSlot::Control) {
            return;
        }
        stream.queues.output = Some(QueueSlot::Control);
        self.control.push(stream.id);
    }

    pub fn enqueue_send(&mut self, stream: &mut Stream) {
        if stream.queues.output == Some(QueueSlot::Send) {
            return;
        }
        stream.queues.output = Some(QueueSlot::Send);
        self.send.push(stream.id);
    }

    pub fn enqueue_ack(&mut self, stream: &mut Stream) {
        stream.ack_pending += 1;
    }

    /// Called once a stream has actually been flushed off a list, freeing
    /// it to be re-enqueued on a future tick.
    pub fn clear_output_membership(stream: &mut Stream) {
        stream.queues.output = None;
    }
}

/// Builds one TCP header for `stream`, carrying `flags`, with the options
/// negotiated for this connection (timestamp/SACK only once negotiated).
/// This is the single routine producing header bit-layout the engine calls
/// from every emission path (control, ack-only, or data-bearing), per the
/// "one routine to keep the bit layout in one place" rule.
pub fn build_segment_header(stream: &Stream, flags: TcpFlags, seq: u32, now_ts: Option<(u32, u32)>) -> (TcpHeader, TcpOptions) {
    let window = (stream.recv.rcv_wnd >> stream.send.wscale_mine).min(u16::MAX as u32) as u16;
    let header = TcpHeader {
        sport: stream.tuple.sport,
        dport: stream.tuple.dport,
        seq,
        ack: stream.rcv_nxt,
        flags,
        window,
        checksum: 0,
        urgent_ptr: 0,
    };
    let mut options = TcpOptions::default();
    if flags.has(TcpFlags::SYN) {
        options.mss = Some(stream.send.mss);
        options.wscale = Some(stream.send.wscale_mine);
        options.sack_permitted = true;
    }
    if let Some(ts) = now_ts {
        options.timestamp = Some(ts);
    }
    (header, options)
}

/// Whether a window probe is due: peer window closed, data is buffered, and
/// enough time has passed since the last probe.
pub fn window_probe_due(stream: &Stream, now: Instant) -> bool {
    stream.send.peer_wnd == 0
        && !stream.send.ring.is_empty()
        && stream.send.last_wack_at.is_none_or(|last| now.wrapping_sub(last) >= WACK_INTERVAL)
}

/// Computes how many bytes the send list may draw this emission, as
/// `min(cwnd, peer_wnd) - outstanding`, then further capped by an optional
/// pacer's credit.
pub fn send_budget(stream: &Stream, pacer_afford: Option<u32>) -> u32 {
    let outstanding = stream.send.snd_nxt.wrapping_sub(stream.send.snd_una);
    let window = stream.send.cwnd.min(stream.send.peer_wnd);
    let budget = window.saturating_sub(outstanding);
    match pacer_afford {
        Some(afford) => budget.min(afford),
        None => budget,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{RecvRing, SendRing};
    use crate::stream::{FourTuple, RecvVars, SendVars, TcpState};
    use std::net::Ipv4Addr;

    fn stream() -> Stream {
        Stream {
            id: 1,
            tuple: FourTuple { saddr: Ipv4Addr::new(1, 2, 3, 4), sport: 80, daddr: Ipv4Addr::new(5, 6, 7, 8), dport: 1000 },
            state: TcpState::Established,
            close_reason: Default::default(),
            rcv_nxt: 500,
            socket: None,
            listener_port: None,
            send: SendVars {
                iss: 0,
                snd_una: 0,
                snd_nxt: 100,
                fss: None,
                cwnd: 2000,
                ssthresh: u32::MAX,
                peer_wnd: 1500,
                mss: 1460,
                eff_mss: 1460,
                wscale_mine: 0,
                wscale_peer: 0,
                nrtx: 0,
                rto: Duration::from_millis(200),
                ts_rto: Instant::ZERO,
                ip_id: 1,
                ring: SendRing::new(4096, 0),
                last_wack_at: None,
                pacing_bps: None,
                pacing_credit_bytes: 0,
            },
            recv: RecvVars {
                irs: 0,
                rcv_wnd: 8192,
                snd_wl1: 0,
                snd_wl2: 0,
                last_ack_seq: 0,
                dup_acks: 0,
                srtt: Duration::ZERO,
                mdev: Duration::ZERO,
                mdev_max: Duration::ZERO,
                rttvar: Duration::ZERO,
                rtt_seq: 0,
                saw_timestamp: false,
                ts_recent: 0,
                ts_last_ts_upd: Instant::ZERO,
                ts_lastack_rcvd: Instant::ZERO,
                ts_tw_expire: Instant::ZERO,
                sack_permitted: false,
                ring: RecvRing::new(4096, 500),
            },
            queues: Default::default(),
            last_active: Instant::ZERO,
            ack_pending: 0,
            addr_pool_slot: None,
        }
    }

    #[test]
    fn a_stream_is_never_double_enqueued_on_the_same_output_list() {
        let mut lists = OutputLists::new();
        let mut s = stream();
        lists.enqueue_send(&mut s);
        lists.enqueue_send(&mut s);
        assert_eq!(lists.send, vec![1]);
    }

    #[test]
    fn control_and_send_share_one_membership_slot() {
        let mut lists = OutputLists::new();
        let mut s = stream();
        lists.enqueue_send(&mut s);
        lists.enqueue_control(&mut s);
        // control didn't push because membership already claimed by send
        assert_eq!(lists.control, Vec::<u32>::new());
        assert_eq!(lists.send, vec![1]);
    }

    #[test]
    fn send_budget_is_window_minus_outstanding() {
        let s = stream();
        assert_eq!(send_budget(&s, None), 1500 - 100);
    }

    #[test]
    fn window_probe_not_due_until_interval_elapses() {
        let mut s = stream();
        s.send.peer_wnd = 0;
        s.send.ring.put(b"data");
        assert!(window_probe_due(&s, Instant::ZERO));
        s.send.last_wack_at = Some(Instant::ZERO);
        assert!(!window_probe_due(&s, Instant::ZERO + Duration::from_millis(100)));
        assert!(window_probe_due(&s, Instant::ZERO + Duration::from_millis(600)));
    }
}
