//! `ProcessACK`, the send-side half of the input path (component C5).
//! Kept as a free function over `Stream` so it's testable without a
//! running engine; `engine.rs` calls it from the per-state dispatch and
//! acts on the returned [`AckOutcome`] (rearming the RTO timer, raising
//! EPOLLOUT, etc).

use tcpcore_timing::{Duration, Instant};

use crate::congestion;
use crate::stream::Stream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// `ack_seq` was before `snd_una` or past the send ring's tail: ignored.
    Stale,
    /// A duplicate ACK; `count` is the running `dup_acks` tally after this
    /// one. The caller enters fast retransmit when `count == 3`.
    Duplicate { count: u32 },
    /// A fresh cumulative ACK advanced `snd_una` by `acked_bytes`.
    Fresh { acked_bytes: u32, window_opened: bool },
}

/// Applies one incoming ACK to `stream`'s send-side state, in order:
/// staleness check, window update, duplicate detection, fresh-ACK
/// RTT/cwnd update. Returns what happened so the caller can decide on
/// retransmit-list membership, EPOLLOUT, and RTO rearm/stop.
pub fn process_ack(
    stream: &mut Stream,
    ack_seq: u32,
    adv_window: u32,
    ts_echo: Option<(u32, u32)>,
    payload_len: usize,
    now: Instant,
) -> AckOutcome {
    let snd_una = stream.send.snd_una;
    let tail = snd_una.wrapping_add(stream.send.ring.len() as u32);
    let before_una = (ack_seq.wrapping_sub(snd_una) as i32) < 0;
    let past_tail = (ack_seq.wrapping_sub(tail) as i32) > 0;
    if before_una || past_tail {
        return AckOutcome::Stale;
    }

    let seq_for_window = stream.rcv_nxt; // segment's seq already advanced rcv_nxt if it carried data
    let window_should_update = (stream.recv.snd_wl1.wrapping_sub(seq_for_window) as i32) < 0
        || (stream.recv.snd_wl1 == seq_for_window && (stream.recv.snd_wl2.wrapping_sub(ack_seq) as i32) < 0)
        || (stream.recv.snd_wl2 == ack_seq && adv_window > stream.send.peer_wnd);
    let mut window_opened = false;
    if window_should_update {
        let outstanding = stream.send.snd_nxt.wrapping_sub(stream.send.snd_una);
        if stream.send.peer_wnd <= outstanding && adv_window > outstanding {
            window_opened = true;
        }
        stream.send.peer_wnd = adv_window;
        stream.recv.snd_wl1 = seq_for_window;
        stream.recv.snd_wl2 = ack_seq;
    }

    let outstanding_before = stream.send.snd_nxt != stream.send.snd_una;
    let is_duplicate =
        ack_seq == stream.recv.last_ack_seq && payload_len == 0 && adv_window == stream.send.peer_wnd && outstanding_before;

    if is_duplicate {
        stream.recv.dup_acks += 1;
        return AckOutcome::Duplicate { count: stream.recv.dup_acks };
    }

    // Fresh cumulative ACK.
    let acked_bytes = ack_seq.wrapping_sub(stream.send.snd_una);
    stream.send.ring.remove(acked_bytes as usize);
    stream.send.snd_una = ack_seq;
    stream.recv.dup_acks = 0;
    stream.recv.last_ack_seq = ack_seq;

    if let Some((tsval, _)) = ts_echo {
        let sample = now.wrapping_sub(stream.recv.ts_last_ts_upd);
        let _ = tsval;
        stream.send.rto = congestion::update_rtt(&mut stream.recv, sample).max(Duration::from_millis(1));
    } else if stream.recv.rtt_seq != 0 && (ack_seq.wrapping_sub(stream.recv.rtt_seq) as i32) > 0 {
        // Karn's algorithm fallback: only sample RTT for segments sent
        // before any retransmit touched this window.
        let sample = now.wrapping_sub(stream.send.ts_rto).saturating_sub(stream.send.rto);
        if sample > Duration::ZERO {
            stream.send.rto = congestion::update_rtt(&mut stream.recv, sample).max(Duration::from_millis(1));
        }
    }
    congestion::on_fresh_ack(&mut stream.send, acked_bytes);

    AckOutcome::Fresh { acked_bytes, window_opened }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{RecvRing, SendRing};
    use crate::stream::{FourTuple, RecvVars, SendVars, TcpState};
    use std::net::Ipv4Addr;

    fn stream_with_outstanding() -> Stream {
        let mut send_ring = SendRing::new(8192, 0);
        send_ring.put(&[0u8; 4000]);
        Stream {
            id: 1,
            tuple: FourTuple { saddr: Ipv4Addr::new(1, 1, 1, 1), sport: 1, daddr: Ipv4Addr::new(2, 2, 2, 2), dport: 2 },
            state: TcpState::Established,
            close_reason: Default::default(),
            rcv_nxt: 0,
            socket: None,
            listener_port: None,
            send: SendVars {
                iss: 0,
                snd_una: 0,
                snd_nxt: 2000,
                fss: None,
                cwnd: 3000,
                ssthresh: u32::MAX,
                peer_wnd: 4000,
                mss: 1460,
                eff_mss: 1460,
                wscale_mine: 0,
                wscale_peer: 0,
                nrtx: 0,
                rto: Duration::from_millis(200),
                ts_rto: Instant::ZERO,
                ip_id: 1,
                ring: send_ring,
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
                ring: RecvRing::new(8192, 0),
            },
            queues: Default::default(),
            last_active: Instant::ZERO,
            ack_pending: 0,
            addr_pool_slot: None,
        }
    }

    #[test]
    fn stale_ack_before_snd_una_is_ignored() {
        let mut s = stream_with_outstanding();
        s.send.snd_una = 1000;
        let outcome = process_ack(&mut s, 500, 4000, None, 0, Instant::ZERO);
        assert_eq!(outcome, AckOutcome::Stale);
    }

    #[test]
    fn stale_ack_past_ring_tail_is_ignored() {
        let mut s = stream_with_outstanding();
        let outcome = process_ack(&mut s, 9000, 4000, None, 0, Instant::ZERO);
        assert_eq!(outcome, AckOutcome::Stale);
    }

    #[test]
    fn three_identical_acks_count_as_duplicates() {
        let mut s = stream_with_outstanding();
        let a = process_ack(&mut s, 0, 4000, None, 0, Instant::ZERO);
        let b = process_ack(&mut s, 0, 4000, None, 0, Instant::ZERO);
        let c = process_ack(&mut s, 0, 4000, None, 0, Instant::ZERO);
        assert_eq!(a, AckOutcome::Duplicate { count: 1 });
        assert_eq!(b, AckOutcome::Duplicate { count: 2 });
        assert_eq!(c, AckOutcome::Duplicate { count: 3 });
    }

    #[test]
    fn fresh_ack_advances_snd_una_and_frees_ring_bytes() {
        let mut s = stream_with_outstanding();
        let outcome = process_ack(&mut s, 1000, 4000, None, 0, Instant::ZERO);
        assert_eq!(outcome, AckOutcome::Fresh { acked_bytes: 1000, window_opened: false });
        assert_eq!(s.send.snd_una, 1000);
        assert_eq!(s.send.ring.len(), 3000);
    }

    #[test]
    fn window_reopening_past_outstanding_is_reported() {
        let mut s = stream_with_outstanding();
        s.send.peer_wnd = 2000; // less than outstanding (2000 == outstanding, edge)
        s.send.snd_nxt = 2000;
        let outcome = process_ack(&mut s, 100, 5000, None, 0, Instant::ZERO);
        match outcome {
            AckOutcome::Fresh { window_opened, .. } => assert!(window_opened),
            other => panic!("expected Fresh, got {other:?}"),
        }
    }
}
