//! Congestion control and RTT estimation (component C8): Reno-style
//! cwnd/ssthresh plus Jacobson/Karels RTT, applied from the ACK-processing
//! and RTO-backoff paths. Kept as free functions operating on borrowed
//! `SendVars`/`RecvVars` rather than methods on `Stream` so they're
//! trivially unit-testable in isolation.

use tcpcore_timing::Duration;

use crate::stream::{RecvVars, SendVars};

const TCP_MAX_BACKOFF: u32 = 6;
pub const TCP_MAX_RTX: u32 = 16;
pub const TCP_MAX_SYN_RETRY: u32 = 7;

/// Jacobson/Karels update on a fresh RTT sample `m`:
/// `srtt = 7/8*srtt + 1/8*m`, `mdev = 3/4*mdev + 1/4*|m - srtt|`,
/// `rttvar` tracked the same way as `mdev` for RTO backoff's base term,
/// `rto = srtt + 4*mdev` (floored so it's never implausibly small).
pub fn update_rtt(recv: &mut RecvVars, sample: Duration) -> Duration {
    if recv.srtt == Duration::ZERO {
        recv.srtt = sample;
        recv.mdev = sample / 2;
        recv.mdev_max = recv.mdev;
        recv.rttvar = recv.mdev;
    } else {
        let delta = if sample > recv.srtt { sample - recv.srtt } else { recv.srtt - sample };
        recv.srtt = recv.srtt - (recv.srtt / 8) + (sample / 8);
        recv.mdev = recv.mdev - (recv.mdev / 4) + (delta / 4);
        recv.mdev_max = if recv.mdev > recv.mdev_max { recv.mdev } else { recv.mdev_max };
        recv.rttvar = recv.rttvar - (recv.rttvar / 4) + (delta / 4);
    }
    let floor = Duration::from_millis(1);
    let rto = recv.srtt + recv.mdev_max * 4;
    if rto < floor {
        floor
    } else {
        rto
    }
}

/// cwnd growth on a fresh cumulative ACK covering `acked_bytes`: slow-start
/// (`cwnd < ssthresh`) adds one MSS per ACKed segment; congestion
/// avoidance adds `mss*mss/cwnd`.
pub fn on_fresh_ack(send: &mut SendVars, acked_bytes: u32) {
    let mss = u32::from(send.mss).max(1);
    if send.cwnd < send.ssthresh {
        send.cwnd = send.cwnd.saturating_add(mss.min(acked_bytes.max(mss)));
    } else {
        let increment = (mss.saturating_mul(mss) / send.cwnd.max(1)).max(1);
        send.cwnd = send.cwnd.saturating_add(increment);
    }
}

/// Third duplicate ACK: halve ssthresh (floored at 2*MSS), inflate cwnd to
/// `ssthresh + 3*mss`, caller is responsible for rewinding `snd_nxt` and
/// re-enqueuing on the send list.
pub fn enter_fast_retransmit(send: &mut SendVars) {
    let mss = u32::from(send.mss).max(1);
    send.ssthresh = (send.snd_nxt.wrapping_sub(send.snd_una) / 2).max(2 * mss);
    send.cwnd = send.ssthresh + 3 * mss;
}

/// Further dup-ACKs during recovery inflate cwnd by one MSS each.
pub fn inflate_during_recovery(send: &mut SendVars) {
    send.cwnd = send.cwnd.saturating_add(u32::from(send.mss).max(1));
}

/// RTO fired: backoff the timer, reset cwnd/ssthresh, bump `nrtx`. Returns
/// `true` if the retry budget (`TCP_MAX_RTX`, or `TCP_MAX_SYN_RETRY` for an
/// unacknowledged SYN) is exhausted and the stream should be destroyed.
pub fn on_rto_fired(send: &mut SendVars, recv: &RecvVars, is_syn: bool) -> bool {
    send.nrtx += 1;
    let limit = if is_syn { TCP_MAX_SYN_RETRY } else { TCP_MAX_RTX };
    if send.nrtx > limit {
        return true;
    }
    send.rto = if recv.srtt == Duration::ZERO {
        send.rto * 2
    } else {
        let base = (recv.srtt / 8) + recv.rttvar;
        base * (1u32 << send.nrtx.min(TCP_MAX_BACKOFF))
    };
    let mss = u32::from(send.mss).max(1);
    send.cwnd = mss;
    send.ssthresh = (send.cwnd / 2).max(2 * mss);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::SendRing;
    use tcpcore_timing::Instant;

    fn send_vars() -> SendVars {
        SendVars {
            iss: 0,
            snd_una: 0,
            snd_nxt: 14600,
            fss: None,
            cwnd: 14600,
            ssthresh: u32::MAX,
            peer_wnd: 65535,
            mss: 1460,
            eff_mss: 1460,
            wscale_mine: 0,
            wscale_peer: 0,
            nrtx: 0,
            rto: Duration::from_millis(200),
            ts_rto: Instant::ZERO,
            ip_id: 1,
            ring: SendRing::new(65536, 0),
            last_wack_at: None,
            pacing_bps: None,
            pacing_credit_bytes: 0,
        }
    }

    #[test]
    fn triple_dup_ack_halves_ssthresh_with_floor() {
        let mut send = send_vars();
        enter_fast_retransmit(&mut send);
        assert_eq!(send.ssthresh, 7300);
        assert_eq!(send.cwnd, 7300 + 3 * 1460);
    }

    #[test]
    fn rto_backoff_doubles_with_no_rtt_samples() {
        let mut send = send_vars();
        let recv_vars_zero_rtt = {
            let mut r = crate::stream::RecvVars {
                irs: 0,
                rcv_wnd: 65535,
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
                ring: crate::ring::RecvRing::new(65536, 0),
            };
            r.srtt = Duration::ZERO;
            r
        };
        let before = send.rto;
        let destroyed = on_rto_fired(&mut send, &recv_vars_zero_rtt, false);
        assert!(!destroyed);
        assert_eq!(send.rto, before * 2);
        assert_eq!(send.cwnd, u32::from(send.mss));
    }

    #[test]
    fn rtx_limit_exhaustion_signals_destroy() {
        let mut send = send_vars();
        send.nrtx = TCP_MAX_RTX;
        let recv = crate::stream::RecvVars {
            irs: 0,
            rcv_wnd: 0,
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
            ring: crate::ring::RecvRing::new(65536, 0),
        };
        assert!(on_rto_fired(&mut send, &recv, false));
    }

    #[test]
    fn rtt_update_smooths_toward_new_sample() {
        let mut recv = crate::stream::RecvVars {
            irs: 0,
            rcv_wnd: 0,
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
            ring: crate::ring::RecvRing::new(65536, 0),
        };
        let rto1 = update_rtt(&mut recv, Duration::from_millis(100));
        assert_eq!(recv.srtt, Duration::from_millis(100));
        assert!(rto1 >= Duration::from_millis(100));
        let _rto2 = update_rtt(&mut recv, Duration::from_millis(120));
        assert!(recv.srtt > Duration::from_millis(100));
        assert!(recv.srtt < Duration::from_millis(120));
    }
}
