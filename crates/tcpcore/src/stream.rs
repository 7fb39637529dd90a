//! The stream object and its TCP state machine (component C4), grounded on
//! `tcp_stream.h`/`tcp_stream.c`'s field layout, redesigned per the
//! `on_X_list` → `QueueSlot` note: a stream carries one `Option<QueueSlot>`
//! per list it can belong to instead of six raw booleans, so double-insert
//! and stale-removal are caught by the type rather than by convention.

use std::net::Ipv4Addr;

use tcpcore_net::wire::tcp::TcpOptions;
use tcpcore_timing::{Duration, Instant};

use crate::error::CloseReason;
use crate::pool::PoolIndex;
use crate::ring::{RecvRing, SendRing};

/// Monotonic per-engine stream identifier (never reused across the
/// lifetime of the pool slot it names — the pool's own generation already
/// catches stale reuse, this is just a stable external name for logs).
pub type StreamId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub saddr: Ipv4Addr,
    pub sport: u16,
    pub daddr: Ipv4Addr,
    pub dport: u16,
}

/// TCP connection state (RFC 793 names). Exhaustive: every input-path
/// dispatch match is required to be exhaustive by the compiler, standing in
/// for the source's dispatch-table-plus-`assert(0)-on-unknown-state`
/// pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    pub fn is_data_transfer(self) -> bool {
        matches!(self, TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 | TcpState::CloseWait)
    }

    /// Whether this state is only reachable after the peer's FIN has been
    /// received, meaning no further bytes will ever arrive and a drained
    /// receive ring is EOF, not a temporary lack of data.
    pub fn peer_has_closed(self) -> bool {
        matches!(self, TcpState::CloseWait | TcpState::Closing | TcpState::LastAck | TcpState::TimeWait)
    }
}

/// Marks which of the three per-NIC output lists (or which cross-thread
/// command queue) a stream is currently enqueued on. Replaces the six
/// `on_X_list`/`on_Xq` booleans: a stream owns at most one `QueueSlot` per
/// field below, and inserting into a list that's already `Some` is a logic
/// error the type makes easy to assert against rather than silently
/// double-linking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSlot {
    Control,
    Send,
    Ack,
}

/// Per-stream membership in the three output lists and the RTO wheel.
/// `None` means "not enqueued"; `Some` carries the index the owning list
/// would need to remove it in O(1) (the list holds a `Vec<StreamId>`, so in
/// practice this is just a presence flag — the type exists so a second
/// enqueue attempt is a visible `debug_assert`, not a silent duplicate).
#[derive(Debug, Default, Clone, Copy)]
pub struct QueueMembership {
    pub output: Option<QueueSlot>,
    pub on_rto_wheel: Option<u32>,
    pub on_timewait: bool,
    pub on_idle: bool,
}

/// Jacobson/Karels RTT estimator state plus everything else gating the
/// send side: congestion window, retransmit count, cached egress info.
pub struct SendVars {
    pub iss: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub fss: Option<u32>,
    pub cwnd: u32,
    pub ssthresh: u32,
    pub peer_wnd: u32,
    pub mss: u16,
    pub eff_mss: u16,
    pub wscale_mine: u8,
    pub wscale_peer: u8,
    pub nrtx: u32,
    pub rto: Duration,
    pub ts_rto: Instant,
    pub ip_id: u16,
    pub ring: SendRing,
    pub last_wack_at: Option<Instant>,
    pub pacing_bps: Option<u64>,
    pub pacing_credit_bytes: i64,
}

/// Jacobson/Karels RTT state plus timestamp-option bookkeeping and the
/// receive side of the stream.
pub struct RecvVars {
    pub irs: u32,
    pub rcv_wnd: u32,
    pub snd_wl1: u32,
    pub snd_wl2: u32,
    pub last_ack_seq: u32,
    pub dup_acks: u32,
    pub srtt: Duration,
    pub mdev: Duration,
    pub mdev_max: Duration,
    pub rttvar: Duration,
    pub rtt_seq: u32,
    pub saw_timestamp: bool,
    pub ts_recent: u32,
    pub ts_last_ts_upd: Instant,
    pub ts_lastack_rcvd: Instant,
    pub ts_tw_expire: Instant,
    pub sack_permitted: bool,
    pub ring: RecvRing,
}

pub struct Stream {
    pub id: StreamId,
    pub tuple: FourTuple,
    pub state: TcpState,
    pub close_reason: CloseReason,
    pub rcv_nxt: u32,
    pub socket: Option<u32>,
    pub listener_port: Option<u16>,
    pub send: SendVars,
    pub recv: RecvVars,
    pub queues: QueueMembership,
    pub last_active: Instant,
    pub ack_pending: u32,
    pub addr_pool_slot: Option<PoolIndex>,
}

impl Stream {
    /// Constructs a fresh passive-open stream in LISTEN, as the input path
    /// does on receiving a SYN against a registered listener.
    #[allow(clippy::too_many_arguments)]
    pub fn new_passive(
        id: StreamId,
        tuple: FourTuple,
        listener_port: u16,
        peer_iss: u32,
        peer_window: u16,
        opts: &TcpOptions,
        our_iss: u32,
        send_buf_size: usize,
        recv_buf_size: usize,
        now: Instant,
    ) -> Self {
        let wscale_peer = opts.wscale.unwrap_or(0);
        let send = SendVars {
            iss: our_iss,
            snd_una: our_iss,
            snd_nxt: our_iss,
            fss: None,
            cwnd: u32::from(opts.mss.unwrap_or(536)) * 2,
            ssthresh: u32::MAX,
            peer_wnd: u32::from(peer_window),
            mss: opts.mss.unwrap_or(536),
            eff_mss: opts.mss.unwrap_or(536),
            wscale_mine: 7,
            wscale_peer,
            nrtx: 0,
            rto: Duration::from_millis(1000),
            ts_rto: now,
            ip_id: 1,
            ring: SendRing::new(send_buf_size, our_iss),
            last_wack_at: None,
            pacing_bps: None,
            pacing_credit_bytes: 0,
        };
        let recv = RecvVars {
            irs: peer_iss,
            rcv_wnd: recv_buf_size as u32,
            snd_wl1: peer_iss,
            snd_wl2: our_iss,
            last_ack_seq: our_iss,
            dup_acks: 0,
            srtt: Duration::ZERO,
            mdev: Duration::ZERO,
            mdev_max: Duration::ZERO,
            rttvar: Duration::ZERO,
            rtt_seq: our_iss,
            saw_timestamp: opts.timestamp.is_some(),
            ts_recent: opts.timestamp.map(|(v, _)| v).unwrap_or(0),
            ts_last_ts_upd: now,
            ts_lastack_rcvd: now,
            ts_tw_expire: now,
            sack_permitted: opts.sack_permitted,
            ring: RecvRing::new(recv_buf_size, peer_iss.wrapping_add(1)),
        };
        Self {
            id,
            tuple,
            state: TcpState::Listen,
            close_reason: CloseReason::NotClosed,
            rcv_nxt: peer_iss.wrapping_add(1),
            socket: None,
            listener_port: Some(listener_port),
            send,
            recv,
            queues: QueueMembership::default(),
            last_active: now,
            ack_pending: 0,
            addr_pool_slot: None,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_active = now;
    }
}
