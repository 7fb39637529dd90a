//! The engine main loop (component C11) and the socket API surface
//! (component C10) that sits on top of it. `Engine` replaces the source's
//! `g_mtcp[core]`/`CONFIG` globals with one value a thread owns outright;
//! `run_engine` is the pinned-thread shell, grounded on
//! `flux::tile::attach_tile`'s pin-then-loop-then-pace pattern but driving
//! this crate's tick instead of a tile's work closure.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tcpcore_comm::Queue;
use tcpcore_net::wire::eth::EthHeader;
use tcpcore_net::wire::tcp::{TcpFlags, TcpHeader, TcpOptions};
use tcpcore_net::{Driver, build_tcp_frame, parse_tcp_frame};
use tcpcore_timing::{Duration, Instant};
use tcpcore_utils::{ThreadPriority, thread_boot};
use tracing::{debug, info, trace, warn};

use crate::addr_pool::AddrPool;
use crate::config::Config;
use crate::congestion;
use crate::epoll::{EpollSet, EventMask, Trigger};
use crate::error::{CloseReason, EngineError, EngineResult};
use crate::flow::FlowTable;
use crate::input::{self, AckOutcome};
use crate::listener::{Listener, WakeupPipe};
use crate::output::{self, OutputLists};
use crate::ring::{RecvRing, SendRing};
use crate::socket::{SocketKind, SocketTable, SocketTarget};
use crate::stream::{FourTuple, QueueMembership, RecvVars, SendVars, Stream, StreamId, TcpState};
use crate::timers::{ExpiryFifo, RtoWheel};

const MAX_RTO_PER_TICK: usize = 256;
const MAX_TW_PER_TICK: usize = 256;
const DEFAULT_ACCEPT_BACKLOG: usize = 128;

#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest {
    pub sockid: u32,
    pub daddr: Ipv4Addr,
    pub dport: u16,
}

struct StreamSlots {
    slots: Vec<Option<Stream>>,
    free: Vec<u32>,
}

impl StreamSlots {
    fn with_capacity(cap: usize) -> Self {
        Self { slots: (0..cap).map(|_| None).collect(), free: (0..cap as u32).rev().collect() }
    }

    fn alloc(&mut self, build: impl FnOnce(StreamId) -> Stream) -> Option<StreamId> {
        let id = self.free.pop()?;
        self.slots[id as usize] = Some(build(id));
        Some(id)
    }

    fn get(&self, id: StreamId) -> Option<&Stream> {
        self.slots.get(id as usize).and_then(|s| s.as_ref())
    }

    fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.slots.get_mut(id as usize).and_then(|s| s.as_mut())
    }

    fn free(&mut self, id: StreamId) -> Option<Stream> {
        let slot = self.slots.get_mut(id as usize)?;
        let taken = slot.take()?;
        self.free.push(id);
        Some(taken)
    }
}

/// Per-core protocol engine. Owns the flow table, stream slots, address
/// pool, listeners, socket map, epoll sets, the three output lists, and
/// the timer wheels/FIFOs.
pub struct Engine<D: Driver> {
    pub config: Config,
    core_id: u32,
    iface: usize,
    driver: D,
    local_ip: Ipv4Addr,

    flow: FlowTable,
    streams: StreamSlots,
    addr_pool: AddrPool,
    listeners: HashMap<u16, Listener>,
    sockets: SocketTable,
    epolls: HashMap<u32, EpollSet>,
    next_epoll_id: u32,

    output: OutputLists,
    rto_wheel: RtoWheel,
    timewait: ExpiryFifo,
    idle: ExpiryFifo,

    connectq: Queue<ConnectRequest>,
    sendq: Queue<StreamId>,
    ackq: Queue<StreamId>,
    closeq: Queue<StreamId>,
    resetq: Queue<StreamId>,
    destroyq: Queue<StreamId>,

    wakeup: Arc<WakeupPipe>,
    interrupt: Arc<AtomicBool>,
    ready_version: HashMap<u32, u64>,
    last_tick: Option<Instant>,
    logged_addr_pool_exhausted: bool,
    logged_stream_pool_exhausted: bool,
}

impl<D: Driver> Engine<D> {
    pub fn new(config: Config, core_id: u32, local_ip: Ipv4Addr, driver: D, wakeup: Arc<WakeupPipe>, now: Instant) -> Self {
        let max_concurrency = config.max_concurrency;
        Self {
            flow: FlowTable::new(),
            streams: StreamSlots::with_capacity(max_concurrency),
            addr_pool: AddrPool::new(vec![local_ip]),
            listeners: HashMap::new(),
            sockets: SocketTable::with_capacity(max_concurrency + 64),
            epolls: HashMap::new(),
            next_epoll_id: 0,
            output: OutputLists::new(),
            rto_wheel: RtoWheel::new(now),
            timewait: ExpiryFifo::new(),
            idle: ExpiryFifo::new(),
            connectq: Queue::bounded(max_concurrency),
            sendq: Queue::bounded(max_concurrency),
            ackq: Queue::bounded(max_concurrency),
            closeq: Queue::bounded(max_concurrency),
            resetq: Queue::bounded(max_concurrency),
            destroyq: Queue::bounded(max_concurrency),
            wakeup,
            interrupt: Arc::new(AtomicBool::new(false)),
            ready_version: HashMap::new(),
            last_tick: None,
            logged_addr_pool_exhausted: false,
            logged_stream_pool_exhausted: false,
            config,
            core_id,
            iface: 0,
            driver,
            local_ip,
        }
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    fn bump_ready(&mut self, sockid: u32) {
        *self.ready_version.entry(sockid).or_insert(0) += 1;
    }

    // ---- one tick ----

    pub fn tick(&mut self, now: Instant) {
        let elapsed = self.last_tick.map(|t| now.wrapping_sub(t)).unwrap_or(Duration::ZERO);
        self.last_tick = Some(now);

        let frames = self.driver.rx_batch(self.iface);
        for frame in frames {
            self.input_path(&frame, now);
        }
        self.check_rto(now);
        self.check_timewait(now);
        if let Some(timeout_s) = self.config.tcp_timeout_s {
            self.check_idle(now, Duration::from_secs(timeout_s));
        }
        self.accrue_pacing(elapsed);
        self.check_window_probes(now);
        self.flush_epoll();
        self.drain_user_queues(now);
        self.write_output_lists(now);
        self.driver.tx_flush(self.iface);
    }

    /// Replenishes every paced stream's send credit by `rate_bps * elapsed`,
    /// capped at one send-buffer's worth so an idle paced stream can't bank
    /// unbounded credit. Streams without a pacing rate set are untouched.
    fn accrue_pacing(&mut self, elapsed: Duration) {
        let cap = self.config.send_buf_size as i64;
        for slot in self.streams.slots.iter_mut().flatten() {
            let Some(rate_bps) = slot.send.pacing_bps else { continue };
            let accrued = (rate_bps as u128 * elapsed.as_micros() as u128 / (8 * 1_000_000)) as i64;
            slot.send.pacing_credit_bytes = (slot.send.pacing_credit_bytes + accrued).min(cap);
        }
    }

    // ---- C5: input path ----

    fn input_path(&mut self, frame: &[u8], now: Instant) {
        let Ok(parsed) = parse_tcp_frame(frame) else {
            trace!(len = frame.len(), "dropping unparseable frame");
            return;
        };

        let tuple = FourTuple { saddr: parsed.ip.dst.into(), sport: parsed.tcp.dport, daddr: parsed.ip.src.into(), dport: parsed.tcp.sport };

        let Some(id) = self.flow.lookup(&tuple) else {
            self.handle_unknown_flow(&tuple, &parsed, now);
            return;
        };

        // RST handling and idle/last-active bookkeeping apply uniformly
        // before state dispatch.
        if let Some(stream) = self.streams.get_mut(id) {
            stream.touch(now);
            self.idle.refresh(id, now + self.config.tcp_timeout_s.map(Duration::from_secs).unwrap_or(Duration::ZERO));
        }

        if parsed.tcp.flags.has(TcpFlags::RST) {
            self.handle_reset(id, now);
            return;
        }

        self.dispatch_on_state(id, &parsed, now);
    }

    fn handle_unknown_flow(&mut self, tuple: &FourTuple, parsed: &tcpcore_net::TcpFrame<'_>, now: Instant) {
        let is_syn_only = parsed.tcp.flags.has(TcpFlags::SYN) && !parsed.tcp.flags.has(TcpFlags::ACK);
        if is_syn_only {
            if let Some(&listener_port) = self.listeners.get(&tuple.sport).map(|l| &l.port) {
                let our_iss = 1_000_000u32.wrapping_add(tuple.dport as u32);
                let send_buf = self.config.send_buf_size;
                let recv_buf = self.config.recv_buf_size;
                let id_opt = self.streams.alloc(|id| {
                    Stream::new_passive(
                        id,
                        *tuple,
                        listener_port,
                        parsed.tcp.seq,
                        parsed.tcp.window,
                        &parsed.options,
                        our_iss,
                        send_buf,
                        recv_buf,
                        now,
                    )
                });
                match id_opt {
                    Some(id) => {
                        self.logged_stream_pool_exhausted = false;
                        self.flow.insert(*tuple, id);
                        if let Some(stream) = self.streams.get_mut(id) {
                            stream.state = TcpState::SynRcvd;
                            self.output.enqueue_control(stream);
                        }
                    }
                    None => {
                        if !self.logged_stream_pool_exhausted {
                            warn!(core = self.core_id, "stream pool exhausted, dropping incoming SYN");
                            self.logged_stream_pool_exhausted = true;
                        }
                    }
                }
                return;
            }
        }
        // No listener, or not a bare SYN: RST the offending peer.
        self.emit_standalone_rst(tuple, parsed);
    }

    fn emit_standalone_rst(&mut self, tuple: &FourTuple, parsed: &tcpcore_net::TcpFrame<'_>) {
        let ack = if parsed.tcp.flags.has(TcpFlags::ACK) {
            parsed.tcp.ack
        } else {
            let seg_len = parsed.payload.len() as u32;
            let syn = u32::from(parsed.tcp.flags.has(TcpFlags::SYN));
            let fin = u32::from(parsed.tcp.flags.has(TcpFlags::FIN));
            parsed.tcp.seq.wrapping_add(seg_len).wrapping_add(syn).wrapping_add(fin)
        };
        let eth = EthHeader { dst: [0; 6], src: [0; 6], ethertype: tcpcore_net::wire::eth::ETHERTYPE_IPV4 };
        let header = TcpHeader {
            sport: tuple.sport,
            dport: tuple.dport,
            seq: if parsed.tcp.flags.has(TcpFlags::ACK) { parsed.tcp.ack } else { 0 },
            ack,
            flags: TcpFlags(TcpFlags::RST | if parsed.tcp.flags.has(TcpFlags::ACK) { 0 } else { TcpFlags::ACK }),
            window: 0,
            checksum: 0,
            urgent_ptr: 0,
        };
        let mut out = Vec::new();
        build_tcp_frame(&eth, tuple.saddr.octets(), tuple.daddr.octets(), 1, 64, &header, &TcpOptions::default(), &[], &mut out);
        if let Some(slot) = self.driver.get_wptr(self.iface, out.len()) {
            slot.copy_from_slice(&out);
        }
    }

    fn handle_reset(&mut self, id: StreamId, now: Instant) {
        let Some(stream) = self.streams.get_mut(id) else { return };
        if stream.state as u8 <= TcpState::SynSent as u8 {
            return;
        }
        if stream.state.is_data_transfer() {
            stream.close_reason = CloseReason::Reset;
            stream.state = TcpState::CloseWait;
            if let Some(sockid) = stream.socket {
                self.bump_ready(sockid);
                self.raise_on_socket_epoll(sockid, EventMask::EPOLLERR | EventMask::EPOLLHUP);
            }
        } else {
            let _ = self.destroyq.try_push(id);
        }
        let _ = now;
    }

    fn dispatch_on_state(&mut self, id: StreamId, parsed: &tcpcore_net::TcpFrame<'_>, now: Instant) {
        let Some(stream) = self.streams.get_mut(id) else { return };
        match stream.state {
            TcpState::Closed | TcpState::Listen => {}
            TcpState::SynSent => {
                if parsed.tcp.flags.has(TcpFlags::SYN) && parsed.tcp.flags.has(TcpFlags::ACK) {
                    if parsed.tcp.ack == stream.send.iss.wrapping_add(1) {
                        stream.send.snd_una = parsed.tcp.ack;
                        stream.recv.irs = parsed.tcp.seq;
                        stream.rcv_nxt = parsed.tcp.seq.wrapping_add(1);
                        stream.state = TcpState::Established;
                        self.output.enqueue_ack(stream);
                        if let Some(sockid) = stream.socket {
                            self.bump_ready(sockid);
                            self.raise_on_socket_epoll(sockid, EventMask::EPOLLOUT);
                        }
                    } else {
                        self.output.enqueue_control(stream);
                    }
                } else if parsed.tcp.flags.has(TcpFlags::SYN) {
                    stream.recv.irs = parsed.tcp.seq;
                    stream.rcv_nxt = parsed.tcp.seq.wrapping_add(1);
                    stream.state = TcpState::SynRcvd;
                    self.output.enqueue_control(stream);
                }
            }
            TcpState::SynRcvd => {
                if parsed.tcp.flags.has(TcpFlags::ACK) && parsed.tcp.ack == stream.send.iss.wrapping_add(1) {
                    stream.send.snd_una = parsed.tcp.ack;
                    stream.state = TcpState::Established;
                    if let Some(&listener_port) = stream.listener_port.as_ref() {
                        if let Some(listener) = self.listeners.get_mut(&listener_port) {
                            listener.push_completed(id);
                            let sockid = listener.socket;
                            self.bump_ready(sockid);
                            self.raise_on_socket_epoll(sockid, EventMask::EPOLLIN);
                        }
                    }
                }
            }
            TcpState::Established => {
                self.process_established(id, parsed, now);
            }
            TcpState::FinWait1 => {
                self.process_established(id, parsed, now);
                let Some(stream) = self.streams.get_mut(id) else { return };
                if let Some(fss) = stream.send.fss {
                    if (stream.send.snd_una.wrapping_sub(fss) as i32) >= 0 {
                        stream.state =
                            if parsed.tcp.flags.has(TcpFlags::FIN) { TcpState::TimeWait } else { TcpState::FinWait2 };
                        if stream.state == TcpState::TimeWait {
                            self.enter_timewait(id, now);
                        }
                    }
                }
            }
            TcpState::FinWait2 => {
                self.process_established(id, parsed, now);
                if parsed.tcp.flags.has(TcpFlags::FIN) {
                    self.enter_timewait(id, now);
                }
            }
            TcpState::Closing => {
                let Some(stream) = self.streams.get_mut(id) else { return };
                if let Some(fss) = stream.send.fss {
                    if (parsed.tcp.ack.wrapping_sub(fss) as i32) >= 0 {
                        self.enter_timewait(id, now);
                    }
                }
            }
            TcpState::CloseWait => {
                self.process_established(id, parsed, now);
            }
            TcpState::LastAck => {
                let Some(stream) = self.streams.get_mut(id) else { return };
                if let Some(fss) = stream.send.fss {
                    if parsed.tcp.flags.has(TcpFlags::ACK) && (parsed.tcp.ack.wrapping_sub(fss) as i32) >= 0 {
                        let _ = self.destroyq.try_push(id);
                    }
                }
            }
            TcpState::TimeWait => {
                let Some(stream) = self.streams.get_mut(id) else { return };
                stream.recv.ts_tw_expire = now + Duration::from_millis(self.config.tcp_timewait_ms);
                self.timewait.refresh(id, stream.recv.ts_tw_expire);
            }
        }
    }

    fn process_established(&mut self, id: StreamId, parsed: &tcpcore_net::TcpFrame<'_>, now: Instant) {
        let Some(stream) = self.streams.get_mut(id) else { return };

        if !parsed.payload.is_empty() {
            let advanced = stream.recv.ring.insert(parsed.tcp.seq, parsed.payload);
            if advanced {
                stream.rcv_nxt = stream.recv.ring.head_seq();
                self.output.enqueue_ack(stream);
                if let Some(sockid) = stream.socket {
                    self.bump_ready(sockid);
                    self.raise_on_socket_epoll(sockid, EventMask::EPOLLIN);
                }
            }
        }

        if parsed.tcp.flags.has(TcpFlags::ACK) {
            let ts_echo = parsed.options.timestamp;
            let outcome =
                input::process_ack(stream, parsed.tcp.ack, u32::from(parsed.tcp.window), ts_echo, parsed.payload.len(), now);
            match outcome {
                AckOutcome::Stale => {}
                AckOutcome::Duplicate { count } => {
                    if count == 3 {
                        congestion::enter_fast_retransmit(&mut stream.send);
                        stream.send.snd_nxt = stream.send.snd_una;
                        self.output.enqueue_send(stream);
                    } else if count > 3 {
                        congestion::inflate_during_recovery(&mut stream.send);
                    }
                }
                AckOutcome::Fresh { window_opened, .. } => {
                    if stream.send.snd_nxt != stream.send.snd_una {
                        stream.send.ts_rto = now + stream.send.rto;
                        let idx = self.rto_wheel.schedule(id, stream.send.ts_rto);
                        stream.queues.on_rto_wheel = Some(idx as u32);
                    } else if let Some(idx) = stream.queues.on_rto_wheel.take() {
                        self.rto_wheel.cancel(id, idx as usize);
                    }
                    if window_opened {
                        if let Some(sockid) = stream.socket {
                            self.bump_ready(sockid);
                            self.raise_on_socket_epoll(sockid, EventMask::EPOLLOUT);
                        }
                    }
                }
            }
        }

        let stream = match self.streams.get_mut(id) {
            Some(s) => s,
            None => return,
        };
        if parsed.tcp.flags.has(TcpFlags::FIN) && (parsed.tcp.seq.wrapping_add(parsed.payload.len() as u32).wrapping_sub(stream.rcv_nxt) as i32) >= 0
        {
            stream.rcv_nxt = stream.rcv_nxt.wrapping_add(1);
            self.output.enqueue_ack(stream);
            let next_state = match stream.state {
                TcpState::Established => TcpState::CloseWait,
                TcpState::FinWait1 => TcpState::Closing,
                TcpState::FinWait2 => TcpState::TimeWait,
                other => other,
            };
            stream.state = next_state;
            if let Some(sockid) = stream.socket {
                self.bump_ready(sockid);
                self.raise_on_socket_epoll(sockid, EventMask::EPOLLIN);
            }
            if next_state == TcpState::TimeWait {
                self.enter_timewait(id, now);
            }
        }
    }

    fn enter_timewait(&mut self, id: StreamId, now: Instant) {
        if let Some(stream) = self.streams.get_mut(id) {
            stream.state = TcpState::TimeWait;
            stream.recv.ts_tw_expire = now + Duration::from_millis(self.config.tcp_timewait_ms);
            self.timewait.push(id, stream.recv.ts_tw_expire);
        }
    }

    fn raise_on_socket_epoll(&mut self, sockid: u32, mask: u32) {
        // Epoll registrations are per epoll-set, not per-socket; a real
        // deployment tracks which epoll-set(s) a socket is registered
        // against. This engine raises directly through `self.epolls` for
        // every set that has a registration for the socket.
        for ep in self.epolls.values_mut() {
            ep.raise(sockid, mask);
        }
    }

    // ---- C7: timers ----

    fn check_rto(&mut self, now: Instant) {
        let fired = self.rto_wheel.advance(now);
        for id in fired.into_iter().take(MAX_RTO_PER_TICK) {
            let Some(stream) = self.streams.get_mut(id) else { continue };
            stream.queues.on_rto_wheel = None;
            let is_syn = matches!(stream.state, TcpState::SynSent | TcpState::SynRcvd);
            let destroy = congestion::on_rto_fired(&mut stream.send, &stream.recv, is_syn);
            if destroy {
                let reason = if is_syn { CloseReason::ConnFail } else { CloseReason::ConnLost };
                stream.close_reason = reason;
                debug!(stream = id, nrtx = stream.send.nrtx, "retransmit budget exhausted, tearing down stream");
                if let Some(sockid) = stream.socket {
                    self.bump_ready(sockid);
                    self.raise_on_socket_epoll(sockid, EventMask::EPOLLERR | EventMask::EPOLLHUP);
                }
                let _ = self.destroyq.try_push(id);
                continue;
            }
            stream.send.snd_nxt = stream.send.snd_una;
            if stream.state == TcpState::SynSent || stream.state == TcpState::SynRcvd {
                self.output.enqueue_control(stream);
            } else {
                self.output.enqueue_send(stream);
            }
            stream.send.ts_rto = now + stream.send.rto;
            let idx = self.rto_wheel.schedule(id, stream.send.ts_rto);
            stream.queues.on_rto_wheel = Some(idx as u32);
        }
    }

    fn check_timewait(&mut self, now: Instant) {
        let expired = self.timewait.drain_expired(now, MAX_TW_PER_TICK);
        for id in expired {
            self.destroy_stream(id);
        }
    }

    fn check_idle(&mut self, now: Instant, threshold: Duration) {
        let _ = threshold;
        let expired = self.idle.drain_expired(now, MAX_TW_PER_TICK);
        for id in expired {
            if let Some(stream) = self.streams.get_mut(id) {
                stream.close_reason = CloseReason::TimedOut;
                debug!(stream = id, "idle timeout reaped stream");
                if let Some(sockid) = stream.socket {
                    self.bump_ready(sockid);
                    self.raise_on_socket_epoll(sockid, EventMask::EPOLLHUP);
                }
            }
            let _ = self.destroyq.try_push(id);
        }
    }

    // ---- C9: epoll promotion ----

    fn flush_epoll(&mut self) {
        for ep in self.epolls.values_mut() {
            ep.flush_to_user_queue();
        }
    }

    // ---- cross-thread command drain ----

    fn drain_user_queues(&mut self, now: Instant) {
        let connects: Vec<_> = std::iter::from_fn(|| self.connectq.try_pop()).collect();
        for req in connects {
            self.perform_connect(req, now);
        }
        let sends: Vec<_> = std::iter::from_fn(|| self.sendq.try_pop()).collect();
        for id in sends {
            if let Some(stream) = self.streams.get_mut(id) {
                if !stream.send.ring.is_empty() {
                    self.output.enqueue_send(stream);
                }
            }
        }
        let acks: Vec<_> = std::iter::from_fn(|| self.ackq.try_pop()).collect();
        for id in acks {
            if let Some(stream) = self.streams.get_mut(id) {
                self.output.enqueue_ack(stream);
            }
        }
        let closes: Vec<_> = std::iter::from_fn(|| self.closeq.try_pop()).collect();
        for id in closes {
            self.perform_close(id, now);
        }
        let resets: Vec<_> = std::iter::from_fn(|| self.resetq.try_pop()).collect();
        for id in resets {
            if let Some(stream) = self.streams.get_mut(id) {
                stream.close_reason = CloseReason::ActiveClose;
                self.output.enqueue_control(stream);
            }
            let _ = self.destroyq.try_push(id);
        }
        // destroyq last: still-referenced streams have already had their
        // events raised above, by construction of the drain order.
        let destroys: Vec<_> = std::iter::from_fn(|| self.destroyq.try_pop()).collect();
        for id in destroys {
            self.destroy_stream(id);
        }
    }

    fn perform_connect(&mut self, req: ConnectRequest, now: Instant) {
        let rss_key = self.config.rss_key;
        let fetched = self.addr_pool.fetch(req.daddr, req.dport, &rss_key, self.core_id, self.config.cores.max(1) as u32);
        let Ok((local_ip, local_port)) = fetched else {
            if !self.logged_addr_pool_exhausted {
                warn!(daddr = %req.daddr, dport = req.dport, "address pool exhausted, dropping connect");
                self.logged_addr_pool_exhausted = true;
            }
            if let Ok(entry) = self.sockets.get_mut(req.sockid) {
                entry.target = SocketTarget::None;
            }
            self.bump_ready(req.sockid);
            return;
        };
        self.logged_addr_pool_exhausted = false;
        let tuple = FourTuple { saddr: local_ip, sport: local_port, daddr: req.daddr, dport: req.dport };
        let iss = 2_000_000u32.wrapping_add(local_port as u32);
        let send_buf = self.config.send_buf_size;
        let recv_buf = self.config.recv_buf_size;
        let id_opt = self.streams.alloc(|id| Stream {
            id,
            tuple,
            state: TcpState::SynSent,
            close_reason: CloseReason::NotClosed,
            rcv_nxt: 0,
            socket: Some(req.sockid),
            listener_port: None,
            send: SendVars {
                iss,
                snd_una: iss,
                snd_nxt: iss.wrapping_add(1),
                fss: None,
                cwnd: 536 * 2,
                ssthresh: u32::MAX,
                peer_wnd: 0,
                mss: 1460,
                eff_mss: 1460,
                wscale_mine: 7,
                wscale_peer: 0,
                nrtx: 0,
                rto: Duration::from_millis(1000),
                ts_rto: now + Duration::from_millis(1000),
                ip_id: 1,
                ring: SendRing::new(send_buf, iss),
                last_wack_at: None,
                pacing_bps: None,
                pacing_credit_bytes: 0,
            },
            recv: RecvVars {
                irs: 0,
                rcv_wnd: recv_buf as u32,
                snd_wl1: 0,
                snd_wl2: 0,
                last_ack_seq: iss,
                dup_acks: 0,
                srtt: Duration::ZERO,
                mdev: Duration::ZERO,
                mdev_max: Duration::ZERO,
                rttvar: Duration::ZERO,
                rtt_seq: iss,
                saw_timestamp: false,
                ts_recent: 0,
                ts_last_ts_upd: now,
                ts_lastack_rcvd: now,
                ts_tw_expire: now,
                sack_permitted: false,
                ring: RecvRing::new(recv_buf, 0),
            },
            queues: QueueMembership::default(),
            last_active: now,
            ack_pending: 0,
            addr_pool_slot: None,
        });
        let Some(id) = id_opt else {
            if !self.logged_stream_pool_exhausted {
                warn!(core = self.core_id, "stream pool exhausted, dropping connect");
                self.logged_stream_pool_exhausted = true;
            }
            self.addr_pool.release(local_ip, local_port);
            return;
        };
        self.logged_stream_pool_exhausted = false;
        self.flow.insert(tuple, id);
        if let Ok(entry) = self.sockets.get_mut(req.sockid) {
            entry.target = SocketTarget::Stream(id);
            entry.local_addr = Some((local_ip, local_port));
        }
        if let Some(stream) = self.streams.get_mut(id) {
            self.output.enqueue_control(stream);
            let deadline = now + stream.send.rto;
            let idx = self.rto_wheel.schedule(id, deadline);
            stream.queues.on_rto_wheel = Some(idx as u32);
        }
    }

    fn perform_close(&mut self, id: StreamId, now: Instant) {
        let Some(stream) = self.streams.get_mut(id) else { return };
        stream.close_reason = CloseReason::ActiveClose;
        match stream.state {
            TcpState::Established => {
                let fss = stream.send.snd_una.wrapping_add(stream.send.ring.len() as u32);
                stream.send.fss = Some(fss);
                stream.state = TcpState::FinWait1;
                self.output.enqueue_control(stream);
            }
            TcpState::CloseWait => {
                let fss = stream.send.snd_una.wrapping_add(stream.send.ring.len() as u32);
                stream.send.fss = Some(fss);
                stream.state = TcpState::LastAck;
                self.output.enqueue_control(stream);
            }
            _ => {}
        }
        let _ = now;
    }

    fn destroy_stream(&mut self, id: StreamId) {
        if let Some(idx) = self.streams.get(id).and_then(|s| s.queues.on_rto_wheel) {
            self.rto_wheel.cancel(id, idx as usize);
        }
        if let Some(stream) = self.streams.free(id) {
            self.flow.remove(&stream.tuple);
            self.timewait.remove(id);
            self.idle.remove(id);
            self.addr_pool.release(stream.tuple.saddr, stream.tuple.sport);
            if let Some(sockid) = stream.socket {
                if let Ok(entry) = self.sockets.get_mut(sockid) {
                    entry.target = SocketTarget::None;
                }
                self.bump_ready(sockid);
            }
        }
    }

    // ---- C6: output ----

    fn write_output_lists(&mut self, now: Instant) {
        let control: Vec<_> = std::mem::take(&mut self.output.control);
        for id in control {
            self.emit_control(id);
        }
        let ack: Vec<_> = self.streams.slots.iter().enumerate().filter(|(_, s)| s.as_ref().is_some_and(|s| s.ack_pending > 0)).map(|(i, _)| i as u32).collect();
        for id in ack {
            self.emit_ack(id);
        }
        let send: Vec<_> = std::mem::take(&mut self.output.send);
        for id in send {
            self.emit_data(id, now);
        }
    }

    fn emit_control(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get_mut(id) else { return };
        OutputLists::clear_output_membership(stream);
        let (flags, seq) = match stream.state {
            TcpState::SynSent => (TcpFlags(TcpFlags::SYN), stream.send.iss),
            TcpState::SynRcvd => (TcpFlags(TcpFlags::SYN | TcpFlags::ACK), stream.send.iss),
            TcpState::FinWait1 | TcpState::LastAck => {
                (TcpFlags(TcpFlags::FIN | TcpFlags::ACK), stream.send.fss.unwrap_or(stream.send.snd_nxt))
            }
            _ => (TcpFlags(TcpFlags::ACK), stream.send.snd_nxt),
        };
        let (header, options) = output::build_segment_header(stream, flags, seq, None);
        let mut out = Vec::new();
        let eth = EthHeader { dst: [0; 6], src: [0; 6], ethertype: tcpcore_net::wire::eth::ETHERTYPE_IPV4 };
        build_tcp_frame(&eth, stream.tuple.saddr.octets(), stream.tuple.daddr.octets(), stream.send.ip_id, 64, &header, &options, &[], &mut out);
        if flags.has(TcpFlags::FIN) {
            stream.send.snd_nxt = stream.send.snd_nxt.wrapping_add(1);
        }
        stream.send.ip_id = stream.send.ip_id.wrapping_add(1);
        if let Some(slot) = self.driver.get_wptr(self.iface, out.len()) {
            slot.copy_from_slice(&out);
        }
    }

    fn emit_ack(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get_mut(id) else { return };
        stream.ack_pending = 0;
        let (header, options) = output::build_segment_header(stream, TcpFlags(TcpFlags::ACK), stream.send.snd_nxt, None);
        let mut out = Vec::new();
        let eth = EthHeader { dst: [0; 6], src: [0; 6], ethertype: tcpcore_net::wire::eth::ETHERTYPE_IPV4 };
        build_tcp_frame(&eth, stream.tuple.saddr.octets(), stream.tuple.daddr.octets(), stream.send.ip_id, 64, &header, &options, &[], &mut out);
        stream.send.ip_id = stream.send.ip_id.wrapping_add(1);
        if let Some(slot) = self.driver.get_wptr(self.iface, out.len()) {
            slot.copy_from_slice(&out);
        }
    }

    fn emit_data(&mut self, id: StreamId, now: Instant) {
        let Some(stream) = self.streams.get_mut(id) else { return };
        let budget = output::send_budget(stream, stream.send.pacing_bps.map(|_| stream.send.pacing_credit_bytes.max(0) as u32));
        let draw = (budget as usize).min(usize::from(stream.send.eff_mss));
        let offset = (stream.send.snd_nxt.wrapping_sub(stream.send.snd_una)) as usize;
        let bytes = stream.send.ring.peek(offset, draw);
        if bytes.is_empty() {
            OutputLists::clear_output_membership(stream);
            return;
        }
        let was_outstanding = stream.send.snd_nxt != stream.send.snd_una;
        let seq = stream.send.snd_nxt;
        let (header, options) = output::build_segment_header(stream, TcpFlags(TcpFlags::ACK), seq, None);
        let mut out = Vec::new();
        let eth = EthHeader { dst: [0; 6], src: [0; 6], ethertype: tcpcore_net::wire::eth::ETHERTYPE_IPV4 };
        build_tcp_frame(&eth, stream.tuple.saddr.octets(), stream.tuple.daddr.octets(), stream.send.ip_id, 64, &header, &options, &bytes, &mut out);
        stream.send.ip_id = stream.send.ip_id.wrapping_add(1);
        stream.send.snd_nxt = stream.send.snd_nxt.wrapping_add(bytes.len() as u32);
        stream.ack_pending = 0;
        if !was_outstanding {
            stream.send.ts_rto = now + stream.send.rto;
            let idx = self.rto_wheel.schedule(id, stream.send.ts_rto);
            stream.queues.on_rto_wheel = Some(idx as u32);
        }
        let remaining = stream.send.ring.len() - (stream.send.snd_nxt.wrapping_sub(stream.send.snd_una)) as usize;
        if remaining == 0 {
            OutputLists::clear_output_membership(stream);
        }
        if let Some(slot) = self.driver.get_wptr(self.iface, out.len()) {
            slot.copy_from_slice(&out);
        }
    }

    /// Checks every live stream for a due window probe, independent of
    /// output-list membership, so a stalled stream (peer window closed,
    /// the reopening ACK lost) keeps retrying at the `WACK_INTERVAL` cadence
    /// instead of waiting for an event that already went missing.
    fn check_window_probes(&mut self, now: Instant) {
        let due: Vec<StreamId> = self
            .streams
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().filter(|s| output::window_probe_due(s, now)).map(|_| i as u32))
            .collect();
        for id in due {
            self.emit_window_probe(id, now);
        }
    }

    /// Sends a single byte of already-buffered data as a window probe
    /// (WACK), re-using whichever byte is next to send (or the earliest
    /// unacked byte, if nothing new has been sent yet) purely to elicit a
    /// window-update ACK from the peer.
    fn emit_window_probe(&mut self, id: StreamId, now: Instant) {
        let Some(stream) = self.streams.get_mut(id) else { return };
        let offset = (stream.send.snd_nxt.wrapping_sub(stream.send.snd_una) as usize).min(stream.send.ring.len().saturating_sub(1));
        let byte = stream.send.ring.peek(offset, 1);
        if byte.is_empty() {
            return;
        }
        let seq = stream.send.snd_una.wrapping_add(offset as u32);
        let (header, options) = output::build_segment_header(stream, TcpFlags(TcpFlags::ACK), seq, None);
        let mut out = Vec::new();
        let eth = EthHeader { dst: [0; 6], src: [0; 6], ethertype: tcpcore_net::wire::eth::ETHERTYPE_IPV4 };
        build_tcp_frame(&eth, stream.tuple.saddr.octets(), stream.tuple.daddr.octets(), stream.send.ip_id, 64, &header, &options, &byte, &mut out);
        stream.send.ip_id = stream.send.ip_id.wrapping_add(1);
        stream.send.last_wack_at = Some(now);
        if let Some(slot) = self.driver.get_wptr(self.iface, out.len()) {
            slot.copy_from_slice(&out);
        }
    }

    // ---- C10: socket API ----

    pub fn socket(&mut self) -> EngineResult<u32> {
        self.sockets.alloc(SocketKind::Unused)
    }

    pub fn bind(&mut self, sockid: u32, ip: Ipv4Addr, port: u16) -> EngineResult<()> {
        let entry = self.sockets.get_mut(sockid)?;
        if entry.flags.addr_bound {
            return Err(EngineError::InvalidArgument("already bound"));
        }
        entry.local_addr = Some((ip, port));
        entry.flags.addr_bound = true;
        Ok(())
    }

    pub fn listen(&mut self, sockid: u32, backlog: usize) -> EngineResult<()> {
        let entry = self.sockets.get_mut(sockid)?;
        let Some((_, port)) = entry.local_addr else {
            return Err(EngineError::InvalidArgument("listen before bind"));
        };
        entry.kind = SocketKind::StreamListen;
        entry.target = SocketTarget::Listener(port);
        if self.listeners.contains_key(&port) {
            return Err(EngineError::AddressInUse((self.local_ip, port)));
        }
        self.listeners.insert(port, Listener::new(port, sockid, backlog.max(1).min(DEFAULT_ACCEPT_BACKLOG * 8)));
        Ok(())
    }

    pub fn accept(&mut self, sockid: u32) -> EngineResult<u32> {
        let entry = self.sockets.expect_kind(sockid, SocketKind::StreamListen)?;
        let SocketTarget::Listener(port) = entry.target else { return Err(EngineError::NotConnected) };
        let nonblocking = entry.flags.nonblocking;
        let stream_id = {
            let listener = self.listeners.get_mut(&port).ok_or(EngineError::NotConnected)?;
            match listener.pop_accepted() {
                Some(id) => id,
                None => return Err(if nonblocking { EngineError::WouldBlock } else { EngineError::InProgress }),
            }
        };
        let new_sockid = self.sockets.alloc(SocketKind::Stream)?;
        if let Some(stream) = self.streams.get_mut(stream_id) {
            stream.socket = Some(new_sockid);
        }
        let entry = self.sockets.get_mut(new_sockid)?;
        entry.target = SocketTarget::Stream(stream_id);
        Ok(new_sockid)
    }

    pub fn connect(&mut self, sockid: u32, daddr: Ipv4Addr, dport: u16) -> EngineResult<()> {
        {
            let entry = self.sockets.get(sockid)?;
            if entry.target != SocketTarget::None {
                return Err(EngineError::AlreadyConnected);
            }
        }
        self.sockets.get_mut(sockid)?.kind = SocketKind::Stream;
        self.connectq
            .try_push(ConnectRequest { sockid, daddr, dport })
            .map_err(|_| EngineError::OutOfMemory("connectq"))?;
        self.wakeup.notify();
        Err(EngineError::InProgress)
    }

    fn stream_for(&self, sockid: u32) -> EngineResult<StreamId> {
        match self.sockets.get(sockid)?.target {
            SocketTarget::Stream(id) => Ok(id),
            _ => Err(EngineError::NotConnected),
        }
    }

    pub fn read(&mut self, sockid: u32, max_len: usize, peek: bool) -> EngineResult<Vec<u8>> {
        let id = self.stream_for(sockid)?;
        let stream = self.streams.get_mut(id).ok_or(EngineError::NotConnected)?;
        let before_free = stream.recv.rcv_wnd as usize - stream.recv.ring.merged_len().min(stream.recv.rcv_wnd as usize);
        let bytes = stream.recv.ring.read(max_len, peek);
        if bytes.is_empty() {
            if stream.state.peer_has_closed() {
                return Ok(Vec::new());
            }
            if stream.state.is_data_transfer() {
                let nonblocking = self.sockets.get(sockid)?.flags.nonblocking;
                return if nonblocking { Err(EngineError::WouldBlock) } else { Ok(Vec::new()) };
            }
        }
        if !peek {
            let after_free = stream.recv.rcv_wnd as usize - stream.recv.ring.merged_len().min(stream.recv.rcv_wnd as usize);
            if after_free.saturating_sub(before_free) >= usize::from(stream.send.mss) {
                let _ = self.ackq.try_push(id);
            }
        }
        Ok(bytes)
    }

    pub fn write(&mut self, sockid: u32, data: &[u8]) -> EngineResult<usize> {
        let id = self.stream_for(sockid)?;
        let stream = self.streams.get_mut(id).ok_or(EngineError::NotConnected)?;
        if !stream.state.is_data_transfer() {
            return Err(EngineError::NotConnected);
        }
        let was_full = stream.send.ring.free_space() == 0;
        let n = stream.send.ring.put(data);
        if n == 0 && !was_full {
            return Ok(0);
        }
        let _ = self.sendq.try_push(id);
        self.wakeup.notify();
        if n == 0 {
            let nonblocking = self.sockets.get(sockid)?.flags.nonblocking;
            if nonblocking {
                return Err(EngineError::WouldBlock);
            }
        }
        Ok(n)
    }

    pub fn close(&mut self, sockid: u32) -> EngineResult<()> {
        let entry = self.sockets.get(sockid)?;
        if let SocketTarget::Stream(id) = entry.target {
            let _ = self.closeq.try_push(id);
        }
        self.sockets.free(sockid)
    }

    pub fn abort(&mut self, sockid: u32) -> EngineResult<()> {
        let entry = self.sockets.get(sockid)?;
        if let SocketTarget::Stream(id) = entry.target {
            let _ = self.resetq.try_push(id);
        }
        self.sockets.free(sockid)
    }

    pub fn ioctl_fionread(&self, sockid: u32) -> EngineResult<usize> {
        let id = self.stream_for(sockid)?;
        Ok(self.streams.get(id).map(|s| s.recv.ring.merged_len()).unwrap_or(0))
    }

    pub fn setsockopt_nonblock(&mut self, sockid: u32, nonblocking: bool) -> EngineResult<()> {
        self.sockets.get_mut(sockid)?.flags.nonblocking = nonblocking;
        Ok(())
    }

    pub fn getsockopt_nonblock(&self, sockid: u32) -> EngineResult<bool> {
        Ok(self.sockets.get(sockid)?.flags.nonblocking)
    }

    /// Caps a stream's send rate below line rate, independent of cwnd.
    /// `None` disables pacing and lets the stream send at full window speed.
    pub fn setsockopt_pacing_rate(&mut self, sockid: u32, rate_bps: Option<u64>) -> EngineResult<()> {
        let id = self.stream_for(sockid)?;
        let stream = self.streams.get_mut(id).ok_or(EngineError::NotConnected)?;
        stream.send.pacing_bps = rate_bps;
        stream.send.pacing_credit_bytes = 0;
        Ok(())
    }

    pub fn getsockname(&self, sockid: u32) -> EngineResult<(Ipv4Addr, u16)> {
        self.sockets.get(sockid)?.local_addr.ok_or(EngineError::InvalidArgument("not bound"))
    }

    pub fn getpeername(&self, sockid: u32) -> EngineResult<(Ipv4Addr, u16)> {
        let id = self.stream_for(sockid)?;
        let stream = self.streams.get(id).ok_or(EngineError::NotConnected)?;
        Ok((stream.tuple.daddr, stream.tuple.dport))
    }

    pub fn epoll_create(&mut self) -> u32 {
        let id = self.next_epoll_id;
        self.next_epoll_id += 1;
        self.epolls.insert(id, EpollSet::new(self.config.max_concurrency));
        id
    }

    pub fn epoll_ctl_add(&mut self, epoll_id: u32, sockid: u32, mask: u32, trigger: Trigger, data: u64) -> EngineResult<()> {
        let currently_ready = self.current_readiness(sockid);
        let ep = self.epolls.get_mut(&epoll_id).ok_or(EngineError::InvalidDescriptor(epoll_id))?;
        ep.ctl_add(sockid, mask, trigger, data, currently_ready);
        Ok(())
    }

    pub fn epoll_ctl_mod(&mut self, epoll_id: u32, sockid: u32, mask: u32, trigger: Trigger, data: u64) -> EngineResult<()> {
        self.epolls.get_mut(&epoll_id).ok_or(EngineError::InvalidDescriptor(epoll_id))?.ctl_mod(sockid, mask, trigger, data);
        Ok(())
    }

    pub fn epoll_ctl_del(&mut self, epoll_id: u32, sockid: u32) -> EngineResult<()> {
        self.epolls.get_mut(&epoll_id).ok_or(EngineError::InvalidDescriptor(epoll_id))?.ctl_del(sockid);
        Ok(())
    }

    pub fn epoll_wait(&mut self, epoll_id: u32, max_events: usize) -> EngineResult<Vec<crate::epoll::Event>> {
        let sockets = &self.sockets;
        let streams = &self.streams;
        let ep = self.epolls.get_mut(&epoll_id).ok_or(EngineError::InvalidDescriptor(epoll_id))?;
        Ok(ep.wait(max_events, |sockid, mask| {
            let Ok(entry) = sockets.get(sockid) else { return false };
            let SocketTarget::Stream(id) = entry.target else { return false };
            let Some(stream) = streams.get(id) else { return false };
            (mask & EventMask::EPOLLIN != 0 && stream.recv.ring.merged_len() > 0)
                || (mask & EventMask::EPOLLOUT != 0
                    && stream.send.peer_wnd > stream.send.snd_nxt.wrapping_sub(stream.send.snd_una))
        }))
    }

    fn current_readiness(&self, sockid: u32) -> u32 {
        let Ok(entry) = self.sockets.get(sockid) else { return 0 };
        let SocketTarget::Stream(id) = entry.target else { return 0 };
        let Some(stream) = self.streams.get(id) else { return 0 };
        let mut mask = 0;
        if stream.recv.ring.merged_len() > 0 {
            mask |= EventMask::EPOLLIN;
        }
        if stream.send.peer_wnd > stream.send.snd_nxt.wrapping_sub(stream.send.snd_una) {
            mask |= EventMask::EPOLLOUT;
        }
        mask
    }

    /// Drains every remaining stream on interrupt (e.g. SIGINT): issues
    /// RSTs for active connections rather than waiting out a graceful
    /// close, then frees everything.
    pub fn shutdown_now(&mut self) {
        let ids: Vec<StreamId> = self.streams.slots.iter().enumerate().filter_map(|(i, s)| s.as_ref().map(|_| i as u32)).collect();
        for id in ids {
            if let Some(stream) = self.streams.get_mut(id) {
                if stream.state.is_data_transfer() {
                    self.output.control.push(id);
                }
            }
            self.destroy_stream(id);
        }
    }
}

/// Handle shared across user threads that talk to the same engine. Pairs
/// the engine behind a mutex with a condvar blocking calls park on;
/// `run_engine` owns the lock only for the duration of one tick, so
/// blocking API calls never starve the tick loop for long.
pub struct EngineHandle<D: Driver> {
    engine: Arc<Mutex<Engine<D>>>,
    cv: Arc<Condvar>,
}

impl<D: Driver> Clone for EngineHandle<D> {
    fn clone(&self) -> Self {
        Self { engine: self.engine.clone(), cv: self.cv.clone() }
    }
}

impl<D: Driver> EngineHandle<D> {
    pub fn new(engine: Engine<D>) -> Self {
        Self { engine: Arc::new(Mutex::new(engine)), cv: Arc::new(Condvar::new()) }
    }

    pub fn with_engine<R>(&self, f: impl FnOnce(&mut Engine<D>) -> R) -> R {
        let mut guard = self.engine.lock().unwrap();
        let r = f(&mut guard);
        self.cv.notify_all();
        r
    }

    /// Polls `op` until it stops returning `WouldBlock`/`InProgress`,
    /// parking on the shared condvar between attempts. `run_engine` wakes
    /// this condvar every tick, so the wait is bounded by tick latency.
    pub fn blocking<R>(&self, mut op: impl FnMut(&mut Engine<D>) -> EngineResult<R>) -> EngineResult<R> {
        loop {
            let mut guard = self.engine.lock().unwrap();
            match op(&mut guard) {
                Err(EngineError::WouldBlock) | Err(EngineError::InProgress) => {
                    let (g, _) = self.cv.wait_timeout(guard, std::time::Duration::from_millis(50)).unwrap();
                    drop(g);
                }
                other => return other,
            }
        }
    }
}

/// Pinned-thread shell for one engine: sets thread affinity/priority, then
/// loops `tick` until the interrupt flag is set. Grounded on
/// `flux::tile::attach_tile`'s pin-then-run pattern, adapted to call this
/// crate's tick instead of a tile work closure and to honor the
/// configurable `min_tick_duration` pacing via `tcpcore_utils::vsync`.
pub fn run_engine<D: Driver + Send + 'static>(handle: EngineHandle<D>, core: usize, priority: ThreadPriority) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let _span = tracing::span!(tracing::Level::INFO, "engine", core).entered();
        thread_boot(Some(core), priority);
        let interrupt = handle.with_engine(|e| e.interrupt_flag());
        info!("engine started");
        loop {
            if interrupt.load(Ordering::Acquire) {
                info!("engine shutting down");
                handle.with_engine(|e| e.shutdown_now());
                break;
            }
            let min_tick = handle.with_engine(|e| e.config.min_tick_duration);
            let now = Instant::now();
            tcpcore_utils::vsync(min_tick, || {
                handle.with_engine(|e| e.tick(now));
            });
        }
    })
}
