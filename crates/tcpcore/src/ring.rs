//! Send and receive ring buffers (component C1), grounded on
//! `tcp_ring_buffer.c`/`tcp_ring_buffer.h`: a circular byte region per
//! stream, plus, for the receive side, a sorted list of fragment contexts
//! describing out-of-order arrivals that get merged into the in-order
//! prefix as gaps close.

use std::collections::VecDeque;

/// Circular send buffer: bytes from `head_seq` (== `snd_una`) to
/// `head_seq + len` (== the application append cursor). `put` appends at
/// the tail; `remove` frees bytes from the head once they're ACKed.
///
/// Invariant (spec'd): `head_seq + len == app_append_seq`. `len` here
/// stands in for `app_append_seq - head_seq`, so the invariant holds by
/// construction rather than needing a separate field.
pub struct SendRing {
    buf: VecDeque<u8>,
    capacity: usize,
    head_seq: u32,
}

impl SendRing {
    pub fn new(capacity: usize, initial_seq: u32) -> Self {
        Self { buf: VecDeque::with_capacity(capacity), capacity, head_seq: initial_seq }
    }

    pub fn head_seq(&self) -> u32 {
        self.head_seq
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn free_space(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Appends as many bytes of `data` as fit, returning how many were
    /// actually accepted. A short write leaves the remainder for the
    /// application to retry once space frees up (mirrors `write`'s
    /// short-write semantics against a bounded buffer).
    pub fn put(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free_space());
        self.buf.extend(&data[..n]);
        n
    }

    /// Frees `n` bytes from the head (an ACK covering them arrived),
    /// advancing `head_seq` by `n`.
    pub fn remove(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
        self.head_seq = self.head_seq.wrapping_add(n as u32);
    }

    /// Reads up to `max_len` bytes starting `offset` bytes past `head_seq`
    /// (used by the output path to draw a segment's worth of unacked data
    /// without removing it — removal only happens on ACK).
    pub fn peek(&self, offset: usize, max_len: usize) -> Vec<u8> {
        self.buf.iter().skip(offset).take(max_len).copied().collect()
    }
}

/// A contiguous seq range `[seq, seq + data.len())` that arrived but may
/// not yet be contiguous with `head_seq`.
struct Fragment {
    seq: u32,
    data: Vec<u8>,
}

/// Circular receive buffer plus an ordered, non-overlapping fragment list.
/// `merged_len` is the count of bytes contiguously available for the
/// application to read starting at `head_seq`; `cum_len` is the lifetime
/// total delivered (monotonic, survives reads).
pub struct RecvRing {
    capacity: usize,
    head_seq: u32,
    merged: VecDeque<u8>,
    fragments: Vec<Fragment>,
    cum_len: u64,
}

impl RecvRing {
    pub fn new(capacity: usize, initial_seq: u32) -> Self {
        Self { capacity, head_seq: initial_seq, merged: VecDeque::with_capacity(capacity), fragments: Vec::new(), cum_len: 0 }
    }

    pub fn head_seq(&self) -> u32 {
        self.head_seq
    }

    pub fn merged_len(&self) -> usize {
        self.merged.len()
    }

    pub fn cum_len(&self) -> u64 {
        self.cum_len
    }

    pub fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.merged.len() + self.fragments.iter().map(|f| f.data.len()).sum::<usize>())
    }

    /// Inserts a segment `[seq, seq+data.len())`. Bytes already delivered
    /// (before `head_seq`) are trimmed. Overlapping/touching fragments are
    /// merged so the list stays strictly ordered and non-overlapping, then
    /// any prefix now contiguous with `head_seq` is folded into `merged`.
    ///
    /// Returns `true` if any new byte advanced `merged_len` (i.e. the
    /// caller should advance `rcv_nxt` and consider raising EPOLLIN).
    pub fn insert(&mut self, seq: u32, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let (mut seq, mut data) = (seq, data.to_vec());

        // Trim the portion already folded into `merged` or before head_seq.
        let behind = self.head_seq.wrapping_sub(seq) as i32;
        if behind > 0 {
            let trim = (behind as usize).min(data.len());
            if trim >= data.len() {
                return false;
            }
            data.drain(..trim);
            seq = seq.wrapping_add(trim as u32);
        }

        let mut new_frag = Fragment { seq, data };
        let mut merged_idx = Vec::new();
        let mut i = 0;
        while i < self.fragments.len() {
            let f = &self.fragments[i];
            let f_end = f.seq.wrapping_add(f.data.len() as u32);
            let new_end = new_frag.seq.wrapping_add(new_frag.data.len() as u32);
            let touches = (new_frag.seq.wrapping_sub(f_end) as i32) <= 0 && (f.seq.wrapping_sub(new_end) as i32) <= 0;
            if touches {
                merged_idx.push(i);
            }
            i += 1;
        }
        for &idx in merged_idx.iter().rev() {
            let old = self.fragments.remove(idx);
            new_frag = merge_fragments(new_frag, old);
        }
        let pos = self.fragments.partition_point(|f| (f.seq.wrapping_sub(new_frag.seq) as i32) < 0);
        self.fragments.insert(pos, new_frag);

        self.fold_contiguous_prefix()
    }

    fn fold_contiguous_prefix(&mut self) -> bool {
        let mut advanced = false;
        while let Some(first) = self.fragments.first() {
            if first.seq != self.head_seq {
                break;
            }
            let frag = self.fragments.remove(0);
            let n = frag.data.len();
            self.merged.extend(frag.data);
            self.head_seq = self.head_seq.wrapping_add(n as u32);
            self.cum_len += n as u64;
            advanced = true;
        }
        advanced
    }

    /// Consumes up to `max_len` bytes from the front of `merged`. With
    /// `peek = true` the bytes are copied but left in place (MSG_PEEK).
    pub fn read(&mut self, max_len: usize, peek: bool) -> Vec<u8> {
        let n = max_len.min(self.merged.len());
        let out: Vec<u8> = self.merged.iter().take(n).copied().collect();
        if !peek {
            self.merged.drain(..n);
        }
        out
    }

    #[cfg(test)]
    fn fragment_ranges(&self) -> Vec<(u32, u32)> {
        self.fragments.iter().map(|f| (f.seq, f.seq.wrapping_add(f.data.len() as u32))).collect()
    }
}

fn merge_fragments(a: Fragment, b: Fragment) -> Fragment {
    let (lo, hi) = if (a.seq.wrapping_sub(b.seq) as i32) <= 0 { (a, b) } else { (b, a) };
    let lo_end = lo.seq.wrapping_add(lo.data.len() as u32);
    let hi_end = hi.seq.wrapping_add(hi.data.len() as u32);
    if (hi_end.wrapping_sub(lo_end) as i32) <= 0 {
        // hi is fully covered by lo
        return lo;
    }
    let overlap = lo_end.wrapping_sub(hi.seq) as i32;
    let mut data = lo.data;
    if overlap >= 0 {
        data.extend_from_slice(&hi.data[overlap as usize..]);
    } else {
        // disjoint but touching is impossible given the caller's `touches`
        // check; guard defensively rather than panic on a malformed input.
        data.extend_from_slice(&hi.data);
    }
    Fragment { seq: lo.seq, data }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_ring_put_remove_tracks_head_seq() {
        let mut r = SendRing::new(16, 1000);
        assert_eq!(r.put(b"hello"), 5);
        assert_eq!(r.head_seq(), 1000);
        r.remove(3);
        assert_eq!(r.head_seq(), 1003);
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn send_ring_short_write_past_capacity() {
        let mut r = SendRing::new(4, 0);
        assert_eq!(r.put(b"hello"), 4);
        assert_eq!(r.free_space(), 0);
    }

    #[test]
    fn recv_ring_in_order_insert_advances_merged_len() {
        let mut r = RecvRing::new(4096, 0);
        assert!(r.insert(0, b"ping"));
        assert_eq!(r.merged_len(), 4);
        assert_eq!(r.head_seq(), 4);
        assert_eq!(r.read(4, false), b"ping");
        assert_eq!(r.merged_len(), 0);
    }

    #[test]
    fn recv_ring_out_of_order_reassembly_matches_s2() {
        let mut r = RecvRing::new(8192, 0);
        let seg = vec![0xabu8; 1460];
        assert!(!r.insert(2920, &seg));
        assert!(!r.insert(1460, &seg));
        assert!(r.insert(0, &seg));
        assert_eq!(r.head_seq(), 4380);
        assert_eq!(r.merged_len(), 4380);
        assert!(r.fragment_ranges().is_empty());
    }

    #[test]
    fn overlapping_fragments_merge_regardless_of_arrival_order() {
        let mut a = RecvRing::new(4096, 100);
        a.insert(100, b"AAAA");
        a.insert(102, b"BBBB");

        let mut b = RecvRing::new(4096, 100);
        b.insert(102, b"BBBB");
        b.insert(100, b"AAAA");

        assert_eq!(a.fragment_ranges(), b.fragment_ranges());
        assert_eq!(a.head_seq(), b.head_seq());
        assert_eq!(a.read(100, true), b"AAAABB");
        assert_eq!(a.read(100, true), b.read(100, true));
    }

    #[test]
    fn bytes_before_head_seq_are_dropped() {
        let mut r = RecvRing::new(4096, 10);
        assert!(!r.insert(0, b"stale"));
        assert_eq!(r.merged_len(), 0);
        assert_eq!(r.head_seq(), 10);
    }
}
