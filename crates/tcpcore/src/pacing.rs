//! Opt-in output pacing: when a stream's pacing rate is set, the output
//! path consults a per-stream credit accumulator alongside
//! `min(cwnd, peer_wnd)` so a single fast connection can be capped below
//! line rate without touching the congestion-control state itself.

use tcpcore_timing::Duration;

/// Token-bucket credit accumulator. `accrue` is called once per tick with
/// the elapsed time; `take` spends credit for bytes about to be emitted and
/// reports how many of the requested bytes are actually affordable.
pub struct Pacer {
    rate_bps: u64,
    credit_bytes: i64,
    burst_bytes: i64,
}

impl Pacer {
    pub fn new(rate_bps: u64, burst_bytes: i64) -> Self {
        Self { rate_bps, credit_bytes: burst_bytes, burst_bytes }
    }

    pub fn accrue(&mut self, elapsed: Duration) {
        let accrued = (self.rate_bps as u128 * elapsed.as_micros() as u128 / 1_000_000) as i64;
        self.credit_bytes = (self.credit_bytes + accrued).min(self.burst_bytes);
    }

    /// Returns how many of `want_bytes` the pacer currently affords, and
    /// debits that many from the credit balance (which may go negative if a
    /// single segment exceeds the remaining credit, in which case the next
    /// `take` call returns 0 until `accrue` repays the debt).
    pub fn take(&mut self, want_bytes: u32) -> u32 {
        if self.credit_bytes <= 0 {
            return 0;
        }
        let afford = want_bytes.min(self.credit_bytes as u32);
        self.credit_bytes -= i64::from(afford);
        afford
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacer_caps_emission_to_accrued_credit() {
        let mut p = Pacer::new(8_000_000 / 8, 0); // 1 MB/s, no burst allowance
        p.accrue(Duration::from_millis(10)); // ~10,000 bytes accrued
        let taken = p.take(20_000);
        assert!(taken <= 10_000);
        assert_eq!(p.take(20_000), 0);
    }

    #[test]
    fn burst_allows_an_initial_large_send() {
        let mut p = Pacer::new(1_000, 5_000);
        assert_eq!(p.take(4_000), 4_000);
    }
}
