//! Engine configuration, loaded from TOML via `serde`. Every per-core and
//! per-connection tunable lives here; nothing reads a compiled-in constant
//! where a `Config` field exists instead.

use serde::{Deserialize, Serialize};

fn default_cores() -> usize {
    1
}
fn default_max_concurrency() -> usize {
    4096
}
fn default_send_buf_size() -> usize {
    8192
}
fn default_recv_buf_size() -> usize {
    8192
}
fn default_num_addr() -> usize {
    1
}
fn default_tcp_timewait_ms() -> u32 {
    60_000
}
fn default_rss_key() -> [u8; 40] {
    // Default symmetric RSS key from the Microsoft RSS spec, the same
    // constant most userspace RSS implementations ship.
    [
        0x6d, 0x5a, 0x56, 0xda, 0x25, 0x5b, 0x0e, 0xc2, 0x41, 0x67, 0x25, 0x3d, 0x43, 0xa3, 0x8f, 0xb0, 0xd0, 0xca, 0x2b,
        0xcb, 0xae, 0x7b, 0x30, 0xb4, 0x77, 0xcb, 0x2d, 0xa3, 0x80, 0x30, 0xf2, 0x0c, 0x6a, 0x42, 0xb7, 0x3b, 0xbe, 0xac,
        0x01, 0xfa,
    ]
}

/// Per-process configuration, shared (read-only) by every engine. Loaded
/// once at startup and never mutated, so each `Engine` owns a plain value
/// rather than reaching through a process-global table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of engine threads (cores) to run, one flow table/pool set/event
    /// loop per core.
    #[serde(default = "default_cores")]
    pub cores: usize,

    /// Maximum live streams per engine (bounds every pool: stream, send-vars,
    /// recv-vars, fragment-context).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Send ring buffer capacity in bytes, per stream.
    #[serde(default = "default_send_buf_size")]
    pub send_buf_size: usize,

    /// Receive ring buffer capacity in bytes, per stream.
    #[serde(default = "default_recv_buf_size")]
    pub recv_buf_size: usize,

    /// Number of local addresses in this engine's bind pool (for active-open
    /// ephemeral port allocation across `num_addr` IPs).
    #[serde(default = "default_num_addr")]
    pub num_addr: usize,

    /// TIME_WAIT duration in milliseconds. The sole source of 2MSL: no timer
    /// code ever reads a literal duration instead of this field.
    #[serde(default = "default_tcp_timewait_ms")]
    pub tcp_timewait_ms: u32,

    /// Optional idle-connection timeout in seconds. `None` disables idle
    /// reaping entirely (the idle FIFO is simply never consulted).
    #[serde(default)]
    pub tcp_timeout_s: Option<u32>,

    /// NIC interface names this process is allowed to attach to. Empty means
    /// "whatever the driver exposes" (used in-process by tests via
    /// `tcpcore-net`'s loopback driver, which ignores this field).
    #[serde(default)]
    pub nic_whitelist: Vec<String>,

    /// 40-byte symmetric RSS key (Microsoft Toeplitz hash), used by the
    /// address pool to pick local ports that steer a flow's reverse traffic
    /// back to this core.
    #[serde(default = "default_rss_key")]
    pub rss_key: [u8; 40],

    /// Whether multiple processes may share one RSS-partitioned NIC (true)
    /// or this is the sole process owning it (false). Only affects queue
    /// naming/validation in a real deployment; the in-process driver ignores
    /// it.
    #[serde(default)]
    pub multi_process: bool,

    /// Minimum wall-clock duration of one engine tick; if a tick finishes
    /// early the engine sleeps the remainder (opt-in pacing). `None` means
    /// spin as fast as possible.
    #[serde(default)]
    pub min_tick_duration: Option<tcpcore_timing::Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cores: default_cores(),
            max_concurrency: default_max_concurrency(),
            send_buf_size: default_send_buf_size(),
            recv_buf_size: default_recv_buf_size(),
            num_addr: default_num_addr(),
            tcp_timewait_ms: default_tcp_timewait_ms(),
            tcp_timeout_s: None,
            nic_whitelist: Vec::new(),
            rss_key: default_rss_key(),
            multi_process: false,
            min_tick_duration: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = Config::default();
        let s = cfg.to_toml_string().unwrap();
        let back = Config::from_toml_str(&s).unwrap();
        assert_eq!(back.cores, cfg.cores);
        assert_eq!(back.tcp_timewait_ms, cfg.tcp_timewait_ms);
        assert_eq!(back.rss_key, cfg.rss_key);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg = Config::from_toml_str("cores = 4\ntcp_timewait_ms = 30000\n").unwrap();
        assert_eq!(cfg.cores, 4);
        assert_eq!(cfg.tcp_timewait_ms, 30_000);
        assert_eq!(cfg.send_buf_size, default_send_buf_size());
        assert!(cfg.tcp_timeout_s.is_none());
    }
}
