//! The engine's only contract with the NIC. Grounded on the non-blocking,
//! poll-once-per-tick event shape of `TcpConnector::poll_with`, retargeted at
//! raw frame batches instead of a kernel socket: an engine never blocks on
//! the driver, it just asks for whatever is ready this tick.

/// Checksum-offload capabilities a driver may report via [`Driver::capability`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverCaps(pub u8);

impl DriverCaps {
    pub const RX_TCP_CSUM: u8 = 0b01;
    pub const TX_TCPIP_CSUM: u8 = 0b10;

    #[inline]
    pub const fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

/// The engine's view of a NIC: get a batch of inbound frames, reserve and
/// fill TX slots, flush them to the wire. Implementations own the actual
/// DMA/poll ring; this core only ever calls these four methods.
pub trait Driver {
    /// Returns up to a small batch of received frame buffers for `iface`.
    /// Frame lifetime ends when the input path returns from processing it.
    fn rx_batch(&mut self, iface: usize) -> Vec<Vec<u8>>;

    /// Reserves a TX slot sized for `pktlen` bytes on `iface`. Returns `None`
    /// under backpressure (ring full) rather than blocking.
    fn get_wptr(&mut self, iface: usize, pktlen: usize) -> Option<&mut [u8]>;

    /// Pushes every reserved slot for `iface` onto the wire.
    fn tx_flush(&mut self, iface: usize);

    /// Capability probe, queried once at attach time.
    fn capability(&self, iface: usize) -> DriverCaps;
}

pub mod testing {
    use std::collections::VecDeque;

    use super::{Driver, DriverCaps};

    /// An in-memory driver for tests: a pair of `LoopbackDriver`s can be
    /// wired together so frames transmitted by one appear as received by the
    /// other, letting integration tests drive two engines without a real NIC.
    #[derive(Default)]
    pub struct LoopbackDriver {
        inbox: VecDeque<Vec<u8>>,
        pending_tx: Vec<Vec<u8>>,
        flushed_tx: Vec<Vec<u8>>,
        caps: DriverCaps,
    }

    impl LoopbackDriver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_caps(caps: DriverCaps) -> Self {
            Self { caps, ..Self::default() }
        }

        /// Injects a frame as if received over the wire.
        pub fn deliver(&mut self, frame: Vec<u8>) {
            self.inbox.push_back(frame);
        }

        /// Drains everything flushed since the last call, for wiring into a
        /// peer's `deliver`.
        pub fn take_flushed(&mut self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.flushed_tx)
        }
    }

    impl Driver for LoopbackDriver {
        fn rx_batch(&mut self, _iface: usize) -> Vec<Vec<u8>> {
            self.inbox.drain(..).collect()
        }

        fn get_wptr(&mut self, _iface: usize, pktlen: usize) -> Option<&mut [u8]> {
            self.pending_tx.push(vec![0u8; pktlen]);
            self.pending_tx.last_mut().map(|v| v.as_mut_slice())
        }

        fn tx_flush(&mut self, _iface: usize) {
            self.flushed_tx.append(&mut self.pending_tx);
        }

        fn capability(&self, _iface: usize) -> DriverCaps {
            self.caps
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn deliver_then_rx_batch_returns_frame() {
            let mut drv = LoopbackDriver::new();
            drv.deliver(vec![1, 2, 3]);
            let batch = drv.rx_batch(0);
            assert_eq!(batch, vec![vec![1, 2, 3]]);
            assert!(drv.rx_batch(0).is_empty());
        }

        #[test]
        fn get_wptr_then_flush_moves_to_flushed() {
            let mut drv = LoopbackDriver::new();
            {
                let slot = drv.get_wptr(0, 4).unwrap();
                slot.copy_from_slice(&[9, 9, 9, 9]);
            }
            drv.tx_flush(0);
            assert_eq!(drv.take_flushed(), vec![vec![9, 9, 9, 9]]);
        }
    }
}
