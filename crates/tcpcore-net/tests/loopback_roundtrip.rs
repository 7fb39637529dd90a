use tcpcore_net::driver::testing::LoopbackDriver;
use tcpcore_net::wire::eth::{EthHeader, ETHERTYPE_IPV4};
use tcpcore_net::wire::tcp::{TcpFlags, TcpHeader, TcpOptions};
use tcpcore_net::{Driver, build_tcp_frame, parse_tcp_frame};

#[test]
fn syn_frame_survives_a_loopback_hop() {
    let mut sender = LoopbackDriver::new();
    let mut receiver = LoopbackDriver::new();

    let eth = EthHeader { dst: [0xaa; 6], src: [0xbb; 6], ethertype: ETHERTYPE_IPV4 };
    let tcp = TcpHeader {
        sport: 51000,
        dport: 443,
        seq: 0,
        ack: 0,
        flags: TcpFlags(TcpFlags::SYN),
        window: 65535,
        checksum: 0,
        urgent_ptr: 0,
    };
    let opts = TcpOptions { mss: Some(1460), wscale: Some(7), sack_permitted: true, ..Default::default() };

    let mut frame = Vec::new();
    build_tcp_frame(&eth, [192, 168, 0, 1], [192, 168, 0, 2], 1, 64, &tcp, &opts, &[], &mut frame);

    let slot = sender.get_wptr(0, frame.len()).unwrap();
    slot.copy_from_slice(&frame);
    sender.tx_flush(0);

    for f in sender.take_flushed() {
        receiver.deliver(f);
    }

    let received = receiver.rx_batch(0);
    assert_eq!(received.len(), 1);

    let parsed = parse_tcp_frame(&received[0]).unwrap();
    assert_eq!(parsed.tcp.sport, 51000);
    assert_eq!(parsed.tcp.dport, 443);
    assert!(parsed.tcp.flags.has(TcpFlags::SYN));
    assert_eq!(parsed.options.mss, Some(1460));
    assert_eq!(parsed.options.wscale, Some(7));
    assert!(parsed.options.sack_permitted);
}
