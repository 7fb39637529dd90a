pub mod checksum;
pub mod eth;
pub mod ipv4;
pub mod tcp;

use eth::{EthError, EthHeader};
use ipv4::{Ipv4Error, Ipv4Header};
use tcp::{TcpError, TcpHeader, TcpOptions};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error(transparent)]
    Eth(#[from] EthError),
    #[error(transparent)]
    Ipv4(#[from] Ipv4Error),
    #[error(transparent)]
    Tcp(#[from] TcpError),
    #[error("not a TCP/IPv4 frame")]
    NotTcpIpv4,
}

/// A parsed Ethernet+IPv4+TCP frame, borrowing its payload from the original
/// buffer. This is the unit the input path (component C5) works with.
pub struct TcpFrame<'a> {
    pub eth: EthHeader,
    pub ip: Ipv4Header,
    pub tcp: TcpHeader,
    pub options: TcpOptions,
    pub payload: &'a [u8],
}

pub fn parse_tcp_frame(buf: &[u8]) -> Result<TcpFrame<'_>, FrameError> {
    let eth = EthHeader::parse(buf)?;
    if eth.ethertype != eth::ETHERTYPE_IPV4 {
        return Err(FrameError::NotTcpIpv4);
    }
    let ip_buf = &buf[eth::ETH_HEADER_LEN..];
    let (ip, ip_header_len) = Ipv4Header::parse(ip_buf)?;
    if ip.protocol != ipv4::PROTO_TCP {
        return Err(FrameError::NotTcpIpv4);
    }
    let tcp_buf = &ip_buf[ip_header_len..ip.total_len as usize];
    let (tcp, options, tcp_header_len) = TcpHeader::parse(tcp_buf)?;
    Ok(TcpFrame { eth, ip, tcp, options, payload: &tcp_buf[tcp_header_len..] })
}

/// Builds a complete Ethernet+IPv4+TCP frame into `out` (which must be empty
/// on entry), fixing up both the IP and TCP checksums.
#[allow(clippy::too_many_arguments)]
pub fn build_tcp_frame(
    eth: &EthHeader,
    src: [u8; 4],
    dst: [u8; 4],
    ip_id: u16,
    ttl: u8,
    tcp: &TcpHeader,
    options: &TcpOptions,
    payload: &[u8],
    out: &mut Vec<u8>,
) {
    let mut eth_buf = [0u8; eth::ETH_HEADER_LEN];
    eth.build(&mut eth_buf);
    out.extend_from_slice(&eth_buf);

    let mut tcp_buf = Vec::with_capacity(tcp::TCP_MIN_HEADER_LEN + options.encoded_len() + payload.len());
    tcp.build_into(options, payload, src, dst, &mut tcp_buf);

    let ip = Ipv4Header {
        ihl_words: 5,
        total_len: (ipv4::IPV4_MIN_HEADER_LEN + tcp_buf.len()) as u16,
        id: ip_id,
        ttl,
        protocol: ipv4::PROTO_TCP,
        checksum: 0,
        src,
        dst,
    };
    let mut ip_buf = [0u8; ipv4::IPV4_MIN_HEADER_LEN];
    ip.build(&mut ip_buf);
    out.extend_from_slice(&ip_buf);
    out.extend_from_slice(&tcp_buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcp::TcpFlags;

    #[test]
    fn build_then_parse_round_trips() {
        let eth_hdr = EthHeader { dst: [0xff; 6], src: [0xaa; 6], ethertype: eth::ETHERTYPE_IPV4 };
        let tcp_hdr = TcpHeader {
            sport: 4000,
            dport: 80,
            seq: 100,
            ack: 0,
            flags: TcpFlags(TcpFlags::SYN),
            window: 65535,
            checksum: 0,
            urgent_ptr: 0,
        };
        let opts = TcpOptions { mss: Some(1460), ..Default::default() };
        let mut out = Vec::new();
        build_tcp_frame(&eth_hdr, [10, 0, 0, 1], [10, 0, 0, 2], 1, 64, &tcp_hdr, &opts, b"payload", &mut out);

        let parsed = parse_tcp_frame(&out).unwrap();
        assert_eq!(parsed.tcp.sport, 4000);
        assert_eq!(parsed.tcp.seq, 100);
        assert_eq!(parsed.options.mss, Some(1460));
        assert_eq!(parsed.payload, b"payload");
        assert_eq!(parsed.ip.src, [10, 0, 0, 1]);
    }

    #[test]
    fn rejects_non_ipv4_ethertype() {
        let mut buf = vec![0u8; 34];
        buf[12..14].copy_from_slice(&0x86ddu16.to_be_bytes()); // IPv6
        assert!(matches!(parse_tcp_frame(&buf), Err(FrameError::NotTcpIpv4)));
    }
}
