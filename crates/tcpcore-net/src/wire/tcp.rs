use tcpcore_utils::ArrayVec;

use super::checksum;

pub const TCP_MIN_HEADER_LEN: usize = 20;
pub const MAX_SACK_BLOCKS: usize = 4;

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_WSCALE: u8 = 3;
const OPT_SACK_PERMITTED: u8 = 4;
const OPT_SACK: u8 = 5;
const OPT_TIMESTAMP: u8 = 8;

/// TCP control bits, stored as their RFC 793 bit positions in the 6-bit
/// control field (URG is parsed/preserved but never acted on: OOB data is
/// out of scope).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: u8 = 0b0000_0001;
    pub const SYN: u8 = 0b0000_0010;
    pub const RST: u8 = 0b0000_0100;
    pub const PSH: u8 = 0b0000_1000;
    pub const ACK: u8 = 0b0001_0000;
    pub const URG: u8 = 0b0010_0000;

    #[inline]
    pub const fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    #[inline]
    pub const fn with(self, bit: u8) -> Self {
        Self(self.0 | bit)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub wscale: Option<u8>,
    pub sack_permitted: bool,
    pub sack_blocks: ArrayVec<(u32, u32), MAX_SACK_BLOCKS>,
    pub timestamp: Option<(u32, u32)>,
}

impl TcpOptions {
    /// Encoded length in bytes, rounded up to a multiple of 4 (NOP-padded).
    pub fn encoded_len(&self) -> usize {
        let mut n = 0usize;
        if self.mss.is_some() {
            n += 4;
        }
        if self.wscale.is_some() {
            n += 3;
        }
        if self.sack_permitted {
            n += 2;
        }
        if let Some((tsval, _)) = self.timestamp {
            let _ = tsval;
            n += 10;
        }
        if !self.sack_blocks.is_empty() {
            n += 2 + 8 * self.sack_blocks.len();
        }
        n.div_ceil(4) * 4
    }

    pub fn parse(buf: &[u8]) -> Result<Self, TcpError> {
        let mut opts = TcpOptions::default();
        let mut i = 0;
        while i < buf.len() {
            let kind = buf[i];
            match kind {
                OPT_END => break,
                OPT_NOP => {
                    i += 1;
                }
                _ => {
                    if i + 1 >= buf.len() {
                        return Err(TcpError::TruncatedOption);
                    }
                    let len = buf[i + 1] as usize;
                    if len < 2 || i + len > buf.len() {
                        return Err(TcpError::TruncatedOption);
                    }
                    let body = &buf[i + 2..i + len];
                    match kind {
                        OPT_MSS if len == 4 => opts.mss = Some(u16::from_be_bytes([body[0], body[1]])),
                        OPT_WSCALE if len == 3 => opts.wscale = Some(body[0]),
                        OPT_SACK_PERMITTED if len == 2 => opts.sack_permitted = true,
                        OPT_TIMESTAMP if len == 10 => {
                            let tsval = u32::from_be_bytes(body[0..4].try_into().unwrap());
                            let tsecr = u32::from_be_bytes(body[4..8].try_into().unwrap());
                            opts.timestamp = Some((tsval, tsecr));
                        }
                        OPT_SACK if len >= 2 && (len - 2) % 8 == 0 => {
                            for block in body.chunks_exact(8) {
                                let left = u32::from_be_bytes(block[0..4].try_into().unwrap());
                                let right = u32::from_be_bytes(block[4..8].try_into().unwrap());
                                let _ = opts.sack_blocks.try_push((left, right));
                            }
                        }
                        // unrecognized or malformed option: skip, keep parsing (mirrors
                        // a permissive real-world TCP stack rather than dropping the
                        // whole segment over an option it doesn't understand)
                        _ => {}
                    }
                    i += len;
                    continue;
                }
            }
        }
        Ok(opts)
    }

    pub fn build_into(&self, out: &mut Vec<u8>) {
        let start = out.len();
        if let Some(mss) = self.mss {
            out.push(OPT_MSS);
            out.push(4);
            out.extend_from_slice(&mss.to_be_bytes());
        }
        if self.sack_permitted {
            out.push(OPT_SACK_PERMITTED);
            out.push(2);
        }
        if let Some(wscale) = self.wscale {
            out.push(OPT_WSCALE);
            out.push(3);
            out.push(wscale);
        }
        if let Some((tsval, tsecr)) = self.timestamp {
            out.push(OPT_TIMESTAMP);
            out.push(10);
            out.extend_from_slice(&tsval.to_be_bytes());
            out.extend_from_slice(&tsecr.to_be_bytes());
        }
        if !self.sack_blocks.is_empty() {
            out.push(OPT_SACK);
            out.push((2 + 8 * self.sack_blocks.len()) as u8);
            for (left, right) in self.sack_blocks.iter() {
                out.extend_from_slice(&left.to_be_bytes());
                out.extend_from_slice(&right.to_be_bytes());
            }
        }
        while (out.len() - start) % 4 != 0 {
            out.push(OPT_NOP);
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TcpError {
    #[error("frame too short for a TCP header")]
    ShortHeader,
    #[error("data offset {0} claims options but frame is shorter than that")]
    ShortForDataOffset(u8),
    #[error("truncated TCP option")]
    TruncatedOption,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    pub fn parse(buf: &[u8]) -> Result<(Self, TcpOptions, usize), TcpError> {
        if buf.len() < TCP_MIN_HEADER_LEN {
            return Err(TcpError::ShortHeader);
        }
        let data_offset_words = buf[12] >> 4;
        let header_len = data_offset_words as usize * 4;
        if header_len < TCP_MIN_HEADER_LEN || buf.len() < header_len {
            return Err(TcpError::ShortForDataOffset(data_offset_words));
        }
        let header = Self {
            sport: u16::from_be_bytes([buf[0], buf[1]]),
            dport: u16::from_be_bytes([buf[2], buf[3]]),
            seq: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            ack: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            flags: TcpFlags(buf[13] & 0x3f),
            window: u16::from_be_bytes([buf[14], buf[15]]),
            checksum: u16::from_be_bytes([buf[16], buf[17]]),
            urgent_ptr: u16::from_be_bytes([buf[18], buf[19]]),
        };
        let options = TcpOptions::parse(&buf[TCP_MIN_HEADER_LEN..header_len])?;
        Ok((header, options, header_len))
    }

    /// Builds the 20-byte fixed header plus option bytes into `out`, then
    /// fixes up the checksum over header+options+payload under the IPv4
    /// pseudo-header. `out` must be empty on entry.
    pub fn build_into(
        &self,
        options: &TcpOptions,
        payload: &[u8],
        src: [u8; 4],
        dst: [u8; 4],
        out: &mut Vec<u8>,
    ) {
        let opt_len = options.encoded_len();
        let data_offset_words = ((TCP_MIN_HEADER_LEN + opt_len) / 4) as u8;
        out.extend_from_slice(&self.sport.to_be_bytes());
        out.extend_from_slice(&self.dport.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.push(data_offset_words << 4);
        out.push(self.flags.0);
        out.extend_from_slice(&self.window.to_be_bytes());
        out.extend_from_slice(&[0, 0]); // checksum placeholder
        out.extend_from_slice(&self.urgent_ptr.to_be_bytes());
        options.build_into(out);
        out.extend_from_slice(payload);

        let tcp_len = out.len() as u16;
        let pseudo = checksum::ipv4_pseudo_header_sum(src, dst, super::ipv4::PROTO_TCP, tcp_len);
        let sum = checksum::fold_to_u16(pseudo + checksum::ones_complement_sum(out));
        out[16..18].copy_from_slice(&sum.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> TcpHeader {
        TcpHeader {
            sport: 1234,
            dport: 80,
            seq: 1000,
            ack: 0,
            flags: TcpFlags(TcpFlags::SYN),
            window: 65535,
            checksum: 0,
            urgent_ptr: 0,
        }
    }

    #[test]
    fn round_trips_fixed_fields_with_no_options() {
        let hdr = sample_header();
        let mut buf = Vec::new();
        hdr.build_into(&TcpOptions::default(), &[], [10, 0, 0, 1], [10, 0, 0, 2], &mut buf);
        let (parsed, opts, len) = TcpHeader::parse(&buf).unwrap();
        assert_eq!(len, 20);
        assert_eq!(parsed.sport, 1234);
        assert_eq!(parsed.seq, 1000);
        assert!(parsed.flags.has(TcpFlags::SYN));
        assert_eq!(opts, TcpOptions::default());
    }

    #[test]
    fn options_round_trip_and_pad_to_4_bytes() {
        let hdr = sample_header();
        let opts = TcpOptions {
            mss: Some(1460),
            wscale: Some(7),
            sack_permitted: true,
            ..Default::default()
        };
        let mut buf = Vec::new();
        hdr.build_into(&opts, &[], [10, 0, 0, 1], [10, 0, 0, 2], &mut buf);
        let (_, parsed_opts, header_len) = TcpHeader::parse(&buf).unwrap();
        assert_eq!(header_len % 4, 0);
        assert_eq!(parsed_opts.mss, Some(1460));
        assert_eq!(parsed_opts.wscale, Some(7));
        assert!(parsed_opts.sack_permitted);
    }

    #[test]
    fn sack_blocks_round_trip() {
        let hdr = sample_header();
        let mut opts = TcpOptions::default();
        opts.sack_blocks.push((2000, 3000));
        opts.sack_blocks.push((4000, 5000));
        let mut buf = Vec::new();
        hdr.build_into(&opts, &[], [10, 0, 0, 1], [10, 0, 0, 2], &mut buf);
        let (_, parsed_opts, _) = TcpHeader::parse(&buf).unwrap();
        assert_eq!(parsed_opts.sack_blocks.as_slice(), &[(2000, 3000), (4000, 5000)]);
    }

    #[test]
    fn checksum_validates_against_pseudo_header() {
        let hdr = sample_header();
        let mut buf = Vec::new();
        let payload = b"hello";
        hdr.build_into(&TcpOptions::default(), payload, [10, 0, 0, 1], [10, 0, 0, 2], &mut buf);
        let pseudo =
            checksum::ipv4_pseudo_header_sum([10, 0, 0, 1], [10, 0, 0, 2], super::super::ipv4::PROTO_TCP, buf.len() as u16);
        assert_eq!(checksum::fold_to_u16(pseudo + checksum::ones_complement_sum(&buf)), 0);
    }

    #[test]
    fn rejects_short_header() {
        assert_eq!(TcpHeader::parse(&[0; 10]), Err(TcpError::ShortHeader));
    }
}
