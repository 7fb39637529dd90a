pub const ETH_HEADER_LEN: usize = 14;
pub const ETHERTYPE_IPV4: u16 = 0x0800;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EthError {
    #[error("frame shorter than an Ethernet header")]
    ShortHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthHeader {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ethertype: u16,
}

impl EthHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, EthError> {
        if buf.len() < ETH_HEADER_LEN {
            return Err(EthError::ShortHeader);
        }
        Ok(Self {
            dst: buf[0..6].try_into().unwrap(),
            src: buf[6..12].try_into().unwrap(),
            ethertype: u16::from_be_bytes([buf[12], buf[13]]),
        })
    }

    pub fn build(&self, out: &mut [u8; ETH_HEADER_LEN]) {
        out[0..6].copy_from_slice(&self.dst);
        out[6..12].copy_from_slice(&self.src);
        out[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let hdr =
            EthHeader { dst: [1, 2, 3, 4, 5, 6], src: [6, 5, 4, 3, 2, 1], ethertype: ETHERTYPE_IPV4 };
        let mut buf = [0u8; ETH_HEADER_LEN];
        hdr.build(&mut buf);
        assert_eq!(EthHeader::parse(&buf).unwrap(), hdr);
    }

    #[test]
    fn rejects_short_frame() {
        assert_eq!(EthHeader::parse(&[0; 10]), Err(EthError::ShortHeader));
    }
}
