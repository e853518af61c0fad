use std::net::IpAddr;

/// TCP header flag bits
pub struct TcpFlags;

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
    pub const ECE: u8 = 0x40;
    pub const CWR: u8 = 0x80;
}

/// Direction of a segment relative to the filtering host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Read-only view of an inbound TCP segment
///
/// `recreated` is the per-packet tag set on SYNs rebuilt from a validated cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    /// Peer's MSS option, if present
    pub mss: Option<u16>,
    /// Peer's window-scale option, if present
    pub wscale: Option<u8>,
    pub sack_permitted: bool,
    pub direction: Direction,
    pub recreated: bool,
}

impl ConnectionDescriptor {
    /// Flags restricted to SYN, ACK and RST, the bits the cookie path dispatches on
    fn handshake_flags(&self) -> u8 {
        self.flags & (TcpFlags::SYN | TcpFlags::ACK | TcpFlags::RST)
    }

    pub fn is_syn_only(&self) -> bool {
        self.handshake_flags() == TcpFlags::SYN
    }

    pub fn is_ack_only(&self) -> bool {
        self.handshake_flags() == TcpFlags::ACK
    }

    pub fn is_inbound(&self) -> bool {
        self.direction == Direction::In
    }

    /// MSS to advertise back: the peer's option, never below the stack default
    pub fn effective_mss(&self, default_mss: u16) -> u16 {
        self.mss.unwrap_or(default_mss).max(default_mss)
    }

    pub fn flow_key(&self) -> FlowKey {
        FlowKey {
            src: self.src,
            dst: self.dst,
            sport: self.sport,
            dport: self.dport,
        }
    }
}

/// Connection 4-tuple as seen from the initiating peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub sport: u16,
    pub dport: u16,
}

/// A TCP segment to be built, either for transmission or for replay through the filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub mss: Option<u16>,
    pub wscale: Option<u8>,
    pub sack_permitted: bool,
    pub ttl: u8,
    pub recreated: bool,
}

/// SYN rebuilt from a validated cookie
pub type SyntheticSegment = TcpSegment;

impl TcpSegment {
    pub fn flow_key(&self) -> FlowKey {
        FlowKey {
            src: self.src,
            dst: self.dst,
            sport: self.sport,
            dport: self.dport,
        }
    }

    /// Descriptor for running this segment through the per-segment hook
    pub fn into_descriptor(self, direction: Direction) -> ConnectionDescriptor {
        ConnectionDescriptor {
            src: self.src,
            dst: self.dst,
            sport: self.sport,
            dport: self.dport,
            seq: self.seq,
            ack: self.ack,
            flags: self.flags,
            mss: self.mss,
            wscale: self.wscale,
            sack_permitted: self.sack_permitted,
            direction,
            recreated: self.recreated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn descriptor(flags: u8) -> ConnectionDescriptor {
        ConnectionDescriptor {
            src: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
            dst: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)),
            sport: 40000,
            dport: 443,
            seq: 1000,
            ack: 0,
            flags,
            mss: None,
            wscale: None,
            sack_permitted: false,
            direction: Direction::In,
            recreated: false,
        }
    }

    #[test]
    fn test_flag_classification() {
        assert!(descriptor(TcpFlags::SYN).is_syn_only());
        assert!(descriptor(TcpFlags::SYN | TcpFlags::ECE | TcpFlags::CWR).is_syn_only());
        assert!(!descriptor(TcpFlags::SYN | TcpFlags::ACK).is_syn_only());
        assert!(descriptor(TcpFlags::ACK).is_ack_only());
        assert!(descriptor(TcpFlags::ACK | TcpFlags::PSH).is_ack_only());
        assert!(!descriptor(TcpFlags::ACK | TcpFlags::RST).is_ack_only());
    }

    #[test]
    fn test_effective_mss() {
        let mut conn = descriptor(TcpFlags::SYN);
        assert_eq!(conn.effective_mss(536), 536);
        conn.mss = Some(1460);
        assert_eq!(conn.effective_mss(536), 1460);
        conn.mss = Some(100);
        assert_eq!(conn.effective_mss(536), 536);
    }

    #[test]
    fn test_segment_into_descriptor_keeps_tag() {
        let segment = TcpSegment {
            src: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
            dst: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)),
            sport: 40000,
            dport: 443,
            seq: 999,
            ack: 0,
            flags: TcpFlags::SYN,
            window: 0,
            mss: Some(1460),
            wscale: Some(7),
            sack_permitted: false,
            ttl: 64,
            recreated: true,
        };
        let conn = segment.into_descriptor(Direction::In);
        assert!(conn.recreated);
        assert!(conn.is_syn_only());
        assert_eq!(conn.mss, Some(1460));
    }
}
