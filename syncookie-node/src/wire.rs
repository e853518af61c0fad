use crate::error::{Result, SyncookieError};
use crate::packet::{ConnectionDescriptor, Direction, TcpSegment};
use parking_lot::Mutex;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::ipv6::{Ipv6Packet, MutableIpv6Packet};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpOption, TcpOptionNumbers, TcpPacket};
use pnet::packet::Packet;
use pnet::transport::{transport_channel, TransportChannelType, TransportReceiver, TransportSender};
use std::net::IpAddr;
use tracing::{debug, error, info};

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const TCP_HEADER_LEN: usize = 20;

/// Transmits segments built by the cookie path
pub trait SegmentSender: Send + Sync {
    fn send_segment(&self, segment: &TcpSegment) -> Result<()>;
}

/// Parse an IPv4 or IPv6 packet carrying TCP into a descriptor
pub fn parse_segment(bytes: &[u8], direction: Direction) -> Option<ConnectionDescriptor> {
    match bytes.first()? >> 4 {
        4 => {
            let ip = Ipv4Packet::new(bytes)?;
            if ip.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
                return None;
            }
            let tcp = TcpPacket::new(ip.payload())?;
            Some(describe(
                IpAddr::V4(ip.get_source()),
                IpAddr::V4(ip.get_destination()),
                &tcp,
                direction,
            ))
        }
        6 => {
            let ip = Ipv6Packet::new(bytes)?;
            // Extension headers are not walked
            if ip.get_next_header() != IpNextHeaderProtocols::Tcp {
                return None;
            }
            let tcp = TcpPacket::new(ip.payload())?;
            Some(describe(
                IpAddr::V6(ip.get_source()),
                IpAddr::V6(ip.get_destination()),
                &tcp,
                direction,
            ))
        }
        _ => None,
    }
}

fn describe(src: IpAddr, dst: IpAddr, tcp: &TcpPacket, direction: Direction) -> ConnectionDescriptor {
    let mut mss = None;
    let mut wscale = None;
    let mut sack_permitted = false;

    for option in tcp.get_options_iter() {
        let number = option.get_number();
        let payload = option.payload();
        if number == TcpOptionNumbers::MSS && payload.len() >= 2 {
            mss = Some(u16::from_be_bytes([payload[0], payload[1]]));
        } else if number == TcpOptionNumbers::WSCALE && !payload.is_empty() {
            wscale = Some(payload[0]);
        } else if number == TcpOptionNumbers::SACK_PERMITTED {
            sack_permitted = true;
        }
    }

    ConnectionDescriptor {
        src,
        dst,
        sport: tcp.get_source(),
        dport: tcp.get_destination(),
        seq: tcp.get_sequence(),
        ack: tcp.get_acknowledgement(),
        flags: tcp.get_flags() as u8,
        mss,
        wscale,
        sack_permitted,
        direction,
        recreated: false,
    }
}

/// Options for `segment`, padded to 32-bit words, and their encoded length
fn tcp_options(segment: &TcpSegment) -> (Vec<TcpOption>, usize) {
    let mut options = Vec::new();
    let mut len = 0;

    if let Some(mss) = segment.mss {
        options.push(TcpOption::mss(mss));
        len += 4;
    }
    if let Some(wscale) = segment.wscale {
        options.push(TcpOption::nop());
        options.push(TcpOption::wscale(wscale));
        len += 4;
    }
    if segment.sack_permitted {
        options.push(TcpOption::nop());
        options.push(TcpOption::nop());
        options.push(TcpOption::sack_perm());
        len += 4;
    }
    (options, len)
}

/// Serialize `segment` into a complete IP packet with valid checksums
pub fn build_segment(segment: &TcpSegment) -> Result<Vec<u8>> {
    let (options, options_len) = tcp_options(segment);
    let tcp_len = TCP_HEADER_LEN + options_len;

    let mut tcp_buffer = vec![0u8; tcp_len];
    let mut tcp_packet = MutableTcpPacket::new(&mut tcp_buffer)
        .ok_or_else(|| SyncookieError::Transmit("Failed to create TCP packet".to_string()))?;
    tcp_packet.set_source(segment.sport);
    tcp_packet.set_destination(segment.dport);
    tcp_packet.set_sequence(segment.seq);
    tcp_packet.set_acknowledgement(segment.ack);
    tcp_packet.set_data_offset((tcp_len / 4) as u8);
    tcp_packet.set_flags(segment.flags.into());
    tcp_packet.set_window(segment.window);
    tcp_packet.set_urgent_ptr(0);
    tcp_packet.set_options(&options);

    match (segment.src, segment.dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let checksum = tcp::ipv4_checksum(&tcp_packet.to_immutable(), &src, &dst);
            tcp_packet.set_checksum(checksum);

            let total_len = IPV4_HEADER_LEN + tcp_len;
            let mut ip_buffer = vec![0u8; total_len];
            let mut ip_packet = MutableIpv4Packet::new(&mut ip_buffer)
                .ok_or_else(|| SyncookieError::Transmit("Failed to create IP packet".to_string()))?;
            ip_packet.set_version(4);
            ip_packet.set_header_length((IPV4_HEADER_LEN / 4) as u8);
            ip_packet.set_total_length(total_len as u16);
            ip_packet.set_identification(rand::random());
            ip_packet.set_flags(Ipv4Flags::DontFragment);
            ip_packet.set_ttl(segment.ttl);
            ip_packet.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
            ip_packet.set_source(src);
            ip_packet.set_destination(dst);
            ip_packet.set_payload(&tcp_buffer);

            let ip_checksum = ipv4::checksum(&ip_packet.to_immutable());
            ip_packet.set_checksum(ip_checksum);
            Ok(ip_buffer)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let checksum = tcp::ipv6_checksum(&tcp_packet.to_immutable(), &src, &dst);
            tcp_packet.set_checksum(checksum);

            let mut ip_buffer = vec![0u8; IPV6_HEADER_LEN + tcp_len];
            let mut ip_packet = MutableIpv6Packet::new(&mut ip_buffer)
                .ok_or_else(|| SyncookieError::Transmit("Failed to create IPv6 packet".to_string()))?;
            ip_packet.set_version(6);
            ip_packet.set_payload_length(tcp_len as u16);
            ip_packet.set_next_header(IpNextHeaderProtocols::Tcp);
            ip_packet.set_hop_limit(segment.ttl);
            ip_packet.set_source(src);
            ip_packet.set_destination(dst);
            ip_packet.set_payload(&tcp_buffer);
            Ok(ip_buffer)
        }
        _ => Err(SyncookieError::Unsupported(
            "segment mixes address families".to_string(),
        )),
    }
}

/// Sends segments through a layer-3 raw socket (IPv4 only; requires CAP_NET_RAW)
pub struct RawSocketSender {
    tx: Mutex<TransportSender>,
}

impl RawSocketSender {
    /// Open the raw channel, returning the sender and the receive side for the segment loop
    pub fn open(buffer_size: usize) -> Result<(Self, TransportReceiver)> {
        let protocol = TransportChannelType::Layer3(IpNextHeaderProtocols::Tcp);
        let (tx, rx) = transport_channel(buffer_size, protocol)?;
        info!(buffer_size, "Raw TCP transport channel opened");
        Ok((Self { tx: Mutex::new(tx) }, rx))
    }
}

impl SegmentSender for RawSocketSender {
    fn send_segment(&self, segment: &TcpSegment) -> Result<()> {
        if !segment.dst.is_ipv4() {
            return Err(SyncookieError::Unsupported(
                "raw socket sender handles IPv4 only".to_string(),
            ));
        }

        let bytes = build_segment(segment)?;
        let packet = Ipv4Packet::new(&bytes)
            .ok_or_else(|| SyncookieError::Transmit("Failed to view IP packet".to_string()))?;

        match self.tx.lock().send_to(packet, segment.dst) {
            Ok(_) => {
                debug!(dst = %segment.dst, dport = segment.dport, seq = segment.seq, "Segment sent");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, dst = %segment.dst, "Failed to send segment");
                Err(SyncookieError::Transmit(format!("Failed to send segment: {}", e)))
            }
        }
    }
}

/// Keeps every segment in memory instead of transmitting it
#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<TcpSegment>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<TcpSegment> {
        self.sent.lock().clone()
    }

    pub fn take(&self) -> Vec<TcpSegment> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl SegmentSender for RecordingSender {
    fn send_segment(&self, segment: &TcpSegment) -> Result<()> {
        // Build anyway so a segment that could never go on the wire fails here too
        build_segment(segment)?;
        self.sent.lock().push(segment.clone());
        Ok(())
    }
}
