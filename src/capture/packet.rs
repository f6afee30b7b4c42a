//! Link, network and TCP header slicing: one captured frame in, one
//! [`Segment`] out.

use std::net::{IpAddr, SocketAddr};

use etherparse::{Ethernet2HeaderSlice, Ipv4HeaderSlice, Ipv6HeaderSlice, TcpHeaderSlice};
use flowtxn_core::{Segment, TcpFlags};

/// Link types understood by [`decode_segment`].
pub mod linktype {
    /// BSD loopback: 4-byte address family, then IP
    pub const NULL: u32 = 0;
    pub const ETHERNET: u32 = 1;
    /// Raw IP (OpenBSD and Linux values for DLT_RAW)
    pub const RAW_BSD: u32 = 12;
    pub const RAW_LINUX: u32 = 14;
    pub const RAW: u32 = 101;
    pub const LINUX_SLL: u32 = 113;
    pub const LINUX_SLL2: u32 = 276;
}

mod ethertype {
    pub const IPV4: u16 = 0x0800;
    pub const IPV6: u16 = 0x86DD;
    pub const VLAN: u16 = 0x8100;
    pub const QINQ: u16 = 0x88A8;
    pub const QINQ_OLD: u16 = 0x9100;
}

mod ip_proto {
    pub const HOP_BY_HOP: u8 = 0;
    pub const TCP: u8 = 6;
    pub const ROUTING: u8 = 43;
    pub const FRAGMENT: u8 = 44;
    pub const DESTINATION: u8 = 60;
}

/// Why a frame produced no segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    UnsupportedLinkType,
    /// ARP, LLDP and other non-IP frames
    NotIp,
    /// UDP, ICMP and other non-TCP packets
    NotTcp,
    /// IP fragments are not reassembled
    Fragment,
    /// A header ended before its declared length
    Truncated,
}

/// Slice a captured frame down to its TCP segment.
pub fn decode_segment(link_type: u32, timestamp: i64, data: &[u8]) -> Result<Segment<'_>, Skip> {
    let ip = match link_type {
        linktype::ETHERNET => {
            let eth = Ethernet2HeaderSlice::from_slice(data).map_err(|_| Skip::Truncated)?;
            let mut ether_type = eth.ether_type().0;
            let mut rest = &data[eth.slice().len()..];
            while matches!(ether_type, ethertype::VLAN | ethertype::QINQ | ethertype::QINQ_OLD) {
                if rest.len() < 4 {
                    return Err(Skip::Truncated);
                }
                ether_type = u16::from_be_bytes([rest[2], rest[3]]);
                rest = &rest[4..];
            }
            match ether_type {
                ethertype::IPV4 | ethertype::IPV6 => rest,
                _ => return Err(Skip::NotIp),
            }
        }
        linktype::RAW | linktype::RAW_BSD | linktype::RAW_LINUX => data,
        linktype::NULL => data.get(4..).ok_or(Skip::Truncated)?,
        linktype::LINUX_SLL => {
            let proto = data.get(14..16).ok_or(Skip::Truncated)?;
            match u16::from_be_bytes([proto[0], proto[1]]) {
                ethertype::IPV4 | ethertype::IPV6 => &data[16..],
                _ => return Err(Skip::NotIp),
            }
        }
        linktype::LINUX_SLL2 => {
            let proto = data.get(0..2).ok_or(Skip::Truncated)?;
            match u16::from_be_bytes([proto[0], proto[1]]) {
                ethertype::IPV4 | ethertype::IPV6 => data.get(20..).ok_or(Skip::Truncated)?,
                _ => return Err(Skip::NotIp),
            }
        }
        _ => return Err(Skip::UnsupportedLinkType),
    };

    let (src_ip, dst_ip, transport) = ip_payload(ip)?;
    let tcp = TcpHeaderSlice::from_slice(transport).map_err(|_| Skip::Truncated)?;
    Ok(Segment {
        timestamp,
        src: SocketAddr::new(src_ip, tcp.source_port()),
        dst: SocketAddr::new(dst_ip, tcp.destination_port()),
        seq: tcp.sequence_number(),
        flags: TcpFlags {
            syn: tcp.syn(),
            ack: tcp.ack(),
            fin: tcp.fin(),
            rst: tcp.rst(),
        },
        payload: &transport[tcp.slice().len()..],
    })
}

/// Addresses and TCP bytes of an IPv4 or IPv6 packet.
fn ip_payload(data: &[u8]) -> Result<(IpAddr, IpAddr, &[u8]), Skip> {
    match data.first().map(|b| b >> 4) {
        Some(4) => {
            let ip = Ipv4HeaderSlice::from_slice(data).map_err(|_| Skip::Truncated)?;
            if ip.protocol().0 != ip_proto::TCP {
                return Err(Skip::NotTcp);
            }
            if ip.is_fragmenting_payload() {
                return Err(Skip::Fragment);
            }
            let header_len = ip.slice().len();
            // Ethernet pads short frames; trust the IP length
            let end = (ip.total_len() as usize).min(data.len());
            if end < header_len {
                return Err(Skip::Truncated);
            }
            Ok((
                IpAddr::V4(ip.source_addr()),
                IpAddr::V4(ip.destination_addr()),
                &data[header_len..end],
            ))
        }
        Some(6) => {
            let ip = Ipv6HeaderSlice::from_slice(data).map_err(|_| Skip::Truncated)?;
            let header_len = ip.slice().len();
            let end = (header_len + ip.payload_length() as usize).min(data.len());
            let mut payload = &data[header_len..end];
            let mut next = ip.next_header().0;
            loop {
                match next {
                    ip_proto::TCP => break,
                    ip_proto::FRAGMENT => return Err(Skip::Fragment),
                    ip_proto::HOP_BY_HOP | ip_proto::ROUTING | ip_proto::DESTINATION => {
                        if payload.len() < 2 {
                            return Err(Skip::Truncated);
                        }
                        let len = (payload[1] as usize + 1) * 8;
                        next = payload[0];
                        payload = payload.get(len..).ok_or(Skip::Truncated)?;
                    }
                    _ => return Err(Skip::NotTcp),
                }
            }
            Ok((
                IpAddr::V6(ip.source_addr()),
                IpAddr::V6(ip.destination_addr()),
                payload,
            ))
        }
        _ => Err(Skip::NotIp),
    }
}

/// Build a frame for tests: Ethernet + IPv4 + TCP with the given payload.
#[cfg(test)]
fn ethernet_ipv4_tcp(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Vec<u8> {
    use etherparse::PacketBuilder;

    let (IpAddr::V4(s), IpAddr::V4(d)) = (src.ip(), dst.ip()) else {
        panic!("IPv4 addresses expected");
    };
    let mut builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
        .ipv4(s.octets(), d.octets(), 64)
        .tcp(src.port(), dst.port(), seq, 65535);
    if flags.syn {
        builder = builder.syn();
    }
    if flags.ack {
        builder = builder.ack(0);
    }
    if flags.fin {
        builder = builder.fin();
    }
    if flags.rst {
        builder = builder.rst();
    }
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut out, payload)
        .expect("writing to a Vec cannot fail");
    out
}
