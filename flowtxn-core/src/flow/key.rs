use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
        }
    }
}

/// Address family tag, kept in the key so an IPv4 address never collides
/// with its IPv4-mapped IPv6 form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Family {
    V4,
    V6,
}

/// Directed 4-tuple plus transport, in a fixed-size hashable layout.
///
/// A key is oriented: `FlowKey::new(a, b)` and `FlowKey::new(b, a)` are
/// different values that hash to different table entries. The flow table
/// stores each flow under the orientation of its first packet and tries
/// [`reversed`](Self::reversed) to match packets travelling the other way.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    src_addr: [u8; 16],
    dst_addr: [u8; 16],
    src_port: u16,
    dst_port: u16,
    family: Family,
    transport: Transport,
}

impl FlowKey {
    /// Build a key from source and destination endpoints.
    ///
    /// Mixed families (one IPv4, one IPv6 endpoint) cannot occur on the
    /// wire; if they are passed anyway both sides are stored in IPv6 form.
    pub fn new(src: SocketAddr, dst: SocketAddr, transport: Transport) -> Self {
        let family = match (src.ip(), dst.ip()) {
            (IpAddr::V4(_), IpAddr::V4(_)) => Family::V4,
            _ => Family::V6,
        };
        Self {
            src_addr: addr_bytes(src.ip()),
            dst_addr: addr_bytes(dst.ip()),
            src_port: src.port(),
            dst_port: dst.port(),
            family,
            transport,
        }
    }

    /// TCP shorthand for [`FlowKey::new`].
    pub fn tcp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self::new(src, dst, Transport::Tcp)
    }

    /// The same flow seen from the other side.
    pub fn reversed(&self) -> Self {
        Self {
            src_addr: self.dst_addr,
            dst_addr: self.src_addr,
            src_port: self.dst_port,
            dst_port: self.src_port,
            family: self.family,
            transport: self.transport,
        }
    }

    pub fn src(&self) -> SocketAddr {
        SocketAddr::new(self.ip(&self.src_addr), self.src_port)
    }

    pub fn dst(&self) -> SocketAddr {
        SocketAddr::new(self.ip(&self.dst_addr), self.dst_port)
    }

    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    fn ip(&self, bytes: &[u8; 16]) -> IpAddr {
        match self.family {
            Family::V4 => IpAddr::V4(Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15])),
            Family::V6 => IpAddr::V6(Ipv6Addr::from(*bytes)),
        }
    }
}

fn addr_bytes(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

impl fmt::Debug for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.transport.as_str(),
            self.src(),
            self.dst()
        )
    }
}
