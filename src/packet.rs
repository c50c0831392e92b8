//! IPv4/IPv6 + TCP/UDP dissection and order-invariant flow-key derivation.

use std::net::IpAddr;

/// L4 protocol numbers used throughout the forwarding plane.
pub mod l4 {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// Direction of a packet relative to a [`crate::flow::Flow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// An owned, bounded-size datagram plus its parsed fields. Created on NIC
/// ingress, consumed by the dispatcher; never shared between tasks.
#[derive(Debug, Clone)]
pub struct PacketDescriptor {
    buffer: Vec<u8>,
    pub ip_version: u8,
    pub l4_protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub client_ip: Option<IpAddr>,
    pub client_virtual_ip: Option<IpAddr>,
    pub in_nic: u64,
    pub out_nic: u64,
    pub flow_key: u64,
    application_offset: usize,
}

impl PacketDescriptor {
    /// Parse `buffer` as a raw IP datagram. Returns `None` if the version
    /// nibble or headers don't decode.
    pub fn parse(buffer: Vec<u8>) -> Option<Self> {
        if buffer.is_empty() {
            return None;
        }
        let version_nibble = buffer[0] & 0xf0;
        let (ip_version, src_ip, dst_ip, l4_protocol, l4_offset) = if version_nibble == 0x40 {
            parse_ipv4(&buffer)?
        } else if version_nibble == 0x60 {
            parse_ipv6(&buffer)?
        } else {
            return None;
        };

        let (src_port, dst_port, app_offset) = match l4_protocol {
            l4::TCP => parse_tcp_ports(&buffer, l4_offset)?,
            l4::UDP => parse_udp_ports(&buffer, l4_offset)?,
            _ => (0, 0, l4_offset),
        };

        let flow_key = calculate_flow_key(src_ip, dst_ip);

        Some(Self {
            buffer,
            ip_version,
            l4_protocol,
            src_port,
            dst_port,
            src_ip,
            dst_ip,
            client_ip: None,
            client_virtual_ip: None,
            in_nic: 0,
            out_nic: 0,
            flow_key,
            application_offset: app_offset,
        })
    }

    /// The raw datagram bytes.
    pub fn raw(&self) -> &[u8] {
        &self.buffer
    }

    /// Bytes used (same as `raw().len()`, kept for parity with the source's
    /// `GetUsedSize`).
    pub fn used_size(&self) -> usize {
        self.buffer.len()
    }

    /// The application-layer payload, if any bytes remain past the L4 header.
    pub fn application_payload(&self) -> &[u8] {
        self.buffer.get(self.application_offset..).unwrap_or(&[])
    }

    /// `true` if the destination address is a multicast address.
    pub fn is_multicast_destination(&self) -> bool {
        match self.dst_ip {
            IpAddr::V4(v4) => v4.is_multicast(),
            IpAddr::V6(v6) => v6.is_multicast(),
        }
    }

    /// Direction relative to a flow whose recorded source is `flow_source`.
    pub fn direction_relative_to(&self, flow_source: IpAddr) -> Direction {
        if self.src_ip == flow_source {
            Direction::Send
        } else {
            Direction::Receive
        }
    }
}

/// Order-invariant flow-key derivation (§3): for IPv4, xor the low 32 bits
/// of each address; for IPv6, xor each address's high/low 64-bit halves,
/// then xor the two per-address results.
pub fn calculate_flow_key(src: IpAddr, dst: IpAddr) -> u64 {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            u32::from_le_bytes(s.octets()) as u64 ^ u32::from_le_bytes(d.octets()) as u64
        }
        (a, b) => v6_index(a) ^ v6_index(b),
    }
}

fn v6_index(ip: IpAddr) -> u64 {
    let bytes = match ip {
        IpAddr::V6(v6) => v6.octets(),
        IpAddr::V4(v4) => {
            let mut mapped = [0u8; 16];
            mapped[12..].copy_from_slice(&v4.octets());
            mapped
        }
    };
    let hi = u64::from_le_bytes(bytes[..8].try_into().unwrap());
    let lo = u64::from_le_bytes(bytes[8..].try_into().unwrap());
    hi ^ lo
}

fn parse_ipv4(buffer: &[u8]) -> Option<(u8, IpAddr, IpAddr, u8, usize)> {
    if buffer.len() < 20 {
        return None;
    }
    let ihl = (buffer[0] & 0x0f) as usize * 4;
    if buffer.len() < ihl {
        return None;
    }
    let protocol = buffer[9];
    let src = IpAddr::from([buffer[12], buffer[13], buffer[14], buffer[15]]);
    let dst = IpAddr::from([buffer[16], buffer[17], buffer[18], buffer[19]]);
    Some((4, src, dst, protocol, ihl))
}

fn parse_ipv6(buffer: &[u8]) -> Option<(u8, IpAddr, IpAddr, u8, usize)> {
    if buffer.len() < 40 {
        return None;
    }
    let next_header = buffer[6];
    let src: [u8; 16] = buffer[8..24].try_into().ok()?;
    let dst: [u8; 16] = buffer[24..40].try_into().ok()?;
    Some((6, IpAddr::from(src), IpAddr::from(dst), next_header, 40))
}

fn parse_tcp_ports(buffer: &[u8], offset: usize) -> Option<(u16, u16, usize)> {
    if buffer.len() < offset + 20 {
        return None;
    }
    let src_port = u16::from_be_bytes([buffer[offset], buffer[offset + 1]]);
    let dst_port = u16::from_be_bytes([buffer[offset + 2], buffer[offset + 3]]);
    let data_offset = ((buffer[offset + 12] >> 4) as usize) * 4;
    Some((src_port, dst_port, offset + data_offset))
}

fn parse_udp_ports(buffer: &[u8], offset: usize) -> Option<(u16, u16, usize)> {
    if buffer.len() < offset + 8 {
        return None;
    }
    let src_port = u16::from_be_bytes([buffer[offset], buffer[offset + 1]]);
    let dst_port = u16::from_be_bytes([buffer[offset + 2], buffer[offset + 3]]);
    Some((src_port, dst_port, offset + 8))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dns_query_v4() -> Vec<u8> {
        // minimal IPv4/UDP datagram: 10.0.0.1:53421 -> 8.8.8.8:53
        let mut pkt = vec![0u8; 28 + 4];
        pkt[0] = 0x45;
        pkt[9] = l4::UDP;
        pkt[12..16].copy_from_slice(&[10, 0, 0, 1]);
        pkt[16..20].copy_from_slice(&[8, 8, 8, 8]);
        pkt[20..22].copy_from_slice(&53421u16.to_be_bytes());
        pkt[22..24].copy_from_slice(&53u16.to_be_bytes());
        pkt[28..].copy_from_slice(b"quer");
        pkt
    }

    fn dns_reply_v4() -> Vec<u8> {
        let mut pkt = vec![0u8; 28 + 4];
        pkt[0] = 0x45;
        pkt[9] = l4::UDP;
        pkt[12..16].copy_from_slice(&[8, 8, 8, 8]);
        pkt[16..20].copy_from_slice(&[10, 0, 0, 1]);
        pkt[20..22].copy_from_slice(&53u16.to_be_bytes());
        pkt[22..24].copy_from_slice(&53421u16.to_be_bytes());
        pkt[28..].copy_from_slice(b"resp");
        pkt
    }

    #[test]
    fn flow_key_symmetric_between_query_and_reply() {
        let query = PacketDescriptor::parse(dns_query_v4()).unwrap();
        let reply = PacketDescriptor::parse(dns_reply_v4()).unwrap();
        assert_eq!(query.flow_key, reply.flow_key);
    }

    #[test]
    fn direction_resolves_against_flow_source() {
        let query = PacketDescriptor::parse(dns_query_v4()).unwrap();
        let reply = PacketDescriptor::parse(dns_reply_v4()).unwrap();
        let flow_source = query.src_ip;
        assert_eq!(query.direction_relative_to(flow_source), Direction::Send);
        assert_eq!(reply.direction_relative_to(flow_source), Direction::Receive);
    }

    #[test]
    fn rejects_unparseable_buffer() {
        assert!(PacketDescriptor::parse(vec![0xff; 10]).is_none());
        assert!(PacketDescriptor::parse(vec![]).is_none());
    }
}
