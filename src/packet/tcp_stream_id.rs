//! TCP flow identification
//!
//! This module provides the `FlowId` struct which identifies one side's view of a
//! TCP connection using the standard 5-tuple: source IP, destination IP, source
//! port, destination port, and protocol number.
//!
//! Frames can be decoded from Ethernet captures or raw IP packets, the two
//! layouts capture backends hand out. Decoding yields the flow identity plus the
//! TCP segment bytes, trimmed to the IP-declared length so link-layer padding
//! never turns into payload.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
pub(crate) const IPPROTO_TCP: u8 = 6;

/// Which way a segment travels relative to the session's client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    #[must_use]
    pub const fn reverse(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => f.write_str("c2s"),
            Direction::ServerToClient => f.write_str("s2c"),
        }
    }
}

/// A TCP flow identifier using the 5-tuple
/// (source IP, destination IP, source port, destination port, protocol)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowId {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl Hash for FlowId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_ip(self.src_ip, state);
        hash_ip(self.dst_ip, state);
        self.src_port.hash(state);
        self.dst_port.hash(state);
        self.protocol.hash(state);
    }
}

fn hash_ip<H: Hasher>(ip: IpAddr, state: &mut H) {
    match ip {
        IpAddr::V4(ip) => {
            0u8.hash(state);
            ip.octets().hash(state);
        }
        IpAddr::V6(ip) => {
            1u8.hash(state);
            ip.octets().hash(state);
        }
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

impl FlowId {
    #[must_use]
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            protocol: IPPROTO_TCP,
        }
    }

    /// The same flow seen from the other endpoint.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }

    /// Direction-agnostic key: both orientations of one connection map to the
    /// same value.
    #[must_use]
    pub fn canonical(&self) -> Self {
        if (self.src_ip, self.src_port) <= (self.dst_ip, self.dst_port) {
            *self
        } else {
            self.reversed()
        }
    }

    /// Decode a captured frame into its flow identity and TCP segment bytes.
    /// Handles both Ethernet frames and raw IP packets.
    #[must_use]
    pub fn from_frame(frame: &[u8]) -> Option<(Self, &[u8])> {
        // Try parsing as Ethernet frame first
        if let Some(decoded) = Self::from_ethernet_frame(frame) {
            return Some(decoded);
        }

        Self::from_ip_packet(frame)
    }

    /// Parse from Ethernet frame (14-byte Ethernet header, optional 802.1Q tag, IP packet)
    #[must_use]
    pub fn from_ethernet_frame(frame: &[u8]) -> Option<(Self, &[u8])> {
        if frame.len() < 14 {
            return None;
        }

        let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
        let mut ip_packet = &frame[14..];

        if ethertype == ETHERTYPE_VLAN {
            if ip_packet.len() < 4 {
                return None;
            }
            ethertype = u16::from_be_bytes([ip_packet[2], ip_packet[3]]);
            ip_packet = &ip_packet[4..];
        }

        match ethertype {
            ETHERTYPE_IPV4 => Self::from_ipv4_packet(ip_packet),
            ETHERTYPE_IPV6 => Self::from_ipv6_packet(ip_packet),
            _ => None,
        }
    }

    /// Parse from raw IP packet (no Ethernet header)
    #[must_use]
    pub fn from_ip_packet(packet: &[u8]) -> Option<(Self, &[u8])> {
        let first = *packet.first()?;

        match first >> 4 {
            4 => Self::from_ipv4_packet(packet),
            6 => Self::from_ipv6_packet(packet),
            _ => None,
        }
    }

    /// Parse from IPv4 packet
    #[must_use]
    pub fn from_ipv4_packet(packet: &[u8]) -> Option<(Self, &[u8])> {
        if packet.len() < 20 || packet[0] >> 4 != 4 {
            return None;
        }

        if packet[9] != IPPROTO_TCP {
            return None;
        }

        // Non-first fragments carry no TCP header
        let fragment_offset = u16::from_be_bytes([packet[6], packet[7]]) & 0x1FFF;
        if fragment_offset != 0 {
            return None;
        }

        let ihl = usize::from(packet[0] & 0x0F) * 4;
        let total_len = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
        if ihl < 20 || total_len < ihl || packet.len() < ihl {
            return None;
        }
        // Ethernet pads short frames; the IP length is authoritative
        let end = total_len.min(packet.len());

        let src_ip = IpAddr::V4(Ipv4Addr::new(
            packet[12], packet[13], packet[14], packet[15],
        ));
        let dst_ip = IpAddr::V4(Ipv4Addr::new(
            packet[16], packet[17], packet[18], packet[19],
        ));

        Self::from_tcp_segment(src_ip, dst_ip, &packet[ihl..end])
    }

    /// Parse from IPv6 packet. Extension headers are not walked.
    #[must_use]
    pub fn from_ipv6_packet(packet: &[u8]) -> Option<(Self, &[u8])> {
        if packet.len() < 40 || packet[0] >> 4 != 6 {
            return None;
        }

        if packet[6] != IPPROTO_TCP {
            return None;
        }

        let payload_len = usize::from(u16::from_be_bytes([packet[4], packet[5]]));
        let end = (40 + payload_len).min(packet.len());

        let mut src = [0u8; 16];
        src.copy_from_slice(&packet[8..24]);
        let mut dst = [0u8; 16];
        dst.copy_from_slice(&packet[24..40]);

        Self::from_tcp_segment(
            IpAddr::V6(Ipv6Addr::from(src)),
            IpAddr::V6(Ipv6Addr::from(dst)),
            &packet[40..end],
        )
    }

    fn from_tcp_segment(src_ip: IpAddr, dst_ip: IpAddr, segment: &[u8]) -> Option<(Self, &[u8])> {
        if segment.len() < 4 {
            return None;
        }

        let src_port = u16::from_be_bytes([segment[0], segment[1]]);
        let dst_port = u16::from_be_bytes([segment[2], segment[3]]);

        Some((Self::new(src_ip, src_port, dst_ip, dst_port), segment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::hash::{Hash, Hasher};

    fn ipv4_tcp(total_len: u16) -> Vec<u8> {
        // IPv4 header (20 bytes) + TCP header (20 bytes)
        let mut packet = vec![0u8; 40];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&total_len.to_be_bytes());
        packet[9] = 6;
        packet[12..16].copy_from_slice(&[192, 168, 1, 100]);
        packet[16..20].copy_from_slice(&[10, 0, 0, 1]);
        packet[20..22].copy_from_slice(&12345u16.to_be_bytes());
        packet[22..24].copy_from_slice(&80u16.to_be_bytes());
        packet
    }

    #[test]
    fn test_flow_id_from_ipv4_packet() {
        let packet = ipv4_tcp(40);
        let (flow, segment) = FlowId::from_ip_packet(&packet).unwrap();

        assert_eq!(flow.src_ip, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)));
        assert_eq!(flow.dst_ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(flow.src_port, 12345);
        assert_eq!(flow.dst_port, 80);
        assert_eq!(flow.protocol, 6);
        assert_eq!(segment.len(), 20);
    }

    #[test]
    fn test_flow_id_from_ethernet_frame_strips_padding() {
        let mut frame = vec![0u8; 14];
        frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame.extend_from_slice(&ipv4_tcp(40));
        // trailing Ethernet padding must not reach the TCP layer
        frame.extend_from_slice(&[0xEE; 6]);

        let (flow, segment) = FlowId::from_ethernet_frame(&frame).unwrap();
        assert_eq!(flow.src_port, 12345);
        assert_eq!(segment.len(), 20);
    }

    #[test]
    fn test_flow_id_from_vlan_tagged_frame() {
        let mut frame = vec![0u8; 14];
        frame[12..14].copy_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x0A]);
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame.extend_from_slice(&ipv4_tcp(40));

        let (flow, _) = FlowId::from_frame(&frame).unwrap();
        assert_eq!(flow.dst_port, 80);
    }

    #[test]
    fn test_flow_id_from_ipv6_packet() {
        let mut packet = vec![0u8; 60];
        packet[0] = 0x60;
        packet[4..6].copy_from_slice(&20u16.to_be_bytes());
        packet[6] = 6;
        packet[8..24].copy_from_slice(&Ipv6Addr::new(0x2001, 0x0db8, 0, 0, 0, 0, 0, 1).octets());
        packet[24..40].copy_from_slice(&Ipv6Addr::new(0x2001, 0x0db8, 0, 0, 0, 0, 0, 2).octets());
        packet[40..42].copy_from_slice(&8080u16.to_be_bytes());
        packet[42..44].copy_from_slice(&80u16.to_be_bytes());

        let (flow, segment) = FlowId::from_ip_packet(&packet).unwrap();

        assert_eq!(
            flow.src_ip,
            IpAddr::V6(Ipv6Addr::new(0x2001, 0x0db8, 0, 0, 0, 0, 0, 1))
        );
        assert_eq!(flow.src_port, 8080);
        assert_eq!(flow.dst_port, 80);
        assert_eq!(segment.len(), 20);
    }

    #[test]
    fn test_flow_id_invalid_packets() {
        assert!(FlowId::from_frame(&[0u8; 10]).is_none());

        let mut udp = ipv4_tcp(40);
        udp[9] = 17;
        assert!(FlowId::from_ip_packet(&udp).is_none());

        let mut bad_version = ipv4_tcp(40);
        bad_version[0] = 0x35;
        assert!(FlowId::from_ip_packet(&bad_version).is_none());

        let mut fragment = ipv4_tcp(40);
        fragment[7] = 0x10;
        assert!(FlowId::from_ip_packet(&fragment).is_none());
    }

    #[test]
    fn test_canonical_is_orientation_free() {
        use std::collections::hash_map::DefaultHasher;

        let (flow, _) = FlowId::from_ip_packet(&ipv4_tcp(40)).unwrap();
        let back = flow.reversed();

        assert_ne!(flow, back);
        assert_eq!(flow.canonical(), back.canonical());

        let mut h1 = DefaultHasher::new();
        let mut h2 = DefaultHasher::new();
        flow.canonical().hash(&mut h1);
        back.canonical().hash(&mut h2);
        assert_eq!(h1.finish(), h2.finish());
    }

    #[test]
    fn test_direction_reverse() {
        assert_eq!(Direction::ClientToServer.reverse(), Direction::ServerToClient);
        assert_eq!(Direction::ServerToClient.to_string(), "s2c");
    }
}
