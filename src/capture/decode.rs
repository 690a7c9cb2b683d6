//! Frame decoding: link-layer bytes to a flow 5-tuple.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use pnet::packet::ethernet::{EtherType, EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::vlan::VlanPacket;
use pnet::packet::Packet;

use crate::domain::{FlowKey, LinkType};

/// Linux cooked capture header length.
const SLL_HEADER_LEN: usize = 16;
/// BSD loopback header length.
const NULL_HEADER_LEN: usize = 4;

/// Extract the 5-tuple of a captured frame.
///
/// Handles Ethernet (with one 802.1Q tag), Linux cooked, BSD loopback
/// and raw IP frames carrying IPv4 or IPv6. Ports are taken from TCP
/// and UDP headers and are 0 for every other transport. Returns `None`
/// for non-IP traffic and truncated headers.
pub fn flow_key(link_type: LinkType, data: &[u8]) -> Option<FlowKey> {
    match link_type {
        LinkType::ETHERNET => {
            let ethernet = EthernetPacket::new(data)?;
            from_ethertype(ethernet.get_ethertype(), ethernet.payload())
        }
        LinkType::LINUX_SLL => {
            let header = data.get(..SLL_HEADER_LEN)?;
            let ethertype = EtherType(u16::from_be_bytes([header[14], header[15]]));
            from_ethertype(ethertype, &data[SLL_HEADER_LEN..])
        }
        LinkType::NULL => from_raw_ip(data.get(NULL_HEADER_LEN..)?),
        LinkType::RAW => from_raw_ip(data),
        _ => None,
    }
}

fn from_ethertype(ethertype: EtherType, payload: &[u8]) -> Option<FlowKey> {
    match ethertype {
        EtherTypes::Ipv4 => from_ipv4(payload),
        EtherTypes::Ipv6 => from_ipv6(payload),
        EtherTypes::Vlan => {
            let vlan = VlanPacket::new(payload)?;
            match vlan.get_ethertype() {
                EtherTypes::Ipv4 => from_ipv4(vlan.payload()),
                EtherTypes::Ipv6 => from_ipv6(vlan.payload()),
                _ => None,
            }
        }
        _ => None,
    }
}

fn from_raw_ip(data: &[u8]) -> Option<FlowKey> {
    match *data.first()? >> 4 {
        4 => from_ipv4(data),
        6 => from_ipv6(data),
        _ => None,
    }
}

fn from_ipv4(data: &[u8]) -> Option<FlowKey> {
    let ipv4 = Ipv4Packet::new(data)?;
    let src: Ipv4Addr = ipv4.get_source();
    let dst: Ipv4Addr = ipv4.get_destination();
    let protocol = ipv4.get_next_level_protocol();
    // Non-first fragments carry no transport header.
    let ports = if ipv4.get_fragment_offset() == 0 {
        transport_ports(protocol, ipv4.payload())
    } else {
        (0, 0)
    };
    Some(FlowKey::new(IpAddr::V4(src), ports.0, IpAddr::V4(dst), ports.1, protocol.0))
}

fn from_ipv6(data: &[u8]) -> Option<FlowKey> {
    let ipv6 = Ipv6Packet::new(data)?;
    let src: Ipv6Addr = ipv6.get_source();
    let dst: Ipv6Addr = ipv6.get_destination();
    let protocol = ipv6.get_next_header();
    let ports = transport_ports(protocol, ipv6.payload());
    Some(FlowKey::new(IpAddr::V6(src), ports.0, IpAddr::V6(dst), ports.1, protocol.0))
}

fn transport_ports(protocol: IpNextHeaderProtocol, payload: &[u8]) -> (u16, u16) {
    match protocol {
        IpNextHeaderProtocols::Tcp => TcpPacket::new(payload)
            .map(|tcp| (tcp.get_source(), tcp.get_destination()))
            .unwrap_or((0, 0)),
        IpNextHeaderProtocols::Udp => UdpPacket::new(payload)
            .map(|udp| (udp.get_source(), udp.get_destination()))
            .unwrap_or((0, 0)),
        _ => (0, 0),
    }
}
