//! Ethernet/IPv6/TCP/UDP/ICMPv6 frame construction and decoding.
//!
//! Individual protocol encoders are named as an external collaborator in
//! spec.md §1 ("Out of scope") and as the "Encoder interface" in §6. This
//! module is the crate's reference implementation of that interface,
//! built on `pnet::packet` the way the teacher crate builds TCP/ICMP
//! packets in `scan/tcp.rs` and `ping/icmp.rs`.

use std::net::Ipv6Addr;

use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::packet::icmpv6::{self, Icmpv6Code, Icmpv6Packet, Icmpv6Type, MutableIcmpv6Packet};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv6::{Ipv6Packet, MutableIpv6Packet};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpFlags, TcpPacket};
use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};
use pnet::packet::{MutablePacket, Packet};
use pnet::util::MacAddr;

pub const ETH_HEADER_LEN: usize = 14;
pub const IPV6_HEADER_LEN: usize = 40;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const ICMPV6_HEADER_LEN: usize = 8;

/// The own-flow fingerprint seeded into every SYN we send, so the
/// receiver can recognize replies to this scan (spec.md §GLOSSARY
/// "Own-flow fingerprint").
pub const FIRST_SEQNUM: u32 = 0xF000_0000;
/// The own-flow fingerprint for ICMPv6 Echo: identifier/sequence word
/// encoded as one `u32` occupying the same bytes (spec.md §4.E "ICMPv6
/// sender").
pub const ICMP_BODY: u32 = 0x6653_6653;

/// Per-protocol header encoders, named as an external collaborator in
/// spec.md §1 ("Out of scope") and as the "Encoder interface" in §6:
/// Ethernet/IPv6 framing plus one `build_*` routine per sendable
/// protocol. [`Ipv6FrameCodec`] is the reference implementation shipped
/// with this crate.
pub trait FrameCodec: Send + Sync {
    /// Build one TCP SYN frame: source-port = `src_port`, sequence =
    /// [`FIRST_SEQNUM`], ack = 0, window fixed (spec.md §4.E "TCP SYN
    /// sender").
    fn build_tcp_syn(&self, dst_ip: Ipv6Addr, src_port: u16, dst_port: u16) -> Vec<u8>;

    /// Build one UDP datagram frame, optionally carrying `payload` bytes
    /// after the header (spec.md §4.E "UDP sender").
    fn build_udp(&self, dst_ip: Ipv6Addr, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8>;

    /// Build one ICMPv6 Echo Request (type 128, code 0) carrying
    /// [`ICMP_BODY`] as its identifier/sequence word (spec.md §4.E
    /// "ICMPv6 sender").
    fn build_icmpv6_echo(&self, dst_ip: Ipv6Addr) -> Vec<u8>;
}

/// Builds and frames outbound packets for one scan (fixed Ethernet+IPv6
/// header prefix, mutated per packet — spec.md §4.E "Senders"), on
/// `pnet::packet`.
#[derive(Debug, Clone, Copy)]
pub struct Ipv6FrameCodec {
    pub source_mac: MacAddr,
    pub router_mac: MacAddr,
    pub source_ip: Ipv6Addr,
    pub ttl: u8,
}

impl Ipv6FrameCodec {
    fn eth_and_ip(&self, total_len: u16, next_header: pnet::packet::ip::IpNextHeaderProtocol, dst_ip: Ipv6Addr) -> Vec<u8> {
        let mut buf = vec![0u8; ETH_HEADER_LEN + IPV6_HEADER_LEN];
        {
            let mut eth = MutableEthernetPacket::new(&mut buf[..ETH_HEADER_LEN]).unwrap();
            eth.set_destination(self.router_mac);
            eth.set_source(self.source_mac);
            eth.set_ethertype(EtherTypes::Ipv6);
        }
        {
            let mut ip = MutableIpv6Packet::new(&mut buf[ETH_HEADER_LEN..]).unwrap();
            ip.set_version(6);
            ip.set_traffic_class(0);
            ip.set_flow_label(0);
            ip.set_payload_length(total_len);
            ip.set_next_header(next_header);
            ip.set_hop_limit(self.ttl);
            ip.set_source(self.source_ip);
            ip.set_destination(dst_ip);
        }
        buf
    }

    fn fill_tcp_checksum(&self, buf: &mut [u8], dst_ip: Ipv6Addr) {
        let tcp_start = ETH_HEADER_LEN + IPV6_HEADER_LEN;
        let checksum = {
            let tcp_pkt = TcpPacket::new(&buf[tcp_start..]).unwrap();
            tcp::ipv6_checksum(&tcp_pkt, &self.source_ip, &dst_ip)
        };
        let mut tcp = MutableTcpPacket::new(&mut buf[tcp_start..]).unwrap();
        tcp.set_checksum(checksum);
    }
}

impl FrameCodec for Ipv6FrameCodec {
    fn build_tcp_syn(&self, dst_ip: Ipv6Addr, src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut buf = self.eth_and_ip(TCP_HEADER_LEN as u16, IpNextHeaderProtocols::Tcp, dst_ip);
        buf.resize(ETH_HEADER_LEN + IPV6_HEADER_LEN + TCP_HEADER_LEN, 0);
        {
            let mut tcp = MutableTcpPacket::new(&mut buf[ETH_HEADER_LEN + IPV6_HEADER_LEN..]).unwrap();
            tcp.set_source(src_port);
            tcp.set_destination(dst_port);
            tcp.set_sequence(FIRST_SEQNUM);
            tcp.set_acknowledgement(0);
            tcp.set_data_offset(5);
            tcp.set_flags(TcpFlags::SYN);
            tcp.set_window(65535);
            tcp.set_urgent_ptr(0);
        }
        self.fill_tcp_checksum(&mut buf, dst_ip);
        buf
    }

    fn build_udp(&self, dst_ip: Ipv6Addr, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let udp_len = UDP_HEADER_LEN + payload.len();
        let mut buf = self.eth_and_ip(udp_len as u16, IpNextHeaderProtocols::Udp, dst_ip);
        buf.resize(ETH_HEADER_LEN + IPV6_HEADER_LEN + udp_len, 0);
        {
            let mut udp = MutableUdpPacket::new(&mut buf[ETH_HEADER_LEN + IPV6_HEADER_LEN..]).unwrap();
            udp.set_source(src_port);
            udp.set_destination(dst_port);
            udp.set_length(udp_len as u16);
            udp.payload_mut().copy_from_slice(payload);
        }
        let udp_start = ETH_HEADER_LEN + IPV6_HEADER_LEN;
        let checksum = {
            let udp_pkt = UdpPacket::new(&buf[udp_start..]).unwrap();
            udp::ipv6_checksum(&udp_pkt, &self.source_ip, &dst_ip)
        };
        let mut udp = MutableUdpPacket::new(&mut buf[udp_start..]).unwrap();
        udp.set_checksum(checksum);
        buf
    }

    fn build_icmpv6_echo(&self, dst_ip: Ipv6Addr) -> Vec<u8> {
        let mut buf = self.eth_and_ip(ICMPV6_HEADER_LEN as u16, IpNextHeaderProtocols::Icmpv6, dst_ip);
        buf.resize(ETH_HEADER_LEN + IPV6_HEADER_LEN + ICMPV6_HEADER_LEN, 0);
        let icmp_start = ETH_HEADER_LEN + IPV6_HEADER_LEN;
        {
            let mut icmp = MutableIcmpv6Packet::new(&mut buf[icmp_start..]).unwrap();
            icmp.set_icmpv6_type(Icmpv6Type(128));
            icmp.set_icmpv6_code(Icmpv6Code(0));
            icmp.payload_mut()[..4].copy_from_slice(&ICMP_BODY.to_be_bytes());
        }
        let checksum = {
            let icmp_pkt = Icmpv6Packet::new(&buf[icmp_start..]).unwrap();
            icmpv6::checksum(&icmp_pkt, &self.source_ip, &dst_ip)
        };
        let mut icmp = MutableIcmpv6Packet::new(&mut buf[icmp_start..]).unwrap();
        icmp.set_checksum(checksum);
        buf
    }
}

/// The decoded shape of a captured reply (spec.md §4.F "Receiver /
/// classifier").
#[derive(Debug)]
pub enum Decoded<'a> {
    Tcp {
        src_ip: Ipv6Addr,
        syn: bool,
        rst: bool,
        ack: bool,
        /// The TCP acknowledgement number, used to check the own-flow
        /// fingerprint (spec.md §4.G step 2: `ack == FIRST_SEQNUM + 1`).
        ack_num: u32,
        src_port: u16,
        dst_port: u16,
    },
    Udp {
        src_ip: Ipv6Addr,
        src_port: u16,
        dst_port: u16,
        payload: &'a [u8],
    },
    Icmpv6Reply {
        src_ip: Ipv6Addr,
        body: u32,
    },
}

/// Decode one captured frame. `has_eth` mirrors
/// [`crate::transport::RawTransport::has_ethernet_headers`]: when false,
/// `frame` is treated as starting directly at the IPv6 header (spec.md
/// §4.F steps 2-3). Returns `None` for anything malformed, short, or not
/// carrying the expected next-header — such packets are silently dropped,
/// not an error (spec.md §7).
pub fn decode(frame: &[u8], has_eth: bool) -> Option<Decoded<'_>> {
    let ip_off = if has_eth {
        if frame.len() < ETH_HEADER_LEN {
            return None;
        }
        let eth = pnet::packet::ethernet::EthernetPacket::new(frame)?;
        if eth.get_ethertype() != EtherTypes::Ipv6 {
            return None;
        }
        ETH_HEADER_LEN
    } else {
        0
    };
    if frame.len() < ip_off + IPV6_HEADER_LEN {
        return None;
    }
    let ip = Ipv6Packet::new(&frame[ip_off..])?;
    let src_ip = ip.get_source();
    let payload = &frame[ip_off + IPV6_HEADER_LEN..];

    match ip.get_next_header() {
        IpNextHeaderProtocols::Tcp => {
            if payload.len() < TCP_HEADER_LEN {
                return None;
            }
            let tcp = TcpPacket::new(payload)?;
            Some(Decoded::Tcp {
                src_ip,
                syn: tcp.get_flags() & TcpFlags::SYN != 0,
                rst: tcp.get_flags() & TcpFlags::RST != 0,
                ack: tcp.get_flags() & TcpFlags::ACK != 0,
                ack_num: tcp.get_acknowledgement(),
                src_port: tcp.get_source(),
                dst_port: tcp.get_destination(),
            })
        }
        IpNextHeaderProtocols::Udp => {
            if payload.len() < UDP_HEADER_LEN {
                return None;
            }
            let udp = UdpPacket::new(payload)?;
            let data_start = UDP_HEADER_LEN.min(payload.len());
            Some(Decoded::Udp {
                src_ip,
                src_port: udp.get_source(),
                dst_port: udp.get_destination(),
                payload: &payload[data_start..],
            })
        }
        IpNextHeaderProtocols::Icmpv6 => {
            if payload.len() < ICMPV6_HEADER_LEN {
                return None;
            }
            let icmp = Icmpv6Packet::new(payload)?;
            if icmp.get_icmpv6_type() != Icmpv6Type(129) {
                return None;
            }
            let body_bytes = icmp.payload();
            if body_bytes.len() < 4 {
                return None;
            }
            let body = u32::from_be_bytes([body_bytes[0], body_bytes[1], body_bytes[2], body_bytes[3]]);
            Some(Decoded::Icmpv6Reply { src_ip, body })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Ipv6FrameCodec {
        Ipv6FrameCodec {
            source_mac: MacAddr::new(1, 2, 3, 4, 5, 6),
            router_mac: MacAddr::new(6, 5, 4, 3, 2, 1),
            source_ip: "2001:db8::1".parse().unwrap(),
            ttl: 64,
        }
    }

    #[test]
    fn tcp_syn_has_expected_fields() {
        let c = codec();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let frame = c.build_tcp_syn(dst, 12345, 80);
        let tcp = TcpPacket::new(&frame[ETH_HEADER_LEN + IPV6_HEADER_LEN..]).unwrap();
        assert_eq!(tcp.get_sequence(), FIRST_SEQNUM);
        assert_eq!(tcp.get_flags(), TcpFlags::SYN);
        assert_eq!(tcp.get_destination(), 80);
    }

    #[test]
    fn udp_roundtrip_decode() {
        let c = codec();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let frame = c.build_udp(dst, 12345, 53, b"hello");
        match decode(&frame, true) {
            Some(Decoded::Udp { payload, dst_port, .. }) => {
                assert_eq!(payload, b"hello");
                assert_eq!(dst_port, 53);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn icmpv6_echo_roundtrips_body() {
        let c = codec();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let mut frame = c.build_icmpv6_echo(dst);
        // Flip to an Echo Reply to exercise the decoder's own-flow check.
        {
            let icmp_off = ETH_HEADER_LEN + IPV6_HEADER_LEN;
            let mut icmp = MutableIcmpv6Packet::new(&mut frame[icmp_off..]).unwrap();
            icmp.set_icmpv6_type(Icmpv6Type(129));
        }
        match decode(&frame, true) {
            Some(Decoded::Icmpv6Reply { body, .. }) => assert_eq!(body, ICMP_BODY),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn short_packet_is_dropped_not_erroring() {
        assert!(decode(&[0u8; 4], true).is_none());
    }
}
