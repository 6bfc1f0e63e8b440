use std::net::Ipv6Addr;

use anyhow::Result;

use crate::codec::FrameCodec;
use crate::engine::{Counters, ProgressHandle};
use crate::ports::PortIter;
use crate::target::generator::AddressGenerator;
use crate::transport::RawTransport;
use crate::ScanConfig;

/// TCP SYN sender (spec.md §4.E "TCP SYN sender"): one SYN per
/// (address, port) pair, seeded with [`crate::codec::FIRST_SEQNUM`] so the
/// receiver can recognize its own replies.
pub(crate) fn run(
    config: &ScanConfig,
    codec: &dyn FrameCodec,
    generator: &mut AddressGenerator,
    transport: &dyn RawTransport,
    counters: &Counters,
    progress: &ProgressHandle,
) -> Result<()> {
    let mut ports = PortIter::new(&config.ports);
    while let Some(addr) = generator.next() {
        progress.set(generator.progress());
        ports.begin(None);
        let dst_ip = Ipv6Addr::from(addr);
        while let Some(dst_port) = ports.next() {
            let src_port = super::ephemeral_port(config.source_port);
            let frame = codec.build_tcp_syn(dst_ip, src_port, dst_port);
            transport.send(&frame)?;
            super::record_sent(counters, config.max_rate);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Ipv6FrameCodec;
    use crate::ports::PortSet;
    use crate::target::spec::TargetSpec;
    use crate::transport::loopback::LoopbackTransport;
    use crate::Protocol;
    use pnet::packet::tcp::{TcpFlags, TcpPacket};
    use pnet::util::MacAddr;

    fn codec() -> Ipv6FrameCodec {
        Ipv6FrameCodec {
            source_mac: MacAddr::new(1, 2, 3, 4, 5, 6),
            router_mac: MacAddr::new(6, 5, 4, 3, 2, 1),
            source_ip: "2001:db8::1".parse().unwrap(),
            ttl: 64,
        }
    }

    #[test]
    fn concrete_scenario_126_prefix_tcp_80() {
        let spec = TargetSpec::parse("2001:db8::/126").unwrap();
        let mut generator = AddressGenerator::new(vec![spec], false).unwrap();
        let config = ScanConfig {
            interface: "eth0".to_string(),
            source_mac: MacAddr::new(1, 2, 3, 4, 5, 6),
            router_mac: MacAddr::new(6, 5, 4, 3, 2, 1),
            source_ip: "2001:db8::1".parse().unwrap(),
            ttl: 64,
            source_port: Some(12345),
            protocol: Protocol::Tcp,
            ports: PortSet::parse("80").unwrap(),
            max_rate: None,
            show_closed: false,
            banners: false,
        };
        let transport = LoopbackTransport::new();
        let counters = Counters::default();
        let progress = ProgressHandle::default();
        run(&config, &codec(), &mut generator, &transport, &counters, &progress).unwrap();

        let sent = transport.sent_frames();
        assert_eq!(sent.len(), 4);
        let expected_dsts = ["2001:db8::", "2001:db8::1", "2001:db8::2", "2001:db8::3"];
        for (frame, expected) in sent.iter().zip(expected_dsts) {
            let tcp_off = crate::codec::ETH_HEADER_LEN + crate::codec::IPV6_HEADER_LEN;
            let tcp = TcpPacket::new(&frame[tcp_off..]).unwrap();
            assert_eq!(tcp.get_source(), 12345);
            assert_eq!(tcp.get_destination(), 80);
            assert_eq!(tcp.get_sequence(), crate::codec::FIRST_SEQNUM);
            assert_eq!(tcp.get_flags(), TcpFlags::SYN);

            let ip = pnet::packet::ipv6::Ipv6Packet::new(
                &frame[crate::codec::ETH_HEADER_LEN..],
            )
            .unwrap();
            assert_eq!(ip.get_destination().to_string(), expected);
        }
    }
}
