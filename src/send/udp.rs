use std::net::Ipv6Addr;

use anyhow::Result;

use crate::banner::BannerQueryProvider;
use crate::codec::FrameCodec;
use crate::engine::{Counters, ProgressHandle};
use crate::ports::PortIter;
use crate::target::generator::AddressGenerator;
use crate::transport::RawTransport;
use crate::{Protocol, ScanConfig};

/// UDP sender (spec.md §4.E "UDP sender"): zero-length datagrams, or a
/// per-port query template's bytes when banners are enabled.
pub(crate) fn run(
    config: &ScanConfig,
    codec: &dyn FrameCodec,
    generator: &mut AddressGenerator,
    transport: &dyn RawTransport,
    counters: &Counters,
    progress: &ProgressHandle,
    query_provider: &dyn BannerQueryProvider,
) -> Result<()> {
    let mut ports = PortIter::new(&config.ports);
    while let Some(addr) = generator.next() {
        progress.set(generator.progress());
        ports.begin(None);
        let dst_ip = Ipv6Addr::from(addr);
        while let Some(dst_port) = ports.next() {
            let src_port = super::ephemeral_port(config.source_port);
            let payload = if config.banners {
                query_provider
                    .query_for(Protocol::Udp, dst_port)
                    .unwrap_or(&[])
            } else {
                &[][..]
            };
            let frame = codec.build_udp(dst_ip, src_port, dst_port, payload);
            transport.send(&frame)?;
            super::record_sent(counters, config.max_rate);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::banner::PassthroughPostprocessor;
    use crate::codec::Ipv6FrameCodec;
    use crate::ports::PortSet;
    use crate::target::spec::TargetSpec;
    use crate::transport::loopback::LoopbackTransport;
    use pnet::packet::udp::UdpPacket;
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
    fn concrete_scenario_wildcard_nibble_udp_53_no_banners() {
        let spec = TargetSpec::parse("2001:db8::x").unwrap();
        let mut generator = AddressGenerator::new(vec![spec], false).unwrap();
        let config = ScanConfig {
            interface: "eth0".to_string(),
            source_mac: MacAddr::new(1, 2, 3, 4, 5, 6),
            router_mac: MacAddr::new(6, 5, 4, 3, 2, 1),
            source_ip: "2001:db8::1".parse().unwrap(),
            ttl: 64,
            source_port: Some(9999),
            protocol: Protocol::Udp,
            ports: PortSet::parse("53").unwrap(),
            max_rate: None,
            show_closed: false,
            banners: false,
        };
        let transport = LoopbackTransport::new();
        let counters = Counters::default();
        let progress = ProgressHandle::default();
        run(
            &config,
            &codec(),
            &mut generator,
            &transport,
            &counters,
            &progress,
            &PassthroughPostprocessor,
        )
        .unwrap();

        let sent = transport.sent_frames();
        assert_eq!(sent.len(), 16);
        for frame in &sent {
            let udp_off = crate::codec::ETH_HEADER_LEN + crate::codec::IPV6_HEADER_LEN;
            let udp = UdpPacket::new(&frame[udp_off..]).unwrap();
            assert_eq!(udp.get_destination(), 53);
            assert!(udp.payload().is_empty());
        }
    }
}
