use std::net::Ipv6Addr;

use anyhow::Result;

use crate::codec::FrameCodec;
use crate::engine::{Counters, ProgressHandle};
use crate::target::generator::AddressGenerator;
use crate::transport::RawTransport;
use crate::ScanConfig;

/// ICMPv6 Echo sender (spec.md §4.E "ICMPv6 sender"): one Echo Request
/// per target address, no port iteration.
pub(crate) fn run(
    config: &ScanConfig,
    codec: &dyn FrameCodec,
    generator: &mut AddressGenerator,
    transport: &dyn RawTransport,
    counters: &Counters,
    progress: &ProgressHandle,
) -> Result<()> {
    while let Some(addr) = generator.next() {
        progress.set(generator.progress());
        let dst_ip = Ipv6Addr::from(addr);
        let frame = codec.build_icmpv6_echo(dst_ip);
        transport.send(&frame)?;
        super::record_sent(counters, config.max_rate);
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
    use pnet::packet::icmpv6::Icmpv6Packet;
    use pnet::packet::Packet;
    use pnet::util::MacAddr;

    #[test]
    fn concrete_scenario_single_echo_request() {
        let spec = TargetSpec::parse("::1/128").unwrap();
        let mut generator = AddressGenerator::new(vec![spec], false).unwrap();
        let config = ScanConfig {
            interface: "eth0".to_string(),
            source_mac: MacAddr::new(1, 2, 3, 4, 5, 6),
            router_mac: MacAddr::new(6, 5, 4, 3, 2, 1),
            source_ip: "2001:db8::1".parse().unwrap(),
            ttl: 64,
            source_port: None,
            protocol: Protocol::Icmpv6,
            ports: PortSet::default(),
            max_rate: None,
            show_closed: false,
            banners: false,
        };
        let codec = Ipv6FrameCodec {
            source_mac: config.source_mac,
            router_mac: config.router_mac,
            source_ip: config.source_ip,
            ttl: config.ttl,
        };
        let transport = LoopbackTransport::new();
        let counters = Counters::default();
        let progress = ProgressHandle::default();
        run(&config, &codec, &mut generator, &transport, &counters, &progress).unwrap();

        let sent = transport.sent_frames();
        assert_eq!(sent.len(), 1);
        let icmp_off = crate::codec::ETH_HEADER_LEN + crate::codec::IPV6_HEADER_LEN;
        let icmp = Icmpv6Packet::new(&sent[0][icmp_off..]).unwrap();
        assert_eq!(icmp.get_icmpv6_type().0, 128);
        assert_eq!(icmp.get_icmpv6_code().0, 0);
        let body = u32::from_be_bytes(icmp.payload()[..4].try_into().unwrap());
        assert_eq!(body, crate::codec::ICMP_BODY);
    }
}
