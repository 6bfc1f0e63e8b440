#![doc = include_str!("lib.md")]
use std::fmt;
use std::net::Ipv6Addr;

use pnet::util::MacAddr;

mod banner;
mod codec;
mod engine;
mod errors;
mod output;
mod ports;
mod recv;
mod responder;
mod send;
mod target;
mod transport;

pub use crate::banner::{BannerDialer, BannerPostprocessor, BannerQueryProvider, PassthroughPostprocessor};
pub use crate::codec::{FrameCodec, Ipv6FrameCodec, ICMP_BODY};
pub use crate::engine::ScanEngine;
pub use crate::errors::Error;
pub use crate::output::binary::{BinaryReader, BinaryWriter};
pub use crate::output::json::JsonSink;
pub use crate::output::list::ListSink;
pub use crate::output::OutputSink;
pub use crate::ports::{PortIter, PortSet};
pub use crate::target::generator::{
    AddressGenerator, Duration, ScanSummary, TARGET_RANDOMIZE_SIZE, TARGET_SANITY_MAX_BITS,
};
pub use crate::target::spec::TargetSpec;
pub use crate::transport::loopback::LoopbackTransport;
pub use crate::transport::RawTransport;

/// Wire protocol a scan probes with (spec.md §3 "ScanConfig").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmpv6,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmpv6 => "icmpv6",
        };
        write!(f, "{s}")
    }
}

/// The outcome a responding endpoint is reported with (spec.md §3
/// "ScanStatus record").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Open,
    Closed,
    Up,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Status::Open => "open",
            Status::Closed => "closed",
            Status::Up => "up",
        };
        write!(f, "{s}")
    }
}

/// One responding endpoint (spec.md §3 "ScanStatus record").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanStatus {
    pub ts_ns: u64,
    pub src_ip: Ipv6Addr,
    pub proto: Protocol,
    pub src_port: u16,
    pub dst_port: u16,
    pub status: Status,
}

/// Application-layer bytes captured after a TCP handshake or in a UDP
/// reply (spec.md §3 "ScanBanner record").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanBanner {
    pub ts_ns: u64,
    pub src_ip: Ipv6Addr,
    pub proto: Protocol,
    pub port: u16,
    pub payload: Vec<u8>,
}

/// One reported scan event, as handed to an [`OutputSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Status(ScanStatus),
    Banner(ScanBanner),
}

/// Scan configuration (spec.md §3 "ScanConfig"). Set once before
/// [`ScanEngine::run`] and read-only thereafter — see spec.md §9 "Global
/// mutable state".
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Network interface to capture/transmit on (spec.md §6 "Transport
    /// interface": `open(interface, snaplen)`).
    pub interface: String,
    pub source_mac: MacAddr,
    pub router_mac: MacAddr,
    pub source_ip: Ipv6Addr,
    pub ttl: u8,
    /// `None` means draw a fresh ephemeral port per packet (spec.md §4.E
    /// "Random ephemeral source port").
    pub source_port: Option<u16>,
    pub protocol: Protocol,
    /// Ignored for [`Protocol::Icmpv6`].
    pub ports: PortSet,
    /// `None` means unbounded (spec.md §3 "max-rate (packets/second or
    /// unbounded)").
    pub max_rate: Option<u32>,
    pub show_closed: bool,
    pub banners: bool,
}

impl ScanConfig {
    pub fn frame_codec(&self) -> Ipv6FrameCodec {
        Ipv6FrameCodec {
            source_mac: self.source_mac,
            router_mac: self.router_mac,
            source_ip: self.source_ip,
            ttl: self.ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_display() {
        assert_eq!(Protocol::Tcp.to_string(), "tcp");
        assert_eq!(Status::Open.to_string(), "open");
    }
}
