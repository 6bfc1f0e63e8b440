//! Per-service banner query templates and post-processors.
//!
//! spec.md §1 names these an external collaborator ("individual...
//! protocol encoders... and per-service banner query templates and
//! post-processors"), so they're modelled as small traits an embedder can
//! override; the defaults here are deliberately minimal.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::Protocol;

/// Supplies an optional protocol-specific query payload to send after a
/// UDP probe or TCP handshake (spec.md §4.E "UDP sender", §4.G step 2).
pub trait BannerQueryProvider: Send + Sync {
    fn query_for(&self, proto: Protocol, port: u16) -> Option<&[u8]>;
}

/// Rewrites a captured banner before it's reported, unless the output
/// sink is raw (spec.md §4.F "UDP classification", §4.G step 3).
pub trait BannerPostprocessor: Send + Sync {
    fn process(&self, proto: Protocol, port: u16, data: &mut Vec<u8>);
}

/// No queries, no rewriting — the default for both traits.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughPostprocessor;

impl BannerPostprocessor for PassthroughPostprocessor {
    fn process(&self, _proto: Protocol, _port: u16, _data: &mut Vec<u8>) {}
}

impl BannerQueryProvider for PassthroughPostprocessor {
    fn query_for(&self, _proto: Protocol, _port: u16) -> Option<&[u8]> {
        None
    }
}

const HTTP_GET: &[u8] = b"GET / HTTP/1.0\r\nHost: scan\r\n\r\n";
const DNS_VERSION_QUERY: &[u8] = b"\x00\x00\x00\x00\x00\x01\x00\x00\x00\x00\x00\x00\x07version\x04bind\x00\x00\x10\x00\x03";

/// Built once on first use, not per probe: a handful of well-known
/// (protocol, port) pairs mapped to a fixed query payload.
static WELL_KNOWN_QUERIES: Lazy<HashMap<(Protocol, u16), &'static [u8]>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert((Protocol::Tcp, 80), HTTP_GET);
    m.insert((Protocol::Tcp, 8080), HTTP_GET);
    m.insert((Protocol::Udp, 53), DNS_VERSION_QUERY);
    m
});

/// A minimal concrete example covering a handful of well-known ports,
/// demonstrating the plugin point without trying to cover the full
/// nmap-style service probe table (out of scope, spec.md §1).
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpGetQueryProvider;

impl BannerQueryProvider for HttpGetQueryProvider {
    fn query_for(&self, proto: Protocol, port: u16) -> Option<&[u8]> {
        WELL_KNOWN_QUERIES.get(&(proto, port)).copied()
    }
}

/// What the TCP banner responder uses to complete the handshake and read
/// a greeting through the host kernel's stack (spec.md §4.G). An
/// embedder supplies a real kernel-socket implementation; tests use a
/// scripted fake.
pub trait BannerDialer: Send + Sync {
    /// Bind a reserved listening socket on `(source_addr, source_port)`
    /// with a filter that drops everything received on it, before the
    /// scan starts (spec.md §4.G step 1). This keeps the kernel from
    /// replying with RST to the scan's own SYN+ACKs. The default does
    /// nothing, for dialers that don't need a live kernel socket (e.g.
    /// test fakes).
    fn reserve_port(&self, source_addr: std::net::Ipv6Addr, source_port: u16) -> std::io::Result<()> {
        let _ = (source_addr, source_port);
        Ok(())
    }

    /// Release the reservation made by [`BannerDialer::reserve_port`]
    /// (spec.md §9 "owned resource dropped at scan end"). Called once,
    /// after all in-flight dials have drained.
    fn release(&self) {}

    /// Connect to `(src_ip, src_port)`, optionally write `query` first,
    /// then read up to `max_len` bytes, waiting no longer than
    /// `timeout_ms`. `Ok(None)` means the peer closed without sending
    /// anything; an `Err` means the connection itself failed (both are
    /// non-fatal per spec.md §7 "responder's per-flow failures").
    fn dial(
        &self,
        src_ip: std::net::Ipv6Addr,
        src_port: u16,
        query: Option<&[u8]>,
        max_len: usize,
        timeout_ms: u64,
    ) -> std::io::Result<Option<Vec<u8>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_provider_only_matches_well_known_ports() {
        let p = HttpGetQueryProvider;
        assert!(p.query_for(Protocol::Tcp, 80).is_some());
        assert!(p.query_for(Protocol::Udp, 53).is_some());
        assert!(p.query_for(Protocol::Tcp, 22).is_none());
        assert!(p.query_for(Protocol::Udp, 80).is_none());
    }

    #[test]
    fn passthrough_does_nothing() {
        let pp = PassthroughPostprocessor;
        let mut data = vec![1, 2, 3];
        pp.process(Protocol::Tcp, 80, &mut data);
        assert_eq!(data, vec![1, 2, 3]);
        assert!(pp.query_for(Protocol::Tcp, 80).is_none());
    }
}
