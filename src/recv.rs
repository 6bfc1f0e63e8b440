//! Receiver / classifier (spec.md §4.F).
//!
//! Driven by [`crate::transport::RawTransport::recv_loop`]'s callback;
//! one [`Receiver::on_frame`] call per captured frame.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::banner::BannerPostprocessor;
use crate::codec::{self, Decoded, FIRST_SEQNUM};
use crate::engine::Counters;
use crate::output::OutputSink;
use crate::responder::{BannerCandidate, BannerResponder, BANNER_MAX_LENGTH};
use crate::{Protocol, ScanStatus, Status};

pub(crate) struct Receiver {
    pub protocol: Protocol,
    pub show_closed: bool,
    pub banners: bool,
    pub has_eth: bool,
    pub output: Arc<Mutex<dyn OutputSink>>,
    pub postprocessor: Arc<dyn BannerPostprocessor>,
    pub responder: Option<Arc<BannerResponder>>,
    pub counters: Arc<Counters>,
}

impl Receiver {
    /// One call per captured frame (spec.md §4.F). Malformed or
    /// unrelated packets are silently dropped, never an error.
    pub fn on_frame(&self, ts_ns: u64, frame: &[u8]) {
        self.counters.pkts_recv.fetch_add(1, Ordering::AcqRel);

        let Some(decoded) = codec::decode(frame, self.has_eth) else {
            return;
        };

        match decoded {
            Decoded::Tcp {
                src_ip,
                syn,
                rst,
                ack,
                ack_num,
                src_port,
                dst_port,
            } => self.classify_tcp(ts_ns, src_ip, syn, rst, ack, ack_num, src_port, dst_port),
            Decoded::Udp {
                src_ip,
                src_port,
                dst_port,
                payload,
            } => self.classify_udp(ts_ns, src_ip, src_port, dst_port, payload),
            Decoded::Icmpv6Reply { src_ip, body } => self.classify_icmpv6(ts_ns, src_ip, body),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn classify_tcp(
        &self,
        ts_ns: u64,
        src_ip: std::net::Ipv6Addr,
        syn: bool,
        rst: bool,
        ack: bool,
        ack_num: u32,
        src_port: u16,
        dst_port: u16,
    ) {
        if self.protocol != Protocol::Tcp || !ack || !(syn || rst) {
            return;
        }
        let status = if syn { Status::Open } else { Status::Closed };

        let raw = self.output.lock().unwrap().raw();
        let show = status == Status::Open || self.show_closed || raw;
        if show {
            self.emit_status(ScanStatus {
                ts_ns,
                src_ip,
                proto: Protocol::Tcp,
                src_port,
                dst_port,
                status,
            });
        }

        if syn && self.banners && ack_num == FIRST_SEQNUM.wrapping_add(1) {
            if let Some(responder) = &self.responder {
                responder.submit(BannerCandidate {
                    ts_ns,
                    src_ip,
                    service_port: src_port,
                });
            }
        }
    }

    fn classify_udp(
        &self,
        ts_ns: u64,
        src_ip: std::net::Ipv6Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) {
        if self.protocol != Protocol::Udp {
            return;
        }
        self.emit_status(ScanStatus {
            ts_ns,
            src_ip,
            proto: Protocol::Udp,
            src_port,
            dst_port,
            status: Status::Open,
        });

        if !self.banners || payload.is_empty() {
            return;
        }

        let len = payload.len().min(BANNER_MAX_LENGTH);
        let mut data = payload[..len].to_vec();
        let mut sink = self.output.lock().unwrap();
        if !sink.raw() {
            self.postprocessor.process(Protocol::Udp, src_port, &mut data);
        }
        if let Err(e) = sink.output_banner(&crate::ScanBanner {
            ts_ns,
            src_ip,
            proto: Protocol::Udp,
            port: src_port,
            payload: data,
        }) {
            log::warn!("failed to write banner event: {e}");
        }
    }

    fn classify_icmpv6(&self, ts_ns: u64, src_ip: std::net::Ipv6Addr, body: u32) {
        if self.protocol != Protocol::Icmpv6 || body != codec::ICMP_BODY {
            return;
        }
        self.emit_status(ScanStatus {
            ts_ns,
            src_ip,
            proto: Protocol::Icmpv6,
            src_port: 0,
            dst_port: 0,
            status: Status::Up,
        });
    }

    fn emit_status(&self, status: ScanStatus) {
        let mut sink = self.output.lock().unwrap();
        if let Err(e) = sink.output_status(&status) {
            log::warn!("failed to write status event: {e}");
        }
    }
}
