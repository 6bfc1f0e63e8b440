use std::io::Write;

use anyhow::Result;
use serde::Serialize;

use crate::output::OutputSink;
use crate::{Protocol, ScanBanner, ScanStatus, Status};

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum JsonEvent<'a> {
    Status {
        ts_ns: u64,
        src_ip: String,
        proto: &'a str,
        src_port: u16,
        dst_port: u16,
        status: &'a str,
    },
    Banner {
        ts_ns: u64,
        src_ip: String,
        proto: &'a str,
        port: u16,
        banner_hex: String,
    },
}

fn proto_str(p: Protocol) -> &'static str {
    match p {
        Protocol::Tcp => "tcp",
        Protocol::Udp => "udp",
        Protocol::Icmpv6 => "icmp",
    }
}

fn status_str(s: Status) -> &'static str {
    match s {
        Status::Open => "open",
        Status::Closed => "closed",
        Status::Up => "up",
    }
}

/// JSON-per-line sink: one self-contained JSON object per scan event,
/// newline-delimited so a stream can be tailed or piped into `jq`.
pub struct JsonSink<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonSink<W> {
    pub fn new(out: W) -> JsonSink<W> {
        JsonSink { out }
    }
}

impl<W: Write + Send> OutputSink for JsonSink<W> {
    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    fn output_status(&mut self, status: &ScanStatus) -> Result<()> {
        let event = JsonEvent::Status {
            ts_ns: status.ts_ns,
            src_ip: status.src_ip.to_string(),
            proto: proto_str(status.proto),
            src_port: status.src_port,
            dst_port: status.dst_port,
            status: status_str(status.status),
        };
        serde_json::to_writer(&mut self.out, &event)?;
        writeln!(self.out)?;
        Ok(())
    }

    fn output_banner(&mut self, banner: &ScanBanner) -> Result<()> {
        let event = JsonEvent::Banner {
            ts_ns: banner.ts_ns,
            src_ip: banner.src_ip.to_string(),
            proto: proto_str(banner.proto),
            port: banner.port,
            banner_hex: hex::encode(&banner.payload),
        };
        serde_json::to_writer(&mut self.out, &event)?;
        writeln!(self.out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_one_json_object_per_line() {
        let mut buf = Vec::new();
        {
            let mut sink = JsonSink::new(&mut buf);
            sink.output_status(&ScanStatus {
                ts_ns: 42,
                src_ip: "::1".parse().unwrap(),
                proto: Protocol::Tcp,
                src_port: 1,
                dst_port: 80,
                status: Status::Open,
            })
            .unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 1);
        let parsed: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(parsed["dst_port"], 80);
        assert_eq!(parsed["status"], "open");
    }
}
