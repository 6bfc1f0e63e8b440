use std::io::Write;

use anyhow::Result;

use crate::output::OutputSink;
use crate::{ScanBanner, ScanStatus};

/// Plain-text one-line-per-event sink, matching the teacher's
/// `Display` impls for scan results (`TcpUdpScanResults`, `PingResults`
/// in the teacher's `lib.rs`).
pub struct ListSink<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> ListSink<W> {
    pub fn new(out: W) -> ListSink<W> {
        ListSink { out }
    }
}

impl<W: Write + Send> OutputSink for ListSink<W> {
    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    fn output_status(&mut self, status: &ScanStatus) -> Result<()> {
        writeln!(
            self.out,
            "{} {} {} {}",
            status.src_ip, status.proto, status.dst_port, status.status
        )?;
        Ok(())
    }

    fn output_banner(&mut self, banner: &ScanBanner) -> Result<()> {
        writeln!(
            self.out,
            "{} {} {} banner: {}",
            banner.src_ip,
            banner.proto,
            banner.port,
            String::from_utf8_lossy(&banner.payload)
        )?;
        Ok(())
    }
}

#[cfg(test)]
impl<W: Write + Send + AsRef<[u8]>> ListSink<W> {
    pub(crate) fn out_snapshot(&self) -> Vec<u8> {
        self.out.as_ref().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Protocol;

    #[test]
    fn formats_status_line() {
        let mut buf = Vec::new();
        {
            let mut sink = ListSink::new(&mut buf);
            sink.begin().unwrap();
            sink.output_status(&ScanStatus {
                ts_ns: 0,
                src_ip: "2001:db8::1".parse().unwrap(),
                proto: Protocol::Tcp,
                src_port: 1234,
                dst_port: 80,
                status: crate::Status::Open,
            })
            .unwrap();
            sink.end().unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "2001:db8::1 tcp 80 open\n");
    }
}
