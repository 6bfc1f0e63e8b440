//! Self-describing binary scan log (spec.md §4.H).
//!
//! Not present in the retained `original_source/` C files in concrete
//! byte-layout form, so the format is defined here: magic, version,
//! then a sequence of `tag/len/payload/crc32` records until EOF. See
//! SPEC_FULL.md §4.H for the exact layout.

use std::io::{self, Read, Write};

use anyhow::{bail, Context, Result};
use crc32fast::Hasher;

use crate::output::OutputSink;
use crate::{Protocol, ScanBanner, ScanStatus, Status};

const MAGIC: [u8; 4] = *b"S6SL";
const VERSION: u8 = 1;
const TAG_STATUS: u8 = 1;
const TAG_BANNER: u8 = 2;

fn proto_byte(p: Protocol) -> u8 {
    match p {
        Protocol::Tcp => 0,
        Protocol::Udp => 1,
        Protocol::Icmpv6 => 2,
    }
}

fn proto_from_byte(b: u8) -> Result<Protocol> {
    match b {
        0 => Ok(Protocol::Tcp),
        1 => Ok(Protocol::Udp),
        2 => Ok(Protocol::Icmpv6),
        _ => bail!(crate::errors::Error::BadScanLog {
            reason: format!("unknown proto byte {}", b),
        }),
    }
}

fn status_byte(s: Status) -> u8 {
    match s {
        Status::Open => 0,
        Status::Closed => 1,
        Status::Up => 2,
    }
}

fn status_from_byte(b: u8) -> Result<Status> {
    match b {
        0 => Ok(Status::Open),
        1 => Ok(Status::Closed),
        2 => Ok(Status::Up),
        _ => bail!(crate::errors::Error::BadScanLog {
            reason: format!("unknown status byte {}", b),
        }),
    }
}

fn write_record(out: &mut impl Write, tag: u8, payload: &[u8]) -> Result<()> {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let crc = hasher.finalize();

    out.write_all(&[tag])?;
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(payload)?;
    out.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Writes the binary scan log format: header once, then one record per
/// event. Stores both Open and Closed TCP statuses unconditionally;
/// `--show-closed` filtering is a read-time concern (spec.md §4.H).
pub struct BinaryWriter<W: Write + Send> {
    out: W,
    header_written: bool,
}

impl<W: Write + Send> BinaryWriter<W> {
    pub fn new(out: W) -> BinaryWriter<W> {
        BinaryWriter {
            out,
            header_written: false,
        }
    }
}

impl<W: Write + Send> OutputSink for BinaryWriter<W> {
    fn begin(&mut self) -> Result<()> {
        self.out.write_all(&MAGIC)?;
        self.out.write_all(&[VERSION])?;
        self.header_written = true;
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    fn output_status(&mut self, status: &ScanStatus) -> Result<()> {
        if !self.header_written {
            self.begin()?;
        }
        let mut payload = Vec::with_capacity(8 + 16 + 1 + 2 + 2 + 1);
        payload.extend_from_slice(&status.ts_ns.to_le_bytes());
        payload.extend_from_slice(&status.src_ip.octets());
        payload.push(proto_byte(status.proto));
        payload.extend_from_slice(&status.src_port.to_le_bytes());
        payload.extend_from_slice(&status.dst_port.to_le_bytes());
        payload.push(status_byte(status.status));
        write_record(&mut self.out, TAG_STATUS, &payload)?;
        Ok(())
    }

    fn output_banner(&mut self, banner: &ScanBanner) -> Result<()> {
        if !self.header_written {
            self.begin()?;
        }
        let mut payload = Vec::with_capacity(8 + 16 + 1 + 2 + 4 + banner.payload.len());
        payload.extend_from_slice(&banner.ts_ns.to_le_bytes());
        payload.extend_from_slice(&banner.src_ip.octets());
        payload.push(proto_byte(banner.proto));
        payload.extend_from_slice(&banner.port.to_le_bytes());
        payload.extend_from_slice(&(banner.payload.len() as u32).to_le_bytes());
        payload.extend_from_slice(&banner.payload);
        write_record(&mut self.out, TAG_BANNER, &payload)?;
        Ok(())
    }

    fn raw(&self) -> bool {
        true
    }
}

/// One decoded record from a binary scan log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Status(ScanStatus),
    Banner(ScanBanner),
}

/// Reads back a stream produced by [`BinaryWriter`], validating the
/// header and each record's CRC32. `show_closed` controls whether
/// Closed TCP status records are yielded (spec.md §4.H read-time
/// filtering).
pub struct BinaryReader<R: Read> {
    inner: R,
    show_closed: bool,
    banners: bool,
    header_checked: bool,
}

impl<R: Read> BinaryReader<R> {
    pub fn new(inner: R) -> BinaryReader<R> {
        BinaryReader {
            inner,
            show_closed: true,
            banners: true,
            header_checked: false,
        }
    }

    pub fn with_show_closed(mut self, show_closed: bool) -> Self {
        self.show_closed = show_closed;
        self
    }

    /// Controls whether `LogRecord::Banner` records are yielded (spec.md
    /// §4.H read-time filtering: binary mode stores banners
    /// unconditionally, `--banners` only governs the read-back).
    pub fn with_banners(mut self, banners: bool) -> Self {
        self.banners = banners;
        self
    }

    fn check_header(&mut self) -> Result<()> {
        let mut magic = [0u8; 4];
        self.inner
            .read_exact(&mut magic)
            .context("reading scan log magic")?;
        if magic != MAGIC {
            bail!(crate::errors::Error::BadScanLog {
                reason: "bad magic".to_string(),
            });
        }
        let mut version = [0u8; 1];
        self.inner.read_exact(&mut version)?;
        if version[0] != VERSION {
            bail!(crate::errors::Error::BadScanLog {
                reason: format!("unsupported version {}", version[0]),
            });
        }
        self.header_checked = true;
        Ok(())
    }

    fn read_record(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        let mut tag = [0u8; 1];
        match self.inner.read_exact(&mut tag) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let mut len_buf = [0u8; 4];
        self.inner.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload)?;
        let mut crc_buf = [0u8; 4];
        self.inner.read_exact(&mut crc_buf)?;
        let want = u32::from_le_bytes(crc_buf);

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != want {
            bail!(crate::errors::Error::BadScanLog {
                reason: "crc32 mismatch".to_string(),
            });
        }
        Ok(Some((tag[0], payload)))
    }

    fn decode_status(payload: &[u8]) -> Result<ScanStatus> {
        if payload.len() != 30 {
            bail!(crate::errors::Error::BadScanLog {
                reason: format!("status payload length {}", payload.len()),
            });
        }
        let ts_ns = u64::from_le_bytes(payload[0..8].try_into().unwrap());
        let mut ip = [0u8; 16];
        ip.copy_from_slice(&payload[8..24]);
        let proto = proto_from_byte(payload[24])?;
        let src_port = u16::from_le_bytes(payload[25..27].try_into().unwrap());
        let dst_port = u16::from_le_bytes(payload[27..29].try_into().unwrap());
        let status = status_from_byte(payload[29])?;
        Ok(ScanStatus {
            ts_ns,
            src_ip: ip.into(),
            proto,
            src_port,
            dst_port,
            status,
        })
    }

    fn decode_banner(payload: &[u8]) -> Result<ScanBanner> {
        if payload.len() < 31 {
            bail!(crate::errors::Error::BadScanLog {
                reason: format!("banner payload length {}", payload.len()),
            });
        }
        let ts_ns = u64::from_le_bytes(payload[0..8].try_into().unwrap());
        let mut ip = [0u8; 16];
        ip.copy_from_slice(&payload[8..24]);
        let proto = proto_from_byte(payload[24])?;
        let port = u16::from_le_bytes(payload[25..27].try_into().unwrap());
        let blen = u32::from_le_bytes(payload[27..31].try_into().unwrap()) as usize;
        if payload.len() != 31 + blen {
            bail!(crate::errors::Error::BadScanLog {
                reason: "banner length field mismatch".to_string(),
            });
        }
        Ok(ScanBanner {
            ts_ns,
            src_ip: ip.into(),
            proto,
            port,
            payload: payload[31..].to_vec(),
        })
    }

    /// Reads the next record, applying `show_closed` filtering. Returns
    /// `Ok(None)` at a clean EOF between records.
    pub fn next_record(&mut self) -> Result<Option<LogRecord>> {
        if !self.header_checked {
            self.check_header()?;
        }
        loop {
            let (tag, payload) = match self.read_record()? {
                Some(r) => r,
                None => return Ok(None),
            };
            match tag {
                TAG_STATUS => {
                    let status = Self::decode_status(&payload)?;
                    if status.status == Status::Closed && !self.show_closed {
                        continue;
                    }
                    return Ok(Some(LogRecord::Status(status)));
                }
                TAG_BANNER => {
                    if !self.banners {
                        continue;
                    }
                    return Ok(Some(LogRecord::Banner(Self::decode_banner(&payload)?)));
                }
                other => bail!(crate::errors::Error::BadScanLog {
                    reason: format!("unknown record tag {}", other),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_status(status: Status) -> ScanStatus {
        ScanStatus {
            ts_ns: 123,
            src_ip: "2001:db8::1".parse().unwrap(),
            proto: Protocol::Tcp,
            src_port: 1234,
            dst_port: 80,
            status,
        }
    }

    fn sample_banner() -> ScanBanner {
        ScanBanner {
            ts_ns: 456,
            src_ip: "2001:db8::2".parse().unwrap(),
            proto: Protocol::Tcp,
            port: 80,
            payload: b"HTTP/1.0 200 OK".to_vec(),
        }
    }

    #[test]
    fn round_trips_status_and_banner() {
        let mut buf = Vec::new();
        {
            let mut writer = BinaryWriter::new(&mut buf);
            writer.begin().unwrap();
            writer.output_status(&sample_status(Status::Open)).unwrap();
            writer.output_banner(&sample_banner()).unwrap();
            writer.end().unwrap();
        }

        let mut reader = BinaryReader::new(buf.as_slice());
        match reader.next_record().unwrap().unwrap() {
            LogRecord::Status(s) => assert_eq!(s, sample_status(Status::Open)),
            other => panic!("expected status, got {:?}", other),
        }
        match reader.next_record().unwrap().unwrap() {
            LogRecord::Banner(b) => assert_eq!(b, sample_banner()),
            other => panic!("expected banner, got {:?}", other),
        }
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn show_closed_false_drops_closed_records() {
        let mut buf = Vec::new();
        {
            let mut writer = BinaryWriter::new(&mut buf);
            writer.begin().unwrap();
            writer
                .output_status(&sample_status(Status::Closed))
                .unwrap();
            writer.output_status(&sample_status(Status::Open)).unwrap();
            writer.end().unwrap();
        }

        let mut reader = BinaryReader::new(buf.as_slice()).with_show_closed(false);
        match reader.next_record().unwrap().unwrap() {
            LogRecord::Status(s) => assert_eq!(s.status, Status::Open),
            other => panic!("expected status, got {:?}", other),
        }
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn banners_false_drops_banner_records() {
        let mut buf = Vec::new();
        {
            let mut writer = BinaryWriter::new(&mut buf);
            writer.begin().unwrap();
            writer.output_banner(&sample_banner()).unwrap();
            writer.output_status(&sample_status(Status::Open)).unwrap();
            writer.end().unwrap();
        }

        let mut reader = BinaryReader::new(buf.as_slice()).with_banners(false);
        match reader.next_record().unwrap().unwrap() {
            LogRecord::Status(s) => assert_eq!(s.status, Status::Open),
            other => panic!("expected status, got {:?}", other),
        }
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut reader = BinaryReader::new(&b"XXXX"[..]);
        assert!(reader.next_record().is_err());
    }

    #[test]
    fn round_trips_through_a_real_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        {
            let mut writer = BinaryWriter::new(file.reopen().unwrap());
            writer.begin().unwrap();
            writer.output_status(&sample_status(Status::Open)).unwrap();
            writer.end().unwrap();
        }

        let mut reader = BinaryReader::new(file.reopen().unwrap());
        match reader.next_record().unwrap().unwrap() {
            LogRecord::Status(s) => assert_eq!(s, sample_status(Status::Open)),
            other => panic!("expected status, got {:?}", other),
        }
        let _ = &mut file;
    }

    #[test]
    fn rejects_corrupted_crc() {
        let mut buf = Vec::new();
        {
            let mut writer = BinaryWriter::new(&mut buf);
            writer.begin().unwrap();
            writer.output_status(&sample_status(Status::Open)).unwrap();
        }
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        let mut reader = BinaryReader::new(buf.as_slice());
        assert!(reader.next_record().is_err());
    }
}
