use std::io::BufRead;
use std::net::Ipv6Addr;

use anyhow::{bail, Result};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::errors::Error;
use crate::target::spec::TargetSpec;

/// Size of the address cache refilled round-robin across targets
/// (spec.md §3 "Address cache").
pub const TARGET_RANDOMIZE_SIZE: usize = 1024;
/// `2^TARGET_SANITY_MAX_BITS` addresses is the scan-size sanity gate
/// (spec.md §4.B "Sanity gate").
pub const TARGET_SANITY_MAX_BITS: u32 = 40;

/// Per-spec enumeration state (spec.md §3 "TargetState").
#[derive(Debug, Clone)]
struct TargetState {
    spec: TargetSpec,
    cur: [u8; 16],
    delayed_start: u64,
    done: bool,
}

impl TargetState {
    fn new(spec: TargetSpec) -> TargetState {
        TargetState {
            spec,
            cur: [0u8; 16],
            delayed_start: 0,
            done: false,
        }
    }

    /// Emit the next address and advance `cur` over the varying bits only
    /// (spec.md §4.B "Core invariant (enumeration)").
    fn next_addr(&mut self) -> [u8; 16] {
        let mut dst = [0u8; 16];
        for i in 0..16 {
            dst[i] = self.spec.addr[i] | self.cur[i];
        }

        let mut any = false;
        let mut carry = false;
        'outer: for i in (0..16).rev() {
            let mut bit = 1u8;
            while bit != 0 {
                if self.spec.mask[i] & bit != 0 {
                    bit <<= 1;
                    continue;
                }
                any = true;
                if self.cur[i] & bit != 0 {
                    self.cur[i] &= !bit;
                    carry = true;
                } else {
                    self.cur[i] |= bit;
                    carry = false;
                    break 'outer;
                }
                bit <<= 1;
            }
        }

        if !any || carry {
            self.done = true;
        }
        dst
    }

    /// `(total, done)` address counts over the varying-bit space, where
    /// `total` includes the address about to be emitted (spec.md §4.B
    /// "Progress").
    fn progress(&self) -> (u64, u64) {
        let mut total: u64 = 0;
        let mut done: u64 = 0;
        for i in 0..16 {
            let mut bit = 0x80u8;
            while bit != 0 {
                if self.spec.mask[i] & bit == 0 {
                    total <<= 1;
                    total |= 1;
                    done <<= 1;
                    done |= (self.cur[i] & bit != 0) as u64;
                }
                bit >>= 1;
            }
        }
        total += 1;
        if self.done {
            done = total;
        }
        (total, done)
    }

    /// `(total, overflowed)`: total address count, with overflow flagged
    /// when the varying space has `>= 64` bits (spec.md §8 invariant 3).
    fn count_total(&self) -> (u64, bool) {
        let varying_bits = (0..16)
            .flat_map(|i| (0..8).map(move |b| (i, b)))
            .filter(|&(i, b)| self.spec.mask[i] & (1 << b) == 0)
            .count() as u32;
        if varying_bits >= 64 {
            (0, true)
        } else {
            (1u64 << varying_bits, false)
        }
    }

    fn maskbits(&self) -> u32 {
        self.spec.mask.iter().map(|b| b.count_ones()).sum()
    }
}

enum Source {
    /// Eagerly-loaded target specs, round-robin enumerated.
    Specs(Vec<TargetState>),
    /// Streaming mode: one IPv6 literal per non-empty, non-`#` line.
    Stream(Box<dyn BufRead + Send>),
}

/// Enumerates a possibly-astronomical IPv6 address space across one or
/// more [`TargetSpec`]s without materializing it (spec.md §4.B).
pub struct AddressGenerator {
    source: Source,
    randomize: bool,
    cache: Vec<[u8; 16]>,
    cache_i: usize,
}

impl AddressGenerator {
    /// Build a generator over eagerly-enumerated target specs.
    ///
    /// Performs even-spread staggering (spec.md §4.B "Even spread across
    /// heterogeneous targets") and, if `randomize` is set, shuffles the
    /// target order itself.
    pub fn new(specs: Vec<TargetSpec>, randomize: bool) -> Result<AddressGenerator> {
        if specs.is_empty() {
            bail!(Error::BadConfig {
                reason: "no target specification(s) given".to_string(),
            });
        }
        let mut targets: Vec<TargetState> = specs.into_iter().map(TargetState::new).collect();

        let mut rng = rand::thread_rng();
        let max = targets
            .iter()
            .map(|t| t.count_total().0)
            .max()
            .unwrap_or(0);
        for t in targets.iter_mut() {
            let (total, overflowed) = t.count_total();
            if overflowed || total == max {
                continue;
            }
            let span = max - total;
            t.delayed_start = if span == 0 { 0 } else { rng.gen_range(0..=span) };
        }

        if randomize {
            targets.shuffle(&mut rng);
        }

        Ok(AddressGenerator {
            source: Source::Specs(targets),
            randomize,
            cache: Vec::with_capacity(TARGET_RANDOMIZE_SIZE),
            cache_i: 0,
        })
    }

    /// Build a generator that reads addresses lazily from a streaming
    /// source, one IPv6 literal per non-empty, non-`#`-comment line
    /// (spec.md §4.B "Streaming mode").
    pub fn new_streaming(reader: impl BufRead + Send + 'static) -> AddressGenerator {
        AddressGenerator {
            source: Source::Stream(Box::new(reader)),
            randomize: false,
            cache: Vec::with_capacity(TARGET_RANDOMIZE_SIZE),
            cache_i: 0,
        }
    }

    /// Before scanning starts: refuse combined target spaces `>=
    /// 2^TARGET_SANITY_MAX_BITS` (spec.md §4.B "Sanity gate"). A no-op in
    /// streaming mode, where the total is unknowable ahead of time.
    pub fn sanity_check(&self) -> Result<()> {
        let targets = match &self.source {
            Source::Specs(t) => t,
            Source::Stream(_) => return Ok(()),
        };
        let limit = 1u64 << TARGET_SANITY_MAX_BITS;
        let mut total: u64 = 0;
        let mut overflowed = false;
        for t in targets {
            let (one, of) = t.count_total();
            if of {
                overflowed = true;
                continue;
            }
            let (sum, carried) = total.overflowing_add(one);
            total = sum;
            overflowed |= carried;
        }
        if overflowed || total >= limit {
            bail!(Error::TooManyAddresses);
        }
        Ok(())
    }

    /// Pull the next address, refilling and (if enabled) shuffling the
    /// cache as needed. Returns `None` once every target is exhausted
    /// (streaming: once EOF is reached).
    pub fn next(&mut self) -> Option<[u8; 16]> {
        if self.cache_i == self.cache.len() {
            self.fill_cache();
            if self.cache.is_empty() {
                return None;
            }
            if self.randomize {
                let mut rng = rand::thread_rng();
                self.cache.shuffle(&mut rng);
            }
            self.cache_i = 0;
        }
        let addr = self.cache[self.cache_i];
        self.cache_i += 1;
        Some(addr)
    }

    fn fill_cache(&mut self) {
        self.cache.clear();
        match &mut self.source {
            Source::Stream(reader) => {
                let mut line = String::new();
                while self.cache.len() < TARGET_RANDOMIZE_SIZE {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    let trimmed = line.trim();
                    if trimmed.is_empty() || trimmed.starts_with('#') {
                        continue;
                    }
                    match trimmed.parse::<Ipv6Addr>() {
                        Ok(addr) => self.cache.push(addr.octets()),
                        Err(_) => {
                            log::error!("failed to parse target IP \"{trimmed}\"");
                            break;
                        }
                    }
                }
            }
            Source::Specs(targets) => loop {
                let mut any = false;
                for t in targets.iter_mut() {
                    if t.done {
                        continue;
                    }
                    if t.delayed_start > 0 {
                        t.delayed_start -= 1;
                        continue;
                    }
                    any = true;
                    self.cache.push(t.next_addr());
                    if self.cache.len() == TARGET_RANDOMIZE_SIZE {
                        return;
                    }
                }
                if !any {
                    return;
                }
            },
        }
    }

    /// Fraction of addresses sent so far, minus what's sitting unconsumed
    /// in the cache, so that progress tracks packets sent rather than
    /// addresses generated (spec.md §4.B "Progress"). `None` when total is
    /// zero or the generator is streaming.
    pub fn progress(&self) -> Option<f32> {
        let targets = match &self.source {
            Source::Specs(t) => t,
            Source::Stream(_) => return None,
        };
        let mut total: u64 = 0;
        let mut done: u64 = 0;
        for t in targets {
            let (tt, td) = t.progress();
            total += tt;
            done += td;
        }
        if total == 0 {
            return None;
        }
        let buffered = (self.cache.len() - self.cache_i) as u64;
        let done = done.saturating_sub(buffered);
        Some((done as f64 / total as f64) as f32)
    }

    /// Summarize target count, total addresses, subnet size spread, and
    /// estimated duration for the given rate/port count (spec.md §4.B
    /// "Summary").
    pub fn summary(&self, max_rate: Option<u32>, nports: u64) -> ScanSummary {
        let targets = match &self.source {
            Source::Specs(t) => t,
            Source::Stream(_) => {
                return ScanSummary {
                    target_count: 0,
                    streaming: true,
                    total: None,
                    largest_bits: 0,
                    smallest_bits: 0,
                    duration: None,
                }
            }
        };

        let mut total: u64 = 0;
        let mut overflowed = false;
        let mut largest = 128u32;
        let mut smallest = 0u32;
        for t in targets {
            let (one, of) = t.count_total();
            if of {
                overflowed = true;
            } else {
                let (sum, carried) = total.overflowing_add(one);
                total = sum;
                overflowed |= carried;
            }
            let bits = t.maskbits();
            largest = largest.min(bits);
            smallest = smallest.max(bits);
        }

        let duration = max_rate.map(|rate| {
            if overflowed || rate == 0 {
                return Duration::OverflowOrUnbounded;
            }
            match total.checked_mul(nports) {
                Some(packets) => {
                    let secs = packets / rate as u64;
                    if secs > u32::MAX as u64 {
                        Duration::OverflowOrUnbounded
                    } else {
                        Duration::Seconds(secs as u32)
                    }
                }
                None => Duration::OverflowOrUnbounded,
            }
        });

        ScanSummary {
            target_count: targets.len(),
            streaming: false,
            total: if overflowed { None } else { Some(total) },
            largest_bits: largest,
            smallest_bits: smallest,
            duration,
        }
    }
}

/// Estimated scan duration, formatted in the coarsest unit pair (spec.md
/// §4.B "Summary").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duration {
    Seconds(u32),
    OverflowOrUnbounded,
}

impl Duration {
    pub fn format(&self) -> String {
        let secs = match self {
            Duration::OverflowOrUnbounded => return "more than 100 years".to_string(),
            Duration::Seconds(s) => *s as u64,
        };
        let (n1, n2, f1, f2) = if secs > 7 * 24 * 60 * 60 {
            (secs / (7 * 24 * 60 * 60), secs % (7 * 24 * 60 * 60) / (24 * 60 * 60), "weeks", "days")
        } else if secs > 24 * 60 * 60 {
            (secs / (24 * 60 * 60), secs % (24 * 60 * 60) / (60 * 60), "days", "hours")
        } else if secs > 60 * 60 {
            (secs / (60 * 60), secs % (60 * 60) / 60, "hours", "minutes")
        } else {
            (secs / 60, secs % 60, "minutes", "seconds")
        };
        if n1 == 0 {
            format!("{n2} {f2}")
        } else if n2 == 0 {
            format!("{n1} {f1}")
        } else {
            format!("{n1} {f1} {n2} {f2}")
        }
    }
}

/// Human-readable summary of a planned scan (spec.md §4.B "Summary").
#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub target_count: usize,
    pub streaming: bool,
    /// `None` means "more than 2^64 addresses".
    pub total: Option<u64>,
    pub largest_bits: u32,
    pub smallest_bits: u32,
    pub duration: Option<Duration>,
}

impl ScanSummary {
    /// Renders the pre-scan confirmation table printed before a scan
    /// starts (spec.md §4.B "Summary").
    pub fn to_table(&self) -> String {
        let mut table = prettytable::Table::new();
        table.add_row(prettytable::row!["targets", self.target_count]);
        if self.streaming {
            table.add_row(prettytable::row!["addresses", "streaming (unbounded)"]);
        } else {
            let total = self.total.map(|t| t.to_string()).unwrap_or_else(|| "more than 2^64".to_string());
            table.add_row(prettytable::row!["addresses", total]);
            table.add_row(prettytable::row!["subnet size spread", format!("/{}..=/{}", self.largest_bits, self.smallest_bits)]);
        }
        let duration = self.duration.map(|d| d.format()).unwrap_or_else(|| "unbounded".to_string());
        table.add_row(prettytable::row!["estimated duration", duration]);
        table.to_string()
    }
}
