//! Per-protocol packet senders (spec.md §4.E).
//!
//! Shares one rate-control skeleton and ephemeral-port helper; the
//! per-protocol frame shape lives in `tcp`/`udp`/`icmp`.

pub(crate) mod icmp;
pub(crate) mod tcp;
pub(crate) mod udp;

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::engine::Counters;

/// OR'd into a random ephemeral source port so it lands at `>= 16384`
/// (spec.md §4.E "Random ephemeral source port").
const EPHEMERAL_PORT_BIT: u16 = 0x4000;

pub(crate) fn ephemeral_port(pinned: Option<u16>) -> u16 {
    match pinned {
        Some(p) => p,
        None => {
            let v: u16 = rand::thread_rng().gen();
            v | EPHEMERAL_PORT_BIT
        }
    }
}

/// Increment `pkts_sent`; if the post-increment value has reached
/// `max_rate`, sleep in 1ms steps until the stats loop resets it back to
/// zero (spec.md §4.E "Rate control"). `max_rate == None` means
/// unlimited.
pub(crate) fn record_sent(counters: &Counters, max_rate: Option<u32>) {
    let sent = counters.pkts_sent.fetch_add(1, Ordering::AcqRel) + 1;
    if let Some(rate) = max_rate {
        if rate > 0 {
            while counters.pkts_sent.load(Ordering::Acquire) >= rate as u64 {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
    let _ = sent;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_port_is_high_when_random() {
        for _ in 0..50 {
            let p = ephemeral_port(None);
            assert!(p >= 16384);
        }
    }

    #[test]
    fn ephemeral_port_passes_through_pinned() {
        assert_eq!(ephemeral_port(Some(1234)), 1234);
    }
}
