use std::io;
use std::net::Ipv6Addr;

use crate::Protocol;

/// The raw packet I/O transport this crate is driven by (spec.md §6
/// "Transport interface"). The concrete raw-socket/libpcap backend is out
/// of scope for this crate (spec.md §1 "Out of scope") — callers supply
/// one, and tests use [`crate::transport::loopback::LoopbackTransport`].
pub trait RawTransport: Send + Sync {
    /// Open the capture handle on `interface`, snapshotting up to
    /// `snaplen` bytes per frame (spec.md §4.D "open the raw transport
    /// with snap length 65535").
    fn open(&self, interface: &str, snaplen: usize) -> io::Result<()>;

    /// Install a capture filter matching `ip_type` and `dst_addr` (and
    /// `dst_port` when the source port is pinned), so the capture only
    /// sees replies addressed back to this scan (spec.md §4.D "install a
    /// capture filter"). `flags` are passed through to the underlying
    /// filter compiler and are otherwise opaque to this crate.
    fn set_filter(&self, flags: u32, ip_type: Protocol, dst_addr: Ipv6Addr, dst_port: Option<u16>) -> io::Result<()>;

    /// Transmit one fully-framed packet.
    fn send(&self, frame: &[u8]) -> io::Result<()>;

    /// Block, invoking `callback(timestamp_ns, frame)` for every captured
    /// frame, until [`RawTransport::break_loop`] is called from another
    /// thread. Returns once the loop has been broken.
    fn recv_loop(&self, callback: &mut dyn FnMut(u64, &[u8])) -> io::Result<()>;

    /// Unblock a concurrent [`RawTransport::recv_loop`] call.
    fn break_loop(&self);

    /// Release the capture handle opened by [`RawTransport::open`]
    /// (spec.md §4.D "close the transport").
    fn close(&self);

    /// Whether frames handed to `callback`/`send` include an Ethernet
    /// header. When false, the receiver synthesizes a zero-length one
    /// (spec.md §4.F step 2).
    fn has_ethernet_headers(&self) -> bool {
        true
    }
}

/// An in-memory [`RawTransport`] used by tests and by any embedder that
/// wants to drive the engine without a privileged raw socket: sent frames
/// are appended to an outbox, and frames queued with
/// [`LoopbackTransport::inject`] are delivered to the receiver.
pub mod loopback {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Condvar, Mutex};

    #[derive(Default)]
    pub struct LoopbackTransport {
        sent: Mutex<Vec<Vec<u8>>>,
        inbox: Mutex<Vec<(u64, Vec<u8>)>>,
        cond: Condvar,
        broken: AtomicBool,
        opened: Mutex<Option<(String, usize)>>,
        filter: Mutex<Option<(Protocol, Ipv6Addr, Option<u16>)>>,
        closed: AtomicBool,
    }

    impl LoopbackTransport {
        pub fn new() -> LoopbackTransport {
            LoopbackTransport::default()
        }

        pub fn sent_frames(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }

        /// Queue a frame (with its capture timestamp) for delivery to the
        /// next `recv_loop` call.
        pub fn inject(&self, ts_ns: u64, frame: Vec<u8>) {
            self.inbox.lock().unwrap().push((ts_ns, frame));
            self.cond.notify_all();
        }

        /// What `open` was last called with, if any.
        pub fn opened_with(&self) -> Option<(String, usize)> {
            self.opened.lock().unwrap().clone()
        }

        /// What `set_filter` was last called with, if any.
        pub fn filter_params(&self) -> Option<(Protocol, Ipv6Addr, Option<u16>)> {
            *self.filter.lock().unwrap()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }

    impl RawTransport for LoopbackTransport {
        fn open(&self, interface: &str, snaplen: usize) -> io::Result<()> {
            *self.opened.lock().unwrap() = Some((interface.to_string(), snaplen));
            Ok(())
        }

        fn set_filter(&self, _flags: u32, ip_type: Protocol, dst_addr: Ipv6Addr, dst_port: Option<u16>) -> io::Result<()> {
            *self.filter.lock().unwrap() = Some((ip_type, dst_addr, dst_port));
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }

        fn send(&self, frame: &[u8]) -> io::Result<()> {
            self.sent.lock().unwrap().push(frame.to_vec());
            Ok(())
        }

        fn recv_loop(&self, callback: &mut dyn FnMut(u64, &[u8])) -> io::Result<()> {
            loop {
                let mut inbox = self.inbox.lock().unwrap();
                while inbox.is_empty() && !self.broken.load(Ordering::Acquire) {
                    inbox = self.cond.wait(inbox).unwrap();
                }
                if self.broken.load(Ordering::Acquire) && inbox.is_empty() {
                    return Ok(());
                }
                let batch: Vec<_> = inbox.drain(..).collect();
                drop(inbox);
                for (ts, frame) in batch {
                    callback(ts, &frame);
                }
            }
        }

        fn break_loop(&self) {
            self.broken.store(true, Ordering::Release);
            self.cond.notify_all();
        }

        fn has_ethernet_headers(&self) -> bool {
            true
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn open_set_filter_and_close_are_recorded() {
            let t = LoopbackTransport::new();
            t.open("eth0", 65535).unwrap();
            let dst: Ipv6Addr = "2001:db8::1".parse().unwrap();
            t.set_filter(0, Protocol::Tcp, dst, Some(12345)).unwrap();
            assert_eq!(t.opened_with(), Some(("eth0".to_string(), 65535)));
            assert_eq!(t.filter_params(), Some((Protocol::Tcp, dst, Some(12345))));
            assert!(!t.is_closed());
            t.close();
            assert!(t.is_closed());
        }
    }
}
