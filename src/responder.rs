//! TCP banner responder (spec.md §4.G).
//!
//! The scan itself is stateless; capturing a banner means completing the
//! handshake and reading a greeting through the *host kernel's* stack.
//! The receiver hands each SYN+ACK that matches the own-flow fingerprint
//! to a bounded worker pool, which dials out and writes a single banner
//! event of its own. This breaks the cyclic
//! receiver-calls-responder-writes-to-output reference spec.md §9 calls
//! out: the output sink stays the only shared resource, and it already
//! serializes its own writes internally. The worker pool itself is
//! `threadpool::ThreadPool` sized from `num_cpus::get()`, the same pair
//! of crates the teacher already depends on.

use std::net::Ipv6Addr;
use std::sync::{Arc, Mutex};

use threadpool::ThreadPool;

use crate::banner::{BannerDialer, BannerPostprocessor, BannerQueryProvider};
use crate::output::OutputSink;
use crate::{Protocol, ScanBanner};

/// Wait no longer than this for a banner response (spec.md §4.G step 2).
pub const BANNER_TIMEOUT_MS: u64 = 2500;
/// Cap on bytes read per banner (spec.md §4.F "UDP classification",
/// §4.G step 3).
pub const BANNER_MAX_LENGTH: usize = 4096;

/// One SYN+ACK the receiver matched to the own-flow fingerprint, handed
/// to the responder's worker pool.
#[derive(Debug, Clone)]
pub(crate) struct BannerCandidate {
    pub ts_ns: u64,
    pub src_ip: Ipv6Addr,
    /// The remote service's port (the TCP packet's source port).
    pub service_port: u16,
}

/// Owns the worker pool. `finish()` drains all in-flight connections
/// before the output footer is written (spec.md §4.G step 4).
pub(crate) struct BannerResponder {
    pool: ThreadPool,
    dialer: Arc<dyn BannerDialer>,
    query_provider: Arc<dyn BannerQueryProvider>,
    postprocessor: Arc<dyn BannerPostprocessor>,
    output: Arc<Mutex<dyn OutputSink>>,
}

impl BannerResponder {
    /// `workers == 0` means size from `num_cpus::get()`, matching how
    /// the teacher pulls in both crates together for automatic pool
    /// sizing.
    pub fn new(
        workers: usize,
        dialer: Arc<dyn BannerDialer>,
        query_provider: Arc<dyn BannerQueryProvider>,
        postprocessor: Arc<dyn BannerPostprocessor>,
        output: Arc<Mutex<dyn OutputSink>>,
    ) -> BannerResponder {
        let workers = if workers == 0 { num_cpus::get() } else { workers };
        BannerResponder {
            pool: ThreadPool::new(workers.max(1)),
            dialer,
            query_provider,
            postprocessor,
            output,
        }
    }

    /// Queue one candidate on the worker pool; never blocks the
    /// receiver thread on a slow target.
    pub fn submit(&self, candidate: BannerCandidate) {
        let dialer = Arc::clone(&self.dialer);
        let query_provider = Arc::clone(&self.query_provider);
        let postprocessor = Arc::clone(&self.postprocessor);
        let output = Arc::clone(&self.output);
        self.pool.execute(move || {
            handle_candidate(candidate, &*dialer, &*query_provider, &*postprocessor, &output);
        });
    }

    /// Blocks until every queued and in-flight dial has completed or
    /// timed out, then releases the reserved port (spec.md §4.G step 4).
    pub fn finish(&self) {
        self.pool.join();
        self.dialer.release();
    }
}

fn handle_candidate(
    candidate: BannerCandidate,
    dialer: &dyn BannerDialer,
    query_provider: &dyn BannerQueryProvider,
    postprocessor: &dyn BannerPostprocessor,
    output: &Arc<Mutex<dyn OutputSink>>,
) {
    let query = query_provider.query_for(Protocol::Tcp, candidate.service_port);
    let result = dialer.dial(
        candidate.src_ip,
        candidate.service_port,
        query,
        BANNER_MAX_LENGTH,
        BANNER_TIMEOUT_MS,
    );

    let data = match result {
        Ok(Some(data)) => data,
        Ok(None) => return,
        Err(e) => {
            log::debug!(
                "banner dial to [{}]:{} failed: {e}",
                candidate.src_ip,
                candidate.service_port
            );
            return;
        }
    };

    let mut sink = output.lock().unwrap();
    let raw = sink.raw();
    let mut payload = data;
    if !raw {
        postprocessor.process(Protocol::Tcp, candidate.service_port, &mut payload);
    }
    if let Err(e) = sink.output_banner(&ScanBanner {
        ts_ns: candidate.ts_ns,
        src_ip: candidate.src_ip,
        proto: Protocol::Tcp,
        port: candidate.service_port,
        payload,
    }) {
        log::warn!("failed to write banner event: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::banner::PassthroughPostprocessor;
    use crate::output::list::ListSink;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeDialer {
        calls: AtomicUsize,
        released: AtomicUsize,
    }

    impl BannerDialer for FakeDialer {
        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }

        fn dial(
            &self,
            _src_ip: Ipv6Addr,
            _src_port: u16,
            _query: Option<&[u8]>,
            _max_len: usize,
            _timeout_ms: u64,
        ) -> io::Result<Option<Vec<u8>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(b"hello".to_vec()))
        }
    }

    #[test]
    fn submitted_candidates_produce_banner_events() {
        let buf: Vec<u8> = Vec::new();
        let output: Arc<Mutex<dyn OutputSink>> = Arc::new(Mutex::new(ListSink::new(buf)));
        let dialer = Arc::new(FakeDialer {
            calls: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        });
        let responder = BannerResponder::new(
            1,
            dialer.clone(),
            Arc::new(PassthroughPostprocessor),
            Arc::new(PassthroughPostprocessor),
            Arc::clone(&output),
        );
        responder.submit(BannerCandidate {
            ts_ns: 1,
            src_ip: "2001:db8::1".parse().unwrap(),
            service_port: 80,
        });
        responder.finish();

        assert_eq!(dialer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dialer.released.load(Ordering::SeqCst), 1);
    }
}
