use std::sync::atomic::{AtomicU64, Ordering};

/// Driver-wide counters. Cheap enough to bump on the hot path; scraping them
/// into a real metrics system is the embedder's business.
#[derive(Debug, Default)]
pub struct Metrics {
    pub requests: AtomicU64,
    pub errors: AtomicU64,
    pub retries: AtomicU64,
    pub timeouts: AtomicU64,
    pub speculative_started: AtomicU64,
    /// Executions that lost the race: their response arrived after another
    /// execution already completed the request.
    pub speculative_aborted: AtomicU64,
    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,
}

impl Metrics {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
