use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Produces client-side timestamps (microseconds since the epoch) attached to
/// mutations; `None` lets the server assign one.
#[auto_impl::auto_impl(Arc)]
pub trait TimestampGenerator: Send + Sync {
    fn next_timestamp(&self) -> Option<i64>;
}

/// Strictly monotonic wall-clock generator. If the clock stalls or steps
/// back, timestamps keep incrementing by one microsecond.
#[derive(Debug, Default)]
pub struct MonotonicTimestampGenerator {
    last: AtomicI64,
}

impl TimestampGenerator for MonotonicTimestampGenerator {
    fn next_timestamp(&self) -> Option<i64> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self.last.compare_exchange_weak(
                last,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(next),
                Err(observed) => last = observed,
            }
        }
    }
}

/// Never assigns a timestamp; the coordinator picks one.
#[derive(Debug, Default)]
pub struct ServerSideTimestampGenerator;

impl TimestampGenerator for ServerSideTimestampGenerator {
    fn next_timestamp(&self) -> Option<i64> {
        None
    }
}
