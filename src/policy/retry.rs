//! Retry policies: what to do with a server error before giving up.
//!
//! A policy only decides; the request handler executes the decision and
//! enforces the per-request retry counter passed back in via [`RetryInfo`].

use crate::constant::{Consistency, ErrorCode, WriteType};
use crate::protocol::response::ErrorResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry on the same host, optionally at a new consistency.
    RetrySameHost(Option<Consistency>),
    /// Retry on the next host of the query plan.
    RetryNextHost(Option<Consistency>),
    /// Surface the server error to the caller.
    ReturnError,
    /// Swallow the error and report an empty result.
    Ignore,
}

impl RetryDecision {
    pub const fn is_retry(self) -> bool {
        matches!(self, Self::RetrySameHost(_) | Self::RetryNextHost(_))
    }
}

/// Request context a policy may base its decision on.
#[derive(Debug, Clone, Copy)]
pub struct RetryInfo {
    pub consistency: Consistency,
    /// Retries already performed for this request (0 on the first error).
    pub retry_count: u32,
    pub is_idempotent: bool,
}

#[auto_impl::auto_impl(Arc)]
pub trait RetryPolicy: Send + Sync {
    fn on_read_timeout(
        &self,
        info: &RetryInfo,
        received: i32,
        block_for: i32,
        data_present: bool,
    ) -> RetryDecision;

    fn on_write_timeout(
        &self,
        info: &RetryInfo,
        received: i32,
        block_for: i32,
        write_type: WriteType,
    ) -> RetryDecision;

    fn on_unavailable(&self, info: &RetryInfo, required: i32, alive: i32) -> RetryDecision;

    /// Overloaded, truncate and server errors.
    fn on_request_error(&self, info: &RetryInfo, error: &ErrorResponse) -> RetryDecision;
}

/// The stock policy:
/// - read timeout / unavailable: one retry on the next host, same consistency
/// - write timeout: one retry, idempotent requests with a retriable write
///   type only
/// - request error: one retry on the next host, idempotent requests only
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn on_read_timeout(
        &self,
        info: &RetryInfo,
        _received: i32,
        _block_for: i32,
        _data_present: bool,
    ) -> RetryDecision {
        if info.retry_count == 0 {
            RetryDecision::RetryNextHost(None)
        } else {
            RetryDecision::ReturnError
        }
    }

    fn on_write_timeout(
        &self,
        info: &RetryInfo,
        _received: i32,
        _block_for: i32,
        write_type: WriteType,
    ) -> RetryDecision {
        if info.retry_count == 0 && info.is_idempotent && write_type.is_retriable() {
            RetryDecision::RetryNextHost(None)
        } else {
            RetryDecision::ReturnError
        }
    }

    fn on_unavailable(&self, info: &RetryInfo, _required: i32, _alive: i32) -> RetryDecision {
        if info.retry_count == 0 {
            RetryDecision::RetryNextHost(None)
        } else {
            RetryDecision::ReturnError
        }
    }

    fn on_request_error(&self, info: &RetryInfo, _error: &ErrorResponse) -> RetryDecision {
        if info.retry_count == 0 && info.is_idempotent {
            RetryDecision::RetryNextHost(None)
        } else {
            RetryDecision::ReturnError
        }
    }
}

/// Never retries, never ignores.
#[derive(Debug, Default, Clone, Copy)]
pub struct FallthroughRetryPolicy;

impl RetryPolicy for FallthroughRetryPolicy {
    fn on_read_timeout(&self, _: &RetryInfo, _: i32, _: i32, _: bool) -> RetryDecision {
        RetryDecision::ReturnError
    }

    fn on_write_timeout(&self, _: &RetryInfo, _: i32, _: i32, _: WriteType) -> RetryDecision {
        RetryDecision::ReturnError
    }

    fn on_unavailable(&self, _: &RetryInfo, _: i32, _: i32) -> RetryDecision {
        RetryDecision::ReturnError
    }

    fn on_request_error(&self, _: &RetryInfo, _: &ErrorResponse) -> RetryDecision {
        RetryDecision::ReturnError
    }
}

/// Highest consistency `count` live/acked replicas can still satisfy.
fn max_likely_to_work(count: i32) -> Option<Consistency> {
    match count {
        c if c >= 3 => Some(Consistency::Three),
        2 => Some(Consistency::Two),
        1 => Some(Consistency::One),
        _ => None,
    }
}

/// Trades consistency for availability: on timeouts/unavailability, retries
/// at the highest consistency the responding replicas can still satisfy.
#[derive(Debug, Default, Clone, Copy)]
pub struct DowngradingConsistencyRetryPolicy;

impl RetryPolicy for DowngradingConsistencyRetryPolicy {
    fn on_read_timeout(
        &self,
        info: &RetryInfo,
        received: i32,
        block_for: i32,
        data_present: bool,
    ) -> RetryDecision {
        if info.retry_count > 0 {
            return RetryDecision::ReturnError;
        }
        if received < block_for {
            match max_likely_to_work(received) {
                Some(cl) => RetryDecision::RetrySameHost(Some(cl)),
                None => RetryDecision::ReturnError,
            }
        } else if !data_present {
            // Enough replicas answered but none carried data: a plain retry
            // is likely to succeed.
            RetryDecision::RetrySameHost(None)
        } else {
            RetryDecision::ReturnError
        }
    }

    fn on_write_timeout(
        &self,
        info: &RetryInfo,
        received: i32,
        _block_for: i32,
        write_type: WriteType,
    ) -> RetryDecision {
        if info.retry_count > 0 {
            return RetryDecision::ReturnError;
        }
        match write_type {
            WriteType::Simple | WriteType::Batch => {
                // The write reached at least one replica; it will be
                // eventually consistent.
                if received > 0 {
                    RetryDecision::Ignore
                } else {
                    RetryDecision::ReturnError
                }
            }
            WriteType::UnloggedBatch => match max_likely_to_work(received) {
                Some(cl) => RetryDecision::RetrySameHost(Some(cl)),
                None => RetryDecision::ReturnError,
            },
            WriteType::BatchLog => RetryDecision::RetrySameHost(None),
            _ => RetryDecision::ReturnError,
        }
    }

    fn on_unavailable(&self, info: &RetryInfo, _required: i32, alive: i32) -> RetryDecision {
        if info.retry_count > 0 {
            return RetryDecision::ReturnError;
        }
        match max_likely_to_work(alive) {
            Some(cl) => RetryDecision::RetrySameHost(Some(cl)),
            None => RetryDecision::ReturnError,
        }
    }

    fn on_request_error(&self, info: &RetryInfo, _error: &ErrorResponse) -> RetryDecision {
        if info.retry_count == 0 && info.is_idempotent {
            RetryDecision::RetryNextHost(None)
        } else {
            RetryDecision::ReturnError
        }
    }
}

/// Pass-through wrapper that logs every decision other than `ReturnError`.
pub struct LoggingRetryPolicy<P> {
    inner: P,
}

impl<P> LoggingRetryPolicy<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }

    fn log(decision: RetryDecision, kind: &str, info: &RetryInfo) -> RetryDecision {
        if decision != RetryDecision::ReturnError {
            tracing::info!(
                ?decision,
                error = kind,
                consistency = ?info.consistency,
                retry_count = info.retry_count,
                "retry policy decision"
            );
        }
        decision
    }
}

impl<P: RetryPolicy> RetryPolicy for LoggingRetryPolicy<P> {
    fn on_read_timeout(
        &self,
        info: &RetryInfo,
        received: i32,
        block_for: i32,
        data_present: bool,
    ) -> RetryDecision {
        Self::log(
            self.inner.on_read_timeout(info, received, block_for, data_present),
            "read timeout",
            info,
        )
    }

    fn on_write_timeout(
        &self,
        info: &RetryInfo,
        received: i32,
        block_for: i32,
        write_type: WriteType,
    ) -> RetryDecision {
        Self::log(
            self.inner.on_write_timeout(info, received, block_for, write_type),
            "write timeout",
            info,
        )
    }

    fn on_unavailable(&self, info: &RetryInfo, required: i32, alive: i32) -> RetryDecision {
        Self::log(
            self.inner.on_unavailable(info, required, alive),
            "unavailable",
            info,
        )
    }

    fn on_request_error(&self, info: &RetryInfo, error: &ErrorResponse) -> RetryDecision {
        let kind = match error.code {
            ErrorCode::Overloaded => "overloaded",
            ErrorCode::TruncateError => "truncate error",
            _ => "server error",
        };
        Self::log(self.inner.on_request_error(info, error), kind, info)
    }
}
